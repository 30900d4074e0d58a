//! SOCKS4 / SOCKS4a / SOCKS5 / SOCKS5h client handshakes.
//!
//! The handshake runs over an already-connected stream to the proxy and
//! leaves that stream positioned at the start of the tunnelled byte stream,
//! so the caller can layer TLS or plaintext HTTP framing on top of it.

use std::net::{IpAddr, Ipv4Addr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::proxy::{ProxyCredentials, ProxyScheme};

const SOCKS4_VERSION: u8 = 0x04;
const SOCKS5_VERSION: u8 = 0x05;
const CMD_CONNECT: u8 = 0x01;
const SOCKS4_GRANTED: u8 = 0x5a;
const SOCKS5_SUCCEEDED: u8 = 0x00;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_NONE_ACCEPTABLE: u8 = 0xff;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Failures of a SOCKS negotiation.
#[derive(Debug, thiserror::Error)]
pub enum SocksError {
    /// Reading or writing the proxy socket failed mid-handshake.
    #[error("I/O error during SOCKS handshake")]
    Io(#[from] std::io::Error),

    /// The proxy answered with bytes that are not a valid reply.
    #[error("invalid SOCKS reply: {0}")]
    InvalidReply(&'static str),

    /// The proxy refused the CONNECT command.
    #[error("SOCKS proxy rejected the connection: {}", reply_message(*.version, *.code))]
    Rejected {
        /// Protocol version of the reply (4 or 5).
        version: u8,
        /// Reply code sent by the proxy.
        code: u8,
    },

    /// Username/password sub-negotiation was refused.
    #[error("SOCKS5 authentication failed")]
    AuthFailed,

    /// The proxy accepts none of the offered authentication methods.
    #[error("SOCKS5 proxy accepts none of the offered authentication methods")]
    NoAcceptableAuth,

    /// Username or password exceed 255 bytes.
    #[error("SOCKS credentials longer than 255 bytes")]
    CredentialsTooLong,

    /// SOCKS4 can only address IPv4 destinations.
    #[error("SOCKS4 cannot reach IPv6 address {0}")]
    Socks4Ipv6Unsupported(IpAddr),

    /// The destination hostname exceeds 255 bytes.
    #[error("destination hostname longer than 255 bytes")]
    HostnameTooLong,

    /// Local resolution of the destination produced no usable address.
    #[error("could not resolve {host}")]
    Resolve {
        /// The destination hostname.
        host: String,
        /// The resolver failure.
        #[source]
        source: std::io::Error,
    },
}

fn reply_message(version: u8, code: u8) -> String {
    let text = if version == SOCKS4_VERSION {
        match code {
            0x5b => "request rejected or failed",
            0x5c => "identd unreachable",
            0x5d => "identd user mismatch",
            _ => "unknown error",
        }
    } else {
        match code {
            0x01 => "general SOCKS server failure",
            0x02 => "connection not allowed by ruleset",
            0x03 => "network unreachable",
            0x04 => "host unreachable",
            0x05 => "connection refused",
            0x06 => "TTL expired",
            0x07 => "command not supported",
            0x08 => "address type not supported",
            _ => "unknown error",
        }
    };
    format!("{text} (code {code:#04x})")
}

/// Destination of a SOCKS CONNECT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// An address already resolved on this side.
    Ip(IpAddr),
    /// A hostname the proxy resolves.
    Domain(String),
}

/// Chooses how the destination is sent: literal IPs stay IPs, hostnames are
/// resolved here unless the proxy kind resolves remotely.
///
/// # Errors
///
/// Returns [`SocksError::Resolve`] when local resolution yields no address
/// usable with the proxy version.
pub async fn destination_for(scheme: ProxyScheme, host: &str, port: u16) -> Result<Destination, SocksError> {
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        return Ok(Destination::Ip(ip));
    }
    if scheme.remote_dns() {
        return Ok(Destination::Domain(bare.to_string()));
    }
    let ipv4_only = matches!(scheme, ProxyScheme::Socks4);
    let resolved = tokio::net::lookup_host((bare, port))
        .await
        .map_err(|source| SocksError::Resolve {
            host: bare.to_string(),
            source,
        })?
        .map(|addr| addr.ip())
        .find(|ip| !ipv4_only || ip.is_ipv4());
    resolved.map(Destination::Ip).ok_or_else(|| SocksError::Resolve {
        host: bare.to_string(),
        source: std::io::Error::new(std::io::ErrorKind::NotFound, "no IPv4 address for SOCKS4"),
    })
}

/// Runs the handshake for `scheme` on `stream`.
///
/// # Errors
///
/// Returns [`SocksError`] when the proxy refuses the request or speaks an
/// unexpected protocol.
pub async fn handshake<S>(
    stream: &mut S,
    scheme: ProxyScheme,
    destination: &Destination,
    port: u16,
    credentials: Option<&ProxyCredentials>,
) -> Result<(), SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match scheme {
        ProxyScheme::Socks4 | ProxyScheme::Socks4a => {
            socks4_connect(stream, destination, port, credentials).await
        }
        ProxyScheme::Socks5 | ProxyScheme::Socks5h => {
            socks5_connect(stream, destination, port, credentials).await
        }
        ProxyScheme::Http | ProxyScheme::Https => Err(SocksError::InvalidReply("not a SOCKS proxy")),
    }
}

async fn socks4_connect<S>(
    stream: &mut S,
    destination: &Destination,
    port: u16,
    credentials: Option<&ProxyCredentials>,
) -> Result<(), SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let user_id = credentials.map_or("", |c| c.username.as_str());
    let mut request = vec![SOCKS4_VERSION, CMD_CONNECT];
    request.extend_from_slice(&port.to_be_bytes());

    match destination {
        Destination::Ip(IpAddr::V4(ip)) => {
            request.extend_from_slice(&ip.octets());
            request.extend_from_slice(user_id.as_bytes());
            request.push(0);
        }
        Destination::Ip(ip @ IpAddr::V6(_)) => return Err(SocksError::Socks4Ipv6Unsupported(*ip)),
        Destination::Domain(host) => {
            // 0.0.0.x with x != 0 tells a 4a proxy that a hostname follows.
            request.extend_from_slice(&Ipv4Addr::new(0, 0, 0, 1).octets());
            request.extend_from_slice(user_id.as_bytes());
            request.push(0);
            request.extend_from_slice(host.as_bytes());
            request.push(0);
        }
    }
    stream.write_all(&request).await?;
    stream.flush().await?;

    let mut reply = [0u8; 8];
    stream.read_exact(&mut reply).await?;
    if reply[0] != 0x00 {
        return Err(SocksError::InvalidReply("SOCKS4 reply version is not 0"));
    }
    if reply[1] != SOCKS4_GRANTED {
        return Err(SocksError::Rejected {
            version: SOCKS4_VERSION,
            code: reply[1],
        });
    }
    Ok(())
}

async fn socks5_connect<S>(
    stream: &mut S,
    destination: &Destination,
    port: u16,
    credentials: Option<&ProxyCredentials>,
) -> Result<(), SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if credentials.is_some() {
        stream
            .write_all(&[SOCKS5_VERSION, 0x02, METHOD_NO_AUTH, METHOD_USER_PASS])
            .await?;
    } else {
        stream.write_all(&[SOCKS5_VERSION, 0x01, METHOD_NO_AUTH]).await?;
    }
    stream.flush().await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != SOCKS5_VERSION {
        return Err(SocksError::InvalidReply("SOCKS5 greeting version mismatch"));
    }
    match (choice[1], credentials) {
        (METHOD_NO_AUTH, _) => {}
        (METHOD_USER_PASS, Some(credentials)) => socks5_authenticate(stream, credentials).await?,
        (METHOD_NONE_ACCEPTABLE | METHOD_USER_PASS, _) => return Err(SocksError::NoAcceptableAuth),
        _ => return Err(SocksError::InvalidReply("SOCKS5 proxy chose an unoffered method")),
    }

    let mut request = vec![SOCKS5_VERSION, CMD_CONNECT, 0x00];
    match destination {
        Destination::Ip(IpAddr::V4(ip)) => {
            request.push(ATYP_IPV4);
            request.extend_from_slice(&ip.octets());
        }
        Destination::Ip(IpAddr::V6(ip)) => {
            request.push(ATYP_IPV6);
            request.extend_from_slice(&ip.octets());
        }
        Destination::Domain(host) => {
            let len = u8::try_from(host.len()).map_err(|_| SocksError::HostnameTooLong)?;
            request.push(ATYP_DOMAIN);
            request.push(len);
            request.extend_from_slice(host.as_bytes());
        }
    }
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;
    stream.flush().await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS5_VERSION {
        return Err(SocksError::InvalidReply("SOCKS5 reply version mismatch"));
    }
    if head[1] != SOCKS5_SUCCEEDED {
        return Err(SocksError::Rejected {
            version: SOCKS5_VERSION,
            code: head[1],
        });
    }

    // Bound address is not used; consume it so the tunnel starts clean.
    let skip = match head[3] {
        ATYP_IPV4 => 4 + 2,
        ATYP_IPV6 => 16 + 2,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            usize::from(len[0]) + 2
        }
        _ => return Err(SocksError::InvalidReply("unknown SOCKS5 address type")),
    };
    let mut bound = vec![0u8; skip];
    stream.read_exact(&mut bound).await?;
    Ok(())
}

async fn socks5_authenticate<S>(stream: &mut S, credentials: &ProxyCredentials) -> Result<(), SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let user = credentials.username.as_bytes();
    let pass = credentials.password().as_bytes();
    let user_len = u8::try_from(user.len()).map_err(|_| SocksError::CredentialsTooLong)?;
    let pass_len = u8::try_from(pass.len()).map_err(|_| SocksError::CredentialsTooLong)?;

    let mut packet = vec![0x01, user_len];
    packet.extend_from_slice(user);
    packet.push(pass_len);
    packet.extend_from_slice(pass);
    stream.write_all(&packet).await?;
    stream.flush().await?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply[1] != 0x00 {
        return Err(SocksError::AuthFailed);
    }
    Ok(())
}
