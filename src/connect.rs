//! Connection establishment.
//!
//! A pool owns exactly one [`Connect`] implementation, chosen when the pool is
//! created from its proxy classification: [`DirectConnector`],
//! [`HttpProxyConnector`] or [`SocksConnector`]. Each yields a byte stream that
//! already reaches the origin (or, for absolute-form HTTP proxying, the proxy);
//! TLS to the origin is layered on afterwards by the pool.

use std::io;
use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use http::HeaderValue;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio_rustls::TlsConnector;
use tracing::debug;
use url::Url;

use crate::proxy::{ProxyCredentials, ProxyDescriptor, ProxyScheme};
use crate::socks;
use crate::tls::{self, BoxedIo};
use crate::translate::Fault;

const MAX_CONNECT_RESPONSE_BYTES: usize = 8 * 1024;

/// Destination of a pooled connection: scheme, host and port of the origin.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    https: bool,
    host: String,
    port: u16,
}

impl Endpoint {
    /// Derives the endpoint of an `http`/`https` URL.
    #[must_use]
    pub fn from_url(url: &Url) -> Option<Self> {
        let https = match url.scheme() {
            "https" => true,
            "http" => false,
            _ => return None,
        };
        let host = url
            .host_str()?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_ascii_lowercase();
        let port = url.port_or_known_default()?;
        Some(Self { https, host, port })
    }

    /// Returns `true` for TLS endpoints.
    #[must_use]
    pub fn is_https(&self) -> bool {
        self.https
    }

    /// Hostname or IP literal (without brackets).
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port` as written in a `CONNECT` line or `Host` header.
    #[must_use]
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// An established stream plus the address of the socket's remote end.
pub(crate) struct Connected {
    pub(crate) io: BoxedIo,
    pub(crate) peer_addr: Option<SocketAddr>,
}

/// One way of opening a stream to an endpoint.
#[async_trait]
pub(crate) trait Connect: Send + Sync {
    /// Opens a stream that carries HTTP for `endpoint`, before origin TLS.
    async fn connect(&self, endpoint: &Endpoint) -> Result<Connected, Fault>;

    /// Whether requests for `endpoint` use absolute-form targets
    /// (plain HTTP through an HTTP proxy).
    fn absolute_form(&self, _endpoint: &Endpoint) -> bool {
        false
    }

    /// `Proxy-Authorization` value sent on absolute-form requests.
    fn proxy_authorization(&self) -> Option<HeaderValue> {
        None
    }
}

/// Opens TCP to `host:port`, optionally binding a local source address.
///
/// Addresses of the wrong family for the source address are skipped.
pub(crate) async fn tcp_connect(host: &str, port: u16, source_address: Option<IpAddr>) -> io::Result<TcpStream> {
    let mut last_error = None;
    let addrs = tokio::net::lookup_host((host, port)).await?;
    for addr in addrs {
        if let Some(source) = source_address
            && source.is_ipv4() != addr.is_ipv4()
        {
            continue;
        }
        match connect_addr(addr, source_address).await {
            Ok(stream) => return Ok(stream),
            Err(error) => {
                debug!(%addr, error = %error, "TCP connect attempt failed");
                last_error = Some(error);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no usable address for {host}:{port}"),
        )
    }))
}

async fn connect_addr(addr: SocketAddr, source_address: Option<IpAddr>) -> io::Result<TcpStream> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    if let Some(source) = source_address {
        socket.bind(SocketAddr::new(source, 0))?;
    }
    let stream = socket.connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

async fn open_tcp(host: &str, port: u16, source_address: Option<IpAddr>) -> io::Result<Connected> {
    let stream = tcp_connect(host, port, source_address).await?;
    let peer_addr = stream.peer_addr().ok();
    Ok(Connected {
        io: Box::new(stream),
        peer_addr,
    })
}

/// `Basic` credentials for an HTTP proxy.
pub(crate) fn basic_authorization(credentials: &ProxyCredentials) -> Option<HeaderValue> {
    let token = BASE64.encode(format!("{}:{}", credentials.username, credentials.password()));
    let mut value = HeaderValue::from_str(&format!("Basic {token}")).ok()?;
    value.set_sensitive(true);
    Some(value)
}

/// Plain TCP to the origin.
#[derive(Debug)]
pub(crate) struct DirectConnector {
    source_address: Option<IpAddr>,
}

impl DirectConnector {
    pub(crate) fn new(source_address: Option<IpAddr>) -> Self {
        Self { source_address }
    }
}

#[async_trait]
impl Connect for DirectConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Connected, Fault> {
        open_tcp(endpoint.host(), endpoint.port(), self.source_address)
            .await
            .map_err(Fault::Connect)
    }
}

/// HTTP(S) proxy: absolute-form for `http://` targets, `CONNECT` otherwise.
pub(crate) struct HttpProxyConnector {
    proxy: ProxyDescriptor,
    tls: TlsConnector,
    source_address: Option<IpAddr>,
    authorization: Option<HeaderValue>,
}

impl HttpProxyConnector {
    pub(crate) fn new(proxy: ProxyDescriptor, tls: TlsConnector, source_address: Option<IpAddr>) -> Self {
        let authorization = proxy.credentials().and_then(basic_authorization);
        Self {
            proxy,
            tls,
            source_address,
            authorization,
        }
    }

    async fn open_proxy(&self) -> Result<Connected, Fault> {
        let mut connected = open_tcp(self.proxy.host(), self.proxy.port(), self.source_address)
            .await
            .map_err(Fault::ProxyConnect)?;
        if self.proxy.scheme() == ProxyScheme::Https {
            connected.io = tls::wrap(&self.tls, self.proxy.host(), connected.io)
                .await
                .map_err(Fault::ProxyConnect)?;
        }
        Ok(connected)
    }

    async fn tunnel(&self, io: &mut BoxedIo, endpoint: &Endpoint) -> Result<(), Fault> {
        let authority = endpoint.authority();
        let mut head = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
        if let Some(value) = self.authorization.as_ref().and_then(|v| v.to_str().ok()) {
            head.push_str("Proxy-Authorization: ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        head.push_str("\r\n");
        io.write_all(head.as_bytes()).await.map_err(Fault::ProxyConnect)?;
        io.flush().await.map_err(Fault::ProxyConnect)?;

        let status = read_connect_status(io).await?;
        if (200..300).contains(&status) {
            debug!(proxy = %self.proxy, target = %authority, "CONNECT tunnel established");
            Ok(())
        } else {
            Err(Fault::ProxyRejected { status })
        }
    }
}

/// Reads the proxy's reply head byte by byte so no tunnelled data is consumed.
async fn read_connect_status(io: &mut BoxedIo) -> Result<u16, Fault> {
    let mut buf = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        if buf.len() >= MAX_CONNECT_RESPONSE_BYTES {
            return Err(Fault::ProxyConnect(io::Error::new(
                io::ErrorKind::InvalidData,
                "proxy CONNECT response head too large",
            )));
        }
        let n = io.read(&mut byte).await.map_err(Fault::ProxyConnect)?;
        if n == 0 {
            return Err(Fault::ProxyConnect(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "unexpected eof while tunneling",
            )));
        }
        buf.push(byte[0]);
    }
    parse_status_line(&buf).ok_or_else(|| {
        Fault::ProxyConnect(io::Error::new(
            io::ErrorKind::InvalidData,
            "malformed proxy CONNECT response",
        ))
    })
}

fn parse_status_line(head: &[u8]) -> Option<u16> {
    let line_end = head.iter().position(|&b| b == b'\r')?;
    let line = std::str::from_utf8(&head[..line_end]).ok()?;
    let mut parts = line.split_whitespace();
    let version = parts.next()?;
    if !version.starts_with("HTTP/1.") {
        return None;
    }
    parts.next()?.parse().ok()
}

#[async_trait]
impl Connect for HttpProxyConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Connected, Fault> {
        let mut connected = self.open_proxy().await?;
        if endpoint.is_https() {
            self.tunnel(&mut connected.io, endpoint).await?;
        }
        Ok(connected)
    }

    fn absolute_form(&self, endpoint: &Endpoint) -> bool {
        !endpoint.is_https()
    }

    fn proxy_authorization(&self) -> Option<HeaderValue> {
        self.authorization.clone()
    }
}

/// SOCKS tunnel: TCP to the proxy, then the SOCKS handshake for the origin.
pub(crate) struct SocksConnector {
    proxy: ProxyDescriptor,
    source_address: Option<IpAddr>,
}

impl SocksConnector {
    pub(crate) fn new(proxy: ProxyDescriptor, source_address: Option<IpAddr>) -> Self {
        Self { proxy, source_address }
    }
}

#[async_trait]
impl Connect for SocksConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Connected, Fault> {
        let mut connected = open_tcp(self.proxy.host(), self.proxy.port(), self.source_address)
            .await
            .map_err(Fault::Connect)?;
        let destination = socks::destination_for(self.proxy.scheme(), endpoint.host(), endpoint.port())
            .await
            .map_err(Fault::Socks)?;
        socks::handshake(
            &mut connected.io,
            self.proxy.scheme(),
            &destination,
            endpoint.port(),
            self.proxy.credentials(),
        )
        .await
        .map_err(Fault::Socks)?;
        debug!(proxy = %self.proxy, target = %endpoint.authority(), "SOCKS tunnel established");
        Ok(connected)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_from_url() {
        let endpoint = Endpoint::from_url(&Url::parse("https://Example.COM/path").unwrap()).unwrap();
        assert!(endpoint.is_https());
        assert_eq!(endpoint.host(), "example.com");
        assert_eq!(endpoint.port(), 443);
        assert_eq!(endpoint.authority(), "example.com:443");

        let endpoint = Endpoint::from_url(&Url::parse("http://[::1]:8080/").unwrap()).unwrap();
        assert_eq!(endpoint.host(), "::1");
        assert_eq!(endpoint.authority(), "[::1]:8080");

        assert!(Endpoint::from_url(&Url::parse("ftp://example.com/").unwrap()).is_none());
    }

    #[test]
    fn test_parse_status_line() {
        assert_eq!(parse_status_line(b"HTTP/1.1 200 Connection established\r\n\r\n"), Some(200));
        assert_eq!(parse_status_line(b"HTTP/1.0 407 Proxy Auth Required\r\n\r\n"), Some(407));
        assert_eq!(parse_status_line(b"SSH-2.0-OpenSSH\r\n\r\n"), None);
    }

    #[test]
    fn test_basic_authorization_is_sensitive() {
        let creds = ProxyCredentials::new("user".to_string(), "pass".to_string());
        let value = basic_authorization(&creds).unwrap();
        assert_eq!(value.to_str().unwrap(), "Basic dXNlcjpwYXNz");
        assert!(value.is_sensitive());
    }

    #[tokio::test]
    async fn test_connect_tunnel_rejected_status() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let n = sock.read(&mut buf).await.unwrap();
            assert!(buf[..n].starts_with(b"CONNECT example.com:443 HTTP/1.1\r\n"));
            sock.write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await
                .unwrap();
        });

        let proxy = ProxyDescriptor::parse(&format!("http://{addr}")).unwrap();
        let tls = TlsConnector::from(tls::build_client_config(true).unwrap());
        let connector = HttpProxyConnector::new(proxy, tls, None);
        let endpoint = Endpoint::from_url(&Url::parse("https://example.com/").unwrap()).unwrap();
        let result = connector.connect(&endpoint).await;
        assert!(matches!(result, Err(Fault::ProxyRejected { status: 407 })));
    }

    #[tokio::test]
    async fn test_http_proxy_uses_absolute_form_for_plain_http_only() {
        let proxy = ProxyDescriptor::parse("http://u:p@127.0.0.1:3128").unwrap();
        let tls = TlsConnector::from(tls::build_client_config(true).unwrap());
        let connector = HttpProxyConnector::new(proxy, tls, None);
        let http = Endpoint::from_url(&Url::parse("http://example.com/").unwrap()).unwrap();
        let https = Endpoint::from_url(&Url::parse("https://example.com/").unwrap()).unwrap();
        assert!(connector.absolute_form(&http));
        assert!(!connector.absolute_form(&https));
        assert!(connector.proxy_authorization().is_some());
    }

    #[tokio::test]
    async fn test_direct_connect_refused_is_connect_fault() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let connector = DirectConnector::new(None);
        let endpoint = Endpoint::from_url(&Url::parse(&format!("http://127.0.0.1:{port}/")).unwrap()).unwrap();
        let result = connector.connect(&endpoint).await;
        assert!(matches!(result, Err(Fault::Connect(_))));
    }
}
