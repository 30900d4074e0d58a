//! Proxy resolution and classification.
//!
//! Resolution is pure: it parses and classifies proxy URLs without any
//! network I/O. Environment proxies are captured once into
//! [`crate::config::EnvProxies`] when configuration is built.

use std::fmt;

use url::Url;

use crate::config::EnvProxies;

/// Pool identity used when no proxy applies.
pub const NO_PROXY_IDENTITY: &str = "__noproxy__";

/// Errors raised for proxy URLs that cannot be used.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// The proxy URL could not be parsed.
    #[error("invalid proxy URL: {proxy}")]
    InvalidUrl {
        /// The rejected proxy (credentials removed).
        proxy: String,
    },

    /// The proxy scheme is not HTTP(S) or SOCKS.
    #[error("unsupported proxy scheme: {scheme}")]
    UnsupportedScheme {
        /// The rejected scheme.
        scheme: String,
    },

    /// The proxy URL has no host.
    #[error("proxy URL has no host: {proxy}")]
    MissingHost {
        /// The rejected proxy (credentials removed).
        proxy: String,
    },
}

/// Kind of proxy, derived from the proxy URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyScheme {
    /// Plain HTTP proxy.
    Http,
    /// HTTP proxy reached over TLS.
    Https,
    /// SOCKS4, target resolved locally.
    Socks4,
    /// SOCKS4a, target resolved by the proxy.
    Socks4a,
    /// SOCKS5, target resolved locally.
    Socks5,
    /// SOCKS5, target resolved by the proxy.
    Socks5h,
}

impl ProxyScheme {
    /// Classifies a scheme string. `socks` is an alias for SOCKS4.
    #[must_use]
    pub fn parse(scheme: &str) -> Option<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "http" => Some(Self::Http),
            "https" => Some(Self::Https),
            "socks" | "socks4" => Some(Self::Socks4),
            "socks4a" => Some(Self::Socks4a),
            "socks5" => Some(Self::Socks5),
            "socks5h" => Some(Self::Socks5h),
            _ => None,
        }
    }

    /// Canonical scheme name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
            Self::Socks4 => "socks4",
            Self::Socks4a => "socks4a",
            Self::Socks5 => "socks5",
            Self::Socks5h => "socks5h",
        }
    }

    /// Returns `true` for the SOCKS family.
    #[must_use]
    pub fn is_socks(self) -> bool {
        !matches!(self, Self::Http | Self::Https)
    }

    /// Returns `true` when the proxy resolves the target hostname.
    #[must_use]
    pub fn remote_dns(self) -> bool {
        matches!(self, Self::Socks4a | Self::Socks5h)
    }

    /// Port used when the proxy URL does not name one.
    #[must_use]
    pub fn default_port(self) -> u16 {
        match self {
            Self::Http => 80,
            Self::Https => 443,
            Self::Socks4 | Self::Socks4a | Self::Socks5 | Self::Socks5h => 1080,
        }
    }
}

/// Username and password taken from a proxy URL.
///
/// The password is redacted in Debug output.
#[derive(Clone, PartialEq, Eq)]
pub struct ProxyCredentials {
    /// Decoded username.
    pub username: String,
    password: String,
}

impl ProxyCredentials {
    /// Creates a credential pair.
    #[must_use]
    pub fn new(username: String, password: String) -> Self {
        Self { username, password }
    }

    /// Returns the password. Avoid logging the return value.
    #[must_use]
    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for ProxyCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyCredentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// A normalized, classified proxy endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyDescriptor {
    scheme: ProxyScheme,
    host: String,
    port: u16,
    credentials: Option<ProxyCredentials>,
    identity: String,
}

impl ProxyDescriptor {
    /// Parses an absolute proxy URL (the scheme must already be present).
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError`] when the URL is malformed, has no host, or uses
    /// a scheme other than HTTP(S)/SOCKS.
    pub fn parse(proxy_url: &str) -> Result<Self, ProxyError> {
        let parsed = Url::parse(proxy_url).map_err(|_| ProxyError::InvalidUrl {
            proxy: redact(proxy_url),
        })?;
        let scheme = ProxyScheme::parse(parsed.scheme()).ok_or_else(|| ProxyError::UnsupportedScheme {
            scheme: parsed.scheme().to_string(),
        })?;
        let host = parsed
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ProxyError::MissingHost {
                proxy: redact(proxy_url),
            })?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = parsed.port().unwrap_or_else(|| scheme.default_port());

        let credentials = if parsed.username().is_empty() {
            None
        } else {
            Some(ProxyCredentials::new(
                decode_component(parsed.username()),
                decode_component(parsed.password().unwrap_or("")),
            ))
        };

        let identity = identity_for(scheme, &host, port, credentials.as_ref());
        Ok(Self {
            scheme,
            host,
            port,
            credentials,
            identity,
        })
    }

    /// Proxy kind.
    #[must_use]
    pub fn scheme(&self) -> ProxyScheme {
        self.scheme
    }

    /// Proxy hostname or IP literal (without brackets).
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Proxy port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Credentials from the proxy URL, if any.
    #[must_use]
    pub fn credentials(&self) -> Option<&ProxyCredentials> {
        self.credentials.as_ref()
    }

    /// Returns `true` for SOCKS proxies.
    #[must_use]
    pub fn is_socks(&self) -> bool {
        self.scheme.is_socks()
    }

    /// Normalized identity string keying the connection pool for this proxy.
    ///
    /// Contains credentials; never log it (use `Display` instead).
    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }
}

impl fmt::Display for ProxyDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        match &self.credentials {
            Some(creds) => write!(
                f,
                "{}://{}:***@{}:{}",
                self.scheme.as_str(),
                creds.username,
                host,
                self.port
            ),
            None => write!(f, "{}://{}:{}", self.scheme.as_str(), host, self.port),
        }
    }
}

fn identity_for(scheme: ProxyScheme, host: &str, port: u16, credentials: Option<&ProxyCredentials>) -> String {
    let host = host.to_ascii_lowercase();
    match credentials {
        Some(creds) => format!(
            "{}://{}:{}@{}:{}",
            scheme.as_str(),
            creds.username,
            creds.password,
            host,
            port
        ),
        None => format!("{}://{}:{}", scheme.as_str(), host, port),
    }
}

fn decode_component(raw: &str) -> String {
    urlencoding::decode(raw).map_or_else(|_| raw.to_string(), std::borrow::Cow::into_owned)
}

/// Strips the userinfo part from a proxy string for error messages.
fn redact(proxy: &str) -> String {
    match (proxy.find("://"), proxy.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}***{}", &proxy[..scheme_end + 3], &proxy[at..])
        }
        (None, Some(at)) => format!("***{}", &proxy[at..]),
        _ => proxy.to_string(),
    }
}

/// Adds the target URL's scheme to a proxy string that has none.
///
/// Proxy lists are often written as `host:port`; such entries take the
/// scheme of the request they are used for.
#[must_use]
pub fn infer_proxy_scheme(proxy: &str, target_scheme: &str) -> String {
    let proxy = proxy.trim();
    if proxy.contains("://") {
        proxy.to_string()
    } else {
        format!("{target_scheme}://{proxy}")
    }
}

/// Decides which proxy, if any, applies to a request.
#[derive(Debug, Clone, Default)]
pub struct ProxyResolver {
    default_proxy: Option<String>,
    env: EnvProxies,
}

impl ProxyResolver {
    /// Creates a resolver with a process-wide default proxy and captured
    /// environment proxies.
    #[must_use]
    pub fn new(default_proxy: Option<String>, env: EnvProxies) -> Self {
        Self {
            default_proxy: default_proxy.filter(|p| !p.trim().is_empty()),
            env,
        }
    }

    /// Resolves the proxy for a request.
    ///
    /// Precedence: request override > process-wide default > environment
    /// proxy for the target scheme. An empty request override means "no proxy".
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError`] when the selected proxy URL is unusable.
    pub fn resolve(
        &self,
        request_proxy: Option<&str>,
        target: &Url,
    ) -> Result<Option<ProxyDescriptor>, ProxyError> {
        let selected = match request_proxy {
            Some(proxy) if proxy.trim().is_empty() => None,
            Some(proxy) => Some(proxy),
            None => self
                .default_proxy
                .as_deref()
                .or_else(|| self.env.for_scheme(target.scheme())),
        };
        selected
            .map(|proxy| ProxyDescriptor::parse(&infer_proxy_scheme(proxy, target.scheme())))
            .transpose()
    }
}
