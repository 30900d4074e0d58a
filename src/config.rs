//! Transport configuration.
//!
//! [`TransportConfig`] carries the environment-level knobs the transport
//! consumes: a process-wide proxy, a source address, compatibility flags,
//! session headers and timeouts. It is built once (from defaults, a JSON file
//! or the environment) and handed to the backend at construction.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::headers::{HeaderError, Headers};

/// Compatibility flag that turns the native transport backend off.
pub const COMPAT_NO_NATIVE_TRANSPORT: &str = "no-native-transport";

const DEFAULT_TIMEOUT_SECS: u64 = 20;
const DEFAULT_MAX_REDIRECTS: usize = 10;
const DEFAULT_MAX_IDLE_PER_HOST: usize = 8;

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config file {path}")]
    Read {
        /// Path of the file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid JSON for [`TransportConfig`].
    #[error("failed to parse config file {path}")]
    Parse {
        /// Path of the file.
        path: PathBuf,
        /// Underlying parse error.
        #[source]
        source: serde_json::Error,
    },

    /// A session header is not valid HTTP.
    #[error(transparent)]
    Header(#[from] HeaderError),

    /// The TLS client context could not be built.
    #[error("failed to build TLS context")]
    Tls(#[source] rustls::Error),
}

/// Proxies captured from `HTTP_PROXY` / `HTTPS_PROXY` / `ALL_PROXY`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvProxies {
    /// Proxy for `http://` targets.
    pub http: Option<String>,
    /// Proxy for `https://` targets.
    pub https: Option<String>,
}

impl EnvProxies {
    /// Reads the proxy variables of the current process (upper case first).
    #[must_use]
    pub fn capture() -> Self {
        Self {
            http: env_proxy_for_scheme("http"),
            https: env_proxy_for_scheme("https"),
        }
    }

    /// Proxy captured for a target scheme.
    #[must_use]
    pub fn for_scheme(&self, scheme: &str) -> Option<&str> {
        match scheme {
            "http" => self.http.as_deref(),
            "https" => self.https.as_deref(),
            _ => None,
        }
    }
}

fn env_proxy_for_scheme(scheme: &str) -> Option<String> {
    match scheme {
        "https" => find_first_proxy_var(&["HTTPS_PROXY", "https_proxy", "ALL_PROXY", "all_proxy"]),
        "http" => find_first_proxy_var(&["HTTP_PROXY", "http_proxy", "ALL_PROXY", "all_proxy"]),
        _ => None,
    }
}

fn find_first_proxy_var(names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| {
        std::env::var(name)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

/// Configuration of one transport backend instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportConfig {
    /// Process-wide default proxy. The scheme may be omitted.
    pub proxy: Option<String>,
    /// Local IP outgoing sockets are bound to.
    pub source_address: Option<IpAddr>,
    /// Compatibility flags; see [`COMPAT_NO_NATIVE_TRANSPORT`].
    pub compat_options: Vec<String>,
    /// Per-session headers, layered over the standard headers.
    pub headers: BTreeMap<String, String>,
    /// Timeout used when a request sets none.
    pub timeout_secs: u64,
    /// Maximum number of redirects followed for one request.
    pub max_redirects: usize,
    /// Validate server certificates.
    pub verify_certificates: bool,
    /// Idle connections kept per destination inside one pool.
    pub max_idle_per_host: usize,
    /// Replaces the default browser User-Agent.
    pub user_agent: Option<String>,
    #[serde(skip)]
    env_proxies: EnvProxies,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            proxy: None,
            source_address: None,
            compat_options: Vec::new(),
            headers: BTreeMap::new(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            verify_certificates: true,
            max_idle_per_host: DEFAULT_MAX_IDLE_PER_HOST,
            user_agent: None,
            env_proxies: EnvProxies::default(),
        }
    }
}

impl TransportConfig {
    /// Default configuration plus proxies from the environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().with_env_proxies(EnvProxies::capture())
    }

    /// Loads a JSON configuration file. Environment proxies are captured too.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file cannot be read or parsed.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(config.with_env_proxies(EnvProxies::capture()))
    }

    /// Replaces the captured environment proxies.
    #[must_use]
    pub fn with_env_proxies(mut self, env_proxies: EnvProxies) -> Self {
        self.env_proxies = env_proxies;
        self
    }

    /// Environment proxies captured at construction.
    #[must_use]
    pub fn env_proxies(&self) -> &EnvProxies {
        &self.env_proxies
    }

    /// Default request timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Returns `true` when a compatibility flag disables the native backend.
    #[must_use]
    pub fn native_transport_disabled(&self) -> bool {
        self.compat_options
            .iter()
            .any(|flag| flag.eq_ignore_ascii_case(COMPAT_NO_NATIVE_TRANSPORT))
    }

    /// Session headers as a typed collection.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Header`] for an invalid header name or value.
    pub fn session_headers(&self) -> Result<Headers, ConfigError> {
        let mut headers = Headers::new();
        for (name, value) in &self.headers {
            headers.insert_str(name, value)?;
        }
        Ok(headers)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.timeout(), Duration::from_secs(20));
        assert_eq!(config.max_redirects, 10);
        assert!(config.verify_certificates);
        assert!(!config.native_transport_disabled());
        assert!(config.env_proxies().http.is_none());
    }

    #[test]
    fn test_from_json_file_applies_defaults_for_missing_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"proxy": "socks5://127.0.0.1:9050", "source_address": "127.0.0.1",
                "compat_options": ["No-Native-Transport"], "headers": {{"X-Session": "1"}}}}"#
        )
        .unwrap();

        let config = TransportConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.proxy.as_deref(), Some("socks5://127.0.0.1:9050"));
        assert_eq!(config.source_address, Some("127.0.0.1".parse().unwrap()));
        assert!(config.native_transport_disabled());
        assert_eq!(config.timeout_secs, 20);
        let headers = config.session_headers().unwrap();
        assert_eq!(headers.get_str("x-session"), Some("1"));
    }

    #[test]
    fn test_from_json_file_rejects_unknown_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"proxies": "x"}}"#).unwrap();
        let result = TransportConfig::from_json_file(file.path());
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let result = TransportConfig::from_json_file(Path::new("/nonexistent/fetchcore.json"));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_env_proxies_by_scheme() {
        let env = EnvProxies {
            http: Some("http://p:1".to_string()),
            https: None,
        };
        assert_eq!(env.for_scheme("http"), Some("http://p:1"));
        assert_eq!(env.for_scheme("https"), None);
        assert_eq!(env.for_scheme("ftp"), None);
    }

    #[test]
    fn test_invalid_session_header() {
        let mut config = TransportConfig::default();
        config.headers.insert("bad name".to_string(), "v".to_string());
        assert!(matches!(config.session_headers(), Err(ConfigError::Header(_))));
    }
}
