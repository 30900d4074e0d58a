//! Error taxonomy for the transport core.
//!
//! Every failure that crosses the transport boundary is exactly one
//! [`TransportError`]. Backend-native faults (hyper, rustls, SOCKS, I/O) are
//! converted by the translator in [`crate::translate`] and never escape as
//! their own types; they are only reachable through [`std::error::Error::source`].

use std::fmt;

use thiserror::Error;

use crate::response::Response;

/// Boxed lower-level cause carried by a [`TransportError`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Flat tag for a [`TransportError`], convenient for matching and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Generic protocol or framing failure.
    Transport,
    /// No connection could be established within the timeout.
    ConnectTimeout,
    /// Connected, but the response did not arrive within the timeout.
    ReadTimeout,
    /// The body ended before its declared length.
    IncompleteRead,
    /// TLS handshake or certificate validation failure.
    Tls,
    /// The proxy (HTTP or SOCKS) failed to establish or tunnel the connection.
    Proxy,
    /// The call completed with a status outside 200-299.
    HttpStatus,
    /// The redirect hop limit was exhausted.
    RedirectLoop,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Transport => "transport",
            Self::ConnectTimeout => "connect-timeout",
            Self::ReadTimeout => "read-timeout",
            Self::IncompleteRead => "incomplete-read",
            Self::Tls => "tls",
            Self::Proxy => "proxy",
            Self::HttpStatus => "http-status",
            Self::RedirectLoop => "redirect-loop",
        };
        f.write_str(name)
    }
}

/// Errors surfaced by the transport core.
///
/// The transport never retries internally; each variant is handed to the
/// caller once and the caller decides on retry, fallback, or hard failure.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Generic protocol/framing failure (connection refused, reset, malformed response, ...).
    #[error("transport error requesting {url}: {message}")]
    Transport {
        /// The URL being requested.
        url: String,
        /// Human-readable description.
        message: String,
        /// The lower-level cause, if any.
        #[source]
        source: Option<BoxError>,
    },

    /// Connection establishment (TCP, proxy handshake, TLS) exceeded the timeout.
    #[error("timed out connecting to {url}")]
    ConnectTimeout {
        /// The URL being requested.
        url: String,
        /// The lower-level cause, if any.
        #[source]
        source: Option<BoxError>,
    },

    /// The response head or a body read exceeded the timeout.
    #[error("timed out reading response from {url}")]
    ReadTimeout {
        /// The URL being requested.
        url: String,
        /// The lower-level cause, if any.
        #[source]
        source: Option<BoxError>,
    },

    /// Fewer bytes arrived than the response declared.
    #[error("incomplete read from {url}: {partial} bytes read{}", expected_suffix(.expected))]
    IncompleteRead {
        /// The URL being requested.
        url: String,
        /// Raw body bytes received before the stream ended.
        partial: u64,
        /// Declared body length, when known.
        expected: Option<u64>,
        /// The lower-level cause, if any.
        #[source]
        source: Option<BoxError>,
    },

    /// TLS handshake or certificate validation failed.
    #[error("TLS error requesting {url}: {message}")]
    Tls {
        /// The URL being requested.
        url: String,
        /// Human-readable description.
        message: String,
        /// The lower-level cause, if any.
        #[source]
        source: Option<BoxError>,
    },

    /// The proxy could not be used, reached, or could not tunnel the connection.
    #[error("proxy error requesting {url}: {message}")]
    Proxy {
        /// The URL being requested.
        url: String,
        /// Human-readable description.
        message: String,
        /// The lower-level cause, if any.
        #[source]
        source: Option<BoxError>,
    },

    /// The call completed but returned a non-2xx status.
    ///
    /// The response is kept so the caller can read the error body; its
    /// connection is closed instead of being returned to the pool.
    #[error("HTTP Error {status} requesting {}", .response.url())]
    HttpStatus {
        /// Status code of the final response.
        status: u16,
        /// The final response.
        response: Box<Response>,
    },

    /// A redirect was received with no hops left.
    #[error("redirect loop: gave up after {hops} redirects at {}", .response.url())]
    RedirectLoop {
        /// Redirects followed before giving up.
        hops: usize,
        /// The last redirect response.
        response: Box<Response>,
    },
}

fn expected_suffix(expected: &Option<u64>) -> String {
    match expected {
        Some(total) => format!(", {total} expected"),
        None => String::new(),
    }
}

impl TransportError {
    /// Creates a generic transport error.
    pub fn transport(url: impl Into<String>, message: impl Into<String>, source: Option<BoxError>) -> Self {
        Self::Transport {
            url: url.into(),
            message: message.into(),
            source,
        }
    }

    /// Creates a connect-timeout error.
    pub fn connect_timeout(url: impl Into<String>, source: Option<BoxError>) -> Self {
        Self::ConnectTimeout {
            url: url.into(),
            source,
        }
    }

    /// Creates a read-timeout error.
    pub fn read_timeout(url: impl Into<String>, source: Option<BoxError>) -> Self {
        Self::ReadTimeout {
            url: url.into(),
            source,
        }
    }

    /// Creates an incomplete-read error.
    pub fn incomplete_read(
        url: impl Into<String>,
        partial: u64,
        expected: Option<u64>,
        source: Option<BoxError>,
    ) -> Self {
        Self::IncompleteRead {
            url: url.into(),
            partial,
            expected,
            source,
        }
    }

    /// Creates a TLS error.
    pub fn tls(url: impl Into<String>, message: impl Into<String>, source: Option<BoxError>) -> Self {
        Self::Tls {
            url: url.into(),
            message: message.into(),
            source,
        }
    }

    /// Creates a proxy error.
    pub fn proxy(url: impl Into<String>, message: impl Into<String>, source: Option<BoxError>) -> Self {
        Self::Proxy {
            url: url.into(),
            message: message.into(),
            source,
        }
    }

    /// Wraps a non-2xx response, marking its connection for forced closure.
    #[must_use]
    pub fn http_status(mut response: Response) -> Self {
        response.mark_discard();
        Self::HttpStatus {
            status: response.status().as_u16(),
            response: Box::new(response),
        }
    }

    /// Wraps the redirect response that exhausted the hop limit.
    #[must_use]
    pub fn redirect_loop(mut response: Response, hops: usize) -> Self {
        response.mark_discard();
        Self::RedirectLoop {
            hops,
            response: Box::new(response),
        }
    }

    /// Returns the taxonomy tag of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport { .. } => ErrorKind::Transport,
            Self::ConnectTimeout { .. } => ErrorKind::ConnectTimeout,
            Self::ReadTimeout { .. } => ErrorKind::ReadTimeout,
            Self::IncompleteRead { .. } => ErrorKind::IncompleteRead,
            Self::Tls { .. } => ErrorKind::Tls,
            Self::Proxy { .. } => ErrorKind::Proxy,
            Self::HttpStatus { .. } => ErrorKind::HttpStatus,
            Self::RedirectLoop { .. } => ErrorKind::RedirectLoop,
        }
    }

    /// Returns the URL the failing call was made for.
    #[must_use]
    pub fn url(&self) -> &str {
        match self {
            Self::Transport { url, .. }
            | Self::ConnectTimeout { url, .. }
            | Self::ReadTimeout { url, .. }
            | Self::IncompleteRead { url, .. }
            | Self::Tls { url, .. }
            | Self::Proxy { url, .. } => url,
            Self::HttpStatus { response, .. } | Self::RedirectLoop { response, .. } => {
                response.url().as_str()
            }
        }
    }

    /// Returns the response attached to HTTP-status and redirect-loop errors.
    #[must_use]
    pub fn response(&self) -> Option<&Response> {
        match self {
            Self::HttpStatus { response, .. } | Self::RedirectLoop { response, .. } => {
                Some(response)
            }
            _ => None,
        }
    }

    /// Consumes the error, returning its response if it carries one.
    #[must_use]
    pub fn into_response(self) -> Option<Response> {
        match self {
            Self::HttpStatus { response, .. } | Self::RedirectLoop { response, .. } => {
                Some(*response)
            }
            _ => None,
        }
    }

    /// Returns `(partial, expected)` for incomplete reads.
    #[must_use]
    pub fn incomplete_counts(&self) -> Option<(u64, Option<u64>)> {
        match self {
            Self::IncompleteRead {
                partial, expected, ..
            } => Some((*partial, *expected)),
            _ => None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[test]
    fn test_incomplete_read_display_includes_counts() {
        let error = TransportError::incomplete_read("https://example.com/v.mp4", 10, Some(100), None);
        let msg = error.to_string();
        assert!(msg.contains("10 bytes read"), "Expected partial count in: {msg}");
        assert!(msg.contains("100 expected"), "Expected total in: {msg}");
        assert_eq!(error.kind(), ErrorKind::IncompleteRead);
        assert_eq!(error.incomplete_counts(), Some((10, Some(100))));
    }

    #[test]
    fn test_incomplete_read_without_expected_total() {
        let error = TransportError::incomplete_read("https://example.com/v.mp4", 7, None, None);
        let msg = error.to_string();
        assert!(msg.ends_with("7 bytes read"), "Unexpected message: {msg}");
    }

    #[test]
    fn test_source_chain_is_preserved() {
        let cause = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let error = TransportError::transport(
            "http://example.com/",
            "connection reset",
            Some(Box::new(cause)),
        );
        let source = error.source().unwrap();
        assert!(source.to_string().contains("reset by peer"));
        assert_eq!(error.url(), "http://example.com/");
    }

    #[test]
    fn test_kind_mapping_is_one_to_one() {
        let cases = [
            (TransportError::transport("u", "m", None), ErrorKind::Transport),
            (TransportError::connect_timeout("u", None), ErrorKind::ConnectTimeout),
            (TransportError::read_timeout("u", None), ErrorKind::ReadTimeout),
            (TransportError::tls("u", "m", None), ErrorKind::Tls),
            (TransportError::proxy("u", "m", None), ErrorKind::Proxy),
        ];
        for (error, kind) in cases {
            assert_eq!(error.kind(), kind);
            assert!(error.response().is_none());
        }
    }

    #[test]
    fn test_error_kind_display() {
        assert_eq!(ErrorKind::ConnectTimeout.to_string(), "connect-timeout");
        assert_eq!(ErrorKind::RedirectLoop.to_string(), "redirect-loop");
    }
}
