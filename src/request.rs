//! Immutable request description handed to a transport backend.
//!
//! A [`Request`] is built once through [`RequestBuilder`] and never mutated
//! afterwards. Builder errors are deferred to [`RequestBuilder::build`] so
//! call sites can chain freely.

use std::fmt;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures_util::Stream;
use http::Method;
use url::Url;

use crate::headers::{HeaderError, Headers};

/// Streaming request body. Consumed at most once.
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// Errors raised while building a [`Request`].
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    /// The target URL could not be parsed as an absolute URL.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The rejected URL string.
        url: String,
    },

    /// The HTTP method is not a valid token.
    #[error("invalid HTTP method: {method}")]
    InvalidMethod {
        /// The rejected method.
        method: String,
    },

    /// A header name or value was rejected.
    #[error(transparent)]
    Header(#[from] HeaderError),
}

/// Request body: nothing, a replayable byte buffer, or a one-shot stream.
pub enum Body {
    /// No body.
    Empty,
    /// In-memory body, resent verbatim on 307/308 redirects.
    Bytes(Bytes),
    /// Streamed body; cannot be replayed across a redirect.
    Stream(BodyStream),
}

impl Body {
    /// Returns `true` if no body is attached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
            Self::Stream(_) => f.write_str("Stream"),
        }
    }
}

/// An outbound HTTP call.
#[derive(Debug)]
pub struct Request {
    method: Method,
    url: Url,
    headers: Headers,
    unredirected_headers: Headers,
    body: Body,
    proxy: Option<String>,
    timeout: Option<Duration>,
    compression: bool,
}

/// Owned parts of a [`Request`], used by backends when dispatching.
#[derive(Debug)]
pub(crate) struct RequestParts {
    pub(crate) method: Method,
    pub(crate) url: Url,
    pub(crate) headers: Headers,
    pub(crate) unredirected_headers: Headers,
    pub(crate) body: Body,
    pub(crate) compression: bool,
}

impl Request {
    /// Starts building a request with an arbitrary method.
    #[must_use]
    pub fn builder(method: &str, url: &str) -> RequestBuilder {
        RequestBuilder::new(method, url)
    }

    /// Starts building a GET request.
    #[must_use]
    pub fn get(url: &str) -> RequestBuilder {
        RequestBuilder::new("GET", url)
    }

    /// Starts building a HEAD request.
    #[must_use]
    pub fn head(url: &str) -> RequestBuilder {
        RequestBuilder::new("HEAD", url)
    }

    /// Starts building a POST request.
    #[must_use]
    pub fn post(url: &str) -> RequestBuilder {
        RequestBuilder::new("POST", url)
    }

    /// The HTTP method.
    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The target URL.
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Per-request headers (forwarded on every redirect hop).
    #[must_use]
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Headers dropped when a redirect moves to a different host.
    #[must_use]
    pub fn unredirected_headers(&self) -> &Headers {
        &self.unredirected_headers
    }

    /// The request body.
    #[must_use]
    pub fn body(&self) -> &Body {
        &self.body
    }

    /// Proxy override. `Some("")` forces a direct connection.
    #[must_use]
    pub fn proxy(&self) -> Option<&str> {
        self.proxy.as_deref()
    }

    /// Per-request timeout, if one was set.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Whether response compression should be negotiated.
    #[must_use]
    pub fn compression(&self) -> bool {
        self.compression
    }

    pub(crate) fn into_parts(self) -> RequestParts {
        RequestParts {
            method: self.method,
            url: self.url,
            headers: self.headers,
            unredirected_headers: self.unredirected_headers,
            body: self.body,
            compression: self.compression,
        }
    }
}

/// Builder for [`Request`]. The first error encountered is reported by [`build`](Self::build).
#[derive(Debug)]
pub struct RequestBuilder {
    inner: Result<Request, RequestError>,
}

impl RequestBuilder {
    fn new(method: &str, url: &str) -> Self {
        let inner = Method::from_bytes(method.as_bytes())
            .map_err(|_| RequestError::InvalidMethod {
                method: method.to_string(),
            })
            .and_then(|method| {
                let url = Url::parse(url).map_err(|_| RequestError::InvalidUrl {
                    url: url.to_string(),
                })?;
                Ok(Request {
                    method,
                    url,
                    headers: Headers::new(),
                    unredirected_headers: Headers::new(),
                    body: Body::Empty,
                    proxy: None,
                    timeout: None,
                    compression: true,
                })
            });
        Self { inner }
    }

    fn and_then<F>(mut self, update: F) -> Self
    where
        F: FnOnce(&mut Request) -> Result<(), RequestError>,
    {
        if let Ok(request) = self.inner.as_mut()
            && let Err(error) = update(request)
        {
            self.inner = Err(error);
        }
        self
    }

    /// Appends a header value. Removes the name from the unredirected set.
    #[must_use]
    pub fn header(self, name: &str, value: &str) -> Self {
        self.and_then(|request| {
            let (name, value) = Headers::parse_pair(name, value)?;
            request.unredirected_headers.remove(name.as_str());
            request.headers.append(name, value);
            Ok(())
        })
    }

    /// Appends a header that must not follow a redirect to another host.
    /// Removes the name from the regular header set.
    #[must_use]
    pub fn unredirected_header(self, name: &str, value: &str) -> Self {
        self.and_then(|request| {
            let (name, value) = Headers::parse_pair(name, value)?;
            request.headers.remove(name.as_str());
            request.unredirected_headers.append(name, value);
            Ok(())
        })
    }

    /// Sets an in-memory body.
    #[must_use]
    pub fn body(self, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        self.and_then(|request| {
            request.body = Body::Bytes(body);
            Ok(())
        })
    }

    /// Sets a streamed body.
    #[must_use]
    pub fn body_stream(self, stream: BodyStream) -> Self {
        self.and_then(|request| {
            request.body = Body::Stream(stream);
            Ok(())
        })
    }

    /// Overrides the proxy for this request. An empty string disables proxying.
    #[must_use]
    pub fn proxy(self, proxy: &str) -> Self {
        let proxy = proxy.to_string();
        self.and_then(|request| {
            request.proxy = Some(proxy);
            Ok(())
        })
    }

    /// Sets the timeout bounding the connect and read phases independently.
    #[must_use]
    pub fn timeout(self, timeout: Duration) -> Self {
        self.and_then(|request| {
            request.timeout = Some(timeout);
            Ok(())
        })
    }

    /// Enables or disables response compression negotiation (enabled by default).
    #[must_use]
    pub fn compression(self, enabled: bool) -> Self {
        self.and_then(|request| {
            request.compression = enabled;
            Ok(())
        })
    }

    /// Finishes the request.
    ///
    /// # Errors
    ///
    /// Returns the first [`RequestError`] raised while building.
    pub fn build(self) -> Result<Request, RequestError> {
        self.inner
    }
}
