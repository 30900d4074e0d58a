//! Redirect policy.
//!
//! The transport follows redirects for one logical request and never retries
//! a failed exchange. Headers marked "unredirected" are dropped from the first
//! hop that leaves the current origin onward.

use http::{Method, StatusCode};
use url::Url;

use crate::headers::Headers;

/// Raw bytes of a redirect body read so its connection can be reused.
pub(crate) const REDIRECT_DRAIN_LIMIT: u64 = 64 * 1024;

/// Headers describing the request body, dropped when the body is.
const BODY_HEADERS: &[&str] = &[
    "content-type",
    "content-length",
    "content-encoding",
    "content-language",
    "content-location",
    "transfer-encoding",
];

/// What the next hop of a redirect looks like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectStep {
    /// Absolute target of the next hop.
    pub url: Url,
    /// Method of the next hop.
    pub method: Method,
    /// Whether the request body is sent again.
    pub keep_body: bool,
    /// Whether the hop leaves the origin of the previous hop.
    pub cross_origin: bool,
}

/// Hop limit and per-hop redirect decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedirectPolicy {
    max_redirects: usize,
}

impl RedirectPolicy {
    /// Creates a policy following at most `max_redirects` redirects.
    #[must_use]
    pub fn new(max_redirects: usize) -> Self {
        Self { max_redirects }
    }

    /// Hop limit.
    #[must_use]
    pub fn max_redirects(&self) -> usize {
        self.max_redirects
    }

    /// Returns `true` for statuses that carry a `Location` to follow.
    #[must_use]
    pub fn is_redirect(status: StatusCode) -> bool {
        matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308)
    }

    /// Plans the next hop, or `None` when `status` is not a followable
    /// redirect or has no `Location`.
    ///
    /// # Errors
    ///
    /// Returns the raw `Location` value when it cannot be resolved against
    /// `current` or points at a non-HTTP scheme.
    pub fn next_step(
        status: StatusCode,
        headers: &Headers,
        current: &Url,
        method: &Method,
    ) -> Result<Option<RedirectStep>, String> {
        if !Self::is_redirect(status) {
            return Ok(None);
        }
        let Some(location) = headers.get(http::header::LOCATION.as_str()) else {
            return Ok(None);
        };
        let location = String::from_utf8_lossy(location.as_bytes()).into_owned();
        let url = current.join(location.trim()).map_err(|_| location.clone())?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(location);
        }

        let (method, keep_body) = redirected_method(status, method);
        let cross_origin = !same_origin(current, &url);
        Ok(Some(RedirectStep {
            url,
            method,
            keep_body,
            cross_origin,
        }))
    }
}

impl Default for RedirectPolicy {
    fn default() -> Self {
        Self::new(10)
    }
}

/// Method rewriting as browsers do it.
fn redirected_method(status: StatusCode, method: &Method) -> (Method, bool) {
    match status.as_u16() {
        303 if *method == Method::HEAD => (Method::HEAD, false),
        303 => (Method::GET, false),
        301 | 302 if *method == Method::POST => (Method::GET, false),
        _ => (method.clone(), true),
    }
}

/// Scheme, host and effective port all match.
#[must_use]
pub fn same_origin(a: &Url, b: &Url) -> bool {
    a.scheme() == b.scheme()
        && a.host_str().map(str::to_ascii_lowercase) == b.host_str().map(str::to_ascii_lowercase)
        && a.port_or_known_default() == b.port_or_known_default()
}

/// Removes the headers describing a body that is no longer sent.
pub(crate) fn strip_body_headers(headers: &mut Headers) {
    for name in BODY_HEADERS {
        headers.remove(name);
    }
}
