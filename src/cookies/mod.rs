//! Cookie Integration.
//!
//! Bridges the transport and a shared [`CookieStore`]: cookies applicable to
//! each physical hop are injected before dispatch, and `Set-Cookie` headers of
//! the final response are harvested into the store keyed by its final URL.
//! A `Cookie` header set explicitly by the caller is never overridden.

mod netscape;

pub use netscape::{CookieFile, CookieFileError, NetscapeCookie, load_cookie_file, parse_cookie_file};

use std::fmt;
use std::sync::Arc;

use http::header::{COOKIE, SET_COOKIE};
use reqwest::cookie::{CookieStore, Jar};
use tracing::trace;
use url::Url;

use crate::headers::Headers;

/// Shared cookie store wrapper used by the transport.
#[derive(Clone)]
pub struct CookieIntegration {
    store: Arc<dyn CookieStore>,
}

impl CookieIntegration {
    /// Wraps any cookie store.
    #[must_use]
    pub fn new(store: Arc<dyn CookieStore>) -> Self {
        Self { store }
    }

    /// Wraps a `reqwest` jar.
    #[must_use]
    pub fn with_jar(jar: Arc<Jar>) -> Self {
        Self { store: jar }
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn CookieStore> {
        &self.store
    }

    /// Adds the store's cookies for `url` unless a `Cookie` header is already
    /// present. Returns whether a header was added.
    pub fn apply(&self, url: &Url, headers: &mut Headers) -> bool {
        if headers.contains(COOKIE.as_str()) {
            return false;
        }
        match self.store.cookies(url) {
            Some(value) => {
                trace!(host = url.host_str().unwrap_or(""), "attaching stored cookies");
                headers.insert(COOKIE, value);
                true
            }
            None => false,
        }
    }

    /// Feeds every `Set-Cookie` header into the store for `url`. Returns the
    /// number of headers seen.
    pub fn harvest(&self, url: &Url, headers: &Headers) -> usize {
        let count = headers.get_all(SET_COOKIE.as_str()).count();
        if count > 0 {
            let mut values = headers.get_all(SET_COOKIE.as_str());
            self.store.set_cookies(&mut values, url);
            trace!(host = url.host_str().unwrap_or(""), count, "stored response cookies");
        }
        count
    }
}

impl fmt::Debug for CookieIntegration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CookieIntegration").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn set_cookie(values: &[&str]) -> Headers {
        let mut headers = Headers::new();
        for value in values {
            let (name, value) = Headers::parse_pair("Set-Cookie", value).unwrap();
            headers.append(name, value);
        }
        headers
    }

    #[test]
    fn test_harvested_cookies_apply_to_same_host_only() {
        let cookies = CookieIntegration::with_jar(Arc::new(Jar::default()));
        let origin = Url::parse("https://example.com/login").unwrap();
        let harvested = cookies.harvest(&origin, &set_cookie(&["sid=abc; Path=/", "lang=en; Path=/"]));
        assert_eq!(harvested, 2);

        let mut same_host = Headers::new();
        assert!(cookies.apply(&Url::parse("https://example.com/watch").unwrap(), &mut same_host));
        let value = same_host.get_str("cookie").unwrap();
        assert!(value.contains("sid=abc"));
        assert!(value.contains("lang=en"));

        let mut other_host = Headers::new();
        assert!(!cookies.apply(&Url::parse("https://other.com/").unwrap(), &mut other_host));
        assert!(!other_host.contains("cookie"));
    }

    #[test]
    fn test_explicit_cookie_header_wins() {
        let cookies = CookieIntegration::with_jar(Arc::new(Jar::default()));
        let url = Url::parse("https://example.com/").unwrap();
        cookies.harvest(&url, &set_cookie(&["sid=stored"]));

        let mut headers = Headers::new();
        headers.insert_str("Cookie", "sid=explicit").unwrap();
        assert!(!cookies.apply(&url, &mut headers));
        assert_eq!(headers.get_str("cookie"), Some("sid=explicit"));
    }

    #[test]
    fn test_harvest_without_set_cookie_is_noop() {
        let cookies = CookieIntegration::with_jar(Arc::new(Jar::default()));
        let url = Url::parse("https://example.com/").unwrap();
        assert_eq!(cookies.harvest(&url, &Headers::new()), 0);
        assert!(cookies.store().cookies(&url).is_none());
    }

    #[test]
    fn test_last_writer_wins() {
        let cookies = CookieIntegration::with_jar(Arc::new(Jar::default()));
        let url = Url::parse("https://example.com/").unwrap();
        cookies.harvest(&url, &set_cookie(&["sid=first"]));
        cookies.harvest(&url, &set_cookie(&["sid=second"]));
        let mut headers = Headers::new();
        cookies.apply(&url, &mut headers);
        assert_eq!(headers.get_str("cookie"), Some("sid=second"));
    }
}
