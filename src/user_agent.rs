//! Process-wide default request headers.
//!
//! Single source for the browser-like header layer that sits below session
//! and per-request headers in the precedence chain.

use http::header::{ACCEPT, ACCEPT_LANGUAGE, HeaderName, HeaderValue, USER_AGENT};

use crate::headers::{HeaderError, Headers};

/// Browser User-Agent sent when neither the session nor the request sets one.
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36";

const DEFAULT_ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";
const DEFAULT_ACCEPT_LANGUAGE: &str = "en-us,en;q=0.5";
const SEC_FETCH_MODE: &str = "sec-fetch-mode";

/// Builds the lowest-precedence header layer.
///
/// # Errors
///
/// Returns [`HeaderError::InvalidValue`] when `user_agent` is not a valid header value.
pub fn standard_headers(user_agent: Option<&str>) -> Result<Headers, HeaderError> {
    let agent = user_agent.unwrap_or(DEFAULT_USER_AGENT);
    let agent = HeaderValue::from_str(agent).map_err(|_| HeaderError::InvalidValue {
        name: USER_AGENT.to_string(),
    })?;

    let mut headers = Headers::new();
    headers.insert(USER_AGENT, agent);
    headers.insert(ACCEPT, HeaderValue::from_static(DEFAULT_ACCEPT));
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static(DEFAULT_ACCEPT_LANGUAGE));
    headers.insert(
        HeaderName::from_static(SEC_FETCH_MODE),
        HeaderValue::from_static("navigate"),
    );
    Ok(headers)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_headers_use_browser_agent_by_default() {
        let headers = standard_headers(None).unwrap();
        assert_eq!(headers.get_str("user-agent"), Some(DEFAULT_USER_AGENT));
        assert!(headers.contains("accept"));
        assert!(headers.contains("accept-language"));
        assert_eq!(headers.get_str("Sec-Fetch-Mode"), Some("navigate"));
        assert!(!headers.contains("accept-encoding"));
    }

    #[test]
    fn test_user_agent_override() {
        let headers = standard_headers(Some("fetchcore-test/1")).unwrap();
        assert_eq!(headers.get_str("user-agent"), Some("fetchcore-test/1"));
    }

    #[test]
    fn test_invalid_user_agent_is_rejected() {
        assert!(standard_headers(Some("bad\r\nagent")).is_err());
    }
}
