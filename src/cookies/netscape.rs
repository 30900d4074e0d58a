//! Netscape `cookies.txt` loading.
//!
//! Seven TAB-separated fields per line: domain, include-subdomains, path,
//! secure, expiry, name, value. Lines prefixed with `#HttpOnly_` are cookies
//! (the prefix marks them HTTP-only); other `#` lines are comments.

use std::fmt;
use std::io::BufRead;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use reqwest::cookie::Jar;
use tracing::{debug, instrument, warn};
use url::Url;

const HTTP_ONLY_PREFIX: &str = "#HttpOnly_";

/// Errors raised while loading a cookie file.
#[derive(Debug, thiserror::Error)]
pub enum CookieFileError {
    /// The file could not be read.
    #[error("failed to read cookie file")]
    Io(#[from] std::io::Error),

    /// Data lines were present but none parsed.
    #[error("no valid cookies in cookie file ({rejected} lines rejected)")]
    NoValidCookies {
        /// Lines that failed to parse.
        rejected: usize,
    },
}

/// One cookie of a Netscape cookie file. Debug output hides the value.
#[derive(Clone, PartialEq, Eq)]
pub struct NetscapeCookie {
    /// Cookie domain, possibly with a leading dot.
    pub domain: String,
    /// Whether subdomains match.
    pub include_subdomains: bool,
    /// Path scope.
    pub path: String,
    /// Only sent over HTTPS.
    pub secure: bool,
    /// Expiry as Unix seconds; `None` for session cookies.
    pub expires: Option<u64>,
    /// Marked `#HttpOnly_` in the file.
    pub http_only: bool,
    /// Cookie name.
    pub name: String,
    value: String,
}

impl NetscapeCookie {
    /// Cookie value. Avoid logging it.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }

    /// `Set-Cookie` form of this cookie, as understood by the jar.
    fn to_set_cookie(&self) -> String {
        let mut header = format!("{}={}; Path={}", self.name, self.value, self.path);
        if self.include_subdomains {
            header.push_str("; Domain=");
            header.push_str(self.domain.trim_start_matches('.'));
        }
        if self.secure {
            header.push_str("; Secure");
        }
        if self.http_only {
            header.push_str("; HttpOnly");
        }
        if let Some(expires) = self.expires.and_then(|secs| UNIX_EPOCH.checked_add(Duration::from_secs(secs))) {
            header.push_str("; Expires=");
            header.push_str(&httpdate::fmt_http_date(expires));
        }
        header
    }

    fn origin(&self) -> Option<Url> {
        let scheme = if self.secure { "https" } else { "http" };
        let host = self.domain.trim_start_matches('.');
        Url::parse(&format!("{scheme}://{host}{}", self.path)).ok()
    }

    fn is_expired(&self, now: SystemTime) -> bool {
        self.expires
            .and_then(|secs| UNIX_EPOCH.checked_add(Duration::from_secs(secs)))
            .is_some_and(|at| at <= now)
    }
}

impl fmt::Debug for NetscapeCookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetscapeCookie")
            .field("domain", &self.domain)
            .field("path", &self.path)
            .field("secure", &self.secure)
            .field("expires", &self.expires)
            .field("name", &self.name)
            .field("value", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

/// Parsed cookie file.
#[derive(Debug, Default)]
pub struct CookieFile {
    /// Cookies in file order.
    pub cookies: Vec<NetscapeCookie>,
    /// 1-based numbers of the lines that were rejected.
    pub rejected_lines: Vec<usize>,
}

impl CookieFile {
    /// Loads the unexpired cookies into a new jar.
    #[must_use]
    pub fn into_jar(self) -> Arc<Jar> {
        let jar = Arc::new(Jar::default());
        let now = SystemTime::now();
        for cookie in self.cookies.iter().filter(|c| !c.is_expired(now)) {
            match cookie.origin() {
                Some(origin) => jar.add_cookie_str(&cookie.to_set_cookie(), &origin),
                None => warn!(domain = %cookie.domain, name = %cookie.name, "cookie domain is not a valid host"),
            }
        }
        jar
    }
}

/// Parses a Netscape cookie file.
///
/// # Errors
///
/// Returns [`CookieFileError::Io`] on read failure and
/// [`CookieFileError::NoValidCookies`] when every data line is malformed.
#[instrument(level = "debug", skip(reader))]
pub fn parse_cookie_file(reader: impl BufRead) -> Result<CookieFile, CookieFileError> {
    let mut file = CookieFile::default();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim_end_matches(['\r', '\n']);
        let (line, http_only) = match line.strip_prefix(HTTP_ONLY_PREFIX) {
            Some(rest) => (rest, true),
            None => (line, false),
        };
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        match parse_line(line, http_only) {
            Some(cookie) => file.cookies.push(cookie),
            None => {
                warn!(line = index + 1, "skipping malformed cookie line");
                file.rejected_lines.push(index + 1);
            }
        }
    }
    if file.cookies.is_empty() && !file.rejected_lines.is_empty() {
        return Err(CookieFileError::NoValidCookies {
            rejected: file.rejected_lines.len(),
        });
    }
    debug!(cookies = file.cookies.len(), rejected = file.rejected_lines.len(), "parsed cookie file");
    Ok(file)
}

/// Reads and parses a cookie file into a jar.
///
/// # Errors
///
/// See [`parse_cookie_file`].
pub fn load_cookie_file(path: &Path) -> Result<Arc<Jar>, CookieFileError> {
    let reader = std::io::BufReader::new(std::fs::File::open(path)?);
    Ok(parse_cookie_file(reader)?.into_jar())
}

fn parse_line(line: &str, http_only: bool) -> Option<NetscapeCookie> {
    let mut fields = line.split('\t');
    let domain = fields.next()?.trim();
    let include_subdomains = parse_flag(fields.next()?)?;
    let path = fields.next()?;
    let secure = parse_flag(fields.next()?)?;
    let expires = fields.next()?.trim();
    let name = fields.next()?;
    // A missing value field is written by some exporters for empty values.
    let value = fields.next().unwrap_or("");
    if fields.next().is_some() || domain.is_empty() || name.is_empty() {
        return None;
    }
    let expires = match expires {
        "" | "0" => None,
        secs => Some(secs.parse::<u64>().ok()?),
    };
    Some(NetscapeCookie {
        domain: domain.to_string(),
        include_subdomains,
        path: if path.is_empty() { "/".to_string() } else { path.to_string() },
        secure,
        expires,
        http_only,
        name: name.to_string(),
        value: value.to_string(),
    })
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_uppercase().as_str() {
        "TRUE" => Some(true),
        "FALSE" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::Cursor;

    use reqwest::cookie::CookieStore;

    use super::*;

    fn parse(input: &str) -> Result<CookieFile, CookieFileError> {
        parse_cookie_file(Cursor::new(input.as_bytes()))
    }

    #[test]
    fn test_parses_http_only_and_comments() {
        let file = parse(
            "# Netscape HTTP Cookie File\n\
             \n\
             .example.com\tTRUE\t/\tFALSE\t0\tsid\tabc\n\
             #HttpOnly_.example.com\tTRUE\t/\tTRUE\t9999999999\ttoken\txyz\r\n",
        )
        .unwrap();
        assert_eq!(file.cookies.len(), 2);
        assert!(!file.cookies[0].http_only);
        assert!(file.cookies[0].expires.is_none());
        assert!(file.cookies[1].http_only);
        assert!(file.cookies[1].secure);
        assert_eq!(file.cookies[1].value(), "xyz");
    }

    #[test]
    fn test_malformed_lines_are_reported() {
        let file = parse(".ok.com\tTRUE\t/\tFALSE\t0\ta\t1\nnot a cookie\n.ok.com\tMAYBE\t/\tFALSE\t0\tb\t2\n").unwrap();
        assert_eq!(file.cookies.len(), 1);
        assert_eq!(file.rejected_lines, vec![2, 3]);
    }

    #[test]
    fn test_only_malformed_lines_is_an_error() {
        let result = parse("garbage\nmore garbage\n");
        assert!(matches!(result, Err(CookieFileError::NoValidCookies { rejected: 2 })));
        assert!(parse("# only comments\n").unwrap().cookies.is_empty());
    }

    #[test]
    fn test_missing_value_field_is_empty_value() {
        let file = parse(".example.com\tTRUE\t/\tFALSE\t0\tflag\n").unwrap();
        assert_eq!(file.cookies[0].value(), "");
    }

    #[test]
    fn test_debug_redacts_value() {
        let file = parse(".example.com\tTRUE\t/\tFALSE\t0\tsid\tsuper-secret\n").unwrap();
        let debug = format!("{:?}", file.cookies[0]);
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn test_into_jar_matches_domain_and_skips_expired() {
        let file = parse(
            ".example.com\tTRUE\t/\tFALSE\t0\tsid\tabc\n\
             .example.com\tTRUE\t/\tFALSE\t1000\told\tgone\n",
        )
        .unwrap();
        let jar = file.into_jar();

        let sub = Url::parse("http://www.example.com/page").unwrap();
        let header = jar.cookies(&sub).unwrap();
        let header = header.to_str().unwrap();
        assert!(header.contains("sid=abc"));
        assert!(!header.contains("old=gone"));

        assert!(jar.cookies(&Url::parse("http://example.org/").unwrap()).is_none());
    }

    #[test]
    fn test_load_cookie_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cookies.txt");
        std::fs::write(&path, "example.com\tFALSE\t/\tFALSE\t0\tsid\tabc\n").unwrap();
        let jar = load_cookie_file(&path).unwrap();
        assert!(jar.cookies(&Url::parse("http://example.com/").unwrap()).is_some());
    }
}
