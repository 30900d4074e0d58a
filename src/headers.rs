//! Case-insensitive, insertion-ordered, multi-value header collection.
//!
//! [`Headers`] keeps typed [`http`] name/value pairs in order and adds the layered merge used to
//! resolve header precedence: process-wide defaults < per-session headers <
//! per-request headers < unredirected headers. A later layer replaces every
//! value of a name it defines; names it does not define are left untouched.

use http::header::{HeaderMap, HeaderName, HeaderValue};

/// Errors produced when a header name or value is not valid HTTP.
#[derive(Debug, thiserror::Error)]
pub enum HeaderError {
    /// The header name contains characters not allowed in a token.
    #[error("invalid header name: {name}")]
    InvalidName {
        /// The rejected name.
        name: String,
    },

    /// The header value contains control characters.
    #[error("invalid value for header {name}")]
    InvalidValue {
        /// Name of the header whose value was rejected.
        name: String,
    },
}

/// Ordered multi-value header collection with case-insensitive names.
///
/// Pairs are kept in insertion order; [`HeaderName`] is already lowercase, so
/// name comparison is a plain equality check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(HeaderName, HeaderValue)>,
}

impl Headers {
    /// Creates an empty header collection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a name/value pair into typed header parts.
    ///
    /// # Errors
    ///
    /// Returns [`HeaderError`] when the name or value is not valid HTTP.
    pub fn parse_pair(name: &str, value: &str) -> Result<(HeaderName, HeaderValue), HeaderError> {
        let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| HeaderError::InvalidName {
            name: name.to_string(),
        })?;
        let header_value = HeaderValue::from_str(value).map_err(|_| HeaderError::InvalidValue {
            name: name.to_string(),
        })?;
        Ok((header_name, header_value))
    }

    /// Replaces all values of `name` with `value`.
    ///
    /// An existing name keeps its position; a new one goes last.
    pub fn insert(&mut self, name: HeaderName, value: HeaderValue) {
        self.replace_values(&name, std::slice::from_ref(&value));
    }

    /// Adds `value` to `name`, keeping existing values.
    pub fn append(&mut self, name: HeaderName, value: HeaderValue) {
        self.entries.push((name, value));
    }

    /// Replaces all values of `name`, parsing both parts.
    ///
    /// # Errors
    ///
    /// Returns [`HeaderError`] when the name or value is not valid HTTP.
    pub fn insert_str(&mut self, name: &str, value: &str) -> Result<(), HeaderError> {
        let (name, value) = Self::parse_pair(name, value)?;
        self.insert(name, value);
        Ok(())
    }

    /// Removes every value of `name`, returning whether anything was removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(n, _)| !matches_name(n, name));
        self.entries.len() != before
    }

    /// Returns `true` if at least one value exists for `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| matches_name(n, name))
    }

    /// Returns the first value of `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&HeaderValue> {
        self.get_all(name).next()
    }

    /// Returns the first value of `name` if it is visible ASCII.
    #[must_use]
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| v.to_str().ok())
    }

    /// Iterates over every value of `name`.
    pub fn get_all<'a, 'n>(&'a self, name: &'n str) -> impl Iterator<Item = &'a HeaderValue> + use<'a, 'n> {
        self.entries
            .iter()
            .filter(move |(n, _)| matches_name(n, name))
            .map(|(_, v)| v)
    }

    /// Iterates over all `(name, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&HeaderName, &HeaderValue)> {
        self.entries.iter().map(|(n, v)| (n, v))
    }

    /// Iterates over the distinct header names in order of first appearance.
    pub fn names(&self) -> impl Iterator<Item = &HeaderName> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(i, (n, _))| !self.entries[..*i].iter().any(|(seen, _)| seen == n))
            .map(|(_, (n, _))| n)
    }

    /// Number of stored values (a name with two values counts twice).
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when no header is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Layers `other` on top of `self`: every name present in `other`
    /// replaces all of its values here, in the position the name already had.
    pub fn merge_from(&mut self, other: &Headers) {
        for name in other.names() {
            let values: Vec<HeaderValue> = other
                .entries
                .iter()
                .filter(|(n, _)| n == name)
                .map(|(_, v)| v.clone())
                .collect();
            self.replace_values(name, &values);
        }
    }

    /// Builds one collection from layers ordered lowest to highest precedence.
    #[must_use]
    pub fn layered(layers: &[&Headers]) -> Self {
        let mut merged = Self::new();
        for layer in layers {
            merged.merge_from(layer);
        }
        merged
    }

    /// Removes every name that appears in `other`.
    pub fn remove_names_of(&mut self, other: &Headers) {
        self.entries.retain(|(n, _)| !other.entries.iter().any(|(o, _)| o == n));
    }

    /// Consumes the collection, returning an [`HeaderMap`] filled in order.
    #[must_use]
    pub fn into_map(self) -> HeaderMap {
        let mut map = HeaderMap::with_capacity(self.entries.len());
        for (name, value) in self.entries {
            map.append(name, value);
        }
        map
    }

    fn replace_values(&mut self, name: &HeaderName, values: &[HeaderValue]) {
        let Some(position) = self.entries.iter().position(|(n, _)| n == name) else {
            self.entries
                .extend(values.iter().map(|v| (name.clone(), v.clone())));
            return;
        };
        self.entries.retain(|(n, _)| n != name);
        let tail = self.entries.split_off(position);
        self.entries
            .extend(values.iter().map(|v| (name.clone(), v.clone())));
        self.entries.extend(tail);
    }
}

fn matches_name(name: &HeaderName, wanted: &str) -> bool {
    name.as_str().eq_ignore_ascii_case(wanted)
}

impl From<HeaderMap> for Headers {
    fn from(map: HeaderMap) -> Self {
        let entries = map.iter().map(|(n, v)| (n.clone(), v.clone())).collect();
        Self { entries }
    }
}
