//! Request director: routes each request to a capable backend.
//!
//! The [`RequestDirector`] holds every registered [`Backend`]. For each request
//! it keeps the backends whose [`can_handle`](Backend::can_handle) accepts it,
//! orders them by [`preference`](Backend::preference) (highest first, then
//! registration order) and hands the request to the first one. Failures are
//! returned as-is; the director never retries on another backend because the
//! request body may already be consumed.

use std::cmp::Reverse;

use thiserror::Error;
use tracing::{debug, info};

use crate::backend::Backend;
use crate::error::TransportError;
use crate::request::Request;
use crate::response::Response;

/// Errors raised by [`RequestDirector::send`].
#[derive(Debug, Error)]
pub enum DirectorError {
    /// No registered backend accepts the request.
    #[error("no backend can handle {url}")]
    NoBackend {
        /// The request URL.
        url: String,
    },

    /// The selected backend failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl DirectorError {
    /// The transport error, if a backend was selected.
    #[must_use]
    pub fn as_transport(&self) -> Option<&TransportError> {
        match self {
            Self::Transport(error) => Some(error),
            Self::NoBackend { .. } => None,
        }
    }
}

/// Backend collection with preference-ordered dispatch.
#[derive(Default)]
pub struct RequestDirector {
    backends: Vec<Box<dyn Backend>>,
}

impl RequestDirector {
    /// Creates an empty director.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a backend.
    #[tracing::instrument(skip(self, backend), fields(backend_name))]
    pub fn register(&mut self, backend: Box<dyn Backend>) {
        tracing::Span::current().record("backend_name", backend.name());
        debug!(name = backend.name(), "Registering backend");
        self.backends.push(backend);
    }

    /// Number of registered backends.
    #[must_use]
    pub fn backend_count(&self) -> usize {
        self.backends.len()
    }

    /// Returns true if no backends are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Backends able to handle `request`, most preferred first.
    #[must_use]
    pub fn find_handlers(&self, request: &Request) -> Vec<&dyn Backend> {
        let mut handlers: Vec<&dyn Backend> = self
            .backends
            .iter()
            .filter(|backend| backend.can_handle(request))
            .map(AsRef::as_ref)
            .collect();
        handlers.sort_by_key(|backend| Reverse(backend.preference(request)));
        handlers
    }

    /// Sends `request` through the most preferred capable backend.
    ///
    /// # Errors
    ///
    /// Returns [`DirectorError::NoBackend`] when nothing accepts the request,
    /// otherwise the backend's [`TransportError`].
    #[tracing::instrument(skip(self, request), fields(url = %request.url()))]
    pub async fn send(&self, request: Request) -> Result<Response, DirectorError> {
        let Some(backend) = self.find_handlers(&request).into_iter().next() else {
            return Err(DirectorError::NoBackend {
                url: request.url().to_string(),
            });
        };
        info!(backend = backend.name(), method = %request.method(), "Dispatching request");
        Ok(backend.handle(request).await?)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;

    struct MockBackend {
        name: &'static str,
        preference: i32,
        scheme: &'static str,
        calls: AtomicUsize,
        seen: Mutex<Vec<String>>,
    }

    impl MockBackend {
        fn new(name: &'static str, preference: i32, scheme: &'static str) -> Self {
            Self {
                name,
                preference,
                scheme,
                calls: AtomicUsize::new(0),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Backend for MockBackend {
        fn name(&self) -> &str {
            self.name
        }

        fn preference(&self, _request: &Request) -> i32 {
            self.preference
        }

        fn can_handle(&self, request: &Request) -> bool {
            request.url().scheme() == self.scheme
        }

        async fn handle(&self, request: Request) -> Result<Response, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(request.url().to_string());
            Err(TransportError::transport(request.url().as_str(), self.name, None))
        }
    }

    fn director(backends: Vec<MockBackend>) -> RequestDirector {
        let mut director = RequestDirector::new();
        for backend in backends {
            director.register(Box::new(backend));
        }
        director
    }

    fn failing_backend_name(error: &DirectorError) -> String {
        error.as_transport().unwrap().to_string()
    }

    #[test]
    fn test_empty_director() {
        let director = RequestDirector::new();
        assert!(director.is_empty());
        assert_eq!(director.backend_count(), 0);
    }

    #[test]
    fn test_find_handlers_orders_by_preference_then_registration() {
        let director = director(vec![
            MockBackend::new("low", -1, "https"),
            MockBackend::new("first", 5, "https"),
            MockBackend::new("second", 5, "https"),
            MockBackend::new("other-scheme", 100, "ftp"),
        ]);
        let request = Request::get("https://example.com/").build().unwrap();
        let names: Vec<&str> = director.find_handlers(&request).iter().map(|b| b.name()).collect();
        assert_eq!(names, vec!["first", "second", "low"]);
    }

    #[tokio::test]
    async fn test_send_uses_most_preferred_backend() {
        let director = director(vec![MockBackend::new("fallback", 0, "https"), MockBackend::new("preferred", 10, "https")]);
        let request = Request::get("https://example.com/x").build().unwrap();
        let error = director.send(request).await.unwrap_err();
        assert!(failing_backend_name(&error).contains("preferred"));
    }

    #[tokio::test]
    async fn test_send_without_capable_backend() {
        let director = director(vec![MockBackend::new("web", 0, "https")]);
        let request = Request::get("ftp://example.com/file").build().unwrap();
        let error = director.send(request).await.unwrap_err();
        assert!(matches!(error, DirectorError::NoBackend { ref url } if url == "ftp://example.com/file"));
        assert!(error.as_transport().is_none());
    }
}
