//! Transport backends.
//!
//! A [`Backend`] executes [`Request`]s. Several may coexist behind a
//! [`crate::director::RequestDirector`], which asks each one whether it
//! [can handle](Backend::can_handle) a request before routing it there.
//! [`TransportBackend`] is the native pooled implementation.

mod transport;

pub use transport::TransportBackend;

use async_trait::async_trait;

use crate::error::TransportError;
use crate::request::Request;
use crate::response::Response;

/// Something that can execute requests.
///
/// # Object Safety
///
/// Uses `async_trait` so directors can hold `Box<dyn Backend>`.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short backend name for logs and diagnostics.
    fn name(&self) -> &str;

    /// Higher values are tried first by the director. Defaults to 0.
    fn preference(&self, _request: &Request) -> i32 {
        0
    }

    /// Returns `true` if this backend can execute `request`.
    fn can_handle(&self, request: &Request) -> bool;

    /// Executes `request`, following redirects, without retrying failures.
    async fn handle(&self, request: Request) -> Result<Response, TransportError>;
}
