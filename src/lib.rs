//! Fetchcore HTTP Transport Library
//!
//! An HTTP/1.1 client core that executes requests over pooled connections,
//! optionally through HTTP(S) or SOCKS proxies, follows redirects, keeps a
//! shared cookie store in sync, and reports every failure as exactly one
//! [`TransportError`].
//!
//! # Architecture
//!
//! - [`request`] / [`response`] - the request model and streaming responses
//! - [`headers`] - case-insensitive header sets with layered merging
//! - [`proxy`] - proxy URL parsing and per-request proxy resolution
//! - [`pool`] - one connection pool per proxy identity
//! - [`socks`] - SOCKS4/4a/5 client handshakes
//! - [`redirect`] - redirect planning and method rewriting
//! - [`cookies`] - cookie store integration and Netscape cookie files
//! - [`backend`] - the [`Backend`] trait and the native [`TransportBackend`]
//! - [`director`] - routes requests to the preferred capable backend
//! - [`config`] - backend configuration from files and the environment

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod config;
pub mod connect;
pub mod cookies;
pub mod director;
pub mod error;
pub mod headers;
pub mod pool;
pub mod proxy;
pub mod redirect;
pub mod request;
pub mod response;
pub mod socks;
pub mod tls;
pub mod user_agent;

mod translate;

// Re-export commonly used types
pub use backend::{Backend, TransportBackend};
pub use config::{COMPAT_NO_NATIVE_TRANSPORT, ConfigError, EnvProxies, TransportConfig};
pub use cookies::{CookieIntegration, load_cookie_file};
pub use director::{DirectorError, RequestDirector};
pub use error::{ErrorKind, TransportError};
pub use headers::{HeaderError, Headers};
pub use pool::{Pool, PoolRegistry, PoolStats};
pub use proxy::{ProxyDescriptor, ProxyError, ProxyResolver, ProxyScheme};
pub use request::{Body, Request, RequestBuilder, RequestError};
pub use response::{Response, supported_encodings};
