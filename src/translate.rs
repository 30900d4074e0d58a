//! Error Translator: raw transport faults to [`TransportError`].
//!
//! Every place where hyper, rustls, tokio I/O, the SOCKS handshake or the
//! content decoders can fail produces a [`Fault`]. [`translate`] is the single,
//! exhaustive mapping from those faults to the public taxonomy, so no native
//! error type reaches callers except as a `source()`.

use std::error::Error as StdError;
use std::io;

use crate::error::{BoxError, TransportError};
use crate::proxy::ProxyError;
use crate::socks::SocksError;

/// A raw failure observed while executing one request.
#[derive(Debug)]
pub(crate) enum Fault {
    /// The connect phase (TCP + proxy handshake + TLS) exceeded the timeout.
    ConnectTimeout,
    /// The response head or a body chunk did not arrive within the timeout.
    ReadTimeout,
    /// TCP connection to the origin or proxy could not be opened.
    Connect(io::Error),
    /// TLS handshake with the origin or an HTTPS proxy failed.
    Tls(io::Error),
    /// An HTTP proxy could not be reached or dropped the CONNECT exchange.
    ProxyConnect(io::Error),
    /// An HTTP proxy answered CONNECT with a non-2xx status.
    ProxyRejected { status: u16 },
    /// The configured proxy URL is unusable.
    ProxyConfig(ProxyError),
    /// SOCKS negotiation failed.
    Socks(SocksError),
    /// hyper failed while writing the request or reading the response head.
    Send(hyper::Error),
    /// hyper failed while reading the response body.
    Body {
        error: hyper::Error,
        received: u64,
        expected: Option<u64>,
    },
    /// The body ended cleanly but short of its declared length.
    Truncated { received: u64, expected: Option<u64> },
    /// Content decoding failed.
    Decode(io::Error),
    /// A redirect needs the request body again but it was a one-shot stream.
    UnreplayableBody,
    /// Malformed request or redirect data detected locally.
    Protocol(String),
}

/// Maps one raw fault to exactly one [`TransportError`].
pub(crate) fn translate(fault: Fault, url: &str) -> TransportError {
    match fault {
        Fault::ConnectTimeout => TransportError::connect_timeout(url, None),
        Fault::ReadTimeout => TransportError::read_timeout(url, None),
        Fault::Connect(error) => {
            if error.kind() == io::ErrorKind::TimedOut {
                TransportError::connect_timeout(url, Some(Box::new(error)))
            } else {
                let message = format!("failed to establish a new connection: {error}");
                TransportError::transport(url, message, Some(Box::new(error)))
            }
        }
        Fault::Tls(error) => {
            let message = find_rustls_error(&error).map_or_else(|| error.to_string(), ToString::to_string);
            TransportError::tls(url, message, Some(Box::new(error)))
        }
        Fault::ProxyConnect(error) => {
            if error.kind() == io::ErrorKind::TimedOut {
                TransportError::connect_timeout(url, Some(Box::new(error)))
            } else {
                let message = format!("unable to connect to proxy: {error}");
                TransportError::proxy(url, message, Some(Box::new(error)))
            }
        }
        Fault::ProxyRejected { status } => {
            TransportError::proxy(url, format!("tunnel connection failed: {status}"), None)
        }
        Fault::ProxyConfig(error) => {
            let message = error.to_string();
            TransportError::proxy(url, message, Some(Box::new(error)))
        }
        Fault::Socks(error) => translate_socks(error, url),
        Fault::Send(error) => {
            if error.is_timeout() {
                TransportError::read_timeout(url, Some(Box::new(error)))
            } else if find_rustls_error(&error).is_some() {
                let message = error.to_string();
                TransportError::tls(url, message, Some(Box::new(error)))
            } else {
                let message = error.to_string();
                TransportError::transport(url, message, Some(Box::new(error)))
            }
        }
        Fault::Body {
            error,
            received,
            expected,
        } => {
            if error.is_timeout() {
                TransportError::read_timeout(url, Some(Box::new(error)))
            } else if find_rustls_error(&error).is_some() {
                let message = error.to_string();
                TransportError::tls(url, message, Some(Box::new(error)))
            } else if error.is_incomplete_message() || expected.is_some_and(|total| received < total) {
                TransportError::incomplete_read(url, received, expected, Some(Box::new(error)))
            } else {
                let message = error.to_string();
                TransportError::transport(url, message, Some(Box::new(error)))
            }
        }
        Fault::Truncated { received, expected } => {
            TransportError::incomplete_read(url, received, expected, None)
        }
        Fault::Decode(error) => {
            let message = format!("failed to decode response body: {error}");
            TransportError::transport(url, message, Some(Box::new(error)))
        }
        Fault::UnreplayableBody => TransportError::transport(
            url,
            "redirect requires resending a streamed request body",
            None,
        ),
        Fault::Protocol(message) => TransportError::transport(url, message, None),
    }
}

fn translate_socks(error: SocksError, url: &str) -> TransportError {
    match error {
        SocksError::Io(io) if io.kind() == io::ErrorKind::TimedOut => {
            TransportError::connect_timeout(url, Some(Box::new(io)))
        }
        SocksError::Io(io) if io.kind() != io::ErrorKind::UnexpectedEof => {
            let message = format!("failed to establish a new connection: {io}");
            TransportError::transport(url, message, Some(Box::new(io)))
        }
        resolve @ SocksError::Resolve { .. } => {
            let message = format!("failed to establish a new connection: {resolve}");
            TransportError::transport(url, message, Some(Box::new(resolve)))
        }
        other => {
            let message = other.to_string();
            TransportError::proxy(url, message, Some(Box::new(other) as BoxError))
        }
    }
}

/// Finds a rustls error anywhere in the cause chain, looking inside
/// `io::Error` wrappers that hide their payload from `source()`.
fn find_rustls_error<'a>(error: &'a (dyn StdError + 'static)) -> Option<&'a rustls::Error> {
    let mut current = Some(error);
    while let Some(err) = current {
        if let Some(tls) = err.downcast_ref::<rustls::Error>() {
            return Some(tls);
        }
        if let Some(inner) = err
            .downcast_ref::<io::Error>()
            .and_then(io::Error::get_ref)
            .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        {
            return Some(inner);
        }
        current = err.source();
    }
    None
}
