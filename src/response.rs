//! Normalized response with a lazily read, bounded body.
//!
//! The body is pulled from the connection frame by frame, each frame under the
//! request timeout. Reaching the end of the body returns the connection to its
//! pool; any failure, an explicit [`Response::close`] before the end, or
//! dropping the response closes it instead.

use std::fmt;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http::{StatusCode, Version};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use url::Url;

use crate::error::TransportError;
use crate::headers::Headers;
use crate::pool::ConnectionLease;
use crate::translate::{Fault, translate};

#[cfg(feature = "brotli")]
const SUPPORTED_ENCODINGS: &[&str] = &["gzip", "deflate", "br"];
#[cfg(not(feature = "brotli"))]
const SUPPORTED_ENCODINGS: &[&str] = &["gzip", "deflate"];

/// Content codings this build can decode, in advertisement order.
#[must_use]
pub fn supported_encodings() -> &'static [&'static str] {
    SUPPORTED_ENCODINGS
}

/// Response to one logical request (after redirects).
pub struct Response {
    status: StatusCode,
    version: Version,
    headers: Headers,
    url: Url,
    peer_addr: Option<SocketAddr>,
    body: BodyState,
}

struct BodyState {
    incoming: Option<Incoming>,
    decoder: ContentDecoder,
    pending: BytesMut,
    received: u64,
    expected: Option<u64>,
    delivered: u64,
    timeout: Duration,
    lease: Option<ConnectionLease>,
    eof: bool,
}

impl Response {
    pub(crate) fn new(
        head: http::response::Parts,
        incoming: Incoming,
        url: Url,
        lease: ConnectionLease,
        timeout: Duration,
        head_request: bool,
    ) -> Self {
        let headers = Headers::from(head.headers);
        let bodiless = head_request
            || head.status.is_informational()
            || head.status == StatusCode::NO_CONTENT
            || head.status == StatusCode::NOT_MODIFIED;
        let expected = if bodiless {
            None
        } else {
            headers
                .get_str(http::header::CONTENT_LENGTH.as_str())
                .and_then(|v| v.trim().parse::<u64>().ok())
        };
        let decoder = if bodiless {
            ContentDecoder::Identity
        } else {
            ContentDecoder::for_encoding(headers.get_str(http::header::CONTENT_ENCODING.as_str()))
        };

        Self {
            status: head.status,
            version: head.version,
            headers,
            url,
            peer_addr: lease.peer_addr(),
            body: BodyState {
                incoming: Some(incoming),
                decoder,
                pending: BytesMut::new(),
                received: 0,
                expected,
                delivered: 0,
                timeout,
                lease: Some(lease),
                eof: false,
            },
        }
    }

    /// Status code.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// HTTP protocol version.
    #[must_use]
    pub fn version(&self) -> Version {
        self.version
    }

    /// Response headers.
    #[must_use]
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Final URL served, after redirects.
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Remote address of the connection that served the response. For
    /// proxied requests this is the proxy.
    #[must_use]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Declared body length (`Content-Length`), if any.
    #[must_use]
    pub fn content_length(&self) -> Option<u64> {
        self.body.expected
    }

    /// Raw (still encoded) body bytes received from the connection so far.
    #[must_use]
    pub fn bytes_read(&self) -> u64 {
        self.body.received
    }

    /// Decoded bytes handed to the caller so far.
    #[must_use]
    pub fn bytes_delivered(&self) -> u64 {
        self.body.delivered
    }

    /// Returns `true` once the body has been fully read or the response closed.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.body.eof && self.body.pending.is_empty()
    }

    /// Reads up to `max` decoded bytes. An empty result means end of body.
    ///
    /// # Errors
    ///
    /// Returns `ReadTimeout` when a chunk does not arrive within the timeout,
    /// `IncompleteRead` when the body ends short of its declared length, and
    /// `Transport`/`Tls` for other failures. The connection is closed on error.
    pub async fn read(&mut self, max: usize) -> Result<Bytes, TransportError> {
        if max == 0 {
            return Ok(Bytes::new());
        }
        while self.body.pending.is_empty() && !self.body.eof {
            self.fill().await?;
        }
        let n = max.min(self.body.pending.len());
        self.body.delivered += n as u64;
        Ok(self.body.pending.split_to(n).freeze())
    }

    /// Reads the rest of the body.
    ///
    /// # Errors
    ///
    /// Same as [`read`](Self::read).
    pub async fn read_to_end(&mut self) -> Result<Bytes, TransportError> {
        while !self.body.eof {
            self.fill().await?;
        }
        let rest = self.body.pending.split().freeze();
        self.body.delivered += rest.len() as u64;
        Ok(rest)
    }

    /// Stops reading. An unfinished body closes the connection; a finished
    /// one has already been returned to the pool.
    pub fn close(&mut self) {
        self.body.incoming = None;
        self.body.eof = true;
        self.body.pending.clear();
        if let Some(mut lease) = self.body.lease.take() {
            lease.discard();
        }
    }

    /// Prevents the connection from going back to the idle set.
    pub fn mark_discard(&mut self) {
        if let Some(lease) = self.body.lease.as_mut() {
            lease.mark_discard();
        }
    }

    /// Consumes a redirect body so its connection can be reused, giving up
    /// (and closing the connection) past `limit` raw bytes or on any error.
    pub(crate) async fn drain(&mut self, limit: u64) {
        while !self.body.eof {
            if self.body.received > limit {
                self.close();
                return;
            }
            if self.fill().await.is_err() {
                return;
            }
            self.body.pending.clear();
        }
    }

    async fn fill(&mut self) -> Result<(), TransportError> {
        let Some(incoming) = self.body.incoming.as_mut() else {
            return self.finish();
        };
        match tokio::time::timeout(self.body.timeout, incoming.frame()).await {
            Err(_) => Err(self.fail(Fault::ReadTimeout)),
            Ok(None) => self.finish(),
            Ok(Some(Err(error))) => {
                let fault = Fault::Body {
                    error,
                    received: self.body.received,
                    expected: self.body.expected,
                };
                Err(self.fail(fault))
            }
            Ok(Some(Ok(frame))) => {
                if let Ok(data) = frame.into_data() {
                    self.body.received += data.len() as u64;
                    if let Err(error) = self.body.decoder.push(&data, &mut self.body.pending) {
                        return Err(self.fail(Fault::Decode(error)));
                    }
                }
                Ok(())
            }
        }
    }

    fn finish(&mut self) -> Result<(), TransportError> {
        self.body.incoming = None;
        if let Some(expected) = self.body.expected
            && self.body.received < expected
        {
            let fault = Fault::Truncated {
                received: self.body.received,
                expected: Some(expected),
            };
            return Err(self.fail(fault));
        }
        if let Err(error) = self.body.decoder.finish(&mut self.body.pending) {
            return Err(self.fail(Fault::Decode(error)));
        }
        self.body.eof = true;
        if let Some(mut lease) = self.body.lease.take() {
            lease.release();
        }
        Ok(())
    }

    fn fail(&mut self, fault: Fault) -> TransportError {
        self.body.incoming = None;
        self.body.eof = true;
        if let Some(mut lease) = self.body.lease.take() {
            lease.discard();
        }
        translate(fault, self.url.as_str())
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("version", &self.version)
            .field("url", &self.url.as_str())
            .field("headers", &self.headers.len())
            .field("received", &self.body.received)
            .field("expected", &self.body.expected)
            .finish_non_exhaustive()
    }
}

/// Incremental decoder for the response `Content-Encoding`.
enum ContentDecoder {
    Identity,
    Gzip(flate2::write::GzDecoder<Vec<u8>>),
    Deflate(DeflateDecoder),
    #[cfg(feature = "brotli")]
    Brotli(BrotliDecoder),
}

impl ContentDecoder {
    /// Unknown or stacked codings are passed through undecoded.
    fn for_encoding(encoding: Option<&str>) -> Self {
        match encoding.map(|e| e.trim().to_ascii_lowercase()).as_deref() {
            Some("gzip" | "x-gzip") => Self::Gzip(flate2::write::GzDecoder::new(Vec::new())),
            Some("deflate") => Self::Deflate(DeflateDecoder::default()),
            #[cfg(feature = "brotli")]
            Some("br") => Self::Brotli(BrotliDecoder::new()),
            _ => Self::Identity,
        }
    }

    fn push(&mut self, data: &[u8], out: &mut BytesMut) -> io::Result<()> {
        match self {
            Self::Identity => out.extend_from_slice(data),
            Self::Gzip(decoder) => {
                decoder.write_all(data)?;
                out.extend_from_slice(decoder.get_ref());
                decoder.get_mut().clear();
            }
            Self::Deflate(decoder) => decoder.push(data, out)?,
            #[cfg(feature = "brotli")]
            Self::Brotli(decoder) => decoder.push(data, out)?,
        }
        Ok(())
    }

    fn finish(&mut self, out: &mut BytesMut) -> io::Result<()> {
        match self {
            Self::Identity => {}
            Self::Gzip(decoder) => {
                decoder.try_finish()?;
                out.extend_from_slice(decoder.get_ref());
                decoder.get_mut().clear();
            }
            Self::Deflate(decoder) => decoder.finish(out)?,
            #[cfg(feature = "brotli")]
            Self::Brotli(decoder) => decoder.finish(out)?,
        }
        Ok(())
    }
}

/// `deflate` is sent both zlib-wrapped and raw; the first two bytes decide.
#[derive(Default)]
struct DeflateDecoder {
    head: Vec<u8>,
    inner: Option<DeflateInner>,
}

enum DeflateInner {
    Zlib(flate2::write::ZlibDecoder<Vec<u8>>),
    Raw(flate2::write::DeflateDecoder<Vec<u8>>),
}

impl DeflateDecoder {
    fn push(&mut self, data: &[u8], out: &mut BytesMut) -> io::Result<()> {
        if self.inner.is_none() {
            self.head.extend_from_slice(data);
            if self.head.len() < 2 {
                return Ok(());
            }
            let head = std::mem::take(&mut self.head);
            self.inner = Some(Self::select(&head));
            return self.write(&head, out);
        }
        self.write(data, out)
    }

    fn select(head: &[u8]) -> DeflateInner {
        let cmf = u16::from(head[0]);
        let flg = u16::from(head[1]);
        if cmf & 0x0f == 8 && (cmf * 256 + flg) % 31 == 0 {
            DeflateInner::Zlib(flate2::write::ZlibDecoder::new(Vec::new()))
        } else {
            DeflateInner::Raw(flate2::write::DeflateDecoder::new(Vec::new()))
        }
    }

    fn write(&mut self, data: &[u8], out: &mut BytesMut) -> io::Result<()> {
        match self.inner.as_mut() {
            Some(DeflateInner::Zlib(decoder)) => {
                decoder.write_all(data)?;
                out.extend_from_slice(decoder.get_ref());
                decoder.get_mut().clear();
            }
            Some(DeflateInner::Raw(decoder)) => {
                decoder.write_all(data)?;
                out.extend_from_slice(decoder.get_ref());
                decoder.get_mut().clear();
            }
            None => {}
        }
        Ok(())
    }

    fn finish(&mut self, out: &mut BytesMut) -> io::Result<()> {
        if self.inner.is_none() {
            if self.head.is_empty() {
                return Ok(());
            }
            let head = std::mem::take(&mut self.head);
            self.inner = Some(Self::select(&[head[0], 0]));
            self.write(&head, out)?;
        }
        match self.inner.as_mut() {
            Some(DeflateInner::Zlib(decoder)) => {
                decoder.try_finish()?;
                out.extend_from_slice(decoder.get_ref());
                decoder.get_mut().clear();
            }
            Some(DeflateInner::Raw(decoder)) => {
                decoder.try_finish()?;
                out.extend_from_slice(decoder.get_ref());
                decoder.get_mut().clear();
            }
            None => {}
        }
        Ok(())
    }
}

#[cfg(feature = "brotli")]
struct BrotliDecoder {
    sink: std::sync::Arc<std::sync::Mutex<Vec<u8>>>,
    writer: Option<Box<brotli::DecompressorWriter<SharedSink>>>,
}

#[cfg(feature = "brotli")]
struct SharedSink(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

#[cfg(feature = "brotli")]
impl Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(feature = "brotli")]
impl BrotliDecoder {
    fn new() -> Self {
        let sink = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let writer = brotli::DecompressorWriter::new(SharedSink(std::sync::Arc::clone(&sink)), 4096);
        Self {
            sink,
            writer: Some(Box::new(writer)),
        }
    }

    fn drain_sink(&self, out: &mut BytesMut) {
        let mut buf = self.sink.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        out.extend_from_slice(&buf);
        buf.clear();
    }

    fn push(&mut self, data: &[u8], out: &mut BytesMut) -> io::Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.write_all(data)?;
        }
        self.drain_sink(out);
        Ok(())
    }

    fn finish(&mut self, out: &mut BytesMut) -> io::Result<()> {
        if let Some(writer) = self.writer.take() {
            writer
                .into_inner()
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "truncated brotli stream"))?;
        }
        self.drain_sink(out);
        Ok(())
    }
}
