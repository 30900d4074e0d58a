//! Native pooled transport backend.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::TryStreamExt;
use http::header::{ACCEPT_ENCODING, HOST, HeaderValue, PROXY_AUTHORIZATION};
use http::Method;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::Frame;
use tracing::{debug, instrument, trace, warn};
use url::{Position, Url};

use super::Backend;
use crate::config::{ConfigError, TransportConfig};
use crate::connect::Endpoint;
use crate::cookies::CookieIntegration;
use crate::error::{BoxError, TransportError};
use crate::headers::Headers;
use crate::pool::{OutgoingBody, Pool, PoolRegistry, PoolSettings, SendError};
use crate::proxy::{ProxyDescriptor, ProxyResolver};
use crate::redirect::{REDIRECT_DRAIN_LIMIT, RedirectPolicy, strip_body_headers};
use crate::request::{Body, Request};
use crate::response::{Response, supported_encodings};
use crate::tls;
use crate::translate::{Fault, translate};
use crate::user_agent::standard_headers;

const BACKEND_NAME: &str = "native";

/// Pooled HTTP/1.1 transport with proxy, SOCKS, redirect and cookie support.
///
/// One instance owns one [`PoolRegistry`]; pools live as long as the backend.
/// The backend is `Send + Sync` and is meant to be shared (e.g. in an `Arc`)
/// by every task issuing requests.
pub struct TransportBackend {
    disabled: bool,
    resolver: ProxyResolver,
    registry: PoolRegistry,
    base_headers: Headers,
    cookies: Option<CookieIntegration>,
    redirect: RedirectPolicy,
    default_timeout: Duration,
}

impl TransportBackend {
    /// Builds a backend from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the session headers or the user agent are
    /// invalid, or when the TLS context cannot be built.
    pub fn new(config: &TransportConfig) -> Result<Self, ConfigError> {
        let tls = tls::build_client_config(config.verify_certificates).map_err(ConfigError::Tls)?;
        let defaults = standard_headers(config.user_agent.as_deref())?;
        let session = config.session_headers()?;

        Ok(Self {
            disabled: config.native_transport_disabled(),
            resolver: ProxyResolver::new(config.proxy.clone(), config.env_proxies().clone()),
            registry: PoolRegistry::new(PoolSettings {
                tls,
                source_address: config.source_address,
                max_idle_per_host: config.max_idle_per_host,
            }),
            base_headers: Headers::layered(&[&defaults, &session]),
            cookies: None,
            redirect: RedirectPolicy::new(config.max_redirects),
            default_timeout: config.timeout(),
        })
    }

    /// Attaches a shared cookie store.
    #[must_use]
    pub fn with_cookies(mut self, cookies: CookieIntegration) -> Self {
        self.cookies = Some(cookies);
        self
    }

    /// The attached cookie integration, if any.
    #[must_use]
    pub fn cookies(&self) -> Option<&CookieIntegration> {
        self.cookies.as_ref()
    }

    /// Returns `true` when a compatibility flag switched this backend off.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// The pool registry of this backend.
    #[must_use]
    pub fn registry(&self) -> &PoolRegistry {
        &self.registry
    }

    /// Resolves the proxy a request would use.
    ///
    /// # Errors
    ///
    /// Returns a `Proxy` error when the proxy URL is unusable.
    pub fn resolve_proxy(&self, request: &Request) -> Result<Option<ProxyDescriptor>, TransportError> {
        self.resolve(request.proxy(), request.url())
    }

    /// The pool a request would be dispatched through.
    ///
    /// # Errors
    ///
    /// Returns a `Proxy` error when the proxy URL is unusable.
    pub fn pool_for_request(&self, request: &Request) -> Result<Arc<Pool>, TransportError> {
        self.pool_for(request.proxy(), request.url())
    }

    fn resolve(&self, proxy_override: Option<&str>, url: &Url) -> Result<Option<ProxyDescriptor>, TransportError> {
        self.resolver
            .resolve(proxy_override, url)
            .map_err(|error| translate(Fault::ProxyConfig(error), url.as_str()))
    }

    /// Pools are picked per hop: a redirect to another scheme may select a
    /// different environment proxy.
    fn pool_for(&self, proxy_override: Option<&str>, url: &Url) -> Result<Arc<Pool>, TransportError> {
        let proxy = self.resolve(proxy_override, url)?;
        Ok(self.registry.pool_for(proxy.as_ref()))
    }

    /// Executes one logical request.
    ///
    /// # Errors
    ///
    /// Returns exactly one [`TransportError`]; non-2xx final responses come
    /// back as `HttpStatus` with the response attached.
    #[instrument(skip(self, request), fields(method = %request.method(), url = %request.url()))]
    pub async fn execute(&self, request: Request) -> Result<Response, TransportError> {
        let timeout = request.timeout().unwrap_or(self.default_timeout);
        let proxy_override = request.proxy().map(str::to_string);
        let parts = request.into_parts();

        let mut headers = Headers::layered(&[&self.base_headers, &parts.headers]);
        let mut unredirected = parts.unredirected_headers;
        if !parts.compression {
            headers.remove(ACCEPT_ENCODING.as_str());
            unredirected.remove(ACCEPT_ENCODING.as_str());
        } else if !headers.contains(ACCEPT_ENCODING.as_str()) && !unredirected.contains(ACCEPT_ENCODING.as_str()) {
            let advertised = supported_encodings().join(", ");
            if let Ok(value) = HeaderValue::from_str(&advertised) {
                headers.insert(ACCEPT_ENCODING, value);
            }
        }
        trace!(headers = headers.len(), unredirected = unredirected.len(), "merged request headers");

        let mut method = parts.method;
        let mut url = parts.url;
        let mut body = parts.body;
        let mut stream_sent = false;
        let mut hops = 0usize;

        let response = loop {
            let mut hop_headers = Headers::layered(&[&headers, &unredirected]);
            if let Some(cookies) = &self.cookies {
                cookies.apply(&url, &mut hop_headers);
            }
            let outgoing = match std::mem::replace(&mut body, Body::Empty) {
                Body::Empty => empty_body(),
                Body::Bytes(bytes) => {
                    body = Body::Bytes(bytes.clone());
                    full_body(bytes)
                }
                Body::Stream(stream) => {
                    stream_sent = true;
                    StreamBody::new(stream.map_ok(Frame::data).map_err(|e| Box::new(e) as BoxError)).boxed_unsync()
                }
            };

            let pool = self.pool_for(proxy_override.as_deref(), &url)?;
            let mut response = self
                .dispatch(&pool, &method, &url, hop_headers, outgoing, timeout)
                .await?;

            let step = match RedirectPolicy::next_step(response.status(), response.headers(), &url, &method) {
                Ok(Some(step)) => step,
                Ok(None) => break response,
                Err(location) => {
                    response.close();
                    let fault = Fault::Protocol(format!("invalid redirect location: {location}"));
                    return Err(translate(fault, url.as_str()));
                }
            };

            if hops >= self.redirect.max_redirects() {
                warn!(hops, "redirect limit reached");
                self.harvest(&response);
                return Err(TransportError::redirect_loop(response, hops));
            }
            response.drain(REDIRECT_DRAIN_LIMIT).await;
            hops += 1;
            debug!(
                status = response.status().as_u16(),
                from = %url,
                to = %step.url,
                cross_origin = step.cross_origin,
                "following redirect"
            );

            if step.cross_origin && !unredirected.is_empty() {
                debug!(count = unredirected.len(), "dropping unredirected headers for cross-origin redirect");
                headers.remove_names_of(&unredirected);
                unredirected = Headers::new();
            }
            if step.keep_body {
                if stream_sent {
                    return Err(translate(Fault::UnreplayableBody, step.url.as_str()));
                }
            } else {
                body = Body::Empty;
                strip_body_headers(&mut headers);
                strip_body_headers(&mut unredirected);
            }
            method = step.method;
            url = step.url;
        };

        self.harvest(&response);
        if !response.status().is_success() {
            debug!(status = response.status().as_u16(), "non-success status; connection will not be reused");
            return Err(TransportError::http_status(response));
        }
        Ok(response)
    }

    fn harvest(&self, response: &Response) {
        if let Some(cookies) = &self.cookies {
            cookies.harvest(response.url(), response.headers());
        }
    }

    /// One physical exchange: lease a connection, write the request, read the
    /// response head.
    async fn dispatch(
        &self,
        pool: &Arc<Pool>,
        method: &Method,
        url: &Url,
        headers: Headers,
        body: OutgoingBody,
        timeout: Duration,
    ) -> Result<Response, TransportError> {
        let endpoint = Endpoint::from_url(url).ok_or_else(|| {
            translate(
                Fault::Protocol(format!("unsupported URL: {url}")),
                url.as_str(),
            )
        })?;
        let mut lease = pool
            .checkout(&endpoint, timeout)
            .await
            .map_err(|fault| translate(fault, url.as_str()))?;
        let mut request = build_request(
            method,
            url,
            headers,
            body,
            lease.absolute_form(),
            pool.proxy_authorization(),
        )
        .map_err(|fault| translate(fault, url.as_str()))?;

        loop {
            match tokio::time::timeout(timeout, lease.send(request)).await {
                Err(_) => {
                    lease.discard();
                    return Err(translate(Fault::ReadTimeout, url.as_str()));
                }
                Ok(Ok(head)) => {
                    let (parts, incoming) = head.into_parts();
                    trace!(
                        conn_id = ?lease.id(),
                        reused = lease.is_reused(),
                        status = parts.status.as_u16(),
                        "received response head"
                    );
                    let head_request = *method == Method::HEAD;
                    return Ok(Response::new(parts, incoming, url.clone(), lease, timeout, head_request));
                }
                Ok(Err(SendError::Unsent(returned))) => {
                    debug!(conn_id = ?lease.id(), "idle connection went stale before the request was written");
                    lease.discard();
                    request = returned;
                    lease = pool
                        .checkout(&endpoint, timeout)
                        .await
                        .map_err(|fault| translate(fault, url.as_str()))?;
                }
                Ok(Err(SendError::Failed(error))) => {
                    lease.discard();
                    return Err(translate(Fault::Send(error), url.as_str()));
                }
            }
        }
    }
}

#[async_trait]
impl Backend for TransportBackend {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    fn can_handle(&self, request: &Request) -> bool {
        !self.disabled && matches!(request.url().scheme(), "http" | "https")
    }

    async fn handle(&self, request: Request) -> Result<Response, TransportError> {
        self.execute(request).await
    }
}

fn empty_body() -> OutgoingBody {
    Empty::<Bytes>::new()
        .map_err(|never: Infallible| -> BoxError { match never {} })
        .boxed_unsync()
}

fn full_body(bytes: Bytes) -> OutgoingBody {
    Full::new(bytes)
        .map_err(|never: Infallible| -> BoxError { match never {} })
        .boxed_unsync()
}

/// `Host` value: host plus the port when it is not the scheme default.
fn host_header(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

fn build_request(
    method: &Method,
    url: &Url,
    headers: Headers,
    body: OutgoingBody,
    absolute_form: bool,
    proxy_authorization: Option<HeaderValue>,
) -> Result<http::Request<OutgoingBody>, Fault> {
    let target = if absolute_form {
        &url[..Position::AfterQuery]
    } else {
        match &url[Position::BeforePath..Position::AfterQuery] {
            "" => "/",
            path => path,
        }
    };
    let mut request = http::Request::builder()
        .method(method.clone())
        .uri(target)
        .body(body)
        .map_err(|error| Fault::Protocol(format!("invalid request target: {error}")))?;

    let map = request.headers_mut();
    *map = headers.into_map();
    let host = host_header(url).ok_or_else(|| Fault::Protocol(format!("URL has no host: {url}")))?;
    let host = HeaderValue::from_str(&host).map_err(|_| Fault::Protocol(format!("invalid host: {host}")))?;
    map.insert(HOST, host);
    if absolute_form
        && let Some(value) = proxy_authorization
        && !map.contains_key(PROXY_AUTHORIZATION)
    {
        map.insert(PROXY_AUTHORIZATION, value);
    }
    Ok(request)
}
