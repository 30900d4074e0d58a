//! Connection pools and the per-proxy pool registry.
//!
//! A [`PoolRegistry`] holds one [`Pool`] per proxy identity, created lazily on
//! first use and kept for the registry's lifetime. A pool keeps idle HTTP/1.1
//! connections per [`Endpoint`] and hands them out as [`ConnectionLease`]s. A
//! lease returns its connection exactly once: to the idle set on
//! [`release`](ConnectionLease::release), or closed on
//! [`discard`](ConnectionLease::discard) / drop.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use http_body_util::combinators::UnsyncBoxBody;
use hyper::body::Incoming;
use hyper::client::conn::http1::{self, SendRequest};
use hyper_util::rt::TokioIo;
use rustls::ClientConfig;
use tokio::task::AbortHandle;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::connect::{Connect, DirectConnector, Endpoint, HttpProxyConnector, SocksConnector};
use crate::error::BoxError;
use crate::proxy::{NO_PROXY_IDENTITY, ProxyDescriptor};
use crate::tls;
use crate::translate::Fault;

/// Request body type written to pooled connections.
pub(crate) type OutgoingBody = UnsyncBoxBody<Bytes, BoxError>;

/// Settings shared by every pool of one registry.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Client TLS context.
    pub tls: Arc<ClientConfig>,
    /// Local address outgoing sockets are bound to.
    pub source_address: Option<IpAddr>,
    /// Idle connections kept per endpoint.
    pub max_idle_per_host: usize,
}

/// Counters describing one pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections parked for reuse.
    pub idle: usize,
    /// Connections currently leased to a request.
    pub in_flight: usize,
    /// Connections opened since the pool was created.
    pub opened: u64,
    /// Connections closed instead of being reused.
    pub discarded: u64,
}

/// Lazily populated map from proxy identity to [`Pool`].
pub struct PoolRegistry {
    pools: DashMap<String, Arc<Pool>>,
    settings: PoolSettings,
}

impl PoolRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(settings: PoolSettings) -> Self {
        Self {
            pools: DashMap::new(),
            settings,
        }
    }

    /// Returns the pool for a proxy (or for direct connections), creating it
    /// on first use. Concurrent first calls for one identity create one pool.
    pub fn pool_for(&self, proxy: Option<&ProxyDescriptor>) -> Arc<Pool> {
        let identity = proxy.map_or(NO_PROXY_IDENTITY, ProxyDescriptor::identity);
        if let Some(pool) = self.pools.get(identity) {
            return Arc::clone(pool.value());
        }
        self.pools
            .entry(identity.to_string())
            .or_insert_with(|| {
                let pool = Pool::new(identity.to_string(), proxy.cloned(), &self.settings);
                debug!(
                    proxy = %proxy.map_or_else(|| "none".to_string(), ToString::to_string),
                    socks = pool.is_socks(),
                    "created connection pool"
                );
                Arc::new(pool)
            })
            .clone()
    }

    /// Number of pools created so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pools.len()
    }

    /// Returns `true` before the first pool is created.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}

/// Reusable connections for one proxy identity.
pub struct Pool {
    identity: String,
    proxy: Option<ProxyDescriptor>,
    connector: Box<dyn Connect>,
    tls: TlsConnector,
    max_idle_per_host: usize,
    idle: Mutex<HashMap<Endpoint, Vec<PooledConnection>>>,
    next_id: AtomicU64,
    in_flight: AtomicUsize,
    opened: AtomicU64,
    discarded: AtomicU64,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("identity", &self.identity)
            .field("is_socks", &self.is_socks())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl Pool {
    fn new(identity: String, proxy: Option<ProxyDescriptor>, settings: &PoolSettings) -> Self {
        let tls = TlsConnector::from(Arc::clone(&settings.tls));
        let source = settings.source_address;
        let connector: Box<dyn Connect> = match &proxy {
            None => Box::new(DirectConnector::new(source)),
            Some(p) if p.is_socks() => Box::new(SocksConnector::new(p.clone(), source)),
            Some(p) => Box::new(HttpProxyConnector::new(p.clone(), tls.clone(), source)),
        };
        Self {
            identity,
            proxy,
            connector,
            tls,
            max_idle_per_host: settings.max_idle_per_host,
            idle: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            in_flight: AtomicUsize::new(0),
            opened: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        }
    }

    /// Proxy identity this pool serves.
    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// The proxy connections are routed through, if any.
    #[must_use]
    pub fn proxy(&self) -> Option<&ProxyDescriptor> {
        self.proxy.as_ref()
    }

    /// Returns `true` when every connection of this pool is SOCKS-tunnelled.
    #[must_use]
    pub fn is_socks(&self) -> bool {
        self.proxy.as_ref().is_some_and(ProxyDescriptor::is_socks)
    }

    /// Number of idle connections across all endpoints.
    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.lock_idle().values().map(Vec::len).sum()
    }

    /// Snapshot of the pool counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            idle: self.idle_count(),
            in_flight: self.in_flight.load(Ordering::SeqCst),
            opened: self.opened.load(Ordering::SeqCst),
            discarded: self.discarded.load(Ordering::SeqCst),
        }
    }

    fn lock_idle(&self) -> std::sync::MutexGuard<'_, HashMap<Endpoint, Vec<PooledConnection>>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Leases an idle connection for `endpoint`, or opens a new one within
    /// `connect_timeout`.
    pub(crate) async fn checkout(
        self: &Arc<Self>,
        endpoint: &Endpoint,
        connect_timeout: Duration,
    ) -> Result<ConnectionLease, Fault> {
        let conn = match self.take_idle(endpoint) {
            Some(conn) => {
                debug!(conn_id = conn.id, endpoint = %endpoint.authority(), "reusing idle connection");
                conn
            }
            None => tokio::time::timeout(connect_timeout, self.open(endpoint))
                .await
                .map_err(|_| Fault::ConnectTimeout)??,
        };
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Ok(ConnectionLease {
            conn: Some(conn),
            pool: Arc::clone(self),
            discard: false,
        })
    }

    fn take_idle(&self, endpoint: &Endpoint) -> Option<PooledConnection> {
        let mut idle = self.lock_idle();
        let list = idle.get_mut(endpoint)?;
        let mut found = None;
        while let Some(conn) = list.pop() {
            if conn.sender.is_closed() {
                self.close(conn, "idle connection closed by peer");
            } else {
                found = Some(conn);
                break;
            }
        }
        if list.is_empty() {
            idle.remove(endpoint);
        }
        found
    }

    async fn open(&self, endpoint: &Endpoint) -> Result<PooledConnection, Fault> {
        let connected = self.connector.connect(endpoint).await?;
        let io = if endpoint.is_https() {
            tls::wrap(&self.tls, endpoint.host(), connected.io)
                .await
                .map_err(Fault::Tls)?
        } else {
            connected.io
        };

        let (sender, connection) = http1::handshake::<_, OutgoingBody>(TokioIo::new(io))
            .await
            .map_err(Fault::Send)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let task = tokio::spawn(async move {
            if let Err(error) = connection.await {
                debug!(conn_id = id, error = %error, "connection task ended with error");
            }
        });
        self.opened.fetch_add(1, Ordering::SeqCst);
        debug!(
            conn_id = id,
            endpoint = %endpoint.authority(),
            peer = ?connected.peer_addr,
            "opened connection"
        );

        Ok(PooledConnection {
            id,
            sender,
            task: task.abort_handle(),
            endpoint: endpoint.clone(),
            peer_addr: connected.peer_addr,
            absolute_form: self.connector.absolute_form(endpoint),
            reused: false,
        })
    }

    fn put_idle(&self, mut conn: PooledConnection) {
        if conn.sender.is_closed() {
            self.close(conn, "connection closed before release");
            return;
        }
        let mut idle = self.lock_idle();
        let list = idle.entry(conn.endpoint.clone()).or_default();
        if list.len() >= self.max_idle_per_host {
            drop(idle);
            self.close(conn, "idle limit reached");
            return;
        }
        debug!(conn_id = conn.id, "connection returned to pool");
        conn.reused = true;
        list.push(conn);
    }

    fn close(&self, conn: PooledConnection, reason: &str) {
        debug!(conn_id = conn.id, reason, "closing connection");
        conn.task.abort();
        self.discarded.fetch_add(1, Ordering::SeqCst);
    }

    /// Proxy-Authorization value for absolute-form requests.
    pub(crate) fn proxy_authorization(&self) -> Option<http::HeaderValue> {
        self.connector.proxy_authorization()
    }
}

/// A live HTTP/1.1 client connection.
pub(crate) struct PooledConnection {
    id: u64,
    sender: SendRequest<OutgoingBody>,
    task: AbortHandle,
    endpoint: Endpoint,
    peer_addr: Option<SocketAddr>,
    absolute_form: bool,
    reused: bool,
}

/// Why a request could not be exchanged on a leased connection.
pub(crate) enum SendError {
    /// The request was never written; it can go to another connection.
    Unsent(http::Request<OutgoingBody>),
    /// The exchange failed.
    Failed(hyper::Error),
}

/// Exclusive use of one pooled connection by one request.
pub(crate) struct ConnectionLease {
    conn: Option<PooledConnection>,
    pool: Arc<Pool>,
    discard: bool,
}

impl ConnectionLease {
    /// Identifier of the leased connection, for logging.
    pub(crate) fn id(&self) -> Option<u64> {
        self.conn.as_ref().map(|c| c.id)
    }

    /// Whether the connection served an earlier request.
    pub(crate) fn is_reused(&self) -> bool {
        self.conn.as_ref().is_some_and(|c| c.reused)
    }

    /// Whether requests use absolute-form targets (HTTP proxy, plain HTTP).
    pub(crate) fn absolute_form(&self) -> bool {
        self.conn.as_ref().is_some_and(|c| c.absolute_form)
    }

    /// Remote address of the underlying socket.
    pub(crate) fn peer_addr(&self) -> Option<SocketAddr> {
        self.conn.as_ref().and_then(|c| c.peer_addr)
    }

    /// Writes `request` and waits for the response head.
    pub(crate) async fn send(
        &mut self,
        request: http::Request<OutgoingBody>,
    ) -> Result<http::Response<Incoming>, SendError> {
        let Some(conn) = self.conn.as_mut() else {
            return Err(SendError::Unsent(request));
        };
        if let Err(error) = conn.sender.ready().await {
            return if conn.reused {
                Err(SendError::Unsent(request))
            } else {
                Err(SendError::Failed(error))
            };
        }
        match conn.sender.try_send_request(request).await {
            Ok(response) => Ok(response),
            Err(mut error) => match error.take_message() {
                Some(request) if conn.reused => Err(SendError::Unsent(request)),
                _ => Err(SendError::Failed(error.into_error())),
            },
        }
    }

    /// Forbids returning this connection to the idle set.
    pub(crate) fn mark_discard(&mut self) {
        self.discard = true;
    }

    /// Returns the connection to the pool, or closes it if marked for discard.
    pub(crate) fn release(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.in_flight.fetch_sub(1, Ordering::SeqCst);
            if self.discard {
                warn!(conn_id = conn.id, "discarding connection instead of reusing it");
                self.pool.close(conn, "marked for discard");
            } else {
                self.pool.put_idle(conn);
            }
        }
    }

    /// Closes the connection.
    pub(crate) fn discard(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.pool.close(conn, "discarded");
        }
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.discard();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn registry() -> PoolRegistry {
        PoolRegistry::new(PoolSettings {
            tls: tls::build_client_config(true).unwrap(),
            source_address: None,
            max_idle_per_host: 4,
        })
    }

    #[test]
    fn test_pool_for_returns_same_pool_per_identity() {
        let registry = registry();
        let proxy = ProxyDescriptor::parse("socks5://127.0.0.1:1080").unwrap();
        let same = ProxyDescriptor::parse("socks5://127.0.0.1").unwrap();

        let direct_a = registry.pool_for(None);
        let direct_b = registry.pool_for(None);
        let socks_a = registry.pool_for(Some(&proxy));
        let socks_b = registry.pool_for(Some(&same));

        assert!(Arc::ptr_eq(&direct_a, &direct_b));
        assert!(Arc::ptr_eq(&socks_a, &socks_b));
        assert!(!Arc::ptr_eq(&direct_a, &socks_a));
        assert_eq!(registry.len(), 2);
        assert_eq!(direct_a.identity(), NO_PROXY_IDENTITY);
        assert!(socks_a.is_socks());
        assert!(!direct_a.is_socks());
    }

    #[test]
    fn test_http_proxy_pool_is_not_socks() {
        let registry = registry();
        let proxy = ProxyDescriptor::parse("http://127.0.0.1:3128").unwrap();
        let pool = registry.pool_for(Some(&proxy));
        assert!(!pool.is_socks());
        assert_eq!(pool.stats(), PoolStats::default());
        assert!(format!("{pool:?}").starts_with("Pool {"));
    }

    #[test]
    fn test_concurrent_first_access_creates_one_pool() {
        let registry = Arc::new(registry());
        let proxy = ProxyDescriptor::parse("http://10.0.0.1:8080").unwrap();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let proxy = proxy.clone();
                std::thread::spawn(move || registry.pool_for(Some(&proxy)))
            })
            .collect();
        let pools: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(registry.len(), 1);
        assert!(pools.iter().all(|p| Arc::ptr_eq(p, &pools[0])));
    }

    #[tokio::test]
    async fn test_connect_timeout_when_socks_proxy_never_answers() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let registry = registry();
        let proxy = ProxyDescriptor::parse(&format!("socks5://{addr}")).unwrap();
        let pool = registry.pool_for(Some(&proxy));
        let endpoint = Endpoint::from_url(&url::Url::parse("http://127.0.0.1:8080/").unwrap()).unwrap();
        let result = pool.checkout(&endpoint, Duration::from_millis(200)).await;
        assert!(matches!(result, Err(Fault::ConnectTimeout)));
        assert_eq!(pool.stats().in_flight, 0);
        assert_eq!(pool.stats().opened, 0);
    }

    #[tokio::test]
    async fn test_dead_reused_connection_hands_request_back_unsent() {
        use http_body_util::BodyExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = tokio::spawn(async move { listener.accept().await.unwrap() });

        let pool = registry().pool_for(None);
        let endpoint = Endpoint::from_url(&url::Url::parse(&format!("http://{addr}/")).unwrap()).unwrap();
        let mut lease = pool.checkout(&endpoint, Duration::from_secs(5)).await.ok().unwrap();
        let _server_side = accepted.await.unwrap();

        let conn = lease.conn.as_mut().unwrap();
        conn.task.abort();
        conn.reused = true;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let body: OutgoingBody = http_body_util::Empty::<Bytes>::new()
            .map_err(|never: std::convert::Infallible| -> BoxError { match never {} })
            .boxed_unsync();
        let request = http::Request::get("/").body(body).unwrap();
        let result = lease.send(request).await;
        assert!(matches!(result, Err(SendError::Unsent(_))));

        lease.discard();
        assert_eq!(pool.stats().opened, 1);
        assert_eq!(pool.stats().in_flight, 0);
    }
}
