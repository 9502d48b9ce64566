use std::{
    io,
    pin::Pin,
    sync::{Arc, Weak},
    task::{Context, Poll, ready},
    time::Duration,
};

use async_trait::async_trait;
use axum::body::Body;
use bytes::Bytes;
use dashmap::DashMap;
use hyper::{
    Request, Response, StatusCode, Uri, Version,
    body::{Body as HttpBody, Frame, SizeHint},
    client::conn::http1,
    header::{self, HeaderMap, HeaderValue},
};
use hyper_util::rt::TokioIo;
use pin_project_lite::pin_project;
use serde::Serialize;
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    sync::{Mutex, oneshot},
    time::{self, Instant},
};

use crate::tunnelgate::{
    net,
    pool::{ConnectionPool, PoolError, PoolOptions, PooledConnection, ReleaseHandle},
    telemetry,
    wire::RequestHead,
};

const NOT_CONNECTED: &str = "Unable to route to tunnel, client is not connected";
const CANNOT_SERVICE: &str = "Client cannot service request at this time";
const NOT_REPLAYABLE: &str = "Tunnel connection was lost while the request body was in flight";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

#[derive(Debug, Clone)]
pub struct RouterOptions {
    pub pool_bind_addr: String,
    pub port_range: PortRange,
    pub max_pools: usize,
    pub pool_max_connections: usize,
    pub pool_idle_timeout: Duration,
    /// Caps the wait for a tunneled response head, retries included.
    pub socket_timeout: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("maximum pools reached ({0})")]
    LimitReached(usize),
    #[error("pool id {0:?} is already in use")]
    IdInUse(String),
    #[error("no free port in {min}-{max}: {source}")]
    NoPort {
        min: u16,
        max: u16,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Finds a port nothing is bound to within a range.
#[async_trait]
pub trait PortFinder: Send + Sync {
    async fn find(&self, bind_addr: &str, range: PortRange) -> io::Result<u16>;
}

/// Tries to bind each port of the range in order and keeps the first that
/// works.
#[derive(Debug, Default, Clone, Copy)]
pub struct BindProbe;

#[async_trait]
impl PortFinder for BindProbe {
    async fn find(&self, bind_addr: &str, range: PortRange) -> io::Result<u16> {
        for port in range.min..=range.max {
            if let Ok(ln) = TcpListener::bind(net::join_host_port(bind_addr, port)).await {
                drop(ln);
                return Ok(port);
            }
        }
        Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            "every port in range is bound",
        ))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub id: String,
    pub port: u16,
    pub pooled: usize,
    pub created_at_unix_ms: u64,
}

struct Entry {
    pool: ConnectionPool,
    created_at_unix_ms: u64,
}

pub struct Router {
    opts: RouterOptions,
    pools: DashMap<String, Entry>,
    create_lock: Mutex<()>,
    ports: Arc<dyn PortFinder>,
}

impl Router {
    pub fn new(opts: RouterOptions) -> Arc<Self> {
        Self::with_port_finder(opts, Arc::new(BindProbe))
    }

    pub fn with_port_finder(opts: RouterOptions, ports: Arc<dyn PortFinder>) -> Arc<Self> {
        Arc::new(Self {
            opts,
            pools: DashMap::new(),
            create_lock: Mutex::new(()),
            ports,
        })
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// Creates, opens and registers a pool for `id`.
    ///
    /// The pool drops out of the registry by itself once it ends.
    pub async fn create_pool(self: &Arc<Self>, id: &str) -> Result<ConnectionPool, RouterError> {
        let _guard = self.create_lock.lock().await;

        if self.pools.len() >= self.opts.max_pools {
            tracing::error!(pool = %id, max_pools = self.opts.max_pools, "router: refusing to add another pool; limit reached");
            return Err(RouterError::LimitReached(self.opts.max_pools));
        }
        if self.pools.contains_key(id) {
            tracing::warn!(pool = %id, "router: refusing to add pool; id is already in use");
            return Err(RouterError::IdInUse(id.to_string()));
        }

        let range = self.opts.port_range;
        let port = self
            .ports
            .find(&self.opts.pool_bind_addr, range)
            .await
            .map_err(|source| {
                tracing::error!(pool = %id, err = %source, "router: failed to find a free port");
                RouterError::NoPort {
                    min: range.min,
                    max: range.max,
                    source,
                }
            })?;

        let pool = ConnectionPool::new(PoolOptions {
            id: id.to_string(),
            bind_addr: self.opts.pool_bind_addr.clone(),
            port,
            max_connections: self.opts.pool_max_connections,
            idle_timeout: self.opts.pool_idle_timeout,
        });
        tracing::info!(pool = %id, port, "router: opening new pool");
        pool.open().await?;

        self.pools.insert(
            id.to_string(),
            Entry {
                pool: pool.clone(),
                created_at_unix_ms: telemetry::now_unix_ms(),
            },
        );
        metrics::counter!("tunnelgate_pools_created_total").increment(1);
        metrics::gauge!("tunnelgate_pools_active").set(self.pools.len() as f64);

        let router: Weak<Self> = Arc::downgrade(self);
        let watched = pool.clone();
        tokio::spawn(async move {
            watched.ended().await;
            if let Some(router) = router.upgrade() {
                router.deregister(&watched);
            }
        });

        Ok(pool)
    }

    fn deregister(&self, pool: &ConnectionPool) {
        let removed = self
            .pools
            .remove_if(pool.id(), |_, entry| entry.pool.ptr_eq(pool))
            .is_some();
        if removed {
            tracing::info!(pool = %pool.id(), "router: pool deregistered");
            metrics::gauge!("tunnelgate_pools_active").set(self.pools.len() as f64);
        }
    }

    pub fn lookup_pool(&self, id: &str) -> Option<ConnectionPool> {
        self.pools.get(id).map(|entry| entry.pool.clone())
    }

    pub fn snapshot(&self) -> Vec<PoolSnapshot> {
        let mut out: Vec<_> = self
            .pools
            .iter()
            .map(|entry| PoolSnapshot {
                id: entry.key().clone(),
                port: entry.pool.port(),
                pooled: entry.pool.pooled(),
                created_at_unix_ms: entry.created_at_unix_ms,
            })
            .collect();
        out.sort_by_key(|s| s.created_at_unix_ms);
        out
    }

    /// Closes every registered pool.
    pub fn close_all(&self) {
        for entry in self.pools.iter() {
            entry.pool.close();
        }
    }

    /// Replays `req` over a pooled tunnel connection and returns the tunneled
    /// response.
    pub async fn route_http(&self, id: &str, req: Request<Body>) -> Response<Body> {
        tracing::debug!(pool = %id, method = %req.method(), uri = %req.uri(), "router: routing http request");
        let Some(pool) = self.lookup_pool(id) else {
            tracing::warn!(pool = %id, "router: no pool with this id");
            http_outcome("unknown");
            return error_response(StatusCode::BAD_GATEWAY, NOT_CONNECTED);
        };

        let mut req = outbound_request(req);
        let empty_body = req.body().is_end_stream();
        let template = (req.method().clone(), req.uri().clone(), req.headers().clone());
        let mut deadline: Option<Instant> = None;

        loop {
            let leased = match deadline {
                None => pool.lease().await,
                Some(at) => match time::timeout_at(at, pool.lease()).await {
                    Ok(leased) => leased,
                    Err(_) => {
                        tracing::warn!(pool = %id, "router: timed out waiting for a tunnel connection");
                        http_outcome("timeout");
                        return error_response(StatusCode::GATEWAY_TIMEOUT, CANNOT_SERVICE);
                    }
                },
            };
            let Some(conn) = leased else {
                tracing::warn!(pool = %id, "router: no tunnel connection available");
                http_outcome("unavailable");
                return error_response(StatusCode::GATEWAY_TIMEOUT, CANNOT_SERVICE);
            };
            let at = *deadline.get_or_insert_with(|| Instant::now() + self.opts.socket_timeout);

            match exchange(conn, req, at).await {
                Exchange::Response(resp) => {
                    http_outcome("ok");
                    return resp;
                }
                Exchange::TimedOut => {
                    tracing::warn!(pool = %id, "router: tunnel did not answer in time");
                    http_outcome("timeout");
                    return error_response(StatusCode::GATEWAY_TIMEOUT, CANNOT_SERVICE);
                }
                Exchange::Aborted(Some(again)) => {
                    tracing::debug!(pool = %id, "router: tunnel connection aborted; retrying");
                    req = again;
                }
                Exchange::Aborted(None) if empty_body => {
                    tracing::debug!(pool = %id, "router: tunnel connection aborted; retrying");
                    let (method, uri, headers) = template.clone();
                    req = rebuild_request(method, uri, headers);
                }
                Exchange::Aborted(None) => {
                    tracing::warn!(pool = %id, "router: tunnel connection aborted mid-body");
                    http_outcome("aborted");
                    return error_response(StatusCode::BAD_GATEWAY, NOT_REPLAYABLE);
                }
            }
        }
    }

    /// Writes the upgrade head to a pooled tunnel connection and splices it
    /// with `socket` until either side ends.
    pub async fn route_websocket(
        &self,
        id: &str,
        head: &RequestHead,
        leftover: Bytes,
        mut socket: TcpStream,
    ) {
        let Some(pool) = self.lookup_pool(id) else {
            tracing::warn!(pool = %id, "router: no pool with this id; dropping websocket");
            return;
        };

        let leased = tokio::select! {
            leased = pool.lease() => leased,
            _ = net::closed(&socket) => {
                tracing::debug!(pool = %id, "router: websocket client left before a tunnel connection was free");
                return;
            }
        };
        let Some(mut conn) = leased else {
            tracing::warn!(pool = %id, "router: no tunnel connection for websocket");
            return;
        };

        let mut prelude = head.encode();
        prelude.extend_from_slice(&leftover);
        if let Err(err) = conn.write_all(&prelude).await {
            tracing::debug!(pool = %id, err = %err, "router: failed to replay websocket head");
            return;
        }

        metrics::counter!("tunnelgate_websockets_total").increment(1);
        tracing::debug!(pool = %id, tunnel = ?conn.peer_addr(), "router: websocket spliced");
        match tokio::io::copy_bidirectional(&mut socket, &mut conn).await {
            Ok((up, down)) => {
                tracing::debug!(pool = %id, bytes_up = up, bytes_down = down, "router: websocket closed");
            }
            Err(err) => {
                tracing::debug!(pool = %id, err = %err, "router: websocket splice ended");
            }
        }
    }
}

enum Exchange {
    Response(Response<Body>),
    TimedOut,
    /// The connection died before a response head. Carries the request back
    /// when it was never written.
    Aborted(Option<Request<Body>>),
}

async fn exchange(conn: PooledConnection, req: Request<Body>, deadline: Instant) -> Exchange {
    let (stream, handle) = conn.into_parts();
    let (mut sender, connection) = match http1::Builder::new()
        .title_case_headers(true)
        .handshake::<_, Body>(TokioIo::new(stream))
        .await
    {
        Ok(parts) => parts,
        Err(err) => {
            tracing::debug!(err = %err, "router: handshake failed");
            return Exchange::Aborted(Some(req));
        }
    };

    let (done_tx, done_rx) = oneshot::channel();
    let driver = tokio::spawn(settle(connection, handle, done_rx, deadline));

    let sent = time::timeout_at(deadline, async {
        if let Err(err) = sender.ready().await {
            return Err((err, Some(req)));
        }
        sender.try_send_request(req).await.map_err(|mut err| {
            let req = err.take_message();
            (err.into_error(), req)
        })
    })
    .await;

    match sent {
        Err(_) => {
            driver.abort();
            Exchange::TimedOut
        }
        Ok(Err((err, req))) => {
            tracing::debug!(err = %err, "router: tunneled request failed");
            driver.abort();
            Exchange::Aborted(req)
        }
        Ok(Ok(resp)) => {
            drop(sender);
            let reusable = keeps_alive(resp.version(), resp.headers());
            let (mut parts, body) = resp.into_parts();
            strip_hop_headers(&mut parts.headers);
            let body = TrackEnd::new(body, done_tx, reusable);
            Exchange::Response(Response::from_parts(parts, Body::new(body)))
        }
    }
}

/// Drives the client connection and hands the socket back to its pool once
/// the response was delivered in full.
async fn settle(
    connection: http1::Connection<TokioIo<TcpStream>, Body>,
    handle: ReleaseHandle,
    done: oneshot::Receiver<bool>,
    deadline: Instant,
) {
    let mut done = done;
    let drive = connection.without_shutdown();
    tokio::pin!(drive);

    let (parts, delivered) = tokio::select! {
        delivered = &mut done => {
            if !delivered.unwrap_or(false) {
                return;
            }
            // Once the body is out the connection winds down on its own.
            let grace = Instant::now().max(deadline) + Duration::from_secs(1);
            match time::timeout_at(grace, &mut drive).await {
                Ok(parts) => (parts, true),
                Err(_) => return,
            }
        }
        parts = &mut drive => (parts, done.await.unwrap_or(false)),
    };

    match parts {
        Ok(parts) if delivered && parts.read_buf.is_empty() => {
            handle.release(parts.io.into_inner());
        }
        Ok(_) => tracing::debug!("router: tunnel connection not reusable; discarding"),
        Err(err) => tracing::debug!(err = %err, "router: tunnel connection error"),
    }
}

pin_project! {
    /// Response body that reports whether it was read to the end.
    struct TrackEnd<B> {
        #[pin]
        inner: B,
        done: Option<oneshot::Sender<bool>>,
        reusable: bool,
    }
}

impl<B: HttpBody> TrackEnd<B> {
    fn new(inner: B, done: oneshot::Sender<bool>, reusable: bool) -> Self {
        let mut done = Some(done);
        if inner.is_end_stream() {
            if let Some(tx) = done.take() {
                let _ = tx.send(reusable);
            }
        }
        Self {
            inner,
            done,
            reusable,
        }
    }
}

impl<B> HttpBody for TrackEnd<B>
where
    B: HttpBody<Data = Bytes>,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        let frame = ready!(this.inner.poll_frame(cx));
        match &frame {
            None => {
                if let Some(tx) = this.done.take() {
                    let _ = tx.send(*this.reusable);
                }
            }
            Some(Err(_)) => {
                this.done.take();
            }
            Some(Ok(_)) => {}
        }
        Poll::Ready(frame)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

fn outbound_request(req: Request<Body>) -> Request<Body> {
    let (mut parts, body) = req.into_parts();
    parts.uri = origin_form(&parts.uri);
    parts.version = Version::HTTP_11;
    strip_hop_headers(&mut parts.headers);
    Request::from_parts(parts, body)
}

fn rebuild_request(method: hyper::Method, uri: Uri, headers: HeaderMap) -> Request<Body> {
    let mut req = Request::new(Body::empty());
    *req.method_mut() = method;
    *req.uri_mut() = uri;
    *req.version_mut() = Version::HTTP_11;
    *req.headers_mut() = headers;
    req
}

fn origin_form(uri: &Uri) -> Uri {
    uri.path_and_query()
        .and_then(|pq| pq.as_str().parse().ok())
        .unwrap_or_else(|| Uri::from_static("/"))
}

fn strip_hop_headers(headers: &mut HeaderMap) {
    headers.remove(header::CONNECTION);
    headers.remove("keep-alive");
}

fn keeps_alive(version: Version, headers: &HeaderMap) -> bool {
    let has_token = |token: &str| {
        headers
            .get_all(header::CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    };
    match version {
        Version::HTTP_11 => !has_token("close"),
        Version::HTTP_10 => has_token("keep-alive"),
        _ => false,
    }
}

fn http_outcome(outcome: &'static str) {
    metrics::counter!("tunnelgate_http_requests_total", "outcome" => outcome).increment(1);
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

pub fn error_response(status: StatusCode, message: &str) -> Response<Body> {
    let body = serde_json::to_vec(&ErrorBody { error: message }).unwrap_or_default();
    let mut resp = Response::new(Body::from(body));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    resp.headers_mut()
        .insert(header::CONNECTION, HeaderValue::from_static("close"));
    resp
}
