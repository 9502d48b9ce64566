//! Connection pool for one tunnel client.
//!
//! A pool owns a listener on a single port. The tunnel client dials into it
//! and the connections it makes are parked here until a request handler leases
//! one. All pool state lives in one actor task fed by a command channel, so
//! the pooled list, the waiting leases and the idle timer are only ever
//! touched from one place.

use std::{
    collections::VecDeque,
    io,
    net::SocketAddr,
    pin::Pin,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering},
    },
    task::{Context, Poll},
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::{TcpListener, TcpStream},
    sync::{mpsc, oneshot, watch},
    time::{self, Instant},
};
use tracing::Instrument;

use crate::tunnelgate::net::{self, Probe};

#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub id: String,
    pub bind_addr: String,
    /// 0 binds an ephemeral port.
    pub port: u16,
    pub max_connections: usize,
    pub idle_timeout: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("pool {0} is already open")]
    AlreadyOpen(String),
    #[error("pool {id}: bind {addr}: {source}")]
    Bind {
        id: String,
        addr: String,
        #[source]
        source: io::Error,
    },
}

enum Command {
    Lease(oneshot::Sender<Option<PooledConnection>>),
    Release(TcpStream),
    /// A leased connection was dropped instead of released.
    Discarded,
    Close,
}

#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<Shared>,
}

struct Shared {
    opts: PoolOptions,
    port: AtomicU16,
    opened: AtomicBool,
    pooled: AtomicUsize,
    tx: mpsc::UnboundedSender<Command>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    ended: watch::Sender<bool>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("id", &self.id())
            .field("port", &self.port())
            .field("pooled", &self.pooled())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ConnectionPool {
    pub fn new(mut opts: PoolOptions) -> Self {
        if opts.max_connections == 0 {
            opts.max_connections = 10;
        }
        if opts.idle_timeout.is_zero() {
            opts.idle_timeout = Duration::from_secs(5);
        }
        if opts.bind_addr.trim().is_empty() {
            opts.bind_addr = "0.0.0.0".into();
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let (ended, _) = watch::channel(false);
        let port = opts.port;
        Self {
            shared: Arc::new(Shared {
                opts,
                port: AtomicU16::new(port),
                opened: AtomicBool::new(false),
                pooled: AtomicUsize::new(0),
                tx,
                rx: Mutex::new(Some(rx)),
                ended,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.opts.id
    }

    /// The bound port, or the configured one before `open`.
    pub fn port(&self) -> u16 {
        self.shared.port.load(Ordering::Acquire)
    }

    pub fn pooled(&self) -> usize {
        self.shared.pooled.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        *self.shared.ended.borrow()
    }

    pub fn ptr_eq(&self, other: &ConnectionPool) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Binds the listener and starts accepting tunnel connections.
    ///
    /// The idle timer starts right away so a pool nobody connects to still
    /// goes away.
    pub async fn open(&self) -> Result<(), PoolError> {
        let opts = &self.shared.opts;
        if self.shared.opened.swap(true, Ordering::AcqRel) {
            tracing::error!(pool = %opts.id, "pool: cannot open a pool that is already open");
            return Err(PoolError::AlreadyOpen(opts.id.clone()));
        }

        let addr = net::join_host_port(&opts.bind_addr, opts.port);
        let listener = TcpListener::bind(&addr).await.map_err(|source| PoolError::Bind {
            id: opts.id.clone(),
            addr: addr.clone(),
            source,
        })?;
        if let Ok(local) = listener.local_addr() {
            self.shared.port.store(local.port(), Ordering::Release);
        }

        let rx = self
            .shared
            .rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or_else(|| PoolError::AlreadyOpen(opts.id.clone()))?;

        tracing::info!(
            pool = %opts.id,
            port = self.port(),
            max_connections = opts.max_connections,
            idle_timeout = %humantime::format_duration(opts.idle_timeout),
            "pool: opened; waiting for tunnel connections"
        );

        let actor = Actor {
            shared: self.shared.clone(),
            listener,
            rx,
            idle: VecDeque::new(),
            waiters: VecDeque::new(),
            idle_deadline: Some(Instant::now() + opts.idle_timeout),
        };
        let span = tracing::debug_span!("pool", id = %opts.id);
        tokio::spawn(actor.run().instrument(span));
        Ok(())
    }

    /// Leases the oldest live pooled connection, waiting for one if none is
    /// pooled. `None` means the pool is gone.
    pub async fn lease(&self) -> Option<PooledConnection> {
        let (tx, rx) = oneshot::channel();
        self.shared.tx.send(Command::Lease(tx)).ok()?;
        rx.await.ok().flatten()
    }

    /// Tears the pool down: waiting leases get `None`, pooled connections are
    /// closed, the end signal fires.
    pub fn close(&self) {
        let _ = self.shared.tx.send(Command::Close);
    }

    /// Resolves once the pool has been destroyed.
    pub async fn ended(&self) {
        let mut rx = self.shared.ended.subscribe();
        let _ = rx.wait_for(|ended| *ended).await;
    }
}

/// A connection leased out of a pool.
///
/// `release` hands it back; dropping it destroys it.
#[derive(Debug)]
pub struct PooledConnection {
    stream: TcpStream,
    handle: ReleaseHandle,
}

/// Return path for a leased connection whose stream is owned elsewhere.
#[derive(Debug)]
pub struct ReleaseHandle {
    tx: Option<mpsc::UnboundedSender<Command>>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Lease(_) => f.write_str("Lease"),
            Command::Release(_) => f.write_str("Release"),
            Command::Discarded => f.write_str("Discarded"),
            Command::Close => f.write_str("Close"),
        }
    }
}

impl PooledConnection {
    fn new(stream: TcpStream, tx: mpsc::UnboundedSender<Command>) -> Self {
        Self {
            stream,
            handle: ReleaseHandle { tx: Some(tx) },
        }
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.peer_addr().ok()
    }

    pub fn release(self) {
        let Self { stream, handle } = self;
        handle.release(stream);
    }

    pub fn into_parts(self) -> (TcpStream, ReleaseHandle) {
        (self.stream, self.handle)
    }

    /// Takes the stream back without notifying the pool.
    fn reclaim(mut self) -> TcpStream {
        self.handle.tx = None;
        self.stream
    }
}

impl ReleaseHandle {
    pub fn release(mut self, stream: TcpStream) {
        if let Some(tx) = self.tx.take() {
            // A closed pool drops the stream.
            let _ = tx.send(Command::Release(stream));
        }
    }
}

impl Drop for ReleaseHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Command::Discarded);
        }
    }
}

impl AsyncRead for PooledConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for PooledConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

struct Actor {
    shared: Arc<Shared>,
    listener: TcpListener,
    rx: mpsc::UnboundedReceiver<Command>,
    idle: VecDeque<TcpStream>,
    waiters: VecDeque<oneshot::Sender<Option<PooledConnection>>>,
    /// Armed only while nothing is pooled.
    idle_deadline: Option<Instant>,
}

enum Flow {
    Continue,
    Teardown,
}

impl Actor {
    async fn run(mut self) {
        loop {
            let deadline = self.idle_deadline;
            let idle_timer = async move {
                match deadline {
                    Some(at) => time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            let flow = tokio::select! {
                cmd = self.rx.recv() => match cmd {
                    Some(Command::Lease(reply)) => {
                        self.waiters.push_back(reply);
                        self.dispatch()
                    }
                    Some(Command::Release(stream)) => self.on_release(stream),
                    Some(Command::Discarded) => {
                        if self.idle.is_empty() {
                            self.arm_idle_timer();
                        }
                        Flow::Continue
                    }
                    Some(Command::Close) | None => Flow::Teardown,
                },
                res = self.listener.accept() => match res {
                    Ok((stream, peer)) => self.on_accept(stream, peer),
                    Err(err) => {
                        tracing::error!(pool = %self.shared.opts.id, err = %err, "pool: accept failed");
                        Flow::Continue
                    }
                },
                _ = idle_timer => {
                    tracing::info!(pool = %self.shared.opts.id, "pool: idle timeout reached; destroying");
                    Flow::Teardown
                }
                idx = idle_readiness(&self.idle) => self.on_idle_readable(idx),
            };

            if let Flow::Teardown = flow {
                break;
            }
            self.shared.pooled.store(self.idle.len(), Ordering::Release);
        }

        self.teardown();
    }

    fn on_accept(&mut self, stream: TcpStream, peer: SocketAddr) -> Flow {
        let id = &self.shared.opts.id;
        if self.idle.len() >= self.shared.opts.max_connections {
            tracing::warn!(pool = %id, client = %peer, "pool: maximum tunnel connections reached; rejecting");
            metrics::counter!("tunnelgate_pool_connections_rejected_total").increment(1);
            return Flow::Continue;
        }

        tracing::debug!(pool = %id, client = %peer, "pool: tunnel connection accepted");
        metrics::counter!("tunnelgate_pool_connections_total").increment(1);
        let _ = stream.set_nodelay(true);
        self.idle_deadline = None;
        self.idle.push_back(stream);
        self.dispatch()
    }

    fn on_release(&mut self, stream: TcpStream) -> Flow {
        match net::probe(&stream) {
            Probe::Idle => {
                self.idle_deadline = None;
                self.idle.push_back(stream);
            }
            Probe::Pending => {
                tracing::debug!(pool = %self.shared.opts.id, "pool: released connection has unread bytes; discarding");
            }
            Probe::Closed | Probe::Failed(_) => {
                tracing::debug!(pool = %self.shared.opts.id, "pool: released connection is closed; discarding");
            }
        }

        if self.idle.is_empty() {
            self.arm_idle_timer();
            return Flow::Continue;
        }
        self.dispatch()
    }

    fn on_idle_readable(&mut self, idx: usize) -> Flow {
        let Some(stream) = self.idle.get(idx) else {
            return Flow::Continue;
        };
        let id = &self.shared.opts.id;
        match net::probe(stream) {
            Probe::Idle => return Flow::Continue,
            Probe::Closed => {
                tracing::debug!(pool = %id, "pool: tunnel connection closed");
            }
            Probe::Pending => {
                tracing::debug!(pool = %id, "pool: unsolicited bytes on idle connection; discarding");
            }
            Probe::Failed(err) => {
                tracing::error!(pool = %id, err = %err, "pool: tunnel connection error; tearing down");
                return Flow::Teardown;
            }
        }

        self.idle.remove(idx);
        if self.idle.is_empty() {
            self.arm_idle_timer();
        }
        Flow::Continue
    }

    /// Hands pooled connections to waiting leases, oldest first on both sides.
    fn dispatch(&mut self) -> Flow {
        while let Some(waiter) = self.waiters.pop_front() {
            if waiter.is_closed() {
                continue;
            }

            let stream = match self.next_live() {
                Ok(Some(stream)) => stream,
                Ok(None) => {
                    tracing::debug!(pool = %self.shared.opts.id, queued = self.waiters.len() + 1, "pool: no connection available; queuing lease");
                    self.waiters.push_front(waiter);
                    break;
                }
                Err(err) => {
                    tracing::error!(pool = %self.shared.opts.id, err = %err, "pool: tunnel connection error; tearing down");
                    self.waiters.push_front(waiter);
                    return Flow::Teardown;
                }
            };

            let conn = PooledConnection::new(stream, self.shared.tx.clone());
            if let Err(Some(conn)) = waiter.send(Some(conn)) {
                // The caller stopped waiting; keep the connection at the head.
                self.idle.push_front(conn.reclaim());
            }
        }
        Flow::Continue
    }

    /// Pops pooled connections until a live one turns up.
    fn next_live(&mut self) -> io::Result<Option<TcpStream>> {
        while let Some(stream) = self.idle.pop_front() {
            match net::probe(&stream) {
                Probe::Idle => return Ok(Some(stream)),
                Probe::Closed | Probe::Pending => {
                    tracing::warn!(pool = %self.shared.opts.id, "pool: skipping dead tunnel connection");
                    if self.idle.is_empty() {
                        self.arm_idle_timer();
                    }
                }
                Probe::Failed(err) => return Err(err),
            }
        }
        Ok(None)
    }

    fn arm_idle_timer(&mut self) {
        self.idle_deadline = Some(Instant::now() + self.shared.opts.idle_timeout);
    }

    fn teardown(self) {
        let Actor {
            shared,
            listener,
            mut rx,
            idle,
            waiters,
            ..
        } = self;

        drop(listener);
        tracing::debug!(
            pool = %shared.opts.id,
            pooled = idle.len(),
            waiting = waiters.len(),
            "pool: cleaning up connections"
        );
        drop(idle);
        for waiter in waiters {
            let _ = waiter.send(None);
        }
        rx.close();
        while let Ok(cmd) = rx.try_recv() {
            if let Command::Lease(reply) = cmd {
                let _ = reply.send(None);
            }
        }

        shared.pooled.store(0, Ordering::Release);
        shared.ended.send_replace(true);
        tracing::info!(pool = %shared.opts.id, "pool: ended");
    }
}

/// Index of the first pooled connection with read readiness (peer close,
/// error or stray bytes).
async fn idle_readiness(idle: &VecDeque<TcpStream>) -> usize {
    if idle.is_empty() {
        return std::future::pending().await;
    }
    let ready = idle.iter().map(|stream| Box::pin(stream.readable()));
    let (_, idx, _) = futures_util::future::select_all(ready).await;
    idx
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn opts(id: &str, max: usize, idle: Duration) -> PoolOptions {
        PoolOptions {
            id: id.into(),
            bind_addr: "127.0.0.1".into(),
            port: 0,
            max_connections: max,
            idle_timeout: idle,
        }
    }

    async fn open_pool(max: usize, idle: Duration) -> ConnectionPool {
        let pool = ConnectionPool::new(opts("t", max, idle));
        pool.open().await.expect("open");
        pool
    }

    async fn dial(pool: &ConnectionPool) -> TcpStream {
        TcpStream::connect(("127.0.0.1", pool.port())).await.expect("dial pool")
    }

    async fn wait_pooled(pool: &ConnectionPool, n: usize) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while pool.pooled() != n {
            assert!(Instant::now() < deadline, "pooled never reached {n}");
            time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn open_twice_fails() {
        let pool = open_pool(2, Duration::from_secs(5)).await;
        assert_ne!(pool.port(), 0);
        let err = pool.open().await.unwrap_err();
        assert!(matches!(err, PoolError::AlreadyOpen(_)));
        pool.close();
    }

    #[tokio::test]
    async fn extra_connection_is_closed_without_pooling() {
        let pool = open_pool(2, Duration::from_secs(5)).await;
        let _a = dial(&pool).await;
        let _b = dial(&pool).await;
        wait_pooled(&pool, 2).await;

        let mut c = dial(&pool).await;
        let mut buf = [0u8; 1];
        let n = time::timeout(Duration::from_secs(2), c.read(&mut buf))
            .await
            .expect("rejected connection closes")
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert_eq!(pool.pooled(), 2);
        pool.close();
    }

    #[tokio::test]
    async fn lease_is_exclusive_until_released() {
        let pool = open_pool(4, Duration::from_secs(5)).await;
        let mut remote = dial(&pool).await;
        wait_pooled(&pool, 1).await;

        let mut leased = pool.lease().await.expect("lease");
        assert_eq!(pool.pooled(), 0);

        // A second lease must wait while the only connection is out.
        let second = tokio::spawn({
            let pool = pool.clone();
            async move { pool.lease().await }
        });
        time::sleep(Duration::from_millis(100)).await;
        assert!(!second.is_finished());

        leased.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        leased.release();
        let mut again = time::timeout(Duration::from_secs(2), second)
            .await
            .expect("second lease served")
            .unwrap()
            .expect("connection");
        again.write_all(b"pong").await.unwrap();
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
        pool.close();
    }

    #[tokio::test]
    async fn queued_leases_are_served_in_order() {
        let pool = open_pool(4, Duration::from_secs(5)).await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        for i in 0..3 {
            let pool = pool.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let conn = pool.lease().await;
                let _ = tx.send((i, conn));
            });
            // Enqueue strictly one after the other.
            time::sleep(Duration::from_millis(30)).await;
        }

        let mut remotes = Vec::new();
        for _ in 0..3 {
            remotes.push(dial(&pool).await);
            time::sleep(Duration::from_millis(30)).await;
        }

        let mut order = Vec::new();
        for _ in 0..3 {
            let (i, conn) = time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert!(conn.is_some());
            order.push(i);
        }
        assert_eq!(order, vec![0, 1, 2]);
        pool.close();
    }

    #[tokio::test]
    async fn abandoned_lease_does_not_lose_connection() {
        let pool = open_pool(4, Duration::from_secs(5)).await;

        let pending = time::timeout(Duration::from_millis(50), pool.lease()).await;
        assert!(pending.is_err());

        let _remote = dial(&pool).await;
        wait_pooled(&pool, 1).await;
        let conn = time::timeout(Duration::from_secs(2), pool.lease())
            .await
            .unwrap();
        assert!(conn.is_some());
        pool.close();
    }

    #[tokio::test]
    async fn closed_connections_are_skipped_on_lease() {
        let pool = open_pool(4, Duration::from_secs(5)).await;
        let dead = dial(&pool).await;
        let _alive = dial(&pool).await;
        wait_pooled(&pool, 2).await;

        drop(dead);
        wait_pooled(&pool, 1).await;
        let conn = pool.lease().await.expect("live connection");
        assert!(conn.peer_addr().is_some());
        pool.close();
    }

    #[tokio::test]
    async fn idle_pool_destroys_itself_once() {
        let pool = open_pool(2, Duration::from_millis(150)).await;
        let mut ended = pool.shared.ended.subscribe();

        let waiter = tokio::spawn({
            let pool = pool.clone();
            async move { pool.lease().await }
        });

        time::timeout(Duration::from_secs(2), pool.ended())
            .await
            .expect("pool ends");
        assert!(pool.is_closed());
        assert!(waiter.await.unwrap().is_none(), "waiters get None");
        assert!(pool.lease().await.is_none());

        let mut changes = 0;
        while ended.has_changed().unwrap_or(false) {
            ended.borrow_and_update();
            changes += 1;
        }
        assert_eq!(changes, 1);
        assert!(TcpStream::connect(("127.0.0.1", pool.port())).await.is_err());
    }

    #[tokio::test]
    async fn connection_before_timeout_keeps_pool_alive() {
        let pool = open_pool(2, Duration::from_millis(200)).await;
        let remote = dial(&pool).await;
        wait_pooled(&pool, 1).await;

        time::sleep(Duration::from_millis(400)).await;
        assert!(!pool.is_closed());

        // Once the tunnel goes away the timer re-arms.
        drop(remote);
        time::timeout(Duration::from_secs(2), pool.ended())
            .await
            .expect("pool ends after its last connection closed");
    }

    #[tokio::test]
    async fn dropped_lease_is_not_returned() {
        let pool = open_pool(2, Duration::from_secs(5)).await;
        let mut remote = dial(&pool).await;
        wait_pooled(&pool, 1).await;

        let leased = pool.lease().await.expect("lease");
        drop(leased);

        let mut buf = [0u8; 1];
        let n = time::timeout(Duration::from_secs(2), remote.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert_eq!(pool.pooled(), 0);
        pool.close();
    }
}
