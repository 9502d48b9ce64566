use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
};
use tracing::Instrument;

use crate::tunnelgate::{
    net,
    tunnel::{
        leg::Leg,
        raised,
        rewrite::{HostRewrite, TransformChain, TransformFactory},
    },
};

#[derive(Clone)]
pub struct TunnelOptions {
    pub local_address: String,
    pub local_port: u16,
    pub remote_address: String,
    pub remote_port: u16,
    /// Number of legs kept open towards the pool.
    pub max_connections: usize,
    pub local_retry_delay: Duration,
    /// Extra rewrite applied to remote-to-local traffic.
    pub transform: Option<TransformFactory>,
}

impl std::fmt::Debug for TunnelOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelOptions")
            .field("local_address", &self.local_address)
            .field("local_port", &self.local_port)
            .field("remote_address", &self.remote_address)
            .field("remote_port", &self.remote_port)
            .field("max_connections", &self.max_connections)
            .field("local_retry_delay", &self.local_retry_delay)
            .field("transform", &self.transform.is_some())
            .finish()
    }
}

impl TunnelOptions {
    pub fn local_addr(&self) -> String {
        net::join_host_port(&self.local_address, self.local_port)
    }

    pub fn remote_addr(&self) -> String {
        net::join_host_port(&self.remote_address, self.remote_port)
    }

    /// Transforms for one piped leg: host rewrite first, then the caller's.
    pub(crate) fn transform_chain(&self) -> TransformChain {
        let mut chain = TransformChain::default();
        if !net::is_loopback_host(&self.local_address) {
            chain.push(Box::new(HostRewrite::new(self.local_address.clone())));
        }
        if let Some(factory) = &self.transform {
            chain.push(factory());
        }
        chain
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TunnelError {
    #[error("invalid tunnel options: {0}")]
    InvalidOptions(String),
    #[error("tunnel is already open")]
    AlreadyOpen,
    #[error("tunnel server {0} refused the connection")]
    RemoteRefused(String),
}

#[derive(Debug, Clone)]
pub enum TunnelEvent {
    /// The first leg was paired with the local service.
    Established,
    Error(TunnelError),
}

pub(crate) struct Shared {
    opened: AtomicBool,
    live: AtomicUsize,
    established: watch::Sender<bool>,
    events: broadcast::Sender<TunnelEvent>,
    pub(crate) shutdown: watch::Sender<bool>,
    legs: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    pub(crate) fn emit(&self, event: TunnelEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Emits `Established` the first time a leg pairs.
    pub(crate) fn mark_established(&self) {
        let first = self.established.send_if_modified(|established| {
            if *established {
                false
            } else {
                *established = true;
                true
            }
        });
        if first {
            self.emit(TunnelEvent::Established);
        }
    }
}

/// Counts a connected remote half for as long as it is alive.
pub(crate) struct LiveGuard {
    shared: Arc<Shared>,
}

impl LiveGuard {
    pub(crate) fn new(shared: &Arc<Shared>) -> Self {
        shared.live.fetch_add(1, Ordering::AcqRel);
        metrics::gauge!("tunnelgate_tunnel_legs_open").increment(1.0);
        Self {
            shared: shared.clone(),
        }
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.shared.live.fetch_sub(1, Ordering::AcqRel);
        metrics::gauge!("tunnelgate_tunnel_legs_open").decrement(1.0);
    }
}

/// Keeps `max_connections` outbound legs to a pool port, each spliced to a
/// fresh connection to the local service.
pub struct TunnelClient {
    opts: Arc<TunnelOptions>,
    shared: Arc<Shared>,
}

impl TunnelClient {
    pub fn new(mut opts: TunnelOptions) -> Result<Self, TunnelError> {
        if opts.remote_address.trim().is_empty() {
            return Err(TunnelError::InvalidOptions("remote address is required".into()));
        }
        if opts.local_address.trim().is_empty() {
            return Err(TunnelError::InvalidOptions("local address is required".into()));
        }
        if opts.remote_port == 0 || opts.local_port == 0 {
            return Err(TunnelError::InvalidOptions("ports must be non-zero".into()));
        }
        if opts.max_connections == 0 {
            return Err(TunnelError::InvalidOptions(
                "max_connections must be at least 1".into(),
            ));
        }
        if opts.local_retry_delay.is_zero() {
            opts.local_retry_delay = Duration::from_secs(1);
        }

        let (established, _) = watch::channel(false);
        let (events, _) = broadcast::channel(64);
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            opts: Arc::new(opts),
            shared: Arc::new(Shared {
                opened: AtomicBool::new(false),
                live: AtomicUsize::new(0),
                established,
                events,
                shutdown,
                legs: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn options(&self) -> &TunnelOptions {
        &self.opts
    }

    /// Starts every leg. Subscribe first to see the events of the first
    /// connection attempts.
    pub fn open(&self) -> Result<(), TunnelError> {
        if self.shared.opened.swap(true, Ordering::AcqRel) {
            return Err(TunnelError::AlreadyOpen);
        }

        tracing::info!(
            remote = %self.opts.remote_addr(),
            local = %self.opts.local_addr(),
            legs = self.opts.max_connections,
            "tunnel: opening"
        );

        let mut legs = self
            .shared
            .legs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for index in 0..self.opts.max_connections {
            let leg = Leg::new(index, self.opts.clone(), self.shared.clone());
            let span = tracing::debug_span!("leg", index);
            legs.push(tokio::spawn(leg.run().instrument(span)));
        }
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.shared.events.subscribe()
    }

    /// Resolves `true` once a leg is paired, `false` if the tunnel closes
    /// first.
    pub async fn wait_established(&self) -> bool {
        let mut established = self.shared.established.subscribe();
        let mut shutdown = self.shared.shutdown.subscribe();
        tokio::select! {
            ok = raised(&mut established) => ok,
            _ = raised(&mut shutdown) => false,
        }
    }

    /// Legs whose remote half is currently connected.
    pub fn open_legs(&self) -> usize {
        self.shared.live.load(Ordering::Acquire)
    }

    /// Closes every leg and waits for them to finish.
    pub async fn close(&self) {
        self.shared.shutdown.send_replace(true);
        let legs = std::mem::take(
            &mut *self
                .shared
                .legs
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for leg in legs {
            let _ = leg.await;
        }
        tracing::info!(remote = %self.opts.remote_addr(), "tunnel: closed");
    }
}

impl Drop for TunnelClient {
    fn drop(&mut self) {
        self.shared.shutdown.send_replace(true);
    }
}

/// A pool granted by the tunnel server.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolGrant {
    pub public_url: String,
    pub tunnel_port: u16,
    pub tunnel_host: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// Asks the tunnel server at `server_addr` (`host:port`) to create a pool
/// for `id`.
pub async fn request_pool(server_addr: &str, id: &str) -> anyhow::Result<PoolGrant> {
    let url = format!("http://{}/?id={id}", server_addr.trim());
    let resp = reqwest::Client::new()
        .get(&url)
        .send()
        .await
        .with_context(|| format!("tunnel: request pool from {server_addr}"))?;

    let status = resp.status();
    if status != reqwest::StatusCode::CREATED {
        let reason = resp
            .json::<ErrorBody>()
            .await
            .map(|body| body.error)
            .unwrap_or_else(|_| status.to_string());
        anyhow::bail!("tunnel: server refused pool {id:?}: {reason}");
    }

    resp.json::<PoolGrant>()
        .await
        .context("tunnel: decode pool grant")
}
