use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{
    sync::{broadcast, watch},
    task::JoinSet,
};

use crate::tunnelgate::{
    admin, config,
    gateway::{Gateway, GatewayOptions},
    logging, net,
    router::{self, PortRange, RouterOptions},
    telemetry,
    tunnel::{self, TunnelClient, TunnelEvent, TunnelOptions},
};

pub async fn run(config_path: Option<PathBuf>, local_port: Option<u16>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;

    let created = config::ensure_config_file(&resolved.path)?;

    let mut cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt; // keep alive

    if created {
        tracing::warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
    }

    if let (Some(port), Some(client)) = (local_port, cfg.client.as_mut()) {
        client.local_port = port;
    }

    let server_enabled = cfg.server.is_some();
    let client_enabled = cfg.client.is_some();
    let admin_enabled = !cfg.admin_addr.trim().is_empty();

    tracing::info!(
        config = %resolved.path.display(),
        server_enabled,
        client_enabled,
        admin_addr = %cfg.admin_addr,
        "tunnelgate: starting"
    );

    let prom = Arc::new(telemetry::init_prometheus()?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();

    let rtr = cfg.server.as_ref().map(|sc| {
        router::Router::new(RouterOptions {
            pool_bind_addr: sc.pools.bind_addr.clone(),
            port_range: PortRange {
                min: sc.pools.port_min,
                max: sc.pools.port_max,
            },
            max_pools: sc.pools.max_pools,
            pool_max_connections: sc.pools.max_connections,
            pool_idle_timeout: sc.pools.idle_timeout,
            socket_timeout: sc.pools.socket_timeout,
        })
    });

    // Admin server.
    if admin_enabled {
        let admin_addr = net::normalize_bind_addr(&cfg.admin_addr);
        let addr: SocketAddr = admin_addr
            .parse()
            .with_context(|| format!("invalid admin_addr: {}", cfg.admin_addr))?;

        let admin_state = admin::AdminState {
            prom: prom.clone(),
            router: rtr.clone(),
        };

        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { admin::serve_with_shutdown(addr, admin_state, shutdown).await });
    }

    // Tunnel server.
    if let (Some(sc), Some(rtr)) = (&cfg.server, &rtr) {
        let gw = Gateway::new(
            rtr.clone(),
            GatewayOptions {
                public_host: sc.public_host.clone(),
                public_port: sc.public_port,
                static_dir: sc.static_dir.clone(),
                max_header_bytes: sc.max_header_bytes,
                header_timeout: sc.header_timeout,
            },
        );
        let listen_addr = sc.listen_addr.clone();
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { gw.serve_with_shutdown(&listen_addr, shutdown).await });
    }

    // Tunnel client.
    if let Some(cc) = cfg.client.clone() {
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { run_client(cc, shutdown).await });
    }

    // Wait for shutdown signal (Ctrl-C / SIGTERM) or unexpected task termination.
    let outcome = tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            Ok(())
        }
        res = tasks.join_next() => match res {
            Some(Ok(Ok(()))) | None => Ok(()),
            Some(Ok(Err(err))) => Err(err),
            Some(Err(join_err)) => Err(join_err.into()),
        }
    };
    let _ = shutdown_tx.send(true);
    if let Some(rtr) = &rtr {
        rtr.close_all();
    }

    // Drain tasks: exit as soon as they complete; only enforce a timeout if something hangs.
    let drain = async { while tasks.join_next().await.is_some() {} };

    // Hard cap so `docker stop` doesn't stall indefinitely.
    let drain_timeout = Duration::from_secs(5);
    if tokio::time::timeout(drain_timeout, drain).await.is_err() {
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    outcome
}

/// Requests a pool and keeps the tunnel open until shutdown or until the
/// server refuses us.
async fn run_client(
    cc: config::ClientConfig,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let grant = tunnel::request_pool(&cc.server_addr, &cc.pool_id).await?;

    // The pool listens on the server we asked, not necessarily on the public host.
    let client = TunnelClient::new(TunnelOptions {
        local_address: cc.local_address.clone(),
        local_port: cc.local_port,
        remote_address: net::host_of(&cc.server_addr).to_string(),
        remote_port: grant.tunnel_port,
        max_connections: cc.max_connections,
        local_retry_delay: cc.local_retry_delay,
        transform: None,
    })?;

    let mut events = client.subscribe();
    client.open()?;
    tracing::info!(
        pool = %cc.pool_id,
        url = %grant.public_url,
        tunnel_host = %grant.tunnel_host,
        local = %client.options().local_addr(),
        "client: your url is {}",
        grant.public_url
    );

    let res = loop {
        tokio::select! {
            _ = tunnel::raised(&mut shutdown) => break Ok(()),
            ev = events.recv() => match ev {
                Ok(TunnelEvent::Established) => {
                    tracing::info!(pool = %cc.pool_id, legs = client.open_legs(), "client: tunnel established");
                }
                Ok(TunnelEvent::Error(err)) => break Err(anyhow::Error::new(err)),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!(skipped = n, "client: tunnel events lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break Ok(()),
            },
        }
    };

    client.close().await;
    res
}

async fn shutdown_signal() {
    // Ctrl-C works cross-platform.
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
