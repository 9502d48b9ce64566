use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Installs a Prometheus recorder for the `metrics` crate and returns a handle used to render
/// the exposition format.
///
/// This should be called once per process at startup.
pub fn init_prometheus() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("metrics: install Prometheus recorder")?;
    describe();
    Ok(handle)
}

fn describe() {
    metrics::describe_counter!(
        "tunnelgate_pool_connections_total",
        "Tunnel connections accepted by pools"
    );
    metrics::describe_counter!(
        "tunnelgate_pool_connections_rejected_total",
        "Tunnel connections rejected because the pool was full"
    );
    metrics::describe_counter!(
        "tunnelgate_gateway_connections_total",
        "Public connections accepted by the gateway"
    );
    metrics::describe_counter!(
        "tunnelgate_http_requests_total",
        "Routed HTTP requests by outcome"
    );
    metrics::describe_counter!("tunnelgate_websockets_total", "Spliced upgrade requests");
    metrics::describe_counter!("tunnelgate_pools_created_total", "Pools created");
    metrics::describe_gauge!("tunnelgate_pools_active", "Pools currently registered");
    metrics::describe_gauge!(
        "tunnelgate_tunnel_legs_open",
        "Client legs with a connected remote half"
    );
}

pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub type SharedPrometheusHandle = Arc<PrometheusHandle>;
