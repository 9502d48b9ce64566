use std::{net::SocketAddr, sync::Arc};

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use serde::Serialize;
use tokio::sync::watch;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::tunnelgate::{router, telemetry};

#[derive(Clone)]
pub struct AdminState {
    pub prom: telemetry::SharedPrometheusHandle,
    /// Present when this process runs the tunnel server.
    pub router: Option<Arc<router::Router>>,
}

fn app(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/pools", get(pools))
        .with_state(Arc::new(state))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub async fn serve_with_shutdown(
    addr: SocketAddr,
    state: AdminState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    tracing::info!(admin_addr = %addr, "admin: listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await?;

    Ok(())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
    pools: usize,
}

async fn health(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    let pools = st.router.as_ref().map_or(0, |r| r.pool_count());
    (StatusCode::OK, Json(HealthResponse { ok: true, pools }))
}

async fn metrics(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        st.prom.render(),
    )
}

async fn pools(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    let snap = st
        .router
        .as_ref()
        .map(|r| r.snapshot())
        .unwrap_or_default();
    (StatusCode::OK, Json(snap))
}
