//! Public HTTP front end of the router.
//!
//! Every inbound connection carries one request. Upgrade requests are spliced
//! onto a tunnel connection as raw bytes; everything else is served by an
//! axum app that either routes through a pool, creates a pool (`/?id=<id>`)
//! or serves static files.

use std::{net::IpAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use axum::{
    Json,
    extract::{Query, Request, State},
    http::{StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
};
use hyper_util::{rt::TokioIo, service::TowerToHyperService};
use serde::{Deserialize, Serialize};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    sync::watch,
    time,
};
use tower_http::{services::ServeDir, trace::TraceLayer};

use crate::tunnelgate::{
    config, net,
    router::{self, Router},
    wire::{self, HeadError, Prefixed},
};

/// Extracts a pool identifier from a request's Host header.
pub trait IdentifierResolver: Send + Sync {
    fn resolve(&self, host: &str) -> Option<String>;
}

/// `<id>.<public_host>` resolves to `<id>`.
///
/// With no public host configured, everything left of the last two labels
/// is the identifier.
#[derive(Debug, Clone)]
pub struct SubdomainResolver {
    public_host: String,
}

impl SubdomainResolver {
    pub fn new(public_host: &str) -> Self {
        Self {
            public_host: public_host.trim().trim_end_matches('.').to_ascii_lowercase(),
        }
    }
}

impl IdentifierResolver for SubdomainResolver {
    fn resolve(&self, host: &str) -> Option<String> {
        let host = net::host_of(host)
            .trim_end_matches('.')
            .to_ascii_lowercase();
        if host.is_empty() || host.parse::<IpAddr>().is_ok() {
            return None;
        }

        let sub = if self.public_host.is_empty() {
            let labels: Vec<&str> = host.split('.').collect();
            if labels.len() <= 2 {
                return None;
            }
            labels[..labels.len() - 2].join(".")
        } else {
            host.strip_suffix(self.public_host.as_str())?
                .strip_suffix('.')?
                .to_string()
        };

        (!sub.is_empty()).then_some(sub)
    }
}

#[derive(Debug, Clone)]
pub struct GatewayOptions {
    pub public_host: String,
    pub public_port: u16,
    pub static_dir: Option<PathBuf>,
    pub max_header_bytes: usize,
    pub header_timeout: Duration,
}

impl GatewayOptions {
    fn public_url(&self, id: &str) -> String {
        if self.public_port == 80 {
            format!("http://{id}.{}", self.public_host)
        } else {
            format!("http://{id}.{}:{}", self.public_host, self.public_port)
        }
    }
}

struct GatewayState {
    router: Arc<Router>,
    resolver: Arc<dyn IdentifierResolver>,
    opts: GatewayOptions,
}

#[derive(Clone)]
pub struct Gateway {
    state: Arc<GatewayState>,
    app: axum::Router,
}

#[derive(Debug, Deserialize)]
struct CreateQuery {
    id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PoolCreated {
    public_url: String,
    tunnel_port: u16,
    tunnel_host: String,
}

impl Gateway {
    pub fn new(router: Arc<Router>, opts: GatewayOptions) -> Self {
        let resolver = Arc::new(SubdomainResolver::new(&opts.public_host));
        Self::with_resolver(router, resolver, opts)
    }

    pub fn with_resolver(
        router: Arc<Router>,
        resolver: Arc<dyn IdentifierResolver>,
        opts: GatewayOptions,
    ) -> Self {
        let state = Arc::new(GatewayState {
            router,
            resolver,
            opts,
        });

        let app = match &state.opts.static_dir {
            Some(dir) => axum::Router::new().fallback_service(ServeDir::new(dir)),
            None => axum::Router::new().fallback(not_found),
        };
        let app = app
            .layer(middleware::from_fn_with_state(state.clone(), dispatch))
            .layer(TraceLayer::new_for_http());

        Self { state, app }
    }

    pub async fn serve_with_shutdown(
        &self,
        listen_addr: &str,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let bind_addr = net::normalize_bind_addr(listen_addr);
        let ln = TcpListener::bind(bind_addr.as_ref())
            .await
            .with_context(|| format!("bind gateway {listen_addr}"))?;
        tracing::info!(
            listen_addr = %listen_addr,
            public_host = %self.state.opts.public_host,
            "gateway: listening"
        );
        self.serve_listener(ln, shutdown).await
    }

    pub async fn serve_listener(
        &self,
        ln: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                res = ln.accept() => {
                    let (conn, peer) = match res {
                        Ok(v) => v,
                        Err(err) => {
                            tracing::warn!(err = %err, "gateway: accept failed");
                            continue;
                        }
                    };
                    let gw = self.clone();
                    tokio::spawn(async move {
                        if tracing::enabled!(tracing::Level::DEBUG) {
                            tracing::debug!(client = %peer, "gateway: accepted");
                        }
                        gw.handle(conn).await;
                    });
                }
            }
        }
        Ok(())
    }

    async fn handle(&self, mut conn: TcpStream) {
        metrics::counter!("tunnelgate_gateway_connections_total").increment(1);
        let opts = &self.state.opts;
        let read = time::timeout(
            opts.header_timeout,
            wire::read_head(&mut conn, opts.max_header_bytes),
        )
        .await;

        let (head, mut buf) = match read {
            Ok(Ok(v)) => v,
            Ok(Err(HeadError::TooLarge(_))) => {
                reject(&mut conn, "431 Request Header Fields Too Large").await;
                return;
            }
            Ok(Err(HeadError::Malformed(err))) => {
                tracing::debug!(err = %err, "gateway: malformed request head");
                reject(&mut conn, "400 Bad Request").await;
                return;
            }
            Ok(Err(err)) => {
                tracing::debug!(err = %err, "gateway: failed to read request head");
                return;
            }
            Err(_) => {
                tracing::debug!("gateway: request head timed out");
                return;
            }
        };

        if head.is_upgrade() {
            let Some(id) = head.host().and_then(|h| self.state.resolver.resolve(h)) else {
                tracing::debug!(host = ?head.host(), "gateway: upgrade without tunnel id; dropping");
                return;
            };
            let leftover = buf.split_off(head.len).freeze();
            self.state
                .router
                .route_websocket(&id, &head, leftover, conn)
                .await;
            return;
        }

        let io = TokioIo::new(Prefixed::new(buf.freeze(), conn));
        let svc = TowerToHyperService::new(self.app.clone());
        if let Err(err) = hyper::server::conn::http1::Builder::new()
            .keep_alive(false)
            .serve_connection(io, svc)
            .await
        {
            tracing::debug!(err = %err, "gateway: connection error");
        }
    }
}

async fn reject(conn: &mut TcpStream, status: &str) {
    let resp = format!("HTTP/1.1 {status}\r\nConnection: close\r\nContent-Length: 0\r\n\r\n");
    let _ = conn.write_all(resp.as_bytes()).await;
    let _ = conn.shutdown().await;
    // Unread input turns the close into a reset, which can eat the response.
    let _ = time::timeout(
        Duration::from_millis(500),
        tokio::io::copy(conn, &mut tokio::io::sink()),
    )
    .await;
}

async fn dispatch(State(gw): State<Arc<GatewayState>>, req: Request, next: Next) -> Response {
    let id = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .and_then(|host| gw.resolver.resolve(host));
    if let Some(id) = id {
        return gw.router.route_http(&id, req).await;
    }

    if let Ok(Query(CreateQuery { id: Some(id) })) = Query::<CreateQuery>::try_from_uri(req.uri()) {
        return create_pool(&gw, &id).await;
    }

    next.run(req).await
}

async fn create_pool(gw: &GatewayState, id: &str) -> Response {
    let id = id.trim().to_ascii_lowercase();
    if !config::is_valid_pool_id(&id) {
        return router::error_response(
            StatusCode::BAD_REQUEST,
            "Pool id must be a DNS label (a-z, 0-9, '-')",
        );
    }

    match gw.router.create_pool(&id).await {
        Ok(pool) => {
            let created = PoolCreated {
                public_url: gw.opts.public_url(&id),
                tunnel_port: pool.port(),
                tunnel_host: gw.opts.public_host.clone(),
            };
            tracing::info!(pool = %id, port = created.tunnel_port, url = %created.public_url, "gateway: pool created");
            (StatusCode::CREATED, Json(created)).into_response()
        }
        Err(err) => router::error_response(StatusCode::BAD_REQUEST, &err.to_string()),
    }
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "not found")
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io;

    use async_trait::async_trait;
    use axum::extract::ws::{WebSocket, WebSocketUpgrade};
    use futures_util::{SinkExt, StreamExt};
    use tokio::io::AsyncReadExt;
    use tokio_tungstenite::tungstenite::Message;

    use crate::tunnelgate::{
        router::{PortFinder, PortRange, RouterOptions},
        tunnel::{TunnelClient, TunnelOptions, request_pool},
    };

    struct Ephemeral;

    #[async_trait]
    impl PortFinder for Ephemeral {
        async fn find(&self, _: &str, _: PortRange) -> io::Result<u16> {
            Ok(0)
        }
    }

    #[test]
    fn subdomain_resolution() {
        let r = SubdomainResolver::new("tunnel.test");
        assert_eq!(r.resolve("abc.tunnel.test"), Some("abc".into()));
        assert_eq!(r.resolve("ABC.tunnel.test:9000"), Some("abc".into()));
        assert_eq!(r.resolve("tunnel.test"), None);
        assert_eq!(r.resolve("abc.other.test"), None);
        assert_eq!(r.resolve("127.0.0.1:9000"), None);
        assert_eq!(r.resolve("[::1]:9000"), None);

        let any = SubdomainResolver::new("");
        assert_eq!(any.resolve("abc.example.com"), Some("abc".into()));
        assert_eq!(any.resolve("example.com"), None);
        assert_eq!(any.resolve("localhost:9000"), None);
    }

    async fn start_gateway(max_pools: usize) -> (u16, watch::Sender<bool>) {
        let router = Router::with_port_finder(
            RouterOptions {
                pool_bind_addr: "127.0.0.1".into(),
                port_range: PortRange { min: 0, max: 0 },
                max_pools,
                pool_max_connections: 4,
                pool_idle_timeout: Duration::from_secs(5),
                socket_timeout: Duration::from_secs(2),
            },
            Arc::new(Ephemeral),
        );
        let gw = Gateway::new(
            router,
            GatewayOptions {
                public_host: "tunnel.test".into(),
                public_port: 9000,
                static_dir: None,
                max_header_bytes: 16 * 1024,
                header_timeout: Duration::from_secs(2),
            },
        );
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = ln.local_addr().unwrap().port();
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move { gw.serve_listener(ln, rx).await });
        (port, tx)
    }

    async fn echo(mut socket: WebSocket) {
        while let Some(Ok(msg)) = socket.recv().await {
            if matches!(msg, axum::extract::ws::Message::Close(_)) {
                break;
            }
            if socket.send(msg).await.is_err() {
                break;
            }
        }
    }

    async fn start_local_service() -> u16 {
        let app = axum::Router::new()
            .route("/", axum::routing::get(|| async { "hello world" }))
            .route(
                "/ws",
                axum::routing::get(|ws: WebSocketUpgrade| async move { ws.on_upgrade(echo) }),
            );
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = ln.local_addr().unwrap().port();
        tokio::spawn(async move { axum::serve(ln, app).await });
        port
    }

    #[tokio::test]
    async fn end_to_end_http_and_websocket() {
        let (gw_port, _stop) = start_gateway(4).await;
        let local_port = start_local_service().await;

        let grant = request_pool(&format!("127.0.0.1:{gw_port}"), "test")
            .await
            .expect("pool created");
        assert_eq!(grant.public_url, "http://test.tunnel.test:9000");
        assert_eq!(grant.tunnel_host, "tunnel.test");

        let client = TunnelClient::new(TunnelOptions {
            local_address: "127.0.0.1".into(),
            local_port,
            remote_address: "127.0.0.1".into(),
            remote_port: grant.tunnel_port,
            max_connections: 2,
            local_retry_delay: Duration::from_millis(100),
            transform: None,
        })
        .unwrap();
        client.open().unwrap();
        assert!(
            time::timeout(Duration::from_secs(2), client.wait_established())
                .await
                .unwrap()
        );

        let http = reqwest::Client::new();
        for _ in 0..3 {
            let resp = http
                .get(format!("http://127.0.0.1:{gw_port}/"))
                .header(reqwest::header::HOST, "test.tunnel.test")
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), reqwest::StatusCode::OK);
            assert_eq!(resp.text().await.unwrap(), "hello world");
        }

        let stream = TcpStream::connect(("127.0.0.1", gw_port)).await.unwrap();
        let (mut ws, _) = tokio_tungstenite::client_async("ws://test.tunnel.test/ws", stream)
            .await
            .expect("websocket handshake through the tunnel");
        ws.send(Message::text("hello world")).await.unwrap();
        let reply = time::timeout(Duration::from_secs(2), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(reply.to_text().unwrap(), "hello world");
        let _ = ws.close(None).await;

        client.close().await;
    }

    #[tokio::test]
    async fn unknown_tunnel_is_502() {
        let (gw_port, _stop) = start_gateway(1).await;
        let resp = reqwest::Client::new()
            .get(format!("http://127.0.0.1:{gw_port}/"))
            .header(reqwest::header::HOST, "nobody.tunnel.test")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_GATEWAY);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(
            body["error"],
            "Unable to route to tunnel, client is not connected"
        );
    }

    #[tokio::test]
    async fn create_pool_errors_are_400() {
        let (gw_port, _stop) = start_gateway(2).await;
        let addr = format!("127.0.0.1:{gw_port}");

        request_pool(&addr, "first").await.expect("created");
        let err = request_pool(&addr, "first").await.unwrap_err();
        assert!(err.to_string().contains("already in use"), "{err}");

        let resp = reqwest::get(format!("http://{addr}/?id=Not_Valid")).await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert!(body["error"].is_string());

        request_pool(&addr, "second").await.expect("created");
        let err = request_pool(&addr, "third").await.unwrap_err();
        assert!(err.to_string().contains("maximum pools"), "{err}");
    }

    #[tokio::test]
    async fn plain_requests_fall_through() {
        let (gw_port, _stop) = start_gateway(1).await;
        let resp = reqwest::get(format!("http://127.0.0.1:{gw_port}/index.html"))
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn oversized_head_is_431() {
        let (gw_port, _stop) = start_gateway(1).await;
        let mut conn = TcpStream::connect(("127.0.0.1", gw_port)).await.unwrap();
        let big = format!("GET / HTTP/1.1\r\nX-Big: {}\r\n", "a".repeat(32 * 1024));
        let _ = conn.write_all(big.as_bytes()).await;
        let mut out = String::new();
        let _ = conn.read_to_string(&mut out).await;
        assert!(out.starts_with("HTTP/1.1 431"), "{out}");
    }

    async fn send_upgrade(gw_port: u16, host: &str) -> Vec<u8> {
        let mut conn = TcpStream::connect(("127.0.0.1", gw_port)).await.unwrap();
        let head = format!(
            "GET /ws HTTP/1.1\r\nHost: {host}\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n"
        );
        conn.write_all(head.as_bytes()).await.unwrap();
        conn.shutdown().await.unwrap();
        let mut rest = Vec::new();
        time::timeout(Duration::from_secs(2), conn.read_to_end(&mut rest))
            .await
            .expect("gateway closed the upgrade connection")
            .unwrap();
        rest
    }

    #[tokio::test]
    async fn unroutable_upgrades_are_closed() {
        let (gw_port, _stop) = start_gateway(1).await;
        assert!(send_upgrade(gw_port, "127.0.0.1").await.is_empty());
        assert!(send_upgrade(gw_port, "ghost.tunnel.test").await.is_empty());
    }

    #[tokio::test]
    async fn upgrade_abandoned_before_lease_reaches_no_tunnel() {
        let (gw_port, _stop) = start_gateway(1).await;
        let grant = request_pool(&format!("127.0.0.1:{gw_port}"), "idle")
            .await
            .expect("pool created");

        // No tunnel connection yet, so the upgrade waits for a lease until
        // the client goes away.
        assert!(send_upgrade(gw_port, "idle.tunnel.test").await.is_empty());

        let mut tunnel = TcpStream::connect(("127.0.0.1", grant.tunnel_port))
            .await
            .unwrap();
        let mut buf = [0u8; 64];
        assert!(
            time::timeout(Duration::from_millis(300), tunnel.read(&mut buf))
                .await
                .is_err(),
            "abandoned upgrade head was replayed"
        );
    }
}
