use std::{borrow::Cow, io, net::IpAddr, time::Duration};

use futures_util::FutureExt;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;

/// Normalize a bind/listen address.
///
/// Config files commonly use the shorthand `":PORT"` to mean "bind on all
/// interfaces". Tokio bind APIs do not accept `":PORT"`, so we normalize it to
/// `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Joins a host and a port, bracketing bare IPv6 literals.
pub fn join_host_port(host: &str, port: u16) -> String {
    let host = host.trim();
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Port part of a `host:port` / `:port` listen address.
pub fn port_of(addr: &str) -> Option<u16> {
    let (_, port) = addr.trim().rsplit_once(':')?;
    port.parse().ok()
}

/// Host part of a `host:port` address, brackets removed.
pub fn host_of(addr: &str) -> &str {
    let addr = addr.trim();
    if let Some(rest) = addr.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match addr.rsplit_once(':') {
        Some((host, _)) if !host.contains(':') => host,
        _ => addr,
    }
}

/// Whether `host` names the loopback interface.
pub fn is_loopback_host(host: &str) -> bool {
    let host = host.trim().trim_start_matches('[').trim_end_matches(']');
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.parse::<IpAddr>().is_ok_and(|ip| ip.is_loopback())
}

pub fn set_keepalive(stream: &TcpStream) -> io::Result<()> {
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(60))
        .with_interval(Duration::from_secs(20));
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

/// Snapshot of a socket nobody is currently reading from.
#[derive(Debug)]
pub enum Probe {
    /// Nothing to read, peer still connected.
    Idle,
    /// Peer sent FIN.
    Closed,
    /// Bytes are waiting to be read.
    Pending,
    Failed(io::Error),
}

/// Non-blocking liveness check that never consumes bytes.
pub fn probe(stream: &TcpStream) -> Probe {
    let mut buf = [0u8; 1];
    match stream.peek(&mut buf).now_or_never() {
        None => Probe::Idle,
        Some(Ok(0)) => Probe::Closed,
        Some(Ok(_)) => Probe::Pending,
        Some(Err(err)) => Probe::Failed(err),
    }
}

/// Resolves once the peer closes (or breaks) a socket we are not reading.
///
/// If the peer sends data first the closure can no longer be observed without
/// consuming it, so the future stays pending from then on.
pub async fn closed(stream: &TcpStream) {
    loop {
        if stream.readable().await.is_err() {
            return;
        }
        match probe(stream) {
            Probe::Idle => continue,
            Probe::Closed | Probe::Failed(_) => return,
            Probe::Pending => std::future::pending::<()>().await,
        }
    }
}
