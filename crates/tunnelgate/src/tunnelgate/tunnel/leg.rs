//! One tunnel leg: a connection to the pool port paired with a connection to
//! the local service.
//!
//! ```text
//! ConnectingRemote --ok--> PairingLocal --ok--> Piped --either side ends--> ConnectingRemote
//!        |                   |    ^   |
//!        | failed            |    |   +--other local error--> ConnectingRemote
//!        v                   |    |
//!      Closed     refused -> Backoff  (remote closes meanwhile -> ConnectingRemote)
//! ```

use std::{io, sync::Arc};

use bytes::BytesMut;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::watch,
    time,
};

use crate::tunnelgate::{
    net::{self, Probe},
    tunnel::{
        client::{LiveGuard, Shared, TunnelError, TunnelEvent, TunnelOptions},
        raised,
        rewrite::TransformChain,
    },
};

/// A connected remote half.
pub(crate) struct Remote {
    stream: TcpStream,
    _live: LiveGuard,
}

pub(crate) enum LegState {
    ConnectingRemote,
    PairingLocal(Remote),
    Backoff(Remote),
    Piped { remote: Remote, local: TcpStream },
    Closed,
}

impl LegState {
    fn name(&self) -> &'static str {
        match self {
            LegState::ConnectingRemote => "connecting_remote",
            LegState::PairingLocal(_) => "pairing_local",
            LegState::Backoff(_) => "backoff",
            LegState::Piped { .. } => "piped",
            LegState::Closed => "closed",
        }
    }
}

/// What a failed local connect means for the leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LocalFailure {
    /// Keep the remote and try again after the retry delay.
    RetryLater,
    /// Drop both halves and rebuild the leg.
    Abandon,
}

pub(crate) fn classify_local_error(err: &io::Error) -> LocalFailure {
    match err.kind() {
        io::ErrorKind::ConnectionRefused => LocalFailure::RetryLater,
        _ => LocalFailure::Abandon,
    }
}

pub(crate) struct Leg {
    index: usize,
    opts: Arc<TunnelOptions>,
    shared: Arc<Shared>,
    shutdown: watch::Receiver<bool>,
}

impl Leg {
    pub(crate) fn new(index: usize, opts: Arc<TunnelOptions>, shared: Arc<Shared>) -> Self {
        let shutdown = shared.shutdown.subscribe();
        Self {
            index,
            opts,
            shared,
            shutdown,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut state = LegState::ConnectingRemote;
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            tracing::trace!(leg = self.index, state = state.name(), "tunnel: leg step");
            state = match state {
                LegState::ConnectingRemote => self.connect_remote().await,
                LegState::PairingLocal(remote) => self.pair_local(remote).await,
                LegState::Backoff(remote) => self.backoff(remote).await,
                LegState::Piped { remote, local } => self.pipe(remote, local).await,
                LegState::Closed => break,
            };
        }
        tracing::debug!(leg = self.index, "tunnel: leg closed");
    }

    async fn connect_remote(&mut self) -> LegState {
        let addr = self.opts.remote_addr();
        let connect = TcpStream::connect(addr.as_str());
        let res = tokio::select! {
            res = connect => res,
            _ = raised(&mut self.shutdown) => return LegState::Closed,
        };

        match res {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                if let Err(err) = net::set_keepalive(&stream) {
                    tracing::debug!(leg = self.index, err = %err, "tunnel: failed to enable keep-alive");
                }
                tracing::debug!(leg = self.index, remote = %addr, "tunnel: remote connected");
                LegState::PairingLocal(Remote {
                    stream,
                    _live: LiveGuard::new(&self.shared),
                })
            }
            Err(err) => {
                tracing::error!(leg = self.index, remote = %addr, err = %err, "tunnel: cannot reach tunnel server");
                if err.kind() == io::ErrorKind::ConnectionRefused {
                    self.shared.emit(TunnelEvent::Error(TunnelError::RemoteRefused(addr)));
                }
                LegState::Closed
            }
        }
    }

    async fn pair_local(&mut self, remote: Remote) -> LegState {
        if matches!(net::probe(&remote.stream), Probe::Closed | Probe::Failed(_)) {
            tracing::debug!(leg = self.index, "tunnel: remote already closed; reconnecting");
            return LegState::ConnectingRemote;
        }

        let addr = self.opts.local_addr();
        let res = tokio::select! {
            res = TcpStream::connect(addr.as_str()) => res,
            _ = net::closed(&remote.stream) => {
                tracing::debug!(leg = self.index, "tunnel: remote closed while pairing; abandoning local connect");
                return LegState::ConnectingRemote;
            }
            _ = raised(&mut self.shutdown) => return LegState::Closed,
        };

        match res {
            Ok(local) => {
                let _ = local.set_nodelay(true);
                tracing::debug!(leg = self.index, local = %addr, "tunnel: paired with local service");
                self.shared.mark_established();
                LegState::Piped { remote, local }
            }
            Err(err) => match classify_local_error(&err) {
                LocalFailure::RetryLater => {
                    tracing::warn!(
                        leg = self.index,
                        local = %addr,
                        retry_in = %humantime::format_duration(self.opts.local_retry_delay),
                        "tunnel: local service refused connection; retrying"
                    );
                    LegState::Backoff(remote)
                }
                LocalFailure::Abandon => {
                    tracing::warn!(leg = self.index, local = %addr, err = %err, "tunnel: local connect failed; rebuilding leg");
                    let mut remote = remote;
                    let _ = remote.stream.shutdown().await;
                    LegState::ConnectingRemote
                }
            },
        }
    }

    async fn backoff(&mut self, remote: Remote) -> LegState {
        tokio::select! {
            _ = time::sleep(self.opts.local_retry_delay) => LegState::PairingLocal(remote),
            _ = net::closed(&remote.stream) => {
                tracing::debug!(leg = self.index, "tunnel: remote closed during backoff");
                LegState::ConnectingRemote
            }
            _ = raised(&mut self.shutdown) => LegState::Closed,
        }
    }

    async fn pipe(&mut self, mut remote: Remote, mut local: TcpStream) -> LegState {
        let mut chain = self.opts.transform_chain();
        let (up, down) = {
            let (mut remote_rd, mut remote_wr) = remote.stream.split();
            let (mut local_rd, mut local_wr) = local.split();
            tokio::select! {
                res = relay(&mut remote_rd, &mut local_wr, &mut chain) => (Some(res), None),
                res = tokio::io::copy(&mut local_rd, &mut remote_wr) => (None, Some(res)),
                _ = raised(&mut self.shutdown) => (None, None),
            }
        };
        match (up, down) {
            (Some(Err(err)), _) | (_, Some(Err(err))) => {
                tracing::debug!(leg = self.index, err = %err, "tunnel: pipe error");
            }
            (Some(Ok(n)), _) => {
                tracing::debug!(leg = self.index, bytes = n, "tunnel: remote ended");
            }
            (_, Some(Ok(n))) => {
                tracing::debug!(leg = self.index, bytes = n, "tunnel: local service ended");
            }
            (None, None) => {}
        }

        let _ = local.shutdown().await;
        let _ = remote.stream.shutdown().await;
        if *self.shutdown.borrow() {
            LegState::Closed
        } else {
            LegState::ConnectingRemote
        }
    }
}

/// Copies `reader` into `writer` through `chain`, flushing held-back bytes at
/// EOF.
async fn relay<R, W>(reader: &mut R, writer: &mut W, chain: &mut TransformChain) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(16 * 1024);
    let mut total = 0u64;
    loop {
        buf.reserve(16 * 1024);
        if reader.read_buf(&mut buf).await? == 0 {
            let tail = chain.flush();
            if !tail.is_empty() {
                writer.write_all(&tail).await?;
                total += tail.len() as u64;
            }
            writer.flush().await?;
            return Ok(total);
        }
        let out = chain.transform(buf.split().freeze());
        writer.write_all(&out).await?;
        total += out.len() as u64;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::TcpListener;

    use super::*;
    use crate::tunnelgate::tunnel::client::TunnelClient;

    fn options(local_address: &str, local_port: u16, remote_port: u16) -> TunnelOptions {
        TunnelOptions {
            local_address: local_address.into(),
            local_port,
            remote_address: "127.0.0.1".into(),
            remote_port,
            max_connections: 1,
            local_retry_delay: Duration::from_millis(200),
            transform: None,
        }
    }

    async fn free_port() -> u16 {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        ln.local_addr().unwrap().port()
    }

    #[test]
    fn local_errors_are_classified() {
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        let other = io::Error::from(io::ErrorKind::TimedOut);
        assert_eq!(classify_local_error(&refused), LocalFailure::RetryLater);
        assert_eq!(classify_local_error(&other), LocalFailure::Abandon);
    }

    #[tokio::test]
    async fn refused_local_is_retried_on_the_same_remote() {
        let pool = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote_port = pool.local_addr().unwrap().port();
        let local_port = free_port().await;

        let client = TunnelClient::new(options("127.0.0.1", local_port, remote_port)).unwrap();
        client.open().unwrap();
        let (mut remote, _) = pool.accept().await.unwrap();

        // Local service comes up only after the first attempt was refused.
        time::sleep(Duration::from_millis(100)).await;
        let local = TcpListener::bind(("127.0.0.1", local_port)).await.unwrap();
        let (mut paired, _) = time::timeout(Duration::from_secs(2), local.accept())
            .await
            .expect("retried after backoff")
            .unwrap();
        assert!(client.wait_established().await);

        remote.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        paired.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        paired.write_all(b"pong").await.unwrap();
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        // No second remote connection was made while backing off.
        assert!(
            time::timeout(Duration::from_millis(100), pool.accept())
                .await
                .is_err()
        );
        client.close().await;
    }

    #[tokio::test]
    async fn unresolvable_local_rebuilds_both_halves() {
        let pool = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote_port = pool.local_addr().unwrap().port();

        let client =
            TunnelClient::new(options("nonexistent.invalid", 8080, remote_port)).unwrap();
        client.open().unwrap();

        let (mut first, _) = pool.accept().await.unwrap();
        let mut buf = [0u8; 16];
        let n = time::timeout(Duration::from_secs(5), first.read(&mut buf))
            .await
            .expect("remote half shut down")
            .unwrap_or(0);
        assert_eq!(n, 0);

        let second = time::timeout(Duration::from_secs(5), pool.accept()).await;
        assert!(second.is_ok(), "a fresh remote half was connected");
        client.close().await;
    }

    #[tokio::test]
    async fn remote_close_while_pairing_reconnects() {
        let pool = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote_port = pool.local_addr().unwrap().port();
        let local_port = free_port().await;

        let client = TunnelClient::new(options("127.0.0.1", local_port, remote_port)).unwrap();
        client.open().unwrap();

        let (first, _) = pool.accept().await.unwrap();
        drop(first);
        let second = time::timeout(Duration::from_secs(2), pool.accept()).await;
        assert!(second.is_ok(), "leg reconnected to the pool");
        client.close().await;
        assert_eq!(client.open_legs(), 0);
    }

    #[tokio::test]
    async fn refused_remote_emits_error() {
        let remote_port = free_port().await;
        let client = TunnelClient::new(options("127.0.0.1", 8080, remote_port)).unwrap();
        let mut events = client.subscribe();
        client.open().unwrap();

        let event = time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            event,
            TunnelEvent::Error(TunnelError::RemoteRefused(_))
        ));
        client.close().await;
        assert_eq!(client.open_legs(), 0);
    }

    #[tokio::test]
    async fn ended_pipe_rebuilds_leg() {
        let pool = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote_port = pool.local_addr().unwrap().port();
        let local = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_port = local.local_addr().unwrap().port();

        let client = TunnelClient::new(options("127.0.0.1", local_port, remote_port)).unwrap();
        client.open().unwrap();
        let (_remote, _) = pool.accept().await.unwrap();
        let (paired, _) = local.accept().await.unwrap();
        assert_eq!(client.open_legs(), 1);

        // Local service hangs up; the leg dials the pool again.
        drop(paired);
        let again = time::timeout(Duration::from_secs(2), pool.accept()).await;
        assert!(again.is_ok());
        client.close().await;
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn host_header_rewritten_for_non_loopback_target() {
        let pool = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote_port = pool.local_addr().unwrap().port();
        let local = TcpListener::bind("0.0.0.0:0").await.unwrap();
        let local_port = local.local_addr().unwrap().port();

        let client = TunnelClient::new(options("0.0.0.0", local_port, remote_port)).unwrap();
        client.open().unwrap();
        let (mut remote, _) = pool.accept().await.unwrap();
        let (mut paired, _) = local.accept().await.unwrap();

        remote
            .write_all(b"GET / HTTP/1.1\r\nHost: abc.example.com\r\nAccept: */*\r\n\r\n")
            .await
            .unwrap();
        let expected: &[u8] = b"GET / HTTP/1.1\r\nHost: 0.0.0.0\r\nAccept: */*\r\n\r\n";
        let mut got = vec![0u8; expected.len()];
        paired.read_exact(&mut got).await.unwrap();
        assert_eq!(got, expected);
        client.close().await;
    }
}
