//! Tunnel client: keeps legs open from a private network to a pool port and
//! splices each one into the local service.

pub mod client;
pub mod leg;
pub mod rewrite;

pub use client::{TunnelClient, TunnelEvent, TunnelOptions, request_pool};

use tokio::sync::watch;

/// Resolves `true` once the flag is set, `false` if its sender is gone.
pub(crate) async fn raised(rx: &mut watch::Receiver<bool>) -> bool {
    rx.wait_for(|v| *v).await.is_ok()
}
