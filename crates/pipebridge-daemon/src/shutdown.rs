//! Shutdown signalling shared by the server and its connections.
//!
//! The binary owns a `watch::Sender<bool>`; sending `true` asks every
//! holder of a receiver to wind down.

use tokio::sync::watch;

/// Create a shutdown channel in the "running" state.
pub fn channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// Resolves once shutdown is signalled or the sending side is gone.
pub async fn requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
