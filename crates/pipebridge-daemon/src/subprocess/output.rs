//! Fan-out of bridge output to connections.
//!
//! ```text
//! single-consumer: readers → mpsc ─┬→ connection A   (each message once)
//!                                  └→ connection B
//! broadcast:       readers → mpsc → forwarder → broadcast ─┬→ connection A
//!                                                          └→ connection B
//! ```

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use pipebridge_core::{FanoutPolicy, Message};

type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::Receiver<Message>>>;
type BroadcastSlot = Arc<Mutex<Option<broadcast::Sender<Message>>>>;

/// Owner side of the output queue, held by the bridge.
pub(crate) enum OutputHub {
    Shared(SharedReceiver),
    Broadcast(BroadcastSlot),
}

impl OutputHub {
    /// Wrap the bridge's output receiver according to `policy`.
    ///
    /// In broadcast mode this spawns the forwarder task.
    pub(crate) fn new(policy: FanoutPolicy, rx: mpsc::Receiver<Message>, capacity: usize) -> Self {
        match policy {
            FanoutPolicy::SingleConsumer => Self::Shared(Arc::new(tokio::sync::Mutex::new(rx))),
            FanoutPolicy::Broadcast => {
                let (tx, _) = broadcast::channel(capacity.max(1));
                let slot: BroadcastSlot = Arc::new(Mutex::new(Some(tx)));
                tokio::spawn(forward(rx, Arc::clone(&slot)));
                Self::Broadcast(slot)
            }
        }
    }

    pub(crate) fn subscribe(&self) -> OutputSubscription {
        let inner = match self {
            Self::Shared(rx) => Inner::Shared(Arc::clone(rx)),
            Self::Broadcast(slot) => slot
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .as_ref()
                .map_or(Inner::Closed, |tx| Inner::Broadcast(tx.subscribe())),
        };
        OutputSubscription { inner }
    }
}

async fn forward(mut rx: mpsc::Receiver<Message>, slot: BroadcastSlot) {
    while let Some(message) = rx.recv().await {
        let guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = guard.as_ref() {
            match tx.send(message) {
                Ok(receivers) => debug!(receivers, "Output broadcast"),
                Err(_) => debug!("No connections for broadcast output"),
            }
        }
    }
    // Dropping the last sender lets every subscriber observe end-of-stream.
    slot.lock().unwrap_or_else(PoisonError::into_inner).take();
    debug!("Output forwarder finished");
}

enum Inner {
    Shared(SharedReceiver),
    Broadcast(broadcast::Receiver<Message>),
    Closed,
}

/// A consumer's handle on the bridge output.
pub struct OutputSubscription {
    inner: Inner,
}

impl OutputSubscription {
    /// Wait for the next message.
    ///
    /// Returns `None` once the bridge has terminated and its output is drained.
    /// Cancel-safe: dropping the future never loses a message.
    pub async fn recv(&mut self) -> Option<Message> {
        match &mut self.inner {
            Inner::Shared(rx) => rx.lock().await.recv().await,
            Inner::Broadcast(rx) => loop {
                match rx.recv().await {
                    Ok(message) => return Some(message),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Connection fell behind, oldest output skipped");
                    }
                    Err(RecvError::Closed) => return None,
                }
            },
            Inner::Closed => None,
        }
    }
}
