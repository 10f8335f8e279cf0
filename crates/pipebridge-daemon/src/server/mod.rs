//! WebSocket server for pipebridge.
//!
//! Accepts TCP connections, upgrades them to websockets and runs one
//! [`ConnectionChannel`] per connection against the shared bridge.

mod config;

pub use config::ServerConfig;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::SinkExt;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::{Message as WsMessage, Utf8Bytes};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, error, info, warn};

use crate::session::{ConnectionChannel, ConnectionRegistry, RegistryStats};
use crate::shutdown;
use crate::subprocess::{BridgeState, ProcessBridge};

/// Back-off after a failed `accept`, e.g. when out of file descriptors.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
}

/// Websocket server bound to one process bridge.
pub struct Server {
    config: ServerConfig,
    listener: TcpListener,
    bridge: Arc<ProcessBridge>,
    registry: ConnectionRegistry,
}

impl Server {
    /// Bind the listening socket.
    pub async fn bind(config: ServerConfig, bridge: Arc<ProcessBridge>) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(config.addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.addr,
                source,
            })?;
        let registry = ConnectionRegistry::new(config.max_connections);
        Ok(Self {
            config,
            listener,
            bridge,
            registry,
        })
    }

    /// The bound address (useful when binding port 0).
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub const fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    /// Accept connections until shutdown is signalled or the bridged process
    /// terminates.
    ///
    /// On the way out every connection gets `drain_timeout` to finish (each
    /// sends a close frame). Stragglers, such as peers that stopped reading,
    /// are aborted. Then the bridge is stopped.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> Result<BridgeState, ServerError> {
        let addr = self.local_addr()?;
        info!(%addr, max_connections = self.config.max_connections, "WebSocket server listening");

        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        connections.spawn(handle_connection(
                            stream,
                            peer,
                            Arc::clone(&self.bridge),
                            self.registry.clone(),
                            shutdown.clone(),
                        ));
                    }
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Connection task panicked");
                    }
                }
                state = self.bridge.wait_terminated() => {
                    info!(?state, "Bridged process terminated, no longer accepting connections");
                    break;
                }
                () = shutdown::requested(&mut shutdown) => {
                    info!("Shutdown requested");
                    break;
                }
            }
        }

        drop(self.listener);
        debug!(remaining = connections.len(), "Waiting for connections to close");
        if tokio::time::timeout(self.config.drain_timeout, join_all(&mut connections))
            .await
            .is_err()
        {
            for conn in self.registry.connections() {
                warn!(
                    connection_id = %conn.connection_id,
                    peer = ?conn.peer,
                    "Connection did not close in time, aborting"
                );
            }
            connections.abort_all();
            join_all(&mut connections).await;
        }

        let state = self.bridge.stop().await;
        let stats = self.registry.stats();
        info!(
            ?state,
            total_accepted = stats.total_accepted,
            total_refused = stats.total_refused,
            "Server stopped"
        );
        Ok(state)
    }
}

/// Wait for every connection task. Cancel-safe.
async fn join_all(connections: &mut JoinSet<()>) {
    while let Some(joined) = connections.join_next().await {
        if let Err(e) = joined
            && !e.is_cancelled()
        {
            error!(error = %e, "Connection task panicked");
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    bridge: Arc<ProcessBridge>,
    registry: ConnectionRegistry,
    mut shutdown: watch::Receiver<bool>,
) {
    let handshake = tokio::select! {
        handshake = tokio_tungstenite::accept_async(stream) => handshake,
        () = shutdown::requested(&mut shutdown) => {
            debug!(%peer, "Shutdown during handshake");
            return;
        }
    };
    let mut ws = match handshake {
        Ok(ws) => ws,
        Err(e) => {
            warn!(%peer, error = %e, "WebSocket handshake failed");
            return;
        }
    };

    let registration = match registry.register(Some(peer)) {
        Ok(registration) => registration,
        Err(e) => {
            let frame = CloseFrame {
                code: CloseCode::Again,
                reason: Utf8Bytes::from_static("too many connections"),
            };
            if let Err(send_err) = ws.send(WsMessage::Close(Some(frame))).await {
                debug!(%peer, error = %send_err, "Refusal not delivered");
            }
            debug!(%peer, error = %e, "Connection refused");
            return;
        }
    };

    let channel = ConnectionChannel::new(registration.connection_id(), ws, bridge, shutdown);
    if let Err(e) = channel.run().await {
        warn!(connection_id = %registration.connection_id(), %peer, error = %e, "Connection failed");
    }
}
