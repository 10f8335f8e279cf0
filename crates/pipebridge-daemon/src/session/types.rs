//! Connection session types.

use std::net::SocketAddr;
use std::time::Instant;

/// Why a connection loop ended normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client sent a close frame or the stream ended.
    ClientClosed,
    /// The bridged process exited and its output was delivered.
    BridgeTerminated,
    /// The server is shutting down.
    ServerShutdown,
}

/// Errors that end a connection abnormally.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Connection state tracked by the registry.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub connection_id: String,
    pub peer: Option<SocketAddr>,
    pub connected_at: Instant,
}

/// Registry statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    /// Currently attached connections.
    pub active: usize,
    /// Connections accepted since start.
    pub total_accepted: u64,
    /// Connections refused because the limit was reached.
    pub total_refused: u64,
}

/// Registry errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Too many connections (max: {max})")]
    TooManyConnections { max: usize },
}
