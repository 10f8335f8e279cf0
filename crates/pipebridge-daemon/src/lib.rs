//! pipebridge Daemon Library
//!
//! Attaches websocket clients to a child process's standard streams:
//! - Process bridge owning the child and its stdio tasks
//! - Bounded input queue with overflow policies
//! - Per-connection channels translating frames and messages
//! - WebSocket server with connection limit and graceful shutdown

pub mod server;
pub mod session;
pub mod shutdown;
pub mod subprocess;
