//! Registry of live connections.
//!
//! Enforces the connection limit and keeps counters for logging. A
//! connection stays registered for as long as its [`RegistrationGuard`]
//! is alive.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tracing::{debug, info, warn};

use super::types::{ConnectionInfo, RegistryError, RegistryStats};

#[derive(Default)]
struct Inner {
    connections: HashMap<String, ConnectionInfo>,
    total_accepted: u64,
    total_refused: u64,
}

/// Tracks attached connections up to a maximum.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<Mutex<Inner>>,
    max_connections: usize,
}

impl ConnectionRegistry {
    pub fn new(max_connections: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            max_connections,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new connection, generating its id.
    pub fn register(&self, peer: Option<SocketAddr>) -> Result<RegistrationGuard, RegistryError> {
        let mut inner = self.lock();

        if inner.connections.len() >= self.max_connections {
            inner.total_refused += 1;
            drop(inner);
            warn!(?peer, max = self.max_connections, "Connection limit reached");
            return Err(RegistryError::TooManyConnections {
                max: self.max_connections,
            });
        }

        let connection_id = uuid::Uuid::new_v4().to_string();
        inner.connections.insert(
            connection_id.clone(),
            ConnectionInfo {
                connection_id: connection_id.clone(),
                peer,
                connected_at: Instant::now(),
            },
        );
        inner.total_accepted += 1;
        let active = inner.connections.len();
        drop(inner);

        info!(connection_id, ?peer, active, "Connection registered");
        Ok(RegistrationGuard {
            registry: self.clone(),
            connection_id,
        })
    }

    fn unregister(&self, connection_id: &str) {
        let mut inner = self.lock();
        if let Some(info) = inner.connections.remove(connection_id) {
            let active = inner.connections.len();
            drop(inner);
            debug!(
                connection_id,
                active,
                duration_ms = u64::try_from(info.connected_at.elapsed().as_millis()).unwrap_or(u64::MAX),
                "Connection unregistered"
            );
        }
    }

    /// Snapshot of the live connections.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.lock().connections.values().cloned().collect()
    }

    pub fn stats(&self) -> RegistryStats {
        let inner = self.lock();
        RegistryStats {
            active: inner.connections.len(),
            total_accepted: inner.total_accepted,
            total_refused: inner.total_refused,
        }
    }

    pub const fn max_connections(&self) -> usize {
        self.max_connections
    }
}

/// Keeps a connection registered until dropped.
pub struct RegistrationGuard {
    registry: ConnectionRegistry,
    connection_id: String,
}

impl RegistrationGuard {
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        self.registry.unregister(&self.connection_id);
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn register_and_drop() {
        let registry = ConnectionRegistry::new(4);
        let guard = registry.register(None).unwrap();
        assert_eq!(registry.stats().active, 1);
        assert_eq!(registry.connections()[0].connection_id, guard.connection_id());

        drop(guard);
        let stats = registry.stats();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.total_accepted, 1);
    }

    #[test]
    fn max_connections_enforced() {
        let registry = ConnectionRegistry::new(2);
        let _a = registry.register(None).unwrap();
        let _b = registry.register(None).unwrap();

        let result = registry.register(None);
        assert!(matches!(
            result,
            Err(RegistryError::TooManyConnections { max: 2 })
        ));
        assert_eq!(registry.stats().total_refused, 1);
    }

    #[test]
    fn slot_frees_after_disconnect() {
        let registry = ConnectionRegistry::new(1);
        let first = registry.register(None).unwrap();
        assert!(registry.register(None).is_err());
        drop(first);
        assert!(registry.register(None).is_ok());
    }
}
