//! Registry of upgraded socket connections.
//!
//! Each connection task owns its socket; the registry only keeps a handle
//! per connection so shutdown can ask every task to send a close frame.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::mpsc;

/// Unique identifier for a connection, assigned by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

/// Handle to one connection task.
#[derive(Debug)]
pub struct ConnectionHandle {
    /// Unique connection identifier assigned by the registry.
    pub id: ConnectionId,
    /// Route the connection was upgraded on.
    pub route: String,
    /// When this connection was established.
    pub connected_at: Instant,
    close_tx: mpsc::Sender<String>,
}

impl ConnectionHandle {
    /// Asks the connection task to send a close frame and stop.
    ///
    /// Returns `false` if a close is already pending or the task has exited.
    #[must_use]
    pub fn request_close(&self, reason: &str) -> bool {
        self.close_tx.try_send(reason.to_string()).is_ok()
    }
}

/// Thread-safe registry of all active socket connections.
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<ConnectionHandle>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    /// Creates a new empty registry.
    ///
    /// Connection IDs start at 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a connection, returning its handle and the close-request receiver
    /// the connection task must watch.
    pub fn register(&self, route: &str) -> (Arc<ConnectionHandle>, mpsc::Receiver<String>) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (close_tx, close_rx) = mpsc::channel(1);

        let handle = Arc::new(ConnectionHandle {
            id,
            route: route.to_string(),
            connected_at: Instant::now(),
            close_tx,
        });

        self.connections.insert(id, Arc::clone(&handle));
        (handle, close_rx)
    }

    /// Removes a connection from the registry, returning its handle if found.
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections.remove(&id).map(|(_, handle)| handle)
    }

    /// Returns the total number of active connections.
    #[must_use]
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Counts connections upgraded on `route`.
    #[must_use]
    pub fn count_on_route(&self, route: &str) -> usize {
        self.connections
            .iter()
            .filter(|entry| entry.value().route == route)
            .count()
    }

    /// Removes and returns all connections. Used during graceful shutdown.
    pub fn drain_all(&self) -> Vec<Arc<ConnectionHandle>> {
        let keys: Vec<ConnectionId> = self
            .connections
            .iter()
            .map(|entry| *entry.key())
            .collect();

        let mut handles = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some((_, handle)) = self.connections.remove(&key) {
                handles.push(handle);
            }
        }
        handles
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_register_and_count() {
        let registry = ConnectionRegistry::new();
        assert_eq!(registry.count(), 0);

        let (handle1, _rx1) = registry.register("/calc");
        assert_eq!(handle1.id, ConnectionId(1));
        assert_eq!(handle1.route, "/calc");

        let (handle2, _rx2) = registry.register("/echo");
        assert_eq!(handle2.id, ConnectionId(2));
        assert_eq!(registry.count(), 2);
        assert_eq!(registry.count_on_route("/calc"), 1);
    }

    #[test]
    fn registry_remove() {
        let registry = ConnectionRegistry::new();
        let (handle, _rx) = registry.register("/calc");
        let id = handle.id;

        assert_eq!(registry.remove(id).unwrap().id, id);
        assert_eq!(registry.count(), 0);
        assert!(registry.remove(id).is_none());
        assert!(registry.remove(ConnectionId(999)).is_none());
    }

    #[tokio::test]
    async fn request_close_reaches_the_task() {
        let registry = ConnectionRegistry::new();
        let (handle, mut rx) = registry.register("/calc");

        assert!(handle.request_close("bye"));
        // The channel holds a single pending request.
        assert!(!handle.request_close("again"));
        assert_eq!(rx.recv().await.as_deref(), Some("bye"));
    }

    #[test]
    fn close_request_after_task_exit_fails() {
        let registry = ConnectionRegistry::new();
        let (handle, rx) = registry.register("/calc");
        drop(rx);
        assert!(!handle.request_close("late"));
        assert!(handle.connected_at.elapsed() < std::time::Duration::from_secs(60));
    }

    #[test]
    fn drain_all_empties_registry() {
        let registry = ConnectionRegistry::new();
        let (_h1, _rx1) = registry.register("/a");
        let (_h2, _rx2) = registry.register("/b");

        let drained = registry.drain_all();
        assert_eq!(drained.len(), 2);
        assert_eq!(registry.count(), 0);
    }
}
