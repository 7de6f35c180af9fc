//! Server-scoped connection registry.
//!
//! A sharded concurrent map from [`ConnectionId`] to [`Connection`]. Lookups
//! on different shards never contend, writes to one key are serialized by
//! its shard lock, and resizing happens per shard under that lock, so
//! concurrent readers never see an entry vanish or appear twice.
//!
//! The registry also owns admission: guest connections are only created
//! while the number of live admitted connections is below the ceiling. The
//! budget is returned when the last reference to a connection is dropped,
//! not when it leaves the map, so connections still held by a socket task
//! keep counting.

use crate::error::{ResolveError, ResourceError};
use crate::session::connection::{AdmissionGuard, Connection, ConnectionId, UserId};
use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Registry limits.
#[derive(Debug, Clone, Copy)]
pub struct RegistryLimits {
    /// Ceiling on live admitted connections.
    pub max_connections: usize,
    /// Stream slots per connection.
    pub max_streams_per_connection: usize,
}

impl Default for RegistryLimits {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            max_streams_per_connection: 16,
        }
    }
}

/// Concurrent identifier → connection table.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    live: Arc<AtomicUsize>,
    limits: RegistryLimits,
}

impl ConnectionRegistry {
    pub fn new(limits: RegistryLimits) -> Self {
        Self {
            connections: DashMap::new(),
            live: Arc::new(AtomicUsize::new(0)),
            limits,
        }
    }

    pub fn limits(&self) -> RegistryLimits {
        self.limits
    }

    /// O(1) lookup.
    pub fn get_connection_by_id(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Create a guest connection if the ceiling allows it.
    ///
    /// The connection is not registered; callers register it once it is
    /// bound to a stream.
    pub fn make_new_guest_connection(&self) -> Result<Arc<Connection>, ResourceError> {
        let max = self.limits.max_connections;
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < max).then_some(live + 1)
            })
            .map_err(|_| ResourceError::ConnectionsExhausted { max })?;

        let guard = AdmissionGuard::new(Arc::clone(&self.live));
        let connection = Connection::new_guest(self.limits.max_streams_per_connection).admitted(guard);
        debug!(connection = %connection.id(), "Guest connection created");
        Ok(Arc::new(connection))
    }

    /// Insert `connection` unless its identifier is already present.
    ///
    /// Returns the registered instance, which is the existing one when the
    /// identifier was already known.
    pub fn register_connection(&self, connection: Arc<Connection>) -> Arc<Connection> {
        let entry = self
            .connections
            .entry(connection.id())
            .or_insert_with(|| connection);
        Arc::clone(entry.value())
    }

    /// Remove a connection explicitly.
    pub fn remove_connection(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.remove(&id).map(|(_, connection)| connection)
    }

    /// Look up `id` and check it belongs to `user`.
    ///
    /// A mismatch is treated as an attack: the connection is evicted and
    /// `IdentityMismatch` is returned.
    pub fn resolve(
        &self,
        id: ConnectionId,
        user: UserId,
    ) -> Result<Option<Arc<Connection>>, ResolveError> {
        let Some(connection) = self.get_connection_by_id(id) else {
            return Ok(None);
        };

        if connection.user() != user {
            warn!(connection = %id, "Identity mismatch, evicting connection");
            self.remove_connection(id);
            return Err(ResolveError::IdentityMismatch(id));
        }

        Ok(Some(connection))
    }

    /// Look up a delegated connection claimed by `principal`.
    ///
    /// The stored connection must carry `delegate_user` as its primary
    /// identity and `principal`'s user as its delegate; anything else evicts
    /// it.
    pub fn resolve_delegate(
        &self,
        principal: &Connection,
        id: ConnectionId,
        delegate_user: UserId,
    ) -> Result<Option<Arc<Connection>>, ResolveError> {
        let Some(connection) = self.get_connection_by_id(id) else {
            return Ok(None);
        };

        if !connection.matches(delegate_user, Some(principal.user())) {
            warn!(connection = %id, "Delegate identity mismatch, evicting connection");
            self.remove_connection(id);
            return Err(ResolveError::IdentityMismatch(id));
        }

        Ok(Some(connection))
    }

    /// Remove connections unused for at least `max_idle`. Returns the number
    /// evicted.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let now = Utc::now();
        let before = self.connections.len();
        self.connections
            .retain(|_, connection| connection.idle_for(now) < max_idle);
        before.saturating_sub(self.connections.len())
    }

    /// Snapshot of registered identifiers.
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|entry| *entry.key()).collect()
    }

    /// Registered connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Live admitted connections, registered or not.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn registry(max_connections: usize) -> ConnectionRegistry {
        ConnectionRegistry::new(RegistryLimits {
            max_connections,
            max_streams_per_connection: 4,
        })
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = registry(4);
        let conn = registry.make_new_guest_connection().unwrap();
        assert!(registry.get_connection_by_id(conn.id()).is_none());

        registry.register_connection(Arc::clone(&conn));
        let found = registry.get_connection_by_id(conn.id()).unwrap();
        assert!(Arc::ptr_eq(&found, &conn));
    }

    #[test]
    fn test_register_is_idempotent() {
        let registry = registry(4);
        let conn = registry.make_new_guest_connection().unwrap();

        let first = registry.register_connection(Arc::clone(&conn));
        let second = registry.register_connection(Arc::clone(&conn));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);

        // A different object with the same id does not replace the original.
        let resumed = Arc::new(Connection::with_identity(conn.id(), UserId::GUEST, None, 1));
        let kept = registry.register_connection(resumed);
        assert!(Arc::ptr_eq(&kept, &conn));
    }

    #[test]
    fn test_guest_ceiling() {
        let registry = registry(2);
        let a = registry.make_new_guest_connection().unwrap();
        let _b = registry.make_new_guest_connection().unwrap();
        assert_eq!(
            registry.make_new_guest_connection().unwrap_err(),
            ResourceError::ConnectionsExhausted { max: 2 }
        );

        // Dropping the last reference frees a slot.
        drop(a);
        assert_eq!(registry.live(), 1);
        assert!(registry.make_new_guest_connection().is_ok());
    }

    #[test]
    fn test_registered_connection_keeps_its_slot() {
        let registry = registry(1);
        let conn = registry.make_new_guest_connection().unwrap();
        let id = conn.id();
        registry.register_connection(conn);
        assert!(registry.make_new_guest_connection().is_err());

        registry.remove_connection(id);
        assert!(registry.make_new_guest_connection().is_ok());
    }

    #[test]
    fn test_resolve_mismatch_evicts() {
        let registry = registry(4);
        let conn = registry.make_new_guest_connection().unwrap();
        let person = UserId::from_uuid(Uuid::new_v4());
        conn.authenticate(person).unwrap();
        let id = conn.id();
        registry.register_connection(conn);

        assert!(registry.resolve(id, person).unwrap().is_some());
        assert!(registry
            .resolve(ConnectionId::new(), person)
            .unwrap()
            .is_none());

        let intruder = UserId::from_uuid(Uuid::new_v4());
        assert_eq!(
            registry.resolve(id, intruder).unwrap_err(),
            ResolveError::IdentityMismatch(id)
        );
        assert!(registry.get_connection_by_id(id).is_none());
    }

    #[test]
    fn test_resolve_delegate() {
        let registry = registry(4);
        let person = UserId::from_uuid(Uuid::new_v4());
        let org = UserId::from_uuid(Uuid::new_v4());

        let principal = registry.make_new_guest_connection().unwrap();
        principal.authenticate(person).unwrap();

        let delegated = registry.make_new_guest_connection().unwrap();
        delegated.authenticate(org).unwrap();
        delegated.delegate_to(person).unwrap();
        let delegated_id = delegated.id();
        registry.register_connection(delegated);

        let found = registry
            .resolve_delegate(&principal, delegated_id, org)
            .unwrap()
            .unwrap();
        assert_eq!(found.id(), delegated_id);

        let stranger = UserId::from_uuid(Uuid::new_v4());
        assert!(registry
            .resolve_delegate(&principal, delegated_id, stranger)
            .is_err());
        assert!(registry.get_connection_by_id(delegated_id).is_none());
    }

    #[test]
    fn test_evict_idle() {
        let registry = registry(4);
        let conn = registry.make_new_guest_connection().unwrap();
        registry.register_connection(conn);

        assert_eq!(registry.evict_idle(Duration::from_secs(60)), 0);
        assert_eq!(registry.evict_idle(Duration::ZERO), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_concurrent_lookups_see_stable_reference() {
        let registry = Arc::new(registry(64));
        let conn = registry.make_new_guest_connection().unwrap();
        let id = conn.id();
        registry.register_connection(Arc::clone(&conn));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        // Churn other keys while looking ours up.
                        let other = registry.make_new_guest_connection().unwrap();
                        let other_id = other.id();
                        registry.register_connection(other);
                        let found = registry.get_connection_by_id(id).unwrap();
                        assert_eq!(found.id(), id);
                        registry.remove_connection(other_id);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert!(Arc::ptr_eq(&registry.get_connection_by_id(id).unwrap(), &conn));
        assert_eq!(registry.len(), 1);
    }
}
