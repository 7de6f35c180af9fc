//! Persistent per-peer sessions.
//!
//! A [`Connection`] outlives the sockets that carry it: a peer may reconnect
//! and resume the same connection by identifier. Each connection tracks who
//! it belongs to, usage counters, and a bounded pool of streams.

use crate::error::{ResolveError, ResourceError};
use crate::session::stream::{PoolSlot, Stream, StreamPool};
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use uuid::Uuid;

/// Immutable, unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generate a new random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Identity of a user, organization, or other principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UserId(Uuid);

impl UserId {
    /// The identity every guest connection starts with.
    pub const GUEST: UserId = UserId(Uuid::nil());

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn is_guest(&self) -> bool {
        *self == Self::GUEST
    }
}

/// Session lifecycle state, derived from the identity it carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No verified identity yet.
    Guest,
    /// Acting as its primary identity.
    Authenticated,
    /// Primary identity acts on behalf of a delegate (e.g. organization).
    Delegated,
}

#[derive(Debug, Clone, Copy)]
struct Identity {
    user: UserId,
    delegate: Option<UserId>,
}

/// Snapshot of a connection's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub service_calls_ok: u64,
    pub service_calls_failed: u64,
    pub failed_packets: u64,
}

/// Slot in the registry's admission budget, returned when the connection
/// is dropped.
#[derive(Debug)]
pub(crate) struct AdmissionGuard {
    live: Arc<AtomicUsize>,
}

impl AdmissionGuard {
    pub(crate) fn new(live: Arc<AtomicUsize>) -> Self {
        Self { live }
    }
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A persistent peer session.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    identity: RwLock<Identity>,
    peer_addr: Mutex<Option<SocketAddr>>,
    last_used: Mutex<DateTime<Utc>>,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    service_calls_ok: AtomicU64,
    service_calls_failed: AtomicU64,
    failed_packets: AtomicU64,
    streams: Mutex<StreamPool>,
    _admission: Option<AdmissionGuard>,
}

impl Connection {
    /// Create a guest connection with a fresh identifier.
    pub fn new_guest(max_streams: usize) -> Self {
        Self::with_identity(ConnectionId::new(), UserId::GUEST, None, max_streams)
    }

    /// Rebuild a connection with a known identifier and identity, for
    /// resuming a session created elsewhere.
    pub fn with_identity(
        id: ConnectionId,
        user: UserId,
        delegate: Option<UserId>,
        max_streams: usize,
    ) -> Self {
        Self {
            id,
            identity: RwLock::new(Identity { user, delegate }),
            peer_addr: Mutex::new(None),
            last_used: Mutex::new(Utc::now()),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            service_calls_ok: AtomicU64::new(0),
            service_calls_failed: AtomicU64::new(0),
            failed_packets: AtomicU64::new(0),
            streams: Mutex::new(StreamPool::new(max_streams)),
            _admission: None,
        }
    }

    pub(crate) fn admitted(mut self, guard: AdmissionGuard) -> Self {
        self._admission = Some(guard);
        self
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user(&self) -> UserId {
        self.identity_snapshot().user
    }

    pub fn delegate(&self) -> Option<UserId> {
        self.identity_snapshot().delegate
    }

    pub fn state(&self) -> ConnectionState {
        let identity = self.identity_snapshot();
        if identity.delegate.is_some() {
            ConnectionState::Delegated
        } else if identity.user.is_guest() {
            ConnectionState::Guest
        } else {
            ConnectionState::Authenticated
        }
    }

    /// Bind a guest connection to `user`.
    ///
    /// Re-authenticating as the same user is a no-op; any other change of
    /// identity is a mismatch.
    pub fn authenticate(&self, user: UserId) -> Result<(), ResolveError> {
        let mut identity = self.identity.write().unwrap_or_else(PoisonError::into_inner);
        if identity.user.is_guest() || identity.user == user {
            identity.user = user;
            Ok(())
        } else {
            Err(ResolveError::IdentityMismatch(self.id))
        }
    }

    /// Let `delegate` act through this authenticated connection.
    pub fn delegate_to(&self, delegate: UserId) -> Result<(), ResolveError> {
        let mut identity = self.identity.write().unwrap_or_else(PoisonError::into_inner);
        if identity.user.is_guest() || delegate == identity.user {
            return Err(ResolveError::IdentityMismatch(self.id));
        }
        match identity.delegate {
            Some(existing) if existing != delegate => Err(ResolveError::IdentityMismatch(self.id)),
            _ => {
                identity.delegate = Some(delegate);
                Ok(())
            }
        }
    }

    /// Whether this connection carries exactly the claimed identity.
    pub fn matches(&self, user: UserId, delegate: Option<UserId>) -> bool {
        let identity = self.identity_snapshot();
        identity.user == user && identity.delegate == delegate
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *lock(&self.peer_addr)
    }

    pub fn set_peer_addr(&self, addr: SocketAddr) {
        *lock(&self.peer_addr) = Some(addr);
    }

    pub fn last_used(&self) -> DateTime<Utc> {
        *lock(&self.last_used)
    }

    /// Mark the connection as used now.
    pub fn touch(&self) {
        *lock(&self.last_used) = Utc::now();
    }

    /// How long the connection has been unused as of `now`.
    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_used()).to_std().unwrap_or_default()
    }

    pub fn add_bytes_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn service_call_ok(&self) {
        self.service_calls_ok.fetch_add(1, Ordering::Relaxed);
    }

    pub fn service_call_fail(&self) {
        self.service_calls_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an inbound unit the handler could not decode.
    pub fn failed_packet_received(&self) {
        self.failed_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            service_calls_ok: self.service_calls_ok.load(Ordering::Relaxed),
            service_calls_failed: self.service_calls_failed.load(Ordering::Relaxed),
            failed_packets: self.failed_packets.load(Ordering::Relaxed),
        }
    }

    /// Take a pooled stream bound to this connection.
    ///
    /// Fails with `StreamsExhausted` when every slot is occupied.
    pub fn make_income_stream(self: &Arc<Self>, slot_hint: usize) -> Result<Stream, ResourceError> {
        let mut stream = lock(&self.streams).acquire(self.id, slot_hint)?;
        stream.set_pool(self);
        stream.set_connection(self);
        Ok(stream)
    }

    /// Close `stream` and return it to this connection's pool.
    pub fn close_stream(&self, mut stream: Stream) {
        stream.close();
        lock(&self.streams).release(self.id, stream);
    }

    /// Give back the slot of a pooled stream that was dropped without
    /// being closed.
    pub(crate) fn vacate_slot(&self, slot: PoolSlot) {
        if slot.owner == self.id {
            lock(&self.streams).vacate(slot.index);
        }
    }

    /// Streams currently holding a slot.
    pub fn live_streams(&self) -> usize {
        lock(&self.streams).live()
    }

    fn identity_snapshot(&self) -> Identity {
        *self.identity.read().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Lock a mutex, recovering the data if a panicking task poisoned it.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
