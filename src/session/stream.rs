//! Streams: one logical request/response unit.
//!
//! ```text
//! Created --set_connection--> Attached --mark_processed--> Processed --close--> Closed
//!    |                                                                     ^
//!    +------------------------- no connection -----------------------------+
//! ```
//!
//! Streams bound to a connection come from that connection's [`StreamPool`]
//! and go back to it on close, reset before reuse. A pooled stream that is
//! dropped instead (a panicking handler, a cancelled task) still vacates its
//! slot.

use crate::dispatch::StreamHandler;
use crate::error::{ApplicationError, ResourceError};
use crate::session::connection::{Connection, ConnectionId};
use bytes::{Bytes, BytesMut};
use std::sync::{Arc, Weak};

/// Stream lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Created,
    Attached,
    Processed,
    Closed,
}

/// Pool slot held by a live stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSlot {
    pub owner: ConnectionId,
    pub index: usize,
}

/// One unit of work flowing through a handler.
pub struct Stream {
    state: StreamState,
    slot: Option<PoolSlot>,
    pool: Option<Weak<Connection>>,
    income: Bytes,
    outcome: BytesMut,
    connection: Option<Weak<Connection>>,
    handler: Option<Arc<dyn StreamHandler>>,
    err: Option<ApplicationError>,
    outcome_recorded: bool,
}

impl Stream {
    /// Make a stream for first contact, before any connection is known.
    pub fn new_unbound() -> Self {
        Self {
            state: StreamState::Created,
            slot: None,
            pool: None,
            income: Bytes::new(),
            outcome: BytesMut::new(),
            connection: None,
            handler: None,
            err: None,
            outcome_recorded: false,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn slot(&self) -> Option<PoolSlot> {
        self.slot
    }

    pub fn income_payload(&self) -> &Bytes {
        &self.income
    }

    pub fn set_income_payload(&mut self, payload: Bytes) {
        self.income = payload;
    }

    pub fn outcome_payload(&self) -> &[u8] {
        &self.outcome
    }

    /// Buffer the handler writes its response into.
    pub fn outcome_payload_mut(&mut self) -> &mut BytesMut {
        &mut self.outcome
    }

    /// Terminal application error, if the handler reported one.
    pub fn error(&self) -> Option<&ApplicationError> {
        self.err.as_ref()
    }

    pub fn set_error(&mut self, err: impl Into<ApplicationError>) {
        self.err = Some(err.into());
    }

    /// The owning connection, if one is set and still alive.
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.connection.as_ref().and_then(Weak::upgrade)
    }

    /// Bind the stream to `connection`. Handlers call this on first contact,
    /// and may call it again to switch to a delegate connection.
    ///
    /// Ignored once the stream is processed or closed.
    pub fn set_connection(&mut self, connection: &Arc<Connection>) {
        if matches!(self.state, StreamState::Created | StreamState::Attached) {
            self.connection = Some(Arc::downgrade(connection));
            self.state = StreamState::Attached;
        }
    }

    pub fn handler(&self) -> Option<&Arc<dyn StreamHandler>> {
        self.handler.as_ref()
    }

    /// Remember which connection's pool the slot must go back to.
    pub(crate) fn set_pool(&mut self, connection: &Arc<Connection>) {
        self.pool = Some(Arc::downgrade(connection));
    }

    pub(crate) fn set_handler(&mut self, handler: Arc<dyn StreamHandler>) {
        self.handler = Some(handler);
    }

    /// Record that the handler returned. Only valid from Attached.
    pub fn mark_processed(&mut self) -> bool {
        if self.state == StreamState::Attached {
            self.state = StreamState::Processed;
            true
        } else {
            false
        }
    }

    /// Update the owning connection's service counters for this stream.
    ///
    /// Counts a failure when the handler set an error, success otherwise.
    /// Runs at most once per stream; later calls and streams without a live
    /// connection return `None`.
    pub fn record_outcome(&mut self) -> Option<bool> {
        if self.outcome_recorded {
            return None;
        }
        let connection = self.connection()?;
        self.outcome_recorded = true;

        let ok = self.err.is_none();
        if ok {
            connection.service_call_ok();
        } else {
            connection.service_call_fail();
        }
        Some(ok)
    }

    pub fn close(&mut self) {
        self.state = StreamState::Closed;
    }

    /// Clear everything so the object can be handed out again.
    fn reset(&mut self) {
        self.state = StreamState::Created;
        self.slot = None;
        self.pool = None;
        self.income = Bytes::new();
        self.outcome.clear();
        self.connection = None;
        self.handler = None;
        self.err = None;
        self.outcome_recorded = false;
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if let (Some(slot), Some(pool)) = (self.slot.take(), self.pool.take()) {
            if let Some(connection) = pool.upgrade() {
                connection.vacate_slot(slot);
            }
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("state", &self.state)
            .field("slot", &self.slot)
            .field("income_len", &self.income.len())
            .field("outcome_len", &self.outcome.len())
            .field("bound", &self.connection.is_some())
            .field("err", &self.err.as_ref().map(|e| e.to_string()))
            .finish()
    }
}

/// Per-connection stream arena.
///
/// Slots are indexed; a slot holds at most one live stream. Closed streams
/// are reset and kept on a free list for reuse.
#[derive(Debug)]
pub struct StreamPool {
    slots: Vec<bool>,
    live: usize,
    free: Vec<Stream>,
}

impl StreamPool {
    pub fn new(max_streams: usize) -> Self {
        Self {
            slots: vec![false; max_streams],
            live: 0,
            free: Vec::new(),
        }
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of occupied slots.
    pub fn live(&self) -> usize {
        self.live
    }

    /// Streams waiting on the free list.
    pub fn pooled(&self) -> usize {
        self.free.len()
    }

    /// Take a slot and a stream object for `owner`.
    ///
    /// `slot_hint` is used when it names a vacant slot; otherwise the lowest
    /// vacant slot is taken.
    pub fn acquire(&mut self, owner: ConnectionId, slot_hint: usize) -> Result<Stream, ResourceError> {
        let index = match self.slots.get(slot_hint) {
            Some(false) => slot_hint,
            _ => self
                .slots
                .iter()
                .position(|occupied| !occupied)
                .ok_or(ResourceError::StreamsExhausted {
                    max: self.slots.len(),
                })?,
        };

        self.slots[index] = true;
        self.live += 1;

        let mut stream = self.free.pop().unwrap_or_else(Stream::new_unbound);
        stream.slot = Some(PoolSlot { owner, index });
        Ok(stream)
    }

    /// Return a stream, vacating its slot if it holds one of ours.
    ///
    /// A stream from another pool is dropped, which hands its slot back to
    /// the pool it came from.
    pub fn release(&mut self, owner: ConnectionId, mut stream: Stream) {
        match stream.slot {
            Some(slot) if slot.owner != owner => return,
            Some(slot) => {
                self.vacate(slot.index);
            }
            None => {}
        }

        stream.reset();
        if self.free.len() < self.slots.len() {
            self.free.push(stream);
        }
    }

    /// Free slot `index`. Returns false if it was already vacant.
    pub(crate) fn vacate(&mut self, index: usize) -> bool {
        if self.slots.get(index) == Some(&true) {
            self.slots[index] = false;
            self.live -= 1;
            true
        } else {
            false
        }
    }
}
