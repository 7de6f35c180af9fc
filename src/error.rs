//! Error taxonomy for the transport core.
//!
//! Errors are grouped by the layer that produces them:
//! - [`SocketError`]: transport failures on a single socket
//! - [`ResourceError`]: fail-closed resource ceilings
//! - [`ServerError`]: listener admission and bind failures
//! - [`ResolveError`]: session resolution failures
//!
//! Application errors are opaque ([`ApplicationError`]) and only ever travel
//! on a `Stream`; the transport never inspects them.

use std::io;
use thiserror::Error;

/// Opaque error reported by an application handler.
pub type ApplicationError = Box<dyn std::error::Error + Send + Sync>;

/// Transport-level failures on a socket.
#[derive(Debug, Error)]
pub enum SocketError {
    /// The socket is not open (never opened, closing, or closed).
    #[error("socket is closed")]
    Closed,
    /// A read or write deadline elapsed.
    #[error("socket deadline elapsed")]
    Timeout,
    /// Segment is empty or shorter than the 20 byte header.
    #[error("segment too short: {len} bytes, header needs at least {min}")]
    PacketTooShort { len: usize, min: usize },
    /// Data offset or option length disagrees with the actual segment length.
    #[error("segment length mismatch: declared {declared} bytes, have {actual}")]
    PacketWrongLength { declared: usize, actual: usize },
    /// Segment contents do not match its checksum.
    #[error("segment checksum mismatch")]
    ChecksumMismatch,
    /// Receive buffer cannot take the payload without exceeding capacity.
    #[error("receive buffer full: {needed} bytes needed, {free} free")]
    BufferFull { needed: usize, free: usize },
    /// Underlying link failure.
    #[error("link error: {0}")]
    Io(#[from] io::Error),
}

/// Fail-closed resource ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ResourceError {
    /// The registry reached its concurrent connection ceiling.
    #[error("connection limit reached ({max})")]
    ConnectionsExhausted { max: usize },
    /// A connection's stream pool has no free slot.
    #[error("stream pool exhausted ({max} slots)")]
    StreamsExhausted { max: usize },
}

/// Session resolution failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    /// The claimed identity does not match the stored connection. The
    /// connection has been evicted.
    #[error("identity mismatch for connection {0}")]
    IdentityMismatch(crate::session::ConnectionId),
    #[error(transparent)]
    Resource(#[from] ResourceError),
}

/// Listener and server lifecycle failures.
#[derive(Debug, Error)]
pub enum ServerError {
    /// No protocol handler is registered for the port.
    #[error("no protocol handler registered for port {0}")]
    ProtocolHandler(u16),
    /// Failed to bind the listening endpoint.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    /// Unknown protocol name in configuration.
    #[error("unknown protocol '{0}'")]
    UnknownProtocol(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}
