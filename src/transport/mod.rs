//! Socket engine.
//!
//! A reliable, ordered byte stream and its option negotiation, written
//! without leaning on a pre-built TCP stack so another wire protocol can be
//! slotted in underneath:
//! - `segment`: segment header view and builder
//! - `option`: TLV option parsing and negotiated option set
//! - `buffer`: bounded receive buffer
//! - `socket`: lifecycle, deadlines, read/write

mod buffer;
pub mod option;
pub mod segment;
mod socket;

pub use buffer::RecvBuffer;
pub use option::{NegotiatedOptions, SegmentOption};
pub use segment::{Segment, SegmentBuilder};
pub use socket::{Link, Socket, SocketState};
