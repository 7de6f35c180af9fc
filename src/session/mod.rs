//! Sessions: connections, streams, and the registry that ties them together.

mod connection;
mod registry;
mod stream;

pub use connection::{Connection, ConnectionId, ConnectionState, ConnectionStats, UserId};
pub use registry::{ConnectionRegistry, RegistryLimits};
pub use stream::{PoolSlot, Stream, StreamPool, StreamState};
