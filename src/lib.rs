//! session-stream: a connection-oriented transport core.
//!
//! Raw bytes arrive on a [`transport::Socket`], are wrapped in a
//! [`session::Stream`], and are handed to the handler registered for the
//! listening port in the [`dispatch::DispatchTable`]. Streams belong to
//! persistent [`session::Connection`]s kept in a concurrent
//! [`session::ConnectionRegistry`], so a peer's session survives its
//! sockets.
//!
//! - `transport`: socket state machine, segment and option codec
//! - `session`: connections, stream pools, the registry
//! - `dispatch`: port to handler table and the running-network table
//! - `listener`: accept loop and the per-socket service task
//! - `server`: shared context and lifecycle
//! - `protocols`: built-in ping and echo handlers

pub mod config;
pub mod dispatch;
pub mod error;
pub mod listener;
pub mod protocols;
pub mod server;
pub mod session;
pub mod transport;
