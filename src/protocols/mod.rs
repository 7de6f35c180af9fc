//! Built-in stream handlers.
//!
//! - `ping`: line-based PING/PONG for health checks and latency testing
//! - `echo`: returns every inbound unit unchanged
//!
//! Both create a guest connection on first contact through
//! [`attach_guest`]. Handlers for real application protocols are expected
//! to resolve an authenticated connection instead.

pub mod echo;
pub mod ping;

use crate::dispatch::StreamHandler;
use crate::server::ServerContext;
use crate::session::Stream;
use std::sync::Arc;
use tracing::warn;

/// Handler registered under a protocol name in the configuration.
pub fn handler_for(protocol: &str) -> Option<Arc<dyn StreamHandler>> {
    match protocol.to_ascii_lowercase().as_str() {
        "ping" => Some(Arc::new(ping::PingHandler)),
        "echo" => Some(Arc::new(echo::EchoHandler)),
        _ => None,
    }
}

/// Bind a first-contact stream to a new, registered guest connection.
///
/// Returns false when the connection ceiling is reached; the error is set
/// on the stream and it stays unbound, so the transport closes the socket.
pub fn attach_guest(ctx: &ServerContext, stream: &mut Stream) -> bool {
    match ctx.registry.make_new_guest_connection() {
        Ok(connection) => {
            let connection = ctx.registry.register_connection(connection);
            stream.set_connection(&connection);
            true
        }
        Err(e) => {
            warn!(error = %e, "Rejecting first contact");
            stream.set_error(e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DispatchTable;
    use crate::server::SocketSettings;
    use crate::session::{RegistryLimits, StreamState};

    fn context(max_connections: usize) -> ServerContext {
        ServerContext::new(
            DispatchTable::new(),
            RegistryLimits {
                max_connections,
                max_streams_per_connection: 4,
            },
            SocketSettings::default(),
        )
    }

    #[test]
    fn test_handler_names() {
        assert_eq!(handler_for("ping").unwrap().name(), "ping");
        assert_eq!(handler_for("ECHO").unwrap().name(), "echo");
        assert!(handler_for("memcached").is_none());
    }

    #[test]
    fn test_attach_guest_registers() {
        let ctx = context(1);
        let mut stream = Stream::new_unbound();
        assert!(attach_guest(&ctx, &mut stream));
        assert_eq!(stream.state(), StreamState::Attached);

        let id = stream.connection().unwrap().id();
        assert!(ctx.registry.get_connection_by_id(id).is_some());
    }

    #[test]
    fn test_attach_guest_at_ceiling() {
        let ctx = context(1);
        let mut first = Stream::new_unbound();
        assert!(attach_guest(&ctx, &mut first));

        let mut second = Stream::new_unbound();
        assert!(!attach_guest(&ctx, &mut second));
        assert!(second.connection().is_none());
        assert!(second.error().is_some());
    }
}
