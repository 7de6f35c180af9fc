//! Echo protocol handler.

use crate::dispatch::StreamHandler;
use crate::protocols::attach_guest;
use crate::server::ServerContext;
use crate::session::Stream;

/// Writes the inbound payload back as the response.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoHandler;

impl StreamHandler for EchoHandler {
    fn handle(&self, ctx: &ServerContext, stream: &mut Stream) {
        if stream.connection().is_none() && !attach_guest(ctx, stream) {
            return;
        }

        let income = stream.income_payload().clone();
        stream.outcome_payload_mut().extend_from_slice(&income);
    }

    fn name(&self) -> &str {
        "echo"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DispatchTable;
    use crate::server::SocketSettings;
    use crate::session::{Connection, RegistryLimits};
    use bytes::Bytes;
    use std::sync::Arc;

    #[test]
    fn test_echo_reuses_bound_connection() {
        let ctx = ServerContext::new(
            DispatchTable::new(),
            RegistryLimits::default(),
            SocketSettings::default(),
        );
        let conn = Arc::new(Connection::new_guest(1));
        let mut stream = conn.make_income_stream(0).unwrap();
        stream.set_income_payload(Bytes::from_static(b"\x00\x01binary\xff"));

        EchoHandler.handle(&ctx, &mut stream);

        assert_eq!(stream.outcome_payload(), b"\x00\x01binary\xff");
        assert_eq!(stream.connection().unwrap().id(), conn.id());
        // No guest was created for an already-bound stream.
        assert!(ctx.registry.is_empty());
    }
}
