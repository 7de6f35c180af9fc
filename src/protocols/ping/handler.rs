//! Ping protocol handler.

use super::parser::{self, ParseError};
use crate::dispatch::StreamHandler;
use crate::protocols::attach_guest;
use crate::server::ServerContext;
use crate::session::Stream;
use tracing::trace;

/// Answers PING commands; needs no state beyond the connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct PingHandler;

impl StreamHandler for PingHandler {
    fn handle(&self, ctx: &ServerContext, stream: &mut Stream) {
        if stream.connection().is_none() && !attach_guest(ctx, stream) {
            return;
        }

        let income = stream.income_payload().clone();
        let mut input = &income[..];
        let mut failure: Option<ParseError> = None;

        while !input.is_empty() {
            match parser::parse(input) {
                Ok((command, consumed)) => {
                    parser::write_response(&command, stream.outcome_payload_mut());
                    input = &input[consumed..];
                }
                Err(e) => {
                    stream
                        .outcome_payload_mut()
                        .extend_from_slice(parser::response_error());
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Some(e) = failure {
            trace!(error = %e, "Bad ping command");
            if let Some(connection) = stream.connection() {
                connection.failed_packet_received();
            }
            stream.set_error(e);
        }
    }

    fn name(&self) -> &str {
        "ping"
    }
}
