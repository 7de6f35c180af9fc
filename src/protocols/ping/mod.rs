//! Ping protocol.
//!
//! A minimal protocol for health checks and latency measurement:
//! - Client sends: `PING\r\n` or `PING <message>\r\n`
//! - Server responds: `PONG\r\n` or `PONG <message>\r\n`
//!
//! One inbound unit may carry several commands; each gets its own reply
//! line. Anything else is answered with `ERROR unknown command\r\n` and
//! counted as a failed packet on the connection.
//!
//! ```text
//! Request:  PING hello\r\n
//! Response: PONG hello\r\n
//! ```

pub mod handler;
pub mod parser;

pub use handler::PingHandler;
