//! Echo protocol.
//!
//! Every inbound unit is written back unchanged. Useful for throughput
//! testing and for checking that a listener, its registry, and its stream
//! pool are wired up correctly.

pub mod handler;

pub use handler::EchoHandler;
