//! Ping protocol parser.

use thiserror::Error;

/// Parsed ping command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command<'a> {
    /// Simple ping (no message).
    Ping,
    /// Ping with a message to echo back.
    PingMsg(&'a [u8]),
}

/// Why a unit could not be parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("command is missing its line terminator")]
    Incomplete,
    #[error("unknown command")]
    Unknown,
}

/// Parse one command from the head of `input`, returning it with the bytes
/// consumed.
pub fn parse(input: &[u8]) -> Result<(Command<'_>, usize), ParseError> {
    let line_end = find_crlf(input).ok_or(ParseError::Incomplete)?;
    let line = &input[..line_end];
    let consumed = line_end + 2;

    if line.eq_ignore_ascii_case(b"PING") {
        Ok((Command::Ping, consumed))
    } else if line.len() > 5 && line[..5].eq_ignore_ascii_case(b"PING ") {
        Ok((Command::PingMsg(&line[5..]), consumed))
    } else {
        Err(ParseError::Unknown)
    }
}

/// Append the reply for `command` to `out`.
pub fn write_response(command: &Command<'_>, out: &mut bytes::BytesMut) {
    match command {
        Command::Ping => out.extend_from_slice(b"PONG\r\n"),
        Command::PingMsg(msg) => {
            out.reserve(5 + msg.len() + 2);
            out.extend_from_slice(b"PONG ");
            out.extend_from_slice(msg);
            out.extend_from_slice(b"\r\n");
        }
    }
}

/// Format an error response.
pub fn response_error() -> &'static [u8] {
    b"ERROR unknown command\r\n"
}

/// Find \r\n in buffer, returning the position of \r.
fn find_crlf(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_parse_ping() {
        assert_eq!(parse(b"PING\r\n"), Ok((Command::Ping, 6)));
        assert_eq!(parse(b"ping\r\n"), Ok((Command::Ping, 6)));
    }

    #[test]
    fn test_parse_ping_msg() {
        assert_eq!(
            parse(b"PING hello\r\nPING\r\n"),
            Ok((Command::PingMsg(b"hello"), 12))
        );
    }

    #[test]
    fn test_incomplete() {
        assert_eq!(parse(b"PING"), Err(ParseError::Incomplete));
    }

    #[test]
    fn test_unknown_command() {
        assert_eq!(parse(b"FOO\r\n"), Err(ParseError::Unknown));
        // "PING " with nothing after it is not a message ping.
        assert_eq!(parse(b"PING \r\n"), Err(ParseError::Unknown));
    }

    #[test]
    fn test_responses() {
        let mut out = BytesMut::new();
        write_response(&Command::Ping, &mut out);
        write_response(&Command::PingMsg(b"hi"), &mut out);
        assert_eq!(&out[..], b"PONG\r\nPONG hi\r\n");
    }
}
