//! Segment option parsing and encoding.
//!
//! Options are self-length-prefixed TLV fields following the fixed segment
//! header:
//!
//! ```text
//! +--------+--------+--------+--------+---------
//! |  kind  | length |  value (length - 2 bytes)
//! +--------+--------+--------+--------+---------
//! ```
//!
//! The length byte counts the whole option, kind and length included.
//! End-of-list and No-op are the only single-byte kinds. Every parser reports
//! the length it consumed, so the caller always advances by the option's own
//! declaration and never by a fixed stride. Unknown kinds are skipped, not
//! rejected.
//!
//! | Kind | Name               | Length | Value                  |
//! |------|--------------------|--------|------------------------|
//! | 0    | End of list        | 1      | -                      |
//! | 1    | No-op              | 1      | -                      |
//! | 2    | Max segment size   | 4      | u16                    |
//! | 6    | Echo               | 6      | u16 + 2 reserved bytes |
//! | 11   | Congestion control | 6      | u16 + 2 reserved bytes |

use crate::error::SocketError;

/// Option kind numbers.
pub mod kind {
    pub const END_OF_LIST: u8 = 0;
    pub const NOP: u8 = 1;
    pub const MSS: u8 = 2;
    pub const ECHO: u8 = 6;
    pub const CONGESTION_CONTROL: u8 = 11;
}

/// Declared length of an MSS option.
pub const MSS_LEN: usize = 4;
/// Declared length of an Echo option.
pub const ECHO_LEN: usize = 6;
/// Declared length of a Congestion-Control option.
pub const CC_LEN: usize = 6;

/// Largest value an option can carry: the length byte also counts the kind
/// and length bytes.
pub const MAX_OPTION_DATA: usize = u8::MAX as usize - 2;

/// MSS assumed until the peer announces one.
pub const DEFAULT_MSS: u16 = 536;

/// One parsed option, borrowing any opaque bytes from the segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentOption<'a> {
    EndOfList,
    Nop,
    Mss(u16),
    Echo(u16),
    CongestionControl(u16),
    /// Unrecognized kind; `data` excludes the kind and length bytes.
    Unknown { kind: u8, data: &'a [u8] },
}

impl SegmentOption<'_> {
    /// Number of bytes this option occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        match self {
            SegmentOption::EndOfList | SegmentOption::Nop => 1,
            SegmentOption::Mss(_) => MSS_LEN,
            SegmentOption::Echo(_) => ECHO_LEN,
            SegmentOption::CongestionControl(_) => CC_LEN,
            SegmentOption::Unknown { data, .. } => 2 + data.len(),
        }
    }

    /// Append the wire form of this option to `out`.
    ///
    /// Fails with `PacketWrongLength` when an unknown option's data does not
    /// fit the one-byte length field.
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<(), SocketError> {
        match *self {
            SegmentOption::EndOfList => out.push(kind::END_OF_LIST),
            SegmentOption::Nop => out.push(kind::NOP),
            SegmentOption::Mss(mss) => {
                out.extend_from_slice(&[kind::MSS, MSS_LEN as u8]);
                out.extend_from_slice(&mss.to_be_bytes());
            }
            SegmentOption::Echo(token) => {
                out.extend_from_slice(&[kind::ECHO, ECHO_LEN as u8]);
                out.extend_from_slice(&token.to_be_bytes());
                out.extend_from_slice(&[0, 0]);
            }
            SegmentOption::CongestionControl(token) => {
                out.extend_from_slice(&[kind::CONGESTION_CONTROL, CC_LEN as u8]);
                out.extend_from_slice(&token.to_be_bytes());
                out.extend_from_slice(&[0, 0]);
            }
            SegmentOption::Unknown { kind, data } => {
                if data.len() > MAX_OPTION_DATA {
                    return Err(SocketError::PacketWrongLength {
                        declared: 2 + data.len(),
                        actual: u8::MAX as usize,
                    });
                }
                out.extend_from_slice(&[kind, (2 + data.len()) as u8]);
                out.extend_from_slice(data);
            }
        }
        Ok(())
    }
}

/// Parse the option at the head of `raw`.
///
/// Returns the option and the number of bytes it declared, which is the
/// amount the caller must advance by.
pub fn parse_option(raw: &[u8]) -> Result<(SegmentOption<'_>, usize), SocketError> {
    let Some(&kind) = raw.first() else {
        return Err(SocketError::PacketTooShort { len: 0, min: 1 });
    };

    match kind {
        kind::END_OF_LIST => return Ok((SegmentOption::EndOfList, 1)),
        kind::NOP => return Ok((SegmentOption::Nop, 1)),
        _ => {}
    }

    let Some(&declared) = raw.get(1) else {
        return Err(SocketError::PacketWrongLength {
            declared: 2,
            actual: raw.len(),
        });
    };
    let declared = declared as usize;
    if declared < 2 || declared > raw.len() {
        return Err(SocketError::PacketWrongLength {
            declared,
            actual: raw.len(),
        });
    }

    let option = match kind {
        kind::MSS => SegmentOption::Mss(fixed_u16(raw, declared, MSS_LEN)?),
        kind::ECHO => SegmentOption::Echo(fixed_u16(raw, declared, ECHO_LEN)?),
        kind::CONGESTION_CONTROL => {
            SegmentOption::CongestionControl(fixed_u16(raw, declared, CC_LEN)?)
        }
        _ => SegmentOption::Unknown {
            kind,
            data: &raw[2..declared],
        },
    };

    Ok((option, declared))
}

/// Read the 16-bit value of a fixed-size option after checking its length.
fn fixed_u16(raw: &[u8], declared: usize, expected: usize) -> Result<u16, SocketError> {
    if declared != expected {
        return Err(SocketError::PacketWrongLength {
            declared,
            actual: expected,
        });
    }
    Ok(u16::from_be_bytes([raw[2], raw[3]]))
}

/// Iterator over an options area.
///
/// Stops after End-of-list, at the end of the area, or after yielding the
/// first error.
pub struct Options<'a> {
    remaining: &'a [u8],
    done: bool,
}

impl<'a> Options<'a> {
    pub fn new(area: &'a [u8]) -> Self {
        Self {
            remaining: area,
            done: false,
        }
    }
}

impl<'a> Iterator for Options<'a> {
    type Item = Result<SegmentOption<'a>, SocketError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.remaining.is_empty() {
            return None;
        }

        match parse_option(self.remaining) {
            Ok((option, consumed)) => {
                self.remaining = &self.remaining[consumed..];
                if option == SegmentOption::EndOfList {
                    self.done = true;
                }
                Some(Ok(option))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Encode `options` into an options area padded to a 32-bit boundary.
pub fn encode_options(options: &[SegmentOption<'_>]) -> Result<Vec<u8>, SocketError> {
    let mut out = Vec::with_capacity(options.iter().map(|o| o.encoded_len()).sum::<usize>() + 3);
    for option in options {
        option.encode(&mut out)?;
    }
    while out.len() % 4 != 0 {
        out.push(kind::END_OF_LIST);
    }
    Ok(out)
}

/// Options negotiated on a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedOptions {
    /// Largest segment the peer accepts.
    pub mss: u16,
    /// Last echo token seen from the peer.
    pub echo: Option<u16>,
    /// Congestion-control token. Stored only; no algorithm consumes it yet.
    pub congestion_control: Option<u16>,
}

impl Default for NegotiatedOptions {
    fn default() -> Self {
        Self {
            mss: DEFAULT_MSS,
            echo: None,
            congestion_control: None,
        }
    }
}

impl NegotiatedOptions {
    /// Record a recognized option. Other kinds leave the set unchanged.
    pub fn apply(&mut self, option: &SegmentOption<'_>) {
        match *option {
            SegmentOption::Mss(mss) if mss > 0 => self.mss = mss,
            SegmentOption::Echo(token) => self.echo = Some(token),
            SegmentOption::CongestionControl(token) => self.congestion_control = Some(token),
            _ => {}
        }
    }

    /// Apply every option in an options area.
    ///
    /// Options before a malformed one stay applied.
    pub fn apply_area(&mut self, area: &[u8]) -> Result<(), SocketError> {
        for option in Options::new(area) {
            self.apply(&option?);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mss() {
        let raw = [kind::MSS, 4, 0x05, 0xb4];
        let (option, consumed) = parse_option(&raw).unwrap();
        assert_eq!(option, SegmentOption::Mss(1460));
        assert_eq!(consumed, 4);
    }

    #[test]
    fn test_parse_echo_and_cc() {
        let raw = [kind::ECHO, 6, 0x12, 0x34, 0, 0, kind::CONGESTION_CONTROL, 6, 0, 7, 0, 0];
        let (echo, consumed) = parse_option(&raw).unwrap();
        assert_eq!(echo, SegmentOption::Echo(0x1234));
        assert_eq!(consumed, 6);

        let (cc, consumed) = parse_option(&raw[consumed..]).unwrap();
        assert_eq!(cc, SegmentOption::CongestionControl(7));
        assert_eq!(consumed, 6);
    }

    #[test]
    fn test_unknown_kind_skipped_by_declared_length() {
        // MSS(1460) followed by kind 99 with length 4 and two payload bytes.
        let area = [kind::MSS, 4, 0x05, 0xb4, 99, 4, 0xaa, 0xbb];
        let parsed: Vec<_> = Options::new(&area).collect::<Result<_, _>>().unwrap();
        assert_eq!(
            parsed,
            vec![
                SegmentOption::Mss(1460),
                SegmentOption::Unknown {
                    kind: 99,
                    data: &[0xaa, 0xbb]
                },
            ]
        );

        let mut negotiated = NegotiatedOptions::default();
        negotiated.apply_area(&area).unwrap();
        assert_eq!(negotiated.mss, 1460);
    }

    #[test]
    fn test_single_byte_options() {
        let area = [kind::NOP, kind::NOP, kind::MSS, 4, 0x02, 0x00, kind::END_OF_LIST, 0xff];
        let parsed: Vec<_> = Options::new(&area).collect::<Result<_, _>>().unwrap();
        // Bytes after End-of-list are padding and never parsed.
        assert_eq!(
            parsed,
            vec![
                SegmentOption::Nop,
                SegmentOption::Nop,
                SegmentOption::Mss(512),
                SegmentOption::EndOfList,
            ]
        );
    }

    #[test]
    fn test_truncated_option() {
        assert!(matches!(
            parse_option(&[kind::MSS]),
            Err(SocketError::PacketWrongLength { .. })
        ));
        assert!(matches!(
            parse_option(&[kind::MSS, 4, 0x05]),
            Err(SocketError::PacketWrongLength {
                declared: 4,
                actual: 3
            })
        ));
        assert!(matches!(
            parse_option(&[42, 1]),
            Err(SocketError::PacketWrongLength { declared: 1, .. })
        ));
    }

    #[test]
    fn test_recognized_kind_with_wrong_length() {
        assert!(matches!(
            parse_option(&[kind::ECHO, 4, 0, 1]),
            Err(SocketError::PacketWrongLength { declared: 4, .. })
        ));
    }

    #[test]
    fn test_iteration_stops_after_error() {
        let area = [kind::MSS, 4, 0x05, 0xb4, 77, 9, 1];
        let mut options = Options::new(&area);
        assert!(matches!(options.next(), Some(Ok(SegmentOption::Mss(1460)))));
        assert!(matches!(options.next(), Some(Err(_))));
        assert!(options.next().is_none());
    }

    #[test]
    fn test_roundtrip_any_order() {
        let orders: [[SegmentOption<'static>; 3]; 3] = [
            [
                SegmentOption::Mss(1400),
                SegmentOption::Echo(9),
                SegmentOption::CongestionControl(3),
            ],
            [
                SegmentOption::CongestionControl(3),
                SegmentOption::Mss(1400),
                SegmentOption::Echo(9),
            ],
            [
                SegmentOption::Echo(9),
                SegmentOption::CongestionControl(3),
                SegmentOption::Mss(1400),
            ],
        ];

        for order in orders {
            let area = encode_options(&order).unwrap();
            assert_eq!(area.len() % 4, 0);

            let mut negotiated = NegotiatedOptions::default();
            negotiated.apply_area(&area).unwrap();
            assert_eq!(negotiated.mss, 1400);
            assert_eq!(negotiated.echo, Some(9));
            assert_eq!(negotiated.congestion_control, Some(3));
        }
    }

    #[test]
    fn test_oversized_unknown_option_rejected() {
        let data = [0u8; MAX_OPTION_DATA + 1];
        let mut out = Vec::new();
        let err = SegmentOption::Unknown { kind: 99, data: &data }
            .encode(&mut out)
            .unwrap_err();
        assert!(matches!(err, SocketError::PacketWrongLength { declared: 256, .. }));
        assert!(out.is_empty());

        // The largest encodable value still round-trips.
        let data = [7u8; MAX_OPTION_DATA];
        let area = encode_options(&[SegmentOption::Unknown { kind: 99, data: &data }]).unwrap();
        let (option, consumed) = parse_option(&area).unwrap();
        assert_eq!(consumed, 255);
        assert_eq!(option, SegmentOption::Unknown { kind: 99, data: &data });
    }

    #[test]
    fn test_zero_mss_ignored() {
        let mut negotiated = NegotiatedOptions::default();
        negotiated.apply(&SegmentOption::Mss(0));
        assert_eq!(negotiated.mss, DEFAULT_MSS);
    }
}
