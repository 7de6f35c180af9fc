//! Transport segment wire format.
//!
//! All multi-byte integers are big-endian.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |          Source Port          |       Destination Port        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Sequence Number                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Acknowledgment Number                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  Data |       |               |                               |
//! | Offset| Rsrvd |     Flags     |            Window             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |           Checksum            |         Urgent Pointer        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Options (if data offset > 5)               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                            Payload                            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! [`Segment`] is a borrowed view over the received bytes; nothing is copied
//! while parsing.

use crate::error::SocketError;
use crate::transport::option::{encode_options, Options, SegmentOption};

/// Fixed header length without options.
pub const HEADER_LEN: usize = 20;
/// Largest header the 4-bit data offset can describe.
pub const MAX_HEADER_LEN: usize = 60;

/// Bit-flag constants for the flags byte.
pub mod flags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
    pub const URG: u8 = 0x20;
}

const OFF_SRC_PORT: usize = 0;
const OFF_DST_PORT: usize = 2;
const OFF_SEQ: usize = 4;
const OFF_ACK: usize = 8;
const OFF_DATA_OFFSET: usize = 12;
const OFF_FLAGS: usize = 13;
const OFF_WINDOW: usize = 14;
const OFF_CHECKSUM: usize = 16;
const OFF_URGENT: usize = 18;

/// A validated, borrowed view of one segment.
#[derive(Debug, Clone, Copy)]
pub struct Segment<'a> {
    bytes: &'a [u8],
    header_len: usize,
}

impl<'a> Segment<'a> {
    /// Validate the header of `bytes` and return a view over it.
    ///
    /// Fails with `PacketTooShort` below the 20 byte header and with
    /// `PacketWrongLength` when the data offset points outside the segment.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, SocketError> {
        if bytes.len() < HEADER_LEN {
            return Err(SocketError::PacketTooShort {
                len: bytes.len(),
                min: HEADER_LEN,
            });
        }

        let header_len = ((bytes[OFF_DATA_OFFSET] >> 4) as usize) * 4;
        if header_len < HEADER_LEN || header_len > bytes.len() {
            return Err(SocketError::PacketWrongLength {
                declared: header_len,
                actual: bytes.len(),
            });
        }

        Ok(Self { bytes, header_len })
    }

    pub fn source_port(&self) -> u16 {
        self.u16_at(OFF_SRC_PORT)
    }

    pub fn destination_port(&self) -> u16 {
        self.u16_at(OFF_DST_PORT)
    }

    pub fn sequence(&self) -> u32 {
        self.u32_at(OFF_SEQ)
    }

    pub fn acknowledgment(&self) -> u32 {
        self.u32_at(OFF_ACK)
    }

    /// Header length in bytes, options included.
    pub fn header_len(&self) -> usize {
        self.header_len
    }

    pub fn flags(&self) -> u8 {
        self.bytes[OFF_FLAGS]
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags() & flag != 0
    }

    pub fn window(&self) -> u16 {
        self.u16_at(OFF_WINDOW)
    }

    pub fn checksum(&self) -> u16 {
        self.u16_at(OFF_CHECKSUM)
    }

    pub fn urgent_pointer(&self) -> u16 {
        self.u16_at(OFF_URGENT)
    }

    /// Raw options area between the fixed header and the payload.
    pub fn options_area(&self) -> &'a [u8] {
        &self.bytes[HEADER_LEN..self.header_len]
    }

    pub fn options(&self) -> Options<'a> {
        Options::new(self.options_area())
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.bytes[self.header_len..]
    }

    /// Whether the stored checksum matches the segment contents.
    pub fn checksum_valid(&self) -> bool {
        internet_checksum(self.bytes) == 0
    }

    fn u16_at(&self, off: usize) -> u16 {
        u16::from_be_bytes([self.bytes[off], self.bytes[off + 1]])
    }

    fn u32_at(&self, off: usize) -> u32 {
        u32::from_be_bytes([
            self.bytes[off],
            self.bytes[off + 1],
            self.bytes[off + 2],
            self.bytes[off + 3],
        ])
    }
}

/// Builder for outgoing segments.
#[derive(Debug, Clone, Default)]
pub struct SegmentBuilder<'a> {
    source_port: u16,
    destination_port: u16,
    sequence: u32,
    acknowledgment: u32,
    flags: u8,
    window: u16,
    options: Vec<SegmentOption<'a>>,
}

impl<'a> SegmentBuilder<'a> {
    pub fn new(source_port: u16, destination_port: u16) -> Self {
        Self {
            source_port,
            destination_port,
            ..Self::default()
        }
    }

    pub fn sequence(mut self, sequence: u32) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn acknowledgment(mut self, acknowledgment: u32) -> Self {
        self.acknowledgment = acknowledgment;
        self
    }

    pub fn flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    pub fn window(mut self, window: u16) -> Self {
        self.window = window;
        self
    }

    pub fn option(mut self, option: SegmentOption<'a>) -> Self {
        self.options.push(option);
        self
    }

    /// Serialize header, options and `payload`, computing the checksum last.
    ///
    /// Fails with `PacketWrongLength` when the options do not fit the 40
    /// bytes a data offset can describe.
    pub fn build(&self, payload: &[u8]) -> Result<Vec<u8>, SocketError> {
        let options = encode_options(&self.options)?;
        let header_len = HEADER_LEN + options.len();
        if header_len > MAX_HEADER_LEN {
            return Err(SocketError::PacketWrongLength {
                declared: header_len,
                actual: MAX_HEADER_LEN,
            });
        }

        let mut buf = vec![0u8; header_len + payload.len()];
        buf[OFF_SRC_PORT..OFF_SRC_PORT + 2].copy_from_slice(&self.source_port.to_be_bytes());
        buf[OFF_DST_PORT..OFF_DST_PORT + 2].copy_from_slice(&self.destination_port.to_be_bytes());
        buf[OFF_SEQ..OFF_SEQ + 4].copy_from_slice(&self.sequence.to_be_bytes());
        buf[OFF_ACK..OFF_ACK + 4].copy_from_slice(&self.acknowledgment.to_be_bytes());
        buf[OFF_DATA_OFFSET] = ((header_len / 4) as u8) << 4;
        buf[OFF_FLAGS] = self.flags;
        buf[OFF_WINDOW..OFF_WINDOW + 2].copy_from_slice(&self.window.to_be_bytes());
        buf[HEADER_LEN..header_len].copy_from_slice(&options);
        buf[header_len..].copy_from_slice(payload);

        let csum = internet_checksum(&buf);
        buf[OFF_CHECKSUM..OFF_CHECKSUM + 2].copy_from_slice(&csum.to_be_bytes());
        Ok(buf)
    }
}

/// Internet checksum (RFC 1071): one's complement of the one's complement
/// sum of 16-bit words. Over data that already carries its checksum the
/// result is zero.
fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum += u32::from(u16::from_be_bytes([word[0], word[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}
