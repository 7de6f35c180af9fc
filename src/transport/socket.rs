//! Per-connection socket state machine.
//!
//! A [`Socket`] sits on top of a [`Link`], the lower layer that delivers raw
//! bytes for exactly one peer. Today that is a kernel TCP stream; the segment
//! path ([`Socket::ingest_segment`]) lets a different wire protocol feed the
//! same receive buffer later.
//!
//! Lifecycle is monotonic:
//!
//! ```text
//! Uninitialized --open--> Open --close/timeout/EOF--> Closing --> Closed
//! ```
//!
//! A closed socket is never reopened; reconnection needs a new socket.
//! Sockets are owned by a single task and are not shared.

use crate::error::SocketError;
use crate::transport::buffer::RecvBuffer;
use crate::transport::option::{parse_option, NegotiatedOptions};
use crate::transport::segment::Segment;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace};

/// Lower layer carrying bytes for one peer.
pub trait Link: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Link for T {}

/// Socket lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Uninitialized,
    Open,
    Closing,
    Closed,
}

/// A relative timer. Setting it supersedes any pending deadline; successful
/// I/O re-arms it with the same duration.
#[derive(Debug, Clone, Copy, Default)]
struct Timer {
    timeout: Option<Duration>,
    deadline: Option<Instant>,
}

impl Timer {
    fn set(&mut self, timeout: Duration) {
        self.timeout = Some(timeout);
        self.deadline = Some(Instant::now() + timeout);
    }

    fn rearm(&mut self) {
        if let Some(timeout) = self.timeout {
            self.deadline = Some(Instant::now() + timeout);
        }
    }
}

/// One transport connection.
pub struct Socket<L> {
    local: SocketAddr,
    remote: SocketAddr,
    state: SocketState,
    link: L,
    recv: RecvBuffer,
    options: NegotiatedOptions,
    read_timer: Timer,
    write_timer: Timer,
    last_activity: Instant,
}

impl<L: Link> Socket<L> {
    /// Wrap `link` without allocating; the socket stays Uninitialized until
    /// [`Socket::open`] is called.
    pub fn new(local: SocketAddr, remote: SocketAddr, link: L) -> Self {
        Self {
            local,
            remote,
            state: SocketState::Uninitialized,
            link,
            recv: RecvBuffer::new(0),
            options: NegotiatedOptions::default(),
            read_timer: Timer::default(),
            write_timer: Timer::default(),
            last_activity: Instant::now(),
        }
    }

    /// Wrap an accepted link and open it in one step.
    pub fn accepted(local: SocketAddr, remote: SocketAddr, link: L, receive_buffer: usize) -> Self {
        let mut socket = Self::new(local, remote, link);
        socket.recv = RecvBuffer::new(receive_buffer);
        socket.state = SocketState::Open;
        socket
    }

    /// Allocate the receive buffer and default options, then move to Open.
    ///
    /// Only valid once, from Uninitialized.
    pub fn open(&mut self, receive_buffer: usize) -> Result<(), SocketError> {
        if self.state != SocketState::Uninitialized {
            return Err(SocketError::Closed);
        }
        self.recv = RecvBuffer::new(receive_buffer);
        self.options = NegotiatedOptions::default();
        self.state = SocketState::Open;
        self.last_activity = Instant::now();
        Ok(())
    }

    pub fn state(&self) -> SocketState {
        self.state
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn options(&self) -> &NegotiatedOptions {
        &self.options
    }

    /// Bytes waiting in the receive buffer.
    pub fn buffered(&self) -> usize {
        self.recv.len()
    }

    /// Time since the last successful I/O.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Guard run first by every operation.
    fn check_socket(&self) -> Result<(), SocketError> {
        if self.state == SocketState::Open {
            Ok(())
        } else {
            Err(SocketError::Closed)
        }
    }

    /// Read buffered bytes into `buf`.
    ///
    /// Returns immediately with 0 for an empty `buf`. Otherwise waits until
    /// at least one byte is buffered or the read deadline elapses; an elapsed
    /// deadline closes the socket. Fewer bytes than requested is a normal
    /// partial read.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, SocketError> {
        self.check_socket()?;
        if buf.is_empty() {
            return Ok(0);
        }

        if self.recv.is_empty() {
            self.fill().await?;
        }

        Ok(self.recv.read_into(buf))
    }

    /// Wait for the link to move bytes into the empty receive buffer.
    async fn fill(&mut self) -> Result<(), SocketError> {
        let outcome = {
            let mut dst = self.recv.writable();
            let read = self.link.read_buf(&mut dst);
            match self.read_timer.deadline {
                Some(deadline) => timeout_at(deadline, read).await.ok(),
                None => Some(read.await),
            }
        };

        match outcome {
            None => {
                debug!(peer = %self.remote, "Read deadline elapsed");
                self.close().await;
                Err(SocketError::Timeout)
            }
            Some(Ok(0)) => {
                trace!(peer = %self.remote, "Link closed by peer");
                self.close().await;
                Err(SocketError::Closed)
            }
            Some(Ok(n)) => {
                trace!(peer = %self.remote, bytes = n, "Link read");
                self.touch();
                self.read_timer.rearm();
                Ok(())
            }
            Some(Err(e)) => {
                self.close().await;
                Err(e.into())
            }
        }
    }

    /// Transmit all of `buf`, bounded by the write deadline.
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize, SocketError> {
        self.check_socket()?;
        if buf.is_empty() {
            return Ok(0);
        }

        let outcome = {
            let link = &mut self.link;
            let write = async move {
                link.write_all(buf).await?;
                link.flush().await
            };
            match self.write_timer.deadline {
                Some(deadline) => timeout_at(deadline, write).await.ok(),
                None => Some(write.await),
            }
        };

        match outcome {
            None => {
                debug!(peer = %self.remote, "Write deadline elapsed");
                self.close().await;
                Err(SocketError::Timeout)
            }
            Some(Ok(())) => {
                self.touch();
                self.write_timer.rearm();
                Ok(buf.len())
            }
            Some(Err(e)) => {
                self.close().await;
                Err(e.into())
            }
        }
    }

    /// Parse and apply one option at the head of `raw`.
    ///
    /// Returns the option's declared length so the caller can advance.
    pub fn process_option(&mut self, raw: &[u8]) -> Result<usize, SocketError> {
        self.check_socket()?;
        let (option, consumed) = parse_option(raw)?;
        self.options.apply(&option);
        Ok(consumed)
    }

    /// Accept one raw segment from a segment-carrying link.
    ///
    /// Recognized options are applied and the payload is appended to the
    /// receive buffer. A payload that does not fit is rejected whole with
    /// `BufferFull` and the socket stays open. Malformed, corrupted, or
    /// rejected segments leave socket state untouched.
    pub fn ingest_segment(&mut self, raw: &[u8]) -> Result<usize, SocketError> {
        self.check_socket()?;
        let segment = Segment::parse(raw)?;
        if !segment.checksum_valid() {
            debug!(peer = %self.remote, "Dropping segment with bad checksum");
            return Err(SocketError::ChecksumMismatch);
        }
        let options = segment.options().collect::<Result<Vec<_>, _>>()?;

        let payload = segment.payload();
        self.recv.push(payload)?;
        for option in &options {
            self.options.apply(option);
        }
        self.touch();
        self.read_timer.rearm();
        Ok(payload.len())
    }

    /// Bound the wait inside `read` to `timeout` from now.
    pub fn set_read_timeout(&mut self, timeout: Duration) -> Result<(), SocketError> {
        self.check_socket()?;
        self.read_timer.set(timeout);
        Ok(())
    }

    /// Bound `write` to `timeout` from now.
    pub fn set_write_timeout(&mut self, timeout: Duration) -> Result<(), SocketError> {
        self.check_socket()?;
        self.write_timer.set(timeout);
        Ok(())
    }

    /// Set both read and write timeouts.
    pub fn set_deadline(&mut self, timeout: Duration) -> Result<(), SocketError> {
        self.check_socket()?;
        self.read_timer.set(timeout);
        self.write_timer.set(timeout);
        Ok(())
    }

    /// Close the socket. Closing a closed socket does nothing.
    pub async fn close(&mut self) {
        if self.state == SocketState::Closed {
            return;
        }

        let was_open = self.state == SocketState::Open;
        self.state = SocketState::Closing;
        if was_open {
            if let Err(e) = self.link.shutdown().await {
                debug!(peer = %self.remote, error = %e, "Link shutdown failed");
            }
        }
        self.recv.clear();
        self.state = SocketState::Closed;
        trace!(peer = %self.remote, "Socket closed");
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::option::SegmentOption;
    use crate::transport::segment::SegmentBuilder;
    use tokio::io::{duplex, DuplexStream};

    fn addrs() -> (SocketAddr, SocketAddr) {
        (
            "127.0.0.1:7000".parse().unwrap(),
            "127.0.0.1:40000".parse().unwrap(),
        )
    }

    fn open_pair(capacity: usize) -> (Socket<DuplexStream>, DuplexStream) {
        let (local, remote) = addrs();
        let (peer, link) = duplex(1024);
        (Socket::accepted(local, remote, link, capacity), peer)
    }

    #[tokio::test]
    async fn test_read_and_write() {
        let (mut socket, mut peer) = open_pair(64);
        assert_eq!(socket.state(), SocketState::Open);

        peer.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 16];
        let n = socket.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");

        assert_eq!(socket.write(b"world").await.unwrap(), 5);
        let mut out = [0u8; 5];
        peer.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"world");
    }

    #[tokio::test]
    async fn test_zero_length_read_returns_immediately() {
        let (mut socket, _peer) = open_pair(64);
        // No data is ever sent and no deadline is set; a blocking read would hang.
        let n = socket.read(&mut []).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_partial_read() {
        let (mut socket, mut peer) = open_pair(64);
        peer.write_all(b"abcdef").await.unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(socket.read(&mut buf).await.unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(socket.read(&mut buf).await.unwrap(), 2);
        assert_eq!(&buf[..2], b"ef");
    }

    #[tokio::test]
    async fn test_link_read_bounded_by_capacity() {
        let (mut socket, mut peer) = open_pair(4);
        peer.write_all(b"abcdefgh").await.unwrap();

        let mut buf = [0u8; 16];
        let n = socket.read(&mut buf).await.unwrap();
        assert_eq!(n, 4);
        let n = socket.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"efgh");
    }

    #[tokio::test]
    async fn test_idle_timeout_closes_socket() {
        let (mut socket, _peer) = open_pair(64);
        socket.set_deadline(Duration::from_millis(50)).unwrap();

        let mut buf = [0u8; 8];
        assert!(matches!(
            socket.read(&mut buf).await,
            Err(SocketError::Timeout)
        ));
        assert_eq!(socket.state(), SocketState::Closed);
        assert!(matches!(socket.read(&mut buf).await, Err(SocketError::Closed)));
        assert!(matches!(socket.write(b"x").await, Err(SocketError::Closed)));
    }

    #[tokio::test]
    async fn test_timeout_supersedes_previous() {
        let (mut socket, mut peer) = open_pair(64);
        socket.set_read_timeout(Duration::from_millis(20)).unwrap();
        socket.set_read_timeout(Duration::from_secs(5)).unwrap();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            peer.write_all(b"late").await.unwrap();
            // Keep the peer alive until the socket has read.
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let mut buf = [0u8; 8];
        let n = socket.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"late");
    }

    #[tokio::test]
    async fn test_successful_read_rearms_deadline() {
        let (mut socket, mut peer) = open_pair(64);
        socket.set_read_timeout(Duration::from_millis(300)).unwrap();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            peer.write_all(b"one").await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
            peer.write_all(b"two").await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let mut buf = [0u8; 8];
        let n = socket.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"one");
        // 400ms after the timeout was set, but only 200ms after the last read.
        let n = socket.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"two");
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (mut socket, _peer) = open_pair(64);
        socket.close().await;
        assert_eq!(socket.state(), SocketState::Closed);
        socket.close().await;
        assert_eq!(socket.state(), SocketState::Closed);
        assert!(matches!(
            socket.set_deadline(Duration::from_secs(1)),
            Err(SocketError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_peer_eof_closes_socket() {
        let (mut socket, peer) = open_pair(64);
        drop(peer);

        let mut buf = [0u8; 8];
        assert!(matches!(socket.read(&mut buf).await, Err(SocketError::Closed)));
        assert_eq!(socket.state(), SocketState::Closed);
    }

    #[tokio::test]
    async fn test_uninitialized_and_reopen() {
        let (local, remote) = addrs();
        let (_peer, link) = duplex(64);
        let mut socket = Socket::new(local, remote, link);
        assert_eq!(socket.state(), SocketState::Uninitialized);

        let mut buf = [0u8; 4];
        assert!(matches!(socket.read(&mut buf).await, Err(SocketError::Closed)));

        socket.open(32).unwrap();
        assert_eq!(socket.state(), SocketState::Open);
        assert_eq!(socket.options().mss, crate::transport::option::DEFAULT_MSS);

        socket.close().await;
        assert!(matches!(socket.open(32), Err(SocketError::Closed)));
        assert_eq!(socket.state(), SocketState::Closed);
    }

    #[tokio::test]
    async fn test_ingest_segment() {
        let (mut socket, _peer) = open_pair(64);
        let raw = SegmentBuilder::new(40000, 7000)
            .option(SegmentOption::Mss(1460))
            .option(SegmentOption::CongestionControl(4))
            .build(b"payload")
            .unwrap();

        assert_eq!(socket.ingest_segment(&raw).unwrap(), 7);
        assert_eq!(socket.options().mss, 1460);
        assert_eq!(socket.options().congestion_control, Some(4));

        // Buffered data is served without touching the link.
        let mut buf = [0u8; 16];
        let n = socket.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"payload");
    }

    #[tokio::test]
    async fn test_ingest_backpressure_rejects_whole_payload() {
        let (mut socket, _peer) = open_pair(8);
        let first = SegmentBuilder::new(1, 2).build(b"123456").unwrap();
        let second = SegmentBuilder::new(1, 2).build(b"789").unwrap();

        socket.ingest_segment(&first).unwrap();
        assert!(matches!(
            socket.ingest_segment(&second),
            Err(SocketError::BufferFull { needed: 3, free: 2 })
        ));
        assert_eq!(socket.buffered(), 6);
        assert_eq!(socket.state(), SocketState::Open);
    }

    #[tokio::test]
    async fn test_malformed_segments_rejected() {
        let (mut socket, _peer) = open_pair(64);
        assert!(matches!(
            socket.ingest_segment(&[0u8; 10]),
            Err(SocketError::PacketTooShort { .. })
        ));

        let mut raw = SegmentBuilder::new(1, 2).build(b"ab").unwrap();
        raw[12] = 15 << 4;
        assert!(matches!(
            socket.ingest_segment(&raw),
            Err(SocketError::PacketWrongLength { .. })
        ));

        assert_eq!(socket.state(), SocketState::Open);
        assert_eq!(socket.buffered(), 0);
    }

    #[tokio::test]
    async fn test_corrupted_segment_dropped() {
        let (mut socket, _peer) = open_pair(64);
        let mut raw = SegmentBuilder::new(1, 2)
            .option(SegmentOption::Mss(1460))
            .build(b"payload")
            .unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;

        assert!(matches!(
            socket.ingest_segment(&raw),
            Err(SocketError::ChecksumMismatch)
        ));
        assert_eq!(socket.buffered(), 0);
        assert_eq!(socket.options().mss, crate::transport::option::DEFAULT_MSS);
        assert_eq!(socket.state(), SocketState::Open);
    }

    #[tokio::test]
    async fn test_process_option_advances_by_declared_length() {
        let (mut socket, _peer) = open_pair(64);
        let area = [2u8, 4, 0x05, 0xb4, 200, 4, 0xde, 0xad];

        let consumed = socket.process_option(&area).unwrap();
        assert_eq!(consumed, 4);
        let consumed = socket.process_option(&area[consumed..]).unwrap();
        assert_eq!(consumed, 4);
        assert_eq!(socket.options().mss, 1460);
    }
}
