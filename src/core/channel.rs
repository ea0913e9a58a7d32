//! One end of a relayed session.
//!
//! A `Channel` owns a transport stream split into reader/writer halves, the
//! receive-side partial buffer, and the optional send-side cipher. Disposal
//! trips a per-channel CancellationToken so in-flight reads and writes
//! unwind instead of blocking forever on a dead socket.

use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::core::cipher::Rc4;
use crate::core::protocol::{read_masked_u16, PacketFormat, OUTBOUND_MARKER};
use crate::error::{RelayError, Result};
use crate::transport::TransportStream;

/// Opportunistic read size while hunting for an inbound terminator
const INBOUND_CHUNK_SIZE: usize = 256;

/// Cap on the unconsumed partial buffer; a terminator-less stream this long
/// is corrupt or hostile
const MAX_PARTIAL_BUFFER: usize = 64 * 1024;

struct ChannelReader {
    stream: ReadHalf<TransportStream>,
    /// Received-but-unconsumed bytes, including pushed-back peeked frames
    buffer: BytesMut,
    /// How far the inbound terminator scan has already looked
    scanned: usize,
}

struct ChannelWriter {
    stream: WriteHalf<TransportStream>,
    cipher: Option<Rc4>,
}

/// One endpoint of a session, receive side framed as `format`.
pub struct Channel {
    format: PacketFormat,
    peer: String,
    reader: Mutex<ChannelReader>,
    writer: Mutex<ChannelWriter>,
    connected: AtomicBool,
    disposed: AtomicBool,
    closed: CancellationToken,
}

impl Channel {
    pub fn new(stream: TransportStream, format: PacketFormat, peer: impl Into<String>) -> Arc<Self> {
        let (read_half, write_half) = tokio::io::split(stream);
        Arc::new(Self {
            format,
            peer: peer.into(),
            reader: Mutex::new(ChannelReader {
                stream: read_half,
                buffer: BytesMut::new(),
                scanned: 0,
            }),
            writer: Mutex::new(ChannelWriter {
                stream: write_half,
                cipher: None,
            }),
            connected: AtomicBool::new(true),
            disposed: AtomicBool::new(false),
            closed: CancellationToken::new(),
        })
    }

    /// Format of the frames this channel receives.
    pub fn format(&self) -> PacketFormat {
        self.format
    }

    /// Peer label for logging.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire) && !self.is_disposed()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Idempotent teardown: marks the channel dead and aborts in-flight IO.
    /// The underlying socket closes when the last reference drops.
    pub fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            self.connected.store(false, Ordering::Release);
            self.closed.cancel();
        }
    }

    /// Install the send-side cipher. One-way: once keyed, every subsequent
    /// `send_packet` passes through the keystream.
    pub async fn install_cipher(&self, cipher: Rc4) {
        let mut writer = self.writer.lock().await;
        writer.cipher = Some(cipher);
    }

    pub async fn has_cipher(&self) -> bool {
        self.writer.lock().await.cipher.is_some()
    }

    /// Receive exactly `n` bytes, draining the pushback buffer first.
    pub async fn receive_bytes(&self, n: usize, cancel: &CancellationToken) -> Result<Bytes> {
        let mut reader = self.reader.lock().await;
        self.fill(&mut reader, n, cancel).await?;
        reader.scanned = reader.scanned.saturating_sub(n);
        Ok(reader.buffer.split_to(n).freeze())
    }

    /// Receive one complete raw frame in this channel's format.
    pub async fn receive_packet(&self, cancel: &CancellationToken) -> Result<Bytes> {
        let mut reader = self.reader.lock().await;
        self.receive_frame_locked(&mut reader, cancel).await
    }

    /// Receive one frame, then push its bytes back so the next
    /// `receive_packet` yields it again.
    pub async fn peek_packet(&self, cancel: &CancellationToken) -> Result<Bytes> {
        let mut reader = self.reader.lock().await;
        let frame = self.receive_frame_locked(&mut reader, cancel).await?;

        let mut restored = BytesMut::with_capacity(frame.len() + reader.buffer.len());
        restored.extend_from_slice(&frame);
        restored.extend_from_slice(&reader.buffer);
        reader.buffer = restored;
        reader.scanned = 0;
        Ok(frame)
    }

    /// Send one frame, through the installed cipher if any. Atomic with
    /// respect to other sends: the writer lock is held for the whole write.
    pub async fn send_packet(&self, frame: &[u8], cancel: &CancellationToken) -> Result<()> {
        if self.is_disposed() {
            return Err(RelayError::ConnectionClosed);
        }
        let mut writer = self.writer.lock().await;

        let mut data = frame.to_vec();
        if let Some(cipher) = writer.cipher.as_mut() {
            cipher.apply(&mut data);
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.dispose();
                Err(RelayError::Cancelled)
            }
            _ = self.closed.cancelled() => Err(RelayError::ConnectionClosed),
            result = async {
                writer.stream.write_all(&data).await?;
                writer.stream.flush().await
            } => result.map_err(|_| {
                self.dispose();
                RelayError::ConnectionClosed
            }),
        }
    }

    async fn receive_frame_locked(
        &self,
        reader: &mut ChannelReader,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        match self.format {
            PacketFormat::Outbound => {
                // Fixed header first: marker + declared length
                self.fill(reader, 3, cancel).await?;
                if reader.buffer[0] != OUTBOUND_MARKER {
                    self.dispose();
                    return Err(RelayError::ProtocolViolation(format!(
                        "bad outbound frame marker: {:#04x}",
                        reader.buffer[0]
                    )));
                }
                let declared = read_masked_u16(&reader.buffer[1..3]) as usize;
                if declared < 2 {
                    self.dispose();
                    return Err(RelayError::ProtocolViolation(format!(
                        "outbound frame declares {} bytes, id needs 2",
                        declared
                    )));
                }
                self.fill(reader, 3 + declared, cancel).await?;
                reader.scanned = 0;
                Ok(reader.buffer.split_to(3 + declared).freeze())
            }
            PacketFormat::Inbound => loop {
                let extracted = self
                    .format
                    .try_extract_frame(&mut reader.buffer, &mut reader.scanned)
                    .inspect_err(|_| self.dispose())?;
                if let Some(frame) = extracted {
                    return Ok(frame);
                }
                if reader.buffer.len() > MAX_PARTIAL_BUFFER {
                    self.dispose();
                    return Err(RelayError::ProtocolViolation(format!(
                        "partial buffer exceeded {} bytes without a terminator",
                        MAX_PARTIAL_BUFFER
                    )));
                }
                reader.buffer.reserve(INBOUND_CHUNK_SIZE);
                self.read_chunk(reader, cancel).await?;
            },
        }
    }

    /// Grow the buffer until it holds at least `min` bytes.
    async fn fill(
        &self,
        reader: &mut ChannelReader,
        min: usize,
        cancel: &CancellationToken,
    ) -> Result<()> {
        while reader.buffer.len() < min {
            self.read_chunk(reader, cancel).await?;
        }
        Ok(())
    }

    /// One socket read appended to the buffer. Two consecutive zero-byte
    /// reads mean the peer is gone.
    async fn read_chunk(
        &self,
        reader: &mut ChannelReader,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut zero_reads = 0;
        loop {
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.dispose();
                    return Err(RelayError::Cancelled);
                }
                _ = self.closed.cancelled() => return Err(RelayError::ConnectionClosed),
                result = reader.stream.read_buf(&mut reader.buffer) => result,
            };
            match read {
                Ok(0) => {
                    zero_reads += 1;
                    if zero_reads >= 2 {
                        self.dispose();
                        return Err(RelayError::ConnectionClosed);
                    }
                }
                Ok(_) => return Ok(()),
                Err(_) => {
                    self.dispose();
                    return Err(RelayError::ConnectionClosed);
                }
            }
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("format", &self.format)
            .field("peer", &self.peer)
            .field("connected", &self.is_connected())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::Packet;
    use tokio::io::AsyncWriteExt;

    fn pair(format: PacketFormat) -> (Arc<Channel>, tokio::io::DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(4096);
        (Channel::new(Box::pin(ours), format, "test"), theirs)
    }

    #[tokio::test]
    async fn test_receive_outbound_packet() {
        let (channel, mut remote) = pair(PacketFormat::Outbound);
        let frame = PacketFormat::Outbound.encode(4002, b"body");
        remote.write_all(&frame).await.unwrap();

        let cancel = CancellationToken::new();
        let received = channel.receive_packet(&cancel).await.unwrap();
        assert_eq!(received, frame);
        let packet = Packet::from_frame(PacketFormat::Outbound, &received).unwrap();
        assert_eq!(packet.id, 4002);
        assert_eq!(&packet.body[..], b"body");
    }

    #[tokio::test]
    async fn test_receive_inbound_packet_across_split_writes() {
        let (channel, mut remote) = pair(PacketFormat::Inbound);
        let frame = PacketFormat::Inbound.encode(229, b"welcome");
        let (first, second) = frame.split_at(3);

        let cancel = CancellationToken::new();
        remote.write_all(first).await.unwrap();
        let pending = tokio::spawn({
            let channel = Arc::clone(&channel);
            async move { channel.receive_packet(&cancel).await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        remote.write_all(second).await.unwrap();

        let received = pending.await.unwrap().unwrap();
        assert_eq!(received, frame);
    }

    #[tokio::test]
    async fn test_receive_two_inbound_packets_from_one_write() {
        let (channel, mut remote) = pair(PacketFormat::Inbound);
        let a = PacketFormat::Inbound.encode(1, b"aa");
        let b = PacketFormat::Inbound.encode(2, b"bb");
        let mut glued = a.to_vec();
        glued.extend_from_slice(&b);
        remote.write_all(&glued).await.unwrap();

        let cancel = CancellationToken::new();
        assert_eq!(channel.receive_packet(&cancel).await.unwrap(), a);
        assert_eq!(channel.receive_packet(&cancel).await.unwrap(), b);
    }

    #[tokio::test]
    async fn test_peek_then_receive_returns_same_frame() {
        let (channel, mut remote) = pair(PacketFormat::Outbound);
        let frame = PacketFormat::Outbound.encode(4001, b"10.0.0.1:30000");
        remote.write_all(&frame).await.unwrap();

        let cancel = CancellationToken::new();
        let peeked = channel.peek_packet(&cancel).await.unwrap();
        let received = channel.receive_packet(&cancel).await.unwrap();
        assert_eq!(peeked, received);
    }

    #[tokio::test]
    async fn test_bad_marker_disposes_channel() {
        let (channel, mut remote) = pair(PacketFormat::Outbound);
        remote.write_all(b"\x00\x41\x42").await.unwrap();

        let cancel = CancellationToken::new();
        let err = channel.receive_packet(&cancel).await.unwrap_err();
        assert!(matches!(err, RelayError::ProtocolViolation(_)));
        assert!(channel.is_disposed());
    }

    #[tokio::test]
    async fn test_peer_close_is_connection_closed() {
        let (channel, remote) = pair(PacketFormat::Inbound);
        drop(remote);

        let cancel = CancellationToken::new();
        let err = channel.receive_packet(&cancel).await.unwrap_err();
        assert!(matches!(err, RelayError::ConnectionClosed));
        assert!(channel.is_disposed());
    }

    #[tokio::test]
    async fn test_cancellation_aborts_pending_receive() {
        let (channel, _remote) = pair(PacketFormat::Inbound);
        let cancel = CancellationToken::new();

        let pending = tokio::spawn({
            let channel = Arc::clone(&channel);
            let cancel = cancel.clone();
            async move { channel.receive_packet(&cancel).await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        cancel.cancel();

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, RelayError::Cancelled));
        assert!(channel.is_disposed());
    }

    #[tokio::test]
    async fn test_send_packet_plain() {
        let (channel, mut remote) = pair(PacketFormat::Inbound);
        let frame = PacketFormat::Outbound.encode(100, b"hello");

        let cancel = CancellationToken::new();
        channel.send_packet(&frame, &cancel).await.unwrap();

        let mut got = vec![0u8; frame.len()];
        tokio::io::AsyncReadExt::read_exact(&mut remote, &mut got)
            .await
            .unwrap();
        assert_eq!(got, frame.to_vec());
    }

    #[tokio::test]
    async fn test_send_packet_applies_installed_cipher() {
        let (channel, mut remote) = pair(PacketFormat::Inbound);
        let frame = PacketFormat::Outbound.encode(100, b"hello");

        channel.install_cipher(Rc4::new(&[0x0A, 0x0B]).unwrap()).await;
        let cancel = CancellationToken::new();
        channel.send_packet(&frame, &cancel).await.unwrap();

        let mut got = vec![0u8; frame.len()];
        tokio::io::AsyncReadExt::read_exact(&mut remote, &mut got)
            .await
            .unwrap();
        assert_ne!(got, frame.to_vec());

        // The peer's matching keystream recovers the frame
        let mut expected = frame.to_vec();
        Rc4::new(&[0x0A, 0x0B]).unwrap().apply(&mut expected);
        assert_eq!(got, expected);
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let (channel, _remote) = pair(PacketFormat::Outbound);
        assert!(channel.is_connected());
        channel.dispose();
        channel.dispose();
        assert!(channel.is_disposed());
        assert!(!channel.is_connected());
    }

    #[tokio::test]
    async fn test_send_after_dispose_fails() {
        let (channel, _remote) = pair(PacketFormat::Outbound);
        channel.dispose();
        let cancel = CancellationToken::new();
        let err = channel.send_packet(b"x", &cancel).await.unwrap_err();
        assert!(matches!(err, RelayError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_receive_bytes_exact() {
        let (channel, mut remote) = pair(PacketFormat::Outbound);
        remote.write_all(b"abcdef").await.unwrap();

        let cancel = CancellationToken::new();
        let first = channel.receive_bytes(2, &cancel).await.unwrap();
        let rest = channel.receive_bytes(4, &cancel).await.unwrap();
        assert_eq!(&first[..], b"ab");
        assert_eq!(&rest[..], b"cdef");
    }

    #[tokio::test]
    async fn test_unterminated_inbound_stream_is_bounded() {
        let (channel, mut remote) = pair(PacketFormat::Inbound);
        let cancel = CancellationToken::new();

        let receive = tokio::spawn({
            let channel = Arc::clone(&channel);
            async move { channel.receive_packet(&cancel).await }
        });

        // Terminator-free garbage past the cap; the writer may stall once
        // the receiver gives up, so it must not be awaited
        let writer = tokio::spawn(async move {
            let junk = vec![0x41u8; 8 * 1024];
            for _ in 0..10 {
                if remote.write_all(&junk).await.is_err() {
                    break;
                }
            }
        });

        let err = receive.await.unwrap().unwrap_err();
        assert!(matches!(err, RelayError::ProtocolViolation(_)));
        writer.abort();
    }
}
