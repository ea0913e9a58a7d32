//! Wire framing and field codecs for the game protocol.
//!
//! The protocol uses two asymmetric framings:
//! - Outbound (client -> server): `[0x40][masked u16 length][masked u16 id][body]`,
//!   where the declared length covers the id and body.
//! - Inbound (server -> client): `[masked u16 id][body][0x01]`, delimited by
//!   the terminator byte.
//!
//! Masked bytes carry 6 bits of payload with `01` in the top two bits, so a
//! masked byte can never collide with the frame terminator.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{RelayError, Result};

/// Mask applied to every 6-bit wire byte (`01` in the top two bits)
pub const BYTE_MASK: u8 = 0x40;

/// First byte of every outbound frame
pub const OUTBOUND_MARKER: u8 = 0x40;

/// Terminator byte closing every inbound frame
pub const FRAME_TERMINATOR: u8 = 0x01;

/// Terminator byte closing inbound strings
pub const STRING_TERMINATOR: u8 = 0x02;

/// Reserved outbound id: client announces the real server address
pub const ADDRESS_SHOUT_ID: u16 = 4001;

/// Reserved outbound id: client delivers the hex shared secret for the
/// session stream cipher
pub const KEY_EXCHANGE_ID: u16 = 4002;

/// Largest group count a masked integer may declare
const MAX_INT_GROUPS: usize = 6;

/// One decoded packet. Immutable; mutation builds a new packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: u16,
    pub body: Bytes,
}

impl Packet {
    pub fn new(id: u16, body: impl Into<Bytes>) -> Self {
        Self {
            id,
            body: body.into(),
        }
    }

    /// Encode this packet as a wire frame in the given format.
    pub fn encode(&self, format: PacketFormat) -> Bytes {
        format.encode(self.id, &self.body)
    }

    /// Decode a complete wire frame.
    pub fn from_frame(format: PacketFormat, frame: &[u8]) -> Result<Self> {
        Ok(Self {
            id: format.decode_id(frame)?,
            body: Bytes::copy_from_slice(format.decode_body(frame)?),
        })
    }
}

/// The two wire framings. Doubles as the direction tag: a channel receives
/// exactly one format, and a relay direction carries exactly one format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketFormat {
    /// Client -> server, length-delimited
    Outbound,
    /// Server -> client, terminator-delimited
    Inbound,
}

impl std::fmt::Display for PacketFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PacketFormat::Outbound => write!(f, "outbound"),
            PacketFormat::Inbound => write!(f, "inbound"),
        }
    }
}

impl PacketFormat {
    /// Byte offset of the id within a frame
    pub fn id_position(&self) -> usize {
        match self {
            PacketFormat::Outbound => 3,
            PacketFormat::Inbound => 0,
        }
    }

    /// Byte offset of the body within a frame
    pub fn body_start(&self) -> usize {
        match self {
            PacketFormat::Outbound => 5,
            PacketFormat::Inbound => 2,
        }
    }

    /// Smallest valid frame: header + id (+ terminator for inbound)
    pub fn min_frame_len(&self) -> usize {
        match self {
            PacketFormat::Outbound => 5,
            PacketFormat::Inbound => 3,
        }
    }

    /// Encode a complete frame from id and body.
    pub fn encode(&self, id: u16, body: &[u8]) -> Bytes {
        match self {
            PacketFormat::Outbound => {
                let mut frame = BytesMut::with_capacity(5 + body.len());
                frame.put_u8(OUTBOUND_MARKER);
                put_masked_u16(&mut frame, (body.len() + 2) as u16);
                put_masked_u16(&mut frame, id);
                frame.put_slice(body);
                frame.freeze()
            }
            PacketFormat::Inbound => {
                let mut frame = BytesMut::with_capacity(3 + body.len());
                put_masked_u16(&mut frame, id);
                frame.put_slice(body);
                frame.put_u8(FRAME_TERMINATOR);
                frame.freeze()
            }
        }
    }

    /// Decode the id of a complete frame.
    pub fn decode_id(&self, frame: &[u8]) -> Result<u16> {
        if frame.len() < self.min_frame_len() {
            return Err(RelayError::ProtocolViolation(format!(
                "{} frame too short for id: {} bytes",
                self,
                frame.len()
            )));
        }
        Ok(read_masked_u16(&frame[self.id_position()..]))
    }

    /// Decode the body slice of a complete frame.
    pub fn decode_body<'a>(&self, frame: &'a [u8]) -> Result<&'a [u8]> {
        if frame.len() < self.min_frame_len() {
            return Err(RelayError::ProtocolViolation(format!(
                "{} frame too short for body: {} bytes",
                self,
                frame.len()
            )));
        }
        match self {
            PacketFormat::Outbound => Ok(&frame[5..]),
            PacketFormat::Inbound => Ok(&frame[2..frame.len() - 1]),
        }
    }

    /// Try to split one complete frame off the front of `buf`.
    ///
    /// Returns `Ok(None)` and leaves the buffer content untouched when no
    /// complete frame has arrived yet, so the caller can retry after the
    /// next read. `scanned` is a caller-held hint recording how far the
    /// inbound terminator scan has already looked; it is reset whenever a
    /// frame is split off.
    pub fn try_extract_frame(
        &self,
        buf: &mut BytesMut,
        scanned: &mut usize,
    ) -> Result<Option<Bytes>> {
        match self {
            PacketFormat::Outbound => {
                if buf.len() < 3 {
                    return Ok(None);
                }
                if buf[0] != OUTBOUND_MARKER {
                    return Err(RelayError::ProtocolViolation(format!(
                        "bad outbound frame marker: {:#04x}",
                        buf[0]
                    )));
                }
                let declared = read_masked_u16(&buf[1..3]) as usize;
                if declared < 2 {
                    return Err(RelayError::ProtocolViolation(format!(
                        "outbound frame declares {} bytes, id needs 2",
                        declared
                    )));
                }
                if buf.len() < 3 + declared {
                    return Ok(None);
                }
                *scanned = 0;
                Ok(Some(buf.split_to(3 + declared).freeze()))
            }
            PacketFormat::Inbound => {
                let start = (*scanned).min(buf.len());
                match buf[start..].iter().position(|&b| b == FRAME_TERMINATOR) {
                    Some(offset) => {
                        let end = start + offset;
                        *scanned = 0;
                        let frame = buf.split_to(end + 1).freeze();
                        if frame.len() < self.min_frame_len() {
                            return Err(RelayError::ProtocolViolation(format!(
                                "inbound frame truncated: {} bytes",
                                frame.len()
                            )));
                        }
                        Ok(Some(frame))
                    }
                    None => {
                        *scanned = buf.len();
                        Ok(None)
                    }
                }
            }
        }
    }
}

/// Append a masked 2-byte integer (6 bits per byte, most significant first).
pub fn put_masked_u16(out: &mut BytesMut, value: u16) {
    out.put_u8(BYTE_MASK | ((value >> 6) & 0x3F) as u8);
    out.put_u8(BYTE_MASK | (value & 0x3F) as u8);
}

/// Read a masked 2-byte integer. Caller guarantees two bytes.
pub fn read_masked_u16(data: &[u8]) -> u16 {
    (((data[0] & 0x3F) as u16) << 6) | (data[1] & 0x3F) as u16
}

/// Encode a signed integer as masked 6-bit groups, least significant first.
///
/// First byte layout: `01 | group-count(3 bits) | sign(1 bit) | low 2 value
/// bits`; each following byte contributes 6 more value bits.
pub fn encode_masked_i32(value: i32) -> Vec<u8> {
    let negative = value < 0;
    let mut v = value.unsigned_abs();

    let mut buf = vec![BYTE_MASK | (v & 3) as u8];
    v >>= 2;
    while v != 0 {
        buf.push(BYTE_MASK | (v & 0x3F) as u8);
        v >>= 6;
    }
    buf[0] |= ((buf.len() as u8) << 3) | if negative { 4 } else { 0 };
    buf
}

/// Decode a masked integer at the front of `data`, returning the value and
/// the number of bytes consumed.
pub fn decode_masked_i32(data: &[u8]) -> Result<(i32, usize)> {
    let first = *data
        .first()
        .ok_or_else(|| RelayError::ProtocolViolation("integer field truncated".into()))?
        & 0x3F;

    let negative = first & 4 != 0;
    let groups = ((first & 0x38) >> 3) as usize;
    if groups > MAX_INT_GROUPS {
        return Err(RelayError::ProtocolViolation(format!(
            "integer declares {} groups, max {}",
            groups, MAX_INT_GROUPS
        )));
    }
    let consumed = groups.max(1);
    if data.len() < consumed {
        return Err(RelayError::ProtocolViolation(format!(
            "integer declares {} groups, {} bytes available",
            groups,
            data.len()
        )));
    }

    let mut result = (first & 3) as i32;
    let mut shift = 2;
    for byte in data.iter().take(consumed).skip(1) {
        result |= ((byte & 0x3F) as i32) << shift;
        shift += 6;
    }
    Ok((if negative { result.wrapping_neg() } else { result }, consumed))
}

/// Cursor over a frame's body exposing the typed field readers.
pub struct PacketReader<'a> {
    format: PacketFormat,
    frame: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(format: PacketFormat, frame: &'a [u8]) -> Result<Self> {
        if frame.len() < format.min_frame_len() {
            return Err(RelayError::ProtocolViolation(format!(
                "{} frame too short: {} bytes",
                format,
                frame.len()
            )));
        }
        Ok(Self {
            format,
            frame,
            pos: format.body_start(),
        })
    }

    pub fn id(&self) -> u16 {
        read_masked_u16(&self.frame[self.format.id_position()..])
    }

    pub fn frame_len(&self) -> usize {
        self.frame.len()
    }

    fn body_end(&self) -> usize {
        match self.format {
            PacketFormat::Outbound => self.frame.len(),
            PacketFormat::Inbound => self.frame.len() - 1,
        }
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        let (value, consumed) = decode_masked_i32(&self.frame[self.pos..self.body_end()])?;
        self.pos += consumed;
        Ok(value)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        if self.pos + 2 > self.body_end() {
            return Err(RelayError::ProtocolViolation("u16 field truncated".into()));
        }
        let value = read_masked_u16(&self.frame[self.pos..]);
        self.pos += 2;
        Ok(value)
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_i32()? == 1)
    }

    pub fn read_utf8(&mut self) -> Result<String> {
        let end = self.body_end();
        let bytes = match self.format {
            PacketFormat::Outbound => {
                let len = self.read_u16()? as usize;
                if self.pos + len > end {
                    return Err(RelayError::ProtocolViolation(format!(
                        "string declares {} bytes, {} available",
                        len,
                        end - self.pos
                    )));
                }
                let bytes = &self.frame[self.pos..self.pos + len];
                self.pos += len;
                bytes
            }
            PacketFormat::Inbound => {
                let rel = self.frame[self.pos..end]
                    .iter()
                    .position(|&b| b == STRING_TERMINATOR)
                    .ok_or_else(|| {
                        RelayError::ProtocolViolation("unterminated string field".into())
                    })?;
                let bytes = &self.frame[self.pos..self.pos + rel];
                self.pos += rel + 1;
                bytes
            }
        };
        String::from_utf8(bytes.to_vec())
            .map_err(|_| RelayError::ProtocolViolation("string field is not UTF-8".into()))
    }
}

/// Body builder matching `PacketReader`'s field encodings.
pub struct PacketWriter {
    format: PacketFormat,
    id: u16,
    body: BytesMut,
}

impl PacketWriter {
    pub fn new(format: PacketFormat, id: u16) -> Self {
        Self {
            format,
            id,
            body: BytesMut::new(),
        }
    }

    pub fn write_i32(mut self, value: i32) -> Self {
        self.body.put_slice(&encode_masked_i32(value));
        self
    }

    pub fn write_u16(mut self, value: u16) -> Self {
        put_masked_u16(&mut self.body, value);
        self
    }

    pub fn write_bool(mut self, value: bool) -> Self {
        self.body.put_u8(BYTE_MASK | value as u8);
        self
    }

    pub fn write_utf8(mut self, value: &str) -> Self {
        match self.format {
            PacketFormat::Outbound => {
                put_masked_u16(&mut self.body, value.len() as u16);
                self.body.put_slice(value.as_bytes());
            }
            PacketFormat::Inbound => {
                self.body.put_slice(value.as_bytes());
                self.body.put_u8(STRING_TERMINATOR);
            }
        }
        self
    }

    pub fn into_packet(self) -> Packet {
        Packet::new(self.id, self.body.freeze())
    }

    /// Encode straight to a wire frame.
    pub fn into_frame(self) -> Bytes {
        let format = self.format;
        self.into_packet().encode(format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip_i32(value: i32) {
        let encoded = encode_masked_i32(value);
        let (decoded, consumed) = decode_masked_i32(&encoded).unwrap();
        assert_eq!(decoded, value, "value {} did not round-trip", value);
        assert_eq!(consumed, encoded.len());
        // Every byte must carry the 01 mask
        for b in &encoded {
            assert_eq!(b & 0xC0, 0x40, "byte {:#04x} not masked", b);
        }
    }

    #[test]
    fn test_masked_i32_round_trip() {
        for value in [0, 1, 2, 3, 4, 5, 63, 64, 255, 256, 4095, 100_000, i32::MAX] {
            round_trip_i32(value);
            round_trip_i32(-value);
        }
    }

    #[test]
    fn test_masked_i32_small_values_single_byte() {
        assert_eq!(encode_masked_i32(0).len(), 1);
        assert_eq!(encode_masked_i32(3).len(), 1);
        assert_eq!(encode_masked_i32(4).len(), 2);
    }

    #[test]
    fn test_masked_i32_sign_is_flag_not_complement() {
        let pos = encode_masked_i32(5);
        let neg = encode_masked_i32(-5);
        assert_eq!(pos.len(), neg.len());
        // Only the sign bit differs in the first byte
        assert_eq!(pos[0] | 4, neg[0]);
    }

    #[test]
    fn test_masked_i32_group_count_overflow_rejected() {
        // First byte declaring 7 groups (0b111 in the count bits)
        let data = [BYTE_MASK | 0x38, 0x41, 0x41, 0x41, 0x41, 0x41, 0x41];
        assert!(decode_masked_i32(&data).is_err());
    }

    #[test]
    fn test_masked_i32_truncated_rejected() {
        let encoded = encode_masked_i32(100_000);
        assert!(decode_masked_i32(&encoded[..encoded.len() - 1]).is_err());
        assert!(decode_masked_i32(&[]).is_err());
    }

    #[test]
    fn test_masked_u16_round_trip() {
        let mut buf = BytesMut::new();
        for value in [0u16, 1, 63, 64, 4002, 4095] {
            buf.clear();
            put_masked_u16(&mut buf, value);
            assert_eq!(buf.len(), 2);
            assert_eq!(read_masked_u16(&buf), value);
        }
    }

    #[test]
    fn test_outbound_frame_layout() {
        let frame = PacketFormat::Outbound.encode(4002, b"ab");
        assert_eq!(frame[0], OUTBOUND_MARKER);
        // Declared length covers id + body
        assert_eq!(read_masked_u16(&frame[1..3]), 4);
        assert_eq!(read_masked_u16(&frame[3..5]), 4002);
        assert_eq!(&frame[5..], b"ab");
    }

    #[test]
    fn test_inbound_frame_layout() {
        let frame = PacketFormat::Inbound.encode(229, b"xy");
        assert_eq!(read_masked_u16(&frame[0..2]), 229);
        assert_eq!(&frame[2..4], b"xy");
        assert_eq!(*frame.last().unwrap(), FRAME_TERMINATOR);
    }

    #[test]
    fn test_frame_round_trip_both_formats() {
        for format in [PacketFormat::Outbound, PacketFormat::Inbound] {
            let packet = Packet::new(1234, Bytes::from_static(b"hello"));
            let frame = packet.encode(format);
            let decoded = Packet::from_frame(format, &frame).unwrap();
            assert_eq!(decoded, packet);
        }
    }

    #[test]
    fn test_empty_body_round_trip() {
        for format in [PacketFormat::Outbound, PacketFormat::Inbound] {
            let packet = Packet::new(50, Bytes::new());
            let decoded = Packet::from_frame(format, &packet.encode(format)).unwrap();
            assert_eq!(decoded.id, 50);
            assert!(decoded.body.is_empty());
        }
    }

    #[test]
    fn test_inbound_id_bytes_never_collide_with_terminator() {
        // Masking keeps every id byte >= 0x40, so the terminator scan can
        // never fire inside the id, whatever the id value.
        for id in [0u16, 1, 64, 65, 4095] {
            let frame = PacketFormat::Inbound.encode(id, b"");
            assert!(frame[0] >= 0x40 && frame[1] >= 0x40);
            assert_eq!(
                frame.iter().position(|&b| b == FRAME_TERMINATOR),
                Some(frame.len() - 1)
            );
        }
    }

    fn feed_in_chunks(format: PacketFormat, frame: &[u8], chunk: usize) -> Vec<Bytes> {
        let mut buf = BytesMut::new();
        let mut scanned = 0usize;
        let mut frames = Vec::new();
        for piece in frame.chunks(chunk) {
            buf.extend_from_slice(piece);
            while let Some(extracted) = format.try_extract_frame(&mut buf, &mut scanned).unwrap() {
                frames.push(extracted);
            }
        }
        assert!(buf.is_empty(), "no bytes may be left over");
        frames
    }

    #[test]
    fn test_streaming_extraction_arbitrary_chunk_sizes() {
        for format in [PacketFormat::Outbound, PacketFormat::Inbound] {
            let a = format.encode(100, b"first body");
            let b = format.encode(200, b"");
            let c = format.encode(300, b"third");
            let mut stream = Vec::new();
            stream.extend_from_slice(&a);
            stream.extend_from_slice(&b);
            stream.extend_from_slice(&c);

            for chunk in [1, 2, 3, 7, stream.len()] {
                let frames = feed_in_chunks(format, &stream, chunk);
                assert_eq!(frames, vec![a.clone(), b.clone(), c.clone()]);
            }
        }
    }

    #[test]
    fn test_extract_leaves_buffer_unchanged_on_partial() {
        let frame = PacketFormat::Outbound.encode(77, b"payload");
        let mut buf = BytesMut::from(&frame[..frame.len() - 1]);
        let mut scanned = 0;
        let before = buf.clone();
        assert!(PacketFormat::Outbound
            .try_extract_frame(&mut buf, &mut scanned)
            .unwrap()
            .is_none());
        assert_eq!(buf, before);
    }

    #[test]
    fn test_extract_rejects_bad_marker() {
        let mut buf = BytesMut::from(&b"\x00\x41\x42"[..]);
        let mut scanned = 0;
        assert!(PacketFormat::Outbound
            .try_extract_frame(&mut buf, &mut scanned)
            .is_err());
    }

    #[test]
    fn test_inbound_scan_hint_advances() {
        let mut buf = BytesMut::from(&[0x41u8, 0x42, 0x43, 0x44][..]);
        let mut scanned = 0;
        assert!(PacketFormat::Inbound
            .try_extract_frame(&mut buf, &mut scanned)
            .unwrap()
            .is_none());
        assert_eq!(scanned, 4);
        buf.extend_from_slice(&[0x45, FRAME_TERMINATOR]);
        let frame = PacketFormat::Inbound
            .try_extract_frame(&mut buf, &mut scanned)
            .unwrap()
            .unwrap();
        assert_eq!(frame.len(), 6);
        assert_eq!(scanned, 0);
    }

    #[test]
    fn test_reader_writer_outbound_fields() {
        let frame = PacketWriter::new(PacketFormat::Outbound, 4002)
            .write_utf8("0a0b")
            .write_i32(-1337)
            .write_bool(true)
            .write_u16(512)
            .into_frame();

        let mut reader = PacketReader::new(PacketFormat::Outbound, &frame).unwrap();
        assert_eq!(reader.id(), 4002);
        assert_eq!(reader.read_utf8().unwrap(), "0a0b");
        assert_eq!(reader.read_i32().unwrap(), -1337);
        assert!(reader.read_bool().unwrap());
        assert_eq!(reader.read_u16().unwrap(), 512);
    }

    #[test]
    fn test_reader_writer_inbound_fields() {
        let frame = PacketWriter::new(PacketFormat::Inbound, 229)
            .write_utf8("motd")
            .write_i32(42)
            .into_frame();

        let mut reader = PacketReader::new(PacketFormat::Inbound, &frame).unwrap();
        assert_eq!(reader.id(), 229);
        assert_eq!(reader.read_utf8().unwrap(), "motd");
        assert_eq!(reader.read_i32().unwrap(), 42);
    }

    #[test]
    fn test_reader_rejects_overlong_string() {
        // Outbound string declaring more bytes than the body holds
        let mut body = BytesMut::new();
        put_masked_u16(&mut body, 100);
        body.put_slice(b"short");
        let frame = PacketFormat::Outbound.encode(1, &body);
        let mut reader = PacketReader::new(PacketFormat::Outbound, &frame).unwrap();
        assert!(reader.read_utf8().is_err());
    }

    #[test]
    fn test_reader_rejects_unterminated_inbound_string() {
        let frame = PacketFormat::Inbound.encode(1, b"no terminator here");
        let mut reader = PacketReader::new(PacketFormat::Inbound, &frame).unwrap();
        assert!(reader.read_utf8().is_err());
    }
}
