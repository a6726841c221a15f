//! Wire frame envelope: fixed header, length-prefixed payload, trailing CRC.
//!
//! Layout on the wire (all integers little-endian):
//!
//! ```text
//! +---------+--------------+-------+-------------+---------+-------+
//! | version | message_type | flags | payload_len | payload | crc32 |
//! |   u8    |      u8      |  u8   |     u32     |  bytes  |  u32  |
//! +---------+--------------+-------+-------------+---------+-------+
//! ```
//!
//! The checksum is CRC-32/IEEE over the 7 header bytes and the payload.
//! Frames arrive over a byte stream, so the decoder works against a rolling
//! buffer and reports when it needs more bytes; a frame is only consumed once
//! it is complete and its checksum verifies.

use bitflags::bitflags;
use bytes::{Buf, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::limits::MAX_FRAME_PAYLOAD;

/// Current protocol version: major in the high nibble, minor in the low.
pub const PROTOCOL_VERSION: u8 = 0x10;

/// Fixed header size preceding the payload.
pub const FRAME_HEADER_LEN: usize = 7;

/// Trailing checksum size.
pub const FRAME_CRC_LEN: usize = 4;

/// Major half of a version byte.
pub fn version_major(version: u8) -> u8 {
    version >> 4
}

/// Minor half of a version byte.
pub fn version_minor(version: u8) -> u8 {
    version & 0x0f
}

/// Message type byte. The set is closed: anything else on the wire is a
/// fatal decode error.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Client handshake carrying credentials and the requested subdomain.
    ConnectRequest = 0x01,
    /// Server reply to a successful handshake.
    ConnectResponse = 0x02,
    /// HTTP request forwarded from the gateway to the client.
    HttpRequest = 0x10,
    /// HTTP response returned by the client.
    HttpResponse = 0x11,
    /// Keep-alive probe.
    Ping = 0x20,
    /// Keep-alive reply.
    Pong = 0x21,
    /// Orderly teardown notice.
    Disconnect = 0x30,
    /// Protocol-level error report.
    Error = 0xff,
}

impl MessageType {
    /// Convert from a wire byte. Returns `None` for values outside the
    /// closed set.
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x01 => MessageType::ConnectRequest,
            0x02 => MessageType::ConnectResponse,
            0x10 => MessageType::HttpRequest,
            0x11 => MessageType::HttpResponse,
            0x20 => MessageType::Ping,
            0x21 => MessageType::Pong,
            0x30 => MessageType::Disconnect,
            0xff => MessageType::Error,
            _ => return None,
        })
    }

    /// Convert to the wire byte.
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        MessageType::from_u8(value).ok_or(ProtocolError::UnknownType { value })
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MessageType::ConnectRequest => "connect_request",
            MessageType::ConnectResponse => "connect_response",
            MessageType::HttpRequest => "http_request",
            MessageType::HttpResponse => "http_response",
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
            MessageType::Disconnect => "disconnect",
            MessageType::Error => "error",
        };
        write!(f, "{} ({:#04x})", name, self.as_u8())
    }
}

bitflags! {
    /// Per-frame flag bits.
    ///
    /// Only `REQUIRES_ACK` is acted upon (advisory, logged by receivers).
    /// `COMPRESSED` and `ENCRYPTED` are reserved and must round-trip
    /// unchanged.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct FrameFlags: u8 {
        const COMPRESSED = 0b0000_0001;
        const ENCRYPTED = 0b0000_0010;
        const REQUIRES_ACK = 0b0000_0100;
    }
}

/// A decoded frame: envelope fields plus the opaque payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Version byte as sent by the peer (ours when encoding).
    pub version: u8,
    /// Message type from the closed set.
    pub message_type: MessageType,
    /// Flag bits, including reserved ones, preserved verbatim.
    pub flags: FrameFlags,
    /// Opaque payload bytes.
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame at the current protocol version with no flags.
    pub fn new(message_type: MessageType, payload: impl Into<Bytes>) -> Self {
        Frame {
            version: PROTOCOL_VERSION,
            message_type,
            flags: FrameFlags::empty(),
            payload: payload.into(),
        }
    }

    /// Create a frame with explicit flags.
    pub fn with_flags(
        message_type: MessageType,
        flags: FrameFlags,
        payload: impl Into<Bytes>,
    ) -> Self {
        Frame {
            version: PROTOCOL_VERSION,
            message_type,
            flags,
            payload: payload.into(),
        }
    }

    /// Serialize this frame into wire bytes.
    ///
    /// Fails with `PayloadTooLarge` when the payload exceeds the frame
    /// limit; every other input encodes.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let len = self.payload.len();
        if len > MAX_FRAME_PAYLOAD as usize {
            return Err(ProtocolError::PayloadTooLarge {
                len: len.min(u32::MAX as usize) as u32,
                max: MAX_FRAME_PAYLOAD,
            });
        }

        let mut out = Vec::with_capacity(FRAME_HEADER_LEN + len + FRAME_CRC_LEN);
        out.push(self.version);
        out.push(self.message_type.as_u8());
        out.push(self.flags.bits());
        out.extend_from_slice(&(len as u32).to_le_bytes());
        out.extend_from_slice(&self.payload);

        let crc = crc32fast::hash(&out);
        out.extend_from_slice(&crc.to_le_bytes());
        Ok(out)
    }
}

/// Streaming frame decoder.
///
/// Call [`FrameDecoder::decode`] against a rolling inbound buffer after each
/// socket read. `Ok(None)` means more bytes are needed; `Ok(Some(frame))`
/// consumes exactly one frame; `Err` is fatal and the connection must be
/// closed (see [`ProtocolError::is_fatal`]).
#[derive(Clone, Debug)]
pub struct FrameDecoder {
    max_payload: u32,
}

impl FrameDecoder {
    /// Decoder with the protocol-default payload limit.
    pub fn new() -> Self {
        FrameDecoder {
            max_payload: MAX_FRAME_PAYLOAD,
        }
    }

    /// Decoder with a tighter payload limit (tests, constrained peers).
    /// The limit is clamped to the protocol maximum.
    pub fn with_max_payload(max_payload: u32) -> Self {
        FrameDecoder {
            max_payload: max_payload.min(MAX_FRAME_PAYLOAD),
        }
    }

    /// Attempt to decode one frame from the front of `buf`.
    ///
    /// The declared length is validated before the payload is read or any
    /// buffer is grown, so an oversize declaration never triggers an
    /// allocation. On fatal errors the buffer is left untouched; the caller
    /// is expected to drop the connection, not to retry.
    pub fn decode(&self, buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        if buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let payload_len = u32::from_le_bytes([buf[3], buf[4], buf[5], buf[6]]);
        if payload_len > self.max_payload {
            return Err(ProtocolError::PayloadTooLarge {
                len: payload_len,
                max: self.max_payload,
            });
        }

        let frame_len = FRAME_HEADER_LEN + payload_len as usize + FRAME_CRC_LEN;
        if buf.len() < frame_len {
            return Ok(None);
        }

        let mut frame = buf.split_to(frame_len);
        let crc_actual = crc32fast::hash(&frame[..FRAME_HEADER_LEN + payload_len as usize]);
        let crc_start = FRAME_HEADER_LEN + payload_len as usize;
        let crc_expected = u32::from_le_bytes([
            frame[crc_start],
            frame[crc_start + 1],
            frame[crc_start + 2],
            frame[crc_start + 3],
        ]);
        if crc_actual != crc_expected {
            return Err(ProtocolError::CrcMismatch {
                expected: crc_expected,
                actual: crc_actual,
            });
        }

        let version = frame[0];
        if version_major(version) != version_major(PROTOCOL_VERSION) {
            return Err(ProtocolError::IncompatibleVersion { version });
        }

        let message_type = MessageType::try_from(frame[1])?;
        let flags = FrameFlags::from_bits_retain(frame[2]);

        frame.advance(FRAME_HEADER_LEN);
        frame.truncate(payload_len as usize);

        Ok(Some(Frame {
            version,
            message_type,
            flags,
            payload: frame.freeze(),
        }))
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8]) -> Result<Option<Frame>, ProtocolError> {
        let mut buf = BytesMut::from(bytes);
        FrameDecoder::new().decode(&mut buf)
    }

    #[test]
    fn message_type_roundtrip() {
        let types = [
            MessageType::ConnectRequest,
            MessageType::ConnectResponse,
            MessageType::HttpRequest,
            MessageType::HttpResponse,
            MessageType::Ping,
            MessageType::Pong,
            MessageType::Disconnect,
            MessageType::Error,
        ];
        for &ty in &types {
            assert_eq!(MessageType::from_u8(ty.as_u8()), Some(ty));
        }
    }

    #[test]
    fn message_type_values_are_stable() {
        assert_eq!(MessageType::ConnectRequest.as_u8(), 0x01);
        assert_eq!(MessageType::ConnectResponse.as_u8(), 0x02);
        assert_eq!(MessageType::HttpRequest.as_u8(), 0x10);
        assert_eq!(MessageType::HttpResponse.as_u8(), 0x11);
        assert_eq!(MessageType::Ping.as_u8(), 0x20);
        assert_eq!(MessageType::Pong.as_u8(), 0x21);
        assert_eq!(MessageType::Disconnect.as_u8(), 0x30);
        assert_eq!(MessageType::Error.as_u8(), 0xff);
    }

    #[test]
    fn message_type_rejects_unknown() {
        assert_eq!(MessageType::from_u8(0x03), None);
        assert_eq!(MessageType::from_u8(0x7f), None);
        assert_eq!(
            MessageType::try_from(0x7f),
            Err(ProtocolError::UnknownType { value: 0x7f })
        );
    }

    #[test]
    fn version_nibbles() {
        assert_eq!(version_major(0x10), 1);
        assert_eq!(version_minor(0x10), 0);
        assert_eq!(version_major(0x23), 2);
        assert_eq!(version_minor(0x23), 3);
    }

    #[test]
    fn encode_decode_roundtrip() {
        let frame = Frame::new(MessageType::Ping, vec![1u8, 2, 3, 4]);
        let bytes = frame.encode().unwrap();
        let decoded = decode_all(&bytes).unwrap().unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn empty_payload_roundtrip() {
        let frame = Frame::new(MessageType::Disconnect, Vec::new());
        let bytes = frame.encode().unwrap();
        assert_eq!(bytes.len(), FRAME_HEADER_LEN + FRAME_CRC_LEN);
        let decoded = decode_all(&bytes).unwrap().unwrap();
        assert_eq!(decoded.payload.len(), 0);
    }

    #[test]
    fn reserved_flags_roundtrip_unchanged() {
        let flags = FrameFlags::COMPRESSED | FrameFlags::ENCRYPTED | FrameFlags::REQUIRES_ACK;
        let frame = Frame::with_flags(MessageType::Ping, flags, vec![9u8]);
        let bytes = frame.encode().unwrap();
        let decoded = decode_all(&bytes).unwrap().unwrap();
        assert_eq!(decoded.flags, flags);
    }

    #[test]
    fn unknown_flag_bits_are_preserved() {
        let frame = Frame::new(MessageType::Ping, vec![1u8]);
        let mut bytes = frame.encode().unwrap();
        // Set a reserved high bit and fix up the checksum.
        bytes[2] = 0b1000_0000;
        let crc_end = bytes.len() - FRAME_CRC_LEN;
        let crc = crc32fast::hash(&bytes[..crc_end]);
        bytes[crc_end..].copy_from_slice(&crc.to_le_bytes());

        let decoded = decode_all(&bytes).unwrap().unwrap();
        assert_eq!(decoded.flags.bits(), 0b1000_0000);
    }

    #[test]
    fn needs_more_for_partial_header() {
        let mut buf = BytesMut::from(&[PROTOCOL_VERSION, 0x20, 0x00][..]);
        let result = FrameDecoder::new().decode(&mut buf).unwrap();
        assert!(result.is_none());
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn needs_more_for_partial_payload() {
        let frame = Frame::new(MessageType::Ping, vec![0u8; 64]);
        let bytes = frame.encode().unwrap();

        let decoder = FrameDecoder::new();
        let mut buf = BytesMut::new();
        for chunk in bytes.chunks(7) {
            buf.extend_from_slice(chunk);
            if buf.len() < bytes.len() {
                assert!(decoder.decode(&mut buf).unwrap().is_none());
            }
        }
        let decoded = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn two_frames_in_one_buffer() {
        let a = Frame::new(MessageType::Ping, vec![1u8]);
        let b = Frame::new(MessageType::Pong, vec![2u8, 3]);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&a.encode().unwrap());
        buf.extend_from_slice(&b.encode().unwrap());

        let decoder = FrameDecoder::new();
        assert_eq!(decoder.decode(&mut buf).unwrap().unwrap(), a);
        assert_eq!(decoder.decode(&mut buf).unwrap().unwrap(), b);
        assert!(decoder.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn encode_rejects_oversize_payload() {
        let frame = Frame::new(
            MessageType::HttpRequest,
            vec![0u8; MAX_FRAME_PAYLOAD as usize + 1],
        );
        assert_eq!(
            frame.encode(),
            Err(ProtocolError::PayloadTooLarge {
                len: MAX_FRAME_PAYLOAD + 1,
                max: MAX_FRAME_PAYLOAD,
            })
        );
    }

    #[test]
    fn payload_at_limit_encodes() {
        // Use a tiny decoder limit so the test does not allocate 10 MiB.
        let decoder = FrameDecoder::with_max_payload(1024);
        let frame = Frame::new(MessageType::HttpRequest, vec![0u8; 1024]);
        let mut buf = BytesMut::from(&frame.encode().unwrap()[..]);
        assert!(decoder.decode(&mut buf).unwrap().is_some());
    }

    #[test]
    fn oversize_declaration_rejected_before_payload_arrives() {
        // Header declaring 10 MiB + 1; no payload bytes follow.
        let mut header = vec![PROTOCOL_VERSION, MessageType::Ping.as_u8(), 0x00];
        header.extend_from_slice(&0x00a0_0001u32.to_le_bytes());
        let mut buf = BytesMut::from(&header[..]);

        let err = FrameDecoder::new().decode(&mut buf).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::PayloadTooLarge {
                len: 10 * 1024 * 1024 + 1,
                max: MAX_FRAME_PAYLOAD,
            }
        );
        // Nothing was consumed: the connection is dropped, not resumed.
        assert_eq!(buf.len(), FRAME_HEADER_LEN);
    }

    #[test]
    fn crc_mismatch_is_fatal() {
        let frame = Frame::new(MessageType::Ping, vec![1u8, 2, 3]);
        let mut bytes = frame.encode().unwrap();
        let idx = FRAME_HEADER_LEN + 1;
        bytes[idx] ^= 0xff;

        let err = decode_all(&bytes).unwrap_err();
        assert!(matches!(err, ProtocolError::CrcMismatch { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn any_single_flipped_bit_is_detected() {
        let frame = Frame::new(MessageType::HttpResponse, vec![0xabu8; 16]);
        let bytes = frame.encode().unwrap();

        for byte_idx in 0..bytes.len() {
            for bit in 0..8u8 {
                let mut mutated = bytes.clone();
                mutated[byte_idx] ^= 1 << bit;
                let result = decode_all(&mutated);
                match result {
                    Err(_) => {}
                    Ok(Some(decoded)) => {
                        // A flipped bit inside the length field can shrink
                        // the frame so a prefix still checksums; the decoded
                        // frame must never silently equal the original.
                        assert_ne!(decoded, frame, "byte {} bit {}", byte_idx, bit);
                    }
                    Ok(None) => {
                        // Length grew: decoder is still waiting for bytes.
                    }
                }
            }
        }
    }

    #[test]
    fn wrong_major_version_rejected() {
        let frame = Frame::new(MessageType::Ping, vec![]);
        let mut bytes = frame.encode().unwrap();
        bytes[0] = 0x20;
        let crc_end = bytes.len() - FRAME_CRC_LEN;
        let crc = crc32fast::hash(&bytes[..crc_end]);
        bytes[crc_end..].copy_from_slice(&crc.to_le_bytes());

        assert_eq!(
            decode_all(&bytes).unwrap_err(),
            ProtocolError::IncompatibleVersion { version: 0x20 }
        );
    }

    #[test]
    fn different_minor_version_accepted() {
        let frame = Frame::new(MessageType::Ping, vec![]);
        let mut bytes = frame.encode().unwrap();
        bytes[0] = 0x11;
        let crc_end = bytes.len() - FRAME_CRC_LEN;
        let crc = crc32fast::hash(&bytes[..crc_end]);
        bytes[crc_end..].copy_from_slice(&crc.to_le_bytes());

        let decoded = decode_all(&bytes).unwrap().unwrap();
        assert_eq!(decoded.version, 0x11);
    }

    #[test]
    fn unknown_type_rejected_after_crc_passes() {
        let frame = Frame::new(MessageType::Ping, vec![]);
        let mut bytes = frame.encode().unwrap();
        bytes[1] = 0x42;
        let crc_end = bytes.len() - FRAME_CRC_LEN;
        let crc = crc32fast::hash(&bytes[..crc_end]);
        bytes[crc_end..].copy_from_slice(&crc.to_le_bytes());

        assert_eq!(
            decode_all(&bytes).unwrap_err(),
            ProtocolError::UnknownType { value: 0x42 }
        );
    }
}
