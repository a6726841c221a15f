//! Protocol-level error kinds.
//!
//! Every variant here is raised while encoding or decoding wire data. The
//! stream is frame-aligned with no resynchronization markers, so the fatal
//! variants (`PayloadTooLarge`, `CrcMismatch`, `IncompatibleVersion`,
//! `UnknownType`) require the receiver to close the connection: once a frame
//! boundary is lost there is no way to find the next one.

use std::fmt;

/// Errors raised by the frame and message codecs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Declared payload length exceeds the fixed frame limit.
    PayloadTooLarge {
        /// Length the peer declared (or the caller supplied).
        len: u32,
        /// Maximum allowed payload length.
        max: u32,
    },
    /// A message payload ended before a complete field could be read.
    InsufficientData {
        /// Bytes the current field needed.
        needed: usize,
        /// Bytes that were actually available.
        available: usize,
    },
    /// A field was present but malformed (bad UTF-8, out-of-range value).
    DecodingFailed {
        /// What could not be decoded.
        reason: String,
    },
    /// Frame major version differs from ours.
    IncompatibleVersion {
        /// Version byte the peer sent.
        version: u8,
    },
    /// Recomputed CRC-32 does not match the trailing checksum.
    CrcMismatch {
        /// Checksum carried in the frame.
        expected: u32,
        /// Checksum computed over header and payload.
        actual: u32,
    },
    /// Message type byte is outside the closed set.
    UnknownType {
        /// Type byte the peer sent.
        value: u8,
    },
}

impl ProtocolError {
    /// Whether this error leaves the connection unable to recover the next
    /// frame boundary.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::PayloadTooLarge { .. }
                | ProtocolError::CrcMismatch { .. }
                | ProtocolError::IncompatibleVersion { .. }
                | ProtocolError::UnknownType { .. }
        )
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::PayloadTooLarge { len, max } => {
                write!(f, "payload length {} exceeds maximum {}", len, max)
            }
            ProtocolError::InsufficientData { needed, available } => {
                write!(
                    f,
                    "truncated payload: needed {} bytes, {} available",
                    needed, available
                )
            }
            ProtocolError::DecodingFailed { reason } => {
                write!(f, "decoding failed: {}", reason)
            }
            ProtocolError::IncompatibleVersion { version } => {
                write!(f, "incompatible protocol version {:#04x}", version)
            }
            ProtocolError::CrcMismatch { expected, actual } => {
                write!(
                    f,
                    "crc mismatch: frame says {:#010x}, computed {:#010x}",
                    expected, actual
                )
            }
            ProtocolError::UnknownType { value } => {
                write!(f, "unknown message type {:#04x}", value)
            }
        }
    }
}

impl std::error::Error for ProtocolError {}
