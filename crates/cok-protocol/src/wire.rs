//! Primitive little-endian readers and writers for message payloads.
//!
//! Every message body is a flat sequence of these primitives: fixed-width
//! integers, length-prefixed strings and byte blobs, 16-byte raw uuids, and
//! millisecond timestamps. The reader checks availability before every read;
//! a payload that ends mid-field is a [`ProtocolError::InsufficientData`].
//! Trailing bytes after the last field are left for the caller to ignore.

use uuid::Uuid;

use crate::error::ProtocolError;

/// Sequential writer producing a message payload.
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    /// Empty writer.
    pub fn new() -> Self {
        WireWriter { buf: Vec::new() }
    }

    /// Writer with a capacity hint for bodies of known size.
    pub fn with_capacity(capacity: usize) -> Self {
        WireWriter {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Finish and take the encoded bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn put_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// u32 byte length followed by UTF-8 bytes.
    pub fn put_string(&mut self, value: &str) {
        self.put_u32(value.len() as u32);
        self.buf.extend_from_slice(value.as_bytes());
    }

    /// One presence byte, then the string when present.
    pub fn put_opt_string(&mut self, value: Option<&str>) {
        match value {
            Some(s) => {
                self.put_u8(0x01);
                self.put_string(s);
            }
            None => self.put_u8(0x00),
        }
    }

    /// u32 byte length followed by raw bytes.
    pub fn put_bytes(&mut self, value: &[u8]) {
        self.put_u32(value.len() as u32);
        self.buf.extend_from_slice(value);
    }

    /// 16 raw bytes in the uuid's canonical byte order.
    pub fn put_uuid(&mut self, value: &Uuid) {
        self.buf.extend_from_slice(value.as_bytes());
    }

    /// Milliseconds since the Unix epoch.
    pub fn put_date_ms(&mut self, millis: u64) {
        self.put_u64(millis);
    }

    /// u32 pair count followed by (string, string) pairs.
    pub fn put_string_pairs(&mut self, pairs: &[(String, String)]) {
        self.put_u32(pairs.len() as u32);
        for (name, value) in pairs {
            self.put_string(name);
            self.put_string(value);
        }
    }
}

/// Sequential reader over a message payload.
#[derive(Debug)]
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        WireReader { buf, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        if self.remaining() < len {
            return Err(ProtocolError::InsufficientData {
                needed: len,
                available: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, ProtocolError> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn u32(&mut self) -> Result<u32, ProtocolError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn u64(&mut self) -> Result<u64, ProtocolError> {
        let bytes = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(arr))
    }

    /// Length-prefixed UTF-8 string.
    pub fn string(&mut self) -> Result<String, ProtocolError> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::DecodingFailed {
            reason: "string field is not valid UTF-8".to_string(),
        })
    }

    /// Presence byte, then a string when present. Any presence value other
    /// than 0x00/0x01 is malformed.
    pub fn opt_string(&mut self) -> Result<Option<String>, ProtocolError> {
        match self.u8()? {
            0x00 => Ok(None),
            0x01 => Ok(Some(self.string()?)),
            other => Err(ProtocolError::DecodingFailed {
                reason: format!("invalid presence byte {:#04x}", other),
            }),
        }
    }

    /// Length-prefixed raw bytes.
    pub fn bytes(&mut self) -> Result<Vec<u8>, ProtocolError> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    /// 16 raw bytes as a uuid.
    pub fn uuid(&mut self) -> Result<Uuid, ProtocolError> {
        let bytes = self.take(16)?;
        let mut arr = [0u8; 16];
        arr.copy_from_slice(bytes);
        Ok(Uuid::from_bytes(arr))
    }

    /// Milliseconds since the Unix epoch.
    pub fn date_ms(&mut self) -> Result<u64, ProtocolError> {
        self.u64()
    }

    /// u32 pair count followed by (string, string) pairs.
    ///
    /// The count is sanity-checked against the bytes actually available
    /// (each pair needs at least two length prefixes) so a hostile count
    /// cannot drive a huge up-front allocation.
    pub fn string_pairs(&mut self) -> Result<Vec<(String, String)>, ProtocolError> {
        let count = self.u32()? as usize;
        let min_needed = count.saturating_mul(8);
        if min_needed > self.remaining() {
            return Err(ProtocolError::InsufficientData {
                needed: min_needed,
                available: self.remaining(),
            });
        }
        let mut pairs = Vec::with_capacity(count);
        for _ in 0..count {
            let name = self.string()?;
            let value = self.string()?;
            pairs.push((name, value));
        }
        Ok(pairs)
    }

    /// u32 count followed by that many strings.
    pub fn string_array(&mut self) -> Result<Vec<String>, ProtocolError> {
        let count = self.u32()? as usize;
        let min_needed = count.saturating_mul(4);
        if min_needed > self.remaining() {
            return Err(ProtocolError::InsufficientData {
                needed: min_needed,
                available: self.remaining(),
            });
        }
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(self.string()?);
        }
        Ok(items)
    }
}
