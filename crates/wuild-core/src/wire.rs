//! Big-endian wire codec.
//!
//! Every scalar on the wire is big-endian. Composite encodings:
//! `pstr` and `blob` are a `u32` length followed by raw bytes, `vec<T>`
//! is a `u32` count followed by the elements. Reads are non-destructive
//! until they succeed: a reader over an incomplete buffer reports
//! [`WireError::Truncated`] and the caller retries once more bytes
//! arrived.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Upper bound for a single length-prefixed field. Catches garbage length
/// prefixes before they turn into huge allocations.
pub const MAX_FIELD_LEN: usize = 256 * 1024 * 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("truncated input: need {needed} more bytes")]
    Truncated { needed: usize },

    #[error("field length {length} exceeds limit {limit}")]
    Oversize { length: usize, limit: usize },

    #[error("invalid utf-8 in string field")]
    InvalidUtf8,

    #[error("invalid value {value} for {field}")]
    InvalidValue { value: u64, field: &'static str },
}

/// Types that decode themselves from a [`WireReader`].
pub trait WireRead: Sized {
    fn wire_read(reader: &mut WireReader<'_>) -> Result<Self, WireError>;
}

/// Types that encode themselves into a [`WireWriter`].
pub trait WireWrite {
    fn wire_write(&self, writer: &mut WireWriter);
}

/// Cursor over a byte slice with big-endian accessors.
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        if self.remaining() < len {
            return Err(WireError::Truncated {
                needed: len - self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, WireError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i32(&mut self) -> Result<i32, WireError> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_u64(&mut self) -> Result<u64, WireError> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn read_i64(&mut self) -> Result<i64, WireError> {
        Ok(self.read_u64()? as i64)
    }

    fn read_len(&mut self) -> Result<usize, WireError> {
        let len = self.read_u32()? as usize;
        if len > MAX_FIELD_LEN {
            return Err(WireError::Oversize {
                length: len,
                limit: MAX_FIELD_LEN,
            });
        }
        Ok(len)
    }

    /// `pstr`: u32 length + raw utf-8 bytes.
    pub fn read_pstr(&mut self) -> Result<String, WireError> {
        let len = self.read_len()?;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| WireError::InvalidUtf8)
    }

    /// `blob`: u32 length + raw bytes.
    pub fn read_blob(&mut self) -> Result<Bytes, WireError> {
        let len = self.read_len()?;
        Ok(Bytes::copy_from_slice(self.take(len)?))
    }

    /// `vec<T>`: u32 count + elements.
    pub fn read_vec<T: WireRead>(&mut self) -> Result<Vec<T>, WireError> {
        let count = self.read_len()?;
        let mut out = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            out.push(T::wire_read(self)?);
        }
        Ok(out)
    }
}

/// Growable big-endian writer.
#[derive(Default)]
pub struct WireWriter {
    buf: BytesMut,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.put_u8(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buf.put_u16(value);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.put_u32(value);
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buf.put_i32(value);
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buf.put_u64(value);
    }

    pub fn write_i64(&mut self, value: i64) {
        self.buf.put_i64(value);
    }

    pub fn write_pstr(&mut self, value: &str) {
        self.buf.put_u32(value.len() as u32);
        self.buf.put_slice(value.as_bytes());
    }

    pub fn write_blob(&mut self, value: &[u8]) {
        self.buf.put_u32(value.len() as u32);
        self.buf.put_slice(value);
    }

    pub fn write_vec<T: WireWrite>(&mut self, values: &[T]) {
        self.buf.put_u32(values.len() as u32);
        for value in values {
            value.wire_write(self);
        }
    }
}

impl WireRead for String {
    fn wire_read(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        reader.read_pstr()
    }
}

impl WireWrite for String {
    fn wire_write(&self, writer: &mut WireWriter) {
        writer.write_pstr(self);
    }
}
