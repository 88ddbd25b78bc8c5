//! Positional binary codec
//!
//! Values are concatenated in write order with no padding. `i32` and `f32`
//! take 4 bytes, `bool` takes 1 byte and strings are an `i32` byte count
//! followed by UTF-8 bytes. Everything is little-endian.
//!
//! Messages are not self-describing: writer and reader agree on the field
//! list by convention.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{LinkError, Result};
use crate::types::{Quat, Vec3};

/// Largest length an `i32` prefix can describe
pub const MAX_FIELD_LEN: usize = i32::MAX as usize;

/// Accumulates typed values into a contiguous byte buffer
///
/// A length that does not fit its `i32` prefix is not written. The writer
/// remembers it and [`Writer::finish`] fails.
#[derive(Debug, Default, Clone)]
pub struct Writer {
    buf: Vec<u8>,
    overflow: Option<usize>,
}

impl Writer {
    /// Create an empty writer
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a 4-byte signed integer
    pub fn write_i32(&mut self, value: i32) -> &mut Self {
        let mut bytes = [0u8; 4];
        LittleEndian::write_i32(&mut bytes, value);
        self.buf.extend_from_slice(&bytes);
        self
    }

    /// Append a 4-byte float
    pub fn write_f32(&mut self, value: f32) -> &mut Self {
        let mut bytes = [0u8; 4];
        LittleEndian::write_f32(&mut bytes, value);
        self.buf.extend_from_slice(&bytes);
        self
    }

    /// Append a boolean as a single byte
    pub fn write_bool(&mut self, value: bool) -> &mut Self {
        self.buf.push(u8::from(value));
        self
    }

    /// Append a byte count or element count as an `i32`
    pub fn write_len(&mut self, len: usize) -> &mut Self {
        match i32::try_from(len) {
            Ok(prefix) => self.write_i32(prefix),
            Err(_) => {
                self.overflow.get_or_insert(len);
                self
            }
        }
    }

    /// Append a length-prefixed UTF-8 string
    pub fn write_str(&mut self, value: &str) -> &mut Self {
        if i32::try_from(value.len()).is_err() {
            self.overflow.get_or_insert(value.len());
            return self;
        }
        self.write_len(value.len());
        self.buf.extend_from_slice(value.as_bytes());
        self
    }

    /// Append three floats
    pub fn write_vec3(&mut self, value: Vec3) -> &mut Self {
        self.write_f32(value.x).write_f32(value.y).write_f32(value.z)
    }

    /// Append four floats
    pub fn write_quat(&mut self, value: Quat) -> &mut Self {
        self.write_f32(value.x)
            .write_f32(value.y)
            .write_f32(value.z)
            .write_f32(value.w)
    }

    /// Append raw bytes without a prefix
    pub fn write_raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    /// Number of bytes written so far
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Borrow the accumulated bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Whether a length did not fit its prefix
    pub fn overflowed(&self) -> bool {
        self.overflow.is_some()
    }

    /// Consume the writer and return the buffer
    pub fn finish(self) -> Result<Vec<u8>> {
        match self.overflow {
            Some(len) => Err(LinkError::FrameTooLarge {
                len,
                max: MAX_FIELD_LEN,
            }),
            None => Ok(self.buf),
        }
    }
}

/// Reads values back in the order they were written
///
/// Every read returns `None` on failure and clears the success flag. Once
/// cleared the flag stays cleared and all later reads fail, even if bytes
/// remain.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    success: bool,
}

impl<'a> Reader<'a> {
    /// Create a reader positioned at the start of `buf`
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            success: true,
        }
    }

    /// Whether every read so far succeeded
    pub fn success(&self) -> bool {
        self.success
    }

    /// Cursor position in bytes
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left after the cursor
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn fail<T>(&mut self) -> Option<T> {
        self.success = false;
        None
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if !self.success {
            return None;
        }
        if self.remaining() < n {
            return self.fail();
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Some(slice)
    }

    /// Read a 4-byte signed integer
    pub fn read_i32(&mut self) -> Option<i32> {
        self.take(4).map(LittleEndian::read_i32)
    }

    /// Read a 4-byte float
    pub fn read_f32(&mut self) -> Option<f32> {
        self.take(4).map(LittleEndian::read_f32)
    }

    /// Read a single-byte boolean (any non-zero byte is true)
    pub fn read_bool(&mut self) -> Option<bool> {
        self.take(1).map(|b| b[0] != 0)
    }

    /// Read a length-prefixed UTF-8 string
    pub fn read_string(&mut self) -> Option<String> {
        if !self.success {
            return None;
        }
        let start = self.pos;
        let len = self.read_i32()?;
        let Ok(len) = usize::try_from(len) else {
            self.pos = start;
            return self.fail();
        };
        if self.remaining() < len {
            self.pos = start;
            return self.fail();
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        match std::str::from_utf8(bytes) {
            Ok(s) => {
                self.pos += len;
                Some(s.to_owned())
            }
            Err(_) => {
                self.pos = start;
                self.fail()
            }
        }
    }

    /// Read three floats
    pub fn read_vec3(&mut self) -> Option<Vec3> {
        Some(Vec3::new(self.read_f32()?, self.read_f32()?, self.read_f32()?))
    }

    /// Read four floats
    pub fn read_quat(&mut self) -> Option<Quat> {
        Some(Quat::new(
            self.read_f32()?,
            self.read_f32()?,
            self.read_f32()?,
            self.read_f32()?,
        ))
    }

    /// Take every remaining byte
    pub fn read_rest(&mut self) -> Option<&'a [u8]> {
        let n = self.remaining();
        self.take(n)
    }
}
