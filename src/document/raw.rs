//! Little-endian byte reading and writing shared by the document codec and message framing.

use crate::error::{MongoError, Result};

/// Bounds-checked reader over a byte slice.
#[derive(Debug, Clone)]
pub(crate) struct ByteReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    pub(crate) fn position(&self) -> usize {
        self.position
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// The unread tail of the input.
    pub(crate) fn rest(&self) -> &'a [u8] {
        &self.data[self.position..]
    }

    pub(crate) fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(MongoError::corrupt(format!(
                "expected {} bytes at offset {}, only {} available",
                len,
                self.position,
                self.remaining()
            )));
        }
        let bytes = &self.data[self.position..self.position + len];
        self.position += len;
        Ok(bytes)
    }

    pub(crate) fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    pub(crate) fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub(crate) fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.read_array()?))
    }

    pub(crate) fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.read_array()?))
    }

    /// Peek the next little-endian i32 without consuming it.
    pub(crate) fn peek_i32(&self) -> Result<i32> {
        self.clone().read_i32()
    }

    /// Read a non-negative i32 length field.
    pub(crate) fn read_length(&mut self) -> Result<usize> {
        let length = self.read_i32()?;
        usize::try_from(length)
            .map_err(|_| MongoError::corrupt(format!("negative length {}", length)))
    }

    /// Read a null-terminated UTF-8 string.
    pub(crate) fn read_cstring(&mut self) -> Result<&'a str> {
        let rest = self.rest();
        let end = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| MongoError::corrupt("unterminated C string"))?;
        let s = std::str::from_utf8(&rest[..end])
            .map_err(|e| MongoError::corrupt(format!("invalid UTF-8 in C string: {}", e)))?;
        self.position += end + 1;
        Ok(s)
    }

    /// Read an int32 length-prefixed, null-terminated UTF-8 string.
    pub(crate) fn read_string(&mut self) -> Result<&'a str> {
        let length = self.read_length()?;
        if length == 0 {
            return Err(MongoError::corrupt("string length must include the terminator"));
        }
        let bytes = self.read_bytes(length)?;
        if bytes[length - 1] != 0 {
            return Err(MongoError::corrupt("string is not null-terminated"));
        }
        std::str::from_utf8(&bytes[..length - 1])
            .map_err(|e| MongoError::corrupt(format!("invalid UTF-8 in string: {}", e)))
    }
}

pub(crate) fn write_i32(buf: &mut Vec<u8>, value: i32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub(crate) fn write_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub(crate) fn write_i64(buf: &mut Vec<u8>, value: i64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

/// Write a null-terminated string. Fails if the string itself contains a NUL.
pub(crate) fn write_cstring(buf: &mut Vec<u8>, value: &str) -> Result<()> {
    if value.as_bytes().contains(&0) {
        return Err(MongoError::InvalidKey(format!(
            "C string {:?} contains a null byte",
            value
        )));
    }
    buf.extend_from_slice(value.as_bytes());
    buf.push(0);
    Ok(())
}

/// Write an int32 length-prefixed, null-terminated string.
pub(crate) fn write_string(buf: &mut Vec<u8>, value: &str) -> Result<()> {
    let length = checked_length(value.len() + 1)?;
    write_i32(buf, length);
    buf.extend_from_slice(value.as_bytes());
    buf.push(0);
    Ok(())
}

/// Reserve four bytes for a length prefix, returning its offset.
pub(crate) fn reserve_length(buf: &mut Vec<u8>) -> usize {
    let offset = buf.len();
    buf.extend_from_slice(&[0; 4]);
    offset
}

/// Fill a reserved length prefix with the number of bytes written since it.
pub(crate) fn patch_length(buf: &mut [u8], offset: usize) -> Result<()> {
    let length = checked_length(buf.len() - offset)?;
    buf[offset..offset + 4].copy_from_slice(&length.to_le_bytes());
    Ok(())
}

pub(crate) fn checked_length(len: usize) -> Result<i32> {
    i32::try_from(len)
        .map_err(|_| MongoError::IntegerRange(format!("length {} does not fit in an int32", len)))
}
