//! SSH-style binary encoding for channel-request payloads.
//!
//! Strings are a big-endian u32 byte length followed by the bytes, integers
//! are big-endian and fixed width, booleans are a single 0/1 byte. Decoding
//! is strict: truncated input, invalid text, non 0/1 booleans and trailing
//! bytes are errors.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Serializer for request payloads.
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: BytesMut,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_u32(&mut self, value: u32) -> &mut Self {
        self.buf.put_u32(value);
        self
    }

    pub fn write_u64(&mut self, value: u64) -> &mut Self {
        self.buf.put_u64(value);
        self
    }

    pub fn write_bool(&mut self, value: bool) -> &mut Self {
        self.buf.put_u8(u8::from(value));
        self
    }

    /// Write a length-prefixed UTF-8 string.
    pub fn write_string(&mut self, value: &str) -> Result<&mut Self> {
        self.write_bytes(value.as_bytes())
    }

    /// Write a length-prefixed ASCII protocol token.
    pub fn write_ascii(&mut self, value: &str) -> Result<&mut Self> {
        if !value.is_ascii() {
            return Err(Error::Wire {
                message: format!("token {value:?} is not ASCII"),
            });
        }
        self.write_bytes(value.as_bytes())
    }

    /// Write length-prefixed raw bytes.
    pub fn write_bytes(&mut self, value: &[u8]) -> Result<&mut Self> {
        self.buf.put_u32(length_prefix(value.len())?);
        self.buf.put_slice(value);
        Ok(self)
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Length prefixes are u32; anything longer cannot be framed.
fn length_prefix(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| Error::Wire {
        message: format!("field of {len} bytes exceeds the u32 length prefix"),
    })
}

/// Strict deserializer for request payloads.
#[derive(Debug)]
pub struct WireReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
        let remaining = self.data.len() - self.pos;
        if remaining < len {
            return Err(Error::Wire {
                message: format!(
                    "truncated {what}: need {len} bytes at offset {}, have {remaining}",
                    self.pos
                ),
            });
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let raw = self.take(4, "u32")?;
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let raw = self.take(8, "u64")?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(raw);
        Ok(u64::from_be_bytes(bytes))
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        match self.take(1, "bool")?[0] {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(Error::Wire {
                message: format!("invalid boolean byte {other:#04x}"),
            }),
        }
    }

    pub fn read_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u32()? as usize;
        self.take(len, "string")
    }

    pub fn read_string(&mut self) -> Result<String> {
        let raw = self.read_bytes()?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|e| Error::Wire {
                message: format!("invalid UTF-8 string: {e}"),
            })
    }

    pub fn read_ascii(&mut self) -> Result<String> {
        let raw = self.read_bytes()?;
        if !raw.is_ascii() {
            return Err(Error::Wire {
                message: "protocol token is not ASCII".to_string(),
            });
        }
        // ASCII is valid UTF-8.
        Ok(String::from_utf8_lossy(raw).into_owned())
    }

    /// Number of unread bytes.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Fail if unread bytes remain.
    pub fn finish(self) -> Result<()> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(Error::Wire {
                message: format!("{n} trailing bytes after payload"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_are_big_endian() {
        let mut w = WireWriter::new();
        w.write_u32(0x0102_0304).write_u64(5);
        let bytes = w.finish();
        assert_eq!(&bytes[..4], &[1, 2, 3, 4]);
        assert_eq!(&bytes[4..], &[0, 0, 0, 0, 0, 0, 0, 5]);
    }

    #[test]
    fn string_has_length_prefix() {
        let mut w = WireWriter::new();
        w.write_string("abc").unwrap();
        assert_eq!(&w.finish()[..], &[0, 0, 0, 3, b'a', b'b', b'c']);
    }

    #[test]
    fn length_prefix_bounds() {
        assert_eq!(length_prefix(0).unwrap(), 0);
        assert_eq!(length_prefix(u32::MAX as usize).unwrap(), u32::MAX);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn oversized_field_is_a_wire_error() {
        let err = length_prefix(u32::MAX as usize + 1).unwrap_err();
        assert!(matches!(err, Error::Wire { .. }));
    }

    #[test]
    fn truncated_string_fails() {
        let data = [0, 0, 0, 10, b'a'];
        let mut r = WireReader::new(&data);
        assert!(matches!(r.read_string(), Err(Error::Wire { .. })));
    }

    #[test]
    fn invalid_bool_fails() {
        let mut r = WireReader::new(&[2]);
        assert!(r.read_bool().is_err());
    }

    #[test]
    fn invalid_utf8_fails() {
        let data = [0, 0, 0, 2, 0xC3, 0x28];
        let mut r = WireReader::new(&data);
        assert!(r.read_string().is_err());
    }

    #[test]
    fn non_ascii_token_rejected_both_ways() {
        let mut w = WireWriter::new();
        assert!(w.write_ascii("pöwershell").is_err());

        let mut w = WireWriter::new();
        w.write_string("pöwershell").unwrap();
        let bytes = w.finish();
        assert!(WireReader::new(&bytes).read_ascii().is_err());
    }

    #[test]
    fn trailing_bytes_fail_finish() {
        let mut r = WireReader::new(&[1, 0xFF]);
        assert!(r.read_bool().unwrap());
        assert_eq!(r.remaining(), 1);
        assert!(r.finish().is_err());
    }
}
