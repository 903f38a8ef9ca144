use crate::error::DecoderError;
use byteorder::{BigEndian, ByteOrder};

/// A cursor over an immutable byte slice: every `decode_*` call consumes a
/// prefix of the buffer and returns the remainder, so callers chain decodes
/// instead of tracking an offset by hand.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecoderBuffer<'a> {
    bytes: &'a [u8],
}

impl<'a> DecoderBuffer<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn into_less_safe_slice(self) -> &'a [u8] {
        self.bytes
    }

    /// Fails unless the buffer has been fully consumed.
    pub fn ensure_empty(self) -> Result<(), DecoderError> {
        if self.bytes.is_empty() {
            Ok(())
        } else {
            Err(DecoderError::TrailingBytes {
                extra: self.bytes.len(),
            })
        }
    }

    fn ensure_len(&self, count: usize) -> Result<(), DecoderError> {
        if self.bytes.len() < count {
            Err(DecoderError::UnexpectedEof {
                wanted: count,
                available: self.bytes.len(),
            })
        } else {
            Ok(())
        }
    }

    pub fn decode_slice(self, count: usize) -> Result<(&'a [u8], Self), DecoderError> {
        self.ensure_len(count)?;
        let (head, tail) = self.bytes.split_at(count);
        Ok((head, Self::new(tail)))
    }

    pub fn decode_u8(self) -> Result<(u8, Self), DecoderError> {
        let (slice, rest) = self.decode_slice(1)?;
        Ok((slice[0], rest))
    }

    pub fn decode_u16(self) -> Result<(u16, Self), DecoderError> {
        let (slice, rest) = self.decode_slice(2)?;
        Ok((BigEndian::read_u16(slice), rest))
    }

    pub fn decode_u32(self) -> Result<(u32, Self), DecoderError> {
        let (slice, rest) = self.decode_slice(4)?;
        Ok((BigEndian::read_u32(slice), rest))
    }

    pub fn decode_u64(self) -> Result<(u64, Self), DecoderError> {
        let (slice, rest) = self.decode_slice(8)?;
        Ok((BigEndian::read_u64(slice), rest))
    }

    pub fn decode_i64(self) -> Result<(i64, Self), DecoderError> {
        let (slice, rest) = self.decode_slice(8)?;
        Ok((BigEndian::read_i64(slice), rest))
    }

    pub fn decode_bool(self) -> Result<(bool, Self), DecoderError> {
        let (value, rest) = self.decode_u8()?;
        Ok((value != 0, rest))
    }

    /// Decodes a `u8`-length-prefixed byte string, the encoding used
    /// throughout §6.1/§6.2 for `endpoint_id`-sized and `endpoint_info`-sized
    /// fields.
    pub fn decode_u8_len_bytes(self) -> Result<(&'a [u8], Self), DecoderError> {
        let (len, rest) = self.decode_u8()?;
        rest.decode_slice(len as usize)
    }

    /// Decodes a `u16`-length-prefixed byte string, used for frame-level
    /// fields that may exceed 255 bytes (e.g. a payload chunk body).
    pub fn decode_u16_len_bytes(self) -> Result<(&'a [u8], Self), DecoderError> {
        let (len, rest) = self.decode_u16()?;
        rest.decode_slice(len as usize)
    }

    /// Decodes a `u32`-length-prefixed byte string.
    pub fn decode_u32_len_bytes(self) -> Result<(&'a [u8], Self), DecoderError> {
        let (len, rest) = self.decode_u32()?;
        rest.decode_slice(len as usize)
    }

    pub fn decode_u8_len_utf8(self, field: &'static str) -> Result<(&'a str, Self), DecoderError> {
        let (slice, rest) = self.decode_u8_len_bytes()?;
        let value = core::str::from_utf8(slice).map_err(|_| DecoderError::InvalidUtf8(field))?;
        Ok((value, rest))
    }

    pub fn decode_u16_len_utf8(
        self,
        field: &'static str,
    ) -> Result<(&'a str, Self), DecoderError> {
        let (slice, rest) = self.decode_u16_len_bytes()?;
        let value = core::str::from_utf8(slice).map_err(|_| DecoderError::InvalidUtf8(field))?;
        Ok((value, rest))
    }
}
