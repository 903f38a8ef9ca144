use bytes::{BufMut, BytesMut};

/// A growable output buffer. Every `write_*` call appends to the tail;
/// there is no fallible path because `BytesMut` grows on demand.
#[derive(Clone, Debug, Default)]
pub struct EncoderBuffer {
    bytes: BytesMut,
}

impl EncoderBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: BytesMut::with_capacity(capacity),
        }
    }

    pub fn write_u8(&mut self, value: u8) {
        self.bytes.put_u8(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.bytes.put_u16(value);
    }

    pub fn write_u32(&mut self, value: u32) {
        self.bytes.put_u32(value);
    }

    pub fn write_u64(&mut self, value: u64) {
        self.bytes.put_u64(value);
    }

    pub fn write_i64(&mut self, value: i64) {
        self.bytes.put_i64(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.write_u8(value as u8);
    }

    pub fn write_slice(&mut self, value: &[u8]) {
        self.bytes.put_slice(value);
    }

    /// Writes a `u8`-length-prefixed byte string. Panics if `value` is
    /// longer than 255 bytes; callers are expected to have validated field
    /// length limits (e.g. `endpoint_info <= 131`) before reaching the codec.
    pub fn write_u8_len_bytes(&mut self, value: &[u8]) {
        assert!(value.len() <= u8::MAX as usize);
        self.write_u8(value.len() as u8);
        self.write_slice(value);
    }

    pub fn write_u16_len_bytes(&mut self, value: &[u8]) {
        assert!(value.len() <= u16::MAX as usize);
        self.write_u16(value.len() as u16);
        self.write_slice(value);
    }

    pub fn write_u32_len_bytes(&mut self, value: &[u8]) {
        assert!(value.len() <= u32::MAX as usize);
        self.write_u32(value.len() as u32);
        self.write_slice(value);
    }

    pub fn write_u8_len_str(&mut self, value: &str) {
        self.write_u8_len_bytes(value.as_bytes());
    }

    pub fn write_u16_len_str(&mut self, value: &str) {
        self.write_u16_len_bytes(value.as_bytes());
    }

    pub fn freeze(self) -> bytes::Bytes {
        self.bytes.freeze()
    }

    pub fn into_inner(self) -> BytesMut {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Prefixes `body` with a big-endian `u32` length, matching the
/// `EndpointChannel` frame delimiting rule in spec §4.1.
pub fn frame_delimited(body: &[u8]) -> bytes::Bytes {
    let mut out = EncoderBuffer::with_capacity(4 + body.len());
    out.write_u32(body.len() as u32);
    out.write_slice(body);
    out.freeze()
}
