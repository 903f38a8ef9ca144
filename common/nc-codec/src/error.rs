/// Errors produced while parsing a frame or an advertisement payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum DecoderError {
    #[error("unexpected end of buffer: wanted {wanted} bytes, had {available}")]
    UnexpectedEof { wanted: usize, available: usize },

    #[error("buffer had {extra} trailing bytes after decoding")]
    TrailingBytes { extra: usize },

    #[error("unrecognized frame type tag {0}")]
    UnknownFrameType(u8),

    #[error("unrecognized enum tag {tag} for {field}")]
    UnknownEnumValue { field: &'static str, tag: u32 },

    #[error("unsupported wire version {0}")]
    UnsupportedVersion(u8),

    #[error("field {field} exceeded its maximum length of {max} bytes")]
    FieldTooLong { field: &'static str, max: usize },

    #[error("invalid UTF-8 in field {0}")]
    InvalidUtf8(&'static str),

    #[error("invalid base64 in field {0}")]
    InvalidBase64(&'static str),
}
