//! Error types for the protocol layer.
//!
//! Two enums live here. [`CodecError`] covers the field codec that turns
//! application messages into payload text and back; it is what callers
//! see when a payload is malformed or names a type nobody registered.
//! [`ProtocolError`] covers everything above that: envelope records,
//! fragments, and protocol-level validation.

use std::fmt;

/// Errors produced while encoding or decoding a message payload.
///
/// Decoding fails closed: any of these means the payload is rejected as a
/// whole, never partially applied.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// No decoder is registered for this type name.
    #[error("unknown message type: {0}")]
    UnknownType(String),

    /// The envelope carries a different type than the one requested.
    #[error("envelope carries {found}, expected {expected}")]
    TypeMismatch { expected: String, found: String },

    /// The payload ended before a value was complete.
    #[error("payload truncated: needed {needed} bytes, {remaining} left")]
    Truncated { needed: usize, remaining: usize },

    /// A field starts with a tag byte the codec doesn't know.
    #[error("unknown field tag 0x{0:02x}")]
    InvalidTag(u8),

    /// A field's tag doesn't match the type the message declares.
    #[error("expected {expected} field, found tag 0x{found:02x}")]
    UnexpectedTag { expected: &'static str, found: u8 },

    /// The payload has a different number of fields than the message type.
    #[error("message declares {expected} fields, payload has {found}")]
    FieldCount { expected: usize, found: usize },

    /// Bytes remain after the last field.
    #[error("{0} trailing bytes after last field")]
    TrailingBytes(usize),

    /// A boolean byte other than 0 or 1.
    #[error("invalid boolean byte 0x{0:02x}")]
    InvalidBool(u8),

    /// A char field holding something that isn't a Unicode scalar value.
    #[error("invalid char code point 0x{0:x}")]
    InvalidChar(u32),

    /// A string field is not valid UTF-8.
    #[error("invalid UTF-8 in string field: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    /// The payload text is not valid base64.
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    /// A structured field failed to encode or decode.
    #[error("structured field: {0}")]
    Generic(#[from] serde_json::Error),

    /// The value has a shape the codec cannot represent.
    #[error("unsupported value: {0}")]
    Unsupported(&'static str),

    /// Error raised by a type's own `Serialize`/`Deserialize` impl.
    #[error("{0}")]
    Custom(String),
}

impl serde::ser::Error for CodecError {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        CodecError::Custom(msg.to_string())
    }
}

impl serde::de::Error for CodecError {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        CodecError::Custom(msg.to_string())
    }
}

/// Errors that can occur in the protocol layer.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serializing an envelope record failed.
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    /// A received record is not a well-formed envelope.
    #[error("decode failed: {0}")]
    Decode(serde_json::Error),

    /// The message payload inside an envelope failed to encode or decode.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// A fragment is inconsistent with its group or with the limits.
    #[error("invalid fragment: {0}")]
    InvalidFragment(String),

    /// The message is invalid at the protocol level.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}
