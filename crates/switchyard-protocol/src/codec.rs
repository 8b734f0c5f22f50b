//! Envelope record codec.
//!
//! Turns an [`Envelope`] into the bytes of one wire record and back. The
//! record format is a JSON object, which is what lets the transport find
//! record boundaries by brace counting alone.

use crate::{Envelope, ProtocolError};

/// Converts envelopes to and from wire records.
///
/// The broker and client hold one codec each and share it across
/// connection tasks, hence the `Send + Sync + 'static` bound.
pub trait Codec: Send + Sync + 'static {
    /// Serializes an envelope into one record.
    ///
    /// # Errors
    /// Returns [`ProtocolError::Encode`] if serialization fails.
    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, ProtocolError>;

    /// Parses one record into an envelope.
    ///
    /// # Errors
    /// Returns [`ProtocolError::Decode`] if the record is not a well-formed
    /// envelope object.
    fn decode(&self, record: &[u8]) -> Result<Envelope, ProtocolError>;
}

/// The JSON record format.
///
/// ```rust
/// use switchyard_protocol::{Codec, Envelope, JsonCodec, Member};
///
/// let codec = JsonCodec;
/// let envelope = Envelope::new("chat.Chat", "AAEO", None, [Member::from("bob")]);
///
/// let record = codec.encode(&envelope).unwrap();
/// assert!(record.starts_with(b"{"));
/// assert_eq!(codec.decode(&record).unwrap(), envelope);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(envelope).map_err(ProtocolError::Encode)
    }

    fn decode(&self, record: &[u8]) -> Result<Envelope, ProtocolError> {
        serde_json::from_slice(record).map_err(ProtocolError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Member;

    #[test]
    fn test_decode_relayed_record_reads_source() {
        let record = br#"{"payload":"AA==","messageTypeName":"t","source":"alice","targets":["bob","bob"]}"#;

        let env = JsonCodec.decode(record).unwrap();

        assert_eq!(env.source(), Some(&Member::from("alice")));
        assert_eq!(env.targets(), &[Member::from("bob")]);
    }

    #[test]
    fn test_decode_non_object_fails() {
        assert!(matches!(
            JsonCodec.decode(b"[1,2,3]"),
            Err(ProtocolError::Decode(_))
        ));
    }

    #[test]
    fn test_decode_missing_payload_fails() {
        assert!(JsonCodec.decode(br#"{"messageTypeName":"t"}"#).is_err());
    }

    #[test]
    fn test_encode_braces_in_payload_stay_quoted() {
        let env = Envelope::new("t", "{not a brace}", Some(Member::from("a")), []);

        let record = JsonCodec.encode(&env).unwrap();

        assert_eq!(JsonCodec.decode(&record).unwrap(), env);
    }
}
