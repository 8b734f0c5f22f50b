//! Core wire types: members, the [`Message`] trait, and the [`Envelope`].
//!
//! An [`Envelope`] is the unit that travels between broker and clients. It
//! carries one encoded message plus routing metadata; the broker never
//! looks inside the payload to route it.

use std::borrow::Borrow;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::fields::{decode_message, encode_message};
use crate::fragment::FragmentConfig;
use crate::messages::{Fragment, SYSTEM_TYPES};
use crate::{CodecError, ProtocolError};

// ---------------------------------------------------------------------------
// Member
// ---------------------------------------------------------------------------

/// A named participant on the bus.
///
/// Members compare and hash by name. One name, [`Member::BROKER_NAME`],
/// stands for the broker itself and is never handed to a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Member(String);

impl Member {
    /// The reserved name addressing the broker.
    pub const BROKER_NAME: &'static str = "@broker";

    /// Longest name accepted in a handshake, in bytes.
    pub const MAX_NAME_LEN: usize = 64;

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The broker's own pseudo-member.
    pub fn broker() -> Self {
        Self(Self::BROKER_NAME.to_owned())
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    pub fn is_broker(&self) -> bool {
        self.0 == Self::BROKER_NAME
    }

    /// Whether this name may be claimed by a connection: non-empty, at most
    /// [`MAX_NAME_LEN`](Self::MAX_NAME_LEN) bytes, no whitespace or control
    /// characters. The broker name passes this check; reservation is a
    /// separate rule enforced by the registry.
    pub fn is_valid_name(name: &str) -> bool {
        !name.is_empty()
            && name.len() <= Self::MAX_NAME_LEN
            && !name.chars().any(|c| c.is_whitespace() || c.is_control())
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for Member {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Member {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for Member {
    fn from(name: String) -> Self {
        Self(name)
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// An application message that can ride inside an [`Envelope`].
///
/// Implementors are plain serde structs. `TYPE_NAME` identifies the type
/// on the wire, so it must be unique across every message a bus carries;
/// a dotted, crate-qualified name such as `"chat.Line"` works well.
///
/// ```rust
/// use serde::{Deserialize, Serialize};
/// use switchyard_protocol::Message;
///
/// #[derive(Serialize, Deserialize)]
/// struct Chat {
///     text: String,
/// }
///
/// impl Message for Chat {
///     const TYPE_NAME: &'static str = "chat.Chat";
/// }
/// ```
pub trait Message: Serialize + DeserializeOwned + Send + 'static {
    const TYPE_NAME: &'static str;
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// One routed unit: an encoded message plus its source and targets.
///
/// Envelopes are immutable once built. The broker relays a re-sourced
/// copy ([`Envelope::resourced`]) instead of editing what it received.
///
/// On the wire an envelope is a JSON object:
///
/// ```text
/// {"payload":"AAEO...","messageTypeName":"chat.Chat","source":"","targets":["bob"]}
/// ```
///
/// An empty `source` means "not yet assigned"; an empty `targets` list
/// means "everyone except the sender".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    payload: String,
    message_type_name: String,
    #[serde(with = "source_field", default)]
    source: Option<Member>,
    #[serde(deserialize_with = "dedup_targets", default)]
    targets: Vec<Member>,
}

impl Envelope {
    /// Builds an envelope from an already-encoded payload. Duplicate
    /// targets are dropped, keeping first-seen order.
    pub fn new(
        message_type_name: impl Into<String>,
        payload: impl Into<String>,
        source: Option<Member>,
        targets: impl IntoIterator<Item = Member>,
    ) -> Self {
        Self {
            payload: payload.into(),
            message_type_name: message_type_name.into(),
            source,
            targets: dedup(targets),
        }
    }

    /// Encodes `message` and wraps it, splitting into fragment carriers if
    /// the payload exceeds `config.threshold`.
    ///
    /// # Errors
    /// Fails if the message cannot be encoded or needs more than
    /// `config.max_chunks` fragments.
    pub fn create<M: Message>(
        message: &M,
        source: Option<Member>,
        targets: impl IntoIterator<Item = Member>,
        config: &FragmentConfig,
    ) -> Result<Vec<Envelope>, ProtocolError> {
        let encoded = encode_message(message)?;
        Self::new(encoded.type_name, encoded.payload, source, targets).split(config)
    }

    /// Splits this envelope into fragment carriers if its payload is larger
    /// than the threshold; otherwise returns it unchanged as a single item.
    ///
    /// Chunk `i` (1-based sequence `i + 1`) covers payload bytes
    /// `[i * threshold, min((i + 1) * threshold, len))`. Every carrier keeps
    /// this envelope's source and targets.
    ///
    /// # Errors
    /// Fails if the payload is not ASCII (encoded payloads always are) or
    /// would need more than `config.max_chunks` chunks.
    pub fn split(self, config: &FragmentConfig) -> Result<Vec<Envelope>, ProtocolError> {
        let threshold = config.threshold.max(1);
        let len = self.payload.len();
        if len <= threshold {
            return Ok(vec![self]);
        }
        if !self.payload.is_ascii() {
            return Err(ProtocolError::InvalidMessage(
                "oversized payload is not ASCII and cannot be split".into(),
            ));
        }

        let total = len.div_ceil(threshold);
        if total > config.max_chunks {
            return Err(ProtocolError::InvalidMessage(format!(
                "payload of {len} bytes needs {total} chunks, limit is {}",
                config.max_chunks
            )));
        }
        let total = u32::try_from(total).map_err(|_| {
            ProtocolError::InvalidMessage(format!("{total} chunks overflow u32"))
        })?;

        let group_id = rand::random::<u64>();
        (0..total)
            .map(|index| -> Result<Envelope, ProtocolError> {
                let start = index as usize * threshold;
                let end = (start + threshold).min(len);
                let fragment = Fragment {
                    group_id,
                    sequence: index + 1,
                    total,
                    type_name: self.message_type_name.clone(),
                    chunk: self.payload[start..end].to_owned(),
                };
                let encoded = encode_message(&fragment)?;
                Ok(Envelope {
                    payload: encoded.payload,
                    message_type_name: encoded.type_name.to_owned(),
                    source: self.source.clone(),
                    targets: self.targets.clone(),
                })
            })
            .collect()
    }

    /// A copy of this envelope with `source` replaced. Payload, type and
    /// targets are carried over untouched.
    pub fn resourced(&self, source: Member) -> Envelope {
        Envelope {
            source: Some(source),
            ..self.clone()
        }
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn message_type_name(&self) -> &str {
        &self.message_type_name
    }

    pub fn source(&self) -> Option<&Member> {
        self.source.as_ref()
    }

    pub fn targets(&self) -> &[Member] {
        &self.targets
    }

    /// Empty targets: deliver to everyone except the sender.
    pub fn is_broadcast(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn is_fragment(&self) -> bool {
        self.message_type_name == Fragment::TYPE_NAME
    }

    /// Whether this carries one of the bus's own message types.
    pub fn is_system(&self) -> bool {
        SYSTEM_TYPES.contains(&self.message_type_name.as_str())
    }

    pub fn is<M: Message>(&self) -> bool {
        self.message_type_name == M::TYPE_NAME
    }

    pub fn targets_broker(&self) -> bool {
        self.targets.iter().any(Member::is_broker)
    }

    /// Targets other than the broker's reserved name.
    pub fn member_targets(&self) -> impl Iterator<Item = &Member> {
        self.targets.iter().filter(|m| !m.is_broker())
    }

    /// Decodes the payload as `M`.
    ///
    /// # Errors
    /// [`CodecError::TypeMismatch`] if the envelope carries another type,
    /// otherwise any decode failure from the field codec.
    pub fn decode<M: Message>(&self) -> Result<M, CodecError> {
        if !self.is::<M>() {
            return Err(CodecError::TypeMismatch {
                expected: M::TYPE_NAME.to_owned(),
                found: self.message_type_name.clone(),
            });
        }
        decode_message(&self.payload)
    }
}

fn dedup(targets: impl IntoIterator<Item = Member>) -> Vec<Member> {
    let mut out: Vec<Member> = Vec::new();
    for target in targets {
        if !out.contains(&target) {
            out.push(target);
        }
    }
    out
}

fn dedup_targets<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<Member>, D::Error> {
    Vec::<Member>::deserialize(de).map(dedup)
}

/// `source` is written as a plain string, `""` when unassigned.
mod source_field {
    use super::*;

    pub fn serialize<S: Serializer>(
        source: &Option<Member>,
        ser: S,
    ) -> Result<S::Ok, S::Error> {
        ser.serialize_str(source.as_ref().map_or("", Member::name))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        de: D,
    ) -> Result<Option<Member>, D::Error> {
        let name = String::deserialize(de)?;
        Ok((!name.is_empty()).then(|| Member::new(name)))
    }
}
