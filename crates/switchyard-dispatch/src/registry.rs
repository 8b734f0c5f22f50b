//! Type registry: message type name to decoder.
//!
//! Each broker and client owns its own registry, filled as listeners are
//! registered. There is no process-wide table.

use std::any::Any;
use std::collections::HashMap;

use switchyard_protocol::{CodecError, Message, decode_message};

pub(crate) type DecodeFn = fn(&str) -> Result<Box<dyn Any + Send>, CodecError>;

fn decode_boxed<M: Message>(payload: &str) -> Result<Box<dyn Any + Send>, CodecError> {
    Ok(Box::new(decode_message::<M>(payload)?))
}

pub(crate) fn decoder_for<M: Message>() -> DecodeFn {
    decode_boxed::<M>
}

/// Maps wire type names to the function that decodes them.
#[derive(Debug, Default, Clone)]
pub struct TypeRegistry {
    decoders: HashMap<&'static str, DecodeFn>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `M` decodable. Returns `false` if it already was.
    pub fn register<M: Message>(&mut self) -> bool {
        self.insert(M::TYPE_NAME, decoder_for::<M>())
    }

    pub(crate) fn insert(&mut self, type_name: &'static str, decode: DecodeFn) -> bool {
        self.decoders.insert(type_name, decode).is_none()
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.decoders.contains_key(type_name)
    }

    pub(crate) fn decoder(&self, type_name: &str) -> Option<DecodeFn> {
        self.decoders.get(type_name).copied()
    }

    /// Decodes `payload` as the type registered under `type_name`.
    ///
    /// # Errors
    /// [`CodecError::UnknownType`] if nothing is registered under that
    /// name, otherwise whatever the field codec reports.
    pub fn decode(
        &self,
        type_name: &str,
        payload: &str,
    ) -> Result<Box<dyn Any + Send>, CodecError> {
        let decode = self
            .decoder(type_name)
            .ok_or_else(|| CodecError::UnknownType(type_name.to_owned()))?;
        decode(payload)
    }

    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use switchyard_protocol::encode_message;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Score {
        points: u64,
    }

    impl Message for Score {
        const TYPE_NAME: &'static str = "test.Score";
    }

    #[test]
    fn test_register_twice_reports_existing() {
        let mut registry = TypeRegistry::new();

        assert!(registry.register::<Score>());
        assert!(!registry.register::<Score>());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_decode_registered_type_yields_value() {
        let mut registry = TypeRegistry::new();
        registry.register::<Score>();
        let payload = encode_message(&Score { points: 12 }).unwrap().payload;

        let boxed = registry.decode(Score::TYPE_NAME, &payload).unwrap();

        assert_eq!(boxed.downcast_ref::<Score>(), Some(&Score { points: 12 }));
    }

    #[test]
    fn test_decode_unknown_type_fails() {
        let registry = TypeRegistry::new();

        assert!(matches!(
            registry.decode("nope", ""),
            Err(CodecError::UnknownType(name)) if name == "nope"
        ));
    }
}
