//! The field codec: application messages to payload text and back.
//!
//! A message is written as its field count followed by each field in
//! declaration order. Every field starts with a one-byte tag naming its
//! runtime type so the decoder can pick the matching read path:
//!
//! ```text
//! [u16 field count] ([tag] [value])*
//!
//! bool               tag, 1 byte (0 or 1)
//! i8..i64, u8..u64   tag, natural width, big-endian
//! f32, f64           tag, IEEE-754 bits, big-endian
//! char               tag, u32 code point
//! string, bytes      tag, u32 length, raw bytes (strings are UTF-8)
//! Option::None       tag only; Some(v) is written as v
//! array / sequence / tag, u32 length, JSON text of the whole value
//! structured value
//! ```
//!
//! Fixed-size arrays and tuples carry the array marker, growable
//! sequences the sequence marker, and maps, nested structs and enums the
//! object marker. The byte stream is then base64-encoded into a single
//! string payload.
//!
//! Top-level float fields keep their exact bits, NaN included. Inside a
//! structured value they go through JSON, so NaN and the infinities are
//! refused at encode time.
//!
//! Fields marked `#[serde(skip)]` are excluded from the wire form and come
//! back as their `Default` value. Message types are ordinary serde types;
//! nothing is constructed behind the type's back.

mod de;
mod finite;
mod ser;

use base64::{Engine as _, engine::general_purpose};

use crate::{CodecError, Message};

pub(crate) mod tag {
    pub const NONE: u8 = 0x00;
    pub const UNIT: u8 = 0x01;
    pub const BOOL: u8 = 0x02;
    pub const I8: u8 = 0x03;
    pub const I16: u8 = 0x04;
    pub const I32: u8 = 0x05;
    pub const I64: u8 = 0x06;
    pub const U8: u8 = 0x07;
    pub const U16: u8 = 0x08;
    pub const U32: u8 = 0x09;
    pub const U64: u8 = 0x0a;
    pub const F32: u8 = 0x0b;
    pub const F64: u8 = 0x0c;
    pub const CHAR: u8 = 0x0d;
    pub const STR: u8 = 0x0e;
    pub const BYTES: u8 = 0x0f;
    pub const ARRAY: u8 = 0x20;
    pub const SEQUENCE: u8 = 0x21;
    pub const OBJECT: u8 = 0x22;
}

/// A message after encoding: the payload text plus the type name used to
/// pick a decoder on the receiving side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedMessage {
    pub payload: String,
    pub type_name: &'static str,
}

/// Encodes `message` into base64 payload text.
///
/// # Errors
/// Returns [`CodecError::Unsupported`] if `M` does not serialize as a struct
/// with named fields, or if a nested value fails to serialize.
pub fn encode_message<M: Message>(
    message: &M,
) -> Result<EncodedMessage, CodecError> {
    let bytes = ser::to_bytes(message)?;
    Ok(EncodedMessage {
        payload: general_purpose::STANDARD.encode(bytes),
        type_name: M::TYPE_NAME,
    })
}

/// Decodes payload text produced by [`encode_message`] into an `M`.
///
/// # Errors
/// Malformed input is an error: bad base64, truncated fields, unknown
/// tags, a field count that disagrees with `M`, or leftover bytes.
pub fn decode_message<M: Message>(payload: &str) -> Result<M, CodecError> {
    let bytes = general_purpose::STANDARD.decode(payload)?;
    de::from_bytes(&bytes)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Scalars {
        flag: bool,
        tiny: i8,
        small: i16,
        int: i32,
        long: i64,
        ubyte: u8,
        ushort: u16,
        uint: u32,
        ulong: u64,
        single: f32,
        double: f64,
        letter: char,
        text: String,
    }

    impl Message for Scalars {
        const TYPE_NAME: &'static str = "test.Scalars";
    }

    fn scalars() -> Scalars {
        Scalars {
            flag: true,
            tiny: -128,
            small: -32_000,
            int: i32::MIN,
            long: i64::MAX,
            ubyte: 255,
            ushort: 65_535,
            uint: u32::MAX,
            ulong: u64::MAX,
            single: 1.5,
            double: -0.1,
            letter: 'λ',
            text: "héllo, wörld {}".into(),
        }
    }

    #[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
    enum Mood {
        #[default]
        Calm,
        Loud { volume: u8 },
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Compound {
        fixed: [u16; 3],
        list: Vec<String>,
        bytes: Vec<u8>,
        table: BTreeMap<String, i64>,
        nested: Scalars,
        mood: Mood,
        maybe: Option<u32>,
        nothing: Option<String>,
        #[serde(skip)]
        cache: Vec<u8>,
    }

    impl Message for Compound {
        const TYPE_NAME: &'static str = "test.Compound";
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Empty;

    impl Message for Empty {
        const TYPE_NAME: &'static str = "test.Empty";
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Wide {
        value: i64,
    }

    impl Message for Wide {
        const TYPE_NAME: &'static str = "test.Wide";
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Narrow {
        value: i32,
    }

    impl Message for Narrow {
        const TYPE_NAME: &'static str = "test.Narrow";
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Pair {
        a: u8,
        b: u8,
    }

    impl Message for Pair {
        const TYPE_NAME: &'static str = "test.Pair";
    }

    fn raw(payload: &str) -> Vec<u8> {
        general_purpose::STANDARD.decode(payload).unwrap()
    }

    fn wrap(bytes: &[u8]) -> String {
        general_purpose::STANDARD.encode(bytes)
    }

    #[test]
    fn test_encode_scalars_round_trip_exactly() {
        let original = scalars();

        let encoded = encode_message(&original).unwrap();
        let decoded: Scalars = decode_message(&encoded.payload).unwrap();

        assert_eq!(encoded.type_name, "test.Scalars");
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_encode_uses_natural_widths() {
        let encoded = encode_message(&Pair { a: 7, b: 9 }).unwrap();

        // field count, then two (tag, byte) pairs.
        assert_eq!(raw(&encoded.payload), vec![0, 2, tag::U8, 7, tag::U8, 9]);
    }

    #[test]
    fn test_encode_nan_keeps_bit_pattern() {
        let mut original = scalars();
        original.double = f64::from_bits(0x7ff8_0000_0000_0001);

        let encoded = encode_message(&original).unwrap();
        let decoded: Scalars = decode_message(&encoded.payload).unwrap();

        assert_eq!(decoded.double.to_bits(), original.double.to_bits());
    }

    #[test]
    fn test_encode_compound_round_trip_and_skips_excluded_field() {
        let original = Compound {
            fixed: [1, 2, 3],
            list: vec!["a".into(), "b{".into()],
            bytes: (0..=255).collect(),
            table: BTreeMap::from([("x".into(), -1), ("y".into(), 2)]),
            nested: scalars(),
            mood: Mood::Loud { volume: 11 },
            maybe: Some(42),
            nothing: None,
            cache: vec![9, 9, 9],
        };

        let encoded = encode_message(&original).unwrap();
        let decoded: Compound = decode_message(&encoded.payload).unwrap();

        assert!(decoded.cache.is_empty(), "skipped field must not travel");
        assert_eq!(
            decoded,
            Compound {
                cache: Vec::new(),
                ..original
            }
        );
    }

    #[test]
    fn test_encode_marks_array_sequence_and_object_differently() {
        let original = Compound {
            fixed: [0; 3],
            list: vec![],
            bytes: vec![],
            table: BTreeMap::new(),
            nested: scalars(),
            mood: Mood::Calm,
            maybe: None,
            nothing: None,
            cache: vec![],
        };

        let bytes = raw(&encode_message(&original).unwrap().payload);

        // 8 fields on the wire: `cache` is skipped.
        assert_eq!(&bytes[..2], &[0, 8]);
        assert_eq!(bytes[2], tag::ARRAY);
        assert!(bytes.contains(&tag::SEQUENCE));
        assert!(bytes.contains(&tag::OBJECT));
    }

    #[test]
    fn test_encode_unit_struct_has_no_fields() {
        let encoded = encode_message(&Empty).unwrap();

        assert_eq!(raw(&encoded.payload), vec![0, 0]);
        let decoded: Empty = decode_message(&encoded.payload).unwrap();
        assert_eq!(decoded, Empty);
    }

    #[test]
    fn test_decode_truncated_payload_fails() {
        let mut bytes = raw(&encode_message(&scalars()).unwrap().payload);
        bytes.truncate(bytes.len() - 3);

        let result: Result<Scalars, _> = decode_message(&wrap(&bytes));

        assert!(matches!(result, Err(CodecError::Truncated { .. })));
    }

    #[test]
    fn test_decode_trailing_bytes_fails() {
        let mut bytes = raw(&encode_message(&Pair { a: 1, b: 2 }).unwrap().payload);
        bytes.push(0xff);

        let result: Result<Pair, _> = decode_message(&wrap(&bytes));

        assert!(matches!(result, Err(CodecError::TrailingBytes(1))));
    }

    #[test]
    fn test_decode_width_mismatch_fails_instead_of_coercing() {
        let encoded = encode_message(&Narrow { value: 5 }).unwrap();

        let result: Result<Wide, _> = decode_message(&encoded.payload);

        assert!(matches!(
            result,
            Err(CodecError::UnexpectedTag { expected: "i64", found }) if found == tag::I32
        ));
    }

    #[test]
    fn test_decode_field_count_mismatch_fails() {
        let encoded = encode_message(&Pair { a: 1, b: 2 }).unwrap();

        let result: Result<Narrow, _> = decode_message(&encoded.payload);

        assert!(matches!(
            result,
            Err(CodecError::FieldCount { expected: 1, found: 2 })
        ));
    }

    #[test]
    fn test_decode_unknown_tag_fails() {
        let result: Result<Scalars, _> =
            decode_message(&wrap(&[0, 13, 0x7f, 0]));

        assert!(result.is_err());
    }

    #[test]
    fn test_decode_invalid_bool_fails() {
        #[derive(Debug, Serialize, Deserialize)]
        struct Flag {
            on: bool,
        }
        impl Message for Flag {
            const TYPE_NAME: &'static str = "test.Flag";
        }

        let result: Result<Flag, _> = decode_message(&wrap(&[0, 1, tag::BOOL, 2]));

        assert!(matches!(result, Err(CodecError::InvalidBool(2))));
    }

    #[test]
    fn test_decode_bad_base64_fails() {
        let result: Result<Pair, _> = decode_message("not base64!!");

        assert!(matches!(result, Err(CodecError::Base64(_))));
    }

    #[test]
    fn test_encode_non_struct_message_is_unsupported() {
        #[derive(Serialize, Deserialize)]
        struct Bare(Vec<u8>);
        impl Message for Bare {
            const TYPE_NAME: &'static str = "test.Bare";
        }

        let result = encode_message(&Bare(vec![1]));

        assert!(matches!(result, Err(CodecError::Unsupported(_))));
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Samples {
        values: Vec<f64>,
        peak: Option<(f32, f32)>,
    }

    impl Message for Samples {
        const TYPE_NAME: &'static str = "test.Samples";
    }

    #[test]
    fn test_encode_non_finite_in_structured_field_is_unsupported() {
        for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let samples = Samples {
                values: vec![1.0, bad],
                peak: None,
            };

            assert!(matches!(
                encode_message(&samples),
                Err(CodecError::Unsupported(_))
            ));
        }

        let nested = Samples {
            values: vec![],
            peak: Some((0.5, f32::NAN)),
        };
        assert!(matches!(encode_message(&nested), Err(CodecError::Unsupported(_))));
    }

    #[test]
    fn test_encode_finite_floats_in_structured_field_round_trip() {
        let original = Samples {
            values: vec![1.0, -0.25, 1e10, 0.0],
            peak: Some((0.5, -3.0)),
        };

        let encoded = encode_message(&original).unwrap();
        let decoded: Samples = decode_message(&encoded.payload).unwrap();

        assert_eq!(decoded, original);
    }
}
