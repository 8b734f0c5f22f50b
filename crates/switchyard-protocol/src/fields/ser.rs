use std::fmt;

use serde::ser::{self, Impossible, Serialize, SerializeStruct, Serializer};

use super::finite::ensure_finite;
use super::tag;
use crate::CodecError;

const NOT_A_STRUCT: &str = "a message must be a struct with named fields";

pub(super) fn to_bytes<T: Serialize + ?Sized>(
    value: &T,
) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    value.serialize(MessageSerializer { out: &mut out })?;
    Ok(out)
}

fn put_len(out: &mut Vec<u8>, len: usize) -> Result<(), CodecError> {
    let len = u32::try_from(len)
        .map_err(|_| CodecError::Unsupported("field longer than u32::MAX bytes"))?;
    out.extend_from_slice(&len.to_be_bytes());
    Ok(())
}

// ---------------------------------------------------------------------------
// Top level: only structs are messages
// ---------------------------------------------------------------------------

struct MessageSerializer<'a> {
    out: &'a mut Vec<u8>,
}

macro_rules! reject {
    ($($method:ident($($arg:ident: $ty:ty),*) -> $ret:ty;)*) => {$(
        fn $method(self, $($arg: $ty),*) -> Result<$ret, CodecError> {
            $(let _ = $arg;)*
            Err(CodecError::Unsupported(NOT_A_STRUCT))
        }
    )*};
}

impl<'a> Serializer for MessageSerializer<'a> {
    type Ok = ();
    type Error = CodecError;
    type SerializeSeq = Impossible<(), CodecError>;
    type SerializeTuple = Impossible<(), CodecError>;
    type SerializeTupleStruct = Impossible<(), CodecError>;
    type SerializeTupleVariant = Impossible<(), CodecError>;
    type SerializeMap = Impossible<(), CodecError>;
    type SerializeStruct = StructFields<'a>;
    type SerializeStructVariant = Impossible<(), CodecError>;

    reject! {
        serialize_bool(v: bool) -> ();
        serialize_i8(v: i8) -> ();
        serialize_i16(v: i16) -> ();
        serialize_i32(v: i32) -> ();
        serialize_i64(v: i64) -> ();
        serialize_u8(v: u8) -> ();
        serialize_u16(v: u16) -> ();
        serialize_u32(v: u32) -> ();
        serialize_u64(v: u64) -> ();
        serialize_f32(v: f32) -> ();
        serialize_f64(v: f64) -> ();
        serialize_char(v: char) -> ();
        serialize_str(v: &str) -> ();
        serialize_bytes(v: &[u8]) -> ();
        serialize_none() -> ();
        serialize_unit() -> ();
        serialize_unit_variant(name: &'static str, index: u32, variant: &'static str) -> ();
        serialize_seq(len: Option<usize>) -> Self::SerializeSeq;
        serialize_tuple(len: usize) -> Self::SerializeTuple;
        serialize_tuple_struct(name: &'static str, len: usize) -> Self::SerializeTupleStruct;
        serialize_tuple_variant(
            name: &'static str,
            index: u32,
            variant: &'static str,
            len: usize
        ) -> Self::SerializeTupleVariant;
        serialize_map(len: Option<usize>) -> Self::SerializeMap;
        serialize_struct_variant(
            name: &'static str,
            index: u32,
            variant: &'static str,
            len: usize
        ) -> Self::SerializeStructVariant;
    }

    fn serialize_some<T: ?Sized + Serialize>(
        self,
        _value: &T,
    ) -> Result<(), CodecError> {
        Err(CodecError::Unsupported(NOT_A_STRUCT))
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<(), CodecError> {
        self.out.extend_from_slice(&0u16.to_be_bytes());
        Ok(())
    }

    fn serialize_newtype_struct<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<(), CodecError> {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _value: &T,
    ) -> Result<(), CodecError> {
        Err(CodecError::Unsupported(NOT_A_STRUCT))
    }

    fn serialize_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<StructFields<'a>, CodecError> {
        let count_at = self.out.len();
        self.out.extend_from_slice(&[0, 0]);
        Ok(StructFields {
            out: self.out,
            count_at,
            count: 0,
        })
    }
}

/// Writes fields in the order serde hands them over. The count is patched
/// in once the last field is known, so skipped fields never count.
pub(super) struct StructFields<'a> {
    out: &'a mut Vec<u8>,
    count_at: usize,
    count: u16,
}

impl SerializeStruct for StructFields<'_> {
    type Ok = ();
    type Error = CodecError;

    fn serialize_field<T: ?Sized + Serialize>(
        &mut self,
        _key: &'static str,
        value: &T,
    ) -> Result<(), CodecError> {
        self.count = self
            .count
            .checked_add(1)
            .ok_or(CodecError::Unsupported("more than 65535 fields"))?;
        write_field(self.out, value)
    }

    fn end(self) -> Result<(), CodecError> {
        self.out[self.count_at..self.count_at + 2]
            .copy_from_slice(&self.count.to_be_bytes());
        Ok(())
    }
}

fn write_field<T: ?Sized + Serialize>(
    out: &mut Vec<u8>,
    value: &T,
) -> Result<(), CodecError> {
    let mark = out.len();
    match value.serialize(FieldSerializer { out: &mut *out }) {
        Ok(()) => Ok(()),
        Err(Probe::Compound(shape)) => {
            out.truncate(mark);
            ensure_finite(value)?;
            let json = serde_json::to_vec(value)?;
            out.push(shape.tag());
            put_len(out, json.len())?;
            out.extend_from_slice(&json);
            Ok(())
        }
        Err(Probe::Failed(e)) => Err(e),
    }
}

// ---------------------------------------------------------------------------
// Field level: primitives inline, anything structured bails out as JSON
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum Shape {
    Array,
    Sequence,
    Object,
}

impl Shape {
    fn tag(self) -> u8 {
        match self {
            Self::Array => tag::ARRAY,
            Self::Sequence => tag::SEQUENCE,
            Self::Object => tag::OBJECT,
        }
    }
}

/// Error type of the field probe. `Compound` is not a failure: it tells
/// [`write_field`] to rewind and write the value as JSON instead.
#[derive(Debug)]
enum Probe {
    Compound(Shape),
    Failed(CodecError),
}

impl fmt::Display for Probe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compound(shape) => write!(f, "structured value ({shape:?})"),
            Self::Failed(e) => fmt::Display::fmt(e, f),
        }
    }
}

impl std::error::Error for Probe {}

impl ser::Error for Probe {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        Self::Failed(CodecError::Custom(msg.to_string()))
    }
}

impl From<CodecError> for Probe {
    fn from(e: CodecError) -> Self {
        Self::Failed(e)
    }
}

struct FieldSerializer<'a> {
    out: &'a mut Vec<u8>,
}

macro_rules! number {
    ($($method:ident($ty:ty) => $tag:path;)*) => {$(
        fn $method(self, v: $ty) -> Result<(), Probe> {
            self.out.push($tag);
            self.out.extend_from_slice(&v.to_be_bytes());
            Ok(())
        }
    )*};
}

impl Serializer for FieldSerializer<'_> {
    type Ok = ();
    type Error = Probe;
    type SerializeSeq = Impossible<(), Probe>;
    type SerializeTuple = Impossible<(), Probe>;
    type SerializeTupleStruct = Impossible<(), Probe>;
    type SerializeTupleVariant = Impossible<(), Probe>;
    type SerializeMap = Impossible<(), Probe>;
    type SerializeStruct = Impossible<(), Probe>;
    type SerializeStructVariant = Impossible<(), Probe>;

    number! {
        serialize_i8(i8) => tag::I8;
        serialize_i16(i16) => tag::I16;
        serialize_i32(i32) => tag::I32;
        serialize_i64(i64) => tag::I64;
        serialize_u8(u8) => tag::U8;
        serialize_u16(u16) => tag::U16;
        serialize_u32(u32) => tag::U32;
        serialize_u64(u64) => tag::U64;
    }

    fn serialize_f32(self, v: f32) -> Result<(), Probe> {
        self.out.push(tag::F32);
        self.out.extend_from_slice(&v.to_bits().to_be_bytes());
        Ok(())
    }

    fn serialize_f64(self, v: f64) -> Result<(), Probe> {
        self.out.push(tag::F64);
        self.out.extend_from_slice(&v.to_bits().to_be_bytes());
        Ok(())
    }

    fn serialize_bool(self, v: bool) -> Result<(), Probe> {
        self.out.extend_from_slice(&[tag::BOOL, u8::from(v)]);
        Ok(())
    }

    fn serialize_char(self, v: char) -> Result<(), Probe> {
        self.out.push(tag::CHAR);
        self.out.extend_from_slice(&u32::from(v).to_be_bytes());
        Ok(())
    }

    fn serialize_str(self, v: &str) -> Result<(), Probe> {
        self.out.push(tag::STR);
        put_len(self.out, v.len())?;
        self.out.extend_from_slice(v.as_bytes());
        Ok(())
    }

    fn serialize_bytes(self, v: &[u8]) -> Result<(), Probe> {
        self.out.push(tag::BYTES);
        put_len(self.out, v.len())?;
        self.out.extend_from_slice(v);
        Ok(())
    }

    fn serialize_none(self) -> Result<(), Probe> {
        self.out.push(tag::NONE);
        Ok(())
    }

    fn serialize_some<T: ?Sized + Serialize>(self, value: &T) -> Result<(), Probe> {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<(), Probe> {
        self.out.push(tag::UNIT);
        Ok(())
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<(), Probe> {
        self.serialize_unit()
    }

    fn serialize_newtype_struct<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<(), Probe> {
        value.serialize(self)
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
    ) -> Result<(), Probe> {
        Err(Probe::Compound(Shape::Object))
    }

    fn serialize_newtype_variant<T: ?Sized + Serialize>(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _value: &T,
    ) -> Result<(), Probe> {
        Err(Probe::Compound(Shape::Object))
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<Self::SerializeSeq, Probe> {
        Err(Probe::Compound(Shape::Sequence))
    }

    fn serialize_tuple(self, _len: usize) -> Result<Self::SerializeTuple, Probe> {
        Err(Probe::Compound(Shape::Array))
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleStruct, Probe> {
        Err(Probe::Compound(Shape::Array))
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleVariant, Probe> {
        Err(Probe::Compound(Shape::Object))
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<Self::SerializeMap, Probe> {
        Err(Probe::Compound(Shape::Object))
    }

    fn serialize_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStruct, Probe> {
        Err(Probe::Compound(Shape::Object))
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStructVariant, Probe> {
        Err(Probe::Compound(Shape::Object))
    }
}
