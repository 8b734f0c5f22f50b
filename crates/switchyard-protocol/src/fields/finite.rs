//! Pre-flight walk over a value bound for the JSON fallback.
//!
//! JSON has no spelling for NaN or the infinities: `serde_json` writes
//! them as `null`, which then fails to decode as a float on the other
//! side. Such values are refused here, on the sending side.

use serde::ser::{self, Serialize, Serializer};

use crate::CodecError;

const NON_FINITE: &str = "NaN or infinite float inside a structured field";

pub(super) fn ensure_finite<T: Serialize + ?Sized>(value: &T) -> Result<(), CodecError> {
    value.serialize(&mut FiniteCheck)
}

struct FiniteCheck;

macro_rules! accept {
    ($($method:ident($ty:ty);)*) => {$(
        fn $method(self, _: $ty) -> Result<(), CodecError> {
            Ok(())
        }
    )*};
}

impl Serializer for &mut FiniteCheck {
    type Ok = ();
    type Error = CodecError;
    type SerializeSeq = Self;
    type SerializeTuple = Self;
    type SerializeTupleStruct = Self;
    type SerializeTupleVariant = Self;
    type SerializeMap = Self;
    type SerializeStruct = Self;
    type SerializeStructVariant = Self;

    accept! {
        serialize_bool(bool);
        serialize_i8(i8);
        serialize_i16(i16);
        serialize_i32(i32);
        serialize_i64(i64);
        serialize_i128(i128);
        serialize_u8(u8);
        serialize_u16(u16);
        serialize_u32(u32);
        serialize_u64(u64);
        serialize_u128(u128);
        serialize_char(char);
        serialize_str(&str);
        serialize_bytes(&[u8]);
        serialize_unit_struct(&'static str);
    }

    fn serialize_f32(self, v: f32) -> Result<(), CodecError> {
        if v.is_finite() {
            Ok(())
        } else {
            Err(CodecError::Unsupported(NON_FINITE))
        }
    }

    fn serialize_f64(self, v: f64) -> Result<(), CodecError> {
        if v.is_finite() {
            Ok(())
        } else {
            Err(CodecError::Unsupported(NON_FINITE))
        }
    }

    fn serialize_none(self) -> Result<(), CodecError> {
        Ok(())
    }

    fn serialize_some<T: ?Sized + Serialize>(self, value: &T) -> Result<(), CodecError> {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<(), CodecError> {
        Ok(())
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
    ) -> Result<(), CodecError> {
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
        value: &T,
    ) -> Result<(), CodecError> {
        value.serialize(self)
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<Self::SerializeSeq, CodecError> {
        Ok(self)
    }

    fn serialize_tuple(self, _len: usize) -> Result<Self::SerializeTuple, CodecError> {
        Ok(self)
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleStruct, CodecError> {
        Ok(self)
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleVariant, CodecError> {
        Ok(self)
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<Self::SerializeMap, CodecError> {
        Ok(self)
    }

    fn serialize_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStruct, CodecError> {
        Ok(self)
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStructVariant, CodecError> {
        Ok(self)
    }
}

macro_rules! walk {
    ($($trait:ident { $($method:ident($($key:ident: $key_ty:ty,)?);)* })*) => {$(
        impl ser::$trait for &mut FiniteCheck {
            type Ok = ();
            type Error = CodecError;

            $(
                fn $method<T: ?Sized + Serialize>(
                    &mut self,
                    $($key: $key_ty,)?
                    value: &T,
                ) -> Result<(), CodecError> {
                    $(let _ = $key;)?
                    value.serialize(&mut **self)
                }
            )*

            fn end(self) -> Result<(), CodecError> {
                Ok(())
            }
        }
    )*};
}

walk! {
    SerializeSeq { serialize_element(); }
    SerializeTuple { serialize_element(); }
    SerializeTupleStruct { serialize_field(); }
    SerializeTupleVariant { serialize_field(); }
    SerializeMap { serialize_key(); serialize_value(); }
    SerializeStruct { serialize_field(key: &'static str,); }
    SerializeStructVariant { serialize_field(key: &'static str,); }
}
