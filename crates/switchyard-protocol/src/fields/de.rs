use serde::de::{self, DeserializeOwned, DeserializeSeed, SeqAccess, Visitor};
use serde::forward_to_deserialize_any;

use super::tag;
use crate::CodecError;

pub(super) fn from_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    let mut reader = Reader { input: bytes };
    let value = T::deserialize(MessageDeserializer {
        reader: &mut reader,
    })?;
    if !reader.input.is_empty() {
        return Err(CodecError::TrailingBytes(reader.input.len()));
    }
    Ok(value)
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

struct Reader<'de> {
    input: &'de [u8],
}

impl<'de> Reader<'de> {
    fn take(&mut self, n: usize) -> Result<&'de [u8], CodecError> {
        if self.input.len() < n {
            return Err(CodecError::Truncated {
                needed: n,
                remaining: self.input.len(),
            });
        }
        let (head, rest) = self.input.split_at(n);
        self.input = rest;
        Ok(head)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut buf = [0u8; N];
        buf.copy_from_slice(self.take(N)?);
        Ok(buf)
    }

    fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn peek_u8(&self) -> Result<u8, CodecError> {
        self.input.first().copied().ok_or(CodecError::Truncated {
            needed: 1,
            remaining: 0,
        })
    }

    fn expect_tag(&mut self, expected: u8, name: &'static str) -> Result<(), CodecError> {
        let found = self.read_u8()?;
        if found != expected {
            return Err(CodecError::UnexpectedTag {
                expected: name,
                found,
            });
        }
        Ok(())
    }

    fn read_bool(&mut self) -> Result<bool, CodecError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(CodecError::InvalidBool(other)),
        }
    }

    fn read_char(&mut self) -> Result<char, CodecError> {
        let code = u32::from_be_bytes(self.read_array()?);
        char::from_u32(code).ok_or(CodecError::InvalidChar(code))
    }

    /// A u32 length prefix followed by that many bytes.
    fn read_block(&mut self) -> Result<&'de [u8], CodecError> {
        let len = u32::from_be_bytes(self.read_array()?) as usize;
        self.take(len)
    }

    fn read_str(&mut self) -> Result<&'de str, CodecError> {
        Ok(std::str::from_utf8(self.read_block()?)?)
    }
}

// ---------------------------------------------------------------------------
// Top level
// ---------------------------------------------------------------------------

struct MessageDeserializer<'a, 'de> {
    reader: &'a mut Reader<'de>,
}

impl<'de> de::Deserializer<'de> for MessageDeserializer<'_, 'de> {
    type Error = CodecError;

    fn deserialize_any<V: Visitor<'de>>(self, _visitor: V) -> Result<V::Value, CodecError> {
        Err(CodecError::Unsupported(
            "a message must be a struct with named fields",
        ))
    }

    fn deserialize_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, CodecError> {
        let found = u16::from_be_bytes(self.reader.read_array()?) as usize;
        if found != fields.len() {
            return Err(CodecError::FieldCount {
                expected: fields.len(),
                found,
            });
        }
        visitor.visit_seq(Fields {
            reader: self.reader,
            remaining: found,
        })
    }

    fn deserialize_unit_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, CodecError> {
        let found = u16::from_be_bytes(self.reader.read_array()?) as usize;
        if found != 0 {
            return Err(CodecError::FieldCount { expected: 0, found });
        }
        visitor.visit_unit()
    }

    fn deserialize_newtype_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, CodecError> {
        visitor.visit_newtype_struct(self)
    }

    forward_to_deserialize_any! {
        bool i8 i16 i32 i64 i128 u8 u16 u32 u64 u128 f32 f64 char str string
        bytes byte_buf option unit seq tuple tuple_struct map enum identifier
        ignored_any
    }
}

struct Fields<'a, 'de> {
    reader: &'a mut Reader<'de>,
    remaining: usize,
}

impl<'de> SeqAccess<'de> for Fields<'_, 'de> {
    type Error = CodecError;

    fn next_element_seed<S: DeserializeSeed<'de>>(
        &mut self,
        seed: S,
    ) -> Result<Option<S::Value>, CodecError> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        seed.deserialize(FieldDeserializer {
            reader: &mut *self.reader,
        })
        .map(Some)
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.remaining)
    }
}

// ---------------------------------------------------------------------------
// Field level
// ---------------------------------------------------------------------------

struct FieldDeserializer<'a, 'de> {
    reader: &'a mut Reader<'de>,
}

macro_rules! number {
    ($($method:ident => $tag:path, $visit:ident, $ty:ty;)*) => {$(
        fn $method<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, CodecError> {
            self.reader.expect_tag($tag, stringify!($ty))?;
            visitor.$visit(<$ty>::from_be_bytes(self.reader.read_array()?))
        }
    )*};
}

// Structured fields were written as JSON; hand the exact request to
// serde_json so the target type sees the same calls it would there.
macro_rules! structured {
    ($($method:ident($($arg:ident: $ty:ty),*);)*) => {$(
        fn $method<V: Visitor<'de>>(
            self,
            $($arg: $ty,)*
            visitor: V,
        ) -> Result<V::Value, CodecError> {
            match self.reader.peek_u8()? {
                tag::ARRAY | tag::SEQUENCE | tag::OBJECT => {
                    self.reader.read_u8()?;
                    let text = self.reader.read_block()?;
                    let mut json = serde_json::Deserializer::from_slice(text);
                    let value = de::Deserializer::$method(&mut json, $($arg,)* visitor)?;
                    json.end()?;
                    Ok(value)
                }
                _ => {
                    $(let _ = $arg;)*
                    self.deserialize_any(visitor)
                }
            }
        }
    )*};
}

impl<'de> de::Deserializer<'de> for FieldDeserializer<'_, 'de> {
    type Error = CodecError;

    fn deserialize_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, CodecError> {
        let found = self.reader.read_u8()?;
        match found {
            tag::NONE => visitor.visit_none(),
            tag::UNIT => visitor.visit_unit(),
            tag::BOOL => visitor.visit_bool(self.reader.read_bool()?),
            tag::I8 => visitor.visit_i8(i8::from_be_bytes(self.reader.read_array()?)),
            tag::I16 => visitor.visit_i16(i16::from_be_bytes(self.reader.read_array()?)),
            tag::I32 => visitor.visit_i32(i32::from_be_bytes(self.reader.read_array()?)),
            tag::I64 => visitor.visit_i64(i64::from_be_bytes(self.reader.read_array()?)),
            tag::U8 => visitor.visit_u8(self.reader.read_u8()?),
            tag::U16 => visitor.visit_u16(u16::from_be_bytes(self.reader.read_array()?)),
            tag::U32 => visitor.visit_u32(u32::from_be_bytes(self.reader.read_array()?)),
            tag::U64 => visitor.visit_u64(u64::from_be_bytes(self.reader.read_array()?)),
            tag::F32 => visitor.visit_f32(f32::from_bits(u32::from_be_bytes(
                self.reader.read_array()?,
            ))),
            tag::F64 => visitor.visit_f64(f64::from_bits(u64::from_be_bytes(
                self.reader.read_array()?,
            ))),
            tag::CHAR => visitor.visit_char(self.reader.read_char()?),
            tag::STR => visitor.visit_borrowed_str(self.reader.read_str()?),
            tag::BYTES => visitor.visit_borrowed_bytes(self.reader.read_block()?),
            tag::ARRAY | tag::SEQUENCE | tag::OBJECT => {
                let text = self.reader.read_block()?;
                let mut json = serde_json::Deserializer::from_slice(text);
                let value = de::Deserializer::deserialize_any(&mut json, visitor)?;
                json.end()?;
                Ok(value)
            }
            other => Err(CodecError::InvalidTag(other)),
        }
    }

    number! {
        deserialize_i8 => tag::I8, visit_i8, i8;
        deserialize_i16 => tag::I16, visit_i16, i16;
        deserialize_i32 => tag::I32, visit_i32, i32;
        deserialize_i64 => tag::I64, visit_i64, i64;
        deserialize_u8 => tag::U8, visit_u8, u8;
        deserialize_u16 => tag::U16, visit_u16, u16;
        deserialize_u32 => tag::U32, visit_u32, u32;
        deserialize_u64 => tag::U64, visit_u64, u64;
    }

    fn deserialize_f32<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, CodecError> {
        self.reader.expect_tag(tag::F32, "f32")?;
        visitor.visit_f32(f32::from_bits(u32::from_be_bytes(self.reader.read_array()?)))
    }

    fn deserialize_f64<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, CodecError> {
        self.reader.expect_tag(tag::F64, "f64")?;
        visitor.visit_f64(f64::from_bits(u64::from_be_bytes(self.reader.read_array()?)))
    }

    fn deserialize_bool<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, CodecError> {
        self.reader.expect_tag(tag::BOOL, "bool")?;
        visitor.visit_bool(self.reader.read_bool()?)
    }

    fn deserialize_char<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, CodecError> {
        self.reader.expect_tag(tag::CHAR, "char")?;
        visitor.visit_char(self.reader.read_char()?)
    }

    fn deserialize_str<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, CodecError> {
        self.reader.expect_tag(tag::STR, "string")?;
        visitor.visit_borrowed_str(self.reader.read_str()?)
    }

    fn deserialize_string<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, CodecError> {
        self.deserialize_str(visitor)
    }

    fn deserialize_bytes<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, CodecError> {
        self.reader.expect_tag(tag::BYTES, "bytes")?;
        visitor.visit_borrowed_bytes(self.reader.read_block()?)
    }

    fn deserialize_byte_buf<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, CodecError> {
        self.deserialize_bytes(visitor)
    }

    fn deserialize_unit<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, CodecError> {
        self.reader.expect_tag(tag::UNIT, "unit")?;
        visitor.visit_unit()
    }

    fn deserialize_option<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, CodecError> {
        if self.reader.peek_u8()? == tag::NONE {
            self.reader.read_u8()?;
            visitor.visit_none()
        } else {
            visitor.visit_some(self)
        }
    }

    fn deserialize_newtype_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, CodecError> {
        visitor.visit_newtype_struct(self)
    }

    structured! {
        deserialize_seq();
        deserialize_tuple(len: usize);
        deserialize_tuple_struct(name: &'static str, len: usize);
        deserialize_map();
        deserialize_struct(name: &'static str, fields: &'static [&'static str]);
        deserialize_enum(name: &'static str, variants: &'static [&'static str]);
        deserialize_unit_struct(name: &'static str);
    }

    forward_to_deserialize_any! {
        i128 u128 identifier ignored_any
    }
}
