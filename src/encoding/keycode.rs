//! KeyCode is a lexicographical order-preserving binary encoding for storage
//! engine keys. It is designed for simplicity, not efficiency (i.e. it does
//! not use varints or other compression methods).
//!
//! Ordering matters because the MVCC engine relies on range scans over parts
//! of the keyspace: all versions of a user key in one column family are
//! adjacent, and newer versions sort before older ones (versions are stored
//! inverted, see storage::Memory). It also allows scanning a region's key
//! range in a single column family.
//!
//! The encoding is not self-describing: the caller must provide a concrete type
//! to decode into, and the binary key must conform to its structure.
//!
//! KeyCode supports a small subset of data types, encoded as follows:
//!
//! bool:    0x00 for false, 0x01 for true.
//! u64:     Big-endian binary representation.
//! Vec<u8>: 0x00 is escaped as 0x00ff, terminated with 0x0000.
//! String:  Like Vec<u8>.
//! Tuple:   Concatenation of elements, with no surrounding structure.
//! Enum:    The variant's enum index as a single u8 byte, then any fields.
//!
//! Byte vectors and slices must be wrapped with serde_bytes::ByteBuf or use
//! the #[serde(with="serde_bytes")] attribute, otherwise serde treats them as
//! sequences of u8 which KeyCode rejects.

use de::IntoDeserializer;
use serde::{de, ser};

use crate::errdata;
use crate::error::{Error, Result};

/// Serializes a key to a binary KeyCode representation.
pub fn serialize<T: serde::Serialize + ?Sized>(key: &T) -> Result<Vec<u8>> {
    let mut serializer = Serializer { output: Vec::new() };
    key.serialize(&mut serializer)?;
    Ok(serializer.output)
}

/// Deserializes a key from a binary KeyCode representation.
pub fn deserialize<'a, T: serde::Deserialize<'a>>(input: &'a [u8]) -> Result<T> {
    let mut deserializer = Deserializer::from_bytes(input);
    let t = T::deserialize(&mut deserializer)?;
    if !deserializer.input.is_empty() {
        return errdata!(
            "unexpected trailing bytes {:x?} at end of key {input:x?}",
            deserializer.input
        );
    }
    Ok(t)
}

/// Returns an error for a data type that KeyCode doesn't support.
fn unsupported<T>(kind: &str) -> Result<T> {
    errdata!("keycode does not support {kind}")
}

/// Serializes keys as binary byte vectors.
struct Serializer {
    output: Vec<u8>,
}

impl serde::Serializer for &mut Serializer {
    type Ok = ();
    type Error = Error;

    type SerializeSeq = Self;
    type SerializeTuple = Self;
    type SerializeTupleVariant = Self;
    type SerializeTupleStruct = ser::Impossible<(), Error>;
    type SerializeMap = ser::Impossible<(), Error>;
    type SerializeStruct = ser::Impossible<(), Error>;
    type SerializeStructVariant = ser::Impossible<(), Error>;

    fn serialize_bool(self, v: bool) -> Result<()> {
        self.output.push(if v { 1 } else { 0 });
        Ok(())
    }

    fn serialize_i8(self, _: i8) -> Result<()> {
        unsupported("i8")
    }

    fn serialize_i16(self, _: i16) -> Result<()> {
        unsupported("i16")
    }

    fn serialize_i32(self, _: i32) -> Result<()> {
        unsupported("i32")
    }

    fn serialize_i64(self, _: i64) -> Result<()> {
        unsupported("i64")
    }

    fn serialize_u8(self, _: u8) -> Result<()> {
        unsupported("u8")
    }

    fn serialize_u16(self, _: u16) -> Result<()> {
        unsupported("u16")
    }

    fn serialize_u32(self, _: u32) -> Result<()> {
        unsupported("u32")
    }

    fn serialize_u64(self, v: u64) -> Result<()> {
        self.output.extend(v.to_be_bytes());
        Ok(())
    }

    fn serialize_f32(self, _: f32) -> Result<()> {
        unsupported("f32")
    }

    fn serialize_f64(self, _: f64) -> Result<()> {
        unsupported("f64")
    }

    fn serialize_char(self, _: char) -> Result<()> {
        unsupported("char")
    }

    fn serialize_str(self, v: &str) -> Result<()> {
        self.serialize_bytes(v.as_bytes())
    }

    // Prefix-length encoding can't be used, since it violates ordering.
    fn serialize_bytes(self, v: &[u8]) -> Result<()> {
        self.output.reserve(v.len() + 2);
        for b in v {
            match b {
                0x00 => self.output.extend([0x00, 0xff]),
                b => self.output.push(*b),
            }
        }
        self.output.extend([0x00, 0x00]);
        Ok(())
    }

    fn serialize_none(self) -> Result<()> {
        unsupported("options")
    }

    fn serialize_some<T: serde::Serialize + ?Sized>(self, _: &T) -> Result<()> {
        unsupported("options")
    }

    fn serialize_unit(self) -> Result<()> {
        unsupported("unit")
    }

    fn serialize_unit_struct(self, _: &'static str) -> Result<()> {
        unsupported("unit structs")
    }

    fn serialize_unit_variant(self, _: &'static str, index: u32, _: &'static str) -> Result<()> {
        self.output.push(u8::try_from(index)?);
        Ok(())
    }

    fn serialize_newtype_struct<T: serde::Serialize + ?Sized>(
        self,
        _: &'static str,
        value: &T,
    ) -> Result<()> {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: serde::Serialize + ?Sized>(
        self,
        name: &'static str,
        index: u32,
        variant: &'static str,
        value: &T,
    ) -> Result<()> {
        self.serialize_unit_variant(name, index, variant)?;
        value.serialize(self)
    }

    fn serialize_seq(self, _: Option<usize>) -> Result<Self::SerializeSeq> {
        Ok(self)
    }

    fn serialize_tuple(self, _: usize) -> Result<Self::SerializeTuple> {
        Ok(self)
    }

    fn serialize_tuple_struct(
        self,
        _: &'static str,
        _: usize,
    ) -> Result<Self::SerializeTupleStruct> {
        unsupported("tuple structs")
    }

    fn serialize_tuple_variant(
        self,
        name: &'static str,
        index: u32,
        variant: &'static str,
        _: usize,
    ) -> Result<Self::SerializeTupleVariant> {
        self.serialize_unit_variant(name, index, variant)?;
        Ok(self)
    }

    fn serialize_map(self, _: Option<usize>) -> Result<Self::SerializeMap> {
        unsupported("maps")
    }

    fn serialize_struct(self, _: &'static str, _: usize) -> Result<Self::SerializeStruct> {
        unsupported("structs")
    }

    fn serialize_struct_variant(
        self,
        _: &'static str,
        _: u32,
        _: &'static str,
        _: usize,
    ) -> Result<Self::SerializeStructVariant> {
        unsupported("struct variants")
    }
}

impl ser::SerializeSeq for &mut Serializer {
    type Ok = ();
    type Error = Error;

    fn serialize_element<T: serde::Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<()> {
        Ok(())
    }
}

impl ser::SerializeTuple for &mut Serializer {
    type Ok = ();
    type Error = Error;

    fn serialize_element<T: serde::Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<()> {
        Ok(())
    }
}

impl ser::SerializeTupleVariant for &mut Serializer {
    type Ok = ();
    type Error = Error;

    fn serialize_field<T: serde::Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        value.serialize(&mut **self)
    }

    fn end(self) -> Result<()> {
        Ok(())
    }
}

/// Deserializes keys from byte slices into a given type.
pub struct Deserializer<'de> {
    input: &'de [u8],
}

impl<'de> Deserializer<'de> {
    /// Creates a deserializer for a byte slice.
    pub fn from_bytes(input: &'de [u8]) -> Self {
        Deserializer { input }
    }

    /// Chops off and returns the next len bytes of the byte slice, or errors
    /// if there aren't enough bytes left.
    fn take_bytes(&mut self, len: usize) -> Result<&'de [u8]> {
        if self.input.len() < len {
            return errdata!("insufficient bytes, expected {len} bytes for {:x?}", self.input);
        }
        let (bytes, rest) = self.input.split_at(len);
        self.input = rest;
        Ok(bytes)
    }

    /// Decodes and chops off the next encoded byte slice.
    fn decode_next_bytes(&mut self) -> Result<Vec<u8>> {
        let mut decoded = Vec::new();
        let mut iter = self.input.iter().enumerate();
        let taken = loop {
            match iter.next() {
                Some((_, 0x00)) => match iter.next() {
                    Some((i, 0x00)) => break i + 1,        // terminator
                    Some((_, 0xff)) => decoded.push(0x00), // escaped 0x00
                    _ => return errdata!("invalid escape sequence"),
                },
                Some((_, b)) => decoded.push(*b),
                None => return errdata!("unexpected end of input"),
            }
        };
        self.input = &self.input[taken..];
        Ok(decoded)
    }
}

impl<'de> serde::Deserializer<'de> for &mut Deserializer<'de> {
    type Error = Error;

    fn deserialize_any<V: de::Visitor<'de>>(self, _: V) -> Result<V::Value> {
        errdata!("must provide type, keycode is not self-describing")
    }

    fn deserialize_bool<V: de::Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        visitor.visit_bool(match self.take_bytes(1)?[0] {
            0x00 => false,
            0x01 => true,
            b => return errdata!("invalid boolean value {b}"),
        })
    }

    fn deserialize_i8<V: de::Visitor<'de>>(self, _: V) -> Result<V::Value> {
        unsupported("i8")
    }

    fn deserialize_i16<V: de::Visitor<'de>>(self, _: V) -> Result<V::Value> {
        unsupported("i16")
    }

    fn deserialize_i32<V: de::Visitor<'de>>(self, _: V) -> Result<V::Value> {
        unsupported("i32")
    }

    fn deserialize_i64<V: de::Visitor<'de>>(self, _: V) -> Result<V::Value> {
        unsupported("i64")
    }

    fn deserialize_u8<V: de::Visitor<'de>>(self, _: V) -> Result<V::Value> {
        unsupported("u8")
    }

    fn deserialize_u16<V: de::Visitor<'de>>(self, _: V) -> Result<V::Value> {
        unsupported("u16")
    }

    fn deserialize_u32<V: de::Visitor<'de>>(self, _: V) -> Result<V::Value> {
        unsupported("u32")
    }

    fn deserialize_u64<V: de::Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        visitor.visit_u64(u64::from_be_bytes(self.take_bytes(8)?.try_into()?))
    }

    fn deserialize_f32<V: de::Visitor<'de>>(self, _: V) -> Result<V::Value> {
        unsupported("f32")
    }

    fn deserialize_f64<V: de::Visitor<'de>>(self, _: V) -> Result<V::Value> {
        unsupported("f64")
    }

    fn deserialize_char<V: de::Visitor<'de>>(self, _: V) -> Result<V::Value> {
        unsupported("char")
    }

    fn deserialize_str<V: de::Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        let bytes = self.decode_next_bytes()?;
        visitor.visit_str(&String::from_utf8(bytes)?)
    }

    fn deserialize_string<V: de::Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        let bytes = self.decode_next_bytes()?;
        visitor.visit_string(String::from_utf8(bytes)?)
    }

    fn deserialize_bytes<V: de::Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        let bytes = self.decode_next_bytes()?;
        visitor.visit_bytes(&bytes)
    }

    fn deserialize_byte_buf<V: de::Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        let bytes = self.decode_next_bytes()?;
        visitor.visit_byte_buf(bytes)
    }

    fn deserialize_option<V: de::Visitor<'de>>(self, _: V) -> Result<V::Value> {
        unsupported("options")
    }

    fn deserialize_unit<V: de::Visitor<'de>>(self, _: V) -> Result<V::Value> {
        unsupported("unit")
    }

    fn deserialize_unit_struct<V: de::Visitor<'de>>(
        self,
        _: &'static str,
        _: V,
    ) -> Result<V::Value> {
        unsupported("unit structs")
    }

    fn deserialize_newtype_struct<V: de::Visitor<'de>>(
        self,
        _: &'static str,
        visitor: V,
    ) -> Result<V::Value> {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_seq<V: de::Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        visitor.visit_seq(self)
    }

    fn deserialize_tuple<V: de::Visitor<'de>>(self, _: usize, visitor: V) -> Result<V::Value> {
        visitor.visit_seq(self)
    }

    fn deserialize_tuple_struct<V: de::Visitor<'de>>(
        self,
        _: &'static str,
        _: usize,
        _: V,
    ) -> Result<V::Value> {
        unsupported("tuple structs")
    }

    fn deserialize_map<V: de::Visitor<'de>>(self, _: V) -> Result<V::Value> {
        unsupported("maps")
    }

    fn deserialize_struct<V: de::Visitor<'de>>(
        self,
        _: &'static str,
        _: &'static [&'static str],
        _: V,
    ) -> Result<V::Value> {
        unsupported("structs")
    }

    fn deserialize_enum<V: de::Visitor<'de>>(
        self,
        _: &'static str,
        _: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value> {
        visitor.visit_enum(self)
    }

    fn deserialize_identifier<V: de::Visitor<'de>>(self, _: V) -> Result<V::Value> {
        unsupported("identifiers")
    }

    fn deserialize_ignored_any<V: de::Visitor<'de>>(self, _: V) -> Result<V::Value> {
        unsupported("ignored values")
    }
}

// Sequences are deserialized until the byte slice is exhausted, so they can
// only appear as the last element of a key.
impl<'de> de::SeqAccess<'de> for Deserializer<'de> {
    type Error = Error;

    fn next_element_seed<T: de::DeserializeSeed<'de>>(
        &mut self,
        seed: T,
    ) -> Result<Option<T::Value>> {
        if self.input.is_empty() {
            return Ok(None);
        }
        seed.deserialize(self).map(Some)
    }
}

impl<'de> de::EnumAccess<'de> for &mut Deserializer<'de> {
    type Error = Error;
    type Variant = Self;

    fn variant_seed<V: de::DeserializeSeed<'de>>(
        self,
        seed: V,
    ) -> Result<(V::Value, Self::Variant)> {
        let index = self.take_bytes(1)?[0] as u32;
        let value: Result<_> = seed.deserialize(index.into_deserializer());
        Ok((value?, self))
    }
}

impl<'de> de::VariantAccess<'de> for &mut Deserializer<'de> {
    type Error = Error;

    fn unit_variant(self) -> Result<()> {
        Ok(())
    }

    fn newtype_variant_seed<T: de::DeserializeSeed<'de>>(self, seed: T) -> Result<T::Value> {
        seed.deserialize(&mut *self)
    }

    fn tuple_variant<V: de::Visitor<'de>>(self, _: usize, visitor: V) -> Result<V::Value> {
        visitor.visit_seq(self)
    }

    fn struct_variant<V: de::Visitor<'de>>(
        self,
        _: &'static [&'static str],
        _: V,
    ) -> Result<V::Value> {
        unsupported("struct variants")
    }
}
