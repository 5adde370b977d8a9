// MIT License
//
// Copyright (c) 2019-2021 Tobias Pfeiffer
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

//! serde deserializer reading from a [`Value`] tree.

use {
	super::{Value, OBJECT_ID_NEWTYPE, TIMESTAMP_NEWTYPE, DATE_TIME_NEWTYPE},
	std::fmt,
	serde::de::{self, Deserializer, Visitor, IntoDeserializer}
};

#[derive(Debug)]
pub enum Error {
	/// A value of an unexpected type was encountered.
	UnexpectedType { expected: &'static str, found: String },
	Custom(String)
}

impl Error {
	fn unexpected(expected: &'static str, found: &Value) -> Self {
		Self::UnexpectedType { expected, found: format!("{:?}", found) }
	}
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		<Self as fmt::Debug>::fmt(self, f)
	}
}

impl std::error::Error for Error {}

impl de::Error for Error {
	fn custom<T: fmt::Display>(msg: T) -> Self {
		Self::Custom(msg.to_string())
	}
}

type Result<T> = std::result::Result<T, Error>;

/// Deserializes from an owned [`Value`].
pub struct DocumentDeserializer(pub Value);

impl<'de> de::Deserializer<'de> for DocumentDeserializer {
	type Error = Error;

	fn deserialize_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
		match self.0 {
			Value::Null         => visitor.visit_unit(),
			Value::Bool(v)      => visitor.visit_bool(v),
			Value::I32(v)       => visitor.visit_i32(v),
			Value::I64(v)       => visitor.visit_i64(v),
			Value::F64(v)       => visitor.visit_f64(v),
			Value::String(v)    => visitor.visit_string(v),
			Value::Binary(v)    => visitor.visit_byte_buf(v),
			Value::ObjectId(v)  => visitor.visit_map(MagicAccess::new(OBJECT_ID_NEWTYPE, Value::String(v.to_hex()))),
			Value::DateTime(v)  => visitor.visit_map(MagicAccess::new(DATE_TIME_NEWTYPE, Value::I64(v))),
			Value::Timestamp(v) => visitor.visit_map(MagicAccess::new(TIMESTAMP_NEWTYPE, Value::I64(v.to_bits()))),
			Value::Array(v)     => visitor.visit_seq(ArrayAccess(v.into_iter())),
			Value::Document(v)  => visitor.visit_map(DocAccess { iter: v.into_iter(), value: None })
		}
	}

	fn deserialize_bool<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
		match self.0 {
			Value::Bool(v) => visitor.visit_bool(v),
			v => Err(Error::unexpected("bool", &v))
		}
	}

	fn deserialize_i8<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
		self.deserialize_i64(visitor)
	}

	fn deserialize_i16<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
		self.deserialize_i64(visitor)
	}

	fn deserialize_i32<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
		self.deserialize_i64(visitor)
	}

	fn deserialize_i64<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
		match self.0 {
			Value::I32(v)       => visitor.visit_i32(v),
			Value::I64(v)       => visitor.visit_i64(v),
			Value::F64(v) if v.fract() == 0.0 => visitor.visit_i64(v as i64),
			Value::DateTime(v)  => visitor.visit_i64(v),
			Value::Timestamp(v) => visitor.visit_i64(v.to_bits()),
			v => Err(Error::unexpected("integer", &v))
		}
	}

	fn deserialize_u8<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
		self.deserialize_i64(visitor)
	}

	fn deserialize_u16<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
		self.deserialize_i64(visitor)
	}

	fn deserialize_u32<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
		self.deserialize_i64(visitor)
	}

	fn deserialize_u64<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
		self.deserialize_i64(visitor)
	}

	fn deserialize_f32<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
		self.deserialize_f64(visitor)
	}

	fn deserialize_f64<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
		match self.0 {
			Value::I32(v) => visitor.visit_i32(v),
			Value::I64(v) => visitor.visit_i64(v),
			Value::F64(v) => visitor.visit_f64(v),
			v => Err(Error::unexpected("double", &v))
		}
	}

	fn deserialize_char<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
		self.deserialize_str(visitor)
	}

	fn deserialize_str<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
		match self.0 {
			Value::String(v) => visitor.visit_string(v),
			v => Err(Error::unexpected("string", &v))
		}
	}

	fn deserialize_string<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
		self.deserialize_str(visitor)
	}

	fn deserialize_bytes<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
		match self.0 {
			Value::Binary(v) => visitor.visit_byte_buf(v),
			v => Err(Error::unexpected("binary", &v))
		}
	}

	fn deserialize_byte_buf<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
		self.deserialize_bytes(visitor)
	}

	fn deserialize_option<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
		match self.0 {
			Value::Null => visitor.visit_none(),
			_ => visitor.visit_some(self)
		}
	}

	fn deserialize_unit<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
		match self.0 {
			Value::Null => visitor.visit_unit(),
			v => Err(Error::unexpected("null", &v))
		}
	}

	fn deserialize_unit_struct<V: Visitor<'de>>(self, _name: &'static str, visitor: V) -> Result<V::Value> {
		self.deserialize_unit(visitor)
	}

	fn deserialize_newtype_struct<V: Visitor<'de>>(self, name: &'static str, visitor: V) -> Result<V::Value> {
		match (name, self.0) {
			(OBJECT_ID_NEWTYPE, Value::ObjectId(oid))  => visitor.visit_byte_buf(oid.0.to_vec()),
			(OBJECT_ID_NEWTYPE, Value::String(hex))    => visitor.visit_string(hex),
			(TIMESTAMP_NEWTYPE, Value::Timestamp(ts))  => visitor.visit_i64(ts.to_bits()),
			(TIMESTAMP_NEWTYPE, Value::I64(bits))      => visitor.visit_i64(bits),
			(DATE_TIME_NEWTYPE, Value::DateTime(v))    => visitor.visit_i64(v),
			(DATE_TIME_NEWTYPE, Value::I64(v))         => visitor.visit_i64(v),
			(_, v) => visitor.visit_newtype_struct(DocumentDeserializer(v))
		}
	}

	fn deserialize_seq<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
		match self.0 {
			Value::Array(v) => visitor.visit_seq(ArrayAccess(v.into_iter())),
			v => Err(Error::unexpected("array", &v))
		}
	}

	fn deserialize_tuple<V: Visitor<'de>>(self, _len: usize, visitor: V) -> Result<V::Value> {
		self.deserialize_seq(visitor)
	}

	fn deserialize_tuple_struct<V: Visitor<'de>>(self, _name: &'static str, _len: usize, visitor: V) -> Result<V::Value> {
		self.deserialize_seq(visitor)
	}

	fn deserialize_map<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
		match self.0 {
			Value::Document(v) => visitor.visit_map(DocAccess { iter: v.into_iter(), value: None }),
			v => Err(Error::unexpected("document", &v))
		}
	}

	fn deserialize_struct<V: Visitor<'de>>(
		self,
		_name:   &'static str,
		_fields: &'static [&'static str],
		visitor: V
	) -> Result<V::Value> {
		self.deserialize_map(visitor)
	}

	fn deserialize_enum<V: Visitor<'de>>(
		self,
		_name:     &'static str,
		_variants: &'static [&'static str],
		visitor:   V
	) -> Result<V::Value> {
		match self.0 {
			Value::String(s) => visitor.visit_enum(s.into_deserializer()),
			Value::Document(doc) => {
				let mut iter = doc.into_iter();
				let (variant, value) = match (iter.next(), iter.next()) {
					(Some(entry), None) => entry,
					_ => return Err(Error::Custom("expected a single-key document".to_string()))
				};
				visitor.visit_enum(EnumAccess { variant, value })
			}
			v => Err(Error::unexpected("enum", &v))
		}
	}

	fn deserialize_identifier<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
		self.deserialize_str(visitor)
	}

	fn deserialize_ignored_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
		visitor.visit_unit()
	}
}

struct ArrayAccess(std::vec::IntoIter<Value>);

impl<'de> de::SeqAccess<'de> for ArrayAccess {
	type Error = Error;

	fn next_element_seed<T: de::DeserializeSeed<'de>>(&mut self, seed: T) -> Result<Option<T::Value>> {
		match self.0.next() {
			Some(v) => seed.deserialize(DocumentDeserializer(v)).map(Some),
			None => Ok(None)
		}
	}

	fn size_hint(&self) -> Option<usize> {
		Some(self.0.len())
	}
}

struct DocAccess {
	iter:  std::vec::IntoIter<(String, Value)>,
	value: Option<Value>
}

impl<'de> de::MapAccess<'de> for DocAccess {
	type Error = Error;

	fn next_key_seed<K: de::DeserializeSeed<'de>>(&mut self, seed: K) -> Result<Option<K::Value>> {
		match self.iter.next() {
			Some((k, v)) => {
				self.value = Some(v);
				seed.deserialize(DocumentDeserializer(Value::String(k))).map(Some)
			}
			None => Ok(None)
		}
	}

	fn next_value_seed<V: de::DeserializeSeed<'de>>(&mut self, seed: V) -> Result<V::Value> {
		match self.value.take() {
			Some(v) => seed.deserialize(DocumentDeserializer(v)),
			None => Err(Error::Custom("value without key".to_string()))
		}
	}

	fn size_hint(&self) -> Option<usize> {
		Some(self.iter.len())
	}
}

/// A single-entry map access used to surface extended types to generic
/// visitors, mirroring the magic-key convention of the serializer.
struct MagicAccess {
	key:   Option<&'static str>,
	value: Option<Value>
}

impl MagicAccess {
	fn new(key: &'static str, value: Value) -> Self {
		Self { key: Some(key), value: Some(value) }
	}
}

impl<'de> de::MapAccess<'de> for MagicAccess {
	type Error = Error;

	fn next_key_seed<K: de::DeserializeSeed<'de>>(&mut self, seed: K) -> Result<Option<K::Value>> {
		match self.key.take() {
			Some(k) => seed.deserialize(DocumentDeserializer(Value::String(k.to_string()))).map(Some),
			None => Ok(None)
		}
	}

	fn next_value_seed<V: de::DeserializeSeed<'de>>(&mut self, seed: V) -> Result<V::Value> {
		match self.value.take() {
			Some(v) => seed.deserialize(DocumentDeserializer(v)),
			None => Err(Error::Custom("value without key".to_string()))
		}
	}
}

struct EnumAccess {
	variant: String,
	value:   Value
}

impl<'de> de::EnumAccess<'de> for EnumAccess {
	type Error = Error;
	type Variant = VariantAccess;

	fn variant_seed<V: de::DeserializeSeed<'de>>(self, seed: V) -> Result<(V::Value, VariantAccess)> {
		let variant = seed.deserialize(DocumentDeserializer(Value::String(self.variant)))?;
		Ok((variant, VariantAccess(self.value)))
	}
}

struct VariantAccess(Value);

impl<'de> de::VariantAccess<'de> for VariantAccess {
	type Error = Error;

	fn unit_variant(self) -> Result<()> {
		Ok(())
	}

	fn newtype_variant_seed<T: de::DeserializeSeed<'de>>(self, seed: T) -> Result<T::Value> {
		seed.deserialize(DocumentDeserializer(self.0))
	}

	fn tuple_variant<V: Visitor<'de>>(self, _len: usize, visitor: V) -> Result<V::Value> {
		DocumentDeserializer(self.0).deserialize_seq(visitor)
	}

	fn struct_variant<V: Visitor<'de>>(self, _fields: &'static [&'static str], visitor: V) -> Result<V::Value> {
		DocumentDeserializer(self.0).deserialize_map(visitor)
	}
}
