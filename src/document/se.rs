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

//! serde serializer producing a [`Value`] tree.

use {
	super::{Value, Document, ObjectId, Timestamp, OBJECT_ID_NEWTYPE, TIMESTAMP_NEWTYPE, DATE_TIME_NEWTYPE},
	std::fmt,
	serde::{Serialize, ser}
};

#[derive(Debug)]
pub enum Error {
	/// The root value did not serialize to a document.
	NotADocument(Value),
	/// Map keys must be strings.
	KeyNotAString,
	Custom(String)
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		<Self as fmt::Debug>::fmt(self, f)
	}
}

impl std::error::Error for Error {}

impl ser::Error for Error {
	fn custom<T: fmt::Display>(msg: T) -> Self {
		Self::Custom(msg.to_string())
	}
}

type Result<T> = std::result::Result<T, Error>;

/// Serializes any value to a [`Value`].
pub struct DocumentSerializer;

impl ser::Serializer for DocumentSerializer {
	type Ok = Value;
	type Error = Error;
	type SerializeSeq = SerializeArray;
	type SerializeTuple = SerializeArray;
	type SerializeTupleStruct = SerializeArray;
	type SerializeTupleVariant = SerializeVariant<SerializeArray>;
	type SerializeMap = SerializeDocument;
	type SerializeStruct = SerializeDocument;
	type SerializeStructVariant = SerializeVariant<SerializeDocument>;

	fn serialize_bool(self, v: bool) -> Result<Value> { Ok(Value::Bool(v)) }

	fn serialize_i8(self, v: i8) -> Result<Value> { Ok(Value::I32(v as i32)) }

	fn serialize_i16(self, v: i16) -> Result<Value> { Ok(Value::I32(v as i32)) }

	fn serialize_i32(self, v: i32) -> Result<Value> { Ok(Value::I32(v)) }

	fn serialize_i64(self, v: i64) -> Result<Value> { Ok(Value::I64(v)) }

	fn serialize_u8(self, v: u8) -> Result<Value> { Ok(Value::I32(v as i32)) }

	fn serialize_u16(self, v: u16) -> Result<Value> { Ok(Value::I32(v as i32)) }

	fn serialize_u32(self, v: u32) -> Result<Value> { Ok(Value::I64(v as i64)) }

	fn serialize_u64(self, v: u64) -> Result<Value> { Ok(Value::I64(v as i64)) }

	fn serialize_f32(self, v: f32) -> Result<Value> { Ok(Value::F64(v as f64)) }

	fn serialize_f64(self, v: f64) -> Result<Value> { Ok(Value::F64(v)) }

	fn serialize_char(self, v: char) -> Result<Value> { Ok(Value::String(v.to_string())) }

	fn serialize_str(self, v: &str) -> Result<Value> { Ok(Value::String(v.to_string())) }

	fn serialize_bytes(self, v: &[u8]) -> Result<Value> { Ok(Value::Binary(v.to_vec())) }

	fn serialize_none(self) -> Result<Value> { Ok(Value::Null) }

	fn serialize_some<T: ?Sized + Serialize>(self, value: &T) -> Result<Value> {
		value.serialize(self)
	}

	fn serialize_unit(self) -> Result<Value> { Ok(Value::Null) }

	fn serialize_unit_struct(self, _name: &'static str) -> Result<Value> { Ok(Value::Null) }

	fn serialize_unit_variant(self, _name: &'static str, _index: u32, variant: &'static str) -> Result<Value> {
		Ok(Value::String(variant.to_string()))
	}

	fn serialize_newtype_struct<T: ?Sized + Serialize>(self, name: &'static str, value: &T) -> Result<Value> {
		let inner = value.serialize(DocumentSerializer)?;
		Ok(match (name, inner) {
			(OBJECT_ID_NEWTYPE, Value::String(hex)) => Value::ObjectId(ObjectId::from_hex(&hex)
				.ok_or(Error::Custom("invalid object id".to_string()))?),
			(TIMESTAMP_NEWTYPE, Value::I64(bits)) => Value::Timestamp(Timestamp {
				time:      (bits as u64 >> 32) as u32,
				increment: bits as u32
			}),
			(DATE_TIME_NEWTYPE, Value::I64(millis)) => Value::DateTime(millis),
			(_, inner) => inner
		})
	}

	fn serialize_newtype_variant<T: ?Sized + Serialize>(
		self,
		_name:   &'static str,
		_index:  u32,
		variant: &'static str,
		value:   &T
	) -> Result<Value> {
		let mut doc = Document::new();
		doc.insert(variant, value.serialize(DocumentSerializer)?);
		Ok(Value::Document(doc))
	}

	fn serialize_seq(self, len: Option<usize>) -> Result<SerializeArray> {
		Ok(SerializeArray(Vec::with_capacity(len.unwrap_or(0))))
	}

	fn serialize_tuple(self, len: usize) -> Result<SerializeArray> {
		self.serialize_seq(Some(len))
	}

	fn serialize_tuple_struct(self, _name: &'static str, len: usize) -> Result<SerializeArray> {
		self.serialize_seq(Some(len))
	}

	fn serialize_tuple_variant(
		self,
		_name:   &'static str,
		_index:  u32,
		variant: &'static str,
		len:     usize
	) -> Result<Self::SerializeTupleVariant> {
		Ok(SerializeVariant { variant, inner: SerializeArray(Vec::with_capacity(len)) })
	}

	fn serialize_map(self, _len: Option<usize>) -> Result<SerializeDocument> {
		Ok(SerializeDocument { doc: Document::new(), key: None })
	}

	fn serialize_struct(self, _name: &'static str, _len: usize) -> Result<SerializeDocument> {
		self.serialize_map(None)
	}

	fn serialize_struct_variant(
		self,
		_name:   &'static str,
		_index:  u32,
		variant: &'static str,
		_len:    usize
	) -> Result<Self::SerializeStructVariant> {
		Ok(SerializeVariant { variant, inner: SerializeDocument { doc: Document::new(), key: None } })
	}
}

pub struct SerializeArray(Vec<Value>);

impl ser::SerializeSeq for SerializeArray {
	type Ok = Value;
	type Error = Error;

	fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<()> {
		self.0.push(value.serialize(DocumentSerializer)?);
		Ok(())
	}

	fn end(self) -> Result<Value> {
		Ok(Value::Array(self.0))
	}
}

impl ser::SerializeTuple for SerializeArray {
	type Ok = Value;
	type Error = Error;

	fn serialize_element<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<()> {
		ser::SerializeSeq::serialize_element(self, value)
	}

	fn end(self) -> Result<Value> {
		ser::SerializeSeq::end(self)
	}
}

impl ser::SerializeTupleStruct for SerializeArray {
	type Ok = Value;
	type Error = Error;

	fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<()> {
		ser::SerializeSeq::serialize_element(self, value)
	}

	fn end(self) -> Result<Value> {
		ser::SerializeSeq::end(self)
	}
}

pub struct SerializeDocument {
	doc: Document,
	key: Option<String>
}

impl ser::SerializeMap for SerializeDocument {
	type Ok = Value;
	type Error = Error;

	fn serialize_key<T: ?Sized + Serialize>(&mut self, key: &T) -> Result<()> {
		self.key = Some(match key.serialize(DocumentSerializer)? {
			Value::String(s) => s,
			_ => return Err(Error::KeyNotAString)
		});
		Ok(())
	}

	fn serialize_value<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<()> {
		let key = self.key.take().ok_or(Error::KeyNotAString)?;
		self.doc.insert(key, value.serialize(DocumentSerializer)?);
		Ok(())
	}

	fn end(self) -> Result<Value> {
		Ok(Value::Document(self.doc))
	}
}

impl ser::SerializeStruct for SerializeDocument {
	type Ok = Value;
	type Error = Error;

	fn serialize_field<T: ?Sized + Serialize>(&mut self, key: &'static str, value: &T) -> Result<()> {
		self.doc.insert(key, value.serialize(DocumentSerializer)?);
		Ok(())
	}

	fn skip_field(&mut self, _key: &'static str) -> Result<()> {
		Ok(())
	}

	fn end(self) -> Result<Value> {
		Ok(Value::Document(self.doc))
	}
}

pub struct SerializeVariant<S> {
	variant: &'static str,
	inner:   S
}

impl ser::SerializeTupleVariant for SerializeVariant<SerializeArray> {
	type Ok = Value;
	type Error = Error;

	fn serialize_field<T: ?Sized + Serialize>(&mut self, value: &T) -> Result<()> {
		ser::SerializeSeq::serialize_element(&mut self.inner, value)
	}

	fn end(self) -> Result<Value> {
		let mut doc = Document::new();
		doc.insert(self.variant, ser::SerializeSeq::end(self.inner)?);
		Ok(Value::Document(doc))
	}
}

impl ser::SerializeStructVariant for SerializeVariant<SerializeDocument> {
	type Ok = Value;
	type Error = Error;

	fn serialize_field<T: ?Sized + Serialize>(&mut self, key: &'static str, value: &T) -> Result<()> {
		ser::SerializeStruct::serialize_field(&mut self.inner, key, value)
	}

	fn end(self) -> Result<Value> {
		let mut doc = Document::new();
		doc.insert(self.variant, ser::SerializeStruct::end(self.inner)?);
		Ok(Value::Document(doc))
	}
}
