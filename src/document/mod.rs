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

//! The core's in-memory document representation.
//!
//! Wire-level BSON encoding is the transport collaborator's concern, commands
//! and replies cross the transport seam as already-decoded [`Document`] trees.

use {
	std::{fmt, iter::FromIterator},
	serde::{Serialize, Deserialize, Serializer, Deserializer, de::DeserializeOwned}
};

pub mod se;
pub mod de;

/// A single value in a [`Document`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
	Null,
	Bool(bool),
	I32(i32),
	I64(i64),
	F64(f64),
	String(String),
	Binary(Vec<u8>),
	ObjectId(ObjectId),
	/// Milliseconds since the unix epoch.
	DateTime(i64),
	Timestamp(Timestamp),
	Array(Vec<Value>),
	Document(Document)
}

impl Value {
	pub fn as_bool(&self) -> Option<bool> {
		match self {
			Self::Bool(v) => Some(*v),
			_ => None
		}
	}

	pub fn as_i64(&self) -> Option<i64> {
		match self {
			Self::I32(v) => Some(*v as i64),
			Self::I64(v) => Some(*v),
			_ => None
		}
	}

	pub fn as_f64(&self) -> Option<f64> {
		match self {
			Self::I32(v) => Some(*v as f64),
			Self::I64(v) => Some(*v as f64),
			Self::F64(v) => Some(*v),
			_ => None
		}
	}

	pub fn as_str(&self) -> Option<&str> {
		match self {
			Self::String(v) => Some(v),
			_ => None
		}
	}

	pub fn as_document(&self) -> Option<&Document> {
		match self {
			Self::Document(v) => Some(v),
			_ => None
		}
	}

	pub fn as_array(&self) -> Option<&[Value]> {
		match self {
			Self::Array(v) => Some(v),
			_ => None
		}
	}

	pub fn as_timestamp(&self) -> Option<Timestamp> {
		match self {
			Self::Timestamp(v) => Some(*v),
			_ => None
		}
	}
}

impl From<bool> for Value { fn from(v: bool) -> Self { Self::Bool(v) } }
impl From<i32> for Value { fn from(v: i32) -> Self { Self::I32(v) } }
impl From<i64> for Value { fn from(v: i64) -> Self { Self::I64(v) } }
impl From<f64> for Value { fn from(v: f64) -> Self { Self::F64(v) } }
impl From<&str> for Value { fn from(v: &str) -> Self { Self::String(v.to_string()) } }
impl From<String> for Value { fn from(v: String) -> Self { Self::String(v) } }
impl From<Vec<u8>> for Value { fn from(v: Vec<u8>) -> Self { Self::Binary(v) } }
impl From<ObjectId> for Value { fn from(v: ObjectId) -> Self { Self::ObjectId(v) } }
impl From<Timestamp> for Value { fn from(v: Timestamp) -> Self { Self::Timestamp(v) } }
impl From<Vec<Value>> for Value { fn from(v: Vec<Value>) -> Self { Self::Array(v) } }
impl From<Document> for Value { fn from(v: Document) -> Self { Self::Document(v) } }

impl Serialize for Value {
	fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
		match self {
			Self::Null         => serializer.serialize_none(),
			Self::Bool(v)      => serializer.serialize_bool(*v),
			Self::I32(v)       => serializer.serialize_i32(*v),
			Self::I64(v)       => serializer.serialize_i64(*v),
			Self::F64(v)       => serializer.serialize_f64(*v),
			Self::String(v)    => serializer.serialize_str(v),
			Self::Binary(v)    => serializer.serialize_bytes(v),
			Self::ObjectId(v)  => v.serialize(serializer),
			Self::DateTime(v)  => serializer.serialize_newtype_struct(DATE_TIME_NEWTYPE, v),
			Self::Timestamp(v) => v.serialize(serializer),
			Self::Array(v)     => v.serialize(serializer),
			Self::Document(v)  => v.serialize(serializer)
		}
	}
}

impl<'de> Deserialize<'de> for Value {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
		deserializer.deserialize_any(ValueVisitor)
	}
}

struct ValueVisitor;

impl<'de> serde::de::Visitor<'de> for ValueVisitor {
	type Value = Value;

	fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str("a document value")
	}

	fn visit_bool<E>(self, v: bool) -> std::result::Result<Value, E> { Ok(Value::Bool(v)) }

	fn visit_i32<E>(self, v: i32) -> std::result::Result<Value, E> { Ok(Value::I32(v)) }

	fn visit_i64<E>(self, v: i64) -> std::result::Result<Value, E> { Ok(Value::I64(v)) }

	fn visit_u64<E: serde::de::Error>(self, v: u64) -> std::result::Result<Value, E> { Ok(Value::I64(v as i64)) }

	fn visit_f64<E>(self, v: f64) -> std::result::Result<Value, E> { Ok(Value::F64(v)) }

	fn visit_str<E: serde::de::Error>(self, v: &str) -> std::result::Result<Value, E> { Ok(Value::String(v.to_string())) }

	fn visit_string<E>(self, v: String) -> std::result::Result<Value, E> { Ok(Value::String(v)) }

	fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> std::result::Result<Value, E> { Ok(Value::Binary(v.to_vec())) }

	fn visit_byte_buf<E>(self, v: Vec<u8>) -> std::result::Result<Value, E> { Ok(Value::Binary(v)) }

	fn visit_unit<E>(self) -> std::result::Result<Value, E> { Ok(Value::Null) }

	fn visit_none<E>(self) -> std::result::Result<Value, E> { Ok(Value::Null) }

	fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> std::result::Result<Value, D::Error> {
		deserializer.deserialize_any(self)
	}

	fn visit_seq<A: serde::de::SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<Value, A::Error> {
		let mut vec = Vec::new();
		while let Some(v) = seq.next_element()? {
			vec.push(v);
		}
		Ok(Value::Array(vec))
	}

	fn visit_map<A: serde::de::MapAccess<'de>>(self, mut map: A) -> std::result::Result<Value, A::Error> {
		let mut doc = Document::new();
		while let Some((k, v)) = map.next_entry::<String, Value>()? {
			doc.insert(k, v);
		}

		// single magic-key documents carry the extended types through serde

		if doc.len() == 1 {
			match doc.iter().next() {
				Some((OBJECT_ID_NEWTYPE, Value::String(hex))) => if let Some(oid) = ObjectId::from_hex(hex) {
					return Ok(Value::ObjectId(oid));
				}
				Some((TIMESTAMP_NEWTYPE, Value::I64(bits))) => return Ok(Value::Timestamp(Timestamp {
					time:      (*bits as u64 >> 32) as u32,
					increment: *bits as u32
				})),
				Some((DATE_TIME_NEWTYPE, Value::I64(millis))) => return Ok(Value::DateTime(*millis)),
				_ => ()
			}
		}

		Ok(Value::Document(doc))
	}
}

pub(crate) const OBJECT_ID_NEWTYPE: &str = "$oid";
pub(crate) const TIMESTAMP_NEWTYPE: &str = "$timestamp";
pub(crate) const DATE_TIME_NEWTYPE: &str = "$date";

/// An ordered map of keys to [`Value`]s. Key order is preserved, duplicate
/// keys are not rejected, lookup returns the first match.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Document(Vec<(String, Value)>);

impl Document {
	pub fn new() -> Self {
		Self(Vec::new())
	}

	/// Serializes `value` into its document form.
	pub fn from(value: &impl Serialize) -> std::result::Result<Self, se::Error> {
		match value.serialize(se::DocumentSerializer)? {
			Value::Document(doc) => Ok(doc),
			v => Err(se::Error::NotADocument(v))
		}
	}

	/// Deserializes this document into `T`.
	pub fn deserialize<T: DeserializeOwned>(&self) -> std::result::Result<T, de::Error> {
		T::deserialize(de::DocumentDeserializer(Value::Document(self.clone())))
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
		self.0.push((key.into(), value.into()));
	}

	pub fn get(&self, key: &str) -> Option<&Value> {
		self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
	}

	pub fn get_str(&self, key: &str) -> Option<&str> {
		self.get(key).and_then(Value::as_str)
	}

	pub fn get_i64(&self, key: &str) -> Option<i64> {
		self.get(key).and_then(Value::as_i64)
	}

	pub fn get_document(&self, key: &str) -> Option<&Document> {
		self.get(key).and_then(Value::as_document)
	}

	pub fn remove(&mut self, key: &str) -> Option<Value> {
		self.0.iter()
			.position(|(k, _)| k == key)
			.map(|i| self.0.remove(i).1)
	}

	pub fn contains_key(&self, key: &str) -> bool {
		self.get(key).is_some()
	}

	/// The name of the command this document encodes, i.e. its first key.
	pub fn command_name(&self) -> Option<&str> {
		self.0.first().map(|(k, _)| k.as_str())
	}

	pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
		self.0.iter().map(|(k, v)| (k.as_str(), v))
	}
}

impl IntoIterator for Document {
	type Item = (String, Value);
	type IntoIter = std::vec::IntoIter<(String, Value)>;

	fn into_iter(self) -> Self::IntoIter {
		self.0.into_iter()
	}
}

impl FromIterator<(String, Value)> for Document {
	fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
		Self(iter.into_iter().collect())
	}
}

impl Serialize for Document {
	fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
		use serde::ser::SerializeMap;
		let mut map = serializer.serialize_map(Some(self.0.len()))?;
		for (k, v) in &self.0 {
			map.serialize_entry(k, v)?;
		}
		map.end()
	}
}

impl<'de> Deserialize<'de> for Document {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
		match Value::deserialize(deserializer)? {
			Value::Document(doc) => Ok(doc),
			v => Err(serde::de::Error::custom(format_args!("expected a document, found {:?}", v)))
		}
	}
}

/// A 12-byte unique id.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct ObjectId(pub [u8; 12]);

impl ObjectId {
	/// Generates a random id.
	pub fn new() -> Self {
		use rand::Rng;
		let mut bytes = [0u8; 12];
		rand::thread_rng().fill(&mut bytes);
		Self(bytes)
	}

	pub fn to_hex(self) -> String {
		let mut s = String::with_capacity(24);
		for b in &self.0 {
			s.push_str(&format!("{:02x}", b));
		}
		s
	}

	pub fn from_hex(s: &str) -> Option<Self> {
		if s.len() != 24 || !s.is_ascii() {
			return None;
		}
		let mut bytes = [0u8; 12];
		for (i, b) in bytes.iter_mut().enumerate() {
			*b = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).ok()?;
		}
		Some(Self(bytes))
	}
}

impl fmt::Debug for ObjectId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "ObjectId({})", self.to_hex())
	}
}

impl fmt::Display for ObjectId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str(&self.to_hex())
	}
}

impl Serialize for ObjectId {
	fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
		serializer.serialize_newtype_struct(OBJECT_ID_NEWTYPE, &self.to_hex())
	}
}

impl<'de> Deserialize<'de> for ObjectId {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
		struct V;

		impl<'de> serde::de::Visitor<'de> for V {
			type Value = ObjectId;

			fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
				f.write_str("an object id")
			}

			fn visit_str<E: serde::de::Error>(self, v: &str) -> std::result::Result<ObjectId, E> {
				ObjectId::from_hex(v).ok_or_else(|| E::custom("invalid object id"))
			}

			fn visit_byte_buf<E: serde::de::Error>(self, v: Vec<u8>) -> std::result::Result<ObjectId, E> {
				self.visit_bytes(&v)
			}

			fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> std::result::Result<ObjectId, E> {
				if v.len() != 12 {
					return Err(E::custom("invalid object id"));
				}
				let mut bytes = [0u8; 12];
				bytes.copy_from_slice(v);
				Ok(ObjectId(bytes))
			}
		}

		deserializer.deserialize_newtype_struct(OBJECT_ID_NEWTYPE, V)
	}
}

/// An opaque logical-clock value, ordered by time then increment.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct Timestamp {
	pub time:      u32,
	pub increment: u32
}

impl Timestamp {
	fn to_bits(self) -> i64 {
		((self.time as u64) << 32 | self.increment as u64) as i64
	}
}

impl Serialize for Timestamp {
	fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
		serializer.serialize_newtype_struct(TIMESTAMP_NEWTYPE, &self.to_bits())
	}
}

impl<'de> Deserialize<'de> for Timestamp {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
		struct V;

		impl<'de> serde::de::Visitor<'de> for V {
			type Value = Timestamp;

			fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
				f.write_str("a timestamp")
			}

			fn visit_i64<E>(self, v: i64) -> std::result::Result<Timestamp, E> {
				Ok(Timestamp {
					time:      (v as u64 >> 32) as u32,
					increment: v as u32
				})
			}

			fn visit_u64<E>(self, v: u64) -> std::result::Result<Timestamp, E> {
				Ok(Timestamp {
					time:      (v >> 32) as u32,
					increment: v as u32
				})
			}
		}

		deserializer.deserialize_newtype_struct(TIMESTAMP_NEWTYPE, V)
	}
}

/// Builds a [`Document`] from `key => value` pairs.
#[macro_export]
macro_rules! doc {
	() => { $crate::document::Document::new() };
	($($key:expr => $value:expr),+ $(,)?) => {{
		let mut doc = $crate::document::Document::new();
		$(doc.insert($key, $value);)+
		doc
	}};
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn insertion_order_and_lookup() {
		let doc = doc! { "insert" => "coll", "ordered" => true, "n" => 3i32 };
		assert_eq!(doc.command_name(), Some("insert"));
		assert_eq!(doc.get_str("insert"), Some("coll"));
		assert_eq!(doc.get("ordered"), Some(&Value::Bool(true)));
		assert_eq!(doc.get_i64("n"), Some(3));
		assert_eq!(doc.get("missing"), None);
	}

	#[test]
	fn object_id_hex_round_trip() {
		let oid = ObjectId::new();
		assert_eq!(ObjectId::from_hex(&oid.to_hex()), Some(oid));
		assert_eq!(ObjectId::from_hex("zz"), None);
	}

	#[test]
	fn struct_to_document_and_back() {
		#[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
		struct Cmd {
			find:       String,
			#[serde(skip_serializing_if = "Option::is_none")]
			batch_size: Option<i64>,
			oid:        ObjectId,
			ts:         Timestamp
		}

		let cmd = Cmd {
			find:       "users".to_string(),
			batch_size: Some(10),
			oid:        ObjectId::new(),
			ts:         Timestamp { time: 7, increment: 3 }
		};

		let doc = Document::from(&cmd).unwrap();
		assert_eq!(doc.command_name(), Some("find"));
		assert_eq!(doc.deserialize::<Cmd>().unwrap(), cmd);
	}

	#[test]
	fn enum_variants_round_trip() {
		#[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
		enum Filter {
			All,
			Id(i64),
			Range(i64, i64),
			Text { field: String, query: String }
		}

		#[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
		struct Query {
			filters: Vec<Filter>
		}

		let query = Query {
			filters: vec![
				Filter::All,
				Filter::Id(7),
				Filter::Range(1, 9),
				Filter::Text { field: "name".to_string(), query: "ada".to_string() }
			]
		};

		let doc = Document::from(&query).unwrap();
		assert_eq!(doc.deserialize::<Query>().unwrap(), query);
	}

	#[test]
	fn value_round_trips_through_serde() {
		let doc = doc! {
			"nested" => doc! { "a" => 1i32 },
			"array"  => vec![Value::I64(1), Value::String("x".to_string())],
			"oid"    => ObjectId::new(),
			"ts"     => Timestamp { time: 1, increment: 2 },
			"bin"    => vec![1u8, 2, 3]
		};

		let copy: Document = Document::from(&doc).unwrap();
		assert_eq!(copy, doc);
		assert_eq!(copy.deserialize::<Document>().unwrap(), doc);
	}
}
