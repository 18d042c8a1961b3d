//! Rows and their typed cells.
//!
//! JSON is the wire and storage form of a row. Numbers, strings and `0x`
//! prefixed hex blobs arrive untyped and are coerced to the declared column
//! type at the table boundary.

use std::cmp::Ordering;
use std::collections::btree_map;
use std::collections::BTreeMap;
use std::fmt;

use hex;
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json;

use error::{ErrorKind, Result};
use key::{encode_bytes, encode_float, encode_int, ColumnType, Key};

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
	Int(i64),
	Float(f64),
	Str(String),
	Bytes(Vec<u8>),
}

impl Value {
	pub fn from_json(value: &serde_json::Value) -> Result<Self> {
		match *value {
			serde_json::Value::Number(ref n) => match n.as_i64() {
				Some(i) => Ok(Value::Int(i)),
				None => n.as_f64()
					.map(Value::Float)
					.ok_or_else(|| ErrorKind::Type(format!("number {} out of range", n)).into()),
			},
			serde_json::Value::String(ref s) => Ok(Value::Str(s.clone())),
			serde_json::Value::Bool(b) => Ok(Value::Int(b as i64)),
			ref other => bail!(ErrorKind::Type(format!("unsupported cell value {}", other))),
		}
	}

	/// Converts the cell to the representation of `column_type`.
	pub fn coerce(&self, column_type: ColumnType) -> Result<Value> {
		let mismatch = || ErrorKind::Type(format!("{} cannot be stored as {}", self, column_type));
		let value = match (column_type, self) {
			(ColumnType::Integer, &Value::Int(i)) => Value::Int(i),
			(ColumnType::Integer, &Value::Float(f)) if f.is_finite() => Value::Int(f.trunc() as i64),
			(ColumnType::Integer, &Value::Str(ref s)) => Value::Int(s.trim().parse().map_err(|_| mismatch())?),
			(ColumnType::Float, &Value::Int(i)) => Value::Float(i as f64),
			(ColumnType::Float, &Value::Float(f)) => Value::Float(f),
			(ColumnType::Float, &Value::Str(ref s)) => Value::Float(s.trim().parse().map_err(|_| mismatch())?),
			(ColumnType::String, &Value::Str(ref s)) => Value::Str(s.clone()),
			(ColumnType::String, &Value::Int(i)) => Value::Str(format!("{}", i)),
			(ColumnType::String, &Value::Float(f)) => Value::Str(format!("{:.6}", f)),
			(ColumnType::String, &Value::Bytes(ref b)) => Value::Str(String::from_utf8(b.clone()).map_err(|_| mismatch())?),
			(ColumnType::Blob, &Value::Bytes(ref b)) => Value::Bytes(b.clone()),
			(ColumnType::Blob, &Value::Str(ref s)) => Value::Bytes(decode_blob(s)),
			_ => bail!(mismatch()),
		};
		Ok(value)
	}

	/// Index key of the cell once coerced to `column_type`.
	pub fn to_key(&self, column_type: ColumnType) -> Result<Key> {
		let key = match self.coerce(column_type)? {
			Value::Int(i) => encode_int(i),
			Value::Float(f) => encode_float(f),
			Value::Str(ref s) => encode_bytes(s.as_bytes()),
			Value::Bytes(ref b) => encode_bytes(b),
		};
		Ok(key)
	}

	/// Parses a literal from a query, dropping surrounding quotes.
	pub fn parse_literal(text: &str, column_type: ColumnType) -> Result<Value> {
		let text = text.trim();
		let unquoted = if text.len() >= 2 && (
			(text.starts_with('\'') && text.ends_with('\'')) ||
			(text.starts_with('"') && text.ends_with('"'))
		) {
			&text[1..text.len() - 1]
		} else {
			text
		};
		Value::Str(unquoted.to_owned()).coerce(column_type)
	}

	/// Typed comparison, `None` for cells of unrelated types.
	pub fn compare(&self, other: &Value) -> Option<Ordering> {
		match (self, other) {
			(&Value::Int(a), &Value::Int(b)) => Some(a.cmp(&b)),
			(&Value::Float(a), &Value::Float(b)) => a.partial_cmp(&b),
			(&Value::Int(a), &Value::Float(b)) => (a as f64).partial_cmp(&b),
			(&Value::Float(a), &Value::Int(b)) => a.partial_cmp(&(b as f64)),
			(&Value::Str(ref a), &Value::Str(ref b)) => Some(a.cmp(b)),
			(&Value::Bytes(ref a), &Value::Bytes(ref b)) => Some(a.cmp(b)),
			_ => None,
		}
	}
}

fn decode_blob(s: &str) -> Vec<u8> {
	if s.starts_with("0x") {
		if let Ok(raw) = hex::decode(&s[2..]) {
			return raw;
		}
	}
	s.as_bytes().to_vec()
}

impl fmt::Display for Value {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match *self {
			Value::Int(i) => write!(f, "{}", i),
			Value::Float(v) => write!(f, "{}", v),
			Value::Str(ref s) => write!(f, "{:?}", s),
			Value::Bytes(ref b) => write!(f, "0x{}", hex::encode(b)),
		}
	}
}

impl From<i64> for Value {
	fn from(i: i64) -> Self {
		Value::Int(i)
	}
}

impl From<i32> for Value {
	fn from(i: i32) -> Self {
		Value::Int(i as i64)
	}
}

impl From<f64> for Value {
	fn from(f: f64) -> Self {
		Value::Float(f)
	}
}

impl<'a> From<&'a str> for Value {
	fn from(s: &'a str) -> Self {
		Value::Str(s.to_owned())
	}
}

impl From<String> for Value {
	fn from(s: String) -> Self {
		Value::Str(s)
	}
}

impl From<Vec<u8>> for Value {
	fn from(b: Vec<u8>) -> Self {
		Value::Bytes(b)
	}
}

impl Serialize for Value {
	fn serialize<S: Serializer>(&self, serializer: S) -> ::std::result::Result<S::Ok, S::Error> {
		match *self {
			Value::Int(i) => serializer.serialize_i64(i),
			Value::Float(f) => serializer.serialize_f64(f),
			Value::Str(ref s) => serializer.serialize_str(s),
			Value::Bytes(ref b) => serializer.serialize_str(&format!("0x{}", hex::encode(b))),
		}
	}
}

impl<'de> Deserialize<'de> for Value {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> ::std::result::Result<Self, D::Error> {
		let json = serde_json::Value::deserialize(deserializer)?;
		Value::from_json(&json).map_err(|e| D::Error::custom(e.to_string()))
	}
}

/// Column name to cell mapping.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Row(BTreeMap<String, Value>);

impl Row {
	pub fn new() -> Self {
		Row::default()
	}

	pub fn with<K: Into<String>, V: Into<Value>>(mut self, column: K, value: V) -> Self {
		self.insert(column, value);
		self
	}

	pub fn insert<K: Into<String>, V: Into<Value>>(&mut self, column: K, value: V) -> Option<Value> {
		self.0.insert(column.into(), value.into())
	}

	pub fn get(&self, column: &str) -> Option<&Value> {
		self.0.get(column)
	}

	pub fn contains(&self, column: &str) -> bool {
		self.0.contains_key(column)
	}

	pub fn remove(&mut self, column: &str) -> Option<Value> {
		self.0.remove(column)
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	pub fn iter(&self) -> btree_map::Iter<String, Value> {
		self.0.iter()
	}

	pub fn columns(&self) -> btree_map::Keys<String, Value> {
		self.0.keys()
	}

	/// Keeps only `columns`. An empty list keeps everything.
	pub fn project(&self, columns: &[String]) -> Row {
		if columns.is_empty() {
			return self.clone();
		}
		Row(columns.iter()
			.filter_map(|c| self.0.get(c).map(|v| (c.clone(), v.clone())))
			.collect())
	}

	pub fn to_json(&self) -> Result<Vec<u8>> {
		Ok(serde_json::to_vec(self)?)
	}

	pub fn from_json(data: &[u8]) -> Result<Row> {
		Ok(serde_json::from_slice(data)?)
	}
}

impl IntoIterator for Row {
	type Item = (String, Value);
	type IntoIter = btree_map::IntoIter<String, Value>;

	fn into_iter(self) -> Self::IntoIter {
		self.0.into_iter()
	}
}

impl ::std::iter::FromIterator<(String, Value)> for Row {
	fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
		Row(iter.into_iter().collect())
	}
}

#[cfg(test)]
mod tests {
	use std::cmp::Ordering;

	use error::ErrorKind;
	use key::{encode_int, ColumnType};
	use super::{Row, Value};

	#[test]
	fn coercion_follows_column_type() {
		assert_eq!(Value::from("42").coerce(ColumnType::Integer).unwrap(), Value::Int(42));
		assert_eq!(Value::Float(3.9).coerce(ColumnType::Integer).unwrap(), Value::Int(3));
		assert_eq!(Value::Int(7).coerce(ColumnType::String).unwrap(), Value::from("7"));
		assert_eq!(Value::Float(1.5).coerce(ColumnType::String).unwrap(), Value::from("1.500000"));
		assert_eq!(Value::from("2.5").coerce(ColumnType::Float).unwrap(), Value::Float(2.5));
		assert_eq!(Value::from("0x0102").coerce(ColumnType::Blob).unwrap(), Value::Bytes(vec![1, 2]));
		assert_matches!(*Value::from("abc").coerce(ColumnType::Integer).unwrap_err().kind(), ErrorKind::Type(_));
	}

	#[test]
	fn literal_quotes_are_dropped() {
		assert_eq!(Value::parse_literal("'000008'", ColumnType::String).unwrap(), Value::from("000008"));
		assert_eq!(Value::parse_literal(" 10 ", ColumnType::Integer).unwrap(), Value::Int(10));
		assert_eq!(Value::Str("8".into()).to_key(ColumnType::Integer).unwrap(), encode_int(8));
	}

	#[test]
	fn mixed_numbers_compare() {
		assert_eq!(Value::Int(2).compare(&Value::Float(2.5)), Some(Ordering::Less));
		assert_eq!(Value::from("a").compare(&Value::Int(1)), None);
	}

	#[test]
	fn row_json_keeps_types() {
		let row = Row::new().with("id", 8).with("v", "valueof000008").with("score", 1.25);
		let json = row.to_json().unwrap();
		assert_eq!(::std::str::from_utf8(&json).unwrap(), r#"{"id":8,"score":1.25,"v":"valueof000008"}"#);
		assert_eq!(Row::from_json(&json).unwrap(), row);
		assert_eq!(row.project(&["v".to_owned(), "missing".to_owned()]), Row::new().with("v", "valueof000008"));
	}
}
