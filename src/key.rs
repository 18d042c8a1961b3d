//! Column types, index kinds and the canonical 32 byte key encoding.
//!
//! Keys are compared byte-lexicographically regardless of the column type,
//! so numbers are encoded such that byte order equals numeric order:
//!
//! ```text
//! INTEGER  |0....0|  i ^ 1 << 63, big endian  |
//! FLOAT    |0....0|  bits with sign flipped   |   negatives fully inverted
//!           0      24                          32
//! STRING   | utf-8, zero padded or truncated  |
//! BLOB     | raw bytes, zero padded           |
//! ```

use std::cmp::Ordering;
use std::convert::TryFrom;
use std::fmt;

use byteorder::{BigEndian, ByteOrder};

use error::{Error, ErrorKind};
use hash::{to_hash, Hash};

/// Encoded column value used as an index key.
pub type Key = Hash;

const SIGN_BIT: u64 = 1 << 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ColumnType {
	Integer,
	String,
	Float,
	Blob,
}

impl ColumnType {
	pub fn code(&self) -> u8 {
		match *self {
			ColumnType::Integer => 1,
			ColumnType::String => 2,
			ColumnType::Float => 3,
			ColumnType::Blob => 4,
		}
	}

	pub fn from_code(code: u8) -> Option<Self> {
		match code {
			1 => Some(ColumnType::Integer),
			2 => Some(ColumnType::String),
			3 => Some(ColumnType::Float),
			4 => Some(ColumnType::Blob),
			_ => None,
		}
	}

	pub fn name(&self) -> &'static str {
		match *self {
			ColumnType::Integer => "INTEGER",
			ColumnType::String => "STRING",
			ColumnType::Float => "FLOAT",
			ColumnType::Blob => "BLOB",
		}
	}

	pub fn from_name(name: &str) -> Option<Self> {
		match name.to_ascii_uppercase().as_str() {
			"INTEGER" | "INT" => Some(ColumnType::Integer),
			"STRING" | "TEXT" => Some(ColumnType::String),
			"FLOAT" => Some(ColumnType::Float),
			"BLOB" => Some(ColumnType::Blob),
			_ => None,
		}
	}
}

impl TryFrom<u8> for ColumnType {
	type Error = Error;

	fn try_from(code: u8) -> Result<Self, Error> {
		ColumnType::from_code(code).ok_or_else(|| ErrorKind::Schema(format!("unsupported column type {}", code)).into())
	}
}

impl From<ColumnType> for u8 {
	fn from(t: ColumnType) -> u8 {
		t.code()
	}
}

impl fmt::Display for ColumnType {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str(self.name())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum IndexType {
	None,
	HashTrie,
	BPlusTree,
	/// Reserved, rejected when a table is created.
	FullText,
}

impl IndexType {
	pub fn code(&self) -> u8 {
		match *self {
			IndexType::None => 0,
			IndexType::HashTrie => 1,
			IndexType::BPlusTree => 2,
			IndexType::FullText => 3,
		}
	}

	pub fn from_code(code: u8) -> Option<Self> {
		match code {
			0 => Some(IndexType::None),
			1 => Some(IndexType::HashTrie),
			2 => Some(IndexType::BPlusTree),
			3 => Some(IndexType::FullText),
			_ => None,
		}
	}

	pub fn name(&self) -> &'static str {
		match *self {
			IndexType::None => "NONE",
			IndexType::HashTrie => "HASHTRIE",
			IndexType::BPlusTree => "BPLUSTREE",
			IndexType::FullText => "FULLTEXT",
		}
	}

	pub fn from_name(name: &str) -> Option<Self> {
		match name.to_ascii_uppercase().as_str() {
			"NONE" => Some(IndexType::None),
			"HASHTRIE" | "HASHTREE" | "HASH" => Some(IndexType::HashTrie),
			"BPLUSTREE" | "BPLUS" => Some(IndexType::BPlusTree),
			"FULLTEXT" => Some(IndexType::FullText),
			_ => None,
		}
	}
}

impl TryFrom<u8> for IndexType {
	type Error = Error;

	fn try_from(code: u8) -> Result<Self, Error> {
		IndexType::from_code(code).ok_or_else(|| ErrorKind::Schema(format!("unsupported index type {}", code)).into())
	}
}

impl From<IndexType> for u8 {
	fn from(t: IndexType) -> u8 {
		t.code()
	}
}

impl fmt::Display for IndexType {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str(self.name())
	}
}

pub fn encode_int(value: i64) -> Key {
	let mut key = [0u8; 32];
	BigEndian::write_u64(&mut key[24..], (value as u64) ^ SIGN_BIT);
	key
}

pub fn decode_int(key: &Key) -> i64 {
	(BigEndian::read_u64(&key[24..]) ^ SIGN_BIT) as i64
}

pub fn encode_float(value: f64) -> Key {
	let bits = value.to_bits();
	let ordered = if bits & SIGN_BIT != 0 { !bits } else { bits ^ SIGN_BIT };
	let mut key = [0u8; 32];
	BigEndian::write_u64(&mut key[24..], ordered);
	key
}

pub fn decode_float(key: &Key) -> f64 {
	let ordered = BigEndian::read_u64(&key[24..]);
	let bits = if ordered & SIGN_BIT != 0 { ordered ^ SIGN_BIT } else { !ordered };
	f64::from_bits(bits)
}

/// STRING and BLOB keys: zero padded, truncated past 32 bytes.
pub fn encode_bytes(value: &[u8]) -> Key {
	to_hash(value)
}

/// The order every index uses.
pub fn compare(a: &Key, b: &Key) -> Ordering {
	a.cmp(b)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn integer_keys_sort_numerically() {
		let values = [i64::min_value(), -1000, -1, 0, 1, 42, 1 << 40, i64::max_value()];
		for pair in values.windows(2) {
			assert_eq!(compare(&encode_int(pair[0]), &encode_int(pair[1])), Ordering::Less, "{:?}", pair);
		}
		for v in values.iter() {
			assert_eq!(decode_int(&encode_int(*v)), *v);
		}
	}

	#[test]
	fn float_keys_sort_numerically() {
		let values = [::std::f64::NEG_INFINITY, -1e10, -2.5, -0.5, 0.0, 0.25, 3.0, 1e300, ::std::f64::INFINITY];
		for pair in values.windows(2) {
			assert_eq!(compare(&encode_float(pair[0]), &encode_float(pair[1])), Ordering::Less, "{:?}", pair);
		}
		for v in values.iter() {
			assert_eq!(decode_float(&encode_float(*v)), *v);
		}
	}

	#[test]
	fn string_keys_are_padded_and_truncated() {
		assert_eq!(&encode_bytes(b"abc")[..4], b"abc\0");
		assert_eq!(encode_bytes(&[b'z'; 40]), [b'z'; 32]);
		assert_eq!(compare(&encode_bytes(b"ab"), &encode_bytes(b"abc")), Ordering::Less);
	}

	#[test]
	fn type_codes_round_trip_through_json() {
		assert_eq!(::serde_json::to_string(&ColumnType::Float).unwrap(), "3");
		assert_eq!(::serde_json::from_str::<IndexType>("2").unwrap(), IndexType::BPlusTree);
		assert!(::serde_json::from_str::<ColumnType>("9").is_err());
		assert_eq!(ColumnType::from_name("integer"), Some(ColumnType::Integer));
		assert_eq!(IndexType::from_name("hashtree"), Some(IndexType::HashTrie));
	}
}
