//! Keccak helpers shared by the chunk codec, the indexes and the catalog.

use hex;
use tiny_keccak::{self, Keccak};

/// 32 byte chunk address or index slot.
pub type Hash = [u8; 32];

/// 20 byte account address.
pub type Address = [u8; 20];

pub const ZERO_HASH: Hash = [0u8; 32];

pub fn keccak256(data: &[u8]) -> Hash {
	tiny_keccak::keccak256(data)
}

/// Hashes the concatenation of `parts` without allocating it.
pub fn keccak256_concat(parts: &[&[u8]]) -> Hash {
	let mut keccak = Keccak::new_keccak256();
	for part in parts {
		keccak.update(part);
	}
	let mut out = [0u8; 32];
	keccak.finalize(&mut out);
	out
}

pub fn is_zero(data: &[u8]) -> bool {
	data.iter().all(|b| *b == 0)
}

/// Copies `data` into a zero padded 32 byte array, truncating longer input.
pub fn to_hash(data: &[u8]) -> Hash {
	let mut out = [0u8; 32];
	let len = ::std::cmp::min(data.len(), 32);
	out[..len].copy_from_slice(&data[..len]);
	out
}

pub fn to_hex(data: &[u8]) -> String {
	hex::encode(data)
}

/// Strips trailing zero bytes of a padded field.
pub fn trim_zeros(data: &[u8]) -> &[u8] {
	let end = data.iter().rposition(|b| *b != 0).map(|p| p + 1).unwrap_or(0);
	&data[..end]
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn concat_matches_single_buffer() {
		assert_eq!(keccak256(b"ownerdbtable"), keccak256_concat(&[b"owner", b"db", b"table"]));
	}

	#[test]
	fn keccak_of_empty_input() {
		assert_eq!(
			to_hex(&keccak256(&[])),
			"c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
		);
	}

	#[test]
	fn trims_padding() {
		assert_eq!(trim_zeros(b"abc\0\0"), b"abc");
		assert_eq!(trim_zeros(&[0, 0]), b"");
		assert_eq!(&to_hash(b"videos")[..6], b"videos");
	}
}
