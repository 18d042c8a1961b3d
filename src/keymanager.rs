//! Signing and payload encryption.
//!
//! Chunk headers are signed with a recoverable secp256k1 signature over the
//! keccak digest of the header, so that the payer can be recovered from the
//! chunk alone:
//!
//! ```text
//!        r             s         v
//!        /             /         /
//! |.........|.........|.|
//!  0        32        64
//! ```
//!
//! Payloads are sealed per user. Each user owns an X25519 keypair derived
//! from its passphrase; the box key is the keccak of the user's
//! self-agreement and the cipher is XChaCha20-Poly1305 with the nonce
//! prepended to the ciphertext.

use std::collections::HashMap;

use chacha20poly1305::aead::Aead;
use chacha20poly1305::{Key, KeyInit, XChaCha20Poly1305, XNonce};
use hex;
use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};

use error::{ErrorKind, Result};
use hash::{keccak256, keccak256_concat, Address, Hash};
use options::Options;

pub const SIGNATURE_SIZE: usize = 65;
pub const NONCE_SIZE: usize = 24;
pub const TAG_SIZE: usize = 16;

/// Bytes a sealed payload grows by.
pub const SEAL_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

/// Signs chunk digests and seals chunk payloads on behalf of users.
pub trait KeyManager: Send + Sync {
	/// Address of the signing key.
	fn address(&self) -> Address;

	fn sign_message(&self, digest: &Hash) -> Result<[u8; SIGNATURE_SIZE]>;

	/// Recovers the signer of `digest`, `None` when the signature is malformed.
	fn verify_message(&self, digest: &Hash, signature: &[u8]) -> Option<Address>;

	/// Returns `nonce || ciphertext || tag`.
	fn encrypt(&self, user: &Address, plaintext: &[u8]) -> Result<Vec<u8>>;

	fn decrypt(&self, user: &Address, sealed: &[u8]) -> Result<Vec<u8>>;
}

struct UserKeys {
	secret: StaticSecret,
	public: PublicKey,
}

impl UserKeys {
	fn derive(address: &Address, passphrase: &str) -> Self {
		let seed = keccak256_concat(&[passphrase.as_bytes(), address]);
		let secret = StaticSecret::from(seed);
		let public = PublicKey::from(&secret);
		UserKeys { secret, public }
	}

	fn cipher(&self) -> XChaCha20Poly1305 {
		let shared = self.secret.diffie_hellman(&self.public);
		let key = keccak256(shared.as_bytes());
		XChaCha20Poly1305::new(Key::from_slice(&key))
	}
}

/// Key manager holding everything in process memory.
pub struct LocalKeyManager {
	signing_key: SigningKey,
	address: Address,
	users: RwLock<HashMap<Address, UserKeys>>,
}

pub fn address_of(key: &VerifyingKey) -> Address {
	let point = key.as_affine().to_encoded_point(false);
	let hash = keccak256(&point.as_bytes()[1..]);
	let mut address = [0u8; 20];
	address.copy_from_slice(&hash[12..]);
	address
}

/// Parses a 20 byte hex address, with or without `0x`.
pub fn parse_address(s: &str) -> Result<Address> {
	let raw = hex::decode(s.trim_start_matches("0x"))
		.map_err(|e| ErrorKind::InvalidRequest(format!("address {}: {}", s, e)))?;
	if raw.len() != 20 {
		bail!(ErrorKind::InvalidRequest(format!("address {} must be 20 bytes", s)));
	}
	let mut address = [0u8; 20];
	address.copy_from_slice(&raw);
	Ok(address)
}

impl LocalKeyManager {
	pub fn new(signing_key: SigningKey) -> Self {
		let address = address_of(signing_key.verifying_key());
		LocalKeyManager {
			signing_key,
			address,
			users: RwLock::new(HashMap::new()),
		}
	}

	pub fn random() -> Self {
		Self::new(SigningKey::random(&mut OsRng))
	}

	pub fn from_hex(secret: &str) -> Result<Self> {
		let raw = hex::decode(secret.trim_start_matches("0x"))
			.map_err(|e| ErrorKind::InvalidRequest(format!("signing key: {}", e)))?;
		let key = SigningKey::from_slice(&raw)
			.map_err(|_| ErrorKind::InvalidRequest("signing key is not a valid secp256k1 scalar".into()))?;
		Ok(Self::new(key))
	}

	/// Builds the key manager described by `options`, registering every
	/// configured user.
	pub fn from_options(options: &Options) -> Result<Self> {
		let manager = match options.signing_key {
			Some(ref secret) => Self::from_hex(secret)?,
			None => Self::random(),
		};
		for user in &options.users {
			manager.add_user(&parse_address(&user.address)?, &user.passphrase);
		}
		Ok(manager)
	}

	/// Registers (or replaces) the encryption keypair of `address`.
	pub fn add_user(&self, address: &Address, passphrase: &str) {
		self.users.write().insert(*address, UserKeys::derive(address, passphrase));
	}

	/// X25519 public key of a registered user.
	pub fn public_key(&self, address: &Address) -> Option<[u8; 32]> {
		self.users.read().get(address).map(|keys| *keys.public.as_bytes())
	}
}

impl KeyManager for LocalKeyManager {
	fn address(&self) -> Address {
		self.address
	}

	fn sign_message(&self, digest: &Hash) -> Result<[u8; SIGNATURE_SIZE]> {
		let (signature, recovery_id) = self.signing_key.sign_prehash_recoverable(digest)
			.map_err(|e| ErrorKind::Backend(format!("signing failed: {}", e)))?;
		let mut out = [0u8; SIGNATURE_SIZE];
		out[..64].copy_from_slice(&signature.to_bytes());
		out[64] = recovery_id.to_byte();
		Ok(out)
	}

	fn verify_message(&self, digest: &Hash, signature: &[u8]) -> Option<Address> {
		if signature.len() != SIGNATURE_SIZE {
			return None;
		}
		let sig = Signature::from_slice(&signature[..64]).ok()?;
		let recovery_id = RecoveryId::from_byte(signature[64])?;
		let key = VerifyingKey::recover_from_prehash(digest, &sig, recovery_id).ok()?;
		Some(address_of(&key))
	}

	fn encrypt(&self, user: &Address, plaintext: &[u8]) -> Result<Vec<u8>> {
		let users = self.users.read();
		let keys = users.get(user)
			.ok_or_else(|| ErrorKind::InvalidRequest(format!("no keypair for user {}", hex::encode(user))))?;

		let mut nonce = [0u8; NONCE_SIZE];
		OsRng.fill_bytes(&mut nonce);
		let ciphertext = keys.cipher().encrypt(XNonce::from_slice(&nonce), plaintext)
			.map_err(|_| ErrorKind::Backend("payload encryption failed".into()))?;

		let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
		sealed.extend_from_slice(&nonce);
		sealed.extend_from_slice(&ciphertext);
		Ok(sealed)
	}

	fn decrypt(&self, user: &Address, sealed: &[u8]) -> Result<Vec<u8>> {
		if sealed.len() < SEAL_OVERHEAD {
			bail!(ErrorKind::Integrity(format!("sealed payload too short: {} bytes", sealed.len())));
		}
		let users = self.users.read();
		let keys = users.get(user)
			.ok_or_else(|| ErrorKind::Integrity(format!("no keypair for user {}", hex::encode(user))))?;

		let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
		let plaintext = keys.cipher().decrypt(XNonce::from_slice(nonce), ciphertext)
			.map_err(|_| ErrorKind::Integrity("payload decryption failed".into()))?;
		Ok(plaintext)
	}
}

#[cfg(test)]
mod tests {
	use error::ErrorKind;
	use hash::keccak256;
	use super::{KeyManager, LocalKeyManager, SEAL_OVERHEAD};

	const ALICE: [u8; 20] = [0xaa; 20];
	const BOB: [u8; 20] = [0xbb; 20];

	#[test]
	fn should_recover_signer() {
		let manager = LocalKeyManager::random();
		let digest = keccak256(b"header");
		let signature = manager.sign_message(&digest).unwrap();

		assert_eq!(manager.verify_message(&digest, &signature), Some(manager.address()));
		assert_ne!(manager.verify_message(&keccak256(b"other"), &signature), Some(manager.address()));
		assert_eq!(manager.verify_message(&digest, &signature[..64]), None);
	}

	#[test]
	fn should_load_signing_key_from_hex() {
		let secret = "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";
		let a = LocalKeyManager::from_hex(secret).unwrap();
		let b = LocalKeyManager::from_hex(&format!("0x{}", secret)).unwrap();
		assert_eq!(a.address(), b.address());
		assert!(LocalKeyManager::from_hex("00").is_err());
	}

	#[test]
	fn should_seal_for_one_user_only() {
		let manager = LocalKeyManager::random();
		manager.add_user(&ALICE, "alice");
		manager.add_user(&BOB, "bob");

		let sealed = manager.encrypt(&ALICE, b"row payload").unwrap();
		assert_eq!(sealed.len(), b"row payload".len() + SEAL_OVERHEAD);
		assert_eq!(manager.decrypt(&ALICE, &sealed).unwrap(), b"row payload".to_vec());
		assert_matches!(*manager.decrypt(&BOB, &sealed).unwrap_err().kind(), ErrorKind::Integrity(_));
	}

	#[test]
	fn should_reject_tampered_ciphertext() {
		let manager = LocalKeyManager::random();
		manager.add_user(&ALICE, "alice");
		let mut sealed = manager.encrypt(&ALICE, b"row payload").unwrap();
		let last = sealed.len() - 1;
		sealed[last] ^= 1;
		assert_matches!(*manager.decrypt(&ALICE, &sealed).unwrap_err().kind(), ErrorKind::Integrity(_));
	}
}
