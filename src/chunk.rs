//! The 4096 byte chunk and its signed header.
//!
//! ```text
//!  sig   msgHash payer type min max birth  update enc version renew key  owner database table    payload
//!   /      /      /     /    /   /    /      /     /    /      /    /     /      /       /         /
//! |....|......|.....|.|.|.|........|........|.|........|.|......|......|......|......|...|.............|
//!  0    65     97    129 130 131 132      140      148 149      157 158    190    222    254 286 512      4096
//! ```
//!
//! `msgHash` is the keccak of header bytes `97..512` and `sig` is the
//! payer's recoverable signature of it.
//!
//! Directory and index chunks carry no header. They are addressed by the
//! keccak of their first 4000 bytes. When encrypted, their first
//! `SEALED_SPAN` bytes are sealed so the stored blob stays 4096 bytes; the
//! remaining bytes must be zero.
//! Row chunks (`k`) are addressed by their fingerprint, keep the header in
//! clear and seal only the payload region.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{BigEndian, ByteOrder};

use error::{ErrorKind, Result};
use hash::{is_zero, keccak256, to_hash, to_hex, trim_zeros, Address, Hash};
use keymanager::{KeyManager, SEAL_OVERHEAD, SIGNATURE_SIZE};
use options::User;
use store::ChunkStore;

pub const CHUNK_SIZE: usize = 4096;
pub const HEADER_SIZE: usize = 512;
pub const PAYLOAD_SIZE: usize = CHUNK_SIZE - HEADER_SIZE;
/// Generic chunks are addressed by the keccak of this many leading bytes.
pub const ADDRESS_SPAN: usize = 4000;
/// Largest row JSON an encrypted row chunk can carry.
pub const MAX_SEALED_PAYLOAD: usize = PAYLOAD_SIZE - SEAL_OVERHEAD;
/// Leading bytes of an encrypted generic chunk that survive sealing.
pub const SEALED_SPAN: usize = CHUNK_SIZE - SEAL_OVERHEAD;

mod offset {
	pub const SIGNATURE: usize = 0;
	pub const MSG_HASH: usize = 65;
	pub const PAYER: usize = 97;
	pub const CHUNK_TYPE: usize = 129;
	pub const MIN_REPLICATION: usize = 130;
	pub const MAX_REPLICATION: usize = 131;
	pub const BIRTH_TS: usize = 132;
	pub const LAST_UPDATE_TS: usize = 140;
	pub const ENCRYPTED: usize = 148;
	pub const VERSION: usize = 149;
	pub const AUTO_RENEW: usize = 157;
	pub const KEY: usize = 158;
	pub const OWNER: usize = 190;
	pub const DATABASE: usize = 222;
	pub const TABLE: usize = 254;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkType {
	Owner,
	Database,
	Table,
	IndexNode,
	IndexLeaf,
	Row,
	Child,
}

impl ChunkType {
	pub fn code(&self) -> u8 {
		match *self {
			ChunkType::Owner => b'O',
			ChunkType::Database => b'D',
			ChunkType::Table => b'T',
			ChunkType::IndexNode => b'x',
			ChunkType::IndexLeaf => b'd',
			ChunkType::Row => b'k',
			ChunkType::Child => b'C',
		}
	}

	pub fn from_code(code: u8) -> Option<ChunkType> {
		match code {
			b'O' => Some(ChunkType::Owner),
			b'D' => Some(ChunkType::Database),
			b'T' => Some(ChunkType::Table),
			b'x' => Some(ChunkType::IndexNode),
			b'd' => Some(ChunkType::IndexLeaf),
			b'k' => Some(ChunkType::Row),
			b'C' => Some(ChunkType::Child),
			_ => None,
		}
	}
}

/// Decoded chunk header.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkHeader {
	pub signature: [u8; SIGNATURE_SIZE],
	pub msg_hash: Hash,
	pub payer: Address,
	pub chunk_type: ChunkType,
	pub min_replication: u8,
	pub max_replication: u8,
	pub birth_ts: u64,
	pub last_update_ts: u64,
	pub encrypted: bool,
	pub version: u64,
	pub auto_renew: u8,
	pub key: Hash,
	pub owner: Hash,
	pub database: Hash,
	pub table: Hash,
}

pub fn unix_now() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

impl ChunkHeader {
	/// An unsigned header for a fresh chunk paid for by `user`.
	pub fn new(user: &User, chunk_type: ChunkType, owner: &[u8], database: &[u8], table: &[u8], key: &Hash) -> Self {
		let now = unix_now();
		ChunkHeader {
			signature: [0u8; SIGNATURE_SIZE],
			msg_hash: [0u8; 32],
			payer: user.address,
			chunk_type,
			min_replication: user.min_replication,
			max_replication: user.max_replication,
			birth_ts: now,
			last_update_ts: now,
			encrypted: false,
			version: 0,
			auto_renew: user.auto_renew,
			key: *key,
			owner: to_hash(owner),
			database: to_hash(database),
			table: to_hash(table),
		}
	}

	fn write_fields(&self, out: &mut [u8]) {
		out[offset::PAYER..offset::PAYER + 20].copy_from_slice(&self.payer);
		out[offset::CHUNK_TYPE] = self.chunk_type.code();
		out[offset::MIN_REPLICATION] = self.min_replication;
		out[offset::MAX_REPLICATION] = self.max_replication;
		BigEndian::write_u64(&mut out[offset::BIRTH_TS..offset::BIRTH_TS + 8], self.birth_ts);
		BigEndian::write_u64(&mut out[offset::LAST_UPDATE_TS..offset::LAST_UPDATE_TS + 8], self.last_update_ts);
		out[offset::ENCRYPTED] = self.encrypted as u8;
		BigEndian::write_u64(&mut out[offset::VERSION..offset::VERSION + 8], self.version);
		out[offset::AUTO_RENEW] = self.auto_renew;
		out[offset::KEY..offset::KEY + 32].copy_from_slice(&self.key);
		out[offset::OWNER..offset::OWNER + 32].copy_from_slice(&self.owner);
		out[offset::DATABASE..offset::DATABASE + 32].copy_from_slice(&self.database);
		out[offset::TABLE..offset::TABLE + 32].copy_from_slice(&self.table);
	}
}

/// Serializes `header` and signs bytes `97..512` with the key manager.
///
/// The returned header records the key manager's signature and digest.
pub fn build_chunk_header(keys: &dyn KeyManager, header: &ChunkHeader) -> Result<[u8; HEADER_SIZE]> {
	let mut out = [0u8; HEADER_SIZE];
	header.write_fields(&mut out);

	let msg_hash = keccak256(&out[offset::PAYER..HEADER_SIZE]);
	let signature = keys.sign_message(&msg_hash)?;
	out[offset::MSG_HASH..offset::PAYER].copy_from_slice(&msg_hash);
	out[offset::SIGNATURE..offset::MSG_HASH].copy_from_slice(&signature);
	Ok(out)
}

/// Decodes and verifies the header of a full chunk.
pub fn parse_chunk_header(keys: &dyn KeyManager, chunk: &[u8]) -> Result<ChunkHeader> {
	if chunk.len() != CHUNK_SIZE {
		bail!(ErrorKind::Integrity(format!("chunk length {} != {}", chunk.len(), CHUNK_SIZE)));
	}

	let msg_hash = keccak256(&chunk[offset::PAYER..HEADER_SIZE]);
	if msg_hash[..] != chunk[offset::MSG_HASH..offset::PAYER] {
		bail!(ErrorKind::Integrity(format!("header digest mismatch, expected {}", to_hex(&msg_hash))));
	}

	let mut payer = [0u8; 20];
	payer.copy_from_slice(&chunk[offset::PAYER..offset::PAYER + 20]);
	let signature = &chunk[offset::SIGNATURE..offset::MSG_HASH];
	// Chunks are signed by the payer or by this node on the payer's behalf.
	match keys.verify_message(&msg_hash, signature) {
		Some(ref signer) if *signer == payer || *signer == keys.address() => (),
		_ => bail!(ErrorKind::Integrity(format!("header signature does not verify for payer {}", to_hex(&payer)))),
	}

	let chunk_type = ChunkType::from_code(chunk[offset::CHUNK_TYPE])
		.ok_or_else(|| ErrorKind::Integrity(format!("unknown chunk type {}", chunk[offset::CHUNK_TYPE])))?;

	let mut sig = [0u8; SIGNATURE_SIZE];
	sig.copy_from_slice(signature);
	let field = |at: usize| -> Hash { to_hash(&chunk[at..at + 32]) };

	Ok(ChunkHeader {
		signature: sig,
		msg_hash,
		payer,
		chunk_type,
		min_replication: chunk[offset::MIN_REPLICATION],
		max_replication: chunk[offset::MAX_REPLICATION],
		birth_ts: BigEndian::read_u64(&chunk[offset::BIRTH_TS..]),
		last_update_ts: BigEndian::read_u64(&chunk[offset::LAST_UPDATE_TS..]),
		encrypted: chunk[offset::ENCRYPTED] != 0,
		version: BigEndian::read_u64(&chunk[offset::VERSION..]),
		auto_renew: chunk[offset::AUTO_RENEW],
		key: field(offset::KEY),
		owner: field(offset::OWNER),
		database: field(offset::DATABASE),
		table: field(offset::TABLE),
	})
}

/// Address of a generic chunk.
pub fn chunk_address(chunk: &[u8]) -> Hash {
	keccak256(&chunk[..ADDRESS_SPAN])
}

/// Deterministic address of a row chunk.
pub fn fingerprint(owner: &[u8], database: &[u8], table: &[u8], key: &Hash) -> Hash {
	::hash::keccak256_concat(&[owner, database, table, key])
}

/// Addressing, signing and sealing on top of a raw chunk store.
#[derive(Clone)]
pub struct ChunkCodec {
	store: Arc<dyn ChunkStore>,
	keys: Arc<dyn KeyManager>,
}

impl ChunkCodec {
	pub fn new(store: Arc<dyn ChunkStore>, keys: Arc<dyn KeyManager>) -> Self {
		ChunkCodec { store, keys }
	}

	pub fn keys(&self) -> &dyn KeyManager {
		&*self.keys
	}

	/// Stores a generic chunk and returns its address.
	pub fn store_chunk(&self, user: &User, data: &[u8], encrypted: bool) -> Result<Hash> {
		if data.len() > CHUNK_SIZE {
			bail!(ErrorKind::Size(format!("chunk of {} bytes exceeds {}", data.len(), CHUNK_SIZE)));
		}
		let mut chunk = vec![0u8; CHUNK_SIZE];
		chunk[..data.len()].copy_from_slice(data);
		let address = chunk_address(&chunk);

		if encrypted {
			if !is_zero(&chunk[SEALED_SPAN..]) {
				bail!(ErrorKind::Size(format!("encrypted chunk uses bytes past {}", SEALED_SPAN)));
			}
			let sealed = self.keys.encrypt(&user.address, &chunk[..SEALED_SPAN])?;
			self.store.put(&address, &sealed, true)?;
		} else {
			self.store.put(&address, &chunk, false)?;
		}
		debug!(address = %to_hex(&address), encrypted, "stored chunk");
		Ok(address)
	}

	/// Fetches a generic chunk. Absent chunks come back zero filled.
	pub fn retrieve_chunk(&self, user: &User, address: &Hash) -> Result<Vec<u8>> {
		let stored = match self.store.get(address)? {
			Some(stored) => stored,
			None => {
				debug!(address = %to_hex(address), "chunk absent");
				return Ok(vec![0u8; CHUNK_SIZE]);
			},
		};

		let chunk = if stored.encrypted {
			let mut chunk = self.keys.decrypt(&user.address, &stored.data)?;
			if chunk.len() == SEALED_SPAN {
				chunk.resize(CHUNK_SIZE, 0);
			}
			chunk
		} else {
			stored.data
		};

		if chunk.len() != CHUNK_SIZE {
			bail!(ErrorKind::Integrity(format!("chunk {} has length {}", to_hex(address), chunk.len())));
		}
		if chunk_address(&chunk) != *address {
			bail!(ErrorKind::Integrity(format!("chunk {} does not match its address", to_hex(address))));
		}
		Ok(chunk)
	}

	/// Like `retrieve_chunk` but `None` for absent or zero chunks.
	pub fn retrieve_existing(&self, user: &User, address: &Hash) -> Result<Option<Vec<u8>>> {
		let chunk = self.retrieve_chunk(user, address)?;
		if is_zero(&chunk) {
			Ok(None)
		} else {
			Ok(Some(chunk))
		}
	}

	/// Signs `header` and stores a row chunk carrying `payload` at
	/// `header.key`.
	pub fn store_k_chunk(&self, user: &User, header: &ChunkHeader, payload: &[u8]) -> Result<Hash> {
		let limit = if header.encrypted { MAX_SEALED_PAYLOAD } else { PAYLOAD_SIZE };
		if payload.len() > limit {
			bail!(ErrorKind::Size(format!("row of {} bytes exceeds {}", payload.len(), limit)));
		}

		let mut chunk = vec![0u8; CHUNK_SIZE];
		chunk[..HEADER_SIZE].copy_from_slice(&build_chunk_header(&*self.keys, header)?);
		if header.encrypted {
			let mut padded = vec![0u8; MAX_SEALED_PAYLOAD];
			padded[..payload.len()].copy_from_slice(payload);
			let sealed = self.keys.encrypt(&user.address, &padded)?;
			chunk[HEADER_SIZE..].copy_from_slice(&sealed);
		} else {
			chunk[HEADER_SIZE..HEADER_SIZE + payload.len()].copy_from_slice(payload);
		}

		self.store.put(&header.key, &chunk, false)?;
		debug!(fingerprint = %to_hex(&header.key), version = header.version, "stored row chunk");
		Ok(header.key)
	}

	/// Fetches a row chunk, verifies its header and opens its payload.
	///
	/// Returns the header and the payload with trailing zeros trimmed.
	pub fn retrieve_k_chunk(&self, user: &User, fingerprint: &Hash) -> Result<Option<(ChunkHeader, Vec<u8>)>> {
		let chunk = match self.store.get(fingerprint)? {
			Some(stored) => stored.data,
			None => return Ok(None),
		};
		if is_zero(&chunk) {
			return Ok(None);
		}

		let header = parse_chunk_header(&*self.keys, &chunk)?;
		if header.key != *fingerprint {
			bail!(ErrorKind::Integrity(format!("row chunk {} carries key {}", to_hex(fingerprint), to_hex(&header.key))));
		}

		let payload = if header.encrypted {
			self.keys.decrypt(&user.address, &chunk[HEADER_SIZE..])?
		} else {
			chunk[HEADER_SIZE..].to_vec()
		};
		let payload = trim_zeros(&payload).to_vec();
		Ok(Some((header, payload)))
	}

	/// Raw chunk store access.
	pub fn store(&self) -> &dyn ChunkStore {
		&*self.store
	}
}
