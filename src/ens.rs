//! The name service: the only mutable state of the database.
//!
//! Names are owner hashes (for the owner directory chunk) or table keys
//! `owner|database|table` (for table descriptor chunks). A zero hash means
//! the name is absent.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use hex;
use parking_lot::RwLock;
use serde_json;

use error::{ErrorKind, Result, ResultExt};
use hash::{is_zero, to_hex, Hash};

/// Last-writer-wins mapping of names to root hashes.
pub trait NameService: Send + Sync {
	fn get_root_hash(&self, name: &[u8]) -> Result<Option<Hash>>;

	fn store_root_hash(&self, name: &[u8], hash: &Hash) -> Result<()>;

	/// Confirms every write made so far. Returns how many were confirmed.
	fn commit_pending(&self) -> Result<usize> {
		Ok(0)
	}
}

#[derive(Debug, Default)]
pub struct MemoryNameService {
	roots: RwLock<HashMap<Vec<u8>, Hash>>,
}

impl MemoryNameService {
	pub fn new() -> Self {
		MemoryNameService::default()
	}
}

impl NameService for MemoryNameService {
	fn get_root_hash(&self, name: &[u8]) -> Result<Option<Hash>> {
		Ok(self.roots.read().get(name).cloned().filter(|h| !is_zero(h)))
	}

	fn store_root_hash(&self, name: &[u8], hash: &Hash) -> Result<()> {
		self.roots.write().insert(name.to_vec(), *hash);
		Ok(())
	}
}

/// Publication state of a mirrored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
	Fresh,
	Committed,
	Failed,
}

impl Status {
	pub fn code(&self) -> u8 {
		match *self {
			Status::Fresh => 0,
			Status::Committed => 1,
			Status::Failed => 2,
		}
	}

	pub fn from_code(code: u8) -> Option<Status> {
		match code {
			0 => Some(Status::Fresh),
			1 => Some(Status::Committed),
			2 => Some(Status::Failed),
			_ => None,
		}
	}
}

/// On-disk record: `{ "root": hex, "status": 0|1|2, "prevRoot": hex? }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
	pub root: String,
	pub status: u8,
	#[serde(rename = "prevRoot", default, skip_serializing_if = "Option::is_none")]
	pub prev_root: Option<String>,
}

impl Record {
	pub fn status(&self) -> Result<Status> {
		Status::from_code(self.status)
			.ok_or_else(|| ErrorKind::Integrity(format!("unknown name service status {}", self.status)).into())
	}

	fn resolve(&self) -> Result<Option<Hash>> {
		let root = match self.status()? {
			Status::Failed => match self.prev_root {
				Some(ref prev) => prev,
				None => return Ok(None),
			},
			_ => &self.root,
		};
		let hash = decode_hash(root)?;
		Ok(Some(hash).filter(|h| !is_zero(h)))
	}
}

fn decode_hash(s: &str) -> Result<Hash> {
	let raw = hex::decode(s)
		.map_err(|e| ErrorKind::Integrity(format!("name service root {}: {}", s, e)))?;
	if raw.len() != 32 {
		bail!(ErrorKind::Integrity(format!("name service root {} is not 32 bytes", s)));
	}
	let mut hash = [0u8; 32];
	hash.copy_from_slice(&raw);
	Ok(hash)
}

/// Name service mirrored into a JSON file.
///
/// Every write is recorded as `fresh` until the surrounding registry
/// confirms it with [`commit_pending`](#method.commit_pending) or rejects
/// it with [`mark_failed`](#method.mark_failed). A failed record falls back
/// to the root it replaced.
#[derive(Debug)]
pub struct FileNameService {
	path: PathBuf,
	records: RwLock<HashMap<String, Record>>,
}

impl FileNameService {
	pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
		let path = path.as_ref().to_path_buf();
		let records = if path.exists() {
			let data = fs::read(&path)
				.chain_err(|| ErrorKind::Backend(format!("cannot read {}", path.display())))?;
			serde_json::from_slice(&data)?
		} else {
			HashMap::new()
		};

		Ok(FileNameService {
			path,
			records: RwLock::new(records),
		})
	}

	fn persist(&self, records: &HashMap<String, Record>) -> Result<()> {
		let tmp = self.path.with_extension("tmp");
		{
			let mut file = fs::File::create(&tmp)
				.chain_err(|| ErrorKind::Backend(format!("cannot create {}", tmp.display())))?;
			file.write_all(&serde_json::to_vec(records)?)?;
			file.flush()?;
		}
		fs::rename(&tmp, &self.path)
			.chain_err(|| ErrorKind::Backend(format!("cannot replace {}", self.path.display())))?;
		Ok(())
	}

	/// Marks every fresh record committed. Returns how many were committed.
	pub fn commit_pending(&self) -> Result<usize> {
		let mut records = self.records.write();
		let mut committed = 0;
		for record in records.values_mut().filter(|r| r.status == Status::Fresh.code()) {
			record.status = Status::Committed.code();
			committed += 1;
		}
		if committed > 0 {
			self.persist(&records)?;
		}
		Ok(committed)
	}

	/// Marks the latest write of `name` as failed.
	pub fn mark_failed(&self, name: &[u8]) -> Result<()> {
		let mut records = self.records.write();
		match records.get_mut(&to_hex(name)) {
			Some(record) => {
				warn!(name = %String::from_utf8_lossy(name), "name service record failed, falling back");
				record.status = Status::Failed.code();
			},
			None => bail!(ErrorKind::NotFound(format!("name service record {}", String::from_utf8_lossy(name)))),
		}
		self.persist(&records)
	}

	pub fn status(&self, name: &[u8]) -> Option<Status> {
		self.records.read().get(&to_hex(name)).and_then(|r| Status::from_code(r.status))
	}
}

impl NameService for FileNameService {
	fn get_root_hash(&self, name: &[u8]) -> Result<Option<Hash>> {
		match self.records.read().get(&to_hex(name)) {
			Some(record) => record.resolve(),
			None => Ok(None),
		}
	}

	fn store_root_hash(&self, name: &[u8], hash: &Hash) -> Result<()> {
		let mut records = self.records.write();
		let key = to_hex(name);
		let prev_root = records.get(&key).and_then(|r| match Status::from_code(r.status) {
			Some(Status::Failed) => r.prev_root.clone(),
			_ => Some(r.root.clone()),
		});
		records.insert(key, Record {
			root: to_hex(hash),
			status: Status::Fresh.code(),
			prev_root,
		});
		debug!(name = %String::from_utf8_lossy(name), root = %to_hex(hash), "published root");
		self.persist(&records)
	}

	fn commit_pending(&self) -> Result<usize> {
		FileNameService::commit_pending(self)
	}
}
