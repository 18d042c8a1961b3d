//! Raw content-addressed chunk storage.
//!
//! Stores do not interpret chunks. They keep the bytes handed to them under
//! the address chosen by the codec together with the `encrypted` flag, so the
//! codec knows whether the blob has to be opened on the way out.
//!
//! The file store keeps one file per chunk:
//!
//! ```text
//!  flag  blob
//!   /     /
//! |.|...........|
//! ```

use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind as IoErrorKind, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use parking_lot::RwLock;

use error::{ErrorKind, Result, ResultExt};
use hash::{to_hex, Hash};

/// A blob as it was handed to the store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredChunk {
	pub data: Vec<u8>,
	pub encrypted: bool,
}

/// Content-addressed put/get. Implementations must be atomic per call.
pub trait ChunkStore: Send + Sync {
	fn put(&self, address: &Hash, data: &[u8], encrypted: bool) -> Result<()>;

	/// `None` when nothing was ever stored under `address`.
	fn get(&self, address: &Hash) -> Result<Option<StoredChunk>>;
}

/// Chunk store backed by a hash map.
#[derive(Debug, Default)]
pub struct MemoryChunkStore {
	chunks: RwLock<HashMap<Hash, StoredChunk>>,
}

impl MemoryChunkStore {
	pub fn new() -> Self {
		MemoryChunkStore::default()
	}

	pub fn len(&self) -> usize {
		self.chunks.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.chunks.read().is_empty()
	}

	/// Mutable access to a stored blob. Tests use this to corrupt chunks.
	pub fn with_chunk_mut<F, T>(&self, address: &Hash, f: F) -> Option<T> where
		F: FnOnce(&mut StoredChunk) -> T,
	{
		self.chunks.write().get_mut(address).map(f)
	}
}

impl ChunkStore for MemoryChunkStore {
	fn put(&self, address: &Hash, data: &[u8], encrypted: bool) -> Result<()> {
		self.chunks.write().insert(*address, StoredChunk {
			data: data.to_vec(),
			encrypted,
		});
		Ok(())
	}

	fn get(&self, address: &Hash) -> Result<Option<StoredChunk>> {
		Ok(self.chunks.read().get(address).cloned())
	}
}

/// Chunk store keeping one file per chunk in a directory.
#[derive(Debug)]
pub struct FileChunkStore {
	path: PathBuf,
	// Held for the lifetime of the store.
	_lock_file: fs::File,
}

impl FileChunkStore {
	const LOCK_FILE: &'static str = "LOCK";

	fn acquire_lock_file<P: AsRef<Path>>(path: P) -> Result<fs::File> {
		let lock_file_path = path.as_ref().join(Self::LOCK_FILE);
		let lock_file = fs::OpenOptions::new()
			.write(true)
			.create(true)
			.open(&lock_file_path)?;
		lock_file.try_lock_exclusive().map_err(|_| ErrorKind::StoreLocked(lock_file_path))?;

		Ok(lock_file)
	}

	/// Opens the store at `path`, creating the directory if necessary.
	pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
		fs::create_dir_all(&path)
			.chain_err(|| ErrorKind::Backend(format!("cannot create {}", path.as_ref().display())))?;
		let lock_file = Self::acquire_lock_file(&path)?;

		Ok(FileChunkStore {
			path: path.as_ref().to_path_buf(),
			_lock_file: lock_file,
		})
	}

	fn chunk_path(&self, address: &Hash) -> PathBuf {
		self.path.join(to_hex(address))
	}
}

impl ChunkStore for FileChunkStore {
	fn put(&self, address: &Hash, data: &[u8], encrypted: bool) -> Result<()> {
		let path = self.chunk_path(address);
		let tmp = path.with_extension("tmp");
		{
			let mut file = fs::File::create(&tmp)
				.chain_err(|| ErrorKind::Backend(format!("cannot create chunk {}", to_hex(address))))?;
			file.write_all(&[encrypted as u8])?;
			file.write_all(data)?;
			file.flush()?;
		}
		fs::rename(&tmp, &path)
			.chain_err(|| ErrorKind::Backend(format!("cannot write chunk {}", to_hex(address))))?;
		Ok(())
	}

	fn get(&self, address: &Hash) -> Result<Option<StoredChunk>> {
		let raw = match fs::read(self.chunk_path(address)) {
			Ok(raw) => raw,
			Err(ref e) if e.kind() == IoErrorKind::NotFound => return Ok(None),
			Err(e) => return Err(e).chain_err(|| ErrorKind::Backend(format!("cannot read chunk {}", to_hex(address)))),
		};

		match raw.split_first() {
			Some((flag, data)) => Ok(Some(StoredChunk {
				data: data.to_vec(),
				encrypted: *flag != 0,
			})),
			None => bail!(ErrorKind::Integrity(format!("chunk file {} is empty", to_hex(address)))),
		}
	}
}

#[cfg(test)]
mod tests {
	extern crate tempdir;

	use self::tempdir::TempDir;
	use error::ErrorKind;
	use super::{ChunkStore, FileChunkStore, MemoryChunkStore};

	#[test]
	fn memory_store_should_keep_flag() {
		let store = MemoryChunkStore::new();
		store.put(&[1; 32], b"abc", true).unwrap();

		let chunk = store.get(&[1; 32]).unwrap().unwrap();
		assert_eq!(chunk.data, b"abc".to_vec());
		assert!(chunk.encrypted);
		assert_eq!(store.get(&[2; 32]).unwrap(), None);
	}

	#[test]
	fn file_store_should_survive_reopen() {
		let temp = TempDir::new("file_store_reopen").unwrap();
		{
			let store = FileChunkStore::open(temp.path()).unwrap();
			store.put(&[7; 32], &[9; 4096], false).unwrap();
		}

		let store = FileChunkStore::open(temp.path()).unwrap();
		let chunk = store.get(&[7; 32]).unwrap().unwrap();
		assert_eq!(chunk.data, vec![9; 4096]);
		assert!(!chunk.encrypted);
		assert_eq!(store.get(&[8; 32]).unwrap(), None);
	}

	#[test]
	fn should_validate_exclusive_access() {
		let temp = TempDir::new("file_store_exclusive_access").unwrap();
		let _store = FileChunkStore::open(temp.path()).unwrap();

		assert_matches!(
			*FileChunkStore::open(temp.path()).unwrap_err().kind(),
			ErrorKind::StoreLocked(_)
		);
	}
}
