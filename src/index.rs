//! The column index contract and the two index families behind it.

use error::Result;
use bplus::BPlusTree;
use hash::Hash;
use hashdb::HashDb;
use key::{IndexType, Key};
use options::User;

/// Iterates `(key, value)` pairs. Once `None` is returned the cursor stays
/// exhausted in both directions.
pub trait Cursor {
	fn next(&mut self) -> Result<Option<(Key, Hash)>>;

	fn prev(&mut self) -> Result<Option<(Key, Hash)>>;
}

/// A chunk backed map from 32 byte keys to 32 byte values.
pub trait KeyIndex {
	fn get(&mut self, key: &Key) -> Result<Option<Hash>>;

	/// Inserts or overwrites. Returns `true` if the key was new.
	fn put(&mut self, key: &Key, value: &Hash) -> Result<bool>;

	/// Inserts, failing with `AlreadyExists` if the key is present.
	fn insert(&mut self, key: &Key, value: &Hash) -> Result<()>;

	/// Returns `true` if the key was present.
	fn delete(&mut self, key: &Key) -> Result<bool>;

	/// Positions a cursor at `key`, or where it would be. The flag tells
	/// whether `key` is present.
	fn seek<'a>(&'a mut self, key: &Key) -> Result<(Box<dyn Cursor + 'a>, bool)>;

	fn seek_first<'a>(&'a mut self) -> Result<Box<dyn Cursor + 'a>>;

	fn seek_last<'a>(&'a mut self) -> Result<Box<dyn Cursor + 'a>>;

	fn start_buffer(&mut self) -> Result<()>;

	/// Writes every dirty node and returns the new root hash.
	fn flush_buffer(&mut self) -> Result<Hash>;

	fn close(&mut self) -> Result<Hash> {
		self.flush_buffer()
	}

	/// Root hash as of the last flush.
	fn root_hash(&self) -> Hash;

	/// Changes the user nodes are written and sealed for.
	fn set_user(&mut self, user: &User);

	/// Renders the in-memory part of the index.
	fn print(&self) -> String;
}

pub enum Index {
	BPlus(BPlusTree),
	HashTrie(HashDb),
}

impl Index {
	pub fn index_type(&self) -> IndexType {
		match *self {
			Index::BPlus(_) => IndexType::BPlusTree,
			Index::HashTrie(_) => IndexType::HashTrie,
		}
	}

	pub fn as_index_mut(&mut self) -> &mut dyn KeyIndex {
		match *self {
			Index::BPlus(ref mut tree) => tree as &mut dyn KeyIndex,
			Index::HashTrie(ref mut trie) => trie as &mut dyn KeyIndex,
		}
	}

	pub fn as_index(&self) -> &dyn KeyIndex {
		match *self {
			Index::BPlus(ref tree) => tree as &dyn KeyIndex,
			Index::HashTrie(ref trie) => trie as &dyn KeyIndex,
		}
	}
}

impl KeyIndex for Index {
	fn get(&mut self, key: &Key) -> Result<Option<Hash>> {
		self.as_index_mut().get(key)
	}

	fn put(&mut self, key: &Key, value: &Hash) -> Result<bool> {
		self.as_index_mut().put(key, value)
	}

	fn insert(&mut self, key: &Key, value: &Hash) -> Result<()> {
		self.as_index_mut().insert(key, value)
	}

	fn delete(&mut self, key: &Key) -> Result<bool> {
		self.as_index_mut().delete(key)
	}

	fn seek<'a>(&'a mut self, key: &Key) -> Result<(Box<dyn Cursor + 'a>, bool)> {
		self.as_index_mut().seek(key)
	}

	fn seek_first<'a>(&'a mut self) -> Result<Box<dyn Cursor + 'a>> {
		self.as_index_mut().seek_first()
	}

	fn seek_last<'a>(&'a mut self) -> Result<Box<dyn Cursor + 'a>> {
		self.as_index_mut().seek_last()
	}

	fn start_buffer(&mut self) -> Result<()> {
		self.as_index_mut().start_buffer()
	}

	fn flush_buffer(&mut self) -> Result<Hash> {
		self.as_index_mut().flush_buffer()
	}

	fn root_hash(&self) -> Hash {
		self.as_index().root_hash()
	}

	fn set_user(&mut self, user: &User) {
		self.as_index_mut().set_user(user)
	}

	fn print(&self) -> String {
		self.as_index().print()
	}
}

/// Drains a cursor forwards.
pub fn collect_forward(cursor: &mut dyn Cursor) -> Result<Vec<(Key, Hash)>> {
	let mut out = Vec::new();
	while let Some(item) = cursor.next()? {
		out.push(item);
	}
	Ok(out)
}

/// Drains a cursor backwards.
pub fn collect_backward(cursor: &mut dyn Cursor) -> Result<Vec<(Key, Hash)>> {
	let mut out = Vec::new();
	while let Some(item) = cursor.prev()? {
		out.push(item);
	}
	Ok(out)
}
