//! Unordered index: a 64-way trie over `keccak256(key)`.
//!
//! At level `L` bits `6L..6L + 6` of the key hash pick one of 64 bins. A bin
//! is empty, holds a leaf or holds a deeper branch. The root is always a
//! level 0 branch.
//!
//! Branch chunk:
//!
//! ```text
//!  flag=1   level       bin 0   bin 1         bin 63
//!    /        /           /       /             /
//! |........|.|........|....|.......|.......|...|.......|
//!  0        8 9        17  64      96      128      2112
//! ```
//!
//! Leaf chunk: flag `0` at `0..8`, value at `64..96`, key at `96..128`.
//!
//! Cursors enumerate leaves depth first, bins in ascending order. The order
//! is stable for a given key set but has no meaning for the keys.

use std::fmt::Write;

use byteorder::{ByteOrder, LittleEndian};

use error::{ErrorKind, Result};
use chunk::{ChunkCodec, CHUNK_SIZE};
use hash::{is_zero, keccak256, to_hash, to_hex, Hash, ZERO_HASH};
use index::{Cursor, KeyIndex};
use key::Key;
use options::User;

pub const BINS: usize = 64;
/// Deepest level whose 6 bit window still starts inside a 32 byte hash.
pub const MAX_LEVEL: usize = 43;
/// Maximum depth of a cursor stack.
pub const STACK_SIZE: usize = 100;

const BRANCH_FLAG: u64 = 1;
const LEAF_FLAG: u64 = 0;
const BINS_OFFSET: usize = 64;
const VALUE_OFFSET: usize = 64;
const KEY_OFFSET: usize = 96;

type NodeId = usize;

/// Bin of `key_hash` at `level`.
pub fn hash_bin(key_hash: &Hash, level: usize) -> Result<usize> {
	if level >= MAX_LEVEL {
		bail!(ErrorKind::Integrity(format!("hash trie level {} exceeds {}", level, MAX_LEVEL - 1)));
	}
	let bit = level * 6;
	let byte = bit / 8;
	let hi = key_hash[byte] as u16;
	let lo = if byte + 1 < key_hash.len() { key_hash[byte + 1] as u16 } else { 0 };
	let window = (hi << 8) | lo;
	Ok(((window >> (10 - bit % 8)) & 0x3f) as usize)
}

#[derive(Debug)]
enum Node {
	Unloaded(Hash),
	Branch(Branch),
	Leaf(Leaf),
}

#[derive(Debug)]
struct Branch {
	level: usize,
	bins: Vec<Option<NodeId>>,
	hash: Hash,
	dirty: bool,
}

impl Branch {
	fn empty(level: usize) -> Self {
		Branch {
			level,
			bins: vec![None; BINS],
			hash: ZERO_HASH,
			dirty: false,
		}
	}

	fn occupied(&self) -> usize {
		self.bins.iter().filter(|bin| bin.is_some()).count()
	}
}

#[derive(Debug)]
struct Leaf {
	key: Key,
	value: Hash,
	hash: Hash,
	dirty: bool,
}

impl Leaf {
	fn to_chunk(&self) -> Vec<u8> {
		let mut chunk = vec![0u8; CHUNK_SIZE];
		LittleEndian::write_u64(&mut chunk[0..8], LEAF_FLAG);
		chunk[VALUE_OFFSET..VALUE_OFFSET + 32].copy_from_slice(&self.value);
		chunk[KEY_OFFSET..KEY_OFFSET + 32].copy_from_slice(&self.key);
		chunk
	}
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Kind {
	Branch,
	Leaf,
}

pub struct HashDb {
	codec: ChunkCodec,
	user: User,
	encrypted: bool,
	nodes: Vec<Option<Node>>,
	free: Vec<NodeId>,
	root: NodeId,
	root_hash: Hash,
	buffered: bool,
}

impl HashDb {
	/// Opens the trie rooted at `root_hash`. A zero hash opens an empty trie.
	pub fn open(codec: ChunkCodec, user: User, root_hash: &Hash, encrypted: bool) -> Result<Self> {
		let mut trie = HashDb {
			codec,
			user,
			encrypted,
			nodes: Vec::new(),
			free: Vec::new(),
			root: 0,
			root_hash: *root_hash,
			buffered: false,
		};
		let root = if is_zero(root_hash) {
			Node::Branch(Branch::empty(0))
		} else {
			match trie.fetch(root_hash, 0)? {
				node @ Node::Branch(_) => node,
				_ => bail!(ErrorKind::Integrity(format!("hash trie root {} is a leaf", to_hex(root_hash)))),
			}
		};
		trie.root = trie.alloc(root);
		Ok(trie)
	}

	fn alloc(&mut self, node: Node) -> NodeId {
		match self.free.pop() {
			Some(id) => {
				self.nodes[id] = Some(node);
				id
			},
			None => {
				self.nodes.push(Some(node));
				self.nodes.len() - 1
			},
		}
	}

	fn release(&mut self, id: NodeId) {
		self.nodes[id] = None;
		self.free.push(id);
	}

	fn node(&self, id: NodeId) -> &Node {
		self.nodes[id].as_ref().expect("node ids held by the trie are live; qed")
	}

	fn node_mut(&mut self, id: NodeId) -> &mut Node {
		self.nodes[id].as_mut().expect("node ids held by the trie are live; qed")
	}

	fn branch(&self, id: NodeId) -> &Branch {
		match *self.node(id) {
			Node::Branch(ref branch) => branch,
			_ => unreachable!("node {} was loaded as a branch; qed", id),
		}
	}

	fn branch_mut(&mut self, id: NodeId) -> &mut Branch {
		match *self.node_mut(id) {
			Node::Branch(ref mut branch) => branch,
			_ => unreachable!("node {} was loaded as a branch; qed", id),
		}
	}

	fn leaf(&self, id: NodeId) -> &Leaf {
		match *self.node(id) {
			Node::Leaf(ref leaf) => leaf,
			_ => unreachable!("node {} was loaded as a leaf; qed", id),
		}
	}

	fn fetch(&mut self, hash: &Hash, level: usize) -> Result<Node> {
		let chunk = self.codec.retrieve_existing(&self.user, hash)?
			.ok_or_else(|| ErrorKind::NotFound(format!("hash trie node {}", to_hex(hash))))?;

		match LittleEndian::read_u64(&chunk[0..8]) {
			BRANCH_FLAG => {
				let stored_level = LittleEndian::read_u64(&chunk[9..17]) as usize;
				if stored_level != level {
					bail!(ErrorKind::Integrity(format!(
						"hash trie branch {} has level {}, expected {}", to_hex(hash), stored_level, level
					)));
				}
				let mut branch = Branch::empty(level);
				branch.hash = *hash;
				for i in 0..BINS {
					let child = &chunk[BINS_OFFSET + 32 * i..BINS_OFFSET + 32 * (i + 1)];
					if !is_zero(child) {
						branch.bins[i] = Some(self.alloc(Node::Unloaded(to_hash(child))));
					}
				}
				Ok(Node::Branch(branch))
			},
			LEAF_FLAG => {
				let value = to_hash(&chunk[VALUE_OFFSET..VALUE_OFFSET + 32]);
				if is_zero(&value) {
					bail!(ErrorKind::Integrity(format!("hash trie leaf {} has no value", to_hex(hash))));
				}
				Ok(Node::Leaf(Leaf {
					key: to_hash(&chunk[KEY_OFFSET..KEY_OFFSET + 32]),
					value,
					hash: *hash,
					dirty: false,
				}))
			},
			flag => bail!(ErrorKind::Integrity(format!("hash trie node {} has flag {}", to_hex(hash), flag))),
		}
	}

	/// Loads `id` as a node found at `level`.
	fn load(&mut self, id: NodeId, level: usize) -> Result<Kind> {
		let hash = match *self.node(id) {
			Node::Branch(_) => return Ok(Kind::Branch),
			Node::Leaf(_) => return Ok(Kind::Leaf),
			Node::Unloaded(hash) => hash,
		};
		let node = self.fetch(&hash, level)?;
		*self.node_mut(id) = node;
		Ok(match *self.node(id) {
			Node::Branch(_) => Kind::Branch,
			_ => Kind::Leaf,
		})
	}

	fn check_flush(&mut self) -> Result<()> {
		if !self.buffered {
			self.flush_buffer()?;
		}
		Ok(())
	}

	pub fn get(&mut self, key: &Key) -> Result<Option<Hash>> {
		let key_hash = keccak256(key);
		let mut id = self.root;
		let mut level = 0;
		loop {
			let bin = hash_bin(&key_hash, level)?;
			let child = match self.branch(id).bins[bin] {
				Some(child) => child,
				None => return Ok(None),
			};
			match self.load(child, level + 1)? {
				Kind::Leaf => {
					let leaf = self.leaf(child);
					return Ok(if leaf.key == *key { Some(leaf.value) } else { None });
				},
				Kind::Branch => {
					id = child;
					level += 1;
				},
			}
		}
	}

	pub fn put(&mut self, key: &Key, value: &Hash) -> Result<bool> {
		let key_hash = keccak256(key);
		let root = self.root;
		let was_new = self.add(root, 0, &key_hash, key, value)?;
		self.check_flush()?;
		Ok(was_new)
	}

	pub fn insert(&mut self, key: &Key, value: &Hash) -> Result<()> {
		if self.get(key)?.is_some() {
			bail!(ErrorKind::AlreadyExists(format!("hash trie key {}", to_hex(key))));
		}
		self.put(key, value).map(|_| ())
	}

	fn add(&mut self, id: NodeId, level: usize, key_hash: &Hash, key: &Key, value: &Hash) -> Result<bool> {
		let bin = hash_bin(key_hash, level)?;
		self.branch_mut(id).dirty = true;

		let child = match self.branch(id).bins[bin] {
			Some(child) => child,
			None => {
				let leaf = self.alloc(Node::Leaf(Leaf { key: *key, value: *value, hash: ZERO_HASH, dirty: true }));
				self.branch_mut(id).bins[bin] = Some(leaf);
				return Ok(true);
			},
		};

		match self.load(child, level + 1)? {
			Kind::Branch => self.add(child, level + 1, key_hash, key, value),
			Kind::Leaf => {
				let existing = self.leaf(child).key;
				if existing == *key {
					if let Node::Leaf(ref mut leaf) = *self.node_mut(child) {
						leaf.value = *value;
						leaf.dirty = true;
					}
					return Ok(false);
				}

				// Push the resident leaf one level down and retry there.
				let mut split = Branch::empty(level + 1);
				split.bins[hash_bin(&keccak256(&existing), level + 1)?] = Some(child);
				let split = self.alloc(Node::Branch(split));
				self.branch_mut(id).bins[bin] = Some(split);
				self.add(split, level + 1, key_hash, key, value)
			},
		}
	}

	pub fn delete(&mut self, key: &Key) -> Result<bool> {
		let key_hash = keccak256(key);
		let root = self.root;
		let found = self.remove(root, 0, &key_hash, key)?;
		if found {
			self.check_flush()?;
		}
		Ok(found)
	}

	fn remove(&mut self, id: NodeId, level: usize, key_hash: &Hash, key: &Key) -> Result<bool> {
		let bin = hash_bin(key_hash, level)?;
		let child = match self.branch(id).bins[bin] {
			Some(child) => child,
			None => return Ok(false),
		};

		match self.load(child, level + 1)? {
			Kind::Leaf => {
				if self.leaf(child).key != *key {
					return Ok(false);
				}
				self.release(child);
				let branch = self.branch_mut(id);
				branch.bins[bin] = None;
				branch.dirty = true;
				Ok(true)
			},
			Kind::Branch => {
				if !self.remove(child, level + 1, key_hash, key)? {
					return Ok(false);
				}
				self.branch_mut(id).dirty = true;
				self.compact(id, bin, child, level + 1)?;
				Ok(true)
			},
		}
	}

	/// Replaces the branch in `bin` of `parent` by its only child if that
	/// child is a leaf, or drops it if it became empty.
	fn compact(&mut self, parent: NodeId, bin: usize, child: NodeId, level: usize) -> Result<()> {
		let remaining: Vec<NodeId> = self.branch(child).bins.iter().filter_map(|b| *b).collect();
		match remaining.len() {
			0 => {
				self.release(child);
				self.branch_mut(parent).bins[bin] = None;
			},
			1 => {
				let only = remaining[0];
				if self.load(only, level + 1)? == Kind::Leaf {
					self.release(child);
					self.branch_mut(parent).bins[bin] = Some(only);
				}
			},
			_ => (),
		}
		Ok(())
	}

	pub fn start_buffer(&mut self) -> Result<()> {
		self.buffered = true;
		Ok(())
	}

	pub fn flush_buffer(&mut self) -> Result<Hash> {
		let root = self.root;
		let hash = if self.branch(root).occupied() == 0 {
			let branch = self.branch_mut(root);
			branch.dirty = false;
			branch.hash = ZERO_HASH;
			ZERO_HASH
		} else {
			self.flush_node(root)?.0
		};
		self.buffered = false;
		if hash != self.root_hash {
			debug!(root = %to_hex(&hash), "flushed hash trie");
		}
		self.root_hash = hash;
		Ok(hash)
	}

	fn flush_node(&mut self, id: NodeId) -> Result<(Hash, bool)> {
		let mut chunk = match *self.node(id) {
			Node::Unloaded(hash) => return Ok((hash, false)),
			Node::Leaf(ref leaf) if !leaf.dirty => return Ok((leaf.hash, false)),
			Node::Branch(ref branch) if !branch.dirty => return Ok((branch.hash, false)),
			Node::Leaf(ref leaf) => leaf.to_chunk(),
			Node::Branch(ref branch) => {
				let mut chunk = vec![0u8; CHUNK_SIZE];
				LittleEndian::write_u64(&mut chunk[0..8], BRANCH_FLAG);
				LittleEndian::write_u64(&mut chunk[9..17], branch.level as u64);
				chunk
			},
		};

		if let Node::Branch(_) = *self.node(id) {
			let bins = self.branch(id).bins.clone();
			for (i, bin) in bins.iter().enumerate() {
				if let Some(child) = *bin {
					let (hash, _) = self.flush_node(child)?;
					chunk[BINS_OFFSET + 32 * i..BINS_OFFSET + 32 * (i + 1)].copy_from_slice(&hash);
				}
			}
		}

		let hash = self.codec.store_chunk(&self.user, &chunk, self.encrypted)?;
		match *self.node_mut(id) {
			Node::Leaf(ref mut leaf) => {
				leaf.hash = hash;
				leaf.dirty = false;
			},
			Node::Branch(ref mut branch) => {
				branch.hash = hash;
				branch.dirty = false;
			},
			Node::Unloaded(_) => unreachable!("dirty nodes are loaded; qed"),
		}
		Ok((hash, true))
	}

	pub fn seek(&mut self, key: &Key) -> Result<(TrieCursor, bool)> {
		let mut cursor = TrieCursor::new(self);
		let hit = cursor.seek(key)?;
		Ok((cursor, hit))
	}

	pub fn seek_first(&mut self) -> Result<TrieCursor> {
		let mut cursor = TrieCursor::new(self);
		let root = cursor.trie.root;
		if cursor.first_from(root, 0, 0)? {
			cursor.hit = true;
		} else {
			cursor.eof = true;
		}
		Ok(cursor)
	}

	pub fn seek_last(&mut self) -> Result<TrieCursor> {
		let mut cursor = TrieCursor::new(self);
		let root = cursor.trie.root;
		if cursor.last_before(root, BINS, 0)? {
			cursor.hit = true;
		} else {
			cursor.eof = true;
		}
		Ok(cursor)
	}

	pub fn root_hash(&self) -> Hash {
		self.root_hash
	}

	pub fn print(&self) -> String {
		let mut out = String::new();
		let _ = writeln!(out, "root {} level 0", to_hex(&self.branch(self.root).hash));
		self.print_branch(self.root, 1, &mut out);
		out
	}

	fn print_branch(&self, id: NodeId, depth: usize, out: &mut String) {
		let indent = "  ".repeat(depth);
		for (bin, child) in self.branch(id).bins.iter().enumerate() {
			let child = match *child {
				Some(child) => child,
				None => continue,
			};
			match *self.node(child) {
				Node::Unloaded(ref hash) => {
					let _ = writeln!(out, "{}bin {} {} (not loaded)", indent, bin, to_hex(hash));
				},
				Node::Leaf(ref leaf) => {
					let _ = writeln!(out, "{}bin {} leaf {} -> {}", indent, bin, to_hex(&leaf.key), to_hex(&leaf.value));
				},
				Node::Branch(ref branch) => {
					let _ = writeln!(out, "{}bin {} branch level {} dirty={}", indent, bin, branch.level, branch.dirty);
					self.print_branch(child, depth + 1, out);
				},
			}
		}
	}
}

/// Depth first cursor over a hash trie. The path holds `(branch, bin)`
/// pairs down to the current leaf.
pub struct TrieCursor<'a> {
	trie: &'a mut HashDb,
	path: Vec<(NodeId, usize)>,
	hit: bool,
	past_end: bool,
	eof: bool,
}

impl<'a> TrieCursor<'a> {
	fn new(trie: &'a mut HashDb) -> Self {
		TrieCursor {
			trie,
			path: Vec::with_capacity(STACK_SIZE),
			hit: false,
			past_end: false,
			eof: false,
		}
	}

	fn push(&mut self, branch: NodeId, bin: usize) -> Result<()> {
		if self.path.len() >= STACK_SIZE {
			bail!(ErrorKind::Integrity(format!("hash trie cursor deeper than {}", STACK_SIZE)));
		}
		self.path.push((branch, bin));
		Ok(())
	}

	/// Positions on the first leaf below `branch` in bins `start..`.
	fn first_from(&mut self, branch: NodeId, start: usize, level: usize) -> Result<bool> {
		for bin in start..BINS {
			let child = match self.trie.branch(branch).bins[bin] {
				Some(child) => child,
				None => continue,
			};
			self.push(branch, bin)?;
			match self.trie.load(child, level + 1)? {
				Kind::Leaf => return Ok(true),
				Kind::Branch => {
					if self.first_from(child, 0, level + 1)? {
						return Ok(true);
					}
				},
			}
			self.path.pop();
		}
		Ok(false)
	}

	/// Positions on the last leaf below `branch` in bins `..end`.
	fn last_before(&mut self, branch: NodeId, end: usize, level: usize) -> Result<bool> {
		for bin in (0..end).rev() {
			let child = match self.trie.branch(branch).bins[bin] {
				Some(child) => child,
				None => continue,
			};
			self.push(branch, bin)?;
			match self.trie.load(child, level + 1)? {
				Kind::Leaf => return Ok(true),
				Kind::Branch => {
					if self.last_before(child, BINS, level + 1)? {
						return Ok(true);
					}
				},
			}
			self.path.pop();
		}
		Ok(false)
	}

	fn advance(&mut self) -> Result<bool> {
		while let Some((branch, bin)) = self.path.pop() {
			let level = self.path.len();
			if self.first_from(branch, bin + 1, level)? {
				return Ok(true);
			}
		}
		Ok(false)
	}

	fn retreat(&mut self) -> Result<bool> {
		while let Some((branch, bin)) = self.path.pop() {
			let level = self.path.len();
			if self.last_before(branch, bin, level)? {
				return Ok(true);
			}
		}
		Ok(false)
	}

	fn seek(&mut self, key: &Key) -> Result<bool> {
		let key_hash = keccak256(key);
		let mut branch = self.trie.root;
		let mut level = 0;

		let found_successor = loop {
			let bin = hash_bin(&key_hash, level)?;
			let child = match self.trie.branch(branch).bins[bin] {
				Some(child) => child,
				None => break self.first_from(branch, bin + 1, level)? || self.advance()?,
			};
			self.push(branch, bin)?;
			match self.trie.load(child, level + 1)? {
				Kind::Branch => {
					branch = child;
					level += 1;
				},
				Kind::Leaf => {
					let resident = self.trie.leaf(child).key;
					if resident == *key {
						self.hit = true;
						return Ok(true);
					}
					if precedes(&key_hash, &keccak256(&resident), level + 1)? {
						break true;
					}
					break self.advance()?;
				},
			}
		};

		if !found_successor {
			self.path.clear();
			let root = self.trie.root;
			if self.last_before(root, BINS, 0)? {
				self.past_end = true;
			} else {
				self.eof = true;
			}
		}
		Ok(false)
	}

	fn current(&self) -> (Key, Hash) {
		let &(branch, bin) = self.path.last().expect("cursor positioned on a leaf; qed");
		let leaf = self.trie.branch(branch).bins[bin].expect("cursor path points at a child; qed");
		let leaf = self.trie.leaf(leaf);
		(leaf.key, leaf.value)
	}
}

/// Whether a key hashing to `a` is enumerated before one hashing to `b`,
/// given both share every bin above `level`.
fn precedes(a: &Hash, b: &Hash, mut level: usize) -> Result<bool> {
	while level < MAX_LEVEL {
		let (x, y) = (hash_bin(a, level)?, hash_bin(b, level)?);
		if x != y {
			return Ok(x < y);
		}
		level += 1;
	}
	Ok(a < b)
}

impl<'a> Cursor for TrieCursor<'a> {
	fn next(&mut self) -> Result<Option<(Key, Hash)>> {
		if self.eof || self.past_end || self.path.is_empty() {
			self.eof = true;
			return Ok(None);
		}
		let item = self.current();
		self.hit = true;
		if !self.advance()? {
			self.eof = true;
		}
		Ok(Some(item))
	}

	fn prev(&mut self) -> Result<Option<(Key, Hash)>> {
		if self.eof || self.path.is_empty() {
			self.eof = true;
			return Ok(None);
		}
		if !self.hit && !self.past_end && !self.retreat()? {
			self.eof = true;
			return Ok(None);
		}
		let item = self.current();
		self.hit = true;
		self.past_end = false;
		if !self.retreat()? {
			self.eof = true;
		}
		Ok(Some(item))
	}
}

impl KeyIndex for HashDb {
	fn get(&mut self, key: &Key) -> Result<Option<Hash>> {
		HashDb::get(self, key)
	}

	fn put(&mut self, key: &Key, value: &Hash) -> Result<bool> {
		HashDb::put(self, key, value)
	}

	fn insert(&mut self, key: &Key, value: &Hash) -> Result<()> {
		HashDb::insert(self, key, value)
	}

	fn delete(&mut self, key: &Key) -> Result<bool> {
		HashDb::delete(self, key)
	}

	fn seek<'a>(&'a mut self, key: &Key) -> Result<(Box<dyn Cursor + 'a>, bool)> {
		let (cursor, hit) = HashDb::seek(self, key)?;
		Ok((Box::new(cursor), hit))
	}

	fn seek_first<'a>(&'a mut self) -> Result<Box<dyn Cursor + 'a>> {
		Ok(Box::new(HashDb::seek_first(self)?))
	}

	fn seek_last<'a>(&'a mut self) -> Result<Box<dyn Cursor + 'a>> {
		Ok(Box::new(HashDb::seek_last(self)?))
	}

	fn start_buffer(&mut self) -> Result<()> {
		HashDb::start_buffer(self)
	}

	fn flush_buffer(&mut self) -> Result<Hash> {
		HashDb::flush_buffer(self)
	}

	fn root_hash(&self) -> Hash {
		self.root_hash
	}

	fn set_user(&mut self, user: &User) {
		self.user = *user;
	}

	fn print(&self) -> String {
		HashDb::print(self)
	}
}
