//! Ordered index: a B+ tree whose nodes are chunks.
//!
//! Branch (`X`) nodes and leaf (`D`) nodes are each stored in one chunk of
//! 64 byte slots:
//!
//! ```text
//!  slot 0        slot 1              kind child prev    next
//!   /             /                    /   /    /       /
//! |key|hash|key|hash|...|.........|.|.|........|........|
//!  0   32   64  96                4030 4031 4032 4064 4096
//! ```
//!
//! A branch with `c` keys uses `c + 1` slots, the last one carrying only a
//! child hash. Branch child kind is `X` or `D`; leaves write `C`. Leaves
//! store up to `2 * KD + 1` pairs and the hashes of their neighbours.
//!
//! Nodes live in an arena and are loaded on first touch. Mutations mark the
//! path dirty; a flush writes dirty nodes bottom-up and returns the new root
//! hash.
//!
//! Neighbour hashes are hints for the storage fabric. A rewritten leaf gets
//! the hash of its left neighbour from the same flush when it is known,
//! while its right neighbour hash may trail by one flush. Cursors never
//! follow them; they walk the tree.

use std::fmt::Write;

use error::{ErrorKind, Result};
use chunk::{ChunkCodec, CHUNK_SIZE};
use hash::{is_zero, to_hash, to_hex, Hash, ZERO_HASH};
use index::{Cursor, KeyIndex};
use key::Key;
use options::User;

pub const KX: usize = 3;
pub const KD: usize = 3;

const SLOT: usize = 64;
const CHILD_KIND: usize = CHUNK_SIZE - 66;
const NODE_KIND: usize = CHUNK_SIZE - 65;
const PREV: usize = CHUNK_SIZE - 64;
const NEXT: usize = CHUNK_SIZE - 32;

type NodeId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
	Branch,
	Leaf,
}

impl Kind {
	fn code(&self) -> u8 {
		match *self {
			Kind::Branch => b'X',
			Kind::Leaf => b'D',
		}
	}

	fn from_code(code: u8) -> Option<Kind> {
		match code {
			b'X' => Some(Kind::Branch),
			b'D' => Some(Kind::Leaf),
			_ => None,
		}
	}
}

#[derive(Debug)]
enum Node {
	Unloaded { hash: Hash, kind: Kind },
	Branch(Branch),
	Leaf(Leaf),
}

#[derive(Debug, Default)]
struct Branch {
	keys: Vec<Key>,
	children: Vec<NodeId>,
	hash: Hash,
	dirty: bool,
}

impl Branch {
	fn to_chunk(&self, child_hashes: &[Hash], child_kind: Kind) -> Vec<u8> {
		let mut chunk = vec![0u8; CHUNK_SIZE];
		for (i, key) in self.keys.iter().enumerate() {
			chunk[i * SLOT..i * SLOT + 32].copy_from_slice(key);
		}
		for (i, hash) in child_hashes.iter().enumerate() {
			chunk[i * SLOT + 32..(i + 1) * SLOT].copy_from_slice(hash);
		}
		chunk[CHILD_KIND] = child_kind.code();
		chunk[NODE_KIND] = Kind::Branch.code();
		chunk
	}
}

#[derive(Debug, Default)]
struct Leaf {
	items: Vec<(Key, Hash)>,
	prev_hash: Hash,
	next_hash: Hash,
	hash: Hash,
	dirty: bool,
}

impl Leaf {
	/// Sealed chunks have no room for the sibling links, encrypted trees
	/// write leaves without them.
	fn to_chunk(&self, links: bool) -> Vec<u8> {
		let mut chunk = vec![0u8; CHUNK_SIZE];
		for (i, &(ref key, ref value)) in self.items.iter().enumerate() {
			chunk[i * SLOT..i * SLOT + 32].copy_from_slice(key);
			chunk[i * SLOT + 32..(i + 1) * SLOT].copy_from_slice(value);
		}
		chunk[CHILD_KIND] = b'C';
		chunk[NODE_KIND] = Kind::Leaf.code();
		if links {
			chunk[PREV..NEXT].copy_from_slice(&self.prev_hash);
			chunk[NEXT..].copy_from_slice(&self.next_hash);
		}
		chunk
	}

	fn find(&self, key: &Key) -> (usize, bool) {
		match self.items.binary_search_by(|item| item.0.cmp(key)) {
			Ok(i) => (i, true),
			Err(i) => (i, false),
		}
	}
}

fn find(keys: &[Key], key: &Key) -> (usize, bool) {
	match keys.binary_search(key) {
		Ok(i) => (i, true),
		Err(i) => (i, false),
	}
}

/// Shape statistics returned by [`BPlusTree::verify`].
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TreeStats {
	pub depth: usize,
	pub branches: usize,
	pub leaves: usize,
	pub items: usize,
}

pub struct BPlusTree {
	codec: ChunkCodec,
	user: User,
	encrypted: bool,
	nodes: Vec<Option<Node>>,
	free: Vec<NodeId>,
	root: Option<NodeId>,
	root_hash: Hash,
	buffered: bool,
}

impl BPlusTree {
	/// Opens the tree rooted at `root_hash`. A zero hash opens an empty tree.
	pub fn open(codec: ChunkCodec, user: User, root_hash: &Hash, encrypted: bool) -> Result<Self> {
		let mut tree = BPlusTree {
			codec,
			user,
			encrypted,
			nodes: Vec::new(),
			free: Vec::new(),
			root: None,
			root_hash: *root_hash,
			buffered: false,
		};
		if !is_zero(root_hash) {
			let node = tree.fetch(root_hash, None)?;
			let root = tree.alloc(node);
			tree.root = Some(root);
		}
		Ok(tree)
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

	fn release(&mut self, id: NodeId) -> Option<Node> {
		let node = self.nodes[id].take();
		self.free.push(id);
		node
	}

	fn node(&self, id: NodeId) -> &Node {
		self.nodes[id].as_ref().expect("node ids held by the tree are live; qed")
	}

	fn node_mut(&mut self, id: NodeId) -> &mut Node {
		self.nodes[id].as_mut().expect("node ids held by the tree are live; qed")
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

	fn leaf_mut(&mut self, id: NodeId) -> &mut Leaf {
		match *self.node_mut(id) {
			Node::Leaf(ref mut leaf) => leaf,
			_ => unreachable!("node {} was loaded as a leaf; qed", id),
		}
	}

	fn kind_of(&self, id: NodeId) -> Kind {
		match *self.node(id) {
			Node::Unloaded { kind, .. } => kind,
			Node::Branch(_) => Kind::Branch,
			Node::Leaf(_) => Kind::Leaf,
		}
	}

	/// Reads a node chunk, creating placeholders for the children of a branch.
	fn fetch(&mut self, hash: &Hash, expected: Option<Kind>) -> Result<Node> {
		let chunk = self.codec.retrieve_existing(&self.user, hash)?
			.ok_or_else(|| ErrorKind::NotFound(format!("b+ tree node {}", to_hex(hash))))?;

		let kind = Kind::from_code(chunk[NODE_KIND])
			.ok_or_else(|| ErrorKind::Integrity(format!("b+ tree node {} has kind {}", to_hex(hash), chunk[NODE_KIND])))?;
		if let Some(expected) = expected {
			if expected != kind {
				bail!(ErrorKind::Integrity(format!("b+ tree node {} is not a {:?}", to_hex(hash), expected)));
			}
		}

		match kind {
			Kind::Branch => {
				let child_kind = Kind::from_code(chunk[CHILD_KIND])
					.ok_or_else(|| ErrorKind::Integrity(format!("b+ tree node {} has child kind {}", to_hex(hash), chunk[CHILD_KIND])))?;
				let count = (0..2 * KX + 2)
					.take_while(|i| !is_zero(&chunk[i * SLOT + 32..(i + 1) * SLOT]))
					.count();
				if count == 0 {
					bail!(ErrorKind::Integrity(format!("b+ tree branch {} has no children", to_hex(hash))));
				}

				let keys = (0..count - 1).map(|i| to_hash(&chunk[i * SLOT..i * SLOT + 32])).collect();
				let mut children = Vec::with_capacity(count);
				for i in 0..count {
					let child = to_hash(&chunk[i * SLOT + 32..(i + 1) * SLOT]);
					children.push(self.alloc(Node::Unloaded { hash: child, kind: child_kind }));
				}
				Ok(Node::Branch(Branch { keys, children, hash: *hash, dirty: false }))
			},
			Kind::Leaf => {
				let items = (0..2 * KD + 1)
					.take_while(|i| !is_zero(&chunk[i * SLOT + 32..(i + 1) * SLOT]))
					.map(|i| (to_hash(&chunk[i * SLOT..i * SLOT + 32]), to_hash(&chunk[i * SLOT + 32..(i + 1) * SLOT])))
					.collect();
				Ok(Node::Leaf(Leaf {
					items,
					prev_hash: to_hash(&chunk[PREV..NEXT]),
					next_hash: to_hash(&chunk[NEXT..]),
					hash: *hash,
					dirty: false,
				}))
			},
		}
	}

	fn load(&mut self, id: NodeId) -> Result<Kind> {
		let (hash, kind) = match *self.node(id) {
			Node::Branch(_) => return Ok(Kind::Branch),
			Node::Leaf(_) => return Ok(Kind::Leaf),
			Node::Unloaded { hash, kind } => (hash, kind),
		};
		let node = self.fetch(&hash, Some(kind))?;
		*self.node_mut(id) = node;
		Ok(kind)
	}

	fn load_leaf(&mut self, id: NodeId) -> Result<NodeId> {
		match self.load(id)? {
			Kind::Leaf => Ok(id),
			Kind::Branch => bail!(ErrorKind::Integrity("b+ tree leaf level holds a branch".into())),
		}
	}

	fn load_branch(&mut self, id: NodeId) -> Result<NodeId> {
		match self.load(id)? {
			Kind::Branch => Ok(id),
			Kind::Leaf => bail!(ErrorKind::Integrity("b+ tree branch level holds a leaf".into())),
		}
	}

	fn check_flush(&mut self) -> Result<()> {
		if !self.buffered {
			self.flush_buffer()?;
		}
		Ok(())
	}

	pub fn get(&mut self, key: &Key) -> Result<Option<Hash>> {
		let mut q = match self.root {
			Some(root) => root,
			None => return Ok(None),
		};
		loop {
			match self.load(q)? {
				Kind::Branch => {
					let branch = self.branch(q);
					let (i, found) = find(&branch.keys, key);
					q = branch.children[if found { i + 1 } else { i }];
				},
				Kind::Leaf => {
					let leaf = self.leaf(q);
					let (i, found) = leaf.find(key);
					return Ok(if found { Some(leaf.items[i].1) } else { None });
				},
			}
		}
	}

	pub fn put(&mut self, key: &Key, value: &Hash) -> Result<bool> {
		let was_new = self.put_inner(key, value)?;
		self.check_flush()?;
		Ok(was_new)
	}

	pub fn insert(&mut self, key: &Key, value: &Hash) -> Result<()> {
		if self.get(key)?.is_some() {
			bail!(ErrorKind::AlreadyExists(format!("b+ tree key {}", to_hex(key))));
		}
		self.put(key, value).map(|_| ())
	}

	pub fn delete(&mut self, key: &Key) -> Result<bool> {
		let found = self.delete_inner(key)?;
		if found {
			self.check_flush()?;
		}
		Ok(found)
	}

	fn put_inner(&mut self, key: &Key, value: &Hash) -> Result<bool> {
		let mut q = match self.root {
			Some(root) => root,
			None => {
				let root = self.alloc(Node::Leaf(Leaf {
					items: vec![(*key, *value)],
					dirty: true,
					..Default::default()
				}));
				self.root = Some(root);
				return Ok(true);
			},
		};

		let mut parent: Option<(NodeId, usize)> = None;
		loop {
			match self.load(q)? {
				Kind::Branch => {
					let (mut i, found) = find(&self.branch(q).keys, key);
					if found {
						i += 1;
					}
					self.branch_mut(q).dirty = true;
					let mut x = q;
					if self.branch(x).keys.len() > 2 * KX {
						let (split, at) = self.split_branch(parent, x, i);
						x = split;
						i = at;
					}
					parent = Some((x, i));
					q = self.branch(x).children[i];
				},
				Kind::Leaf => {
					let (i, found) = self.leaf(q).find(key);
					let leaf_len = {
						let leaf = self.leaf_mut(q);
						leaf.dirty = true;
						if found {
							leaf.items[i].1 = *value;
							return Ok(false);
						}
						leaf.items.len()
					};
					if leaf_len < 2 * KD {
						self.leaf_mut(q).items.insert(i, (*key, *value));
					} else {
						self.overflow(parent, q, i, key, value)?;
					}
					return Ok(true);
				},
			}
		}
	}

	fn branch_insert(&mut self, p: NodeId, i: usize, key: Key, child: NodeId) {
		let branch = self.branch_mut(p);
		branch.keys.insert(i, key);
		branch.children.insert(i + 1, child);
		branch.dirty = true;
	}

	fn grow_root(&mut self, left: NodeId, key: Key, right: NodeId) {
		let root = self.alloc(Node::Branch(Branch {
			keys: vec![key],
			children: vec![left, right],
			dirty: true,
			..Default::default()
		}));
		self.root = Some(root);
	}

	/// Splits a full branch on the way down. Returns the half that now
	/// holds child `i` and its position there.
	fn split_branch(&mut self, parent: Option<(NodeId, usize)>, q: NodeId, i: usize) -> (NodeId, usize) {
		let (separator, keys, children) = {
			let branch = self.branch_mut(q);
			let keys = branch.keys.split_off(KX + 1);
			let separator = branch.keys.pop().expect("a full branch holds more than KX keys; qed");
			let children = branch.children.split_off(KX + 1);
			(separator, keys, children)
		};
		let r = self.alloc(Node::Branch(Branch {
			keys,
			children,
			dirty: true,
			..Default::default()
		}));

		match parent {
			Some((p, pi)) => self.branch_insert(p, pi, separator, r),
			None => self.grow_root(q, separator, r),
		}

		if i > KX {
			(r, i - (KX + 1))
		} else {
			(q, i)
		}
	}

	fn leaf_siblings(&mut self, p: NodeId, pi: usize) -> Result<(Option<NodeId>, Option<NodeId>)> {
		let (left, right) = {
			let branch = self.branch(p);
			let left = if pi > 0 { Some(branch.children[pi - 1]) } else { None };
			let right = if pi < branch.keys.len() { Some(branch.children[pi + 1]) } else { None };
			(left, right)
		};
		let left = match left {
			Some(l) => Some(self.load_leaf(l)?),
			None => None,
		};
		let right = match right {
			Some(r) => Some(self.load_leaf(r)?),
			None => None,
		};
		Ok((left, right))
	}

	fn branch_siblings(&mut self, p: NodeId, pi: usize) -> Result<(Option<NodeId>, Option<NodeId>)> {
		let (left, right) = {
			let branch = self.branch(p);
			let left = if pi > 0 { Some(branch.children[pi - 1]) } else { None };
			let right = if pi < branch.keys.len() { Some(branch.children[pi + 1]) } else { None };
			(left, right)
		};
		let left = match left {
			Some(l) => Some(self.load_branch(l)?),
			None => None,
		};
		let right = match right {
			Some(r) => Some(self.load_branch(r)?),
			None => None,
		};
		Ok((left, right))
	}

	/// Inserts into a full leaf: rotate into a sibling with room, else split.
	fn overflow(&mut self, parent: Option<(NodeId, usize)>, q: NodeId, i: usize, key: &Key, value: &Hash) -> Result<()> {
		if let Some((p, pi)) = parent {
			let (left, right) = self.leaf_siblings(p, pi)?;

			if let Some(l) = left {
				if self.leaf(l).items.len() < 2 * KD && i != 0 {
					let first = self.leaf_mut(q).items.remove(0);
					{
						let left = self.leaf_mut(l);
						left.items.push(first);
						left.dirty = true;
					}
					self.leaf_mut(q).items.insert(i - 1, (*key, *value));
					let separator = self.leaf(q).items[0].0;
					self.branch_mut(p).keys[pi - 1] = separator;
					return Ok(());
				}
			}

			if let Some(r) = right {
				if self.leaf(r).items.len() < 2 * KD {
					if i < 2 * KD {
						let last = self.leaf_mut(q).items.pop().expect("overflowing leaf is full; qed");
						{
							let right = self.leaf_mut(r);
							right.items.insert(0, last);
							right.dirty = true;
						}
						self.leaf_mut(q).items.insert(i, (*key, *value));
						let separator = self.leaf(r).items[0].0;
						self.branch_mut(p).keys[pi] = separator;
						return Ok(());
					}

					{
						let right = self.leaf_mut(r);
						right.items.insert(0, (*key, *value));
						right.dirty = true;
					}
					self.branch_mut(p).keys[pi] = *key;
					return Ok(());
				}
			}
		}

		self.split_leaf(parent, q, i, key, value);
		Ok(())
	}

	fn split_leaf(&mut self, parent: Option<(NodeId, usize)>, q: NodeId, i: usize, key: &Key, value: &Hash) {
		let (items, next_hash, prev_hash) = {
			let leaf = self.leaf_mut(q);
			let items = leaf.items.split_off(KD);
			let next_hash = leaf.next_hash;
			leaf.next_hash = ZERO_HASH;
			(items, next_hash, leaf.hash)
		};
		let r = self.alloc(Node::Leaf(Leaf {
			items,
			prev_hash,
			next_hash,
			dirty: true,
			..Default::default()
		}));

		let done = i > KD;
		if done {
			self.leaf_mut(r).items.insert(i - KD, (*key, *value));
		}

		let separator = self.leaf(r).items[0].0;
		match parent {
			Some((p, pi)) => self.branch_insert(p, pi, separator, r),
			None => self.grow_root(q, separator, r),
		}

		if !done {
			self.leaf_mut(q).items.insert(i, (*key, *value));
		}
	}

	fn delete_inner(&mut self, key: &Key) -> Result<bool> {
		let mut q = match self.root {
			Some(root) => root,
			None => return Ok(false),
		};

		let mut parent: Option<(NodeId, usize)> = None;
		loop {
			match self.load(q)? {
				Kind::Branch => {
					let (mut i, found) = find(&self.branch(q).keys, key);
					let mut x = q;
					if self.branch(x).keys.len() < KX && Some(x) != self.root {
						let (p, pi) = parent.expect("a non-root branch was reached through its parent; qed");
						let (fixed, at) = self.underflow_branch(p, pi, x, i)?;
						x = fixed;
						i = at;
					}
					self.branch_mut(x).dirty = true;
					let next = if found { i + 1 } else { i };
					parent = Some((x, next));
					q = self.branch(x).children[next];
				},
				Kind::Leaf => {
					let (i, found) = self.leaf(q).find(key);
					if !found {
						return Ok(false);
					}
					let remaining = {
						let leaf = self.leaf_mut(q);
						leaf.items.remove(i);
						leaf.dirty = true;
						leaf.items.len()
					};
					if remaining >= KD {
						return Ok(true);
					}
					match parent {
						Some((p, pi)) => self.underflow_leaf(p, pi, q)?,
						None if remaining == 0 => {
							self.release(q);
							self.root = None;
						},
						None => (),
					}
					return Ok(true);
				},
			}
		}
	}

	/// Refills a branch below minimum occupancy before descending into it.
	fn underflow_branch(&mut self, p: NodeId, pi: usize, q: NodeId, i: usize) -> Result<(NodeId, usize)> {
		let (left, right) = self.branch_siblings(p, pi)?;

		if let Some(l) = left {
			if self.branch(l).keys.len() > KX {
				let (key, child) = {
					let left = self.branch_mut(l);
					left.dirty = true;
					let key = left.keys.pop().expect("left sibling holds more than KX keys; qed");
					let child = left.children.pop().expect("a branch has children; qed");
					(key, child)
				};
				let separator = self.branch(p).keys[pi - 1];
				{
					let branch = self.branch_mut(q);
					branch.keys.insert(0, separator);
					branch.children.insert(0, child);
					branch.dirty = true;
				}
				self.branch_mut(p).keys[pi - 1] = key;
				return Ok((q, i + 1));
			}
		}

		if let Some(r) = right {
			if self.branch(r).keys.len() > KX {
				let (key, child) = {
					let right = self.branch_mut(r);
					right.dirty = true;
					(right.keys.remove(0), right.children.remove(0))
				};
				let separator = self.branch(p).keys[pi];
				{
					let branch = self.branch_mut(q);
					branch.keys.push(separator);
					branch.children.push(child);
					branch.dirty = true;
				}
				self.branch_mut(p).keys[pi] = key;
				return Ok((q, i));
			}
		}

		if let Some(l) = left {
			let at = i + self.branch(l).keys.len() + 1;
			self.merge_branches(p, l, q, pi - 1);
			return Ok((l, at));
		}

		match right {
			Some(r) => {
				self.merge_branches(p, q, r, pi);
				Ok((q, i))
			},
			None => bail!(ErrorKind::Integrity("b+ tree branch without siblings".into())),
		}
	}

	/// Merges `r` into `q`, dropping separator `pi` of `p`.
	fn merge_branches(&mut self, p: NodeId, q: NodeId, r: NodeId, pi: usize) {
		let separator = self.branch(p).keys[pi];
		let right = match self.release(r) {
			Some(Node::Branch(branch)) => branch,
			_ => unreachable!("siblings were loaded as branches; qed"),
		};
		{
			let branch = self.branch_mut(q);
			branch.keys.push(separator);
			branch.keys.extend(right.keys);
			branch.children.extend(right.children);
			branch.dirty = true;
		}
		self.drop_separator(p, q, pi);
	}

	fn drop_separator(&mut self, p: NodeId, q: NodeId, pi: usize) {
		if self.branch(p).keys.len() > 1 {
			let branch = self.branch_mut(p);
			branch.keys.remove(pi);
			branch.children.remove(pi + 1);
			branch.dirty = true;
		} else {
			self.release(p);
			self.root = Some(q);
		}
	}

	/// Rebalances a leaf that fell below `KD` pairs.
	fn underflow_leaf(&mut self, p: NodeId, pi: usize, q: NodeId) -> Result<()> {
		let (left, right) = self.leaf_siblings(p, pi)?;
		let len = self.leaf(q).items.len();

		if let Some(l) = left {
			if self.leaf(l).items.len() + len >= 2 * KD {
				let last = {
					let left = self.leaf_mut(l);
					left.dirty = true;
					left.items.pop().expect("left sibling holds enough pairs; qed")
				};
				self.leaf_mut(q).items.insert(0, last);
				let separator = self.leaf(q).items[0].0;
				self.branch_mut(p).keys[pi - 1] = separator;
				return Ok(());
			}
		}

		if let Some(r) = right {
			if self.leaf(r).items.len() + len >= 2 * KD {
				let first = {
					let right = self.leaf_mut(r);
					right.dirty = true;
					right.items.remove(0)
				};
				self.leaf_mut(q).items.push(first);
				let separator = self.leaf(r).items[0].0;
				self.branch_mut(p).keys[pi] = separator;
				return Ok(());
			}
		}

		if let Some(l) = left {
			self.merge_leaves(p, l, q, pi - 1);
			return Ok(());
		}

		match right {
			Some(r) => {
				self.merge_leaves(p, q, r, pi);
				Ok(())
			},
			None => bail!(ErrorKind::Integrity("b+ tree leaf without siblings".into())),
		}
	}

	fn merge_leaves(&mut self, p: NodeId, q: NodeId, r: NodeId, pi: usize) {
		let right = match self.release(r) {
			Some(Node::Leaf(leaf)) => leaf,
			_ => unreachable!("siblings were loaded as leaves; qed"),
		};
		{
			let leaf = self.leaf_mut(q);
			leaf.items.extend(right.items);
			leaf.next_hash = right.next_hash;
			leaf.dirty = true;
		}
		self.drop_separator(p, q, pi);
	}

	pub fn start_buffer(&mut self) -> Result<()> {
		self.buffered = true;
		Ok(())
	}

	pub fn flush_buffer(&mut self) -> Result<Hash> {
		let hash = match self.root {
			Some(root) => {
				let mut prev_leaf = None;
				self.flush_node(root, &mut prev_leaf)?.0
			},
			None => ZERO_HASH,
		};
		self.buffered = false;
		if hash != self.root_hash {
			debug!(root = %to_hex(&hash), "flushed b+ tree");
		}
		self.root_hash = hash;
		Ok(hash)
	}

	/// Writes the dirty part of the subtree at `id` in key order. Returns the
	/// subtree hash and whether anything was written.
	fn flush_node(&mut self, id: NodeId, prev_leaf: &mut Option<Hash>) -> Result<(Hash, bool)> {
		match *self.node(id) {
			Node::Unloaded { hash, kind } => {
				*prev_leaf = if kind == Kind::Leaf { Some(hash) } else { None };
				return Ok((hash, false));
			},
			Node::Leaf(ref leaf) if !leaf.dirty => {
				*prev_leaf = Some(leaf.hash);
				return Ok((leaf.hash, false));
			},
			Node::Branch(ref branch) if !branch.dirty => {
				*prev_leaf = None;
				return Ok((branch.hash, false));
			},
			_ => (),
		}

		let chunk = match self.kind_of(id) {
			Kind::Leaf => {
				let links = !self.encrypted;
				let leaf = self.leaf_mut(id);
				if let Some(prev) = *prev_leaf {
					leaf.prev_hash = prev;
				}
				leaf.to_chunk(links)
			},
			Kind::Branch => {
				let children = self.branch(id).children.clone();
				let mut hashes = Vec::with_capacity(children.len());
				for child in &children {
					hashes.push(self.flush_node(*child, prev_leaf)?.0);
				}
				let child_kind = self.kind_of(children[0]);
				self.branch(id).to_chunk(&hashes, child_kind)
			},
		};

		let hash = self.codec.store_chunk(&self.user, &chunk, self.encrypted)?;
		match *self.node_mut(id) {
			Node::Leaf(ref mut leaf) => {
				leaf.hash = hash;
				leaf.dirty = false;
				*prev_leaf = Some(hash);
			},
			Node::Branch(ref mut branch) => {
				branch.hash = hash;
				branch.dirty = false;
			},
			Node::Unloaded { .. } => unreachable!("dirty nodes are loaded; qed"),
		}
		Ok((hash, true))
	}

	pub fn seek(&mut self, key: &Key) -> Result<(Enumerator, bool)> {
		let mut e = Enumerator::new(self);
		let hit = e.seek(key)?;
		Ok((e, hit))
	}

	pub fn seek_first(&mut self) -> Result<Enumerator> {
		let mut e = Enumerator::new(self);
		e.seek_end(true)?;
		Ok(e)
	}

	pub fn seek_last(&mut self) -> Result<Enumerator> {
		let mut e = Enumerator::new(self);
		e.seek_end(false)?;
		Ok(e)
	}

	pub fn root_hash(&self) -> Hash {
		self.root_hash
	}

	pub fn is_empty(&self) -> bool {
		self.root.is_none()
	}

	/// Loads the whole tree and checks ordering, uniform depth and node
	/// occupancy.
	pub fn verify(&mut self) -> Result<TreeStats> {
		let mut stats = TreeStats::default();
		let root = match self.root {
			Some(root) => root,
			None => return Ok(stats),
		};
		let mut last_key = None;
		let mut leaf_depth = None;
		self.verify_node(root, true, 1, None, None, &mut last_key, &mut leaf_depth, &mut stats)?;
		stats.depth = leaf_depth.unwrap_or(0);
		Ok(stats)
	}

	fn verify_node(
		&mut self,
		id: NodeId,
		is_root: bool,
		depth: usize,
		lower: Option<Key>,
		upper: Option<Key>,
		last_key: &mut Option<Key>,
		leaf_depth: &mut Option<usize>,
		stats: &mut TreeStats,
	) -> Result<()> {
		let fail = |what: String| -> Result<()> { Err(ErrorKind::Integrity(what).into()) };

		match self.load(id)? {
			Kind::Leaf => {
				let leaf = self.leaf(id);
				let len = leaf.items.len();
				let min = if is_root { 1 } else { (KD + 1) / 2 };
				if len < min || len > 2 * KD + 1 {
					return fail(format!("leaf holds {} pairs", len));
				}
				for &(ref key, _) in &leaf.items {
					if let Some(ref last) = *last_key {
						if key <= last {
							return fail(format!("key {} out of order", to_hex(key)));
						}
					}
					if lower.map_or(false, |l| *key < l) || upper.map_or(false, |u| *key >= u) {
						return fail(format!("key {} outside its separators", to_hex(key)));
					}
					*last_key = Some(*key);
				}
				match *leaf_depth {
					Some(d) if d != depth => return fail(format!("leaves at depth {} and {}", d, depth)),
					_ => *leaf_depth = Some(depth),
				}
				stats.leaves += 1;
				stats.items += len;
				Ok(())
			},
			Kind::Branch => {
				let (keys, children) = {
					let branch = self.branch(id);
					(branch.keys.clone(), branch.children.clone())
				};
				let min = if is_root { 2 } else { (KX + 1) / 2 + 1 };
				if children.len() < min || children.len() > 2 * KX + 2 || keys.len() + 1 != children.len() {
					return fail(format!("branch holds {} children and {} keys", children.len(), keys.len()));
				}
				stats.branches += 1;
				for (i, child) in children.iter().enumerate() {
					let lo = if i == 0 { lower } else { Some(keys[i - 1]) };
					let hi = if i == keys.len() { upper } else { Some(keys[i]) };
					self.verify_node(*child, false, depth + 1, lo, hi, last_key, leaf_depth, stats)?;
				}
				Ok(())
			},
		}
	}

	/// Renders the loaded part of the tree, one node per line.
	pub fn print(&self) -> String {
		let mut out = String::new();
		match self.root {
			Some(root) => self.print_node(root, 0, &mut out),
			None => out.push_str("<empty>\n"),
		}
		out
	}

	fn print_node(&self, id: NodeId, depth: usize, out: &mut String) {
		let indent = "  ".repeat(depth);
		match *self.node(id) {
			Node::Unloaded { ref hash, kind } => {
				let _ = writeln!(out, "{}{:?} {} (not loaded)", indent, kind, to_hex(hash));
			},
			Node::Branch(ref branch) => {
				let _ = writeln!(out, "{}X {} keys={} dirty={}", indent, to_hex(&branch.hash), branch.keys.len(), branch.dirty);
				for child in &branch.children {
					self.print_node(*child, depth + 1, out);
				}
			},
			Node::Leaf(ref leaf) => {
				let _ = writeln!(out, "{}D {} dirty={}", indent, to_hex(&leaf.hash), leaf.dirty);
				for &(ref key, ref value) in &leaf.items {
					let _ = writeln!(out, "{}  {} -> {}", indent, to_hex(key), to_hex(value));
				}
			},
		}
	}
}

/// Cursor over a B+ tree. It remembers the branch path to its leaf and
/// moves between leaves through that path.
pub struct Enumerator<'a> {
	tree: &'a mut BPlusTree,
	path: Vec<(NodeId, usize)>,
	leaf: Option<NodeId>,
	index: usize,
	hit: bool,
	eof: bool,
}

impl<'a> Enumerator<'a> {
	fn new(tree: &'a mut BPlusTree) -> Self {
		Enumerator {
			tree,
			path: Vec::new(),
			leaf: None,
			index: 0,
			hit: false,
			eof: false,
		}
	}

	fn seek(&mut self, key: &Key) -> Result<bool> {
		let mut q = match self.tree.root {
			Some(root) => root,
			None => {
				self.eof = true;
				return Ok(false);
			},
		};
		loop {
			match self.tree.load(q)? {
				Kind::Branch => {
					let branch = self.tree.branch(q);
					let (i, found) = find(&branch.keys, key);
					let i = if found { i + 1 } else { i };
					self.path.push((q, i));
					q = branch.children[i];
				},
				Kind::Leaf => {
					let (i, found) = self.tree.leaf(q).find(key);
					self.leaf = Some(q);
					self.index = i;
					self.hit = found;
					return Ok(found);
				},
			}
		}
	}

	fn seek_end(&mut self, first: bool) -> Result<()> {
		match self.tree.root {
			Some(root) => {
				self.descend(root, first)?;
				self.hit = true;
			},
			None => self.eof = true,
		}
		Ok(())
	}

	/// Walks down to the leftmost or rightmost leaf below `id`.
	fn descend(&mut self, mut id: NodeId, leftmost: bool) -> Result<()> {
		loop {
			match self.tree.load(id)? {
				Kind::Branch => {
					let branch = self.tree.branch(id);
					let i = if leftmost { 0 } else { branch.children.len() - 1 };
					self.path.push((id, i));
					id = branch.children[i];
				},
				Kind::Leaf => {
					let len = self.tree.leaf(id).items.len();
					self.leaf = Some(id);
					self.index = if leftmost || len == 0 { 0 } else { len - 1 };
					return Ok(());
				},
			}
		}
	}

	fn leaf_len(&self) -> usize {
		self.leaf.map_or(0, |leaf| self.tree.leaf(leaf).items.len())
	}

	fn next_leaf(&mut self) -> Result<bool> {
		while let Some((node, i)) = self.path.pop() {
			let child = {
				let children = &self.tree.branch(node).children;
				if i + 1 < children.len() { Some(children[i + 1]) } else { None }
			};
			if let Some(child) = child {
				self.path.push((node, i + 1));
				self.descend(child, true)?;
				return Ok(true);
			}
		}
		Ok(false)
	}

	fn prev_leaf(&mut self) -> Result<bool> {
		while let Some((node, i)) = self.path.pop() {
			if i > 0 {
				let child = self.tree.branch(node).children[i - 1];
				self.path.push((node, i - 1));
				self.descend(child, false)?;
				return Ok(true);
			}
		}
		Ok(false)
	}

	fn step_forward(&mut self) -> Result<()> {
		if self.index + 1 < self.leaf_len() {
			self.index += 1;
			return Ok(());
		}
		loop {
			if !self.next_leaf()? {
				self.eof = true;
				return Ok(());
			}
			if self.leaf_len() > 0 {
				self.index = 0;
				return Ok(());
			}
		}
	}

	fn step_backward(&mut self) -> Result<()> {
		let len = self.leaf_len();
		if self.index > 0 && len > 0 {
			self.index = ::std::cmp::min(self.index, len) - 1;
			return Ok(());
		}
		loop {
			if !self.prev_leaf()? {
				self.eof = true;
				return Ok(());
			}
			let len = self.leaf_len();
			if len > 0 {
				self.index = len - 1;
				return Ok(());
			}
		}
	}

	fn current(&self) -> (Key, Hash) {
		let leaf = self.leaf.expect("cursor positioned on a leaf; qed");
		self.tree.leaf(leaf).items[self.index]
	}
}

impl<'a> Cursor for Enumerator<'a> {
	fn next(&mut self) -> Result<Option<(Key, Hash)>> {
		if self.eof || self.leaf.is_none() {
			self.eof = true;
			return Ok(None);
		}
		if self.index >= self.leaf_len() {
			self.step_forward()?;
			if self.eof {
				return Ok(None);
			}
		}
		let item = self.current();
		self.hit = true;
		self.step_forward()?;
		Ok(Some(item))
	}

	fn prev(&mut self) -> Result<Option<(Key, Hash)>> {
		if self.eof || self.leaf.is_none() {
			self.eof = true;
			return Ok(None);
		}
		if !self.hit || self.index >= self.leaf_len() {
			self.step_backward()?;
			if self.eof {
				return Ok(None);
			}
		}
		let item = self.current();
		self.hit = true;
		self.step_backward()?;
		Ok(Some(item))
	}
}

impl KeyIndex for BPlusTree {
	fn get(&mut self, key: &Key) -> Result<Option<Hash>> {
		BPlusTree::get(self, key)
	}

	fn put(&mut self, key: &Key, value: &Hash) -> Result<bool> {
		BPlusTree::put(self, key, value)
	}

	fn insert(&mut self, key: &Key, value: &Hash) -> Result<()> {
		BPlusTree::insert(self, key, value)
	}

	fn delete(&mut self, key: &Key) -> Result<bool> {
		BPlusTree::delete(self, key)
	}

	fn seek<'a>(&'a mut self, key: &Key) -> Result<(Box<dyn Cursor + 'a>, bool)> {
		let (e, hit) = BPlusTree::seek(self, key)?;
		Ok((Box::new(e), hit))
	}

	fn seek_first<'a>(&'a mut self) -> Result<Box<dyn Cursor + 'a>> {
		Ok(Box::new(BPlusTree::seek_first(self)?))
	}

	fn seek_last<'a>(&'a mut self) -> Result<Box<dyn Cursor + 'a>> {
		Ok(Box::new(BPlusTree::seek_last(self)?))
	}

	fn start_buffer(&mut self) -> Result<()> {
		BPlusTree::start_buffer(self)
	}

	fn flush_buffer(&mut self) -> Result<Hash> {
		BPlusTree::flush_buffer(self)
	}

	fn root_hash(&self) -> Hash {
		self.root_hash
	}

	fn set_user(&mut self, user: &User) {
		self.user = *user;
	}

	fn print(&self) -> String {
		BPlusTree::print(self)
	}
}

#[cfg(test)]
mod tests {
	use std::collections::BTreeMap;
	use std::sync::Arc;

	use rand::seq::SliceRandom;
	use rand::thread_rng;

	use chunk::ChunkCodec;
	use error::ErrorKind;
	use hash::{keccak256, Hash, ZERO_HASH};
	use index::{collect_backward, collect_forward, Cursor};
	use key::{encode_int, Key};
	use keymanager::{KeyManager, LocalKeyManager};
	use options::User;
	use store::MemoryChunkStore;
	use super::BPlusTree;

	fn codec() -> (ChunkCodec, User) {
		let keys = Arc::new(LocalKeyManager::random());
		let user = User::new(keys.address());
		keys.add_user(&user.address, "secret");
		(ChunkCodec::new(Arc::new(MemoryChunkStore::new()), keys), user)
	}

	fn value(i: i64) -> Hash {
		keccak256(&encode_int(i))
	}

	fn keys(items: &[(Key, Hash)]) -> Vec<Key> {
		items.iter().map(|item| item.0).collect()
	}

	#[test]
	fn should_keep_keys_ordered_across_splits() {
		let (codec, user) = codec();
		let mut tree = BPlusTree::open(codec, user, &ZERO_HASH, false).unwrap();
		let mut ids: Vec<i64> = (0..200).collect();
		ids.shuffle(&mut thread_rng());

		tree.start_buffer().unwrap();
		for i in &ids {
			assert!(tree.put(&encode_int(*i), &value(*i)).unwrap());
		}
		tree.flush_buffer().unwrap();

		let stats = tree.verify().unwrap();
		assert_eq!(stats.items, 200);
		assert!(stats.depth >= 3);

		let expected: Vec<Key> = (0..200).map(encode_int).collect();
		assert_eq!(keys(&collect_forward(&mut tree.seek_first().unwrap()).unwrap()), expected);

		let mut reversed = expected.clone();
		reversed.reverse();
		assert_eq!(keys(&collect_backward(&mut tree.seek_last().unwrap()).unwrap()), reversed);
	}

	#[test]
	fn should_reload_from_root_hash() {
		let (codec, user) = codec();
		let root = {
			let mut tree = BPlusTree::open(codec.clone(), user, &ZERO_HASH, false).unwrap();
			for i in -20..20 {
				tree.put(&encode_int(i), &value(i)).unwrap();
			}
			tree.root_hash()
		};

		let mut tree = BPlusTree::open(codec, user, &root, false).unwrap();
		assert_eq!(tree.get(&encode_int(-7)).unwrap(), Some(value(-7)));
		assert_eq!(tree.get(&encode_int(25)).unwrap(), None);
		assert_eq!(tree.verify().unwrap().items, 40);
	}

	#[test]
	fn put_reports_new_keys_and_insert_rejects_duplicates() {
		let (codec, user) = codec();
		let mut tree = BPlusTree::open(codec, user, &ZERO_HASH, false).unwrap();

		assert!(tree.put(&encode_int(1), &value(1)).unwrap());
		assert!(!tree.put(&encode_int(1), &value(2)).unwrap());
		assert_eq!(tree.get(&encode_int(1)).unwrap(), Some(value(2)));
		assert_matches!(
			*tree.insert(&encode_int(1), &value(3)).unwrap_err().kind(),
			ErrorKind::AlreadyExists(_)
		);
		assert_eq!(tree.get(&encode_int(1)).unwrap(), Some(value(2)));
	}

	#[test]
	fn seek_positions_between_keys() {
		let (codec, user) = codec();
		let mut tree = BPlusTree::open(codec, user, &ZERO_HASH, false).unwrap();
		for i in 0..30 {
			tree.put(&encode_int(i * 2), &value(i * 2)).unwrap();
		}

		{
			let (mut cursor, hit) = tree.seek(&encode_int(11)).unwrap();
			assert!(!hit);
			assert_eq!(cursor.next().unwrap().map(|item| item.0), Some(encode_int(12)));
		}
		{
			let (mut cursor, hit) = tree.seek(&encode_int(11)).unwrap();
			assert!(!hit);
			assert_eq!(cursor.prev().unwrap().map(|item| item.0), Some(encode_int(10)));
			assert_eq!(cursor.prev().unwrap().map(|item| item.0), Some(encode_int(8)));
		}
		{
			let (mut cursor, hit) = tree.seek(&encode_int(58)).unwrap();
			assert!(hit);
			assert_eq!(cursor.next().unwrap().map(|item| item.0), Some(encode_int(58)));
			assert_eq!(cursor.next().unwrap(), None);
			assert_eq!(cursor.prev().unwrap(), None);
		}
		{
			let (mut cursor, _) = tree.seek(&encode_int(-5)).unwrap();
			assert_eq!(cursor.prev().unwrap(), None);
		}
	}

	#[test]
	fn delete_rebalances_and_empties_the_tree() {
		let (codec, user) = codec();
		let mut tree = BPlusTree::open(codec, user, &ZERO_HASH, false).unwrap();
		let mut model = BTreeMap::new();
		for i in 0..120 {
			tree.put(&encode_int(i), &value(i)).unwrap();
			model.insert(encode_int(i), value(i));
		}

		let mut ids: Vec<i64> = (0..120).collect();
		ids.shuffle(&mut thread_rng());
		for (n, i) in ids.iter().enumerate() {
			assert!(tree.delete(&encode_int(*i)).unwrap());
			assert!(!tree.delete(&encode_int(*i)).unwrap());
			model.remove(&encode_int(*i));
			if n % 10 == 0 {
				tree.verify().unwrap();
				let items = collect_forward(&mut tree.seek_first().unwrap()).unwrap();
				assert_eq!(items, model.iter().map(|(k, v)| (*k, *v)).collect::<Vec<_>>());
			}
		}

		assert!(tree.is_empty());
		assert_eq!(tree.root_hash(), ZERO_HASH);
		assert_eq!(tree.seek_first().unwrap().next().unwrap(), None);
	}

	#[test]
	fn encrypted_tree_needs_the_owner_keys() {
		let keys = Arc::new(LocalKeyManager::random());
		let owner = User::new([1; 20]);
		let stranger = User::new([2; 20]);
		keys.add_user(&owner.address, "owner");
		keys.add_user(&stranger.address, "stranger");
		let codec = ChunkCodec::new(Arc::new(MemoryChunkStore::new()), keys);

		let root = {
			let mut tree = BPlusTree::open(codec.clone(), owner, &ZERO_HASH, true).unwrap();
			tree.put(&encode_int(5), &value(5)).unwrap();
			tree.root_hash()
		};

		assert!(BPlusTree::open(codec.clone(), owner, &root, true).is_ok());
		assert_matches!(
			*BPlusTree::open(codec, stranger, &root, true).err().unwrap().kind(),
			ErrorKind::Integrity(_)
		);
	}

	#[test]
	fn encrypted_leaves_reload_in_order() {
		let (codec, user) = codec();
		let root = {
			let mut tree = BPlusTree::open(codec.clone(), user, &ZERO_HASH, true).unwrap();
			tree.start_buffer().unwrap();
			for i in 0..60 {
				tree.put(&encode_int(i), &value(i)).unwrap();
			}
			tree.flush_buffer().unwrap()
		};

		let mut tree = BPlusTree::open(codec, user, &root, true).unwrap();
		let expected: Vec<Key> = (0..60).map(encode_int).collect();
		assert_eq!(keys(&collect_forward(&mut tree.seek_first().unwrap()).unwrap()), expected);
		assert_eq!(collect_backward(&mut tree.seek_last().unwrap()).unwrap().len(), 60);
		assert_eq!(tree.verify().unwrap().items, 60);
	}
}
