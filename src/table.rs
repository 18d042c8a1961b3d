//! An open table: its descriptor, one index per indexed column and the row
//! chunks they point at.

use rayon::prelude::*;

use error::{ErrorKind, Result};
use bplus::BPlusTree;
use catalog::{table_key, Catalog, Column, ColumnDescriptor, TableDescriptor};
use chunk::{fingerprint, ChunkCodec, ChunkHeader, ChunkType};
use hash::{is_zero, to_hex, Hash};
use hashdb::HashDb;
use index::{collect_backward, collect_forward, Index, KeyIndex};
use key::{IndexType, Key};
use options::User;
use row::{Row, Value};

fn open_index(codec: &ChunkCodec, user: &User, column: &ColumnDescriptor, encrypted: bool) -> Result<Option<Index>> {
	let mut index = match column.column.index_type {
		IndexType::None => return Ok(None),
		IndexType::BPlusTree => Index::BPlus(BPlusTree::open(codec.clone(), *user, &column.root, encrypted)?),
		IndexType::HashTrie => Index::HashTrie(HashDb::open(codec.clone(), *user, &column.root, encrypted)?),
		IndexType::FullText => bail!(ErrorKind::Schema(format!("column {}: full text indexes are not supported", column.column.name))),
	};
	// The table decides when indexes are written out.
	index.start_buffer()?;
	Ok(Some(index))
}

pub struct Table {
	catalog: Catalog,
	user: User,
	owner: String,
	database: String,
	name: String,
	descriptor: TableDescriptor,
	primary: usize,
	indexes: Vec<Option<Index>>,
	buffered: bool,
}

impl Table {
	/// Opens a table from its published descriptor.
	pub fn open(catalog: Catalog, user: &User, owner: &str, database: &str, name: &str) -> Result<Self> {
		let descriptor = catalog.load_descriptor(user, owner, database, name)?;
		let primary = descriptor.columns.iter()
			.position(|c| c.column.is_primary())
			.ok_or_else(|| ErrorKind::Schema(format!("table {} has no primary column", name)))?;
		let indexes = descriptor.columns.iter()
			.map(|column| open_index(catalog.codec(), user, column, descriptor.encrypted))
			.collect::<Result<Vec<_>>>()?;
		if indexes[primary].is_none() {
			bail!(ErrorKind::Schema(format!("primary column {} has no index", descriptor.columns[primary].column.name)));
		}

		debug!(table = %table_key(owner, database, name), columns = descriptor.columns.len(), "opened table");
		Ok(Table {
			catalog,
			user: *user,
			owner: owner.to_owned(),
			database: database.to_owned(),
			name: name.to_owned(),
			descriptor,
			primary,
			indexes,
			buffered: false,
		})
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	/// Name service key of the table.
	pub fn key(&self) -> String {
		table_key(&self.owner, &self.database, &self.name)
	}

	pub fn descriptor(&self) -> &TableDescriptor {
		&self.descriptor
	}

	pub fn primary_column(&self) -> &Column {
		&self.descriptor.columns[self.primary].column
	}

	pub fn column(&self, name: &str) -> Option<&Column> {
		self.descriptor.column(name).map(|c| &c.column)
	}

	pub fn is_encrypted(&self) -> bool {
		self.descriptor.encrypted
	}

	pub fn is_buffered(&self) -> bool {
		self.buffered
	}

	/// Changes the user rows and index nodes are written for.
	pub fn set_user(&mut self, user: &User) {
		self.user = *user;
		for index in self.indexes.iter_mut().filter_map(Option::as_mut) {
			index.set_user(user);
		}
	}

	fn primary_index(&mut self) -> &mut Index {
		self.indexes[self.primary].as_mut().expect("primary index is checked on open; qed")
	}

	/// Canonical key of a primary column value.
	pub fn primary_key(&self, value: &Value) -> Result<Key> {
		let key = value.to_key(self.primary_column().column_type)?;
		if is_zero(&key) {
			bail!(ErrorKind::InvalidRequest(format!("primary key {} encodes to zero", value)));
		}
		Ok(key)
	}

	/// Deterministic address of the row chunk with primary key `key`.
	pub fn fingerprint(&self, key: &Key) -> Hash {
		fingerprint(self.owner.as_bytes(), self.database.as_bytes(), self.name.as_bytes(), key)
	}

	/// Checks a row against the schema and converts every cell to its
	/// column type.
	pub fn coerce_row(&self, row: &Row) -> Result<Row> {
		let primary = &self.primary_column().name;
		if !row.contains(primary) {
			bail!(ErrorKind::InvalidRequest(format!("row needs primary column {}", primary)));
		}
		row.iter()
			.map(|(name, value)| -> Result<(String, Value)> {
				match self.column(name) {
					Some(column) => Ok((name.clone(), value.coerce(column.column_type)?)),
					None => bail!(ErrorKind::InvalidRequest(format!("row contains unknown column {}", name))),
				}
			})
			.collect()
	}

	fn read_row(&self, fingerprint: &Hash) -> Result<Option<(ChunkHeader, Row)>> {
		match self.catalog.codec().retrieve_k_chunk(&self.user, fingerprint)? {
			Some((header, payload)) => Ok(Some((header, self.decode_row(&payload)?))),
			None => Ok(None),
		}
	}

	/// JSON loses the cell types, blobs come back as `0x` strings.
	fn decode_row(&self, payload: &[u8]) -> Result<Row> {
		Row::from_json(payload)?
			.into_iter()
			.map(|(name, value)| -> Result<(String, Value)> {
				match self.column(&name) {
					Some(column) => {
						let value = value.coerce(column.column_type)?;
						Ok((name, value))
					},
					None => Ok((name, value)),
				}
			})
			.collect()
	}

	fn load_row(&self, fingerprint: &Hash) -> Result<Row> {
		self.read_row(fingerprint)?
			.map(|(_, row)| row)
			.ok_or_else(|| ErrorKind::NotFound(format!("row chunk {} of {}", to_hex(fingerprint), self.key())).into())
	}

	/// Writes `row`, replacing any row with the same primary key.
	pub fn put(&mut self, row: &Row) -> Result<()> {
		let row = self.coerce_row(row)?;
		let key = self.primary_key(row.get(&self.primary_column().name).expect("coerced rows carry the primary column; qed"))?;
		let fingerprint = self.fingerprint(&key);

		let mut header = ChunkHeader::new(
			&self.user,
			ChunkType::Row,
			self.owner.as_bytes(),
			self.database.as_bytes(),
			self.name.as_bytes(),
			&fingerprint,
		);
		header.encrypted = self.descriptor.encrypted;
		let previous = match self.read_row(&fingerprint)? {
			Some((old, previous)) => {
				header.birth_ts = old.birth_ts;
				header.version = old.version + 1;
				Some(previous)
			},
			None => None,
		};
		self.catalog.codec().store_k_chunk(&self.user, &header, &row.to_json()?)?;

		for (i, descriptor) in self.descriptor.columns.iter().enumerate() {
			let index = match self.indexes[i] {
				Some(ref mut index) => index,
				None => continue,
			};
			if i == self.primary {
				index.put(&key, &fingerprint)?;
				continue;
			}

			let column = &descriptor.column;
			let value_key = match row.get(&column.name) {
				Some(value) => Some(value.to_key(column.column_type)?),
				None => None,
			};
			if let Some(old) = previous.as_ref().and_then(|p| p.get(&column.name)) {
				let old_key = old.to_key(column.column_type)?;
				if Some(old_key) != value_key && index.get(&old_key)? == Some(key) {
					index.delete(&old_key)?;
				}
			}
			if let Some(value_key) = value_key {
				index.put(&value_key, &key)?;
			}
		}

		debug!(table = %self.key(), fingerprint = %to_hex(&fingerprint), version = header.version, "put row");
		if !self.buffered {
			self.flush_buffer()?;
		}
		Ok(())
	}

	/// Row with primary key `value`, `None` if absent.
	pub fn get(&mut self, value: &Value) -> Result<Option<Row>> {
		let key = self.primary_key(value)?;
		match self.primary_index().get(&key)? {
			Some(fingerprint) => self.load_row(&fingerprint).map(Some),
			None => Ok(None),
		}
	}

	/// Header of the row chunk with primary key `value`.
	pub fn header(&mut self, value: &Value) -> Result<Option<ChunkHeader>> {
		let key = self.primary_key(value)?;
		match self.primary_index().get(&key)? {
			Some(fingerprint) => Ok(self.read_row(&fingerprint)?.map(|(header, _)| header)),
			None => Ok(None),
		}
	}

	/// Unlinks the row from every index. The row chunk stays in the store.
	pub fn delete(&mut self, value: &Value) -> Result<bool> {
		let key = self.primary_key(value)?;
		let fingerprint = match self.primary_index().get(&key)? {
			Some(fingerprint) => fingerprint,
			None => return Ok(false),
		};
		let row = self.read_row(&fingerprint)?.map(|(_, row)| row);

		for (i, descriptor) in self.descriptor.columns.iter().enumerate() {
			let index = match self.indexes[i] {
				Some(ref mut index) => index,
				None => continue,
			};
			if i == self.primary {
				index.delete(&key)?;
				continue;
			}
			let column = &descriptor.column;
			if let Some(value) = row.as_ref().and_then(|r| r.get(&column.name)) {
				let value_key = value.to_key(column.column_type)?;
				if index.get(&value_key)? == Some(key) {
					index.delete(&value_key)?;
				}
			}
		}

		debug!(table = %self.key(), fingerprint = %to_hex(&fingerprint), "deleted row");
		if !self.buffered {
			self.flush_buffer()?;
		}
		Ok(true)
	}

	/// Every row in primary key order. Only the primary column can be
	/// scanned.
	pub fn scan(&mut self, column: &str, ascending: bool) -> Result<Vec<Row>> {
		if column != self.primary_column().name {
			bail!(ErrorKind::InvalidRequest(format!("scan on {} but only primary column {} is scannable", column, self.primary_column().name)));
		}
		let pairs = if ascending {
			let mut cursor = self.primary_index().seek_first()?;
			collect_forward(&mut *cursor)?
		} else {
			let mut cursor = self.primary_index().seek_last()?;
			collect_backward(&mut *cursor)?
		};
		pairs.iter().map(|&(_, ref fingerprint)| self.load_row(fingerprint)).collect()
	}

	/// One row per column: `ColumnName`, `ColumnType`, `IndexType`, `Primary`.
	pub fn describe(&self) -> Vec<Row> {
		self.descriptor.columns.iter()
			.map(|c| Row::new()
				.with("ColumnName", c.column.name.as_str())
				.with("ColumnType", c.column.column_type.code() as i64)
				.with("IndexType", c.column.index_type.code() as i64)
				.with("Primary", c.column.primary as i64))
			.collect()
	}

	/// Holds index writes in memory until `flush_buffer`.
	pub fn start_buffer(&mut self) -> Result<()> {
		self.buffered = true;
		Ok(())
	}

	/// Writes every dirty index node, then the descriptor with the new
	/// roots, and publishes it. Returns the descriptor hash. Ends buffered
	/// mode, later writes publish immediately until `start_buffer`.
	pub fn flush_buffer(&mut self) -> Result<Hash> {
		let roots = self.indexes.par_iter_mut()
			.map(|slot| -> Result<Option<Hash>> {
				match *slot {
					Some(ref mut index) => {
						let root = index.flush_buffer()?;
						index.start_buffer()?;
						Ok(Some(root))
					},
					None => Ok(None),
				}
			})
			.collect::<Result<Vec<_>>>()?;
		for (column, root) in self.descriptor.columns.iter_mut().zip(roots) {
			if let Some(root) = root {
				column.root = root;
			}
		}

		let hash = self.catalog.store_descriptor(&self.user, &self.owner, &self.database, &self.name, &self.descriptor)?;
		self.buffered = false;
		debug!(table = %self.key(), descriptor = %to_hex(&hash), "flushed table");
		Ok(hash)
	}

	/// Renders the loaded part of every index.
	pub fn print(&self) -> String {
		let mut out = String::new();
		for (descriptor, index) in self.descriptor.columns.iter().zip(&self.indexes) {
			if let Some(ref index) = *index {
				out.push_str(&format!("{} ({}):\n", descriptor.column.name, index.index_type()));
				out.push_str(&index.print());
			}
		}
		out
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use catalog::{Catalog, Column};
	use chunk::ChunkCodec;
	use ens::MemoryNameService;
	use error::ErrorKind;
	use index::KeyIndex;
	use key::{encode_bytes, ColumnType, IndexType};
	use keymanager::{KeyManager, LocalKeyManager};
	use options::User;
	use row::{Row, Value};
	use store::MemoryChunkStore;
	use super::Table;

	fn setup(index: IndexType, encrypted: bool) -> (Catalog, User) {
		let keys = Arc::new(LocalKeyManager::random());
		let user = User::new(keys.address());
		keys.add_user(&user.address, "secret");
		let codec = ChunkCodec::new(Arc::new(MemoryChunkStore::new()), keys);
		let catalog = Catalog::new(codec, Arc::new(MemoryNameService::new()));
		catalog.create_database(&user, "wolk.eth", "db", encrypted).unwrap();
		catalog.create_table(&user, "wolk.eth", "db", "t", &[
			Column::new("id", ColumnType::Integer, index, true),
			Column::new("email", ColumnType::String, IndexType::HashTrie, false),
			Column::new("age", ColumnType::Integer, IndexType::None, false),
		]).unwrap();
		(catalog, user)
	}

	fn person(id: i64, email: &str) -> Row {
		Row::new().with("id", id).with("email", email).with("age", id * 2)
	}

	#[test]
	fn rows_survive_reopen() {
		for &index in &[IndexType::BPlusTree, IndexType::HashTrie] {
			let (catalog, user) = setup(index, false);
			let mut table = Table::open(catalog.clone(), &user, "wolk.eth", "db", "t").unwrap();
			for i in 1..30 {
				table.put(&person(i, &format!("p{}@wolk.eth", i))).unwrap();
			}

			let mut table = Table::open(catalog, &user, "wolk.eth", "db", "t").unwrap();
			assert_eq!(table.get(&Value::Int(7)).unwrap(), Some(person(7, "p7@wolk.eth")));
			assert_eq!(table.get(&Value::from("7")).unwrap(), Some(person(7, "p7@wolk.eth")));
			assert_eq!(table.get(&Value::Int(99)).unwrap(), None);
			assert_eq!(table.scan("id", true).unwrap().len(), 29);
		}
	}

	#[test]
	fn scan_orders_by_primary_key() {
		let (catalog, user) = setup(IndexType::BPlusTree, false);
		let mut table = Table::open(catalog, &user, "wolk.eth", "db", "t").unwrap();
		for &i in &[5, -3, 12, 0, 7] {
			table.put(&person(i, "x")).unwrap();
		}
		let ids = |rows: Vec<Row>| rows.iter().map(|r| r.get("id").cloned().unwrap()).collect::<Vec<_>>();
		assert_eq!(ids(table.scan("id", true).unwrap()), vec![Value::Int(-3), Value::Int(0), Value::Int(5), Value::Int(7), Value::Int(12)]);
		assert_eq!(ids(table.scan("id", false).unwrap()), vec![Value::Int(12), Value::Int(7), Value::Int(5), Value::Int(0), Value::Int(-3)]);
		assert_matches!(*table.scan("email", true).unwrap_err().kind(), ErrorKind::InvalidRequest(_));
	}

	#[test]
	fn overwrite_keeps_birth_and_bumps_version() {
		let (catalog, user) = setup(IndexType::BPlusTree, true);
		let mut table = Table::open(catalog, &user, "wolk.eth", "db", "t").unwrap();
		table.put(&person(42, "old@wolk.eth")).unwrap();
		let first = table.header(&Value::Int(42)).unwrap().unwrap();
		table.put(&person(42, "new@wolk.eth")).unwrap();
		let second = table.header(&Value::Int(42)).unwrap().unwrap();

		assert_eq!(first.version, 0);
		assert_eq!(second.version, 1);
		assert_eq!(second.birth_ts, first.birth_ts);
		assert!(second.encrypted);
		assert_eq!(table.get(&Value::Int(42)).unwrap().unwrap().get("email"), Some(&Value::from("new@wolk.eth")));
	}

	#[test]
	fn secondary_entries_follow_the_row() {
		let (catalog, user) = setup(IndexType::BPlusTree, false);
		let mut table = Table::open(catalog, &user, "wolk.eth", "db", "t").unwrap();
		let key = table.primary_key(&Value::Int(1)).unwrap();
		table.put(&person(1, "a@wolk.eth")).unwrap();
		table.put(&person(1, "b@wolk.eth")).unwrap();

		let email = |table: &mut Table, s: &str| table.indexes[1].as_mut().unwrap().get(&encode_bytes(s.as_bytes())).unwrap();
		assert_eq!(email(&mut table, "a@wolk.eth"), None);
		assert_eq!(email(&mut table, "b@wolk.eth"), Some(key));

		assert!(table.delete(&Value::Int(1)).unwrap());
		assert!(!table.delete(&Value::Int(1)).unwrap());
		assert_eq!(email(&mut table, "b@wolk.eth"), None);
		assert_eq!(table.get(&Value::Int(1)).unwrap(), None);
	}

	#[test]
	fn cells_come_back_with_their_column_types() {
		let keys = Arc::new(LocalKeyManager::random());
		let user = User::new(keys.address());
		let codec = ChunkCodec::new(Arc::new(MemoryChunkStore::new()), keys);
		let catalog = Catalog::new(codec, Arc::new(MemoryNameService::new()));
		catalog.create_database(&user, "wolk.eth", "db", false).unwrap();
		catalog.create_table(&user, "wolk.eth", "db", "t", &[
			Column::new("id", ColumnType::Integer, IndexType::BPlusTree, true),
			Column::new("b", ColumnType::Blob, IndexType::HashTrie, false),
			Column::new("f", ColumnType::Float, IndexType::None, false),
		]).unwrap();

		let mut table = Table::open(catalog.clone(), &user, "wolk.eth", "db", "t").unwrap();
		let row = Row::new().with("id", 1).with("b", vec![1u8, 2]).with("f", 2.0);
		table.put(&row).unwrap();
		assert_eq!(table.get(&Value::Int(1)).unwrap(), Some(row.clone()));

		let mut table = Table::open(catalog, &user, "wolk.eth", "db", "t").unwrap();
		assert_eq!(table.scan("id", true).unwrap(), vec![row]);
	}

	#[test]
	fn rows_are_checked_against_the_schema() {
		let (catalog, user) = setup(IndexType::BPlusTree, false);
		let mut table = Table::open(catalog, &user, "wolk.eth", "db", "t").unwrap();
		assert_matches!(*table.put(&Row::new().with("email", "x")).unwrap_err().kind(), ErrorKind::InvalidRequest(_));
		assert_matches!(*table.put(&person(1, "x").with("nope", 1)).unwrap_err().kind(), ErrorKind::InvalidRequest(_));
		assert_matches!(*table.put(&Row::new().with("id", "abc")).unwrap_err().kind(), ErrorKind::Type(_));
		assert_matches!(*table.put(&Row::new().with("id", i64::min_value())).unwrap_err().kind(), ErrorKind::InvalidRequest(_));
		assert_matches!(*table.put(&person(1, &"x".repeat(4000))).unwrap_err().kind(), ErrorKind::Size(_));
	}

	#[test]
	fn buffered_writes_publish_on_flush() {
		let (catalog, user) = setup(IndexType::BPlusTree, false);
		let mut table = Table::open(catalog.clone(), &user, "wolk.eth", "db", "t").unwrap();
		table.start_buffer().unwrap();
		for i in 1..20 {
			table.put(&person(i, "x")).unwrap();
		}
		{
			let mut stale = Table::open(catalog.clone(), &user, "wolk.eth", "db", "t").unwrap();
			assert_eq!(stale.scan("id", true).unwrap().len(), 0);
		}
		table.flush_buffer().unwrap();
		assert!(!table.is_buffered());

		let mut fresh = Table::open(catalog, &user, "wolk.eth", "db", "t").unwrap();
		assert_eq!(fresh.scan("id", true).unwrap().len(), 19);
		assert_eq!(fresh.describe().len(), 3);
	}
}
