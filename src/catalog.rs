//! Owner, database and table directories.
//!
//! ```text
//!  name service                owner chunk                    database chunk
//!  keccak(owner) ---> |keccak(owner)|..|db slot|db slot|... |name|..|tbl slot|...
//!                       0             64 128                  0    64 128
//!
//!  db slot:  |name 31|enc|database chunk hash|    tbl slot: |name 32|descriptor hash|
//!
//!  name service                       table descriptor
//!  owner|database|table ---> |..........|column 0|column 1|...|enc|
//!                             0          2048     2112        4000
//!
//!  column:   |name 25|.|primary|.|ctype|.|itype|.|root hash|
//!             0       25 26     27 28   29 30   31 32       64
//! ```
//!
//! The name service holds the live descriptor hash of each table. The hash
//! in the database chunk is the descriptor written when the table was
//! created.

use std::collections::HashSet;
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};

use error::{ErrorKind, Result};
use chunk::{ChunkCodec, CHUNK_SIZE, SEALED_SPAN};
use ens::NameService;
use hash::{is_zero, keccak256, to_hash, to_hex, trim_zeros, Hash, ZERO_HASH};
use key::{ColumnType, IndexType};
use options::User;

pub const DATABASE_NAME_LENGTH_MAX: usize = 31;
pub const TABLE_NAME_LENGTH_MAX: usize = 32;
pub const COLUMN_NAME_LENGTH_MAX: usize = 25;
pub const COLUMNS_PER_TABLE_MAX: usize = 30;

const SLOT: usize = 64;
const FIRST_SLOT: usize = 2 * SLOT;
const COLUMNS_OFFSET: usize = 2048;
const ENCRYPTED_OFFSET: usize = 4000;

/// A column as declared by `CreateTable`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
	#[serde(rename = "columnname", alias = "ColumnName")]
	pub name: String,
	#[serde(rename = "columntype", alias = "ColumnType")]
	pub column_type: ColumnType,
	#[serde(rename = "indextype", alias = "IndexType")]
	pub index_type: IndexType,
	#[serde(default, alias = "Primary")]
	pub primary: u8,
}

impl Column {
	pub fn new<S: Into<String>>(name: S, column_type: ColumnType, index_type: IndexType, primary: bool) -> Self {
		Column {
			name: name.into(),
			column_type,
			index_type,
			primary: primary as u8,
		}
	}

	pub fn is_primary(&self) -> bool {
		self.primary > 0
	}
}

/// A column together with the root of its index.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDescriptor {
	pub column: Column,
	pub root: Hash,
}

/// Decoded table descriptor chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct TableDescriptor {
	pub encrypted: bool,
	pub columns: Vec<ColumnDescriptor>,
}

impl TableDescriptor {
	pub fn new(columns: &[Column], encrypted: bool) -> Self {
		TableDescriptor {
			encrypted,
			columns: columns.iter().cloned().map(|column| ColumnDescriptor { column, root: ZERO_HASH }).collect(),
		}
	}

	pub fn primary(&self) -> Option<&ColumnDescriptor> {
		self.columns.iter().find(|c| c.column.is_primary())
	}

	pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
		self.columns.iter().find(|c| c.column.name == name)
	}

	pub fn to_chunk(&self) -> Vec<u8> {
		let mut chunk = vec![0u8; CHUNK_SIZE];
		for (i, descriptor) in self.columns.iter().enumerate() {
			let slot = &mut chunk[COLUMNS_OFFSET + i * SLOT..COLUMNS_OFFSET + (i + 1) * SLOT];
			let name = descriptor.column.name.as_bytes();
			slot[..name.len()].copy_from_slice(name);
			slot[26] = descriptor.column.primary;
			slot[28] = descriptor.column.column_type.code();
			slot[30] = descriptor.column.index_type.code();
			slot[32..].copy_from_slice(&descriptor.root);
		}
		BigEndian::write_u64(&mut chunk[ENCRYPTED_OFFSET..ENCRYPTED_OFFSET + 8], self.encrypted as u64);
		chunk
	}

	pub fn from_chunk(chunk: &[u8]) -> Result<Self> {
		let mut columns = Vec::new();
		let mut offset = COLUMNS_OFFSET;
		while offset + SLOT <= ENCRYPTED_OFFSET && chunk[offset] != 0 {
			let slot = &chunk[offset..offset + SLOT];
			let name = String::from_utf8(trim_zeros(&slot[..COLUMN_NAME_LENGTH_MAX]).to_vec())
				.map_err(|_| ErrorKind::Integrity("column name is not utf-8".into()))?;
			let column_type = ColumnType::from_code(slot[28])
				.ok_or_else(|| ErrorKind::Schema(format!("column {} has type {}", name, slot[28])))?;
			let index_type = IndexType::from_code(slot[30])
				.ok_or_else(|| ErrorKind::Schema(format!("column {} has index {}", name, slot[30])))?;
			columns.push(ColumnDescriptor {
				column: Column { name, column_type, index_type, primary: slot[26] },
				root: to_hash(&slot[32..]),
			});
			offset += SLOT;
		}

		let primaries = columns.iter().filter(|c| c.column.is_primary()).count();
		if primaries > 1 {
			bail!(ErrorKind::Schema(format!("table has {} primary columns", primaries)));
		}
		Ok(TableDescriptor {
			encrypted: BigEndian::read_u64(&chunk[ENCRYPTED_OFFSET..ENCRYPTED_OFFSET + 8]) > 0,
			columns,
		})
	}
}

/// Name service key of a table descriptor.
pub fn table_key(owner: &str, database: &str, table: &str) -> String {
	format!("{}|{}|{}", owner, database, table)
}

/// Zero padded fixed width name.
fn padded(name: &str, width: usize) -> Vec<u8> {
	let mut out = vec![0u8; width];
	let bytes = name.as_bytes();
	let len = ::std::cmp::min(bytes.len(), width);
	out[..len].copy_from_slice(&bytes[..len]);
	out
}

/// Offsets of the directory slots of an owner or database chunk. Slots end
/// within the part of a chunk that survives sealing.
fn slots() -> ::std::iter::StepBy<::std::ops::Range<usize>> {
	(FIRST_SLOT..SEALED_SPAN - SLOT + 1).step_by(SLOT)
}

fn check_name(kind: &str, name: &str, max: usize) -> Result<()> {
	if name.is_empty() {
		bail!(ErrorKind::InvalidRequest(format!("{} name is empty", kind)));
	}
	if name.len() > max {
		bail!(ErrorKind::Size(format!("{} name {} longer than {} bytes", kind, name, max)));
	}
	Ok(())
}

/// The directory chain from owners to table descriptors.
#[derive(Clone)]
pub struct Catalog {
	codec: ChunkCodec,
	ens: Arc<dyn NameService>,
}

/// An owner chunk with the position of one of its database slots.
struct DatabaseEntry {
	owner_hash: Hash,
	owner_chunk: Vec<u8>,
	slot: usize,
	encrypted: bool,
	database_chunk: Vec<u8>,
}

impl Catalog {
	pub fn new(codec: ChunkCodec, ens: Arc<dyn NameService>) -> Self {
		Catalog { codec, ens }
	}

	pub fn codec(&self) -> &ChunkCodec {
		&self.codec
	}

	pub fn name_service(&self) -> &dyn NameService {
		&*self.ens
	}

	/// Owner chunk of `owner`, `None` if the owner never created a database.
	fn owner_chunk(&self, user: &User, owner: &str) -> Result<Option<(Hash, Vec<u8>)>> {
		let owner_hash = keccak256(owner.as_bytes());
		let root = match self.ens.get_root_hash(&owner_hash)? {
			Some(root) => root,
			None => return Ok(None),
		};
		let chunk = self.codec.retrieve_existing(user, &root)?
			.ok_or_else(|| ErrorKind::NotFound(format!("owner chunk {} of {}", to_hex(&root), owner)))?;
		if chunk[..32] != owner_hash[..] {
			bail!(ErrorKind::Integrity(format!("owner chunk {} does not belong to {}", to_hex(&root), owner)));
		}
		Ok(Some((owner_hash, chunk)))
	}

	fn publish_owner(&self, user: &User, owner_hash: &Hash, owner_chunk: &[u8]) -> Result<()> {
		let root = self.codec.store_chunk(user, owner_chunk, false)?;
		self.ens.store_root_hash(owner_hash, &root)?;
		debug!(owner = %to_hex(owner_hash), root = %to_hex(&root), "published owner chunk");
		Ok(())
	}

	fn find_database_slot(owner_chunk: &[u8], database: &str) -> Option<usize> {
		let name = padded(database, DATABASE_NAME_LENGTH_MAX);
		slots().find(|&i| owner_chunk[i..i + DATABASE_NAME_LENGTH_MAX] == name[..])
	}

	fn database(&self, user: &User, owner: &str, database: &str) -> Result<DatabaseEntry> {
		check_name("database", database, DATABASE_NAME_LENGTH_MAX)?;
		let (owner_hash, owner_chunk) = self.owner_chunk(user, owner)?
			.ok_or_else(|| ErrorKind::NotFound(format!("owner {}", owner)))?;
		let slot = Self::find_database_slot(&owner_chunk, database)
			.ok_or_else(|| ErrorKind::NotFound(format!("database {} of {}", database, owner)))?;
		let database_hash = to_hash(&owner_chunk[slot + 32..slot + SLOT]);
		let database_chunk = self.codec.retrieve_existing(user, &database_hash)?
			.ok_or_else(|| ErrorKind::NotFound(format!("database chunk {} of {}", to_hex(&database_hash), database)))?;
		Ok(DatabaseEntry {
			owner_hash,
			encrypted: owner_chunk[slot + DATABASE_NAME_LENGTH_MAX] > 0,
			owner_chunk,
			slot,
			database_chunk,
		})
	}

	/// Writes a changed database chunk and re-links the owner chunk to it.
	fn publish_database(&self, user: &User, entry: &mut DatabaseEntry) -> Result<()> {
		let database_hash = self.codec.store_chunk(user, &entry.database_chunk, entry.encrypted)?;
		entry.owner_chunk[entry.slot + 32..entry.slot + SLOT].copy_from_slice(&database_hash);
		self.publish_owner(user, &entry.owner_hash, &entry.owner_chunk)
	}

	pub fn create_database(&self, user: &User, owner: &str, database: &str, encrypted: bool) -> Result<()> {
		check_name("database", database, DATABASE_NAME_LENGTH_MAX)?;

		let (owner_hash, mut owner_chunk) = match self.owner_chunk(user, owner)? {
			Some(found) => found,
			None => {
				let owner_hash = keccak256(owner.as_bytes());
				let mut chunk = vec![0u8; CHUNK_SIZE];
				chunk[..32].copy_from_slice(&owner_hash);
				(owner_hash, chunk)
			},
		};
		if Self::find_database_slot(&owner_chunk, database).is_some() {
			bail!(ErrorKind::AlreadyExists(format!("database {} of {}", database, owner)));
		}
		let slot = slots()
			.find(|&i| is_zero(&owner_chunk[i..i + SLOT]))
			.ok_or_else(|| ErrorKind::Size(format!("owner {} has no room for another database", owner)))?;

		let mut database_chunk = vec![0u8; CHUNK_SIZE];
		database_chunk[..database.len()].copy_from_slice(database.as_bytes());
		let database_hash = self.codec.store_chunk(user, &database_chunk, encrypted)?;

		owner_chunk[slot..slot + database.len()].copy_from_slice(database.as_bytes());
		owner_chunk[slot + DATABASE_NAME_LENGTH_MAX] = encrypted as u8;
		owner_chunk[slot + 32..slot + SLOT].copy_from_slice(&database_hash);
		self.publish_owner(user, &owner_hash, &owner_chunk)?;

		info!(owner, database, encrypted, "created database");
		Ok(())
	}

	/// Returns `false` if the owner has no such database.
	pub fn drop_database(&self, user: &User, owner: &str, database: &str) -> Result<bool> {
		check_name("database", database, DATABASE_NAME_LENGTH_MAX)?;
		let (owner_hash, mut owner_chunk) = match self.owner_chunk(user, owner)? {
			Some(found) => found,
			None => return Ok(false),
		};
		let slot = match Self::find_database_slot(&owner_chunk, database) {
			Some(slot) => slot,
			None => return Ok(false),
		};
		for byte in &mut owner_chunk[slot..slot + SLOT] {
			*byte = 0;
		}
		self.publish_owner(user, &owner_hash, &owner_chunk)?;

		info!(owner, database, "dropped database");
		Ok(true)
	}

	/// Database names of `owner`. Unknown owners have none.
	pub fn list_databases(&self, user: &User, owner: &str) -> Result<Vec<String>> {
		let owner_chunk = match self.owner_chunk(user, owner)? {
			Some((_, chunk)) => chunk,
			None => return Ok(Vec::new()),
		};
		Ok(slots()
			.filter(|&i| !is_zero(&owner_chunk[i..i + DATABASE_NAME_LENGTH_MAX]))
			.map(|i| String::from_utf8_lossy(trim_zeros(&owner_chunk[i..i + DATABASE_NAME_LENGTH_MAX])).into_owned())
			.collect())
	}

	pub fn list_tables(&self, user: &User, owner: &str, database: &str) -> Result<Vec<String>> {
		let entry = self.database(user, owner, database)?;
		let chunk = &entry.database_chunk;
		Ok(slots()
			.filter(|&i| !is_zero(&chunk[i..i + TABLE_NAME_LENGTH_MAX]))
			.map(|i| String::from_utf8_lossy(trim_zeros(&chunk[i..i + TABLE_NAME_LENGTH_MAX])).into_owned())
			.collect())
	}

	fn validate_columns(table: &str, columns: &[Column]) -> Result<()> {
		if table.is_empty() || columns.is_empty() {
			bail!(ErrorKind::InvalidRequest("table name and columns are required".into()));
		}
		if table.len() > TABLE_NAME_LENGTH_MAX {
			bail!(ErrorKind::Size(format!("table name {} longer than {} bytes", table, TABLE_NAME_LENGTH_MAX)));
		}
		if columns.len() > COLUMNS_PER_TABLE_MAX {
			bail!(ErrorKind::Size(format!("{} columns, at most {} allowed", columns.len(), COLUMNS_PER_TABLE_MAX)));
		}

		let mut names = HashSet::new();
		for column in columns {
			if column.name.is_empty() || column.name.len() > COLUMN_NAME_LENGTH_MAX {
				bail!(ErrorKind::Schema(format!("column name {:?} must be 1 to {} bytes", column.name, COLUMN_NAME_LENGTH_MAX)));
			}
			if !names.insert(column.name.as_str()) {
				bail!(ErrorKind::Schema(format!("duplicate column {}", column.name)));
			}
			if column.index_type == IndexType::FullText {
				bail!(ErrorKind::Schema(format!("column {}: full text indexes are not supported", column.name)));
			}
			if column.is_primary() && column.index_type == IndexType::None {
				bail!(ErrorKind::Schema(format!("primary column {} needs an index", column.name)));
			}
		}

		match columns.iter().filter(|c| c.is_primary()).count() {
			1 => Ok(()),
			0 => bail!(ErrorKind::Schema(format!("table {} has no primary column", table))),
			n => bail!(ErrorKind::Schema(format!("table {} has {} primary columns", table, n))),
		}
	}

	/// Creates the table and publishes its descriptor. Returns the
	/// descriptor hash.
	pub fn create_table(&self, user: &User, owner: &str, database: &str, table: &str, columns: &[Column]) -> Result<Hash> {
		Self::validate_columns(table, columns)?;

		let mut entry = self.database(user, owner, database)?;
		let name = padded(table, TABLE_NAME_LENGTH_MAX);
		if slots().any(|i| entry.database_chunk[i..i + TABLE_NAME_LENGTH_MAX] == name[..]) {
			bail!(ErrorKind::AlreadyExists(format!("table {} in {}", table, database)));
		}
		let slot = slots()
			.find(|&i| is_zero(&entry.database_chunk[i..i + SLOT]))
			.ok_or_else(|| ErrorKind::Size(format!("database {} has no room for another table", database)))?;

		let descriptor = TableDescriptor::new(columns, entry.encrypted);
		let descriptor_hash = self.codec.store_chunk(user, &descriptor.to_chunk(), descriptor.encrypted)?;

		entry.database_chunk[slot..slot + TABLE_NAME_LENGTH_MAX].copy_from_slice(&name);
		entry.database_chunk[slot + 32..slot + SLOT].copy_from_slice(&descriptor_hash);
		self.publish_database(user, &mut entry)?;
		self.ens.store_root_hash(table_key(owner, database, table).as_bytes(), &descriptor_hash)?;

		info!(owner, database, table, columns = columns.len(), "created table");
		Ok(descriptor_hash)
	}

	/// Returns `false` if the database has no such table.
	pub fn drop_table(&self, user: &User, owner: &str, database: &str, table: &str) -> Result<bool> {
		check_name("table", table, TABLE_NAME_LENGTH_MAX)?;
		let mut entry = self.database(user, owner, database)?;
		let name = padded(table, TABLE_NAME_LENGTH_MAX);
		let slot = match slots().find(|&i| entry.database_chunk[i..i + TABLE_NAME_LENGTH_MAX] == name[..]) {
			Some(slot) => slot,
			None => return Ok(false),
		};
		for byte in &mut entry.database_chunk[slot..slot + SLOT] {
			*byte = 0;
		}
		self.publish_database(user, &mut entry)?;
		self.ens.store_root_hash(table_key(owner, database, table).as_bytes(), &ZERO_HASH)?;

		info!(owner, database, table, "dropped table");
		Ok(true)
	}

	/// Resolves the live descriptor of a table.
	pub fn load_descriptor(&self, user: &User, owner: &str, database: &str, table: &str) -> Result<TableDescriptor> {
		check_name("table", table, TABLE_NAME_LENGTH_MAX)?;
		let entry = self.database(user, owner, database)?;
		let name = padded(table, TABLE_NAME_LENGTH_MAX);
		if !slots().any(|i| entry.database_chunk[i..i + TABLE_NAME_LENGTH_MAX] == name[..]) {
			bail!(ErrorKind::NotFound(format!("table {} in {}", table, database)));
		}

		let key = table_key(owner, database, table);
		let root = self.ens.get_root_hash(key.as_bytes())?
			.ok_or_else(|| ErrorKind::NotFound(format!("table {} has an empty root hash", key)))?;
		let chunk = self.codec.retrieve_existing(user, &root)?
			.ok_or_else(|| ErrorKind::NotFound(format!("descriptor {} of {}", to_hex(&root), key)))?;
		TableDescriptor::from_chunk(&chunk)
	}

	/// Writes a descriptor carrying new index roots and publishes it.
	pub fn store_descriptor(&self, user: &User, owner: &str, database: &str, table: &str, descriptor: &TableDescriptor) -> Result<Hash> {
		let hash = self.codec.store_chunk(user, &descriptor.to_chunk(), descriptor.encrypted)?;
		self.ens.store_root_hash(table_key(owner, database, table).as_bytes(), &hash)?;
		debug!(table = %table_key(owner, database, table), root = %to_hex(&hash), "published table descriptor");
		Ok(hash)
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;

	use chunk::ChunkCodec;
	use ens::{MemoryNameService, NameService};
	use error::ErrorKind;
	use hash::keccak256;
	use key::{ColumnType, IndexType};
	use keymanager::{KeyManager, LocalKeyManager};
	use options::User;
	use store::MemoryChunkStore;
	use super::{table_key, Catalog, Column, TableDescriptor};

	fn catalog() -> (Catalog, User) {
		let keys = Arc::new(LocalKeyManager::random());
		let user = User::new(keys.address());
		keys.add_user(&user.address, "secret");
		let codec = ChunkCodec::new(Arc::new(MemoryChunkStore::new()), keys);
		(Catalog::new(codec, Arc::new(MemoryNameService::new())), user)
	}

	fn columns() -> Vec<Column> {
		vec![
			Column::new("id", ColumnType::Integer, IndexType::BPlusTree, true),
			Column::new("v", ColumnType::String, IndexType::None, false),
		]
	}

	#[test]
	fn databases_come_and_go() {
		let (catalog, user) = catalog();
		assert!(catalog.list_databases(&user, "wolk.eth").unwrap().is_empty());

		catalog.create_database(&user, "wolk.eth", "videos", false).unwrap();
		catalog.create_database(&user, "wolk.eth", "music", true).unwrap();
		assert_matches!(
			*catalog.create_database(&user, "wolk.eth", "videos", false).unwrap_err().kind(),
			ErrorKind::AlreadyExists(_)
		);
		assert_eq!(catalog.list_databases(&user, "wolk.eth").unwrap(), vec!["videos".to_owned(), "music".to_owned()]);

		assert!(catalog.drop_database(&user, "wolk.eth", "videos").unwrap());
		assert!(!catalog.drop_database(&user, "wolk.eth", "videos").unwrap());
		assert_eq!(catalog.list_databases(&user, "wolk.eth").unwrap(), vec!["music".to_owned()]);
		catalog.create_database(&user, "wolk.eth", "videos", false).unwrap();
		assert_eq!(catalog.list_databases(&user, "wolk.eth").unwrap().len(), 2);
	}

	#[test]
	fn database_names_are_bounded() {
		let (catalog, user) = catalog();
		let long = "d".repeat(32);
		assert_matches!(
			*catalog.create_database(&user, "wolk.eth", &long, false).unwrap_err().kind(),
			ErrorKind::Size(_)
		);
		for i in 0..61 {
			catalog.create_database(&user, "wolk.eth", &format!("db{}", i), false).unwrap();
		}
		assert_matches!(
			*catalog.create_database(&user, "wolk.eth", "one_more", false).unwrap_err().kind(),
			ErrorKind::Size(_)
		);
	}

	#[test]
	fn tables_are_described_by_the_name_service() {
		let (catalog, user) = catalog();
		catalog.create_database(&user, "wolk.eth", "videos", true).unwrap();
		let hash = catalog.create_table(&user, "wolk.eth", "videos", "t1", &columns()).unwrap();

		let key = table_key("wolk.eth", "videos", "t1");
		assert_eq!(catalog.name_service().get_root_hash(key.as_bytes()).unwrap(), Some(hash));
		assert_eq!(catalog.list_tables(&user, "wolk.eth", "videos").unwrap(), vec!["t1".to_owned()]);

		let descriptor = catalog.load_descriptor(&user, "wolk.eth", "videos", "t1").unwrap();
		assert!(descriptor.encrypted);
		assert_eq!(descriptor.primary().unwrap().column.name, "id");
		assert_eq!(descriptor.columns.len(), 2);

		assert_matches!(
			*catalog.create_table(&user, "wolk.eth", "videos", "t1", &columns()).unwrap_err().kind(),
			ErrorKind::AlreadyExists(_)
		);

		assert!(catalog.drop_table(&user, "wolk.eth", "videos", "t1").unwrap());
		assert!(!catalog.drop_table(&user, "wolk.eth", "videos", "t1").unwrap());
		assert_eq!(catalog.name_service().get_root_hash(key.as_bytes()).unwrap(), None);
		assert!(catalog.list_tables(&user, "wolk.eth", "videos").unwrap().is_empty());
	}

	#[test]
	fn open_failures_are_distinct() {
		let (catalog, user) = catalog();
		let message = |r: ::error::Result<TableDescriptor>| match *r.unwrap_err().kind() {
			ErrorKind::NotFound(ref what) => what.clone(),
			ref other => panic!("unexpected {:?}", other),
		};

		assert!(message(catalog.load_descriptor(&user, "nobody", "videos", "t1")).starts_with("owner"));
		catalog.create_database(&user, "wolk.eth", "videos", false).unwrap();
		assert!(message(catalog.load_descriptor(&user, "wolk.eth", "music", "t1")).starts_with("database"));
		assert!(message(catalog.load_descriptor(&user, "wolk.eth", "videos", "t1")).starts_with("table t1"));
		assert_matches!(
			*catalog.list_tables(&user, "nobody", "videos").unwrap_err().kind(),
			ErrorKind::NotFound(_)
		);
	}

	#[test]
	fn schema_rules() {
		let (catalog, user) = catalog();
		catalog.create_database(&user, "wolk.eth", "videos", false).unwrap();
		let create = |columns: Vec<Column>| catalog.create_table(&user, "wolk.eth", "videos", "t", &columns).unwrap_err();

		let two_primaries = vec![
			Column::new("a", ColumnType::Integer, IndexType::BPlusTree, true),
			Column::new("b", ColumnType::Integer, IndexType::HashTrie, true),
		];
		assert_matches!(*create(two_primaries).kind(), ErrorKind::Schema(_));
		assert_matches!(*create(vec![Column::new("a", ColumnType::Integer, IndexType::BPlusTree, false)]).kind(), ErrorKind::Schema(_));
		assert_matches!(*create(vec![Column::new("a", ColumnType::Blob, IndexType::FullText, true)]).kind(), ErrorKind::Schema(_));
		assert_matches!(*create(vec![Column::new("x".repeat(26), ColumnType::Integer, IndexType::BPlusTree, true)]).kind(), ErrorKind::Schema(_));
		assert_matches!(*create(vec![]).kind(), ErrorKind::InvalidRequest(_));

		let wide: Vec<Column> = (0..31)
			.map(|i| Column::new(format!("c{}", i), ColumnType::Integer, IndexType::BPlusTree, i == 0))
			.collect();
		assert_matches!(*create(wide).kind(), ErrorKind::Size(_));
	}

	#[test]
	fn forged_owner_chunk_is_rejected() {
		let (catalog, user) = catalog();
		catalog.create_database(&user, "wolk.eth", "videos", false).unwrap();
		let alias = catalog.name_service().get_root_hash(&keccak256(b"wolk.eth")).unwrap().unwrap();
		catalog.name_service().store_root_hash(&keccak256(b"mallory.eth"), &alias).unwrap();
		assert_matches!(
			*catalog.list_databases(&user, "mallory.eth").unwrap_err().kind(),
			ErrorKind::Integrity(_)
		);
	}

	#[test]
	fn column_json_accepts_both_spellings() {
		let column: Column = ::serde_json::from_str(r#"{"columnname":"id","columntype":1,"indextype":2,"primary":1}"#).unwrap();
		assert_eq!(column, Column::new("id", ColumnType::Integer, IndexType::BPlusTree, true));
		let column: Column = ::serde_json::from_str(r#"{"ColumnName":"v","ColumnType":2,"IndexType":0}"#).unwrap();
		assert!(!column.is_primary());
	}
}
