//! Request dispatch over the catalog and the registry of open tables.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json;

use error::{ErrorKind, Result};
use catalog::{table_key, Catalog, Column};
use chunk::ChunkCodec;
use ens::{FileNameService, MemoryNameService, NameService};
use hash::{to_hex, Address};
use keymanager::{parse_address, KeyManager, LocalKeyManager};
use options::{Options, User};
use query::{execute, QueryOption, QueryParser, QueryType};
use row::{Row, Value};
use store::{ChunkStore, FileChunkStore, MemoryChunkStore};
use table::Table;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestType {
	CreateDatabase,
	DropDatabase,
	ListDatabases,
	CreateTable,
	DropTable,
	ListTables,
	DescribeTable,
	Scan,
	Put,
	Get,
	Delete,
	StartBuffer,
	FlushBuffer,
	Query,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
	#[serde(rename = "requesttype", alias = "RequestType")]
	pub request_type: RequestType,
	#[serde(default, alias = "Owner")]
	pub owner: String,
	#[serde(default, alias = "Database")]
	pub database: String,
	#[serde(default, alias = "Table")]
	pub table: String,
	#[serde(default, alias = "Key")]
	pub key: Option<Value>,
	#[serde(default, alias = "Rows")]
	pub rows: Vec<Row>,
	#[serde(default, alias = "Columns")]
	pub columns: Vec<Column>,
	#[serde(default, alias = "Encrypted")]
	pub encrypted: u8,
	#[serde(default, rename = "rawquery", alias = "RawQuery")]
	pub raw_query: Option<String>,
	#[serde(default, alias = "Query")]
	pub query: Option<QueryOption>,
}

impl Request {
	pub fn new(request_type: RequestType, owner: &str, database: &str, table: &str) -> Self {
		Request {
			request_type,
			owner: owner.to_owned(),
			database: database.to_owned(),
			table: table.to_owned(),
			key: None,
			rows: Vec::new(),
			columns: Vec::new(),
			encrypted: 0,
			raw_query: None,
			query: None,
		}
	}
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
	#[serde(default)]
	pub affected_row_count: usize,
	#[serde(default)]
	pub matched_row_count: usize,
	#[serde(default)]
	pub data: Vec<Row>,
}

impl Response {
	fn affected(count: usize) -> Self {
		Response { affected_row_count: count, ..Response::default() }
	}

	fn matched(data: Vec<Row>) -> Self {
		Response { matched_row_count: data.len(), data, ..Response::default() }
	}
}

fn require(field: &str, value: &str) -> Result<()> {
	if value.is_empty() {
		bail!(ErrorKind::InvalidRequest(format!("{} is required", field)));
	}
	Ok(())
}

/// The database: collaborators, catalog and open tables.
pub struct Engine {
	options: Options,
	catalog: Catalog,
	ens: Arc<dyn NameService>,
	signer: Address,
	tables: RwLock<HashMap<String, Arc<Mutex<Table>>>>,
	parser: Option<Box<dyn QueryParser>>,
}

impl Engine {
	pub fn new(options: Options, store: Arc<dyn ChunkStore>, ens: Arc<dyn NameService>, keys: Arc<dyn KeyManager>) -> Self {
		let signer = keys.address();
		Engine {
			options,
			catalog: Catalog::new(ChunkCodec::new(store, keys), ens.clone()),
			ens,
			signer,
			tables: RwLock::new(HashMap::new()),
			parser: None,
		}
	}

	/// Builds file backed or in-memory collaborators as configured.
	pub fn open(options: Options) -> Result<Self> {
		options.validate()?;
		let store: Arc<dyn ChunkStore> = match options.chunk_db_path {
			Some(ref path) => Arc::new(FileChunkStore::open(path)?),
			None => Arc::new(MemoryChunkStore::new()),
		};
		let ens: Arc<dyn NameService> = match options.ens_path {
			Some(ref path) => Arc::new(FileNameService::open(path)?),
			None => Arc::new(MemoryNameService::new()),
		};
		let keys = Arc::new(LocalKeyManager::from_options(&options)?);
		info!(
			signer = %to_hex(&keys.address()),
			chunks = ?options.chunk_db_path,
			ens = ?options.ens_path,
			users = options.users.len(),
			"opened engine"
		);
		Ok(Engine::new(options, store, ens, keys))
	}

	/// Installs the front-end for `rawquery` requests.
	pub fn with_parser(mut self, parser: Box<dyn QueryParser>) -> Self {
		self.parser = Some(parser);
		self
	}

	pub fn catalog(&self) -> &Catalog {
		&self.catalog
	}

	pub fn options(&self) -> &Options {
		&self.options
	}

	/// The configured user at `address`, or one with the default policy.
	pub fn user(&self, address: &str) -> Result<User> {
		match self.options.user(address) {
			Some(user) => User::from_options(user),
			None => Ok(User::new(parse_address(address)?)),
		}
	}

	/// The first configured user, falling back to the signing key.
	pub fn default_user(&self) -> Result<User> {
		match self.options.users.first() {
			Some(user) => User::from_options(user),
			None => Ok(User::new(self.signer)),
		}
	}

	/// The open table, opening and registering it on first use.
	pub fn table(&self, user: &User, owner: &str, database: &str, name: &str) -> Result<Arc<Mutex<Table>>> {
		let key = table_key(owner, database, name);
		if let Some(table) = self.tables.read().get(&key) {
			return Ok(table.clone());
		}

		let mut table = Table::open(self.catalog.clone(), user, owner, database, name)?;
		if self.options.buffered {
			table.start_buffer()?;
		}
		let mut tables = self.tables.write();
		Ok(tables.entry(key).or_insert_with(|| Arc::new(Mutex::new(table))).clone())
	}

	/// Runs `f` with exclusive access to the table, acting as `user`.
	pub fn with_table<F, T>(&self, user: &User, owner: &str, database: &str, name: &str, f: F) -> Result<T> where
		F: FnOnce(&mut Table) -> Result<T>,
	{
		let table = self.table(user, owner, database, name)?;
		let mut table = table.lock();
		table.set_user(user);
		f(&mut table)
	}

	/// Forgets an open table. Unflushed buffered writes are dropped.
	pub fn unregister(&self, owner: &str, database: &str, name: &str) -> bool {
		self.tables.write().remove(&table_key(owner, database, name)).is_some()
	}

	pub fn create_database(&self, user: &User, owner: &str, database: &str, encrypted: bool) -> Result<()> {
		self.catalog.create_database(user, owner, database, encrypted)
	}

	pub fn drop_database(&self, user: &User, owner: &str, database: &str) -> Result<bool> {
		let dropped = self.catalog.drop_database(user, owner, database)?;
		let prefix = table_key(owner, database, "");
		self.tables.write().retain(|key, _| !key.starts_with(&prefix));
		Ok(dropped)
	}

	pub fn create_table(&self, user: &User, owner: &str, database: &str, name: &str, columns: &[Column]) -> Result<()> {
		self.catalog.create_table(user, owner, database, name, columns).map(|_| ())
	}

	pub fn drop_table(&self, user: &User, owner: &str, database: &str, name: &str) -> Result<bool> {
		let dropped = self.catalog.drop_table(user, owner, database, name)?;
		self.unregister(owner, database, name);
		Ok(dropped)
	}

	/// Parses a JSON request envelope and handles it.
	pub fn handle_json(&self, user: &User, json: &str) -> Result<Response> {
		let request: Request = serde_json::from_str(json)
			.map_err(|e| ErrorKind::InvalidRequest(format!("cannot parse request: {}", e)))?;
		self.handle(user, &request)
	}

	pub fn handle(&self, user: &User, request: &Request) -> Result<Response> {
		let result = self.dispatch(user, request);
		if let Err(ref e) = result {
			if !e.kind().is_structured() {
				warn!(request = ?request.request_type, owner = %request.owner, database = %request.database, table = %request.table, error = %e, "request failed");
			}
		}
		result
	}

	fn dispatch(&self, user: &User, r: &Request) -> Result<Response> {
		require("owner", &r.owner)?;
		if r.request_type != RequestType::ListDatabases {
			require("database", &r.database)?;
		}

		match r.request_type {
			RequestType::CreateDatabase => {
				self.create_database(user, &r.owner, &r.database, r.encrypted > 0)?;
				Ok(Response::affected(1))
			},
			RequestType::DropDatabase => {
				let dropped = self.drop_database(user, &r.owner, &r.database)?;
				Ok(Response::affected(dropped as usize))
			},
			RequestType::ListDatabases => {
				let names = self.catalog.list_databases(user, &r.owner)?;
				Ok(Response::matched(names.into_iter().map(|name| Row::new().with("database", name)).collect()))
			},
			RequestType::ListTables => {
				let names = self.catalog.list_tables(user, &r.owner, &r.database)?;
				Ok(Response::matched(names.into_iter().map(|name| Row::new().with("table", name)).collect()))
			},
			RequestType::CreateTable => {
				require("table", &r.table)?;
				if r.columns.is_empty() {
					bail!(ErrorKind::InvalidRequest("columns are required".into()));
				}
				self.create_table(user, &r.owner, &r.database, &r.table, &r.columns)?;
				Ok(Response::affected(1))
			},
			RequestType::DropTable => {
				require("table", &r.table)?;
				let dropped = self.drop_table(user, &r.owner, &r.database, &r.table)?;
				Ok(Response::affected(dropped as usize))
			},
			RequestType::Query => self.query(user, r),
			_ => {
				require("table", &r.table)?;
				let buffered = self.options.buffered;
				self.with_table(user, &r.owner, &r.database, &r.table, |table| Self::table_request(table, r, buffered))
			},
		}
	}

	/// `buffered` keeps tables of a buffering engine buffered across flushes.
	fn table_request(table: &mut Table, r: &Request, buffered: bool) -> Result<Response> {
		let key = || r.key.as_ref().ok_or_else(|| ErrorKind::InvalidRequest(format!("{:?} needs a key", r.request_type)));
		match r.request_type {
			RequestType::DescribeTable => Ok(Response::matched(table.describe())),
			RequestType::Scan => {
				let primary = table.primary_column().name.clone();
				let rows = table.scan(&primary, true)?;
				Ok(Response { affected_row_count: rows.len(), ..Response::matched(rows) })
			},
			RequestType::Put => {
				for row in &r.rows {
					table.coerce_row(row)?;
				}
				for row in &r.rows {
					table.put(row)?;
				}
				Ok(Response::affected(r.rows.len()))
			},
			RequestType::Get => {
				let row = table.get(key()?)?;
				Ok(Response::matched(row.into_iter().collect()))
			},
			RequestType::Delete => {
				let deleted = table.delete(key()?)?;
				Ok(Response::affected(deleted as usize))
			},
			RequestType::StartBuffer => {
				table.start_buffer()?;
				Ok(Response::affected(1))
			},
			RequestType::FlushBuffer => {
				table.flush_buffer()?;
				if buffered {
					table.start_buffer()?;
				}
				Ok(Response::affected(1))
			},
			other => bail!(ErrorKind::InvalidRequest(format!("{:?} is not a table request", other))),
		}
	}

	fn query(&self, user: &User, r: &Request) -> Result<Response> {
		let mut query = match (r.query.as_ref(), r.raw_query.as_ref()) {
			(Some(query), _) => query.clone(),
			(None, Some(raw)) => match self.parser {
				Some(ref parser) => parser.parse(raw)?,
				None => bail!(ErrorKind::InvalidRequest("raw queries need a query parser".into())),
			},
			(None, None) => bail!(ErrorKind::InvalidRequest("query or rawquery is required".into())),
		};
		if query.table.is_empty() {
			query.table = r.table.clone();
		}
		require("table", &query.table)?;

		let result = self.with_table(user, &r.owner, &r.database, &query.table, |table| execute(table, &query))?;
		Ok(match query.query_type {
			QueryType::Select => Response { affected_row_count: result.affected, ..Response::matched(result.rows) },
			_ => Response::affected(result.affected),
		})
	}

	/// Flushes buffered tables and confirms pending name service writes.
	pub fn close(&self) -> Result<()> {
		let tables = self.tables.read();
		for (key, table) in tables.iter() {
			let mut table = table.lock();
			if table.is_buffered() {
				debug!(table = %key, "flushing on close");
				table.flush_buffer()?;
			}
		}
		let committed = self.ens.commit_pending()?;
		info!(tables = tables.len(), committed, "closed engine");
		Ok(())
	}
}
