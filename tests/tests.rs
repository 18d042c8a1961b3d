extern crate chunkdb;
#[macro_use]
extern crate matches;
extern crate rand;
extern crate serde_json;
extern crate tempdir;

use std::collections::HashMap;
use std::fs;
use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::thread_rng;
use tempdir::TempDir;

use chunkdb::{
	ChunkStore, Column, ColumnType, Engine, CHUNK_SIZE, ErrorKind, IndexType, LocalKeyManager, MemoryChunkStore,
	MemoryNameService, NameService, Options, QueryOption, Request, RequestType, Row, User, UserOptions, Value,
};

const SIGNING_KEY: &str = "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";
const USER: &str = "0x5e2b7c4a9d1f3e6b8a0c2d4f6e8a1b3c5d7e9f01";
const OWNER: &str = "wolk.eth";

#[derive(Debug, Clone, Copy)]
enum Keys {
	Int,
	Hex,
}

#[derive(Debug)]
enum Action {
	CreateDatabase(&'static str, bool),
	DropDatabase(&'static str),
	AssertDatabases(&'static [&'static str]),
	CreateTable(&'static str, &'static str, &'static [(&'static str, ColumnType, IndexType, bool)]),
	/// Writes rows `0..n` in random order, keyed by `i` or by its six digit hex.
	Fill(&'static str, &'static str, Keys, usize),
	Put(&'static str, &'static str, &'static str),
	StartBuffer(&'static str, &'static str),
	FlushBuffer(&'static str, &'static str),
	/// Closes the engine and opens the same files again.
	Reopen,
	AssertRow(&'static str, &'static str, &'static str, &'static str),
	AssertNone(&'static str, &'static str, &'static str),
	/// Ascending flag, row count, key of the first row.
	AssertScan(&'static str, &'static str, bool, usize, &'static str),
	/// Version of the row chunk; the birth time seen at version 0 must hold.
	AssertVersion(&'static str, &'static str, &'static str, u64),
	/// Query JSON and the exact rows it returns.
	Select(&'static str, &'static str, &'static str),
	/// Query JSON and the number of affected rows.
	Execute(&'static str, &'static str, usize),
	/// Query JSON and the name of the error kind it fails with.
	Fails(&'static str, &'static str, &'static str),
	/// Every chunk file holds the flag byte and exactly one chunk.
	AssertChunkFiles,
}

use Action::*;

fn options(temp: &TempDir) -> Options {
	Options::with(|o| {
		o.chunk_db_path = Some(temp.path().join("chunks"));
		o.ens_path = Some(temp.path().join("ens.json"));
		o.signing_key = Some(SIGNING_KEY.into());
		o.users = vec![UserOptions {
			address: USER.into(),
			passphrase: "correct horse".into(),
			..UserOptions::default()
		}];
	})
}

fn hex6(i: usize) -> String {
	format!("{:06x}", i)
}

fn json(s: &str) -> Value {
	serde_json::from_str(s).unwrap()
}

fn rows(s: &str) -> Vec<Row> {
	serde_json::from_str(s).unwrap()
}

fn request(request_type: RequestType, database: &str, table: &str) -> Request {
	Request::new(request_type, OWNER, database, table)
}

fn run_actions(test_name: &'static str, actions: &[Action]) {
	let temp = TempDir::new(test_name).unwrap();
	let mut engine = Engine::open(options(&temp)).unwrap();
	let user = engine.user(USER).unwrap();
	let mut births = HashMap::new();

	for action in actions {
		println!("action: {:?}", action);
		match *action {
			CreateDatabase(database, encrypted) => {
				let mut r = request(RequestType::CreateDatabase, database, "");
				r.encrypted = encrypted as u8;
				engine.handle(&user, &r).unwrap();
			},
			DropDatabase(database) => {
				assert_eq!(engine.handle(&user, &request(RequestType::DropDatabase, database, "")).unwrap().affected_row_count, 1);
			},
			AssertDatabases(expected) => {
				let listed = engine.handle(&user, &request(RequestType::ListDatabases, "", "")).unwrap();
				let names: Vec<Value> = listed.data.iter().map(|r| r.get("database").cloned().unwrap()).collect();
				assert_eq!(names, expected.iter().map(|&n| Value::from(n)).collect::<Vec<_>>());
			},
			CreateTable(database, table, columns) => {
				let mut r = request(RequestType::CreateTable, database, table);
				r.columns = columns.iter()
					.map(|&(name, column_type, index_type, primary)| Column::new(name, column_type, index_type, primary))
					.collect();
				engine.handle(&user, &r).unwrap();
			},
			Fill(database, table, keys, n) => {
				let mut order: Vec<usize> = (0..n).collect();
				order.shuffle(&mut thread_rng());
				for i in order {
					let key = match keys {
						Keys::Int => Value::Int(i as i64),
						Keys::Hex => Value::from(hex6(i)),
					};
					let mut r = request(RequestType::Put, database, table);
					r.rows = vec![Row::new().with(if let Keys::Int = keys { "id" } else { "k" }, key).with("v", format!("valueof{}", hex6(i)))];
					engine.handle(&user, &r).unwrap();
				}
			},
			Put(database, table, row) => {
				let mut r = request(RequestType::Put, database, table);
				r.rows = rows(&format!("[{}]", row));
				engine.handle(&user, &r).unwrap();
			},
			StartBuffer(database, table) => {
				engine.handle(&user, &request(RequestType::StartBuffer, database, table)).unwrap();
			},
			FlushBuffer(database, table) => {
				engine.handle(&user, &request(RequestType::FlushBuffer, database, table)).unwrap();
			},
			Reopen => {
				engine.close().unwrap();
				drop(engine);
				engine = Engine::open(options(&temp)).unwrap();
			},
			AssertRow(database, table, key, expected) => {
				let mut r = request(RequestType::Get, database, table);
				r.key = Some(json(key));
				let expected = engine.with_table(&user, OWNER, database, table, |t| {
					rows(&format!("[{}]", expected)).iter().map(|row| t.coerce_row(row)).collect::<chunkdb::Result<Vec<_>>>()
				}).unwrap();
				assert_eq!(engine.handle(&user, &r).unwrap().data, expected);
			},
			AssertNone(database, table, key) => {
				let mut r = request(RequestType::Get, database, table);
				r.key = Some(json(key));
				assert_eq!(engine.handle(&user, &r).unwrap().matched_row_count, 0);
			},
			AssertScan(database, table, ascending, count, first) => {
				let scanned = engine.with_table(&user, OWNER, database, table, |t| {
					let primary = t.primary_column().name.clone();
					t.scan(&primary, ascending)
				}).unwrap();
				assert_eq!(scanned.len(), count);
				let primary = engine.with_table(&user, OWNER, database, table, |t| Ok(t.primary_column().name.clone())).unwrap();
				assert_eq!(scanned[0].get(&primary), Some(&json(first)));
			},
			AssertVersion(database, table, key, version) => {
				let header = engine.with_table(&user, OWNER, database, table, |t| t.header(&json(key))).unwrap().unwrap();
				assert_eq!(header.version, version);
				assert!(header.last_update_ts >= header.birth_ts);
				let birth = *births.entry(key).or_insert(header.birth_ts);
				assert_eq!(header.birth_ts, birth);
			},
			Select(database, query, expected) => {
				let mut r = request(RequestType::Query, database, "");
				r.query = Some(serde_json::from_str::<QueryOption>(query).unwrap());
				assert_eq!(engine.handle(&user, &r).unwrap().data, rows(expected));
			},
			Execute(database, query, affected) => {
				let mut r = request(RequestType::Query, database, "");
				r.query = Some(serde_json::from_str::<QueryOption>(query).unwrap());
				assert_eq!(engine.handle(&user, &r).unwrap().affected_row_count, affected);
			},
			Fails(database, query, expected) => {
				let mut r = request(RequestType::Query, database, "");
				r.query = Some(serde_json::from_str::<QueryOption>(query).unwrap());
				let err = engine.handle(&user, &r).unwrap_err();
				let kind = format!("{:?}", err.kind());
				assert!(kind.starts_with(expected), "expected {}, got {}", expected, kind);
			},
			AssertChunkFiles => {
				let mut files = 0;
				for entry in fs::read_dir(temp.path().join("chunks")).unwrap() {
					let path = entry.unwrap().path();
					if path.file_name().map_or(false, |name| name == "LOCK") {
						continue;
					}
					assert_eq!(fs::metadata(&path).unwrap().len() as usize, CHUNK_SIZE + 1, "{}", path.display());
					files += 1;
				}
				assert!(files > 0);
			},
		}
	}
}

macro_rules! db_test {
	($name: tt, $($actions: expr),*) => {
		#[test]
		fn $name() {
			run_actions(stringify!($name), &[$($actions),*]);
		}
	}
}

const INT_TABLE: &[(&str, ColumnType, IndexType, bool)] = &[
	("id", ColumnType::Integer, IndexType::BPlusTree, true),
	("v", ColumnType::String, IndexType::None, false),
];

const HEX_TABLE: &[(&str, ColumnType, IndexType, bool)] = &[
	("k", ColumnType::String, IndexType::HashTrie, true),
	("v", ColumnType::String, IndexType::None, false),
];

const KV_TABLE: &[(&str, ColumnType, IndexType, bool)] = &[
	("key", ColumnType::String, IndexType::BPlusTree, true),
	("v", ColumnType::String, IndexType::HashTrie, false),
];

const TYPED_TABLE: &[(&str, ColumnType, IndexType, bool)] = &[
	("id", ColumnType::Integer, IndexType::BPlusTree, true),
	("f", ColumnType::Float, IndexType::BPlusTree, false),
	("b", ColumnType::Blob, IndexType::None, false),
];

db_test!(
	integer_b_plus_tree,
	CreateDatabase("db", false),
	CreateTable("db", "t1", INT_TABLE),
	Fill("db", "t1", Keys::Int, 20),
	AssertRow("db", "t1", "8", r#"{"id":8,"v":"valueof000008"}"#),
	AssertScan("db", "t1", false, 20, "19"),
	AssertScan("db", "t1", true, 20, "0"),
	Reopen,
	AssertRow("db", "t1", "8", r#"{"id":8,"v":"valueof000008"}"#),
	AssertScan("db", "t1", false, 20, "19")
);

db_test!(
	string_hash_trie,
	CreateDatabase("db", false),
	CreateTable("db", "t2", HEX_TABLE),
	Fill("db", "t2", Keys::Hex, 20),
	AssertRow("db", "t2", r#""000008""#, r#"{"k":"000008","v":"valueof000008"}"#),
	AssertNone("db", "t2", r#""000099""#),
	Select("db", r#"{"type":"Select","table":"t2","requestcolumns":["k"],"where":{"left":"k","operator":">=","right":"000013"}}"#,
		r#"[{"k":"000013"}]"#),
	Reopen,
	Execute("db", r#"{"type":"Select","table":"t2"}"#, 20)
);

db_test!(
	update_bumps_version,
	CreateDatabase("db", true),
	CreateTable("db", "kv", KV_TABLE),
	Put("db", "kv", r#"{"key":"42","v":"9f3bd7a5f1c1e9d2c4e7b1a5"}"#),
	AssertVersion("db", "kv", r#""42""#, 0),
	Put("db", "kv", r#"{"key":"42","v":"2d7e6c1f0a8b3e5d9c4f7a21"}"#),
	Reopen,
	AssertRow("db", "kv", r#""42""#, r#"{"key":"42","v":"2d7e6c1f0a8b3e5d9c4f7a21"}"#),
	AssertVersion("db", "kv", r#""42""#, 1)
);

db_test!(
	catalog_round_trip,
	CreateDatabase("videos", false),
	CreateDatabase("music", true),
	AssertDatabases(&["videos", "music"]),
	DropDatabase("videos"),
	AssertDatabases(&["music"]),
	Reopen,
	AssertDatabases(&["music"]),
	CreateDatabase("videos", false),
	AssertDatabases(&["videos", "music"])
);

db_test!(
	where_filter,
	CreateDatabase("db", false),
	CreateTable("db", "t", INT_TABLE),
	Fill("db", "t", Keys::Int, 20),
	Select("db", r#"{"type":"Select","table":"t","requestcolumns":["v"],"where":{"left":"id","operator":">=","right":"17"}}"#,
		r#"[{"v":"valueof000011"},{"v":"valueof000012"},{"v":"valueof000013"}]"#),
	Execute("db", r#"{"type":"Select","table":"t","requestcolumns":["v"],"where":{"left":"id","operator":">=","right":"10"}}"#, 10),
	Execute("db", r#"{"type":"Select","table":"t","where":{"left":"v","operator":"!=","right":"'valueof000003'"}}"#, 19),
	Execute("db", r#"{"type":"Delete","table":"t","where":{"left":"id","operator":"<","right":"5"}}"#, 5),
	Execute("db", r#"{"type":"Update","table":"t","update":{"v":"big"},"where":{"left":"id","operator":">","right":"15"}}"#, 4),
	AssertRow("db", "t", "19", r#"{"id":19,"v":"big"}"#),
	AssertNone("db", "t", "4"),
	AssertScan("db", "t", true, 15, "5")
);

db_test!(
	duplicate_insert,
	CreateDatabase("db", false),
	CreateTable("db", "t", INT_TABLE),
	Fill("db", "t", Keys::Int, 20),
	Fails("db", r#"{"type":"Insert","table":"t","inserts":[{"id":8,"v":"x"}]}"#, "AlreadyExists"),
	Select("db", r#"{"type":"Select","table":"t","requestcolumns":["v"],"where":{"left":"id","operator":"=","right":"8"}}"#,
		r#"[{"v":"valueof000008"}]"#),
	Fails("db", r#"{"type":"Delete","table":"t"}"#, "InvalidRequest"),
	Execute("db", r#"{"type":"Insert","table":"t","inserts":[{"id":20,"v":"x"}]}"#, 1),
	AssertRow("db", "t", "20", r#"{"id":20,"v":"x"}"#)
);

db_test!(
	buffered_writes_survive_reopen,
	CreateDatabase("db", false),
	CreateTable("db", "t", INT_TABLE),
	StartBuffer("db", "t"),
	Fill("db", "t", Keys::Int, 50),
	FlushBuffer("db", "t"),
	StartBuffer("db", "t"),
	Put("db", "t", r#"{"id":50,"v":"flushed on close"}"#),
	Reopen,
	AssertScan("db", "t", false, 51, "50"),
	AssertRow("db", "t", "50", r#"{"id":50,"v":"flushed on close"}"#)
);

db_test!(
	float_and_blob_cells,
	CreateDatabase("db", false),
	CreateTable("db", "t", TYPED_TABLE),
	Put("db", "t", r#"{"id":1,"f":1.5,"b":"0x0102"}"#),
	Put("db", "t", r#"{"id":2,"f":-2.25,"b":"0x0a0b"}"#),
	Put("db", "t", r#"{"id":3,"f":10.0,"b":"0xff"}"#),
	AssertRow("db", "t", "2", r#"{"id":2,"f":-2.25,"b":"0x0a0b"}"#),
	AssertScan("db", "t", false, 3, "3"),
	Select("db", r#"{"type":"Select","table":"t","requestcolumns":["id","f"],"where":{"left":"f","operator":">","right":"0"}}"#,
		r#"[{"id":1,"f":1.5},{"id":3,"f":10.0}]"#),
	Select("db", r#"{"type":"Select","table":"t","requestcolumns":["id"],"where":{"left":"b","operator":"=","right":"'0x0a0b'"}}"#,
		r#"[{"id":2}]"#),
	Reopen,
	AssertRow("db", "t", "3", r#"{"id":3,"f":10.0,"b":"0xff"}"#),
	Execute("db", r#"{"type":"Select","table":"t","where":{"left":"b","operator":"!=","right":"'0xff'"}}"#, 2)
);

db_test!(
	encrypted_database_keeps_chunks_whole,
	CreateDatabase("db", true),
	CreateTable("db", "t", TYPED_TABLE),
	CreateTable("db", "kv", KV_TABLE),
	StartBuffer("db", "t"),
	Put("db", "t", r#"{"id":1,"f":1.5,"b":"0x0102"}"#),
	Put("db", "t", r#"{"id":2,"f":-2.25,"b":"0x0a0b"}"#),
	Put("db", "kv", r#"{"key":"a","v":"x"}"#),
	Put("db", "kv", r#"{"key":"b","v":"y"}"#),
	Reopen,
	AssertChunkFiles,
	AssertRow("db", "t", "1", r#"{"id":1,"f":1.5,"b":"0x0102"}"#),
	AssertRow("db", "kv", r#""b""#, r#"{"key":"b","v":"y"}"#),
	AssertScan("db", "t", true, 2, "1")
);

fn shared_engine(store: &Arc<MemoryChunkStore>, ens: &Arc<MemoryNameService>, passphrase: &str) -> (Engine, User) {
	let keys = Arc::new(LocalKeyManager::from_hex(SIGNING_KEY).unwrap());
	let user = User::new(chunkdb::keymanager::parse_address(USER).unwrap());
	keys.add_user(&user.address, passphrase);
	let engine = Engine::new(Options::default(), store.clone(), ens.clone(), keys);
	(engine, user)
}

#[test]
fn encrypted_rows_need_the_right_keys() {
	let store = Arc::new(MemoryChunkStore::new());
	let ens = Arc::new(MemoryNameService::new());
	let (owner, user) = shared_engine(&store, &ens, "correct horse");
	owner.create_database(&user, OWNER, "secret", true).unwrap();
	owner.create_table(&user, OWNER, "secret", "t", &[
		Column::new("id", ColumnType::Integer, IndexType::BPlusTree, true),
		Column::new("v", ColumnType::String, IndexType::None, false),
	]).unwrap();
	owner.with_table(&user, OWNER, "secret", "t", |t| t.put(&Row::new().with("id", 1).with("v", "plaintext marker"))).unwrap();

	let fingerprint = owner.with_table(&user, OWNER, "secret", "t", |t| {
		let key = t.primary_key(&Value::Int(1))?;
		Ok(t.fingerprint(&key))
	}).unwrap();
	let stored = store.get(&fingerprint).unwrap().unwrap();
	assert!(!stored.data.windows(16).any(|w| w == &b"plaintext marker"[..]));

	let (stranger, _) = shared_engine(&store, &ens, "wrong horse");
	let err = stranger.with_table(&user, OWNER, "secret", "t", |t| t.get(&Value::Int(1))).unwrap_err();
	assert_matches!(*err.kind(), ErrorKind::Integrity(_));
}

#[test]
fn corrupted_row_header_is_detected() {
	let store = Arc::new(MemoryChunkStore::new());
	let ens = Arc::new(MemoryNameService::new());
	let (engine, user) = shared_engine(&store, &ens, "correct horse");
	engine.create_database(&user, OWNER, "db", false).unwrap();
	engine.create_table(&user, OWNER, "db", "t", &[Column::new("id", ColumnType::Integer, IndexType::HashTrie, true)]).unwrap();
	engine.with_table(&user, OWNER, "db", "t", |t| t.put(&Row::new().with("id", 7))).unwrap();

	let fingerprint = engine.with_table(&user, OWNER, "db", "t", |t| {
		let key = t.primary_key(&Value::Int(7))?;
		Ok(t.fingerprint(&key))
	}).unwrap();
	store.with_chunk_mut(&fingerprint, |chunk| chunk.data[300] ^= 1).unwrap();

	let err = engine.with_table(&user, OWNER, "db", "t", |t| t.get(&Value::Int(7))).unwrap_err();
	assert_matches!(*err.kind(), ErrorKind::Integrity(_));
}

#[test]
fn name_service_only_moves_forward_after_chunks_are_written() {
	let store = Arc::new(MemoryChunkStore::new());
	let ens = Arc::new(MemoryNameService::new());
	let (engine, user) = shared_engine(&store, &ens, "correct horse");
	engine.create_database(&user, OWNER, "db", false).unwrap();
	engine.create_table(&user, OWNER, "db", "t", &[Column::new("id", ColumnType::Integer, IndexType::BPlusTree, true)]).unwrap();
	for i in 1..40 {
		engine.with_table(&user, OWNER, "db", "t", |t| t.put(&Row::new().with("id", i))).unwrap();

		let root = ens.get_root_hash(b"wolk.eth|db|t").unwrap().unwrap();
		assert!(store.get(&root).unwrap().is_some());
	}
}
