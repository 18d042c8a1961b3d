//! A table database on top of a content-addressed chunk store.
//!
//! Everything is kept in 4096 byte chunks. The only mutable state is the
//! name service, which maps an owner to its directory chunk and a table to
//! its descriptor chunk.
//!
//! ```text
//!  name service
//!       |
//!  owner chunk ---> database chunk ---> table descriptor
//!                                        |        |
//!                                   b+ tree   hash trie    (one index per column)
//!                                        |        |
//!                                        +--------+
//!                                             |
//!                                         row chunks
//! ```
//!
//! Row chunks carry a signed header followed by the row as JSON:
//!
//! ```text
//!  sig  msg hash  payer  type .. birth  update  enc  version .. key  owner  database  table      payload
//!   /     /        /      /       /      /       /    /          /    /      /         /           /
//! |...|.......|......|.|...|.......|.......|.|.......|..|.......|.......|.......|.......|..|..............|
//!  0   65      97     129  132     140     148 149     157 158    190     222     254     286 512        4096
//! ```
//!
//! A row lives at its fingerprint `keccak256(owner ‖ database ‖ table ‖ key)`
//! so it can be found again without consulting an index. Every change to a
//! row, an index node or a directory writes new chunks bottom-up and then
//! republishes the root in the name service.

extern crate byteorder;
extern crate chacha20poly1305;
#[macro_use]
extern crate error_chain;
extern crate fs2;
extern crate hex;
extern crate k256;
extern crate parking_lot;
extern crate rand;
extern crate rayon;
extern crate serde;
#[macro_use]
extern crate serde_derive;
extern crate serde_json;
extern crate tiny_keccak;
#[macro_use]
extern crate tracing;
extern crate x25519_dalek;

#[cfg(test)]
#[macro_use]
extern crate matches;

pub mod bplus;
pub mod catalog;
pub mod chunk;
pub mod engine;
pub mod ens;
pub mod error;
pub mod hash;
pub mod hashdb;
pub mod index;
pub mod key;
pub mod keymanager;
pub mod options;
pub mod query;
pub mod row;
pub mod store;
pub mod table;

pub use bplus::BPlusTree;
pub use catalog::{Catalog, Column, TableDescriptor};
pub use chunk::{ChunkCodec, ChunkHeader, ChunkType, CHUNK_SIZE};
pub use engine::{Engine, Request, RequestType, Response};
pub use ens::{FileNameService, MemoryNameService, NameService};
pub use error::{Error, ErrorKind, Result};
pub use hash::{Address, Hash, ZERO_HASH};
pub use hashdb::HashDb;
pub use index::{Cursor, Index, KeyIndex};
pub use key::{ColumnType, IndexType, Key};
pub use keymanager::{KeyManager, LocalKeyManager};
pub use options::{Options, User, UserOptions};
pub use query::{Operator, QueryOption, QueryParser, QueryResult, QueryType, Where};
pub use row::{Row, Value};
pub use store::{ChunkStore, FileChunkStore, MemoryChunkStore};
pub use table::Table;
