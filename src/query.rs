//! Pre-parsed queries and their execution against an open table.
//!
//! SQL text is turned into a [`QueryOption`] by a [`QueryParser`] supplied
//! by the embedder. Filters always run over a primary index scan, except
//! for `SELECT .. WHERE primary = literal` which is a single lookup.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use error::{Error, ErrorKind, Result};
use row::{Row, Value};
use table::Table;

/// Turns query text into a [`QueryOption`].
pub trait QueryParser: Send + Sync {
	fn parse(&self, raw: &str) -> Result<QueryOption>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryType {
	Select,
	Insert,
	Update,
	Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
	Eq,
	Ne,
	Lt,
	Le,
	Gt,
	Ge,
}

impl Operator {
	pub fn symbol(&self) -> &'static str {
		match *self {
			Operator::Eq => "=",
			Operator::Ne => "!=",
			Operator::Lt => "<",
			Operator::Le => "<=",
			Operator::Gt => ">",
			Operator::Ge => ">=",
		}
	}

	fn holds(&self, ordering: Ordering) -> bool {
		match *self {
			Operator::Eq => ordering == Ordering::Equal,
			Operator::Ne => ordering != Ordering::Equal,
			Operator::Lt => ordering == Ordering::Less,
			Operator::Le => ordering != Ordering::Greater,
			Operator::Gt => ordering == Ordering::Greater,
			Operator::Ge => ordering != Ordering::Less,
		}
	}
}

impl FromStr for Operator {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self> {
		let op = match s.trim() {
			"=" | "==" => Operator::Eq,
			"!=" | "<>" => Operator::Ne,
			"<" => Operator::Lt,
			"<=" => Operator::Le,
			">" => Operator::Gt,
			">=" => Operator::Ge,
			other => bail!(ErrorKind::InvalidRequest(format!("unsupported operator {:?}", other))),
		};
		Ok(op)
	}
}

impl fmt::Display for Operator {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str(self.symbol())
	}
}

impl Serialize for Operator {
	fn serialize<S: Serializer>(&self, serializer: S) -> ::std::result::Result<S::Ok, S::Error> {
		serializer.serialize_str(self.symbol())
	}
}

impl<'de> Deserialize<'de> for Operator {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> ::std::result::Result<Self, D::Error> {
		let s = String::deserialize(deserializer)?;
		s.parse().map_err(|e: Error| D::Error::custom(e.to_string()))
	}
}

/// `left op right` with `right` in its textual form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Where {
	#[serde(alias = "Left")]
	pub left: String,
	#[serde(rename = "operator", alias = "Operator")]
	pub op: Operator,
	#[serde(alias = "Right")]
	pub right: String,
}

impl Where {
	pub fn new<L: Into<String>, R: Into<String>>(left: L, op: Operator, right: R) -> Self {
		Where { left: left.into(), op, right: right.into() }
	}

	/// Resolves the column and types the literal.
	pub fn compile(&self, table: &Table) -> Result<Predicate> {
		let column = table.column(&self.left)
			.ok_or_else(|| ErrorKind::InvalidRequest(format!("where clause names unknown column {}", self.left)))?;
		Ok(Predicate {
			column: self.left.clone(),
			op: self.op,
			value: Value::parse_literal(&self.right, column.column_type)?,
		})
	}
}

/// A typed `Where`.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
	pub column: String,
	pub op: Operator,
	pub value: Value,
}

impl Predicate {
	/// Rows without the column, or with an incomparable cell, never match.
	pub fn matches(&self, row: &Row) -> bool {
		row.get(&self.column)
			.and_then(|cell| cell.compare(&self.value))
			.map_or(false, |ordering| self.op.holds(ordering))
	}
}

fn ascending_default() -> bool {
	true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryOption {
	#[serde(rename = "type", alias = "Type")]
	pub query_type: QueryType,
	#[serde(default, alias = "Table")]
	pub table: String,
	#[serde(default, rename = "requestcolumns", alias = "RequestColumns")]
	pub request_columns: Vec<String>,
	#[serde(default, alias = "Inserts")]
	pub inserts: Vec<Row>,
	#[serde(default, alias = "Update")]
	pub update: BTreeMap<String, Value>,
	#[serde(default, rename = "where", alias = "Where")]
	pub where_clause: Option<Where>,
	#[serde(default = "ascending_default", alias = "Ascending")]
	pub ascending: bool,
}

impl QueryOption {
	pub fn new(query_type: QueryType) -> Self {
		QueryOption {
			query_type,
			table: String::new(),
			request_columns: Vec::new(),
			inserts: Vec::new(),
			update: BTreeMap::new(),
			where_clause: None,
			ascending: true,
		}
	}

	pub fn select(table: &str, columns: &[&str], where_clause: Option<Where>) -> Self {
		QueryOption {
			table: table.to_owned(),
			request_columns: columns.iter().map(|c| c.to_string()).collect(),
			where_clause,
			..QueryOption::new(QueryType::Select)
		}
	}

	pub fn insert(table: &str, rows: Vec<Row>) -> Self {
		QueryOption {
			table: table.to_owned(),
			inserts: rows,
			..QueryOption::new(QueryType::Insert)
		}
	}

	pub fn update(table: &str, set: Row, where_clause: Where) -> Self {
		QueryOption {
			table: table.to_owned(),
			update: set.into_iter().collect(),
			where_clause: Some(where_clause),
			..QueryOption::new(QueryType::Update)
		}
	}

	pub fn delete(table: &str, where_clause: Where) -> Self {
		QueryOption {
			table: table.to_owned(),
			where_clause: Some(where_clause),
			..QueryOption::new(QueryType::Delete)
		}
	}
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct QueryResult {
	pub rows: Vec<Row>,
	pub affected: usize,
}

/// Runs `query` against `table`.
pub fn execute(table: &mut Table, query: &QueryOption) -> Result<QueryResult> {
	for column in &query.request_columns {
		if table.column(column).is_none() {
			bail!(ErrorKind::InvalidRequest(format!("requested column {} is not in table {}", column, table.name())));
		}
	}
	let predicate = match query.where_clause {
		Some(ref w) => Some(w.compile(table)?),
		None => None,
	};

	match query.query_type {
		QueryType::Select => select(table, query, predicate.as_ref()),
		QueryType::Insert => insert(table, query),
		QueryType::Update => match predicate {
			Some(ref predicate) => update(table, query, predicate),
			None => bail!(ErrorKind::InvalidRequest("UPDATE needs a where clause".into())),
		},
		QueryType::Delete => match predicate {
			Some(ref predicate) => delete(table, query, predicate),
			None => bail!(ErrorKind::InvalidRequest("DELETE needs a where clause".into())),
		},
	}
}

/// Rows matching `predicate`, in scan order.
fn matching(table: &mut Table, predicate: Option<&Predicate>, ascending: bool) -> Result<Vec<Row>> {
	let primary = table.primary_column().name.clone();
	let rows = table.scan(&primary, ascending)?;
	Ok(match predicate {
		Some(predicate) => rows.into_iter().filter(|row| predicate.matches(row)).collect(),
		None => rows,
	})
}

fn select(table: &mut Table, query: &QueryOption, predicate: Option<&Predicate>) -> Result<QueryResult> {
	let point = predicate
		.filter(|p| p.op == Operator::Eq && p.column == table.primary_column().name)
		.map(|p| p.value.clone());
	let rows: Vec<Row> = match point {
		Some(key) => table.get(&key)?.into_iter().collect(),
		None => matching(table, predicate, query.ascending)?,
	};

	let rows: Vec<Row> = rows.iter()
		.map(|row| row.project(&query.request_columns))
		.filter(|row| !row.is_empty())
		.collect();
	debug!(table = %table.key(), rows = rows.len(), "select");
	Ok(QueryResult { affected: rows.len(), rows })
}

fn insert(table: &mut Table, query: &QueryOption) -> Result<QueryResult> {
	let primary = table.primary_column().name.clone();
	let mut seen = HashSet::new();
	for row in &query.inserts {
		let value = row.get(&primary)
			.ok_or_else(|| ErrorKind::InvalidRequest(format!("insert row needs primary column {}", primary)))?;
		let key = table.primary_key(value)?;
		if !seen.insert(key) || table.get(value)?.is_some() {
			bail!(ErrorKind::AlreadyExists(format!("row with {} = {}", primary, value)));
		}
	}

	for row in &query.inserts {
		table.put(row)?;
	}
	debug!(table = %table.key(), rows = query.inserts.len(), "insert");
	Ok(QueryResult { rows: Vec::new(), affected: query.inserts.len() })
}

fn update(table: &mut Table, query: &QueryOption, predicate: &Predicate) -> Result<QueryResult> {
	let primary = table.primary_column().name.clone();
	for column in query.update.keys() {
		if table.column(column).is_none() {
			bail!(ErrorKind::InvalidRequest(format!("SET names unknown column {}", column)));
		}
		if *column == primary {
			bail!(ErrorKind::InvalidRequest(format!("SET cannot change primary column {}", primary)));
		}
	}

	let rows = matching(table, Some(predicate), query.ascending)?;
	for row in &rows {
		let mut changed = row.clone();
		for (column, value) in &query.update {
			changed.insert(column.clone(), value.clone());
		}
		table.put(&changed)?;
	}
	debug!(table = %table.key(), rows = rows.len(), "update");
	Ok(QueryResult { rows: Vec::new(), affected: rows.len() })
}

fn delete(table: &mut Table, query: &QueryOption, predicate: &Predicate) -> Result<QueryResult> {
	let primary = table.primary_column().name.clone();
	let rows = matching(table, Some(predicate), query.ascending)?;
	let mut affected = 0;
	for row in &rows {
		if let Some(key) = row.get(&primary) {
			if table.delete(key)? {
				affected += 1;
			}
		}
	}
	debug!(table = %table.key(), rows = affected, "delete");
	Ok(QueryResult { rows: Vec::new(), affected })
}
