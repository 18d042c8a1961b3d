extern crate chunkdb;
extern crate clap;
extern crate serde;
extern crate serde_json;
extern crate tracing_subscriber;

use std::process;

use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use chunkdb::{Column, ColumnType, Engine, Error, ErrorKind, IndexType, Options, Request, RequestType, Response, Result, Row, User, Value};
use tracing_subscriber::EnvFilter;

fn database_arg() -> Arg<'static, 'static> {
	Arg::with_name("DATABASE").required(true).help("Database name")
}

fn table_arg() -> Arg<'static, 'static> {
	Arg::with_name("TABLE").required(true).help("Table name")
}

fn options(matches: &ArgMatches) -> Result<Options> {
	let mut options = match matches.value_of("config") {
		Some(path) => Options::load(path)?,
		None => Options::default(),
	};
	if let Some(dir) = matches.value_of("data-dir") {
		let dir = std::path::Path::new(dir);
		options.chunk_db_path = Some(dir.join("chunks"));
		options.ens_path = Some(dir.join("ens.json"));
	}
	if matches.is_present("buffered") {
		options.buffered = true;
	}
	Ok(options)
}

/// `name:type:index[:primary]`, e.g. `id:integer:bplustree:primary`.
fn parse_column(spec: &str) -> Result<Column> {
	let parts: Vec<&str> = spec.split(':').collect();
	if parts.len() < 3 || parts.len() > 4 {
		return Err(ErrorKind::InvalidRequest(format!("column {} is not name:type:index[:primary]", spec)).into());
	}
	let column_type = ColumnType::from_name(parts[1])
		.ok_or_else(|| ErrorKind::InvalidRequest(format!("unknown column type {}", parts[1])))?;
	let index_type = IndexType::from_name(parts[2])
		.ok_or_else(|| ErrorKind::InvalidRequest(format!("unknown index type {}", parts[2])))?;
	Ok(Column::new(parts[0], column_type, index_type, parts.get(3) == Some(&"primary")))
}

fn parse_json<T: serde::de::DeserializeOwned>(what: &str, json: &str) -> Result<T> {
	serde_json::from_str(json)
		.map_err(|e| ErrorKind::InvalidRequest(format!("cannot parse {}: {}", what, e)).into())
}

fn request(matches: &ArgMatches, owner: &str, request_type: RequestType) -> Request {
	Request::new(
		request_type,
		owner,
		matches.value_of("DATABASE").unwrap_or(""),
		matches.value_of("TABLE").unwrap_or(""),
	)
}

fn run(engine: &Engine, user: &User, owner: &str, matches: &ArgMatches) -> Result<Option<Response>> {
	let response = match matches.subcommand() {
		("create-database", Some(sub)) => {
			let mut r = request(sub, owner, RequestType::CreateDatabase);
			r.encrypted = sub.is_present("encrypted") as u8;
			engine.handle(user, &r)?
		},
		("drop-database", Some(sub)) => engine.handle(user, &request(sub, owner, RequestType::DropDatabase))?,
		("list-databases", Some(sub)) => engine.handle(user, &request(sub, owner, RequestType::ListDatabases))?,
		("list-tables", Some(sub)) => engine.handle(user, &request(sub, owner, RequestType::ListTables))?,
		("create-table", Some(sub)) => {
			let mut r = request(sub, owner, RequestType::CreateTable);
			r.columns = sub.values_of("column").into_iter().flat_map(|v| v).map(parse_column).collect::<Result<_>>()?;
			engine.handle(user, &r)?
		},
		("drop-table", Some(sub)) => engine.handle(user, &request(sub, owner, RequestType::DropTable))?,
		("describe-table", Some(sub)) => engine.handle(user, &request(sub, owner, RequestType::DescribeTable))?,
		("put", Some(sub)) => {
			let mut r = request(sub, owner, RequestType::Put);
			r.rows = sub.values_of("ROW").into_iter().flat_map(|v| v).map(|row| parse_json::<Row>("row", row)).collect::<Result<_>>()?;
			engine.handle(user, &r)?
		},
		("get", Some(sub)) | ("delete", Some(sub)) => {
			let request_type = if matches.subcommand_name() == Some("get") { RequestType::Get } else { RequestType::Delete };
			let mut r = request(sub, owner, request_type);
			r.key = Some(parse_json::<Value>("key", sub.value_of("KEY").unwrap_or(""))?);
			engine.handle(user, &r)?
		},
		("scan", Some(sub)) => engine.handle(user, &request(sub, owner, RequestType::Scan))?,
		("request", Some(sub)) => engine.handle_json(user, sub.value_of("JSON").unwrap_or(""))?,
		("dump", Some(sub)) => {
			let database = sub.value_of("DATABASE").unwrap_or("");
			let table = sub.value_of("TABLE").unwrap_or("");
			let dump = engine.with_table(user, owner, database, table, |t| Ok(t.print()))?;
			print!("{}", dump);
			return Ok(None);
		},
		_ => return Ok(None),
	};
	Ok(Some(response))
}

fn report(error: &Error) -> ! {
	eprintln!("error: {}", error);
	for cause in error.iter().skip(1) {
		eprintln!("caused by: {}", cause);
	}
	process::exit(1);
}

fn main() {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
		.with_writer(std::io::stderr)
		.init();

	let key_arg = Arg::with_name("KEY").required(true).help("Primary key as JSON, e.g. 42 or '\"abc\"'");
	let matches =
		App::new("chunkdb-cli")
			.version("0.1.0")
			.about("A command line interface for chunkdb")
			.setting(AppSettings::SubcommandRequiredElseHelp)
			.arg(Arg::with_name("config")
				.short("c")
				.long("config")
				.takes_value(true)
				.global(true)
				.help("Options file (JSON)"))
			.arg(Arg::with_name("data-dir")
				.short("d")
				.long("data-dir")
				.takes_value(true)
				.global(true)
				.help("Keeps chunks and name service records under this directory"))
			.arg(Arg::with_name("owner")
				.short("o")
				.long("owner")
				.takes_value(true)
				.global(true)
				.default_value("owner.eth"))
			.arg(Arg::with_name("user")
				.short("u")
				.long("user")
				.takes_value(true)
				.global(true)
				.help("Acting user address, defaults to the first configured user"))
			.arg(Arg::with_name("buffered")
				.long("buffered")
				.global(true)
				.help("Buffers index writes until the engine closes"))
			.subcommand(SubCommand::with_name("create-database")
				.about("Create a database")
				.arg(database_arg())
				.arg(Arg::with_name("encrypted").long("encrypted").help("Encrypt every chunk of the database")))
			.subcommand(SubCommand::with_name("drop-database")
				.about("Drop a database")
				.arg(database_arg()))
			.subcommand(SubCommand::with_name("list-databases")
				.about("List the owner's databases"))
			.subcommand(SubCommand::with_name("list-tables")
				.about("List the tables of a database")
				.arg(database_arg()))
			.subcommand(SubCommand::with_name("create-table")
				.about("Create a table")
				.arg(database_arg())
				.arg(table_arg())
				.arg(Arg::with_name("column")
					.long("column")
					.takes_value(true)
					.multiple(true)
					.number_of_values(1)
					.required(true)
					.help("name:type:index[:primary]")))
			.subcommand(SubCommand::with_name("drop-table")
				.about("Drop a table")
				.arg(database_arg())
				.arg(table_arg()))
			.subcommand(SubCommand::with_name("describe-table")
				.about("Show the columns of a table")
				.arg(database_arg())
				.arg(table_arg()))
			.subcommand(SubCommand::with_name("put")
				.about("Write rows")
				.arg(database_arg())
				.arg(table_arg())
				.arg(Arg::with_name("ROW").required(true).multiple(true).help("Row as a JSON object")))
			.subcommand(SubCommand::with_name("get")
				.about("Read a row by primary key")
				.arg(database_arg())
				.arg(table_arg())
				.arg(key_arg.clone()))
			.subcommand(SubCommand::with_name("delete")
				.about("Delete a row by primary key")
				.arg(database_arg())
				.arg(table_arg())
				.arg(key_arg))
			.subcommand(SubCommand::with_name("scan")
				.about("Read every row in primary key order")
				.arg(database_arg())
				.arg(table_arg()))
			.subcommand(SubCommand::with_name("request")
				.about("Handle a JSON request envelope")
				.arg(Arg::with_name("JSON").required(true)))
			.subcommand(SubCommand::with_name("dump")
				.about("Print the index structure of a table")
				.arg(database_arg())
				.arg(table_arg()))
			.get_matches();

	let engine = match options(&matches).and_then(Engine::open) {
		Ok(engine) => engine,
		Err(e) => report(&e),
	};
	let user = match matches.value_of("user") {
		Some(address) => engine.user(address),
		None => engine.default_user(),
	};
	let user = match user {
		Ok(user) => user,
		Err(e) => report(&e),
	};
	let owner = matches.value_of("owner").unwrap_or("owner.eth");

	match run(&engine, &user, owner, &matches) {
		Ok(Some(response)) => match serde_json::to_string_pretty(&response) {
			Ok(json) => println!("{}", json),
			Err(e) => eprintln!("error: cannot render response: {}", e),
		},
		Ok(None) => (),
		Err(e) => report(&e),
	}
	if let Err(e) = engine.close() {
		report(&e);
	}
}
