use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use hex;
use serde_json;

use error::{ErrorKind, Result};
use hash::Address;
use keymanager::parse_address;

/// Replication and renewal policy recorded in the headers of the chunks
/// a user pays for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserOptions {
	/// Hex encoded 20 byte address.
	pub address: String,
	/// Seed for the user's encryption keypair.
	pub passphrase: String,
	pub min_replication: u8,
	pub max_replication: u8,
	pub auto_renew: u8,
}

impl Default for UserOptions {
	fn default() -> Self {
		UserOptions {
			address: String::new(),
			passphrase: String::new(),
			min_replication: 3,
			max_replication: 5,
			auto_renew: 1,
		}
	}
}

/// The caller on whose behalf chunks are written and sealed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct User {
	pub address: Address,
	pub min_replication: u8,
	pub max_replication: u8,
	pub auto_renew: u8,
}

impl User {
	/// A user with the default replication policy.
	pub fn new(address: Address) -> Self {
		let defaults = UserOptions::default();
		User {
			address,
			min_replication: defaults.min_replication,
			max_replication: defaults.max_replication,
			auto_renew: defaults.auto_renew,
		}
	}

	pub fn from_options(options: &UserOptions) -> Result<Self> {
		Ok(User {
			address: parse_address(&options.address)?,
			min_replication: options.min_replication,
			max_replication: options.max_replication,
			auto_renew: options.auto_renew,
		})
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
	/// Directory of the file backed chunk store. In-memory when unset.
	pub chunk_db_path: Option<PathBuf>,
	/// JSON mirror of the name service. In-memory when unset.
	pub ens_path: Option<PathBuf>,
	/// Hex encoded secp256k1 secret used to sign chunk headers.
	/// A random key is generated when unset.
	pub signing_key: Option<String>,
	pub users: Vec<UserOptions>,
	/// Open tables with the write buffer already started.
	pub buffered: bool,
}

impl Default for Options {
	fn default() -> Self {
		Options {
			chunk_db_path: None,
			ens_path: None,
			signing_key: None,
			users: Vec::new(),
			buffered: false,
		}
	}
}

impl Options {
	pub fn with<F>(f: F) -> Self where
		F: FnOnce(&mut Self),
	{
		let mut options = Options::default();
		f(&mut options);
		options
	}

	/// Reads options from a JSON file.
	pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
		let data = fs::read(path)?;
		let options: Options = serde_json::from_slice(&data)?;
		options.validate()?;
		Ok(options)
	}

	/// Writes options as pretty printed JSON.
	pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
		let data = serde_json::to_vec_pretty(self)?;
		let mut file = fs::File::create(path)?;
		file.write_all(&data)?;
		file.flush()?;
		Ok(())
	}

	pub fn validate(&self) -> Result<()> {
		if let Some(ref key) = self.signing_key {
			let raw = hex::decode(key.trim_start_matches("0x"))
				.map_err(|e| ErrorKind::InvalidRequest(format!("signing_key: {}", e)))?;
			if raw.len() != 32 {
				bail!(ErrorKind::InvalidRequest(format!("signing_key must be 32 bytes, got {}", raw.len())));
			}
		}

		for user in &self.users {
			if user.min_replication > user.max_replication {
				bail!(ErrorKind::InvalidRequest(format!(
					"user {}: min_replication {} exceeds max_replication {}",
					user.address, user.min_replication, user.max_replication
				)));
			}
			parse_address(&user.address)?;
		}

		Ok(())
	}

	/// Looks up the configured policy for `address`.
	pub fn user(&self, address: &str) -> Option<&UserOptions> {
		let address = address.trim_start_matches("0x");
		self.users.iter().find(|u| u.address.trim_start_matches("0x").eq_ignore_ascii_case(address))
	}
}
