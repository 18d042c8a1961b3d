#![allow(unknown_lints)]
#![allow(missing_docs)]

use std::io;
use std::path::PathBuf;

use serde_json;

error_chain! {
	foreign_links {
		Io(io::Error);
		Json(serde_json::Error);
	}

	errors {
		NotFound(what: String) {
			description("not found"),
			display("not found: {}", what),
		}
		AlreadyExists(what: String) {
			description("already exists"),
			display("already exists: {}", what),
		}
		InvalidRequest(what: String) {
			description("invalid request"),
			display("invalid request: {}", what),
		}
		Schema(what: String) {
			description("schema error"),
			display("schema error: {}", what),
		}
		Size(what: String) {
			description("size limit exceeded"),
			display("size limit exceeded: {}", what),
		}
		Type(what: String) {
			description("type mismatch"),
			display("type mismatch: {}", what),
		}
		Integrity(what: String) {
			description("integrity check failed"),
			display("integrity check failed: {}", what),
		}
		Backend(what: String) {
			description("backend failure"),
			display("backend failure: {}", what),
		}
		StoreLocked(path: PathBuf) {
			description("chunk store is locked by another process"),
			display("chunk store is locked: {}", path.display()),
		}
	}
}

impl ErrorKind {
	/// `true` for the kinds the engine reports as structured results
	/// rather than failures of the storage fabric.
	pub fn is_structured(&self) -> bool {
		match *self {
			ErrorKind::NotFound(_) | ErrorKind::AlreadyExists(_) => true,
			_ => false,
		}
	}
}
