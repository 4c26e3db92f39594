//! Entry tree: the contract type shared by scan, reconcile, transition, and
//! the wire protocol (spec §6 "Entry … contract types from the
//! filesystem-sync primitive; the core treats them as opaque but validates
//! them when they cross the wire").
//!
//! The algorithms that *produce* entry trees (scanning a directory, walking
//! a reconstructed snapshot) live outside this crate's scope; this module
//! only defines the shape and the validation the core is required to run.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One node of a synchronization snapshot or ancestor tree.
///
/// Directory contents use a `BTreeMap` so that serialization (and thus the
/// deterministic byte-stable encoding spec §6 requires) is always in sorted
/// key order, independent of insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Entry {
	Directory { contents: BTreeMap<String, Entry> },
	File { executable: bool, digest: Vec<u8> },
	Symlink { target: String },
}

/// Single-field wrapper used wherever a nullable `Entry` must appear inside
/// a sequence (spec §4.4 transition-response, §6 `Archive`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Archive {
	pub root: Option<Entry>,
}

/// Errors produced by [`Entry::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryValidationError(pub String);

impl std::fmt::Display for EntryValidationError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "invalid entry: {}", self.0)
	}
}

impl std::error::Error for EntryValidationError {}

impl Entry {
	/// Validate structural invariants: directory entry names are non-empty
	/// and contain no path separator, file digests are non-empty, symlink
	/// targets are non-empty. Applied recursively (spec §3 invariant "the
	/// ancestor on disk is always a validated tree").
	pub fn validate(&self) -> Result<(), EntryValidationError> {
		match self {
			Entry::Directory { contents } => {
				for (name, child) in contents {
					if name.is_empty() || name.contains('/') || name == "." || name == ".." {
						return Err(EntryValidationError(format!("invalid entry name {name:?}")));
					}
					child.validate()?;
				}
				Ok(())
			}
			Entry::File { digest, .. } => {
				if digest.is_empty() {
					return Err(EntryValidationError("file entry has empty digest".into()));
				}
				Ok(())
			}
			Entry::Symlink { target } => {
				if target.is_empty() {
					return Err(EntryValidationError("symlink entry has empty target".into()));
				}
				Ok(())
			}
		}
	}

	/// Total count of entries in this tree, including `self`. Used against
	/// `Configuration::max_entry_count`.
	pub fn count(&self) -> u64 {
		match self {
			Entry::Directory { contents } => {
				1 + contents.values().map(Entry::count).sum::<u64>()
			}
			_ => 1,
		}
	}

	/// True iff this entry is a directory.
	pub fn is_directory(&self) -> bool {
		matches!(self, Entry::Directory { .. })
	}

	/// Look up a slash-separated relative path within this tree. An empty
	/// path resolves to `self`.
	pub fn get(&self, path: &str) -> Option<&Entry> {
		if path.is_empty() {
			return Some(self);
		}
		let mut current = self;
		for component in path.split('/') {
			match current {
				Entry::Directory { contents } => current = contents.get(component)?,
				_ => return None,
			}
		}
		Some(current)
	}

	/// Deterministic byte-stable encoding used to compute wire signatures
	/// (spec §4.4 scan protocol) and for on-disk ancestor persistence
	/// (spec §6). `BTreeMap` iteration order makes this stable across
	/// processes and versions of this crate.
	pub fn encode_deterministic(&self) -> Vec<u8> {
		serde_json::to_vec(self).expect("Entry serialization is infallible")
	}

	pub fn decode_deterministic(bytes: &[u8]) -> Result<Entry, serde_json::Error> {
		serde_json::from_slice(bytes)
	}
}

/// An empty directory, the canonical representation of "nothing here" used
/// for freshly created sessions' ancestor archive (spec §3).
pub fn empty_directory() -> Entry {
	Entry::Directory { contents: BTreeMap::new() }
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn validate_rejects_empty_child_name() {
		let mut contents = BTreeMap::new();
		contents.insert(String::new(), Entry::Symlink { target: "x".into() });
		let tree = Entry::Directory { contents };
		assert!(tree.validate().is_err());
	}

	#[test]
	fn validate_rejects_empty_digest() {
		let entry = Entry::File { executable: false, digest: vec![] };
		assert!(entry.validate().is_err());
	}

	#[test]
	fn count_counts_all_nodes() {
		let mut contents = BTreeMap::new();
		contents.insert("a".to_string(), Entry::File { executable: false, digest: vec![1] });
		contents.insert("b".to_string(), Entry::Directory { contents: BTreeMap::new() });
		let tree = Entry::Directory { contents };
		assert_eq!(tree.count(), 3);
	}

	#[test]
	fn encode_decode_round_trips() {
		let mut contents = BTreeMap::new();
		contents.insert("f".to_string(), Entry::File { executable: true, digest: vec![9, 9] });
		let tree = Entry::Directory { contents };
		let encoded = tree.encode_deterministic();
		let decoded = Entry::decode_deterministic(&encoded).unwrap();
		assert_eq!(tree, decoded);
	}

	#[test]
	fn get_resolves_nested_path() {
		let mut inner = BTreeMap::new();
		inner.insert("file.txt".to_string(), Entry::File { executable: false, digest: vec![1] });
		let mut contents = BTreeMap::new();
		contents.insert("dir".to_string(), Entry::Directory { contents: inner });
		let tree = Entry::Directory { contents };
		assert!(tree.get("dir/file.txt").is_some());
		assert!(tree.get("dir/missing").is_none());
	}
}

// vim: ts=4
