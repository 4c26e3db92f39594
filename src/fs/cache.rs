//! Per-endpoint scan-acceleration cache (spec §3 "Endpoint cache", §6
//! `caches/<session-id>_<alpha|beta>`).
//!
//! Backed by `redb`, following the teacher's `cache.rs` almost exactly:
//! one table keyed by relative path, bincode-encoded values, mtime-based
//! validity. The cache is treated as opaque by the rest of the core
//! (spec's wording); only the scan primitive in this module family reads
//! or writes individual entries.

use redb::{ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Result, SyncError};

/// One cached entry's scan-relevant metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
	pub mtime_seconds: i64,
	pub mtime_nanos: u32,
	pub size: u64,
	pub mode: u32,
	pub digest: Vec<u8>,
}

const ENTRIES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("entries");

/// Opaque scan cache for one endpoint of one session.
pub struct Cache {
	db: redb::Database,
}

impl Cache {
	/// Open (or create) the cache database at `path`. A decode or schema
	/// failure on an existing file is not surfaced here as a hard error;
	/// callers that need the "replaced with an empty instance on decode or
	/// validation failure" behavior (spec §3) should catch the error from
	/// `open` and fall back to [`Cache::create_empty`].
	pub fn open(path: &Path) -> Result<Self> {
		let db = redb::Database::create(path)
			.map_err(|e| SyncError::Persistence { what: "endpoint cache", source: Box::new(e) })?;
		{
			let write_txn = db
				.begin_write()
				.map_err(|e| SyncError::Persistence { what: "endpoint cache", source: Box::new(e) })?;
			write_txn
				.open_table(ENTRIES_TABLE)
				.map_err(|e| SyncError::Persistence { what: "endpoint cache", source: Box::new(e) })?;
			write_txn
				.commit()
				.map_err(|e| SyncError::Persistence { what: "endpoint cache", source: Box::new(e) })?;
		}
		Ok(Cache { db })
	}

	/// Open `path`, falling back to a fresh empty cache at the same path on
	/// any failure (spec §3: "Validated on load; replaced with an empty
	/// instance on decode or validation failure").
	pub fn open_or_empty(path: &Path) -> Result<Self> {
		match Self::open(path) {
			Ok(cache) => Ok(cache),
			Err(_) => {
				let _ = std::fs::remove_file(path);
				Self::open(path)
			}
		}
	}

	pub fn get(&self, relative_path: &str) -> Result<Option<CacheEntry>> {
		let read_txn = self
			.db
			.begin_read()
			.map_err(|e| SyncError::Persistence { what: "endpoint cache", source: Box::new(e) })?;
		let table = read_txn
			.open_table(ENTRIES_TABLE)
			.map_err(|e| SyncError::Persistence { what: "endpoint cache", source: Box::new(e) })?;
		match table
			.get(relative_path)
			.map_err(|e| SyncError::Persistence { what: "endpoint cache", source: Box::new(e) })?
		{
			Some(value) => {
				let entry: CacheEntry = bincode::deserialize(value.value())
					.map_err(|e| SyncError::Persistence { what: "endpoint cache", source: Box::new(e) })?;
				Ok(Some(entry))
			}
			None => Ok(None),
		}
	}

	pub fn set(&self, relative_path: &str, entry: &CacheEntry) -> Result<()> {
		let bytes = bincode::serialize(entry)
			.map_err(|e| SyncError::Persistence { what: "endpoint cache", source: Box::new(e) })?;
		let write_txn = self
			.db
			.begin_write()
			.map_err(|e| SyncError::Persistence { what: "endpoint cache", source: Box::new(e) })?;
		{
			let mut table = write_txn
				.open_table(ENTRIES_TABLE)
				.map_err(|e| SyncError::Persistence { what: "endpoint cache", source: Box::new(e) })?;
			table
				.insert(relative_path, bytes.as_slice())
				.map_err(|e| SyncError::Persistence { what: "endpoint cache", source: Box::new(e) })?;
		}
		write_txn
			.commit()
			.map_err(|e| SyncError::Persistence { what: "endpoint cache", source: Box::new(e) })?;
		Ok(())
	}

	/// Whether `entry` at `relative_path` is still valid given observed
	/// mtime/size. Unchanged metadata means the cached digest can be reused
	/// without re-hashing file content.
	pub fn is_valid(&self, relative_path: &str, mtime_seconds: i64, mtime_nanos: u32, size: u64) -> Result<bool> {
		Ok(match self.get(relative_path)? {
			Some(entry) => {
				entry.mtime_seconds == mtime_seconds && entry.mtime_nanos == mtime_nanos && entry.size == size
			}
			None => false,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::TempDir;

	#[test]
	fn set_then_get_round_trips() {
		let tmp = TempDir::new().unwrap();
		let cache = Cache::open(&tmp.path().join("cache.redb")).unwrap();
		let entry = CacheEntry { mtime_seconds: 1, mtime_nanos: 0, size: 10, mode: 0o644, digest: vec![1, 2, 3] };
		cache.set("a/b.txt", &entry).unwrap();
		assert_eq!(cache.get("a/b.txt").unwrap(), Some(entry));
		assert_eq!(cache.get("missing").unwrap(), None);
	}

	#[test]
	fn is_valid_checks_mtime_and_size() {
		let tmp = TempDir::new().unwrap();
		let cache = Cache::open(&tmp.path().join("cache.redb")).unwrap();
		let entry = CacheEntry { mtime_seconds: 5, mtime_nanos: 0, size: 10, mode: 0o644, digest: vec![9] };
		cache.set("f", &entry).unwrap();
		assert!(cache.is_valid("f", 5, 0, 10).unwrap());
		assert!(!cache.is_valid("f", 6, 0, 10).unwrap());
	}

	#[test]
	fn open_or_empty_recovers_from_corrupt_file() {
		let tmp = TempDir::new().unwrap();
		let path = tmp.path().join("cache.redb");
		std::fs::write(&path, b"not a redb database").unwrap();
		let cache = Cache::open_or_empty(&path).unwrap();
		assert_eq!(cache.get("anything").unwrap(), None);
	}
}

// vim: ts=4
