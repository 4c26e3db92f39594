//! The (consumed, narrowly implemented) scan primitive (spec §1: "the core
//! *consumes* their contracts (§6) but the algorithms inside them are not
//! re-specified here").
//!
//! Walks a root directory producing a validated [`Entry`] tree, consulting
//! the per-endpoint [`Cache`] to avoid re-hashing unchanged files, and
//! applying an [`IgnoreMatcher`]. Not cancellable once started (spec §5);
//! callers run it inside a blocking task.

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;
use std::time::UNIX_EPOCH;

use sha1::{Digest, Sha1};

use super::cache::{Cache, CacheEntry};
use super::entry::Entry;
use super::ignore::IgnoreMatcher;
use crate::config::SymlinkMode;

/// Error surfaced by [`scan`]. `try_again` mirrors spec §4.2's
/// `tryAgainFlag`: true means the caller should retry the scan without
/// treating the failure as fatal (typically a concurrent-modification
/// race between directory listing and stat).
#[derive(Debug, Clone)]
pub struct ScanError {
	pub message: String,
	pub try_again: bool,
}

impl std::fmt::Display for ScanError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.message)
	}
}

impl std::error::Error for ScanError {}

impl ScanError {
	fn fatal(message: impl Into<String>) -> Self {
		ScanError { message: message.into(), try_again: false }
	}

	fn transient(message: impl Into<String>) -> Self {
		ScanError { message: message.into(), try_again: true }
	}
}

pub struct ScanOutcome {
	pub snapshot: Entry,
	/// Whether this scan preserves the executable bit faithfully. Always
	/// true on this (Unix-oriented) implementation.
	pub preserves_executability: bool,
}

/// Scan `root`, consulting `cache` for unchanged files and `ignores` to
/// skip excluded paths, honoring `symlink_mode`. `force_full` bypasses the
/// cache entirely (spec §4.6 step 6: "forceFullScan is true when a flush
/// request is being serviced").
pub fn scan(
	root: &Path,
	cache: &Cache,
	ignores: &IgnoreMatcher,
	symlink_mode: SymlinkMode,
	force_full: bool,
) -> Result<ScanOutcome, ScanError> {
	let root_meta = match fs::symlink_metadata(root) {
		Ok(meta) => meta,
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
			return Err(ScanError::fatal("synchronization root does not exist"));
		}
		Err(e) => return Err(ScanError::transient(format!("failed to stat root: {e}"))),
	};
	if !root_meta.is_dir() {
		return Err(ScanError::fatal("synchronization root is not a directory"));
	}

	let contents = scan_directory(root, "", cache, ignores, symlink_mode, force_full)?;
	Ok(ScanOutcome { snapshot: Entry::Directory { contents }, preserves_executability: true })
}

fn scan_directory(
	root: &Path,
	relative: &str,
	cache: &Cache,
	ignores: &IgnoreMatcher,
	symlink_mode: SymlinkMode,
	force_full: bool,
) -> Result<BTreeMap<String, Entry>, ScanError> {
	let absolute = if relative.is_empty() { root.to_path_buf() } else { root.join(relative) };
	let read_dir = fs::read_dir(&absolute)
		.map_err(|e| ScanError::transient(format!("failed to list {}: {e}", absolute.display())))?;

	let mut contents = BTreeMap::new();
	for dir_entry in read_dir {
		let dir_entry =
			dir_entry.map_err(|e| ScanError::transient(format!("failed to read directory entry: {e}")))?;
		let name = dir_entry.file_name().to_string_lossy().into_owned();
		let child_relative =
			if relative.is_empty() { name.clone() } else { format!("{relative}/{name}") };

		if ignores.is_ignored(&child_relative) {
			continue;
		}

		let metadata = match dir_entry.metadata() {
			Ok(m) => m,
			// Entry vanished between readdir and stat: concurrent modification.
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
			Err(e) => return Err(ScanError::transient(format!("failed to stat {child_relative}: {e}"))),
		};

		let entry = if metadata.is_dir() {
			let child_contents =
				scan_directory(root, &child_relative, cache, ignores, symlink_mode, force_full)?;
			Entry::Directory { contents: child_contents }
		} else if metadata.file_type().is_symlink() {
			match symlink_mode {
				SymlinkMode::Ignore | SymlinkMode::Default => continue,
				SymlinkMode::Portable => {
					let target = fs::read_link(absolute.join(&name))
						.map_err(|e| ScanError::transient(format!("failed to read symlink {child_relative}: {e}")))?;
					if target.is_absolute() {
						continue;
					}
					Entry::Symlink { target: target.to_string_lossy().into_owned() }
				}
				SymlinkMode::PosixRaw => {
					let target = fs::read_link(absolute.join(&name))
						.map_err(|e| ScanError::transient(format!("failed to read symlink {child_relative}: {e}")))?;
					Entry::Symlink { target: target.to_string_lossy().into_owned() }
				}
			}
		} else if metadata.is_file() {
			scan_file(root, &child_relative, &metadata, cache, force_full)?
		} else {
			// Device nodes, sockets, fifos: not representable, skip.
			continue;
		};

		contents.insert(name, entry);
	}
	Ok(contents)
}

fn scan_file(
	root: &Path,
	relative: &str,
	metadata: &fs::Metadata,
	cache: &Cache,
	force_full: bool,
) -> Result<Entry, ScanError> {
	let mtime = metadata
		.modified()
		.map_err(|e| ScanError::transient(format!("failed to read mtime of {relative}: {e}")))?;
	let duration = mtime.duration_since(UNIX_EPOCH).unwrap_or_default();
	let (mtime_seconds, mtime_nanos) = (duration.as_secs() as i64, duration.subsec_nanos());
	let size = metadata.size();
	let executable = metadata.permissions().mode() & 0o100 != 0;

	if !force_full {
		if cache
			.is_valid(relative, mtime_seconds, mtime_nanos, size)
			.map_err(|e| ScanError::fatal(format!("cache lookup failed: {e}")))?
		{
			if let Some(cached) = cache
				.get(relative)
				.map_err(|e| ScanError::fatal(format!("cache lookup failed: {e}")))?
			{
				return Ok(Entry::File { executable, digest: cached.digest });
			}
		}
	}

	let path = root.join(relative);
	let bytes = fs::read(&path).map_err(|e| ScanError::transient(format!("failed to read {relative}: {e}")))?;
	let mut hasher = Sha1::new();
	hasher.update(&bytes);
	let digest = hasher.finalize().to_vec();

	cache
		.set(
			relative,
			&CacheEntry { mtime_seconds, mtime_nanos, size, mode: metadata.permissions().mode(), digest: digest.clone() },
		)
		.map_err(|e| ScanError::fatal(format!("cache write failed: {e}")))?;

	Ok(Entry::File { executable, digest })
}


// vim: ts=4
