//! Content-addressed staging subsystem (spec §4.1).
//!
//! A `Stager` owns one lazily-created staging root per session, per side
//! (spec §6: `staging/<session-id>_<alpha|beta>/…`). It is not safe for
//! concurrent use — the controller serializes Stage/Transition so that
//! each produced [`Sink`] is closed before the next is opened (spec §4.1
//! "Concurrency").

use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use sha1::{Digest, Sha1};

use crate::error::{Result, SyncError};

struct Inner {
	staging_root: PathBuf,
	root_created: AtomicBool,
	prefixes_created: Mutex<HashSet<String>>,
}

/// Content-addressed temporary store for one session/side.
#[derive(Clone)]
pub struct Stager {
	inner: Arc<Inner>,
}

impl Stager {
	pub fn new(staging_root: PathBuf) -> Self {
		Stager {
			inner: Arc::new(Inner {
				staging_root,
				root_created: AtomicBool::new(false),
				prefixes_created: Mutex::new(HashSet::new()),
			}),
		}
	}

	pub fn staging_root(&self) -> &Path {
		&self.inner.staging_root
	}

	fn ensure_root(&self) -> Result<()> {
		if !self.inner.root_created.load(Ordering::Acquire) {
			fs::create_dir_all(&self.inner.staging_root)
				.map_err(|e| SyncError::io("stager: create staging root", e))?;
			self.inner.root_created.store(true, Ordering::Release);
		}
		Ok(())
	}

	fn ensure_prefix(&self, prefix: &str) -> Result<()> {
		let mut created = self.inner.prefixes_created.lock().expect("stager prefix lock poisoned");
		if !created.contains(prefix) {
			fs::create_dir_all(self.inner.staging_root.join(prefix))
				.map_err(|_| SyncError::stager("prefix creation failure"))?;
			created.insert(prefix.to_string());
		}
		Ok(())
	}

	/// Open a fresh sink for `relative_path`. The path's only role here is
	/// to feed the final filename's `sha1(path)` component (spec §4.1); the
	/// bytes written are not otherwise associated with it until `close`.
	pub fn sink(&self, relative_path: &str) -> Result<Sink> {
		self.ensure_root()?;
		let temp_name = format!(".staging-{}", uuid::Uuid::new_v4());
		let temp_path = self.inner.staging_root.join(temp_name);
		let file = fs::File::create(&temp_path).map_err(|e| SyncError::io("stager: open sink", e))?;
		Ok(Sink {
			temp_path,
			file,
			hasher: Sha1::new(),
			relative_path: relative_path.to_string(),
			stager: self.clone(),
		})
	}

	fn final_path(&self, relative_path: &str, digest: &[u8]) -> Result<PathBuf> {
		if digest.is_empty() {
			return Err(SyncError::stager("empty digest"));
		}
		let prefix = hex::encode([digest[0]]);
		let mut hasher = Sha1::new();
		hasher.update(relative_path.as_bytes());
		let path_hash = hasher.finalize();
		let name = format!("{}_{}", hex::encode(path_hash), hex::encode(digest));
		Ok(self.inner.staging_root.join(prefix).join(name))
	}

	fn finalize(&self, relative_path: &str, temp_path: &Path, digest: &[u8]) -> Result<PathBuf> {
		let prefix = hex::encode([digest[0]]);
		self.ensure_prefix(&prefix)?;
		let final_path = self.final_path(relative_path, digest)?;
		match fs::rename(temp_path, &final_path) {
			Ok(()) => Ok(final_path),
			Err(e) => {
				let _ = fs::remove_file(temp_path);
				Err(SyncError::stager(format!("rename failure: {e}")))
			}
		}
	}

	/// True iff a file already sits at the content-addressed final path for
	/// `(relative_path, digest)`. Unlike [`Stager::provide`], this never
	/// mutates permissions — used by `Stage` (spec §4.2 op 3) purely to
	/// decide whether a path can be filtered out of what needs supplying.
	pub fn is_staged(&self, relative_path: &str, digest: &[u8]) -> bool {
		match self.final_path(relative_path, digest) {
			Ok(path) => path.exists(),
			Err(_) => false,
		}
	}

	/// Return the final on-disk path for `(relative_path, digest)`, fixing
	/// up the executable bit to match `executable` (spec §4.1 Provide).
	/// Fails with *not-staged* if the file is absent.
	pub fn provide(&self, relative_path: &str, digest: &[u8], executable: bool) -> Result<PathBuf> {
		let final_path = self.final_path(relative_path, digest)?;
		let metadata = fs::metadata(&final_path)
			.map_err(|_| SyncError::stager(format!("not staged: {relative_path}")))?;
		let mut permissions = metadata.permissions();
		let mode = if executable { permissions.mode() | 0o100 } else { permissions.mode() & !0o111 };
		permissions.set_mode(mode);
		fs::set_permissions(&final_path, permissions)
			.map_err(|e| SyncError::io("stager: provide set permissions", e))?;
		Ok(final_path)
	}

	/// Remove the staging root entirely and clear memoization.
	pub fn wipe(&self) -> Result<()> {
		match fs::remove_dir_all(&self.inner.staging_root) {
			Ok(()) => {}
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
			Err(e) => return Err(SyncError::io("stager: wipe", e)),
		}
		self.inner.root_created.store(false, Ordering::Release);
		self.inner.prefixes_created.lock().expect("stager prefix lock poisoned").clear();
		Ok(())
	}
}

/// A single in-progress staged write. Must be closed before the next
/// `Stager::sink` call (spec §4.1 "Concurrency").
pub struct Sink {
	temp_path: PathBuf,
	file: fs::File,
	hasher: Sha1,
	relative_path: String,
	stager: Stager,
}

impl Write for Sink {
	fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
		let written = self.file.write(buf)?;
		self.hasher.update(&buf[..written]);
		Ok(written)
	}

	fn flush(&mut self) -> std::io::Result<()> {
		self.file.flush()
	}
}

impl Sink {
	/// Compute the final digest, rename the temp file into its
	/// content-addressed final path, and return the digest. Removes the
	/// temp file on any failure (spec §4.1 Close).
	pub fn close(self) -> Result<Vec<u8>> {
		let Sink { temp_path, mut file, hasher, relative_path, stager } = self;
		file.flush().map_err(|_| SyncError::stager("storage closure failure"))?;
		drop(file);
		let digest = hasher.finalize().to_vec();
		stager.finalize(&relative_path, &temp_path, &digest)?;
		Ok(digest)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::TempDir;

	#[test]
	fn sink_close_then_provide_round_trips() {
		let tmp = TempDir::new().unwrap();
		let stager = Stager::new(tmp.path().join("staging"));
		let mut sink = stager.sink("a/b.txt").unwrap();
		sink.write_all(b"hello world").unwrap();
		let digest = sink.close().unwrap();

		let path = stager.provide("a/b.txt", &digest, false).unwrap();
		assert_eq!(fs::read(&path).unwrap(), b"hello world");
		let mode = fs::metadata(&path).unwrap().permissions().mode();
		assert_eq!(mode & 0o111, 0);
	}

	#[test]
	fn provide_sets_executable_bit() {
		let tmp = TempDir::new().unwrap();
		let stager = Stager::new(tmp.path().join("staging"));
		let mut sink = stager.sink("bin/tool").unwrap();
		sink.write_all(b"#!/bin/sh").unwrap();
		let digest = sink.close().unwrap();

		let path = stager.provide("bin/tool", &digest, true).unwrap();
		let mode = fs::metadata(&path).unwrap().permissions().mode();
		assert_eq!(mode & 0o100, 0o100);
	}

	#[test]
	fn provide_fails_when_not_staged() {
		let tmp = TempDir::new().unwrap();
		let stager = Stager::new(tmp.path().join("staging"));
		let err = stager.provide("missing", &[1, 2, 3], false).unwrap_err();
		assert!(err.is_not_staged());
	}

	#[test]
	fn is_staged_does_not_mutate_permissions() {
		let tmp = TempDir::new().unwrap();
		let stager = Stager::new(tmp.path().join("staging"));
		assert!(!stager.is_staged("missing", &[1, 2, 3]));

		let mut sink = stager.sink("f").unwrap();
		sink.write_all(b"hi").unwrap();
		let digest = sink.close().unwrap();
		assert!(stager.is_staged("f", &digest));

		let path = stager.provide("f", &digest, false).unwrap();
		let mode_before = fs::metadata(&path).unwrap().permissions().mode();
		assert!(stager.is_staged("f", &digest));
		let mode_after = fs::metadata(&path).unwrap().permissions().mode();
		assert_eq!(mode_before, mode_after);
	}

	#[test]
	fn wipe_removes_staging_root() {
		let tmp = TempDir::new().unwrap();
		let stager = Stager::new(tmp.path().join("staging"));
		let mut sink = stager.sink("f").unwrap();
		sink.write_all(b"x").unwrap();
		let digest = sink.close().unwrap();
		assert!(stager.provide("f", &digest, false).is_ok());

		stager.wipe().unwrap();
		assert!(!stager.staging_root().exists());
		assert!(stager.provide("f", &digest, false).is_err());
	}
}

// vim: ts=4
