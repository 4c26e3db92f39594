//! On-disk locations and housekeeping (spec §2 component #8, §6 "On-disk
//! layout").
//!
//! All four persistent file kinds (session record, ancestor archive,
//! endpoint cache, staging root) live under one per-user data directory,
//! keyed by session id and, for caches/staging, by [`Side`] (spec §5
//! "Shared resources ... are not shared across controllers (keyed by
//! session id)").

use std::path::{Path, PathBuf};

use crate::session::Side;

/// Replace `path`'s content with `bytes` via write-temp-then-rename, the
/// idiom spec §6 mandates for all four persistent file kinds ("replaced
/// atomically via write-temp + rename"). The temp file lives alongside
/// `path` so the rename stays on one filesystem.
pub async fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
	let parent = path.parent().unwrap_or_else(|| Path::new("."));
	tokio::fs::create_dir_all(parent).await?;
	let temp_path = parent.join(format!(".{}.tmp-{}", file_name(path), uuid::Uuid::new_v4()));
	tokio::fs::write(&temp_path, bytes).await?;
	match tokio::fs::rename(&temp_path, path).await {
		Ok(()) => Ok(()),
		Err(e) => {
			let _ = tokio::fs::remove_file(&temp_path).await;
			Err(e)
		}
	}
}

fn file_name(path: &Path) -> String {
	path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_else(|| "file".to_string())
}

/// Resolves every on-disk location this crate touches.
#[derive(Debug, Clone)]
pub struct Paths {
	root: PathBuf,
}

impl Paths {
	/// Build a `Paths` rooted at `root` (typically a well-known per-user
	/// directory such as `~/.local/share/duosync`; the exact choice of
	/// that default is a CLI/daemon-lifecycle concern and out of this
	/// crate's scope — spec §1).
	pub fn new(root: PathBuf) -> Self {
		Paths { root }
	}

	pub fn root(&self) -> &Path {
		&self.root
	}

	pub fn sessions_dir(&self) -> PathBuf {
		self.root.join("sessions")
	}

	pub fn archives_dir(&self) -> PathBuf {
		self.root.join("archives")
	}

	pub fn caches_dir(&self) -> PathBuf {
		self.root.join("caches")
	}

	pub fn staging_dir(&self) -> PathBuf {
		self.root.join("staging")
	}

	pub fn session_path(&self, session_id: &str) -> PathBuf {
		self.sessions_dir().join(session_id)
	}

	pub fn archive_path(&self, session_id: &str) -> PathBuf {
		self.archives_dir().join(session_id)
	}

	pub fn cache_path(&self, session_id: &str, side: Side) -> PathBuf {
		self.caches_dir().join(format!("{session_id}_{side}"))
	}

	pub fn staging_root(&self, session_id: &str, side: Side) -> PathBuf {
		self.staging_dir().join(format!("{session_id}_{side}"))
	}

	/// Create the four top-level directories if absent. Called once by the
	/// manager at startup.
	pub async fn ensure_directories(&self) -> std::io::Result<()> {
		for dir in [self.sessions_dir(), self.archives_dir(), self.caches_dir(), self.staging_dir()] {
			tokio::fs::create_dir_all(dir).await?;
		}
		Ok(())
	}

	/// Remove per-session caches and staging roots that have no
	/// corresponding session record on disk (SPEC_FULL §11 "Housekeeping
	/// sweep"). Best-effort: individual removal failures are logged and
	/// skipped rather than propagated, since an abandoned directory left
	/// behind for one more sweep is harmless.
	pub async fn sweep_abandoned(&self) -> std::io::Result<usize> {
		let mut live_sessions = std::collections::HashSet::new();
		let mut sessions_entries = match tokio::fs::read_dir(self.sessions_dir()).await {
			Ok(entries) => entries,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
			Err(e) => return Err(e),
		};
		while let Some(entry) = sessions_entries.next_entry().await? {
			live_sessions.insert(entry.file_name().to_string_lossy().into_owned());
		}

		let mut removed = 0;
		for dir in [self.caches_dir(), self.staging_dir()] {
			let mut entries = match tokio::fs::read_dir(&dir).await {
				Ok(entries) => entries,
				Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
				Err(e) => return Err(e),
			};
			while let Some(entry) = entries.next_entry().await? {
				let name = entry.file_name().to_string_lossy().into_owned();
				let Some((session_id, _side)) = name.rsplit_once('_') else { continue };
				if live_sessions.contains(session_id) {
					continue;
				}
				let path = entry.path();
				let result = if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
					tokio::fs::remove_dir_all(&path).await
				} else {
					tokio::fs::remove_file(&path).await
				};
				match result {
					Ok(()) => removed += 1,
					Err(e) => {
						tracing::warn!(path = %path.display(), error = %e, "failed to remove abandoned entry");
					}
				}
			}
		}
		Ok(removed)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::TempDir;

	#[test]
	fn paths_are_keyed_by_session_and_side() {
		let paths = Paths::new(PathBuf::from("/data"));
		assert_eq!(paths.session_path("s1"), PathBuf::from("/data/sessions/s1"));
		assert_eq!(paths.archive_path("s1"), PathBuf::from("/data/archives/s1"));
		assert_eq!(paths.cache_path("s1", Side::Alpha), PathBuf::from("/data/caches/s1_alpha"));
		assert_eq!(paths.staging_root("s1", Side::Beta), PathBuf::from("/data/staging/s1_beta"));
	}

	#[tokio::test]
	async fn ensure_directories_creates_all_four() {
		let tmp = TempDir::new().unwrap();
		let paths = Paths::new(tmp.path().to_path_buf());
		paths.ensure_directories().await.unwrap();
		assert!(paths.sessions_dir().is_dir());
		assert!(paths.archives_dir().is_dir());
		assert!(paths.caches_dir().is_dir());
		assert!(paths.staging_dir().is_dir());
	}

	#[tokio::test]
	async fn sweep_removes_cache_and_staging_with_no_session_record() {
		let tmp = TempDir::new().unwrap();
		let paths = Paths::new(tmp.path().to_path_buf());
		paths.ensure_directories().await.unwrap();
		tokio::fs::write(paths.session_path("live"), b"{}").await.unwrap();
		tokio::fs::write(paths.cache_path("live", Side::Alpha), b"").await.unwrap();
		tokio::fs::write(paths.cache_path("dead", Side::Alpha), b"").await.unwrap();
		tokio::fs::create_dir_all(paths.staging_root("dead", Side::Beta)).await.unwrap();

		let removed = paths.sweep_abandoned().await.unwrap();
		assert_eq!(removed, 2);
		assert!(paths.cache_path("live", Side::Alpha).exists());
		assert!(!paths.cache_path("dead", Side::Alpha).exists());
		assert!(!paths.staging_root("dead", Side::Beta).exists());
	}

	#[tokio::test]
	async fn atomic_write_replaces_existing_content() {
		let tmp = TempDir::new().unwrap();
		let path = tmp.path().join("record");
		atomic_write(&path, b"first").await.unwrap();
		assert_eq!(tokio::fs::read(&path).await.unwrap(), b"first");
		atomic_write(&path, b"second").await.unwrap();
		assert_eq!(tokio::fs::read(&path).await.unwrap(), b"second");

		let leftover: Vec<_> = std::fs::read_dir(tmp.path())
			.unwrap()
			.filter_map(|e| e.ok())
			.filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
			.collect();
		assert!(leftover.is_empty());
	}
}

// vim: ts=4
