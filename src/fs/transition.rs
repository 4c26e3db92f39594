//! The (consumed, narrowly implemented) transition primitive (spec §1,
//! §4.2 op 5, §4.3 "Transition invokes the external transition primitive").
//!
//! Applies a list of [`Change`]s to an on-disk root, one file at a time,
//! and separately provides [`apply`] to fold the same changes into an
//! in-memory ancestor [`Entry`] tree (spec §4.6 step 13).

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::symlink;
use std::path::Path;

use super::entry::{empty_directory, Entry};
use super::reconcile::{Change, Problem};
use crate::stager::Stager;

/// Outcome of applying one [`Change`] to the filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionResult {
	pub path: String,
	pub new: Option<Entry>,
}

/// Apply `transitions` to `root` on disk, staging file content through
/// `stager`. Returns per-change results for every change that completed,
/// non-fatal per-path problems for the rest, and whether any change
/// failed specifically because the stager lacked the expected file
/// (spec §4.2 op 5's `missingFilesFlag`).
pub fn transition(
	root: &Path,
	transitions: &[Change],
	stager: &Stager,
) -> (Vec<TransitionResult>, Vec<Problem>, bool) {
	let mut results = Vec::new();
	let mut problems = Vec::new();
	let mut missing_files = false;

	for change in transitions {
		let target = if change.path.is_empty() { root.to_path_buf() } else { root.join(&change.path) };
		match apply_one(&target, change, stager) {
			Ok(applied) => results.push(TransitionResult { path: change.path.clone(), new: applied }),
			Err(e) => {
				if e.is_not_staged() {
					missing_files = true;
				}
				problems.push(Problem { path: change.path.clone(), error: e.to_string() });
			}
		}
	}

	(results, problems, missing_files)
}

fn apply_one(target: &Path, change: &Change, stager: &Stager) -> crate::error::Result<Option<Entry>> {
	use crate::error::SyncError;

	match &change.new {
		None => {
			remove_any(target).map_err(|e| SyncError::io("transition: remove", e))?;
			Ok(None)
		}
		Some(Entry::Directory { .. }) => {
			fs::create_dir_all(target).map_err(|e| SyncError::io("transition: mkdir", e))?;
			Ok(Some(Entry::Directory { contents: Default::default() }))
		}
		Some(Entry::Symlink { target: link_target }) => {
			let _ = remove_any(target);
			if let Some(parent) = target.parent() {
				fs::create_dir_all(parent).map_err(|e| SyncError::io("transition: mkdir parent", e))?;
			}
			symlink(link_target, target).map_err(|e| SyncError::io("transition: symlink", e))?;
			Ok(Some(Entry::Symlink { target: link_target.clone() }))
		}
		Some(Entry::File { executable, digest }) => {
			let staged = stager.provide(&change.path, digest, *executable)?;
			if let Some(parent) = target.parent() {
				fs::create_dir_all(parent).map_err(|e| SyncError::io("transition: mkdir parent", e))?;
			}
			let _ = remove_any(target);
			match fs::rename(&staged, target) {
				Ok(()) => {}
				Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
					fs::copy(&staged, target).map_err(|e| SyncError::io("transition: copy across devices", e))?;
					let _ = fs::remove_file(&staged);
				}
				Err(e) => return Err(SyncError::io("transition: rename staged file", e)),
			}
			Ok(Some(Entry::File { executable: *executable, digest: digest.clone() }))
		}
	}
}

fn remove_any(path: &Path) -> std::io::Result<()> {
	match fs::symlink_metadata(path) {
		Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
		Ok(_) => fs::remove_file(path),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
		Err(e) => Err(e),
	}
}

/// Fold `changes` into `root`, creating intermediate directory nodes as
/// needed (spec §4.6 step 13 "apply them to the ancestor").
pub fn apply(root: &Entry, changes: &[Change]) -> Entry {
	let mut tree = root.clone();
	for change in changes {
		if change.path.is_empty() {
			tree = change.new.clone().unwrap_or_else(empty_directory);
		} else {
			set_path(&mut tree, &change.path, change.new.clone());
		}
	}
	tree
}

fn set_path(tree: &mut Entry, path: &str, new: Option<Entry>) {
	if !matches!(tree, Entry::Directory { .. }) {
		*tree = Entry::Directory { contents: BTreeMap::new() };
	}
	let Entry::Directory { contents } = tree else { unreachable!() };

	match path.split_once('/') {
		Some((head, rest)) => {
			let child = contents
				.entry(head.to_string())
				.or_insert_with(|| Entry::Directory { contents: BTreeMap::new() });
			set_path(child, rest, new);
		}
		None => match new {
			Some(entry) => {
				contents.insert(path.to_string(), entry);
			}
			None => {
				contents.remove(path);
			}
		},
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write;
	use tempfile::TempDir;

	#[test]
	fn creates_file_from_staged_content() {
		let root = TempDir::new().unwrap();
		let staging = TempDir::new().unwrap();
		let stager = Stager::new(staging.path().to_path_buf());

		let mut sink = stager.sink("f.txt").unwrap();
		sink.write_all(b"hello").unwrap();
		let digest = sink.close().unwrap();

		let changes =
			vec![Change { path: "f.txt".to_string(), new: Some(Entry::File { executable: false, digest }) }];
		let (results, problems, missing) = transition(root.path(), &changes, &stager);
		assert!(problems.is_empty());
		assert!(!missing);
		assert_eq!(results.len(), 1);
		assert_eq!(fs::read(root.path().join("f.txt")).unwrap(), b"hello");
	}

	#[test]
	fn deletes_file() {
		let root = TempDir::new().unwrap();
		fs::write(root.path().join("gone.txt"), b"bye").unwrap();
		let staging = TempDir::new().unwrap();
		let stager = Stager::new(staging.path().to_path_buf());

		let changes = vec![Change { path: "gone.txt".to_string(), new: None }];
		let (results, problems, _) = transition(root.path(), &changes, &stager);
		assert!(problems.is_empty());
		assert_eq!(results, vec![TransitionResult { path: "gone.txt".to_string(), new: None }]);
		assert!(!root.path().join("gone.txt").exists());
	}

	#[test]
	fn reports_missing_files_flag_when_stager_lacks_content() {
		let root = TempDir::new().unwrap();
		let staging = TempDir::new().unwrap();
		let stager = Stager::new(staging.path().to_path_buf());

		let changes = vec![Change {
			path: "f.txt".to_string(),
			new: Some(Entry::File { executable: false, digest: vec![1, 2, 3] }),
		}];
		let (results, problems, missing) = transition(root.path(), &changes, &stager);
		assert!(results.is_empty());
		assert_eq!(problems.len(), 1);
		assert!(missing);
	}

	#[test]
	fn apply_creates_intermediate_directories() {
		let root = empty_directory();
		let changes = vec![Change {
			path: "a/b/c.txt".to_string(),
			new: Some(Entry::File { executable: false, digest: vec![1] }),
		}];
		let updated = apply(&root, &changes);
		assert!(updated.get("a/b/c.txt").is_some());
	}
}

// vim: ts=4
