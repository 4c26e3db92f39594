//! The (consumed, narrowly implemented) reconcile primitive (spec §1, §4.6
//! step 8): a three-way merge of the ancestor against both endpoints'
//! snapshots, producing ancestor changes, per-side transition lists, and
//! conflicts.
//!
//! Recurses into directories while all three trees agree a path is a
//! directory (or absent), so that independent changes to different files
//! inside the same directory are reconciled individually rather than
//! forcing the whole directory to be treated as one atomic value. Once any
//! side disagrees about directory-ness at a path, that whole subtree is
//! compared and resolved as a single value.

use std::collections::BTreeSet;

use super::entry::Entry;
use crate::config::SynchronizationMode;

/// A single-path change to apply. `new = None` means delete; `new =
/// Some(entry)` means create-or-replace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
	pub path: String,
	pub new: Option<Entry>,
}

/// A non-fatal per-path problem surfaced by transition (spec §4.2 op 5) or,
/// here, reserved for future reconcile-level diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Problem {
	pub path: String,
	pub error: String,
}

/// Two sides disagreeing about the same path in a way reconciliation
/// cannot resolve automatically (spec: "conflict *resolution policy*
/// beyond detection and propagation ... is a non-goal").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
	pub path: String,
	pub alpha_value: Option<Entry>,
	pub beta_value: Option<Entry>,
}

#[derive(Debug, Default)]
pub struct ReconcileOutcome {
	pub ancestor_changes: Vec<Change>,
	pub alpha_transitions: Vec<Change>,
	pub beta_transitions: Vec<Change>,
	pub conflicts: Vec<Conflict>,
}

/// Reconcile `ancestor` against `alpha` and `beta` under `mode`.
pub fn reconcile(ancestor: &Entry, alpha: &Entry, beta: &Entry, mode: SynchronizationMode) -> ReconcileOutcome {
	let mut outcome = ReconcileOutcome::default();
	reconcile_node(String::new(), Some(ancestor), Some(alpha), Some(beta), mode, &mut outcome);
	outcome
}

fn is_directory_or_absent(entry: Option<&Entry>) -> bool {
	entry.map_or(true, Entry::is_directory)
}

fn directory_contents(entry: Option<&Entry>) -> Option<&std::collections::BTreeMap<String, Entry>> {
	match entry {
		Some(Entry::Directory { contents }) => Some(contents),
		_ => None,
	}
}

fn join(path: &str, name: &str) -> String {
	if path.is_empty() { name.to_string() } else { format!("{path}/{name}") }
}

fn reconcile_node(
	path: String,
	ancestor: Option<&Entry>,
	alpha: Option<&Entry>,
	beta: Option<&Entry>,
	mode: SynchronizationMode,
	outcome: &mut ReconcileOutcome,
) {
	let all_absent = ancestor.is_none() && alpha.is_none() && beta.is_none();
	if !all_absent
		&& is_directory_or_absent(ancestor)
		&& is_directory_or_absent(alpha)
		&& is_directory_or_absent(beta)
		&& (ancestor.is_some() || alpha.is_some() || beta.is_some())
		&& (ancestor.map_or(true, Entry::is_directory)
			&& alpha.map_or(true, Entry::is_directory)
			&& beta.map_or(true, Entry::is_directory))
	{
		let mut names = BTreeSet::new();
		if let Some(c) = directory_contents(ancestor) {
			names.extend(c.keys().cloned());
		}
		if let Some(c) = directory_contents(alpha) {
			names.extend(c.keys().cloned());
		}
		if let Some(c) = directory_contents(beta) {
			names.extend(c.keys().cloned());
		}
		for name in names {
			let child_path = join(&path, &name);
			let child_ancestor = directory_contents(ancestor).and_then(|c| c.get(&name));
			let child_alpha = directory_contents(alpha).and_then(|c| c.get(&name));
			let child_beta = directory_contents(beta).and_then(|c| c.get(&name));
			reconcile_node(child_path, child_ancestor, child_alpha, child_beta, mode, outcome);
		}
		return;
	}

	reconcile_leaf(path, ancestor, alpha, beta, mode, outcome);
}

fn reconcile_leaf(
	path: String,
	ancestor: Option<&Entry>,
	alpha: Option<&Entry>,
	beta: Option<&Entry>,
	mode: SynchronizationMode,
	outcome: &mut ReconcileOutcome,
) {
	let alpha_changed = alpha != ancestor;
	let beta_changed = beta != ancestor;

	if !alpha_changed && !beta_changed {
		return;
	}
	if beta_changed && !alpha_changed {
		outcome.alpha_transitions.push(Change { path: path.clone(), new: beta.cloned() });
		outcome.ancestor_changes.push(Change { path, new: beta.cloned() });
		return;
	}
	if alpha_changed && !beta_changed {
		outcome.beta_transitions.push(Change { path: path.clone(), new: alpha.cloned() });
		outcome.ancestor_changes.push(Change { path, new: alpha.cloned() });
		return;
	}
	// Both changed.
	if alpha == beta {
		outcome.ancestor_changes.push(Change { path, new: alpha.cloned() });
		return;
	}
	match mode {
		SynchronizationMode::OneWayReplica => {
			outcome.beta_transitions.push(Change { path: path.clone(), new: alpha.cloned() });
			outcome.ancestor_changes.push(Change { path, new: alpha.cloned() });
		}
		SynchronizationMode::OneWaySafe => {
			outcome.beta_transitions.push(Change { path: path.clone(), new: alpha.cloned() });
			outcome.ancestor_changes.push(Change { path: path.clone(), new: alpha.cloned() });
			outcome.conflicts.push(Conflict {
				path,
				alpha_value: alpha.cloned(),
				beta_value: beta.cloned(),
			});
		}
		SynchronizationMode::TwoWayResolved => {
			outcome.beta_transitions.push(Change { path: path.clone(), new: alpha.cloned() });
			outcome.ancestor_changes.push(Change { path, new: alpha.cloned() });
		}
		SynchronizationMode::TwoWaySafe | SynchronizationMode::Default => {
			outcome.conflicts.push(Conflict {
				path,
				alpha_value: alpha.cloned(),
				beta_value: beta.cloned(),
			});
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::fs::entry::empty_directory;
	use std::collections::BTreeMap;

	fn file(byte: u8) -> Entry {
		Entry::File { executable: false, digest: vec![byte] }
	}

	#[test]
	fn single_file_created_on_alpha_propagates_to_beta() {
		let ancestor = empty_directory();
		let mut alpha_contents = BTreeMap::new();
		alpha_contents.insert("f".to_string(), file(1));
		let alpha = Entry::Directory { contents: alpha_contents };
		let beta = empty_directory();

		let outcome = reconcile(&ancestor, &alpha, &beta, SynchronizationMode::TwoWaySafe);
		assert_eq!(outcome.beta_transitions, vec![Change { path: "f".into(), new: Some(file(1)) }]);
		assert!(outcome.alpha_transitions.is_empty());
		assert!(outcome.conflicts.is_empty());
		assert_eq!(outcome.ancestor_changes, vec![Change { path: "f".into(), new: Some(file(1)) }]);
	}

	#[test]
	fn independent_conflicting_edits_produce_conflict_under_two_way_safe() {
		let mut ancestor_contents = BTreeMap::new();
		ancestor_contents.insert("f".to_string(), file(0));
		let ancestor = Entry::Directory { contents: ancestor_contents };

		let mut alpha_contents = BTreeMap::new();
		alpha_contents.insert("f".to_string(), file(1));
		let alpha = Entry::Directory { contents: alpha_contents };

		let mut beta_contents = BTreeMap::new();
		beta_contents.insert("f".to_string(), file(2));
		let beta = Entry::Directory { contents: beta_contents };

		let outcome = reconcile(&ancestor, &alpha, &beta, SynchronizationMode::TwoWaySafe);
		assert_eq!(outcome.conflicts.len(), 1);
		assert!(outcome.alpha_transitions.is_empty());
		assert!(outcome.beta_transitions.is_empty());
	}

	#[test]
	fn one_way_replica_always_wins_with_alpha() {
		let mut ancestor_contents = BTreeMap::new();
		ancestor_contents.insert("f".to_string(), file(0));
		let ancestor = Entry::Directory { contents: ancestor_contents };

		let mut alpha_contents = BTreeMap::new();
		alpha_contents.insert("f".to_string(), file(1));
		let alpha = Entry::Directory { contents: alpha_contents };

		let mut beta_contents = BTreeMap::new();
		beta_contents.insert("f".to_string(), file(2));
		let beta = Entry::Directory { contents: beta_contents };

		let outcome = reconcile(&ancestor, &alpha, &beta, SynchronizationMode::OneWayReplica);
		assert!(outcome.conflicts.is_empty());
		assert_eq!(outcome.beta_transitions, vec![Change { path: "f".into(), new: Some(file(1)) }]);
	}

	#[test]
	fn deletion_on_alpha_propagates_to_beta() {
		let mut ancestor_contents = BTreeMap::new();
		ancestor_contents.insert("f".to_string(), file(0));
		let ancestor = Entry::Directory { contents: ancestor_contents.clone() };
		let alpha = empty_directory();
		let beta = Entry::Directory { contents: ancestor_contents };

		let outcome = reconcile(&ancestor, &alpha, &beta, SynchronizationMode::TwoWaySafe);
		assert_eq!(outcome.beta_transitions, vec![Change { path: "f".into(), new: None }]);
	}

	#[test]
	fn root_deletion_surfaces_as_empty_path_transition() {
		let ancestor = Entry::File { executable: false, digest: vec![1] };
		let alpha_root: Option<Entry> = None;
		let beta_root = ancestor.clone();
		let mut outcome = ReconcileOutcome::default();
		reconcile_node(
			String::new(),
			Some(&ancestor),
			alpha_root.as_ref(),
			Some(&beta_root),
			SynchronizationMode::TwoWaySafe,
			&mut outcome,
		);
		assert_eq!(outcome.beta_transitions, vec![Change { path: String::new(), new: None }]);
	}
}

// vim: ts=4
