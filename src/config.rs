//! Synchronization configuration (spec §3 "Configuration").
//!
//! `Configuration` is a value object, identical in shape whether it comes
//! from the shared session-level settings or one of the two per-endpoint
//! overlays. Every field carries an explicit "unspecified" sentinel (zero,
//! empty, or a `Default` enum variant) so that [`Configuration::merge`]
//! can implement spec's priority rule: the higher-priority value wins iff
//! it is non-default; ignore lists concatenate lower-then-higher.
//!
//! Loading configuration from files, environment variables, or CLI flags
//! is out of scope (spec §1) — this module only merges already-parsed
//! values and validates them by source kind.

use serde::{Deserialize, Serialize};

/// Where a `Configuration` value originated, used to gate legacy fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigurationSource {
	/// Built-in defaults.
	Default,
	/// Loaded from a legacy on-disk session record that may still carry
	/// the deprecated `default_ignores` field.
	File,
	/// CLI flags or any other new-style source. Setting `default_ignores`
	/// from here is rejected (spec §9 open question).
	Cli,
}

/// Two-way vs one-way synchronization behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SynchronizationMode {
	/// Unspecified; resolved to a session-version default during merge.
	#[default]
	Default,
	/// Propagate changes both ways, treating most conflicts as resolvable
	/// only by the user.
	TwoWaySafe,
	/// Propagate changes both ways, auto-resolving conflicts by deferring
	/// to whichever endpoint is configured as primary.
	TwoWayResolved,
	/// Propagate alpha's changes to beta; beta's independent changes are
	/// reported as problems but not applied to alpha.
	OneWaySafe,
	/// Alpha is authoritative: beta is forced into agreement with alpha,
	/// including deleting beta-only content.
	OneWayReplica,
}

impl SynchronizationMode {
	pub fn is_default(self) -> bool {
		self == SynchronizationMode::Default
	}

	/// Per-session-version default, applied once both merged
	/// configurations are built (spec §4.6 "Derived config").
	pub fn default_for_version(_version: u32) -> Self {
		SynchronizationMode::TwoWaySafe
	}
}

/// How aggressively the scan primitive re-derives content digests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ScanMode {
	#[default]
	Default,
	/// Use the accelerating cache whenever available.
	Accelerated,
	/// Always perform a full content scan, ignoring the cache.
	Full,
}

impl ScanMode {
	pub fn is_default(self) -> bool {
		self == ScanMode::Default
	}
}

/// Where staged content is written before being applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StageMode {
	#[default]
	Default,
	/// Inside this crate's per-user data directory (spec §6 on-disk layout).
	Internal,
	/// Alongside the synchronization root, on the same filesystem.
	Neighboring,
}

impl StageMode {
	pub fn is_default(self) -> bool {
		self == StageMode::Default
	}
}

/// Symbolic link handling (spec §3, §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SymlinkMode {
	#[default]
	Default,
	/// Symbolic links are not synchronized at all.
	Ignore,
	/// Symbolic links are synchronized if and only if their target is a
	/// relative path that stays inside the synchronization root.
	Portable,
	/// Symbolic links are synchronized verbatim, however they point.
	PosixRaw,
}

impl SymlinkMode {
	pub fn is_default(self) -> bool {
		self == SymlinkMode::Default
	}

	pub fn default_for_version(_version: u32) -> Self {
		SymlinkMode::Portable
	}
}

/// Filesystem watch strategy for one endpoint (spec §4.6 "per-side watch
/// modes").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum WatchMode {
	#[default]
	Default,
	/// Use the recommended native watcher, falling back to polling.
	Portable,
	/// Always poll at `watch_polling_interval`.
	Force,
	/// Never poll or watch; only flush requests trigger a cycle.
	NoWatch,
}

impl WatchMode {
	pub fn is_default(self) -> bool {
		self == WatchMode::Default
	}

	pub fn default_for_version(_version: u32) -> Self {
		WatchMode::Portable
	}
}

/// Whether VCS directories' own ignore files are honored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum VcsIgnoreMode {
	#[default]
	Default,
	Ignore,
	Propagate,
}

impl VcsIgnoreMode {
	pub fn is_default(self) -> bool {
		self == VcsIgnoreMode::Default
	}
}

const DEFAULT_WATCH_POLLING_INTERVAL_SECS: u32 = 10;

/// Unified configuration (spec §3 "Configuration").
///
/// All numeric/string fields use zero/empty as the "unspecified"
/// sentinel so `merge` can apply spec's "higher-priority wins iff
/// non-default" rule uniformly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct Configuration {
	pub synchronization_mode: SynchronizationMode,
	/// 0 means unlimited.
	pub max_entry_count: u64,
	/// 0 means unlimited.
	pub max_staging_file_size: u64,
	pub scan_mode: ScanMode,
	pub stage_mode: StageMode,
	pub symlink_mode: SymlinkMode,
	pub watch_mode: WatchMode,
	/// 0 means unspecified; resolved to `DEFAULT_WATCH_POLLING_INTERVAL_SECS`.
	pub watch_polling_interval: u32,
	pub ignores: Vec<String>,
	/// Deprecated (spec §9): still merged lower-then-higher for backward
	/// compatibility with legacy on-disk configurations, but rejected from
	/// any `ConfigurationSource::Cli` value.
	pub default_ignores: Vec<String>,
	pub ignore_vcs_mode: VcsIgnoreMode,
	/// 0 means unspecified.
	pub default_file_mode: u32,
	/// 0 means unspecified.
	pub default_directory_mode: u32,
	pub default_owner: String,
	pub default_group: String,
}

impl Configuration {
	/// Validate this configuration given the kind of source it came from.
	pub fn validate(&self, source: ConfigurationSource) -> Result<(), String> {
		if !self.default_ignores.is_empty() && source == ConfigurationSource::Cli {
			return Err("default_ignores may not be set from a new-style configuration source"
				.to_string());
		}
		if self.max_staging_file_size > 0 && self.max_staging_file_size < 1024 {
			return Err("max_staging_file_size, if set, must be at least 1024 bytes".to_string());
		}
		for mode_field in [self.default_file_mode, self.default_directory_mode] {
			if mode_field > 0o7777 {
				return Err("file/directory mode must fit in 12 bits".to_string());
			}
		}
		Ok(())
	}

	/// Merge `self` (lower priority) with `overlay` (higher priority),
	/// per spec §3's merging rule.
	pub fn merge(&self, overlay: &Configuration) -> Configuration {
		Configuration {
			synchronization_mode: if overlay.synchronization_mode.is_default() {
				self.synchronization_mode
			} else {
				overlay.synchronization_mode
			},
			max_entry_count: if overlay.max_entry_count == 0 {
				self.max_entry_count
			} else {
				overlay.max_entry_count
			},
			max_staging_file_size: if overlay.max_staging_file_size == 0 {
				self.max_staging_file_size
			} else {
				overlay.max_staging_file_size
			},
			scan_mode: if overlay.scan_mode.is_default() { self.scan_mode } else { overlay.scan_mode },
			stage_mode: if overlay.stage_mode.is_default() {
				self.stage_mode
			} else {
				overlay.stage_mode
			},
			symlink_mode: if overlay.symlink_mode.is_default() {
				self.symlink_mode
			} else {
				overlay.symlink_mode
			},
			watch_mode: if overlay.watch_mode.is_default() {
				self.watch_mode
			} else {
				overlay.watch_mode
			},
			watch_polling_interval: if overlay.watch_polling_interval == 0 {
				self.watch_polling_interval
			} else {
				overlay.watch_polling_interval
			},
			ignores: {
				let mut merged = self.ignores.clone();
				merged.extend(overlay.ignores.iter().cloned());
				merged
			},
			default_ignores: {
				let mut merged = self.default_ignores.clone();
				merged.extend(overlay.default_ignores.iter().cloned());
				merged
			},
			ignore_vcs_mode: if overlay.ignore_vcs_mode.is_default() {
				self.ignore_vcs_mode
			} else {
				overlay.ignore_vcs_mode
			},
			default_file_mode: if overlay.default_file_mode == 0 {
				self.default_file_mode
			} else {
				overlay.default_file_mode
			},
			default_directory_mode: if overlay.default_directory_mode == 0 {
				self.default_directory_mode
			} else {
				overlay.default_directory_mode
			},
			default_owner: if overlay.default_owner.is_empty() {
				self.default_owner.clone()
			} else {
				overlay.default_owner.clone()
			},
			default_group: if overlay.default_group.is_empty() {
				self.default_group.clone()
			} else {
				overlay.default_group.clone()
			},
		}
	}

	/// Resolve every remaining `Default` sentinel to a concrete,
	/// session-version-appropriate value. Called once to build
	/// `mergedAlphaConfiguration` / `mergedBetaConfiguration` (spec §4.6).
	pub fn resolve_defaults(&self, version: u32) -> Configuration {
		let mut resolved = self.clone();
		if resolved.synchronization_mode.is_default() {
			resolved.synchronization_mode = SynchronizationMode::default_for_version(version);
		}
		if resolved.symlink_mode.is_default() {
			resolved.symlink_mode = SymlinkMode::default_for_version(version);
		}
		if resolved.watch_mode.is_default() {
			resolved.watch_mode = WatchMode::default_for_version(version);
		}
		if resolved.watch_polling_interval == 0 {
			resolved.watch_polling_interval = DEFAULT_WATCH_POLLING_INTERVAL_SECS;
		}
		resolved
	}

	/// Ignore patterns in the order spec §4.3 requires them applied: VCS
	/// defaults (if enabled) first, then configured defaults, then
	/// per-session ignores.
	pub fn effective_ignores(&self) -> Vec<String> {
		let mut effective = Vec::new();
		if self.ignore_vcs_mode == VcsIgnoreMode::Ignore {
			effective.extend([".git", ".hg", ".svn"].iter().map(|s| s.to_string()));
		}
		effective.extend(self.default_ignores.iter().cloned());
		effective.extend(self.ignores.iter().cloned());
		effective
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn merge_prefers_nondefault_override() {
		let base = Configuration { max_entry_count: 100, ..Default::default() };
		let overlay = Configuration { max_entry_count: 0, ..Default::default() };
		let merged = base.merge(&overlay);
		assert_eq!(merged.max_entry_count, 100);

		let overlay2 = Configuration { max_entry_count: 5, ..Default::default() };
		let merged2 = base.merge(&overlay2);
		assert_eq!(merged2.max_entry_count, 5);
	}

	#[test]
	fn merge_concatenates_ignores_lower_then_higher() {
		let base = Configuration { ignores: vec!["a".into()], ..Default::default() };
		let overlay = Configuration { ignores: vec!["b".into()], ..Default::default() };
		let merged = base.merge(&overlay);
		assert_eq!(merged.ignores, vec!["a".to_string(), "b".to_string()]);
	}

	#[test]
	fn modern_source_rejects_default_ignores() {
		let cfg = Configuration { default_ignores: vec!["*.bak".into()], ..Default::default() };
		assert!(cfg.validate(ConfigurationSource::Cli).is_err());
		assert!(cfg.validate(ConfigurationSource::File).is_ok());
	}

	#[test]
	fn resolve_defaults_picks_version_defaults() {
		let cfg = Configuration::default();
		let resolved = cfg.resolve_defaults(1);
		assert_eq!(resolved.synchronization_mode, SynchronizationMode::TwoWaySafe);
		assert_eq!(resolved.symlink_mode, SymlinkMode::Portable);
		assert_eq!(resolved.watch_polling_interval, DEFAULT_WATCH_POLLING_INTERVAL_SECS);
	}

	#[test]
	fn effective_ignores_orders_vcs_then_default_then_session() {
		let cfg = Configuration {
			ignore_vcs_mode: VcsIgnoreMode::Ignore,
			default_ignores: vec!["*.log".into()],
			ignores: vec!["node_modules".into()],
			..Default::default()
		};
		let effective = cfg.effective_ignores();
		assert_eq!(effective[0], ".git");
		assert!(effective.contains(&"*.log".to_string()));
		assert_eq!(effective.last().unwrap(), "node_modules");
	}

	#[test]
	fn staging_file_size_floor_enforced() {
		let cfg = Configuration { max_staging_file_size: 10, ..Default::default() };
		assert!(cfg.validate(ConfigurationSource::Default).is_err());
	}
}

// vim: ts=4
