//! Ignore-pattern matching for the local endpoint's scan (spec §4.3, SPEC_FULL
//! §11 "Ignore pattern layering").
//!
//! Patterns are compiled with `globset`, the same crate the teacher uses in
//! its `exclusion::patterns` module. VCS-ignore handling (spec's "VCS
//! defaults prepended when enabled") is layered in by the caller via
//! [`Configuration::effective_ignores`](crate::config::Configuration::effective_ignores)
//! before patterns ever reach this matcher — this module only compiles and
//! matches whatever ordered pattern list it is given.

use globset::{Glob, GlobSet, GlobSetBuilder};

/// Compiled, orderless set of ignore patterns for one scan.
pub struct IgnoreMatcher {
	set: GlobSet,
}

impl IgnoreMatcher {
	/// Compile `patterns` (already ordered VCS-then-default-then-session per
	/// [`Configuration::effective_ignores`](crate::config::Configuration::effective_ignores)).
	/// An invalid pattern is a validation error — it must never reach the
	/// synchronize loop (spec §7).
	pub fn new(patterns: &[String]) -> Result<Self, String> {
		let mut builder = GlobSetBuilder::new();
		for pattern in patterns {
			let glob = Glob::new(pattern).map_err(|e| format!("invalid ignore pattern {pattern:?}: {e}"))?;
			builder.add(glob);
		}
		let set = builder.build().map_err(|e| format!("failed to compile ignore patterns: {e}"))?;
		Ok(IgnoreMatcher { set })
	}

	/// True if `relative_path` (forward-slash separated, no leading slash)
	/// matches any compiled pattern.
	pub fn is_ignored(&self, relative_path: &str) -> bool {
		self.set.is_match(relative_path)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn matches_simple_glob() {
		let matcher = IgnoreMatcher::new(&["*.log".to_string()]).unwrap();
		assert!(matcher.is_ignored("debug.log"));
		assert!(!matcher.is_ignored("debug.txt"));
	}

	#[test]
	fn matches_recursive_glob() {
		let matcher = IgnoreMatcher::new(&["node_modules/**".to_string()]).unwrap();
		assert!(matcher.is_ignored("node_modules/leftpad/index.js"));
		assert!(!matcher.is_ignored("src/node_modules_helper.rs"));
	}

	#[test]
	fn invalid_pattern_is_rejected() {
		assert!(IgnoreMatcher::new(&["[".to_string()]).is_err());
	}
}

// vim: ts=4
