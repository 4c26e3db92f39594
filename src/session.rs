//! Session identity and persistence (spec §3 "Session record").
//!
//! A [`SessionRecord`] is created once and, other than the `paused` flag,
//! never mutates (spec §3 invariant). Label keys/values are constrained by
//! the same rules used for selector compatibility (spec §3, §4.7), grounded
//! on Kubernetes-style label syntax since that is the "commonly used in
//! orchestration systems" convention spec §4.7 explicitly points at.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::Configuration;

/// The two endpoints of one bidirectional session (spec GLOSSARY).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
	Alpha,
	Beta,
}

impl Side {
	pub fn other(self) -> Side {
		match self {
			Side::Alpha => Side::Beta,
			Side::Beta => Side::Alpha,
		}
	}

	/// Lowercase name used in on-disk paths (spec §6 `caches/<id>_<alpha|beta>`).
	pub fn as_str(self) -> &'static str {
		match self {
			Side::Alpha => "alpha",
			Side::Beta => "beta",
		}
	}
}

impl std::fmt::Display for Side {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.as_str())
	}
}

/// Current on-disk session-record schema version this crate understands
/// (spec §3 "supported version tag").
pub const SESSION_RECORD_VERSION: u32 = 1;

/// Persistent, append-only (except `paused`) record of one session (spec §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
	pub identifier: String,
	pub version: u32,
	pub creation_time_seconds: i64,
	pub creation_time_nanos: u32,
	pub creator_version: String,
	pub alpha_url: String,
	pub beta_url: String,
	pub configuration: Configuration,
	pub configuration_alpha: Option<Configuration>,
	pub configuration_beta: Option<Configuration>,
	pub labels: BTreeMap<String, String>,
	pub paused: bool,
}

impl SessionRecord {
	/// Build a fresh record. `identifier` is expected to already be a
	/// generated UUID string (spec §3 "unique identifier (UUID string)").
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		identifier: String,
		creation_time_seconds: i64,
		creation_time_nanos: u32,
		creator_version: String,
		alpha_url: String,
		beta_url: String,
		configuration: Configuration,
		configuration_alpha: Option<Configuration>,
		configuration_beta: Option<Configuration>,
		labels: BTreeMap<String, String>,
	) -> Self {
		SessionRecord {
			identifier,
			version: SESSION_RECORD_VERSION,
			creation_time_seconds,
			creation_time_nanos,
			creator_version,
			alpha_url,
			beta_url,
			configuration,
			configuration_alpha,
			configuration_beta,
			labels,
			paused: false,
		}
	}

	/// Validate structural invariants: non-empty identifier, supported
	/// version, non-empty endpoint URLs, and well-formed labels (spec §3,
	/// §6 boundary scenario 6 "invalid initialization request").
	pub fn validate(&self) -> Result<(), String> {
		if self.identifier.is_empty() {
			return Err("session identifier must not be empty".to_string());
		}
		if self.version != SESSION_RECORD_VERSION {
			return Err(format!("unsupported session record version {}", self.version));
		}
		if self.alpha_url.is_empty() {
			return Err("alpha endpoint URL must not be empty".to_string());
		}
		if self.beta_url.is_empty() {
			return Err("beta endpoint URL must not be empty".to_string());
		}
		for (key, value) in &self.labels {
			validate_label_key(key)?;
			validate_label_value(value)?;
		}
		Ok(())
	}

	pub fn url(&self, side: Side) -> &str {
		match side {
			Side::Alpha => &self.alpha_url,
			Side::Beta => &self.beta_url,
		}
	}

	pub fn configuration_overlay(&self, side: Side) -> Option<&Configuration> {
		match side {
			Side::Alpha => self.configuration_alpha.as_ref(),
			Side::Beta => self.configuration_beta.as_ref(),
		}
	}
}

const MAX_LABEL_LENGTH: usize = 63;

/// Kubernetes-style label key/value syntax: alphanumerics, `-`, `_`, `.`,
/// must start and end with an alphanumeric, at most 63 characters (spec §3
/// "keys and values constrained by the same rules used elsewhere for
/// selector compatibility").
fn validate_label_segment(segment: &str, what: &str) -> Result<(), String> {
	if segment.is_empty() {
		return Err(format!("{what} must not be empty"));
	}
	if segment.len() > MAX_LABEL_LENGTH {
		return Err(format!("{what} {segment:?} exceeds {MAX_LABEL_LENGTH} characters"));
	}
	let bytes = segment.as_bytes();
	let is_alnum = |b: u8| b.is_ascii_alphanumeric();
	if !is_alnum(bytes[0]) || !is_alnum(bytes[bytes.len() - 1]) {
		return Err(format!("{what} {segment:?} must start and end with an alphanumeric character"));
	}
	if !segment.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')) {
		return Err(format!("{what} {segment:?} contains an invalid character"));
	}
	Ok(())
}

pub fn validate_label_key(key: &str) -> Result<(), String> {
	validate_label_segment(key, "label key")
}

pub fn validate_label_value(value: &str) -> Result<(), String> {
	if value.is_empty() {
		return Ok(());
	}
	validate_label_segment(value, "label value")
}

#[cfg(test)]
mod tests {
	use super::*;

	fn record() -> SessionRecord {
		SessionRecord::new(
			"11111111-1111-1111-1111-111111111111".to_string(),
			0,
			0,
			"test/0.1".to_string(),
			"file:///a".to_string(),
			"file:///b".to_string(),
			Configuration::default(),
			None,
			None,
			BTreeMap::new(),
		)
	}

	#[test]
	fn freshly_created_record_is_unpaused_and_valid() {
		let record = record();
		assert!(!record.paused);
		assert!(record.validate().is_ok());
	}

	#[test]
	fn empty_root_urls_rejected() {
		let mut record = record();
		record.alpha_url = String::new();
		assert!(record.validate().is_err());
	}

	#[test]
	fn label_key_must_be_alphanumeric_bounded() {
		assert!(validate_label_key("env").is_ok());
		assert!(validate_label_key("env.tier-1").is_ok());
		assert!(validate_label_key("-bad").is_err());
		assert!(validate_label_key("").is_err());
	}

	#[test]
	fn empty_label_value_is_allowed() {
		assert!(validate_label_value("").is_ok());
	}

	#[test]
	fn side_other_is_involutive() {
		assert_eq!(Side::Alpha.other(), Side::Beta);
		assert_eq!(Side::Beta.other(), Side::Alpha);
	}
}

// vim: ts=4
