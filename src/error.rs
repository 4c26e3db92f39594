//! Unified error type for the synchronization core
//!
//! Mirrors the error model of spec §7: validation errors never reach the
//! loop, transient ("try again") endpoint errors are non-fatal, everything
//! else contaminates the endpoint or aborts the cycle. Every error that
//! crosses a stage boundary is wrapped with a short prefix identifying
//! that stage, so `LastError` text stays stable across the codebase.

use std::error::Error;
use std::fmt;
use std::io;

/// Top level error type returned by every public operation in this crate.
#[derive(Debug)]
pub enum SyncError {
	/// Wraps an I/O failure with the stage that observed it.
	Io { stage: &'static str, source: io::Error },

	/// A value failed validation before it could be used (configuration,
	/// session record, selection). Never reaches the synchronize loop.
	Validation { message: String },

	/// An endpoint operation failed. `try_again` mirrors spec §4.2's
	/// `tryAgainFlag`: true means the caller should retry without treating
	/// this as fatal.
	Endpoint { stage: &'static str, message: String, try_again: bool },

	/// A wire-protocol framing or decode error on a remote endpoint.
	Wire { message: String },

	/// Persistence (session record / ancestor / cache) failed.
	Persistence { what: &'static str, source: Box<dyn Error + Send + Sync> },

	/// The staging subsystem could not service a request.
	Stager { message: String },

	/// A lock could not be acquired.
	LockFailed { message: String },

	/// The operation observed cancellation at a suspension point.
	Cancelled,

	/// A safety halt was triggered (root deletion / root type change).
	SafetyHalt { message: String },

	/// Operation rejected because the controller is disabled or paused.
	Rejected { message: String },

	/// Catch-all for conditions the other variants don't model.
	Other { message: String },
}

impl fmt::Display for SyncError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			SyncError::Io { stage, source } => write!(f, "{stage}: I/O error: {source}"),
			SyncError::Validation { message } => write!(f, "validation error: {message}"),
			SyncError::Endpoint { stage, message, .. } => write!(f, "{stage}: {message}"),
			SyncError::Wire { message } => write!(f, "wire protocol error: {message}"),
			SyncError::Persistence { what, source } => write!(f, "{what}: {source}"),
			SyncError::Stager { message } => write!(f, "stager error: {message}"),
			SyncError::LockFailed { message } => write!(f, "lock failed: {message}"),
			SyncError::Cancelled => write!(f, "cancelled"),
			SyncError::SafetyHalt { message } => write!(f, "{message}"),
			SyncError::Rejected { message } => write!(f, "{message}"),
			SyncError::Other { message } => write!(f, "{message}"),
		}
	}
}

impl Error for SyncError {}

impl SyncError {
	/// Wrap an I/O error with the stage name that observed it, matching
	/// spec §7's "always wrapped with a short prefix" propagation policy.
	pub fn io(stage: &'static str, source: io::Error) -> Self {
		SyncError::Io { stage, source }
	}

	pub fn endpoint(stage: &'static str, message: impl Into<String>) -> Self {
		SyncError::Endpoint { stage, message: message.into(), try_again: false }
	}

	pub fn endpoint_try_again(stage: &'static str, message: impl Into<String>) -> Self {
		SyncError::Endpoint { stage, message: message.into(), try_again: true }
	}

	/// True iff this error is a non-fatal "try again" recommendation
	/// (spec §4.2, §7).
	pub fn is_try_again(&self) -> bool {
		matches!(self, SyncError::Endpoint { try_again: true, .. })
	}

	/// True iff this is the stager's *not-staged* failure (spec §4.1
	/// Provide), the signal transition uses to set `missingFilesFlag`.
	pub fn is_not_staged(&self) -> bool {
		matches!(self, SyncError::Stager { message } if message.starts_with("not staged"))
	}

	pub fn stager(message: impl Into<String>) -> Self {
		SyncError::Stager { message: message.into() }
	}

	/// Prefix an existing error with a new stage name, preserving
	/// try-again-ness for endpoint errors. Used when an error crosses a
	/// module boundary that the original site didn't know about.
	pub fn with_stage(self, stage: &'static str) -> Self {
		match self {
			SyncError::Endpoint { message, try_again, .. } => {
				SyncError::Endpoint { stage, message, try_again }
			}
			SyncError::Io { source, .. } => SyncError::Io { stage, source },
			other => SyncError::Other { message: format!("{stage}: {other}") },
		}
	}
}

impl From<io::Error> for SyncError {
	fn from(e: io::Error) -> Self {
		SyncError::Io { stage: "io", source: e }
	}
}

impl From<String> for SyncError {
	fn from(message: String) -> Self {
		SyncError::Other { message }
	}
}

impl From<&str> for SyncError {
	fn from(message: &str) -> Self {
		SyncError::Other { message: message.to_string() }
	}
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn try_again_detection() {
		let e = SyncError::endpoint_try_again("alpha scan", "concurrent modification");
		assert!(e.is_try_again());
		assert_eq!(e.to_string(), "alpha scan: concurrent modification");
	}

	#[test]
	fn non_try_again_endpoint_error() {
		let e = SyncError::endpoint("beta transition", "boom");
		assert!(!e.is_try_again());
	}

	#[test]
	fn with_stage_preserves_try_again() {
		let e = SyncError::endpoint_try_again("scan", "x").with_stage("alpha scan");
		assert!(e.is_try_again());
		assert!(e.to_string().starts_with("alpha scan"));
	}
}

// vim: ts=4
