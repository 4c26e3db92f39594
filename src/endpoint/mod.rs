//! Endpoint interface (spec §4.2): the six operations the controller drives
//! uniformly whether the other side is local or remote.
//!
//! [`Receiver`] is the one-shot sink `Stage` hands back and `Supply` drives
//! (spec §4.2 ops 3-4). Its shape is what lets a single `supply()`
//! implementation work unmodified whether the matching `stage()` ran
//! locally (the receiver writes straight into a [`Stager`](crate::stager::Stager))
//! or on a remote peer (the receiver forwards each file's operations over
//! the wire — spec §4.4 "operations stream client to server").

pub mod local;
pub mod remote;

use async_trait::async_trait;

use crate::cancel::CancellationToken;
use crate::config::Configuration;
use crate::error::Result;
use crate::fs::entry::Entry;
use crate::fs::reconcile::{Change, Problem};
use crate::fs::transition::TransitionResult;
use crate::transfer::{RsyncOperation, Signature};

/// Outcome of a successful [`Endpoint::scan`] (spec §4.2 op 2).
pub struct ScanOutcome {
	pub snapshot: Entry,
	pub preserves_executability: bool,
}

/// Outcome of a successful [`Endpoint::stage`] (spec §4.2 op 3).
pub struct StageOutcome {
	/// Ordered subsequence of the requested paths that still need content
	/// (spec §8 "filtered is an ordered subsubsequence of paths").
	pub filtered_paths: Vec<String>,
	pub signatures: Vec<Signature>,
	/// `None` iff `filtered_paths` is empty.
	pub receiver: Option<Box<dyn Receiver>>,
}

/// Outcome of a successful [`Endpoint::transition`] (spec §4.2 op 5).
pub struct TransitionOutcome {
	pub results: Vec<TransitionResult>,
	pub problems: Vec<Problem>,
	/// True iff at least one transition failed because the stager lacked an
	/// expected file (spec: "indicative of concurrent modification during
	/// staging").
	pub missing_files: bool,
}

/// One-shot sink for the content [`Endpoint::supply`] produces (spec §4.2
/// op 3's `receiver`). Must be fully driven — one [`Receiver::receive`] call
/// per filtered path, in order — before [`Receiver::finish`].
#[async_trait]
pub trait Receiver: Send {
	/// Deliver the reconstruction operations for one path, in the same
	/// order `Stage`'s `filtered_paths` listed it. The stager's own
	/// content addressing (spec §4.1) is what ultimately verifies content:
	/// if the reconstructed bytes don't hash to the digest `Transition`
	/// later expects, the file simply never lands at that digest's path
	/// and surfaces as `missingFiles` (spec: "indicative of concurrent
	/// modification during staging") rather than as an error here.
	async fn receive(&mut self, path: &str, ops: Vec<RsyncOperation>) -> Result<()>;

	/// Signal that every filtered path has been delivered.
	async fn finish(self: Box<Self>) -> Result<()>;
}

/// The six-operation contract (spec §4.2). Implementations are either
/// [`local::LocalEndpoint`] or a [`remote::client::RemoteEndpointClient`].
///
/// Per spec: operations other than `shutdown` are never invoked
/// concurrently with each other on the same endpoint; the controller
/// enforces that by construction (it serializes Stage/Transition around a
/// single synchronize cycle per side).
#[async_trait]
pub trait Endpoint: Send + Sync {
	/// Block until a change event fires, `cancel` is cancelled, or a fatal
	/// error occurs. Spurious wakeups are allowed.
	async fn poll(&self, cancel: CancellationToken) -> Result<()>;

	/// Produce a validated entry tree. `force_full` bypasses any
	/// acceleration cache.
	async fn scan(&self, ancestor: &Entry, force_full: bool) -> Result<ScanOutcome>;

	/// Request that `paths` (each with its expected `digests[i]`) become
	/// available for transition, filtering out anything already locally
	/// available.
	async fn stage(&self, paths: &[String], digests: &[Vec<u8>]) -> Result<StageOutcome>;

	/// Read the content of `paths` locally and write reconstruction
	/// operations computed against `signatures[i]` into `receiver`.
	async fn supply(
		&self,
		paths: &[String],
		signatures: &[Signature],
		receiver: Box<dyn Receiver>,
	) -> Result<()>;

	/// Apply `transitions` atomically, one file at a time.
	async fn transition(&self, transitions: &[Change]) -> Result<TransitionOutcome>;

	/// Release all resources. Concurrency-safe; preempts any other
	/// in-flight call on a remote endpoint by closing its transport.
	async fn shutdown(&self) -> Result<()>;
}

/// Parameters an [`Endpoint`] is constructed from (spec §4.4 handshake
/// `initialize` fields, §4.5 dial handler signature).
#[derive(Debug, Clone)]
pub struct EndpointParams {
	pub session_id: String,
	pub version: u32,
	pub root: String,
	pub configuration: Configuration,
	pub alpha: bool,
}

// vim: ts=4
