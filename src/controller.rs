//! Session controller (spec §4.6): owns one session's persistent identity,
//! drives its connect/synchronize loop, and exposes the lifecycle
//! operations (`flush`, `resume`, `halt`) the manager calls into.
//!
//! Grounded on the teacher's `sync_impl/mod.rs` state-machine loop (a
//! `Mutex`-guarded status enum advanced by one long-running task per
//! session, with `tracing` spans marking each phase) and its
//! `ProtocolState`-style status reporting, generalized from the teacher's
//! fixed two-phase transfer to this crate's full connect/poll/scan/
//! reconcile/stage/transition cycle.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use crate::cancel::CancellationToken;
use crate::config::Configuration;
use crate::dial::{self, DialParams, Prompter};
use crate::endpoint::{Endpoint, Receiver, TransitionOutcome};
use crate::error::{Result, SyncError};
use crate::fs::entry::Entry;
use crate::fs::reconcile::{self, Change, Conflict, Problem};
use crate::fs::transition;
use crate::logging::{debug, warn};
use crate::paths::{self, Paths};
use crate::session::{Side, SessionRecord};
use crate::tracker::Tracker;
use crate::transfer::RsyncOperation;

/// The controller's state machine (spec §4.6 "Status"). Ordering here is
/// purely presentational; [`Controller::is_at_least_watching`] is the only
/// place that treats variants as ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
	Disconnected,
	ConnectingAlpha,
	ConnectingBeta,
	Watching,
	Scanning,
	WaitingForRescan,
	Reconciling,
	StagingAlpha,
	StagingBeta,
	Transitioning,
	Saving,
	HaltedOnRootDeletion,
	HaltedOnRootTypeChange,
}

/// Progress of an in-flight `Stage`/`Supply` exchange (spec §4.6 "staging
/// status"), published so a watching caller can show progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingStatus {
	pub side: Side,
	pub path: String,
	pub index: u64,
	pub total: u64,
}

/// The mutable half of a controller's state (spec §4.6), guarded by one
/// fine-grained lock that is never held across an `.await` (spec §4.6 "state
/// lock discipline").
#[derive(Debug, Clone)]
struct ControllerState {
	status: Status,
	alpha_connected: bool,
	beta_connected: bool,
	last_error: Option<String>,
	staging_status: Option<StagingStatus>,
	conflicts: Vec<Conflict>,
	alpha_problems: Vec<Problem>,
	beta_problems: Vec<Problem>,
	successful_cycles: u64,
}

impl Default for ControllerState {
	fn default() -> Self {
		ControllerState {
			status: Status::Disconnected,
			alpha_connected: false,
			beta_connected: false,
			last_error: None,
			staging_status: None,
			conflicts: Vec::new(),
			alpha_problems: Vec::new(),
			beta_problems: Vec::new(),
			successful_cycles: 0,
		}
	}
}

/// Read-only snapshot of a controller's state at one instant, returned by
/// the manager's `List` operation (spec §4.7).
#[derive(Debug, Clone)]
pub struct ControllerStateSnapshot {
	pub session_id: String,
	pub alpha_url: String,
	pub beta_url: String,
	pub labels: BTreeMap<String, String>,
	pub paused: bool,
	pub creation_time_seconds: i64,
	pub creation_time_nanos: u32,
	pub status: Status,
	pub alpha_connected: bool,
	pub beta_connected: bool,
	pub last_error: Option<String>,
	pub staging_status: Option<StagingStatus>,
	pub conflicts: Vec<Conflict>,
	pub alpha_problems: Vec<Problem>,
	pub beta_problems: Vec<Problem>,
	pub successful_cycles: u64,
}

/// How [`Controller::halt`] should leave the controller (spec §4.6 "Halt").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltMode {
	/// Stop the loop and persist `paused = true`; `resume` can restart it.
	Pause,
	/// Stop the loop and mark the controller disabled for the rest of the
	/// process's life. The session record is left on disk.
	Shutdown,
	/// Like `Shutdown`, but also removes the session record and ancestor
	/// archive from disk (spec §4.6 "Terminate").
	Terminate,
}

struct RunHandle {
	cancel: CancellationToken,
	join: JoinHandle<()>,
}

struct FlushRequest {
	responder: Option<oneshot::Sender<Result<()>>>,
}

impl FlushRequest {
	fn respond(mut self, result: Result<()>) {
		if let Some(tx) = self.responder.take() {
			let _ = tx.send(result);
		}
	}
}

/// One session's identity, derived configuration, and running
/// connect/synchronize loop (spec §4.6).
pub struct Controller {
	session_id: String,
	version: u32,
	alpha_url: String,
	beta_url: String,
	labels: BTreeMap<String, String>,
	creation_time_seconds: i64,
	creation_time_nanos: u32,

	paths: Paths,
	tracker: Tracker,

	merged_alpha: Configuration,
	merged_beta: Configuration,

	paused: AtomicBool,
	prompter: StdMutex<Prompter>,

	state: StdMutex<ControllerState>,
	disabled: AtomicBool,

	lifecycle_lock: AsyncMutex<()>,
	run: AsyncMutex<Option<RunHandle>>,

	flush_tx: mpsc::Sender<FlushRequest>,
	flush_rx: AsyncMutex<mpsc::Receiver<FlushRequest>>,
}

impl Controller {
	/// Build a controller from a validated [`SessionRecord`]. Does not start
	/// the loop; call [`Controller::start`] once the controller is
	/// registered (spec §4.7 "Create").
	pub fn new(record: SessionRecord, paths: Paths, tracker: Tracker) -> Arc<Self> {
		let merged_alpha = record
			.configuration
			.merge(record.configuration_overlay(Side::Alpha).unwrap_or(&Configuration::default()))
			.resolve_defaults(record.version);
		let merged_beta = record
			.configuration
			.merge(record.configuration_overlay(Side::Beta).unwrap_or(&Configuration::default()))
			.resolve_defaults(record.version);

		let (flush_tx, flush_rx) = mpsc::channel(1);

		Arc::new(Controller {
			session_id: record.identifier,
			version: record.version,
			alpha_url: record.alpha_url,
			beta_url: record.beta_url,
			labels: record.labels,
			creation_time_seconds: record.creation_time_seconds,
			creation_time_nanos: record.creation_time_nanos,
			paths,
			tracker,
			merged_alpha,
			merged_beta,
			paused: AtomicBool::new(record.paused),
			prompter: StdMutex::new(String::new()),
			state: StdMutex::new(ControllerState::default()),
			disabled: AtomicBool::new(false),
			lifecycle_lock: AsyncMutex::new(()),
			run: AsyncMutex::new(None),
			flush_tx,
			flush_rx: AsyncMutex::new(flush_rx),
		})
	}

	pub fn session_id(&self) -> &str {
		&self.session_id
	}

	pub fn alpha_url(&self) -> &str {
		&self.alpha_url
	}

	pub fn beta_url(&self) -> &str {
		&self.beta_url
	}

	pub fn labels(&self) -> &BTreeMap<String, String> {
		&self.labels
	}

	/// Start the loop if the session was not left paused or disabled (spec
	/// §4.7 startup: "construct a controller per record ... start it unless
	/// it is paused").
	pub async fn start(self: &Arc<Self>) {
		if self.disabled.load(Ordering::SeqCst) || self.paused.load(Ordering::SeqCst) {
			return;
		}
		self.spawn_loop(None, None).await;
	}

	async fn spawn_loop(self: &Arc<Self>, alpha: Option<Box<dyn Endpoint>>, beta: Option<Box<dyn Endpoint>>) {
		let cancel = CancellationToken::new();
		let controller = Arc::clone(self);
		let cancel_for_task = cancel.clone();
		let join = tokio::spawn(async move {
			controller.run(alpha, beta, cancel_for_task).await;
		});
		*self.run.lock().await = Some(RunHandle { cancel, join });
	}

	async fn cancel_and_join_run(&self) {
		let handle = self.run.lock().await.take();
		if let Some(handle) = handle {
			handle.cancel.cancel();
			let _ = handle.join.await;
		}
	}

	fn is_at_least_watching(&self) -> bool {
		matches!(
			self.state.lock().expect("controller state lock poisoned").status,
			Status::Watching
				| Status::Scanning | Status::WaitingForRescan
				| Status::Reconciling
				| Status::StagingAlpha
				| Status::StagingBeta
				| Status::Transitioning
				| Status::Saving
		)
	}

	fn mutate_state<R>(&self, f: impl FnOnce(&mut ControllerState) -> R) -> R {
		let result = {
			let mut guard = self.state.lock().expect("controller state lock poisoned");
			f(&mut guard)
		};
		self.tracker.notify_change();
		result
	}

	fn set_status(&self, status: Status) {
		self.mutate_state(|s| s.status = status);
	}

	fn set_connected(&self, side: Side, connected: bool) {
		self.mutate_state(|s| match side {
			Side::Alpha => s.alpha_connected = connected,
			Side::Beta => s.beta_connected = connected,
		});
	}

	fn set_last_error(&self, message: Option<String>) {
		self.mutate_state(|s| s.last_error = message);
	}

	fn set_staging_status(&self, status: Option<StagingStatus>) {
		self.mutate_state(|s| s.staging_status = status);
	}

	fn publish_problems(&self, side: Side, problems: Vec<Problem>) {
		self.mutate_state(|s| match side {
			Side::Alpha => s.alpha_problems = problems,
			Side::Beta => s.beta_problems = problems,
		});
	}

	fn publish_conflicts(&self, conflicts: Vec<Conflict>) {
		self.mutate_state(|s| s.conflicts = conflicts);
	}

	fn increment_successful_cycles(&self) {
		self.mutate_state(|s| s.successful_cycles += 1);
	}

	/// A read-only snapshot of this controller's current state (spec §4.7
	/// `List`).
	pub fn state_snapshot(&self) -> ControllerStateSnapshot {
		let state = self.state.lock().expect("controller state lock poisoned").clone();
		ControllerStateSnapshot {
			session_id: self.session_id.clone(),
			alpha_url: self.alpha_url.clone(),
			beta_url: self.beta_url.clone(),
			labels: self.labels.clone(),
			paused: self.paused.load(Ordering::SeqCst),
			creation_time_seconds: self.creation_time_seconds,
			creation_time_nanos: self.creation_time_nanos,
			status: state.status,
			alpha_connected: state.alpha_connected,
			beta_connected: state.beta_connected,
			last_error: state.last_error,
			staging_status: state.staging_status,
			conflicts: state.conflicts,
			alpha_problems: state.alpha_problems,
			beta_problems: state.beta_problems,
			successful_cycles: state.successful_cycles,
		}
	}

	/// Request that the current poll wait (if any) be interrupted so a new
	/// cycle starts immediately (spec §4.6 "Flush"). `skip_wait = true`
	/// mirrors a watcher-triggered wakeup: fire-and-forget, coalescing with
	/// any already-pending flush. `skip_wait = false` waits for that cycle
	/// to actually complete (or fail) before returning.
	pub async fn flush(&self, skip_wait: bool, cancel: CancellationToken) -> Result<()> {
		if self.disabled.load(Ordering::SeqCst) {
			return Err(SyncError::Rejected { message: "controller is disabled".into() });
		}
		if skip_wait {
			let _ = self.flush_tx.try_send(FlushRequest { responder: None });
			return Ok(());
		}

		let (tx, rx) = oneshot::channel();
		tokio::select! {
			_ = cancel.cancelled() => return Err(SyncError::Cancelled),
			sent = self.flush_tx.send(FlushRequest { responder: Some(tx) }) => {
				if sent.is_err() {
					return Err(SyncError::Rejected { message: "controller loop is not running".into() });
				}
			}
		}
		tokio::select! {
			_ = cancel.cancelled() => Err(SyncError::Cancelled),
			result = rx => match result {
				Ok(outcome) => outcome,
				Err(_) => Err(SyncError::Rejected { message: "controller loop exited before flush completed".into() }),
			},
		}
	}

	/// Restart (or start) the synchronize loop (spec §4.6 "Resume"). A
	/// no-op if a loop is already running past the initial connect phase.
	pub async fn resume(self: &Arc<Self>, prompter: Prompter) -> Result<()> {
		if self.disabled.load(Ordering::SeqCst) {
			return Err(SyncError::Rejected { message: "controller is disabled".into() });
		}
		*self.prompter.lock().expect("controller prompter lock poisoned") = prompter;
		let _lifecycle = self.lifecycle_lock.lock().await;

		let already_running = self.run.lock().await.is_some();
		if already_running && self.is_at_least_watching() {
			return Ok(());
		}
		self.cancel_and_join_run().await;

		self.paused.store(false, Ordering::SeqCst);
		self.persist_paused(false).await?;

		let alpha = match self.connect_side(Side::Alpha, CancellationToken::new()).await {
			Ok(endpoint) => {
				self.set_connected(Side::Alpha, true);
				Some(endpoint)
			}
			Err(e) => {
				self.set_connected(Side::Alpha, false);
				self.set_last_error(Some(e.to_string()));
				None
			}
		};
		let beta = match self.connect_side(Side::Beta, CancellationToken::new()).await {
			Ok(endpoint) => {
				self.set_connected(Side::Beta, true);
				Some(endpoint)
			}
			Err(e) => {
				self.set_connected(Side::Beta, false);
				self.set_last_error(Some(e.to_string()));
				None
			}
		};

		self.spawn_loop(alpha, beta).await;
		Ok(())
	}

	/// Stop the loop and leave the controller in `mode` (spec §4.6 "Halt").
	pub async fn halt(self: &Arc<Self>, mode: HaltMode) -> Result<()> {
		if self.disabled.load(Ordering::SeqCst) {
			return Err(SyncError::Rejected { message: "controller is disabled".into() });
		}
		let _lifecycle = self.lifecycle_lock.lock().await;
		self.cancel_and_join_run().await;

		match mode {
			HaltMode::Pause => {
				self.paused.store(true, Ordering::SeqCst);
				self.persist_paused(true).await?;
			}
			HaltMode::Shutdown => {
				self.disabled.store(true, Ordering::SeqCst);
			}
			HaltMode::Terminate => {
				self.disabled.store(true, Ordering::SeqCst);
				remove_if_exists(&self.paths.session_path(&self.session_id)).await?;
				remove_if_exists(&self.paths.archive_path(&self.session_id)).await?;
			}
		}
		self.tracker.notify_change();
		Ok(())
	}

	async fn persist_paused(&self, paused: bool) -> Result<()> {
		// The session record's only mutable field is `paused` (spec §3); we
		// don't keep the full record in memory, so round-trip it through
		// disk rather than widen this controller's state with a copy that
		// could drift.
		let path = self.paths.session_path(&self.session_id);
		let bytes = tokio::fs::read(&path)
			.await
			.map_err(|e| SyncError::io("controller: read session record", e))?;
		let mut record: SessionRecord =
			serde_json::from_slice(&bytes).map_err(|e| SyncError::Persistence { what: "session record", source: Box::new(e) })?;
		record.paused = paused;
		let encoded = serde_json::to_vec_pretty(&record)
			.map_err(|e| SyncError::Persistence { what: "session record", source: Box::new(e) })?;
		paths::atomic_write(&path, &encoded).await.map_err(|e| SyncError::io("controller: persist session record", e))
	}

	async fn connect_side(&self, side: Side, cancel: CancellationToken) -> Result<Box<dyn Endpoint>> {
		let (url, configuration) = match side {
			Side::Alpha => (&self.alpha_url, &self.merged_alpha),
			Side::Beta => (&self.beta_url, &self.merged_beta),
		};
		let params = DialParams {
			location: url.clone(),
			prompter: self.prompter.lock().expect("controller prompter lock poisoned").clone(),
			session_id: self.session_id.clone(),
			version: self.version,
			configuration: configuration.clone(),
			alpha: side == Side::Alpha,
			cache_path: self.paths.cache_path(&self.session_id, side),
			staging_root: self.paths.staging_root(&self.session_id, side),
		};
		dial::reconnect(cancel, params).await
	}

	/// The connect loop (spec §4.6): (re)connect both sides, run one
	/// synchronize session to completion, shut both endpoints down, and
	/// retry after a delay until cancelled.
	async fn run(self: Arc<Self>, mut alpha: Option<Box<dyn Endpoint>>, mut beta: Option<Box<dyn Endpoint>>, cancel: CancellationToken) {
		loop {
			if cancel.is_cancelled() {
				shutdown_endpoint(alpha.take()).await;
				shutdown_endpoint(beta.take()).await;
				return;
			}

			if alpha.is_none() {
				self.set_status(Status::ConnectingAlpha);
				match self.connect_side(Side::Alpha, cancel.child_token()).await {
					Ok(endpoint) => {
						alpha = Some(endpoint);
						self.set_connected(Side::Alpha, true);
					}
					Err(e) => {
						self.set_connected(Side::Alpha, false);
						self.set_last_error(Some(e.to_string()));
					}
				}
			}
			if beta.is_none() {
				self.set_status(Status::ConnectingBeta);
				match self.connect_side(Side::Beta, cancel.child_token()).await {
					Ok(endpoint) => {
						beta = Some(endpoint);
						self.set_connected(Side::Beta, true);
					}
					Err(e) => {
						self.set_connected(Side::Beta, false);
						self.set_last_error(Some(e.to_string()));
					}
				}
			}

			if alpha.is_none() || beta.is_none() {
				self.set_status(Status::Disconnected);
				if Self::sleep_cancellable(Duration::from_secs(30), &cancel).await.is_err() {
					shutdown_endpoint(alpha.take()).await;
					shutdown_endpoint(beta.take()).await;
					return;
				}
				continue;
			}

			let a = alpha.take().expect("checked above");
			let b = beta.take().expect("checked above");
			let outcome = self.synchronize(a.as_ref(), b.as_ref(), cancel.clone()).await;
			shutdown_endpoint(Some(a)).await;
			shutdown_endpoint(Some(b)).await;
			self.set_connected(Side::Alpha, false);
			self.set_connected(Side::Beta, false);

			match outcome {
				Ok(()) => {}
				Err(SyncError::Cancelled) => {
					self.set_status(Status::Disconnected);
					return;
				}
				Err(e) => {
					warn!(session = %self.session_id, error = %e, "synchronize cycle ended with an error");
					self.set_last_error(Some(e.to_string()));
					self.fail_pending_flush(e).await;
				}
			}

			self.set_status(Status::Disconnected);
			if cancel.is_cancelled() {
				return;
			}
			if Self::sleep_cancellable(Duration::from_secs(30), &cancel).await.is_err() {
				return;
			}
		}
	}

	async fn sleep_cancellable(duration: Duration, cancel: &CancellationToken) -> std::result::Result<(), ()> {
		tokio::select! {
			_ = tokio::time::sleep(duration) => Ok(()),
			_ = cancel.cancelled() => Err(()),
		}
	}

	async fn fail_pending_flush(&self, error: SyncError) {
		if let Some(request) = self.flush_rx.lock().await.try_recv().ok() {
			request.respond(Err(SyncError::Other { message: error.to_string() }));
		}
	}

	/// One connected session's worth of cycles (spec §4.6 steps 1-16). Runs
	/// until cancellation, a safety halt, or a fatal error; returns that
	/// outcome to the connect loop, which reconnects from scratch.
	async fn synchronize(self: &Arc<Self>, alpha: &dyn Endpoint, beta: &dyn Endpoint, cancel: CancellationToken) -> Result<()> {
		let mut force_cycle = true;
		let mut previous_was_forced_retry = false;
		let mut cycle_forced_by_missing_files = false;

		loop {
			if cancel.is_cancelled() {
				return Err(SyncError::Cancelled);
			}

			// Step 1: clear the previous cycle's error.
			self.set_last_error(None);

			// Step 2: load and validate the ancestor.
			let ancestor = self.load_ancestor().await?;

			let sync_mode = self.merged_alpha.synchronization_mode;

			// Steps 4-5: poll, unless this cycle was forced (startup, a
			// prior tryAgain, or a just-serviced flush).
			let do_poll = !force_cycle;
			force_cycle = false;
			let mut flush_request = None;
			if do_poll {
				self.set_status(Status::Watching);
				match self.poll_both(alpha, beta, &cancel).await? {
					PollOutcome::Woke => {}
					PollOutcome::Flush(request) => flush_request = Some(request),
				}
			} else if let Ok(request) = self.flush_rx.lock().await.try_recv() {
				flush_request = Some(request);
			}
			let force_full_scan = flush_request.is_some();

			// Step 6: scan both sides concurrently.
			self.set_status(Status::Scanning);
			let (alpha_scan, beta_scan) =
				tokio::join!(alpha.scan(&ancestor, force_full_scan), beta.scan(&ancestor, force_full_scan));

			let (mut alpha_snapshot, alpha_preserves_exec) = match alpha_scan {
				Ok(o) => (o.snapshot, o.preserves_executability),
				Err(e) if e.is_try_again() => {
					self.retry_after_try_again(&mut previous_was_forced_retry, &cancel, e, flush_request).await?;
					force_cycle = true;
					continue;
				}
				Err(e) => {
					if let Some(req) = flush_request {
						req.respond(Err(SyncError::Other { message: e.to_string() }));
					}
					return Err(e);
				}
			};
			let (mut beta_snapshot, beta_preserves_exec) = match beta_scan {
				Ok(o) => (o.snapshot, o.preserves_executability),
				Err(e) if e.is_try_again() => {
					self.retry_after_try_again(&mut previous_was_forced_retry, &cancel, e, flush_request).await?;
					force_cycle = true;
					continue;
				}
				Err(e) => {
					if let Some(req) = flush_request {
						req.respond(Err(SyncError::Other { message: e.to_string() }));
					}
					return Err(e);
				}
			};
			previous_was_forced_retry = false;

			// Step 7: cross-propagate executability when one side can't
			// preserve it (spec §4.3).
			if !alpha_preserves_exec {
				propagate_executability(&ancestor, &mut alpha_snapshot);
			}
			if !beta_preserves_exec {
				propagate_executability(&ancestor, &mut beta_snapshot);
			}

			// Step 8: reconcile.
			self.set_status(Status::Reconciling);
			let reconciled = reconcile::reconcile(&ancestor, &alpha_snapshot, &beta_snapshot, sync_mode);
			self.publish_conflicts(reconciled.conflicts.clone());

			// Step 9: safety halts on root deletion / root type change.
			if let Some(halt_status) = root_safety_halt(&ancestor, &reconciled.alpha_transitions, &reconciled.beta_transitions) {
				self.set_status(halt_status);
				if let Some(req) = flush_request {
					req.respond(Err(SyncError::SafetyHalt {
						message: "cancelled while halted on root deletion".to_string(),
					}));
				}
				cancel.cancelled().await;
				return Err(SyncError::SafetyHalt { message: "cancelled while halted on root deletion".to_string() });
			}

			// Steps 10-11: stage each side from the other.
			let stage_result = async {
				self.stage_side(alpha, beta, &reconciled.alpha_transitions, Side::Alpha, Status::StagingAlpha, &cancel)
					.await?;
				self.stage_side(beta, alpha, &reconciled.beta_transitions, Side::Beta, Status::StagingBeta, &cancel)
					.await
			}
			.await;
			if let Err(e) = stage_result {
				if let Some(req) = flush_request {
					req.respond(Err(SyncError::Other { message: e.to_string() }));
				}
				return Err(e);
			}

			// Step 12: transition both sides concurrently.
			self.set_status(Status::Transitioning);
			let (alpha_transitioned, beta_transitioned) = tokio::join!(
				maybe_transition(alpha, &reconciled.alpha_transitions),
				maybe_transition(beta, &reconciled.beta_transitions),
			);

			// Step 13: fold successful transitions into the ancestor and
			// persist it, regardless of whether either side errored.
			self.set_status(Status::Saving);
			let mut ancestor_changes = reconciled.ancestor_changes;
			let mut missing_files = false;
			let mut transition_error = None;

			match alpha_transitioned {
				Some(Ok(outcome)) => {
					missing_files |= outcome.missing_files;
					self.publish_problems(Side::Alpha, outcome.problems);
					ancestor_changes.extend(outcome.results.into_iter().map(|r| Change { path: r.path, new: r.new }));
				}
				Some(Err(e)) => transition_error = Some(e),
				None => {}
			}
			match beta_transitioned {
				Some(Ok(outcome)) => {
					missing_files |= outcome.missing_files;
					self.publish_problems(Side::Beta, outcome.problems);
					ancestor_changes.extend(outcome.results.into_iter().map(|r| Change { path: r.path, new: r.new }));
				}
				Some(Err(e)) => transition_error = transition_error.or(Some(e)),
				None => {}
			}

			let new_ancestor = transition::apply(&ancestor, &ancestor_changes);
			new_ancestor
				.validate()
				.map_err(|e| SyncError::Validation { message: format!("ancestor validation after transition: {e}") })?;
			self.persist_ancestor(&new_ancestor).await?;

			// Step 14: surface a transition-level error as fatal, now that
			// the ancestor reflects everything that did succeed.
			if let Some(e) = transition_error {
				if let Some(req) = flush_request {
					req.respond(Err(SyncError::Other { message: e.to_string() }));
				}
				return Err(e);
			}

			// Step 15: a missing-files condition earns exactly one retry
			// cycle without waiting on the watcher again.
			if missing_files && !cycle_forced_by_missing_files {
				force_cycle = true;
				cycle_forced_by_missing_files = true;
			} else {
				cycle_forced_by_missing_files = false;
			}

			// Step 16: this cycle succeeded.
			self.increment_successful_cycles();
			if let Some(req) = flush_request {
				req.respond(Ok(()));
			}
		}
	}

	async fn retry_after_try_again(
		&self,
		previous_was_forced_retry: &mut bool,
		cancel: &CancellationToken,
		error: SyncError,
		flush_request: Option<FlushRequest>,
	) -> Result<()> {
		self.set_status(Status::WaitingForRescan);
		self.set_last_error(Some(error.to_string()));
		if let Some(req) = flush_request {
			// A flush that landed on a tryAgain cycle stays pending; the
			// forced rescan this triggers will pick it up on completion by
			// simply not having consumed it -- push it back for the next
			// iteration to see.
			let _ = self.flush_tx.try_send(req);
		}
		if *previous_was_forced_retry {
			if Self::sleep_cancellable(Duration::from_secs(5), cancel).await.is_err() {
				return Err(SyncError::Cancelled);
			}
		}
		*previous_was_forced_retry = true;
		Ok(())
	}

	async fn load_ancestor(&self) -> Result<Entry> {
		let path = self.paths.archive_path(&self.session_id);
		match tokio::fs::read(&path).await {
			Ok(bytes) => {
				let ancestor = Entry::decode_deterministic(&bytes)
					.map_err(|e| SyncError::Persistence { what: "ancestor archive", source: Box::new(e) })?;
				ancestor.validate().map_err(|e| SyncError::Validation { message: e.to_string() })?;
				Ok(ancestor)
			}
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(crate::fs::entry::empty_directory()),
			Err(e) => Err(SyncError::io("controller: load ancestor", e)),
		}
	}

	async fn persist_ancestor(&self, ancestor: &Entry) -> Result<()> {
		let path = self.paths.archive_path(&self.session_id);
		let encoded = ancestor.encode_deterministic();
		paths::atomic_write(&path, &encoded).await.map_err(|e| SyncError::io("controller: persist ancestor", e))
	}

	async fn poll_both(&self, alpha: &dyn Endpoint, beta: &dyn Endpoint, outer_cancel: &CancellationToken) -> Result<PollOutcome> {
		let poll_cancel = outer_cancel.child_token();
		let event = {
			let mut flush_rx = self.flush_rx.lock().await;
			tokio::select! {
				result = alpha.poll(poll_cancel.clone()) => PollEvent::Alpha(result),
				result = beta.poll(poll_cancel.clone()) => PollEvent::Beta(result),
				request = flush_rx.recv() => match request {
					Some(request) => PollEvent::Flush(request),
					None => PollEvent::Cancelled,
				},
				_ = outer_cancel.cancelled() => PollEvent::Cancelled,
			}
		};
		poll_cancel.cancel();

		match event {
			PollEvent::Alpha(result) => {
				result?;
				let _ = beta.poll(poll_cancel).await;
				Ok(PollOutcome::Woke)
			}
			PollEvent::Beta(result) => {
				result?;
				let _ = alpha.poll(poll_cancel).await;
				Ok(PollOutcome::Woke)
			}
			PollEvent::Flush(request) => {
				let _ = tokio::join!(alpha.poll(poll_cancel.clone()), beta.poll(poll_cancel));
				Ok(PollOutcome::Flush(request))
			}
			PollEvent::Cancelled => {
				let _ = tokio::join!(alpha.poll(poll_cancel.clone()), beta.poll(poll_cancel));
				Err(SyncError::Cancelled)
			}
		}
	}

	/// Stage `target`'s transitions, supplying any filtered-in content from
	/// `source` (spec §4.6 steps 10-11, §4.2 ops 3-4).
	async fn stage_side(
		self: &Arc<Self>,
		target: &dyn Endpoint,
		source: &dyn Endpoint,
		transitions: &[Change],
		side: Side,
		status: Status,
		cancel: &CancellationToken,
	) -> Result<()> {
		let mut paths = Vec::new();
		let mut digests = Vec::new();
		for change in transitions {
			if let Some(Entry::File { digest, .. }) = &change.new {
				paths.push(change.path.clone());
				digests.push(digest.clone());
			}
		}
		if paths.is_empty() {
			return Ok(());
		}

		self.set_status(status);
		let outcome = target.stage(&paths, &digests).await?;
		if !is_ordered_subsequence(&paths, &outcome.filtered_paths) {
			return Err(SyncError::Other {
				message: "stage returned a filtered path list that is not an ordered subsequence of the request".into(),
			});
		}
		if outcome.filtered_paths.is_empty() {
			return Ok(());
		}
		let receiver = outcome
			.receiver
			.ok_or_else(|| SyncError::Other { message: "stage reported paths needing content but returned no receiver".into() })?;

		let total = outcome.filtered_paths.len() as u64;
		let wrapped: Box<dyn Receiver> = Box::new(PreemptableReceiver {
			inner: Box::new(MonitoringReceiver { inner: receiver, controller: Arc::clone(self), side, total, done: 0 }),
			cancel: cancel.clone(),
		});
		source.supply(&outcome.filtered_paths, &outcome.signatures, wrapped).await?;
		self.set_staging_status(None);
		Ok(())
	}
}

enum PollEvent {
	Alpha(Result<()>),
	Beta(Result<()>),
	Flush(FlushRequest),
	Cancelled,
}

enum PollOutcome {
	Woke,
	Flush(FlushRequest),
}

async fn shutdown_endpoint(endpoint: Option<Box<dyn Endpoint>>) {
	if let Some(endpoint) = endpoint {
		if let Err(e) = endpoint.shutdown().await {
			debug!(error = %e, "endpoint shutdown reported an error");
		}
	}
}

async fn maybe_transition(endpoint: &dyn Endpoint, transitions: &[Change]) -> Option<Result<TransitionOutcome>> {
	if transitions.is_empty() {
		return None;
	}
	Some(endpoint.transition(transitions).await)
}

/// Copy executable bits from `template` onto matching file paths in
/// `snapshot` (spec §4.3: a remote endpoint that can't preserve
/// executability has it "propagated from the ancestor to the snapshot").
fn propagate_executability(template: &Entry, snapshot: &mut Entry) {
	match (template, snapshot) {
		(Entry::Directory { contents: template_contents }, Entry::Directory { contents: snapshot_contents }) => {
			for (name, child) in snapshot_contents.iter_mut() {
				if let Some(template_child) = template_contents.get(name) {
					propagate_executability(template_child, child);
				}
			}
		}
		(Entry::File { executable: template_exec, .. }, Entry::File { executable: snapshot_exec, .. }) => {
			*snapshot_exec = *template_exec;
		}
		_ => {}
	}
}

fn entry_kind(entry: &Entry) -> u8 {
	match entry {
		Entry::Directory { .. } => 0,
		Entry::File { .. } => 1,
		Entry::Symlink { .. } => 2,
	}
}

/// Detect a root deletion or root type change among either side's
/// transitions (spec §4.6 step 9). Root-level changes always carry the
/// empty path (spec §4.2 op 5, `fs::reconcile` "root deletion surfaces as
/// empty-path transition").
fn root_safety_halt(ancestor: &Entry, alpha_transitions: &[Change], beta_transitions: &[Change]) -> Option<Status> {
	for change in alpha_transitions.iter().chain(beta_transitions.iter()) {
		if !change.path.is_empty() {
			continue;
		}
		match &change.new {
			None => return Some(Status::HaltedOnRootDeletion),
			Some(new_root) if entry_kind(new_root) != entry_kind(ancestor) => return Some(Status::HaltedOnRootTypeChange),
			_ => {}
		}
	}
	None
}

/// True iff `filtered` appears in `full` in order, possibly with gaps
/// (spec §8 "filtered is an ordered subsequence of paths").
fn is_ordered_subsequence(full: &[String], filtered: &[String]) -> bool {
	let mut it = full.iter();
	for path in filtered {
		match it.by_ref().find(|p| *p == path) {
			Some(_) => {}
			None => return false,
		}
	}
	true
}

async fn remove_if_exists(path: &std::path::Path) -> Result<()> {
	match tokio::fs::remove_file(path).await {
		Ok(()) => Ok(()),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
		Err(e) => Err(SyncError::io("controller: remove on terminate", e)),
	}
}

/// Publishes per-file staging progress as the wrapped receiver is driven
/// (spec §4.6 "staging status").
struct MonitoringReceiver {
	inner: Box<dyn Receiver>,
	controller: Arc<Controller>,
	side: Side,
	total: u64,
	done: u64,
}

#[async_trait]
impl Receiver for MonitoringReceiver {
	async fn receive(&mut self, path: &str, ops: Vec<RsyncOperation>) -> Result<()> {
		self.inner.receive(path, ops).await?;
		self.done += 1;
		self.controller.set_staging_status(Some(StagingStatus {
			side: self.side,
			path: path.to_string(),
			index: self.done,
			total: self.total,
		}));
		Ok(())
	}

	async fn finish(self: Box<Self>) -> Result<()> {
		self.inner.finish().await
	}
}

/// Honors cancellation between `Supply` operations (spec §5 "Stage/Supply
/// cancellation is honored between operations").
struct PreemptableReceiver {
	inner: Box<dyn Receiver>,
	cancel: CancellationToken,
}

#[async_trait]
impl Receiver for PreemptableReceiver {
	async fn receive(&mut self, path: &str, ops: Vec<RsyncOperation>) -> Result<()> {
		if self.cancel.is_cancelled() {
			return Err(SyncError::Cancelled);
		}
		self.inner.receive(path, ops).await
	}

	async fn finish(self: Box<Self>) -> Result<()> {
		if self.cancel.is_cancelled() {
			return Err(SyncError::Cancelled);
		}
		self.inner.finish().await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::{Configuration, WatchMode};
	use std::collections::BTreeMap as Map;
	use tempfile::TempDir;

	fn record(alpha: &str, beta: &str) -> SessionRecord {
		SessionRecord::new(
			uuid::Uuid::new_v4().to_string(),
			0,
			0,
			"test/0.1".to_string(),
			alpha.to_string(),
			beta.to_string(),
			Configuration { watch_mode: WatchMode::NoWatch, ..Default::default() },
			None,
			None,
			Map::new(),
		)
	}

	#[tokio::test]
	async fn fresh_controller_is_disconnected_and_unpaused() {
		let tmp = TempDir::new().unwrap();
		let paths = Paths::new(tmp.path().to_path_buf());
		paths.ensure_directories().await.unwrap();
		let controller = Controller::new(record("/a", "/b"), paths, Tracker::new());
		let snapshot = controller.state_snapshot();
		assert_eq!(snapshot.status, Status::Disconnected);
		assert!(!snapshot.alpha_connected);
		assert!(!snapshot.beta_connected);
	}

	#[test]
	fn is_ordered_subsequence_allows_gaps_but_not_reordering() {
		let full = vec!["a".to_string(), "b".to_string(), "c".to_string()];
		assert!(is_ordered_subsequence(&full, &["a".to_string(), "c".to_string()]));
		assert!(!is_ordered_subsequence(&full, &["c".to_string(), "a".to_string()]));
		assert!(!is_ordered_subsequence(&full, &["d".to_string()]));
	}

	#[test]
	fn root_deletion_is_detected_from_either_side() {
		let ancestor = crate::fs::entry::empty_directory();
		let beta_transitions = vec![Change { path: String::new(), new: None }];
		assert_eq!(root_safety_halt(&ancestor, &[], &beta_transitions), Some(Status::HaltedOnRootDeletion));
	}

	#[test]
	fn root_type_change_is_detected() {
		let ancestor = crate::fs::entry::empty_directory();
		let alpha_transitions =
			vec![Change { path: String::new(), new: Some(Entry::File { executable: false, digest: vec![1] }) }];
		assert_eq!(root_safety_halt(&ancestor, &alpha_transitions, &[]), Some(Status::HaltedOnRootTypeChange));
	}

	#[test]
	fn propagate_executability_copies_matching_file_bits() {
		let mut template_contents = Map::new();
		template_contents.insert("f".to_string(), Entry::File { executable: true, digest: vec![1] });
		let template = Entry::Directory { contents: template_contents };

		let mut snapshot_contents = Map::new();
		snapshot_contents.insert("f".to_string(), Entry::File { executable: false, digest: vec![2] });
		let mut snapshot = Entry::Directory { contents: snapshot_contents };

		propagate_executability(&template, &mut snapshot);
		match snapshot.get("f").unwrap() {
			Entry::File { executable, digest } => {
				assert!(*executable);
				assert_eq!(digest, &vec![2]);
			}
			_ => panic!("expected file"),
		}
	}

	#[tokio::test]
	async fn resume_connects_both_sides_and_halt_pauses() {
		let tmp = TempDir::new().unwrap();
		let paths = Paths::new(tmp.path().to_path_buf());
		paths.ensure_directories().await.unwrap();

		let alpha_root = TempDir::new().unwrap();
		let beta_root = TempDir::new().unwrap();
		let rec = record(&alpha_root.path().to_string_lossy(), &beta_root.path().to_string_lossy());
		let bytes = serde_json::to_vec_pretty(&rec).unwrap();
		paths::atomic_write(&paths.session_path(&rec.identifier), &bytes).await.unwrap();
		let archive_bytes = crate::fs::entry::empty_directory().encode_deterministic();
		paths::atomic_write(&paths.archive_path(&rec.identifier), &archive_bytes).await.unwrap();

		let controller = Controller::new(rec, paths, Tracker::new());
		controller.resume(String::new()).await.unwrap();

		// Give the spawned synchronize loop a moment to run at least one
		// cycle (two empty, NoWatch-mode roots reconcile trivially).
		tokio::time::sleep(Duration::from_millis(200)).await;
		let snapshot = controller.state_snapshot();
		assert!(snapshot.successful_cycles >= 1);

		controller.halt(HaltMode::Pause).await.unwrap();
	}
}

// vim: ts=4
