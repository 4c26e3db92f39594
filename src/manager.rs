//! Session manager (spec §4.7): owns the session-id → controller registry,
//! a Tracker-aware lock on that mapping, and the operations a CLI/daemon
//! layer drives sessions through.
//!
//! Grounded on the teacher's `manager.rs` session table (a `Mutex`-guarded
//! `HashMap` loaded from disk at startup, with create/list/terminate
//! operations keyed by id), generalized to this crate's richer selection
//! model (id, fuzzy match, or label selector) and Tracker-based watch-style
//! listing instead of the teacher's one-shot snapshot.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::Mutex as AsyncMutex;

use crate::cancel::CancellationToken;
use crate::config::{Configuration, ConfigurationSource};
use crate::controller::{Controller, ControllerStateSnapshot, HaltMode};
use crate::dial::{self, Location, Prompter};
use crate::error::{Result, SyncError};
use crate::paths::Paths;
use crate::session::SessionRecord;
use crate::tracker::Tracker;

/// Minimum length of a fuzzy id/URL-fragment match (spec §4.7 "a match
/// minimum-length of 5 characters").
const MIN_FUZZY_MATCH_LENGTH: usize = 5;

/// Which sessions an operation applies to (spec §4.7 "Selection is a sum of
/// three alternatives ... mutually exclusive").
#[derive(Debug, Clone)]
pub enum Selection {
	All,
	/// Each entry matched exactly by id, or fuzzily by id-prefix/substring
	/// of either endpoint URL's path or hostname (min length 5).
	Specifications(Vec<String>),
	/// A label-selector expression: comma-separated `key=value` /
	/// `key!=value` equality assertions, all of which must hold (the
	/// "commonly used in orchestration systems" syntax spec §4.7 points
	/// at, scoped to its equality-based subset since set-based selectors
	/// are not otherwise motivated by anything else this crate does).
	LabelSelector(String),
}

impl Selection {
	/// Validate the selection shape itself (spec §4.7 "enforced by
	/// selection-validation"). An empty `Specifications` list is invalid;
	/// an empty label selector is valid but matches nothing by policy.
	pub fn validate(&self) -> Result<()> {
		if let Selection::Specifications(specs) = self {
			if specs.is_empty() {
				return Err(SyncError::Validation {
					message: "explicit specifications selection must name at least one session".into(),
				});
			}
		}
		Ok(())
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum LabelAssertion {
	Equals(String, String),
	NotEquals(String, String),
}

fn parse_label_selector(expression: &str) -> Result<Vec<LabelAssertion>> {
	let mut assertions = Vec::new();
	for clause in expression.split(',') {
		let clause = clause.trim();
		if clause.is_empty() {
			continue;
		}
		if let Some((key, value)) = clause.split_once("!=") {
			assertions.push(LabelAssertion::NotEquals(key.trim().to_string(), value.trim().to_string()));
		} else if let Some((key, value)) = clause.split_once('=') {
			assertions.push(LabelAssertion::Equals(key.trim().to_string(), value.trim().to_string()));
		} else {
			return Err(SyncError::Validation { message: format!("malformed label selector clause {clause:?}") });
		}
	}
	Ok(assertions)
}

fn labels_match(labels: &BTreeMap<String, String>, assertions: &[LabelAssertion]) -> bool {
	assertions.iter().all(|assertion| match assertion {
		LabelAssertion::Equals(key, value) => labels.get(key).map(|v| v == value).unwrap_or(false),
		LabelAssertion::NotEquals(key, value) => labels.get(key).map(|v| v != value).unwrap_or(true),
	})
}

/// Extract the hostname/path fragments a fuzzy match is allowed to land
/// inside (spec §4.7 "substring of either URL path or hostname").
fn url_fragments(url: &str) -> Vec<String> {
	match dial::parse_location(url) {
		Location::Local(path) => vec![path.to_string_lossy().into_owned()],
		Location::Remote { authority, path, .. } => vec![authority, path],
	}
}

fn fuzzy_matches(needle: &str, haystacks: &[String]) -> bool {
	if needle.len() < MIN_FUZZY_MATCH_LENGTH {
		return false;
	}
	haystacks.iter().any(|h| h.contains(needle))
}

/// Controller bookkeeping the manager needs per session but that doesn't
/// belong on the controller itself.
struct Entry {
	controller: Arc<Controller>,
}

/// The session registry and its lifecycle operations (spec §4.7).
pub struct Manager {
	paths: Paths,
	tracker: Tracker,
	sessions: AsyncMutex<BTreeMap<String, Entry>>,
	creator_version: String,
}

impl Manager {
	/// Build a manager, loading every session record under
	/// `paths.sessions_dir()` and constructing (but not necessarily
	/// starting) a controller for each (spec §4.7 "On construction, lists
	/// the sessions directory ... failures to load a single record are
	/// silently skipped").
	pub async fn new(paths: Paths, creator_version: impl Into<String>) -> Result<Arc<Manager>> {
		paths.ensure_directories().await.map_err(|e| SyncError::io("manager: ensure directories", e))?;
		let tracker = Tracker::new();
		let mut sessions = BTreeMap::new();

		let mut entries = match tokio::fs::read_dir(paths.sessions_dir()).await {
			Ok(entries) => entries,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
				return Ok(Arc::new(Manager { paths, tracker, sessions: AsyncMutex::new(sessions), creator_version: creator_version.into() }));
			}
			Err(e) => return Err(SyncError::io("manager: list sessions directory", e)),
		};

		while let Some(dir_entry) = entries
			.next_entry()
			.await
			.map_err(|e| SyncError::io("manager: read sessions directory", e))?
		{
			let path = dir_entry.path();
			let record = match tokio::fs::read(&path).await {
				Ok(bytes) => bytes,
				Err(_) => continue,
			};
			let record: SessionRecord = match serde_json::from_slice(&record) {
				Ok(r) => r,
				Err(_) => continue,
			};
			if record.validate().is_err() {
				continue;
			}
			let controller = Controller::new(record.clone(), paths.clone(), tracker.clone());
			sessions.insert(record.identifier.clone(), Entry { controller });
		}

		let manager = Arc::new(Manager { paths, tracker, sessions: AsyncMutex::new(sessions), creator_version: creator_version.into() });
		for entry in manager.sessions.lock().await.values() {
			entry.controller.start().await;
		}
		Ok(manager)
	}

	/// Create a new session (spec §4.7 `Create`): build, validate, and
	/// persist its record, then register and start a controller for it.
	#[allow(clippy::too_many_arguments)]
	pub async fn create(
		&self,
		alpha_url: String,
		beta_url: String,
		configuration: Configuration,
		configuration_alpha: Option<Configuration>,
		configuration_beta: Option<Configuration>,
		labels: BTreeMap<String, String>,
	) -> Result<ControllerStateSnapshot> {
		configuration
			.validate(ConfigurationSource::Cli)
			.map_err(|message| SyncError::Validation { message })?;
		for overlay in [&configuration_alpha, &configuration_beta].into_iter().flatten() {
			overlay.validate(ConfigurationSource::Cli).map_err(|message| SyncError::Validation { message })?;
		}

		let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
		let record = SessionRecord::new(
			uuid::Uuid::new_v4().to_string(),
			now.as_secs() as i64,
			now.subsec_nanos(),
			self.creator_version.clone(),
			alpha_url,
			beta_url,
			configuration,
			configuration_alpha,
			configuration_beta,
			labels,
		);
		record.validate().map_err(|message| SyncError::Validation { message })?;

		let bytes = serde_json::to_vec_pretty(&record)
			.map_err(|e| SyncError::Persistence { what: "session record", source: Box::new(e) })?;
		crate::paths::atomic_write(&self.paths.session_path(&record.identifier), &bytes)
			.await
			.map_err(|e| SyncError::io("manager: persist session record", e))?;

		let controller = Controller::new(record.clone(), self.paths.clone(), self.tracker.clone());
		{
			let mut sessions = self.sessions.lock().await;
			sessions.insert(record.identifier.clone(), Entry { controller: Arc::clone(&controller) });
		}
		self.tracker.notify_change();
		controller.start().await;
		Ok(controller.state_snapshot())
	}

	/// Resolve a [`Selection`] against the current registry (spec §4.7).
	async fn resolve(&self, selection: &Selection) -> Result<Vec<Arc<Controller>>> {
		selection.validate()?;
		let sessions = self.sessions.lock().await;

		match selection {
			Selection::All => Ok(sessions.values().map(|e| Arc::clone(&e.controller)).collect()),
			Selection::Specifications(specs) => {
				let mut resolved = Vec::new();
				for spec in specs {
					if let Some(entry) = sessions.get(spec) {
						resolved.push(Arc::clone(&entry.controller));
						continue;
					}
					let mut fuzzy_hits: Vec<Arc<Controller>> = Vec::new();
					for entry in sessions.values() {
						let mut haystacks = url_fragments(entry.controller.alpha_url());
						haystacks.extend(url_fragments(entry.controller.beta_url()));
						haystacks.push(entry.controller.session_id().to_string());
						if fuzzy_matches(spec, &haystacks) {
							fuzzy_hits.push(Arc::clone(&entry.controller));
						}
					}
					match fuzzy_hits.len() {
						0 => return Err(SyncError::Validation { message: format!("no session matches {spec:?}") }),
						1 => resolved.push(fuzzy_hits.remove(0)),
						_ => {
							return Err(SyncError::Validation {
								message: format!("{spec:?} matches more than one session"),
							})
						}
					}
				}
				Ok(resolved)
			}
			Selection::LabelSelector(expression) => {
				if expression.trim().is_empty() {
					return Ok(Vec::new());
				}
				let assertions = parse_label_selector(expression)?;
				Ok(sessions
					.values()
					.filter(|e| labels_match(e.controller.labels(), &assertions))
					.map(|e| Arc::clone(&e.controller))
					.collect())
			}
		}
	}

	/// Wait for a state change (unless `previous_index` is already stale),
	/// then snapshot every selected controller sorted by creation time
	/// (spec §4.7 `List`).
	pub async fn list(&self, selection: Selection, previous_index: u64) -> Result<(u64, bool, Vec<ControllerStateSnapshot>)> {
		let (index, poisoned) = self.tracker.wait_for_change(previous_index).await;
		let controllers = self.resolve(&selection).await?;
		let mut snapshots: Vec<ControllerStateSnapshot> = controllers.iter().map(|c| c.state_snapshot()).collect();
		snapshots.sort_by_key(|s| (s.creation_time_seconds, s.creation_time_nanos));
		Ok((index, poisoned, snapshots))
	}

	pub async fn flush(&self, selection: Selection, skip_wait: bool, cancel: CancellationToken) -> Result<()> {
		let controllers = self.resolve(&selection).await?;
		for controller in controllers {
			controller.flush(skip_wait, cancel.clone()).await?;
		}
		Ok(())
	}

	pub async fn pause(&self, selection: Selection) -> Result<()> {
		let controllers = self.resolve(&selection).await?;
		for controller in controllers {
			controller.halt(HaltMode::Pause).await?;
		}
		Ok(())
	}

	pub async fn resume(&self, selection: Selection, prompter: Prompter) -> Result<()> {
		let controllers = self.resolve(&selection).await?;
		for controller in controllers {
			controller.resume(prompter.clone()).await?;
		}
		Ok(())
	}

	/// Halt and remove each selected session from the registry and disk
	/// (spec §4.7 "Terminate removes sessions from the registry after a
	/// successful halt").
	pub async fn terminate(&self, selection: Selection) -> Result<()> {
		let controllers = self.resolve(&selection).await?;
		let mut sessions = self.sessions.lock().await;
		for controller in controllers {
			controller.halt(HaltMode::Terminate).await?;
			sessions.remove(controller.session_id());
		}
		drop(sessions);
		self.tracker.notify_change();
		Ok(())
	}

	/// Halt every controller and poison the tracker so any parked `List`
	/// caller unblocks (spec §4.7 `Shutdown`).
	pub async fn shutdown(&self) -> Result<()> {
		let controllers: Vec<Arc<Controller>> = self.sessions.lock().await.values().map(|e| Arc::clone(&e.controller)).collect();
		for controller in controllers {
			let _ = controller.halt(HaltMode::Shutdown).await;
		}
		self.tracker.poison();
		Ok(())
	}
}


// vim: ts=4
