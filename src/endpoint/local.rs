//! Local endpoint (spec §4.3): owns a synchronization root on the local
//! host, watches it, and drives the `fs::` scan/transition primitives plus
//! a [`Stager`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use sha1::{Digest, Sha1};
use tokio::sync::{mpsc, Mutex};

use super::{Endpoint, Receiver, ScanOutcome, StageOutcome, TransitionOutcome};
use crate::cancel::CancellationToken;
use crate::config::{Configuration, SymlinkMode, WatchMode};
use crate::error::{Result, SyncError};
use crate::fs::entry::Entry;
use crate::fs::ignore::IgnoreMatcher;
use crate::fs::reconcile::Change;
use crate::fs::{cache::Cache, scan, transition};
use crate::stager::Stager;
use crate::transfer::{self, DeltaWriter, RsyncOperation, Signature};

/// Local endpoint (spec §4.3). Runs a filesystem watcher in its own task
/// (or timer, under [`WatchMode::Force`]) feeding a single-slot "dirty"
/// channel with drop-on-full semantics: a pending notification is never
/// overwritten with a second one, so duplicate events coalesce into the
/// same wakeup without ever losing the first (spec: "no event is ever
/// missed but duplicates are coalesced").
pub struct LocalEndpoint {
	root: PathBuf,
	symlink_mode: SymlinkMode,
	ignores: Arc<IgnoreMatcher>,
	cache: Arc<Cache>,
	stager: Stager,
	dirty_rx: Mutex<mpsc::Receiver<()>>,
	watch_enabled: bool,
	watcher: Mutex<Option<RecommendedWatcher>>,
	poll_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl LocalEndpoint {
	/// Construct a local endpoint rooted at `root`, with `cache_path` and
	/// `staging_root` as the per-session, per-side locations spec §6
	/// assigns it. `configuration` is the merged, already-resolved
	/// configuration for this side (spec §4.6 "Derived config").
	pub fn new(
		root: PathBuf,
		cache_path: &std::path::Path,
		staging_root: PathBuf,
		configuration: &Configuration,
	) -> Result<Self> {
		let ignores = IgnoreMatcher::new(&configuration.effective_ignores())
			.map_err(|e| SyncError::Validation { message: e })?;
		let cache = Cache::open_or_empty(cache_path)?;
		let stager = Stager::new(staging_root);

		let (tx, rx) = mpsc::channel(1);
		let (watcher, poll_task) = match configuration.watch_mode {
			WatchMode::NoWatch => (None, None),
			WatchMode::Force => {
				let interval_secs = configuration.watch_polling_interval.max(1) as u64;
				let tx_for_task = tx.clone();
				let handle = tokio::spawn(async move {
					let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
					loop {
						ticker.tick().await;
						let _ = tx_for_task.try_send(());
					}
				});
				(None, Some(handle))
			}
			WatchMode::Portable | WatchMode::Default => {
				let tx_for_watcher = tx.clone();
				let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
					if res.is_ok() {
						let _ = tx_for_watcher.try_send(());
					}
				})
				.map_err(|e| SyncError::endpoint("local watch", format!("failed to start watcher: {e}")))?;
				watcher
					.watch(&root, RecursiveMode::Recursive)
					.map_err(|e| SyncError::endpoint("local watch", format!("failed to watch {}: {e}", root.display())))?;
				(Some(watcher), None)
			}
		};
		let watch_enabled = configuration.watch_mode != WatchMode::NoWatch;
		drop(tx);

		Ok(LocalEndpoint {
			root,
			symlink_mode: configuration.symlink_mode,
			ignores: Arc::new(ignores),
			cache: Arc::new(cache),
			stager,
			dirty_rx: Mutex::new(rx),
			watch_enabled,
			watcher: Mutex::new(watcher),
			poll_task: Mutex::new(poll_task),
		})
	}

	pub fn root(&self) -> &std::path::Path {
		&self.root
	}
}

#[async_trait]
impl Endpoint for LocalEndpoint {
	async fn poll(&self, cancel: CancellationToken) -> Result<()> {
		if !self.watch_enabled {
			// No watcher or timer is running; this side only ever wakes on
			// cancellation (a flush request or shutdown), matching
			// `WatchMode::NoWatch`'s fully manual/flush-driven operation.
			cancel.cancelled().await;
			return Ok(());
		}
		let mut rx = self.dirty_rx.lock().await;
		tokio::select! {
			_ = cancel.cancelled() => Ok(()),
			message = rx.recv() => match message {
				Some(()) => Ok(()),
				None => Err(SyncError::endpoint("local poll", "watcher channel closed")),
			},
		}
	}

	async fn scan(&self, _ancestor: &Entry, force_full: bool) -> Result<ScanOutcome> {
		let root = self.root.clone();
		let cache = Arc::clone(&self.cache);
		let ignores = Arc::clone(&self.ignores);
		let symlink_mode = self.symlink_mode;
		let outcome = tokio::task::spawn_blocking(move || scan::scan(&root, &cache, &ignores, symlink_mode, force_full))
			.await
			.map_err(|e| SyncError::endpoint("local scan", format!("scan task panicked: {e}")))?;

		match outcome {
			Ok(o) => {
				o.snapshot.validate().map_err(|e| SyncError::endpoint("local scan", e.to_string()))?;
				Ok(ScanOutcome { snapshot: o.snapshot, preserves_executability: o.preserves_executability })
			}
			Err(e) if e.try_again => Err(SyncError::endpoint_try_again("local scan", e.message)),
			Err(e) => Err(SyncError::endpoint("local scan", e.message)),
		}
	}

	async fn stage(&self, paths: &[String], digests: &[Vec<u8>]) -> Result<StageOutcome> {
		let mut filtered_paths = Vec::new();
		let mut signatures = Vec::new();
		for (path, digest) in paths.iter().zip(digests.iter()) {
			if self.stager.is_staged(path, digest) {
				continue;
			}
			let bytes = tokio::fs::read(self.root.join(path)).await.unwrap_or_default();
			filtered_paths.push(path.clone());
			signatures.push(transfer::compute_signature(&bytes));
		}

		if filtered_paths.is_empty() {
			return Ok(StageOutcome { filtered_paths, signatures, receiver: None });
		}

		let receiver: Box<dyn Receiver> =
			Box::new(LocalReceiver { root: self.root.clone(), stager: self.stager.clone() });
		Ok(StageOutcome { filtered_paths, signatures, receiver: Some(receiver) })
	}

	async fn supply(
		&self,
		paths: &[String],
		signatures: &[Signature],
		mut receiver: Box<dyn Receiver>,
	) -> Result<()> {
		for (path, signature) in paths.iter().zip(signatures.iter()) {
			let bytes = tokio::fs::read(self.root.join(path)).await.unwrap_or_default();
			let ops = transfer::compute_delta(signature, &bytes);
			receiver.receive(path, ops).await?;
		}
		receiver.finish().await
	}

	async fn transition(&self, transitions: &[Change]) -> Result<TransitionOutcome> {
		let root = self.root.clone();
		let stager = self.stager.clone();
		let owned = transitions.to_vec();
		let (results, problems, missing_files) =
			tokio::task::spawn_blocking(move || transition::transition(&root, &owned, &stager))
				.await
				.map_err(|e| SyncError::endpoint("local transition", format!("transition task panicked: {e}")))?;
		let _ = self.stager.wipe();
		Ok(TransitionOutcome { results, problems, missing_files })
	}

	async fn shutdown(&self) -> Result<()> {
		if let Some(handle) = self.poll_task.lock().await.take() {
			handle.abort();
		}
		self.watcher.lock().await.take();
		Ok(())
	}
}

/// Receiver bound directly to a local [`Stager`] (spec §4.2 op 3's "must be
/// fully driven ... before any other endpoint operation").
struct LocalReceiver {
	root: PathBuf,
	stager: Stager,
}

#[async_trait]
impl Receiver for LocalReceiver {
	async fn receive(&mut self, path: &str, ops: Vec<RsyncOperation>) -> Result<()> {
		let root = self.root.clone();
		let stager = self.stager.clone();
		let path_owned = path.to_string();
		tokio::task::spawn_blocking(move || -> Result<()> {
			let base = std::fs::read(root.join(&path_owned)).unwrap_or_default();
			let sink = stager.sink(&path_owned)?;
			let mut writer = DeltaWriter::new(base, sink);
			for op in &ops {
				writer.apply(op).map_err(|e| SyncError::io("receiver: apply operation", e))?;
			}
			writer.into_inner().close()?;
			Ok(())
		})
		.await
		.map_err(|e| SyncError::endpoint("local receive", format!("receive task panicked: {e}")))?
	}

	async fn finish(self: Box<Self>) -> Result<()> {
		Ok(())
	}
}

/// Computes the digest of local content, used by remote server-side
/// staging to echo back expected digests in diagnostics. Exposed for
/// `endpoint::remote::server`.
pub(crate) fn hash_bytes(bytes: &[u8]) -> Vec<u8> {
	let mut hasher = Sha1::new();
	hasher.update(bytes);
	hasher.finalize().to_vec()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::Configuration;
	use std::io::Write as _;
	use tempfile::TempDir;

	fn endpoint(root: &TempDir, cache: &TempDir, staging: &TempDir, cfg: &Configuration) -> LocalEndpoint {
		LocalEndpoint::new(
			root.path().to_path_buf(),
			&cache.path().join("cache.redb"),
			staging.path().join("staging"),
			cfg,
		)
		.unwrap()
	}

	#[tokio::test]
	async fn no_watch_poll_blocks_until_cancelled_rather_than_erroring() {
		let root = TempDir::new().unwrap();
		let cache_dir = TempDir::new().unwrap();
		let staging_dir = TempDir::new().unwrap();
		let cfg = Configuration { watch_mode: WatchMode::NoWatch, ..Default::default() }.resolve_defaults(1);
		let ep = endpoint(&root, &cache_dir, &staging_dir, &cfg);

		let cancel = CancellationToken::new();
		let cancel_for_task = cancel.clone();
		tokio::spawn(async move {
			tokio::time::sleep(Duration::from_millis(10)).await;
			cancel_for_task.cancel();
		});
		ep.poll(cancel).await.unwrap();
	}

	#[tokio::test]
	async fn scan_reflects_disk_contents() {
		let root = TempDir::new().unwrap();
		std::fs::write(root.path().join("a.txt"), b"hello").unwrap();
		let cache_dir = TempDir::new().unwrap();
		let staging_dir = TempDir::new().unwrap();
		let cfg = Configuration { watch_mode: WatchMode::NoWatch, ..Default::default() }.resolve_defaults(1);
		let ep = endpoint(&root, &cache_dir, &staging_dir, &cfg);

		let ancestor = crate::fs::entry::empty_directory();
		let outcome = ep.scan(&ancestor, true).await.unwrap();
		match outcome.snapshot {
			Entry::Directory { contents } => assert!(contents.contains_key("a.txt")),
			_ => panic!("expected directory"),
		}
	}

	#[tokio::test]
	async fn stage_skips_already_staged_paths() {
		let root = TempDir::new().unwrap();
		std::fs::write(root.path().join("a.txt"), b"hello").unwrap();
		let cache_dir = TempDir::new().unwrap();
		let staging_dir = TempDir::new().unwrap();
		let cfg = Configuration { watch_mode: WatchMode::NoWatch, ..Default::default() }.resolve_defaults(1);
		let ep = endpoint(&root, &cache_dir, &staging_dir, &cfg);

		let mut sink = ep.stager.sink("a.txt").unwrap();
		sink.write_all(b"hello").unwrap();
		let digest = sink.close().unwrap();

		let outcome = ep.stage(&["a.txt".to_string()], &[digest]).await.unwrap();
		assert!(outcome.filtered_paths.is_empty());
		assert!(outcome.receiver.is_none());
	}

	#[tokio::test]
	async fn stage_then_supply_then_receive_round_trips_content() {
		let source_root = TempDir::new().unwrap();
		std::fs::write(source_root.path().join("a.txt"), b"new content").unwrap();
		let source_cache = TempDir::new().unwrap();
		let source_staging = TempDir::new().unwrap();
		let cfg = Configuration { watch_mode: WatchMode::NoWatch, ..Default::default() }.resolve_defaults(1);
		let source = endpoint(&source_root, &source_cache, &source_staging, &cfg);

		let target_root = TempDir::new().unwrap();
		std::fs::write(target_root.path().join("a.txt"), b"old content").unwrap();
		let target_cache = TempDir::new().unwrap();
		let target_staging = TempDir::new().unwrap();
		let target = endpoint(&target_root, &target_cache, &target_staging, &cfg);

		let wrong_digest = vec![9u8; 20];
		let outcome = target.stage(&["a.txt".to_string()], &[wrong_digest]).await.unwrap();
		assert_eq!(outcome.filtered_paths, vec!["a.txt".to_string()]);
		let receiver = outcome.receiver.unwrap();

		source.supply(&outcome.filtered_paths, &outcome.signatures, receiver).await.unwrap();

		let expected_digest = hash_bytes(b"new content");
		let staged_path = target.stager.provide("a.txt", &expected_digest, false).unwrap();
		assert_eq!(std::fs::read(staged_path).unwrap(), b"new content");
	}
}

// vim: ts=4
