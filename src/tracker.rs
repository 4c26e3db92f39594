//! Monotonic state-change tracker (spec §4.7 Glossary: "monotonic
//! state-change counter with a change-wait operation; supports efficient
//! watch-style listing APIs").
//!
//! Used both by the session controller's state lock (spec §4.6 "publishes a
//! change event through the Tracker") and by the manager's session registry
//! (spec §4.7 "a Tracker-aware lock on the mapping so that registry
//! mutations publish events too").

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

struct Inner {
	index: AtomicU64,
	notify: Notify,
	poisoned: std::sync::atomic::AtomicBool,
}

/// A monotonically increasing index plus a change-wait operation.
#[derive(Clone)]
pub struct Tracker {
	inner: Arc<Inner>,
}

impl Tracker {
	pub fn new() -> Self {
		Tracker {
			inner: Arc::new(Inner {
				index: AtomicU64::new(1),
				notify: Notify::new(),
				poisoned: std::sync::atomic::AtomicBool::new(false),
			}),
		}
	}

	/// Current state index.
	pub fn index(&self) -> u64 {
		self.inner.index.load(Ordering::SeqCst)
	}

	/// Publish a change: bump the index and wake every waiter.
	pub fn notify_change(&self) {
		self.inner.index.fetch_add(1, Ordering::SeqCst);
		self.inner.notify.notify_waiters();
	}

	/// Mark the tracker poisoned (e.g. the manager is shutting down).
	/// Waiters parked in [`Tracker::wait_for_change`] are released.
	pub fn poison(&self) {
		self.inner.poisoned.store(true, Ordering::SeqCst);
		self.inner.notify.notify_waiters();
	}

	pub fn is_poisoned(&self) -> bool {
		self.inner.poisoned.load(Ordering::SeqCst)
	}

	/// Block until the index differs from `previous`, or the tracker is
	/// poisoned. Returns `(new_index, poisoned)`.
	pub async fn wait_for_change(&self, previous: u64) -> (u64, bool) {
		loop {
			if self.is_poisoned() {
				return (self.index(), true);
			}
			let current = self.index();
			if current != previous {
				return (current, false);
			}
			let notified = self.inner.notify.notified();
			// Re-check after registering interest to avoid missing a
			// notification that fired between the checks above and here.
			if self.index() != previous || self.is_poisoned() {
				continue;
			}
			notified.await;
		}
	}
}

impl Default for Tracker {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn wait_for_change_returns_immediately_on_stale_index() {
		let tracker = Tracker::new();
		tracker.notify_change();
		let (index, poisoned) = tracker.wait_for_change(0).await;
		assert_eq!(index, tracker.index());
		assert!(!poisoned);
	}

	#[tokio::test]
	async fn wait_for_change_wakes_on_notify() {
		let tracker = Tracker::new();
		let previous = tracker.index();
		let waiter = tracker.clone();
		let handle = tokio::spawn(async move { waiter.wait_for_change(previous).await });
		tracker.notify_change();
		let (index, poisoned) = handle.await.unwrap();
		assert!(index > previous);
		assert!(!poisoned);
	}

	#[tokio::test]
	async fn poison_releases_waiters() {
		let tracker = Tracker::new();
		let previous = tracker.index();
		let waiter = tracker.clone();
		let handle = tokio::spawn(async move { waiter.wait_for_change(previous).await });
		tracker.poison();
		let (_, poisoned) = handle.await.unwrap();
		assert!(poisoned);
	}
}

// vim: ts=4
