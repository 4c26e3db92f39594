//! Hierarchical cooperative cancellation (spec §5 "cooperative cancellation
//! propagated through hierarchical cancellation tokens").
//!
//! The corpus has no off-the-shelf cancellation token (`tokio-util` is not
//! part of the teacher's dependency stack), so this reimplements the
//! familiar parent/child `CancellationToken` shape directly on top of
//! `tokio::sync::Notify`, which the teacher already reaches for elsewhere
//! when it needs a wakeup primitive shared across tasks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

struct Inner {
	cancelled: AtomicBool,
	notify: Notify,
	children: Mutex<Vec<CancellationToken>>,
}

/// A cancellable signal that can be cloned cheaply and fanned out into
/// child tokens. Cancelling a token cancels every child transitively.
#[derive(Clone)]
pub struct CancellationToken {
	inner: Arc<Inner>,
}

impl CancellationToken {
	pub fn new() -> Self {
		CancellationToken {
			inner: Arc::new(Inner {
				cancelled: AtomicBool::new(false),
				notify: Notify::new(),
				children: Mutex::new(Vec::new()),
			}),
		}
	}

	/// Create a child token. If `self` is already cancelled, the child is
	/// born already cancelled; otherwise it is cancelled whenever `self`
	/// is (spec §5: "shared child token" for the poll dance).
	pub fn child_token(&self) -> CancellationToken {
		let child = CancellationToken::new();
		if self.is_cancelled() {
			child.cancel();
		} else {
			self.inner.children.lock().expect("cancellation token lock poisoned").push(child.clone());
		}
		child
	}

	pub fn cancel(&self) {
		if self.inner.cancelled.swap(true, Ordering::SeqCst) {
			return;
		}
		self.inner.notify.notify_waiters();
		let children =
			std::mem::take(&mut *self.inner.children.lock().expect("cancellation token lock poisoned"));
		for child in children {
			child.cancel();
		}
	}

	pub fn is_cancelled(&self) -> bool {
		self.inner.cancelled.load(Ordering::SeqCst)
	}

	/// Resolves once this token is cancelled. Resolves immediately if it
	/// already is.
	pub async fn cancelled(&self) {
		if self.is_cancelled() {
			return;
		}
		let notified = self.inner.notify.notified();
		if self.is_cancelled() {
			return;
		}
		notified.await;
	}
}

impl Default for CancellationToken {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn cancelling_parent_cancels_child() {
		let parent = CancellationToken::new();
		let child = parent.child_token();
		assert!(!child.is_cancelled());
		parent.cancel();
		assert!(child.is_cancelled());
		child.cancelled().await;
	}

	#[tokio::test]
	async fn child_born_cancelled_if_parent_already_cancelled() {
		let parent = CancellationToken::new();
		parent.cancel();
		let child = parent.child_token();
		assert!(child.is_cancelled());
	}

	#[tokio::test]
	async fn cancelled_wakes_pending_waiter() {
		let token = CancellationToken::new();
		let waiter = token.clone();
		let handle = tokio::spawn(async move {
			waiter.cancelled().await;
		});
		token.cancel();
		handle.await.unwrap();
	}
}

// vim: ts=4
