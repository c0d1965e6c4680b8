//! Usage counting for entries shared with in-flight consumers.
//!
//! # Invariants
//!
//! - Every `incr` is paired with exactly one `decr`.
//!   - Enforced in: [`InUse`] drop, tracker add/remove match pairs
//!   - Tested by: `usage::tests::guard_releases_on_panic`
//!   - Failure symptom: `unregister` or `stop` blocks forever.
//! - A waiter only returns once the count has reached zero.
//!   - Enforced in: [`UsageCounter::wait_till_unused`]
//!   - Tested by: `registry::tests::unregister_waits_for_in_flight_use`
//!   - Failure symptom: a service is invoked after its registration was removed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Count of in-flight users paired with a condition variable.
#[derive(Debug, Default)]
pub(crate) struct UsageCounter {
	count: Mutex<usize>,
	unused: Condvar,
}

impl UsageCounter {
	pub(crate) fn new() -> Self {
		Self::default()
	}

	pub(crate) fn incr(&self) {
		*self.count.lock() += 1;
	}

	pub(crate) fn decr(&self) {
		let mut count = self.count.lock();
		debug_assert!(*count > 0, "usage count underflow");
		*count = count.saturating_sub(1);
		if *count == 0 {
			self.unused.notify_all();
		}
	}

	#[cfg(test)]
	pub(crate) fn count(&self) -> usize {
		*self.count.lock()
	}

	pub(crate) fn wait_till_unused(&self) {
		let mut count = self.count.lock();
		while *count > 0 {
			self.unused.wait(&mut count);
		}
	}

	/// Returns `false` if the count was still non-zero when `timeout` elapsed.
	pub(crate) fn wait_till_unused_for(&self, timeout: Duration) -> bool {
		let deadline = Instant::now() + timeout;
		let mut count = self.count.lock();
		while *count > 0 {
			if self.unused.wait_until(&mut count, deadline).timed_out() {
				return *count == 0;
			}
		}
		true
	}

	pub(crate) fn wait(&self, timeout: Option<Duration>) -> bool {
		match timeout {
			Some(timeout) => self.wait_till_unused_for(timeout),
			None => {
				self.wait_till_unused();
				true
			}
		}
	}
}

/// Anything that carries a [`UsageCounter`].
pub(crate) trait Counted {
	fn usage(&self) -> &UsageCounter;
}

/// Shared reference that holds one usage count until dropped.
pub(crate) struct InUse<T: Counted>(Arc<T>);

impl<T: Counted> InUse<T> {
	pub(crate) fn acquire(item: &Arc<T>) -> Self {
		item.usage().incr();
		Self(Arc::clone(item))
	}
}

impl<T: Counted> std::ops::Deref for InUse<T> {
	type Target = Arc<T>;

	fn deref(&self) -> &Arc<T> {
		&self.0
	}
}

impl<T: Counted> Drop for InUse<T> {
	fn drop(&mut self) {
		self.0.usage().decr();
	}
}
