//! Concurrency primitives shared by every transaction.
//!
//! [`GlobalConflictCounter`] is the epoch that lets readers skip per-object
//! validation, [`RetryLatch`] is the only place a transaction ever blocks,
//! and the backoff policies pace re-attempts after a conflict.

mod backoff;
mod latch;

pub use backoff::{BackoffPolicy, ExponentialBackoffPolicy, NoBackoffPolicy};
pub use latch::{InterruptToken, LatchWait, RetryLatch};

use std::sync::atomic::{AtomicU64, Ordering};

/// Epoch counter bumped by every transaction that publishes a dirty write.
///
/// A reader samples it before its first load and again after every further
/// load. While the value is unchanged no committed write can have happened in
/// between, so the per-object validation of the read set can be skipped.
#[derive(Debug, Default)]
pub struct GlobalConflictCounter {
    count: AtomicU64,
}

impl GlobalConflictCounter {
    /// Creates a counter starting at zero.
    pub const fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
        }
    }

    /// Returns the current epoch.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }

    /// Announces a committing write. Must be called before the first dirty
    /// object of the commit is published.
    pub fn signal_conflict(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}
