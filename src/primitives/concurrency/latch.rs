use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Blocking primitive behind explicit retry.
///
/// A latch is closed or open and carries an `era`. Every [`reset`](Self::reset)
/// closes it and starts a new era; listeners capture the era at registration
/// and [`open`](Self::open) ignores signals that carry an older one, so a
/// latch that is reused across attempts never wakes on a stale write.
#[derive(Debug, Default)]
pub struct RetryLatch {
    state: Mutex<LatchState>,
    cond: Condvar,
}

#[derive(Debug, Default)]
struct LatchState {
    open: bool,
    era: u64,
}

/// Outcome of waiting on a [`RetryLatch`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LatchWait {
    /// The latch was opened; carries what is left of the timeout, if any.
    Opened {
        /// Remaining timeout budget.
        remaining: Option<Duration>,
    },
    /// The timeout elapsed first.
    TimedOut,
    /// The interrupt token fired first.
    Interrupted,
}

impl RetryLatch {
    /// Creates a closed latch in era zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current era.
    pub fn era(&self) -> u64 {
        self.state.lock().era
    }

    /// Returns `true` when the latch is open.
    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    /// Closes the latch and starts a new era, which is returned.
    pub fn reset(&self) -> u64 {
        let mut state = self.state.lock();
        state.era = state.era.wrapping_add(1);
        state.open = false;
        state.era
    }

    /// Opens the latch if it is still in `expected_era`; stale signals are dropped.
    pub fn open(&self, expected_era: u64) {
        let mut state = self.state.lock();
        if state.era != expected_era || state.open {
            return;
        }
        state.open = true;
        self.cond.notify_all();
    }

    /// Wakes waiters without opening so they re-check their interrupt token.
    pub(crate) fn wake(&self) {
        let _state = self.state.lock();
        self.cond.notify_all();
    }

    /// Blocks until the latch opens, `timeout` elapses, or `interrupt` fires.
    ///
    /// A reset to a newer era counts as opened: the waiter's registration is
    /// no longer meaningful.
    pub fn await_open(
        &self,
        expected_era: u64,
        timeout: Option<Duration>,
        interrupt: Option<&InterruptToken>,
    ) -> LatchWait {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        loop {
            if state.open || state.era != expected_era {
                let remaining =
                    deadline.map(|d| d.saturating_duration_since(Instant::now()));
                return LatchWait::Opened { remaining };
            }
            if let Some(token) = interrupt {
                if token.take_interrupt() {
                    return LatchWait::Interrupted;
                }
            }
            match deadline {
                None => self.cond.wait(&mut state),
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return LatchWait::TimedOut;
                    }
                    let _ = self.cond.wait_until(&mut state, deadline);
                }
            }
        }
    }
}

/// Cooperative interruption for blocked, interruptible transactions.
///
/// Threads cannot be interrupted from the outside, so a transaction that
/// wants to be cancellable while blocked in retry is handed a token and the
/// canceller calls [`interrupt`](Self::interrupt).
#[derive(Debug, Default)]
pub struct InterruptToken {
    interrupted: AtomicBool,
    parked: Mutex<Option<Arc<RetryLatch>>>,
}

impl InterruptToken {
    /// Creates a token that has not fired.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires the token and wakes the latch currently parked on it.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        if let Some(latch) = self.parked.lock().as_ref() {
            latch.wake();
        }
    }

    /// Returns `true` while the token is fired and not yet consumed.
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Consumes a pending interrupt.
    pub fn take_interrupt(&self) -> bool {
        self.interrupted.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn park(&self, latch: Arc<RetryLatch>) {
        *self.parked.lock() = Some(latch);
    }

    pub(crate) fn unpark(&self) {
        self.parked.lock().take();
    }
}
