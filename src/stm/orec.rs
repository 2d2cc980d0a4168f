//! Ownership records: the per-object concurrency-control cell.
//!
//! The lock state, read-lock count, surplus and read-biased bookkeeping share
//! one `AtomicU64` so every transition is a single CAS. The version lives in
//! a second atomic and only moves while the orec is exclusively locked.
//!
//! State word layout:
//!
//! | bits    | field                                      |
//! |---------|--------------------------------------------|
//! | 0..=1   | lock mode (`None`, `Read`, `Write`, `Exclusive`) |
//! | 2       | read biased                                |
//! | 3..=12  | readonly count (saturates at 1023)         |
//! | 13..=31 | read lock count                            |
//! | 32..=63 | surplus                                    |

use std::hint::spin_loop;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::primitives::concurrency::RetryLatch;
use crate::stm::listeners::ListenerNode;
use crate::stm::pool::ObjectPool;
use crate::stm::tranlocal::Tranlocal;
use crate::types::LockMode;

const LOCK_MODE_MASK: u64 = 0b11;
const READ_BIASED_BIT: u64 = 1 << 2;
const READONLY_SHIFT: u32 = 3;
const READONLY_MASK: u64 = 0x3FF << READONLY_SHIFT;
const READ_LOCK_SHIFT: u32 = 13;
const READ_LOCK_MASK: u64 = 0x7_FFFF << READ_LOCK_SHIFT;
const SURPLUS_SHIFT: u32 = 32;

/// Largest readonly count the state word can hold.
pub const MAX_READONLY_COUNT: u32 = 0x3FF;
/// Largest number of concurrent read locks.
pub const MAX_READ_LOCKS: u32 = 0x7_FFFF;

/// Outcome of [`Orec::arrive`] and [`Orec::arrive_and_lock`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Arrival {
    /// Arrival registered; the caller owes exactly one depart.
    Success,
    /// The orec is read biased; nothing was registered and nothing is owed.
    ReadBiased,
    /// The orec stayed locked for the whole spin budget; nothing registered.
    Unregistered,
}

/// Outcome of [`Orec::register_change_listener`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RegisterOutcome {
    /// A listener node was appended.
    Done,
    /// A write already happened since the snapshot; the latch was opened.
    NotNeeded,
    /// The tranlocal carries no snapshot that could be watched.
    None,
}

/// Point-in-time view of an orec, for diagnostics and tests.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct OrecSnapshot {
    /// Strongest lock currently held.
    pub lock_mode: LockMode,
    /// Number of read locks held.
    pub read_lock_count: u32,
    /// Number of outstanding arrivals.
    pub surplus: u32,
    /// Whether plain reads currently skip arrival.
    pub read_biased: bool,
    /// Consecutive read-only departures since the last update.
    pub readonly_count: u32,
    /// Committed version.
    pub version: u64,
}

impl OrecSnapshot {
    /// Returns `true` when nobody holds a lock or an arrival.
    pub fn is_idle(&self) -> bool {
        self.lock_mode == LockMode::None && self.surplus == 0 && self.read_lock_count == 0
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
struct State(u64);

impl State {
    fn lock_mode(self) -> LockMode {
        LockMode::from_bits(self.0 & LOCK_MODE_MASK)
    }

    fn with_lock_mode(self, mode: LockMode) -> Self {
        State((self.0 & !LOCK_MODE_MASK) | mode.bits())
    }

    fn is_read_biased(self) -> bool {
        self.0 & READ_BIASED_BIT != 0
    }

    fn with_read_biased(self, biased: bool) -> Self {
        if biased {
            State(self.0 | READ_BIASED_BIT)
        } else {
            State(self.0 & !READ_BIASED_BIT)
        }
    }

    fn readonly_count(self) -> u32 {
        ((self.0 & READONLY_MASK) >> READONLY_SHIFT) as u32
    }

    fn with_readonly_count(self, count: u32) -> Self {
        let count = count.min(MAX_READONLY_COUNT) as u64;
        State((self.0 & !READONLY_MASK) | (count << READONLY_SHIFT))
    }

    fn read_lock_count(self) -> u32 {
        ((self.0 & READ_LOCK_MASK) >> READ_LOCK_SHIFT) as u32
    }

    fn with_read_lock_count(self, count: u32) -> Self {
        State((self.0 & !READ_LOCK_MASK) | ((count as u64) << READ_LOCK_SHIFT))
    }

    fn surplus(self) -> u32 {
        (self.0 >> SURPLUS_SHIFT) as u32
    }

    fn with_surplus(self, surplus: u32) -> Self {
        State((self.0 & 0xFFFF_FFFF) | ((surplus as u64) << SURPLUS_SHIFT))
    }

    /// Whether `mode` can be granted to a party that holds nothing yet.
    fn grants(self, mode: LockMode) -> bool {
        match mode {
            LockMode::None => true,
            LockMode::Read => {
                self.lock_mode() != LockMode::Exclusive && self.read_lock_count() < MAX_READ_LOCKS
            }
            LockMode::Write => !matches!(self.lock_mode(), LockMode::Write | LockMode::Exclusive),
            LockMode::Exclusive => self.lock_mode() == LockMode::None,
        }
    }

    /// Adds `mode` to the state; `grants(mode)` must hold.
    fn acquire(self, mode: LockMode) -> Self {
        match mode {
            LockMode::None => self,
            LockMode::Read => {
                let next = self.with_read_lock_count(self.read_lock_count() + 1);
                if self.lock_mode() == LockMode::None {
                    next.with_lock_mode(LockMode::Read)
                } else {
                    next
                }
            }
            LockMode::Write => self.with_lock_mode(LockMode::Write),
            LockMode::Exclusive => self.with_lock_mode(LockMode::Exclusive),
        }
    }

    /// Removes a `held` lock owned by the caller.
    fn release(self, held: LockMode) -> Self {
        match held {
            LockMode::None => self,
            LockMode::Read => {
                let remaining = self.read_lock_count().saturating_sub(1);
                let next = self.with_read_lock_count(remaining);
                if remaining == 0 && self.lock_mode() == LockMode::Read {
                    next.with_lock_mode(LockMode::None)
                } else {
                    next
                }
            }
            LockMode::Write | LockMode::Exclusive => {
                if self.read_lock_count() > 0 {
                    self.with_lock_mode(LockMode::Read)
                } else {
                    self.with_lock_mode(LockMode::None)
                }
            }
        }
    }

    /// Upgrades a `held` lock to `desired`, or `None` if someone else blocks it.
    fn upgrade(self, held: LockMode, desired: LockMode) -> Option<Self> {
        match (held, desired) {
            (LockMode::None, mode) => self.grants(mode).then(|| self.acquire(mode)),
            (LockMode::Read, LockMode::Write) => (self.lock_mode() == LockMode::Read).then(|| {
                self.with_read_lock_count(self.read_lock_count() - 1)
                    .with_lock_mode(LockMode::Write)
            }),
            (LockMode::Read, LockMode::Exclusive) => {
                (self.lock_mode() == LockMode::Read && self.read_lock_count() == 1).then(|| {
                    self.with_read_lock_count(0)
                        .with_lock_mode(LockMode::Exclusive)
                })
            }
            (LockMode::Write, LockMode::Exclusive) => (self.read_lock_count() == 0)
                .then(|| self.with_lock_mode(LockMode::Exclusive)),
            _ => Some(self),
        }
    }
}

/// Ownership record guarding one transactional object.
#[derive(Debug)]
pub struct Orec {
    state: AtomicU64,
    version: AtomicU64,
    listeners: Mutex<Option<Box<ListenerNode>>>,
    read_biased_threshold: u32,
}

impl Orec {
    /// Creates an unlocked orec at version zero.
    pub fn new(read_biased_threshold: u32) -> Self {
        Self::with_state(State(0), read_biased_threshold)
    }

    /// Creates an orec already exclusively locked by its constructing
    /// transaction, which owes one depart.
    pub fn new_constructed(read_biased_threshold: u32) -> Self {
        let state = State(0).with_lock_mode(LockMode::Exclusive).with_surplus(1);
        Self::with_state(state, read_biased_threshold)
    }

    fn with_state(state: State, read_biased_threshold: u32) -> Self {
        Self {
            state: AtomicU64::new(state.0),
            version: AtomicU64::new(0),
            listeners: Mutex::new(None),
            read_biased_threshold: read_biased_threshold.clamp(1, MAX_READONLY_COUNT),
        }
    }

    fn load_state(&self) -> State {
        State(self.state.load(Ordering::SeqCst))
    }

    fn cas(&self, current: State, next: State) -> bool {
        self.state
            .compare_exchange_weak(current.0, next.0, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Committed version.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Strongest lock currently held.
    pub fn lock_mode(&self) -> LockMode {
        self.load_state().lock_mode()
    }

    /// Returns `true` while exclusively locked.
    pub fn is_exclusive(&self) -> bool {
        self.lock_mode() == LockMode::Exclusive
    }

    /// Number of outstanding arrivals.
    pub fn surplus(&self) -> u32 {
        self.load_state().surplus()
    }

    /// Returns `true` when plain reads skip arrival.
    pub fn is_read_biased(&self) -> bool {
        self.load_state().is_read_biased()
    }

    /// Captures the whole state for inspection.
    pub fn snapshot(&self) -> OrecSnapshot {
        let state = self.load_state();
        OrecSnapshot {
            lock_mode: state.lock_mode(),
            read_lock_count: state.read_lock_count(),
            surplus: state.surplus(),
            read_biased: state.is_read_biased(),
            readonly_count: state.readonly_count(),
            version: self.version(),
        }
    }

    /// Registers an arrival unless the orec is exclusively locked, spinning
    /// up to `spin_count` times for the lock to clear.
    pub fn arrive(&self, spin_count: usize) -> Arrival {
        let mut spins = spin_count;
        loop {
            let current = self.load_state();
            if current.lock_mode() == LockMode::Exclusive || current.surplus() == u32::MAX {
                if spins == 0 {
                    return Arrival::Unregistered;
                }
                spins -= 1;
                spin_loop();
                continue;
            }
            if current.is_read_biased() {
                return Arrival::ReadBiased;
            }
            if self.cas(current, current.with_surplus(current.surplus() + 1)) {
                return Arrival::Success;
            }
        }
    }

    /// Waits up to `spin_count` spins for the exclusive lock to clear without
    /// registering anything.
    pub fn await_unlocked(&self, spin_count: usize) -> bool {
        let mut spins = spin_count;
        while self.is_exclusive() {
            if spins == 0 {
                return false;
            }
            spins -= 1;
            spin_loop();
        }
        true
    }

    /// Registers an arrival and acquires `mode` in one step. Read-biased orecs
    /// still register: locking always goes through the full cycle.
    pub fn arrive_and_lock(&self, spin_count: usize, mode: LockMode) -> Arrival {
        let mut spins = spin_count;
        loop {
            let current = self.load_state();
            if !current.grants(mode) || current.surplus() == u32::MAX {
                if spins == 0 {
                    return Arrival::Unregistered;
                }
                spins -= 1;
                spin_loop();
                continue;
            }
            let next = current.acquire(mode).with_surplus(current.surplus() + 1);
            if self.cas(current, next) {
                return Arrival::Success;
            }
        }
    }

    /// Moves the caller's lock from `held` to `desired` without touching the
    /// surplus. `held == None` means the caller already arrived.
    fn upgrade_lock(&self, spin_count: usize, held: LockMode, desired: LockMode) -> bool {
        let mut spins = spin_count;
        loop {
            let current = self.load_state();
            match current.upgrade(held, desired) {
                Some(next) => {
                    if next == current || self.cas(current, next) {
                        return true;
                    }
                }
                None => {
                    if spins == 0 {
                        return false;
                    }
                    spins -= 1;
                    spin_loop();
                }
            }
        }
    }

    /// Upgrades the lock `tranlocal` holds to `desired` and, for tranlocals
    /// that carry a snapshot, verifies the version did not move.
    ///
    /// The tranlocal's lock mode and depart obligation are updated as soon as
    /// the lock is granted, so a `false` caused by a version mismatch still
    /// leaves the lock to be released by the caller's abort.
    pub fn try_lock_and_check_conflict(
        &self,
        tranlocal: &mut Tranlocal,
        spin_count: usize,
        desired: LockMode,
    ) -> bool {
        let held = tranlocal.lock_mode;
        if held >= desired {
            return true;
        }
        let acquired = if held != LockMode::None || tranlocal.has_depart_obligation {
            self.upgrade_lock(spin_count, held, desired)
        } else if self.arrive_and_lock(spin_count, desired) == Arrival::Success {
            tranlocal.has_depart_obligation = true;
            true
        } else {
            false
        };
        if !acquired {
            trace!(?held, ?desired, "orec lock refused");
            return false;
        }
        tranlocal.lock_mode = desired;
        if !tranlocal.tracks_version() {
            return true;
        }
        let current = self.version();
        if current != tranlocal.version {
            trace!(snapshot = tranlocal.version, current, "orec version moved under lock");
            return false;
        }
        true
    }

    /// Conflict predicate shared by eager and lazy validation: the snapshot
    /// is stale, or someone else holds the exclusive lock.
    pub fn has_read_conflict(&self, tranlocal: &Tranlocal) -> bool {
        if tranlocal.lock_mode != LockMode::None {
            return false;
        }
        if self.is_exclusive() {
            return true;
        }
        self.version() != tranlocal.version
    }

    fn update(&self, f: impl Fn(State) -> State) {
        loop {
            let current = self.load_state();
            if current.surplus() == 0 {
                warn!(state = current.0, "orec depart without outstanding arrival");
                return;
            }
            let next = f(current.with_surplus(current.surplus() - 1));
            if self.cas(current, next) {
                return;
            }
        }
    }

    fn after_readonly(&self, state: State) -> State {
        if state.is_read_biased() {
            return state;
        }
        let count = state.readonly_count().saturating_add(1);
        if count >= self.read_biased_threshold {
            state.with_read_biased(true).with_readonly_count(0)
        } else {
            state.with_readonly_count(count)
        }
    }

    /// Departs after a read-only use; feeds read-biased promotion.
    pub fn depart_after_reading(&self) {
        self.update(|state| self.after_readonly(state));
    }

    /// Departs and releases `held` after a read-only use.
    pub fn depart_after_reading_and_unlock(&self, held: LockMode) {
        self.update(|state| self.after_readonly(state.release(held)));
    }

    /// Departs and releases `held` after publishing an update; resets the
    /// read-biased bookkeeping.
    pub fn depart_after_update_and_unlock(&self, held: LockMode) {
        self.update(|state| {
            state
                .release(held)
                .with_read_biased(false)
                .with_readonly_count(0)
        });
    }

    /// Departs after an aborted use.
    pub fn depart_after_failure(&self) {
        self.update(|state| state);
    }

    /// Departs and releases `held` after an aborted use.
    pub fn depart_after_failure_and_unlock(&self, held: LockMode) {
        self.update(|state| state.release(held));
    }

    /// Installs the next version, detaches the waiting listeners and releases
    /// the exclusive lock held by the committing transaction.
    ///
    /// The listener chain is detached after the version moves, so a listener
    /// registered against the old version is either in the returned chain or
    /// saw the new version and opened its own latch.
    pub(crate) fn publish(&self) -> Option<Box<ListenerNode>> {
        self.version.fetch_add(1, Ordering::SeqCst);
        let chain = self.listeners.lock().take();
        self.depart_after_update_and_unlock(LockMode::Exclusive);
        chain
    }

    /// Appends a listener for `latch` unless the object already changed since
    /// `tranlocal` was loaded, in which case the latch is opened directly.
    pub fn register_change_listener(
        &self,
        latch: &Arc<RetryLatch>,
        tranlocal: &Tranlocal,
        pool: &mut dyn ObjectPool,
        era: u64,
    ) -> RegisterOutcome {
        if !tranlocal.tracks_version() {
            return RegisterOutcome::None;
        }
        let mut head = self.listeners.lock();
        if self.version() != tranlocal.version {
            latch.open(era);
            return RegisterOutcome::NotNeeded;
        }
        let live = ListenerNode::prune_stale(head.take(), pool);
        let mut node = pool.take_listener();
        node.latch = Some(Arc::clone(latch));
        node.era = era;
        node.next = live;
        *head = Some(node);
        RegisterOutcome::Done
    }

    /// Detaches the listeners of `latch` once its waiter is done with this
    /// object, pruning stale nodes on the way.
    pub fn unregister_change_listener(&self, latch: &Arc<RetryLatch>, pool: &mut dyn ObjectPool) {
        let mut head = self.listeners.lock();
        let rest = head.take();
        *head = ListenerNode::remove_latch(rest, latch, pool);
    }

    /// Number of listeners currently attached.
    pub fn listener_count(&self) -> usize {
        let head = self.listeners.lock();
        let mut count = 0;
        let mut cursor = head.as_deref();
        while let Some(node) = cursor {
            count += 1;
            cursor = node.next.as_deref();
        }
        count
    }
}
