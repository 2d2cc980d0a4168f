//! The transaction state machine.
//!
//! A [`Txn`] is one attempt: it collects tranlocals while the body runs and
//! either publishes them atomically or releases them. Attempts are renewed in
//! place by the executor, which swaps the tranlocal storage when the
//! speculative profile asks for a richer flavor while keeping the pool, the
//! retry latch and the remaining timeout.

mod listener;
mod storage;

pub use listener::{TxnEvent, TxnListener};

use std::sync::Arc;
use std::time::Duration;

use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::primitives::concurrency::{LatchWait, RetryLatch};
use crate::stm::config::TxnConfig;
use crate::stm::listeners::ListenerNode;
use crate::stm::object::{Payload, PayloadKind, TxnObject};
use crate::stm::orec::RegisterOutcome;
use crate::stm::pool::{NoPool, ObjectPool, PoolStats};
use crate::stm::runtime::Stm;
use crate::stm::speculative::SpeculativeConfiguration;
use crate::stm::tranlocal::{CommuteFn, Tranlocal, TranlocalMode};
use crate::types::{
    IsolationLevel, LockMode, Result, SpeculativeFeature, StmError, TxnFlavor, TxnStatus,
};

use storage::{TranlocalStorage, Tranlocals};

/// One transaction attempt.
pub struct Txn {
    stm: Arc<Stm>,
    config: Arc<TxnConfig>,
    speculative: Arc<SpeculativeConfiguration>,
    flavor: TxnFlavor,
    status: TxnStatus,
    attempt: u32,
    remaining_timeout: Option<Duration>,
    tranlocals: Tranlocals,
    pool: Box<dyn ObjectPool>,
    latch: Arc<RetryLatch>,
    local_conflict_count: u64,
    snapshot_taken: bool,
    abort_only: bool,
    listeners: Vec<Arc<dyn TxnListener>>,
}

impl std::fmt::Debug for Txn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Txn")
            .field("family", &self.config.family_name)
            .field("flavor", &self.flavor)
            .field("status", &self.status)
            .field("attempt", &self.attempt)
            .field("size", &self.tranlocals.len())
            .finish()
    }
}

impl Txn {
    pub(crate) fn new(stm: Arc<Stm>, config: Arc<TxnConfig>) -> Self {
        let speculative = stm.speculative_config(&config.family_name);
        let mut pool = stm.lease_pool();
        let flavor = speculative.choose_flavor(&config);
        let tranlocals = storage_for(flavor, &speculative, pool.as_mut());
        Self {
            remaining_timeout: config.timeout,
            stm,
            config,
            speculative,
            flavor,
            status: TxnStatus::Active,
            attempt: 1,
            tranlocals,
            pool,
            latch: Arc::new(RetryLatch::new()),
            local_conflict_count: 0,
            snapshot_taken: false,
            abort_only: false,
            listeners: Vec::new(),
        }
    }

    /// Lifecycle state.
    pub fn status(&self) -> TxnStatus {
        self.status
    }

    /// Attempt number, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Representation used by this attempt.
    pub fn flavor(&self) -> TxnFlavor {
        self.flavor
    }

    /// Family configuration.
    pub fn config(&self) -> &TxnConfig {
        &self.config
    }

    /// Runtime this transaction belongs to.
    pub fn stm(&self) -> &Arc<Stm> {
        &self.stm
    }

    /// Timeout budget left for blocking retries.
    pub fn remaining_timeout(&self) -> Option<Duration> {
        self.remaining_timeout
    }

    /// Number of objects opened by this attempt.
    pub fn size(&self) -> usize {
        self.tranlocals.len()
    }

    /// Returns `true` once [`set_abort_only`](Self::set_abort_only) was called.
    pub fn is_abort_only(&self) -> bool {
        self.abort_only
    }

    pub(crate) fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    fn spin_count(&self) -> usize {
        self.stm.config().spin_count
    }

    fn arrive_needed(&self) -> bool {
        !self.flavor.is_lean()
    }

    fn ensure_active(&self) -> Result<()> {
        match self.status {
            TxnStatus::Active => Ok(()),
            TxnStatus::Prepared => Err(StmError::PreparedTransaction(
                "transaction is already prepared",
            )),
            TxnStatus::Committed => Err(StmError::DeadTransaction("transaction is already committed")),
            TxnStatus::Aborted => Err(StmError::DeadTransaction("transaction is already aborted")),
        }
    }

    fn ensure_writable(&mut self) -> Result<()> {
        self.ensure_active()?;
        if self.config.readonly {
            self.abort();
            return Err(StmError::Invalid("write in a readonly transaction"));
        }
        Ok(())
    }

    /// Aborts and builds the conflict error.
    fn conflict(&mut self, reason: &'static str) -> StmError {
        self.abort();
        StmError::ReadWriteConflict(reason)
    }

    /// Records the missing feature, aborts and builds the escalation signal.
    fn escalate(&mut self, feature: SpeculativeFeature) -> StmError {
        match feature {
            SpeculativeFeature::Size => self.speculative.signal_size(self.tranlocals.len()),
            other => self.speculative.signal(other),
        }
        debug!(
            family = %self.config.family_name,
            attempt = self.attempt,
            flavor = ?self.flavor,
            %feature,
            "attempt needs a richer flavor"
        );
        self.abort();
        StmError::SpeculativeConfiguration(feature)
    }

    fn require(&mut self, feature: SpeculativeFeature) -> Result<()> {
        if self.flavor.is_lean() {
            return Err(self.escalate(feature));
        }
        Ok(())
    }

    fn require_room(&mut self) -> Result<()> {
        if self.tranlocals.has_room() {
            return Ok(());
        }
        Err(self.escalate(SpeculativeFeature::Size))
    }

    fn require_kind(&mut self, kind: PayloadKind) -> Result<()> {
        if kind == PayloadKind::Ref {
            self.require(SpeculativeFeature::NonPrimitivePayload)?;
        }
        Ok(())
    }

    /// Samples the conflict counter before the first load; returns whether
    /// the read set has to be revalidated after this load.
    fn begin_load(&mut self) -> bool {
        if self.snapshot_taken {
            return true;
        }
        self.local_conflict_count = self.stm.conflict_counter().count();
        self.snapshot_taken = true;
        false
    }

    /// Keeps the read set a consistent snapshot: if any write was published
    /// since the last check, every tracked read is compared to its orec.
    fn validate_reads(&mut self) -> Result<()> {
        let current = self.stm.conflict_counter().count();
        if current == self.local_conflict_count {
            return Ok(());
        }
        if self.tranlocals.len() > self.stm.config().maximum_poor_mans_conflict_scan_length {
            return Err(self.conflict("read set too large to revalidate"));
        }
        let stale = self.tranlocals.as_slice().iter().any(|t| {
            t.tracks_version()
                && t.owner
                    .as_ref()
                    .is_some_and(|owner| owner.orec().has_read_conflict(t))
        });
        if stale {
            trace!(family = %self.config.family_name, attempt = self.attempt, "read set invalidated");
            return Err(self.conflict("read set changed"));
        }
        self.local_conflict_count = current;
        Ok(())
    }

    /// Loads `object` into a fresh tranlocal.
    fn attach(&mut self, object: &Arc<TxnObject>, desired: LockMode, write: bool) -> Result<usize> {
        self.require_room()?;
        let revalidate = self.begin_load();
        let spin_count = self.spin_count();
        let arrive_needed = self.arrive_needed();
        let mut tranlocal = self.pool.take_tranlocal();
        if !object.load(&mut tranlocal, desired, spin_count, arrive_needed) {
            self.pool.put_tranlocal(tranlocal);
            trace!(object = object.id(), ?desired, "load refused");
            return Err(self.conflict("object locked while loading"));
        }
        if self.config.isolation == IsolationLevel::Serializable {
            tranlocal.conflict_check_needed = true;
        }
        if write {
            tranlocal.upgrade_to_write();
        }
        let idx = self.tranlocals.push(tranlocal);
        if revalidate {
            self.validate_reads()?;
        }
        Ok(idx)
    }

    /// Brings an existing tranlocal up to date: resolves pending commutes and
    /// upgrades its lock to `desired`.
    fn refresh(&mut self, idx: usize, desired: LockMode) -> Result<()> {
        let needs_load = self.tranlocals.as_slice()[idx].mode == TranlocalMode::Commute;
        let revalidate = needs_load && self.begin_load();
        let spin_count = self.spin_count();
        let arrive_needed = self.arrive_needed();
        let serializable = self.config.isolation == IsolationLevel::Serializable;

        let tranlocal = &mut self.tranlocals.as_mut_slice()[idx];
        let outcome = refresh_tranlocal(tranlocal, desired, spin_count, arrive_needed, serializable);
        match outcome {
            Err(reason) => Err(self.conflict(reason)),
            Ok(()) if revalidate => self.validate_reads(),
            Ok(()) => Ok(()),
        }
    }

    /// Opens `object` for reading, returning the tranlocal index.
    pub(crate) fn open_for_read(&mut self, object: &Arc<TxnObject>, lock_mode: LockMode) -> Result<usize> {
        self.ensure_active()?;
        let desired = lock_mode.max(self.config.read_lock_mode);
        if desired != LockMode::None {
            self.require(SpeculativeFeature::Locks)?;
        }
        self.require_kind(object.kind())?;
        match self.tranlocals.find(object.id()) {
            Some(idx) => {
                self.refresh(idx, desired)?;
                Ok(idx)
            }
            None => self.attach(object, desired, false),
        }
    }

    /// Opens `object` for writing, returning the tranlocal index.
    pub(crate) fn open_for_write(&mut self, object: &Arc<TxnObject>, lock_mode: LockMode) -> Result<usize> {
        self.ensure_writable()?;
        let desired = lock_mode.max(self.config.write_lock_mode);
        if desired != LockMode::None {
            self.require(SpeculativeFeature::Locks)?;
        }
        self.require_kind(object.kind())?;
        match self.tranlocals.find(object.id()) {
            Some(idx) => {
                self.refresh(idx, desired)?;
                self.tranlocals.as_mut_slice()[idx].upgrade_to_write();
                Ok(idx)
            }
            None => self.attach(object, desired, true),
        }
    }

    /// Reads `object`, holding at least `lock_mode` afterwards.
    pub fn read(&mut self, object: &Arc<TxnObject>, lock_mode: LockMode) -> Result<Payload> {
        let idx = self.open_for_read(object, lock_mode)?;
        Ok(self.tranlocals.as_slice()[idx].value.clone())
    }

    /// Buffers a write of `value` to `object`.
    pub fn write(&mut self, object: &Arc<TxnObject>, value: Payload, lock_mode: LockMode) -> Result<()> {
        if value.kind() != object.kind() {
            return Err(StmError::Invalid("payload kind does not match object"));
        }
        let idx = self.open_for_write(object, lock_mode)?;
        self.tranlocals.as_mut_slice()[idx].value = value;
        Ok(())
    }

    /// Creates a new object holding `initial`. It stays invisible to every
    /// other transaction until this one commits, and is never published if
    /// this attempt aborts.
    pub fn open_for_construction(&mut self, initial: Payload) -> Result<Arc<TxnObject>> {
        self.ensure_writable()?;
        self.require(SpeculativeFeature::Construction)?;
        self.require_kind(initial.kind())?;
        self.require_room()?;
        let object = self.stm.new_constructed_object(initial.kind());
        let mut tranlocal = self.pool.take_tranlocal();
        tranlocal.bind_constructed(&object, initial);
        self.tranlocals.push(tranlocal);
        trace!(object = object.id(), "object constructed");
        Ok(object)
    }

    /// Registers a commuting update of `object`. Unless the object was
    /// already opened, nothing is read now; `function` runs at prepare
    /// against the value current at that point.
    pub fn commute(&mut self, object: &Arc<TxnObject>, function: CommuteFn) -> Result<()> {
        self.ensure_writable()?;
        self.require(SpeculativeFeature::Commute)?;
        self.require_kind(object.kind())?;
        if let Some(idx) = self.tranlocals.find(object.id()) {
            let tranlocal = &mut self.tranlocals.as_mut_slice()[idx];
            match tranlocal.mode {
                TranlocalMode::Commute => tranlocal.pending.push(function),
                TranlocalMode::Construct => tranlocal.value = function(&tranlocal.value),
                TranlocalMode::Read | TranlocalMode::Write => {
                    tranlocal.upgrade_to_write();
                    tranlocal.value = function(&tranlocal.value);
                }
            }
            return Ok(());
        }
        self.require_room()?;
        let mut tranlocal = self.pool.take_tranlocal();
        tranlocal.bind_commuting(object);
        tranlocal.pending.push(function);
        self.tranlocals.push(tranlocal);
        Ok(())
    }

    /// Reads `object` and marks it for a conflict check at prepare, which
    /// protects the read against write skew.
    pub fn ensure(&mut self, object: &Arc<TxnObject>) -> Result<()> {
        self.ensure_active()?;
        self.require(SpeculativeFeature::Ensure)?;
        let idx = self.open_for_read(object, LockMode::None)?;
        self.tranlocals.as_mut_slice()[idx].conflict_check_needed = true;
        Ok(())
    }

    /// Takes `lock_mode` on `object` for the rest of the attempt.
    pub fn acquire(&mut self, object: &Arc<TxnObject>, lock_mode: LockMode) -> Result<()> {
        self.open_for_read(object, lock_mode).map(|_| ())
    }

    /// Attaches `listener` to this attempt only.
    pub fn register(&mut self, listener: Arc<dyn TxnListener>) -> Result<()> {
        self.ensure_active()?;
        self.require(SpeculativeFeature::Listeners)?;
        self.listeners.push(listener);
        Ok(())
    }

    /// Dooms the attempt: a later commit aborts with a conflict.
    pub fn set_abort_only(&mut self) -> Result<()> {
        self.ensure_active()?;
        self.abort_only = true;
        Ok(())
    }

    /// Requests a blocking retry: the executor waits until an object read by
    /// this attempt changes, then runs the body again.
    pub fn retry<T>(&mut self) -> Result<T> {
        self.ensure_active()?;
        if self.config.timeout.is_some() {
            self.require(SpeculativeFeature::Timeout)?;
        }
        if !self.config.blocking_allowed {
            self.abort();
            return Err(StmError::RetryNotAllowed);
        }
        if !self.tranlocals.as_slice().iter().any(|t| t.tracks_version()) {
            self.abort();
            return Err(StmError::RetryNotPossible);
        }
        Err(StmError::Retry)
    }

    /// Registers change listeners on the read set, aborts and parks on the
    /// retry latch until a watched object changes. Every listener still
    /// attached is removed before returning.
    pub(crate) fn block_for_retry(&mut self) -> Result<()> {
        self.ensure_active()?;
        let era = self.latch.reset();
        let mut watched = 0usize;
        let mut registered: SmallVec<[Arc<TxnObject>; 4]> = SmallVec::new();
        {
            let pool = &mut *self.pool;
            for tranlocal in self.tranlocals.as_slice() {
                let Some(owner) = &tranlocal.owner else {
                    continue;
                };
                match owner
                    .orec()
                    .register_change_listener(&self.latch, tranlocal, pool, era)
                {
                    RegisterOutcome::Done => {
                        watched += 1;
                        registered.push(Arc::clone(owner));
                    }
                    RegisterOutcome::NotNeeded => {
                        watched += 1;
                        break;
                    }
                    RegisterOutcome::None => {}
                }
            }
        }
        self.abort();
        if watched == 0 {
            return Err(StmError::RetryNotPossible);
        }

        debug!(
            family = %self.config.family_name,
            attempt = self.attempt,
            watched,
            timeout = ?self.remaining_timeout,
            "blocking retry"
        );
        let token = if self.config.interruptible {
            self.config.interrupt_token.clone()
        } else {
            None
        };
        if let Some(token) = &token {
            token.park(Arc::clone(&self.latch));
        }
        let outcome = self
            .latch
            .await_open(era, self.remaining_timeout, token.as_deref());
        if let Some(token) = &token {
            token.unpark();
        }
        for object in &registered {
            object
                .orec()
                .unregister_change_listener(&self.latch, &mut *self.pool);
        }
        match outcome {
            LatchWait::Opened { remaining } => {
                debug!(family = %self.config.family_name, attempt = self.attempt, "retry woken");
                self.remaining_timeout = remaining;
                Ok(())
            }
            LatchWait::TimedOut => {
                self.remaining_timeout = Some(Duration::ZERO);
                Err(StmError::RetryTimeout)
            }
            LatchWait::Interrupted => Err(StmError::RetryInterrupted),
        }
    }

    fn notify(&self, event: TxnEvent) {
        for listener in self.config.permanent_listeners.iter().chain(&self.listeners) {
            listener.notify(event);
        }
    }

    /// Locks and validates everything the commit will need. After success
    /// only [`commit`](Self::commit) or [`abort`](Self::abort) are allowed.
    pub fn prepare(&mut self) -> Result<()> {
        match self.status {
            TxnStatus::Prepared => return Ok(()),
            TxnStatus::Active => {}
            TxnStatus::Committed | TxnStatus::Aborted => {
                return Err(StmError::DeadTransaction("cannot prepare a finished transaction"))
            }
        }
        if self.abort_only {
            return Err(self.conflict("transaction is abort only"));
        }
        self.notify(TxnEvent::PrePrepare);
        let spin_count = self.spin_count();
        let dirty_check = self.config.dirty_check;
        let failed = self
            .tranlocals
            .as_mut_slice()
            .iter_mut()
            .any(|t| !t.prepare(dirty_check, spin_count));
        if failed {
            trace!(family = %self.config.family_name, attempt = self.attempt, "prepare failed");
            return Err(self.conflict("conflict while preparing"));
        }
        self.status = TxnStatus::Prepared;
        Ok(())
    }

    /// Publishes every dirty write atomically, releases all interest and then
    /// wakes the transactions blocked on the written objects.
    pub fn commit(&mut self) -> Result<()> {
        match self.status {
            TxnStatus::Committed => return Ok(()),
            TxnStatus::Aborted => {
                return Err(StmError::DeadTransaction("cannot commit an aborted transaction"))
            }
            TxnStatus::Active => self.prepare()?,
            TxnStatus::Prepared => {}
        }

        let dirty = self.tranlocals.as_slice().iter().filter(|t| t.is_dirty).count();
        if dirty > 0 {
            self.stm.conflict_counter().signal_conflict();
        }

        let mut wakeups: SmallVec<[Box<ListenerNode>; 4]> = SmallVec::new();
        let pool = &mut *self.pool;
        self.tranlocals.drain(&mut |mut tranlocal| {
            match tranlocal.owner.clone() {
                Some(owner) if tranlocal.is_dirty => {
                    if let Some(chain) = owner.commit(&mut tranlocal) {
                        wakeups.push(chain);
                    }
                }
                _ => tranlocal.depart_after_commit(),
            }
            pool.put_tranlocal(tranlocal);
        });
        self.status = TxnStatus::Committed;

        let woken: usize = wakeups
            .into_iter()
            .map(|chain| ListenerNode::open_all(Some(chain), &mut *self.pool))
            .sum();
        debug!(
            family = %self.config.family_name,
            attempt = self.attempt,
            flavor = ?self.flavor,
            dirty,
            woken,
            "transaction committed"
        );
        self.notify(TxnEvent::PostCommit);
        Ok(())
    }

    /// Releases every orec interest and discards all writes. Calling it on a
    /// finished transaction does nothing.
    pub fn abort(&mut self) {
        if self.status.is_dead() {
            return;
        }
        let pool = &mut *self.pool;
        self.tranlocals.drain(&mut |mut tranlocal| {
            tranlocal.depart_after_failure();
            pool.put_tranlocal(tranlocal);
        });
        self.status = TxnStatus::Aborted;
        trace!(family = %self.config.family_name, attempt = self.attempt, "transaction aborted");
        self.notify(TxnEvent::PostAbort);
    }

    /// Turns a finished attempt into the next one, in the flavor the
    /// speculative profile now asks for.
    pub(crate) fn restart(&mut self) {
        self.abort();
        let previous = self.flavor;
        let flavor = self.speculative.choose_flavor(&self.config);
        let old = std::mem::replace(&mut self.tranlocals, Tranlocals::mono());
        old.recycle(self.pool.as_mut());
        self.tranlocals = storage_for(flavor, &self.speculative, self.pool.as_mut());
        if flavor != previous {
            debug!(
                family = %self.config.family_name,
                attempt = self.attempt + 1,
                ?previous,
                ?flavor,
                "transaction flavor escalated"
            );
        }
        self.flavor = flavor;
        self.attempt += 1;
        self.status = TxnStatus::Active;
        self.snapshot_taken = false;
        self.abort_only = false;
        self.listeners.clear();
    }
}

impl Drop for Txn {
    fn drop(&mut self) {
        self.abort();
        let storage = std::mem::replace(&mut self.tranlocals, Tranlocals::mono());
        storage.recycle(self.pool.as_mut());
        let pool = std::mem::replace(&mut self.pool, Box::new(NoPool));
        self.stm.return_pool(pool);
    }
}

fn refresh_tranlocal(
    tranlocal: &mut Tranlocal,
    desired: LockMode,
    spin_count: usize,
    arrive_needed: bool,
    serializable: bool,
) -> std::result::Result<(), &'static str> {
    if tranlocal.mode == TranlocalMode::Commute {
        if !tranlocal.evaluate_commuting(spin_count, arrive_needed) {
            return Err("commuting object stayed locked");
        }
        tranlocal.conflict_check_needed |= serializable;
    }
    if desired > tranlocal.lock_mode {
        let Some(owner) = tranlocal.owner.clone() else {
            return Err("tranlocal lost its owner");
        };
        if !owner
            .orec()
            .try_lock_and_check_conflict(tranlocal, spin_count, desired)
        {
            return Err("lock upgrade refused");
        }
    }
    Ok(())
}

fn storage_for(
    flavor: TxnFlavor,
    speculative: &SpeculativeConfiguration,
    pool: &mut dyn ObjectPool,
) -> Tranlocals {
    match flavor {
        TxnFlavor::LeanMono | TxnFlavor::FatMono => Tranlocals::mono(),
        TxnFlavor::LeanFixedLength | TxnFlavor::FatFixedLength => {
            Tranlocals::fixed(pool, speculative.max_fixed_length())
        }
        TxnFlavor::FatVariableLength => Tranlocals::variable(pool, speculative.minimal_length()),
    }
}
