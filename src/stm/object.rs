//! Shared transactional objects: an orec plus the committed payload.

use std::any::Any;
use std::fmt;
use std::hint::spin_loop;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::trace;

use crate::primitives::concurrency::GlobalConflictCounter;
use crate::stm::listeners::ListenerNode;
use crate::stm::orec::{Arrival, Orec};
use crate::stm::pool::NoPool;
use crate::stm::tranlocal::{Tranlocal, TranlocalMode};
use crate::types::{LockMode, Result, StmError};

/// Identity of a transactional object within one [`Stm`](crate::stm::Stm).
pub type ObjectId = u64;

/// Shared reference payload.
pub type RefValue = Arc<dyn Any + Send + Sync>;

/// Whether an object stores primitive bits or a shared reference.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum PayloadKind {
    /// 64 raw bits; integers, floats and booleans are encoded into them.
    Bits,
    /// Optional shared reference.
    Ref,
}

/// Committed or speculative value of a transactional object.
#[derive(Clone)]
pub enum Payload {
    /// Primitive value.
    Bits(u64),
    /// Reference value; equality is identity.
    Ref(Option<RefValue>),
}

impl Payload {
    /// Kind of this payload.
    pub fn kind(&self) -> PayloadKind {
        match self {
            Payload::Bits(_) => PayloadKind::Bits,
            Payload::Ref(_) => PayloadKind::Ref,
        }
    }

    /// Raw bits; references read as zero.
    pub fn bits(&self) -> u64 {
        match self {
            Payload::Bits(bits) => *bits,
            Payload::Ref(_) => 0,
        }
    }

    /// Shared reference; primitives read as `None`.
    pub fn reference(&self) -> Option<&RefValue> {
        match self {
            Payload::Ref(value) => value.as_ref(),
            Payload::Bits(_) => None,
        }
    }

    /// Dirty-check equality: bitwise for primitives, identity for references.
    pub fn same_as(&self, other: &Payload) -> bool {
        match (self, other) {
            (Payload::Bits(a), Payload::Bits(b)) => a == b,
            (Payload::Ref(None), Payload::Ref(None)) => true,
            (Payload::Ref(Some(a)), Payload::Ref(Some(b))) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Zero value for `kind`.
    pub fn empty(kind: PayloadKind) -> Self {
        match kind {
            PayloadKind::Bits => Payload::Bits(0),
            PayloadKind::Ref => Payload::Ref(None),
        }
    }
}

impl Default for Payload {
    fn default() -> Self {
        Payload::Bits(0)
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Bits(bits) => write!(f, "Bits({bits:#x})"),
            Payload::Ref(None) => f.write_str("Ref(null)"),
            Payload::Ref(Some(value)) => write!(f, "Ref({:p})", Arc::as_ptr(value)),
        }
    }
}

/// A transactional object: identity, ownership record and committed value.
///
/// The value is only written while the orec is exclusively locked, right
/// before the version moves, so a reader that sees the same unlocked version
/// before and after copying the value has a consistent copy.
pub struct TxnObject {
    id: ObjectId,
    kind: PayloadKind,
    orec: Orec,
    value: RwLock<Payload>,
}

impl fmt::Debug for TxnObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxnObject")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("orec", &self.orec.snapshot())
            .finish()
    }
}

impl TxnObject {
    pub(crate) fn new(id: ObjectId, initial: Payload, read_biased_threshold: u32) -> Self {
        Self {
            id,
            kind: initial.kind(),
            orec: Orec::new(read_biased_threshold),
            value: RwLock::new(initial),
        }
    }

    /// Object born inside a transaction: exclusively locked, version zero,
    /// invisible until that transaction commits.
    pub(crate) fn new_constructed(id: ObjectId, kind: PayloadKind, read_biased_threshold: u32) -> Self {
        Self {
            id,
            kind,
            orec: Orec::new_constructed(read_biased_threshold),
            value: RwLock::new(Payload::empty(kind)),
        }
    }

    /// Object identity.
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Payload kind.
    pub fn kind(&self) -> PayloadKind {
        self.kind
    }

    /// Ownership record.
    pub fn orec(&self) -> &Orec {
        &self.orec
    }

    /// Committed version.
    pub fn version(&self) -> u64 {
        self.orec.version()
    }

    /// Copies the committed value into `tranlocal`.
    ///
    /// With a lock mode the lock is taken first and the copy is trivially
    /// consistent. Without one the orec is arrived at (when `arrive_needed`)
    /// and the version is re-checked after the copy; a concurrent commit
    /// makes the load spin and try again. Returns `false` when the spin
    /// budget runs out; `tranlocal` is left untouched in that case.
    pub(crate) fn load(
        self: &Arc<Self>,
        tranlocal: &mut Tranlocal,
        lock_mode: LockMode,
        spin_count: usize,
        arrive_needed: bool,
    ) -> bool {
        if lock_mode != LockMode::None {
            if self.orec.arrive_and_lock(spin_count, lock_mode) != Arrival::Success {
                trace!(object = self.id, ?lock_mode, "locked load refused");
                return false;
            }
            let version = self.orec.version();
            let value = self.value.read().clone();
            tranlocal.bind(self, version, value, lock_mode, true);
            return true;
        }

        let mut spins = spin_count;
        loop {
            let registered = if arrive_needed {
                match self.orec.arrive(spin_count) {
                    Arrival::Success => true,
                    Arrival::ReadBiased => false,
                    Arrival::Unregistered => return false,
                }
            } else if self.orec.await_unlocked(spin_count) {
                false
            } else {
                return false;
            };

            let version = self.orec.version();
            let value = self.value.read().clone();
            if !self.orec.is_exclusive() && self.orec.version() == version {
                tranlocal.bind(self, version, value, LockMode::None, registered);
                return true;
            }

            if registered {
                self.orec.depart_after_failure();
            }
            if spins == 0 {
                trace!(object = self.id, "load kept racing with commits");
                return false;
            }
            spins -= 1;
            spin_loop();
        }
    }

    /// Reads a consistent committed value without any registration.
    pub(crate) fn read_consistent(&self, spin_count: usize) -> Option<Payload> {
        let mut spins = spin_count;
        loop {
            if self.orec.await_unlocked(spin_count) {
                let version = self.orec.version();
                let value = self.value.read().clone();
                if !self.orec.is_exclusive() && self.orec.version() == version {
                    return Some(value);
                }
            }
            if spins == 0 {
                return None;
            }
            spins -= 1;
            spin_loop();
        }
    }

    /// Committed value as currently stored, without consistency checks.
    pub(crate) fn weak_value(&self) -> Payload {
        self.value.read().clone()
    }

    /// Publishes a prepared dirty tranlocal: stores the value, bumps the
    /// version, releases the lock. Returns the listeners to wake.
    pub(crate) fn commit(&self, tranlocal: &mut Tranlocal) -> Option<Box<ListenerNode>> {
        debug_assert_eq!(tranlocal.lock_mode, LockMode::Exclusive);
        *self.value.write() = std::mem::take(&mut tranlocal.value);
        let chain = self.orec.publish();
        tranlocal.lock_mode = LockMode::None;
        tranlocal.has_depart_obligation = false;
        chain
    }

    /// Single-object transaction: locks exclusively, applies `f` to the
    /// committed value and publishes the result unless `f` declines or the
    /// value did not change. Returns `(old, new)`.
    pub(crate) fn atomic_update<F>(
        &self,
        spin_count: usize,
        counter: &GlobalConflictCounter,
        f: F,
    ) -> Result<(Payload, Payload)>
    where
        F: FnOnce(&Payload) -> Option<Payload>,
    {
        if self.orec.arrive_and_lock(spin_count, LockMode::Exclusive) != Arrival::Success {
            return Err(StmError::Locked("object stayed locked during atomic update"));
        }
        let old = self.value.read().clone();
        let new = match f(&old) {
            Some(new) if !new.same_as(&old) => new,
            _ => {
                self.orec.depart_after_reading_and_unlock(LockMode::Exclusive);
                return Ok((old.clone(), old));
            }
        };
        counter.signal_conflict();
        *self.value.write() = new.clone();
        let chain = self.orec.publish();
        ListenerNode::open_all(chain, &mut NoPool);
        trace!(object = self.id, version = self.orec.version(), "atomic update published");
        Ok((old, new))
    }
}

impl Tranlocal {
    /// Attaches this tranlocal to `owner` with a freshly loaded snapshot.
    pub(crate) fn bind(
        &mut self,
        owner: &Arc<TxnObject>,
        version: u64,
        value: Payload,
        lock_mode: LockMode,
        has_depart_obligation: bool,
    ) {
        self.owner = Some(Arc::clone(owner));
        self.version = version;
        self.old_value = value.clone();
        self.value = value;
        self.lock_mode = lock_mode;
        self.has_depart_obligation = has_depart_obligation;
        self.mode = TranlocalMode::Read;
    }
}
