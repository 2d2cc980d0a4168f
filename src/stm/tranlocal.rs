//! Transaction-private view of one object.

use std::fmt;
use std::sync::Arc;

use crate::stm::object::{ObjectId, Payload, TxnObject};
use crate::types::LockMode;

/// Deferred update registered by a commuting operation.
pub type CommuteFn = Box<dyn Fn(&Payload) -> Payload + Send>;

/// How a transaction uses an object.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum TranlocalMode {
    /// Read only.
    #[default]
    Read,
    /// Read and (possibly) written.
    Write,
    /// Created by this transaction.
    Construct,
    /// Only commuting updates so far; no snapshot was taken.
    Commute,
}

/// Snapshot and write buffer for one object inside one transaction.
///
/// Invariants: a held lock implies a depart obligation; `Construct`
/// tranlocals hold the exclusive lock from birth; `pending` is empty unless
/// the mode is `Commute`.
#[derive(Default)]
pub struct Tranlocal {
    pub(crate) owner: Option<Arc<TxnObject>>,
    pub(crate) version: u64,
    pub(crate) value: Payload,
    pub(crate) old_value: Payload,
    pub(crate) lock_mode: LockMode,
    pub(crate) has_depart_obligation: bool,
    pub(crate) mode: TranlocalMode,
    pub(crate) is_dirty: bool,
    pub(crate) conflict_check_needed: bool,
    pub(crate) pending: Vec<CommuteFn>,
}

impl fmt::Debug for Tranlocal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tranlocal")
            .field("owner", &self.owner_id())
            .field("version", &self.version)
            .field("value", &self.value)
            .field("lock_mode", &self.lock_mode)
            .field("has_depart_obligation", &self.has_depart_obligation)
            .field("mode", &self.mode)
            .field("is_dirty", &self.is_dirty)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl Tranlocal {
    /// Identity of the object this tranlocal shadows.
    pub fn owner_id(&self) -> Option<ObjectId> {
        self.owner.as_ref().map(|o| o.id())
    }

    /// Usage mode.
    pub fn mode(&self) -> TranlocalMode {
        self.mode
    }

    /// Lock held through this tranlocal.
    pub fn lock_mode(&self) -> LockMode {
        self.lock_mode
    }

    /// Whether the tranlocal carries a loaded snapshot whose version can be
    /// validated.
    pub(crate) fn tracks_version(&self) -> bool {
        self.owner.is_some()
            && matches!(self.mode, TranlocalMode::Read | TranlocalMode::Write)
    }

    /// Converts a read into a write, remembering the loaded value for the
    /// dirty check.
    pub(crate) fn upgrade_to_write(&mut self) {
        if self.mode == TranlocalMode::Read {
            self.old_value = self.value.clone();
            self.mode = TranlocalMode::Write;
        }
    }

    /// Attaches a commute-only tranlocal to `owner`; nothing is loaded.
    pub(crate) fn bind_commuting(&mut self, owner: &Arc<TxnObject>) {
        self.owner = Some(Arc::clone(owner));
        self.mode = TranlocalMode::Commute;
        self.value = Payload::empty(owner.kind());
        self.old_value = Payload::empty(owner.kind());
    }

    /// Attaches a tranlocal to an object this transaction just created.
    pub(crate) fn bind_constructed(&mut self, owner: &Arc<TxnObject>, initial: Payload) {
        self.owner = Some(Arc::clone(owner));
        self.version = 0;
        self.old_value = Payload::empty(owner.kind());
        self.value = initial;
        self.lock_mode = LockMode::Exclusive;
        self.has_depart_obligation = true;
        self.mode = TranlocalMode::Construct;
        self.is_dirty = true;
    }

    fn apply_pending(&mut self, base: Payload) -> Payload {
        self.pending.drain(..).fold(base, |value, f| f(&value))
    }

    /// Resolves a commute-only tranlocal into a regular write: loads the
    /// committed value and replays the pending functions in order.
    pub(crate) fn evaluate_commuting(&mut self, spin_count: usize, arrive_needed: bool) -> bool {
        let Some(owner) = self.owner.clone() else {
            return false;
        };
        let pending = std::mem::take(&mut self.pending);
        if !owner.load(self, LockMode::None, spin_count, arrive_needed) {
            self.pending = pending;
            return false;
        }
        self.pending = pending;
        let loaded = self.value.clone();
        self.value = self.apply_pending(loaded);
        self.mode = TranlocalMode::Write;
        true
    }

    /// Acquires the locks needed to commit and validates the snapshot.
    ///
    /// Dirty writes take the exclusive lock; clean tranlocals that still need
    /// a conflict check (ensured reads, serializable isolation) take a read
    /// lock. Commute-only tranlocals lock exclusively and evaluate against
    /// the value that is current at that point, which is why they can never
    /// conflict.
    pub(crate) fn prepare(&mut self, dirty_check: bool, spin_count: usize) -> bool {
        let Some(owner) = self.owner.clone() else {
            return false;
        };
        let orec = owner.orec();
        match self.mode {
            TranlocalMode::Construct => {
                self.is_dirty = true;
                true
            }
            TranlocalMode::Read => {
                !self.conflict_check_needed
                    || orec.try_lock_and_check_conflict(self, spin_count, LockMode::Read)
            }
            TranlocalMode::Write => {
                self.is_dirty = !dirty_check || !self.value.same_as(&self.old_value);
                if self.is_dirty {
                    orec.try_lock_and_check_conflict(self, spin_count, LockMode::Exclusive)
                } else {
                    !self.conflict_check_needed
                        || orec.try_lock_and_check_conflict(self, spin_count, LockMode::Read)
                }
            }
            TranlocalMode::Commute => {
                if !orec.try_lock_and_check_conflict(self, spin_count, LockMode::Exclusive) {
                    return false;
                }
                self.version = orec.version();
                let current = owner.weak_value();
                self.old_value = current.clone();
                self.value = self.apply_pending(current);
                self.mode = TranlocalMode::Write;
                self.is_dirty = !dirty_check || !self.value.same_as(&self.old_value);
                true
            }
        }
    }

    /// Releases the interest of a tranlocal that was not published.
    pub(crate) fn depart_after_commit(&mut self) {
        if let Some(owner) = &self.owner {
            if self.has_depart_obligation {
                match self.lock_mode {
                    LockMode::None => owner.orec().depart_after_reading(),
                    held => owner.orec().depart_after_reading_and_unlock(held),
                }
            }
        }
        self.has_depart_obligation = false;
        self.lock_mode = LockMode::None;
    }

    /// Releases the interest of a tranlocal whose transaction aborted.
    ///
    /// Objects constructed by the transaction stay exclusively locked so
    /// they never become visible.
    pub(crate) fn depart_after_failure(&mut self) {
        if let Some(owner) = &self.owner {
            if self.has_depart_obligation && self.mode != TranlocalMode::Construct {
                match self.lock_mode {
                    LockMode::None => owner.orec().depart_after_failure(),
                    held => owner.orec().depart_after_failure_and_unlock(held),
                }
            }
        }
        self.has_depart_obligation = false;
        self.lock_mode = LockMode::None;
    }

    /// Resets every field so the tranlocal can be pooled.
    pub(crate) fn clear(&mut self) {
        self.owner = None;
        self.version = 0;
        self.value = Payload::default();
        self.old_value = Payload::default();
        self.lock_mode = LockMode::None;
        self.has_depart_obligation = false;
        self.mode = TranlocalMode::Read;
        self.is_dirty = false;
        self.conflict_check_needed = false;
        self.pending.clear();
    }
}
