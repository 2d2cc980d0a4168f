//! Typed transactional cells.
//!
//! Every cell is a [`TxnObject`] plus a [`TxnValue`] encoding. Primitive
//! values share the 64-bit payload (floats by bit pattern), references are
//! stored as `Arc<dyn Any>` and compared by identity.

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::stm::object::{ObjectId, Payload, PayloadKind, RefValue, TxnObject};
use crate::stm::runtime::Stm;
use crate::stm::txn::Txn;
use crate::types::{LockMode, Result};

/// Value type storable in a [`TxnCell`].
pub trait TxnValue: Clone + Send + Sync + 'static {
    /// Payload representation.
    const KIND: PayloadKind;

    /// Encodes the value.
    fn into_payload(self) -> Payload;

    /// Decodes a payload of kind [`KIND`](Self::KIND).
    fn from_payload(payload: &Payload) -> Self;
}

impl TxnValue for i64 {
    const KIND: PayloadKind = PayloadKind::Bits;

    fn into_payload(self) -> Payload {
        Payload::Bits(self as u64)
    }

    fn from_payload(payload: &Payload) -> Self {
        payload.bits() as i64
    }
}

impl TxnValue for i32 {
    const KIND: PayloadKind = PayloadKind::Bits;

    fn into_payload(self) -> Payload {
        Payload::Bits(self as i64 as u64)
    }

    fn from_payload(payload: &Payload) -> Self {
        payload.bits() as i64 as i32
    }
}

impl TxnValue for f64 {
    const KIND: PayloadKind = PayloadKind::Bits;

    fn into_payload(self) -> Payload {
        Payload::Bits(self.to_bits())
    }

    fn from_payload(payload: &Payload) -> Self {
        f64::from_bits(payload.bits())
    }
}

impl TxnValue for bool {
    const KIND: PayloadKind = PayloadKind::Bits;

    fn into_payload(self) -> Payload {
        Payload::Bits(self as u64)
    }

    fn from_payload(payload: &Payload) -> Self {
        payload.bits() != 0
    }
}

impl<T> TxnValue for Option<Arc<T>>
where
    T: Any + Send + Sync,
{
    const KIND: PayloadKind = PayloadKind::Ref;

    fn into_payload(self) -> Payload {
        Payload::Ref(self.map(|value| value as RefValue))
    }

    fn from_payload(payload: &Payload) -> Self {
        payload
            .reference()
            .and_then(|value| Arc::clone(value).downcast::<T>().ok())
    }
}

/// Numeric values supporting increments.
pub trait TxnNumber: TxnValue + Copy {
    /// `self + delta`; integers wrap.
    fn plus(self, delta: Self) -> Self;
}

impl TxnNumber for i64 {
    fn plus(self, delta: Self) -> Self {
        self.wrapping_add(delta)
    }
}

impl TxnNumber for i32 {
    fn plus(self, delta: Self) -> Self {
        self.wrapping_add(delta)
    }
}

impl TxnNumber for f64 {
    fn plus(self, delta: Self) -> Self {
        self + delta
    }
}

/// Transactional `i64`.
pub type TxnLong = TxnCell<i64>;
/// Transactional `i32`.
pub type TxnInteger = TxnCell<i32>;
/// Transactional `f64`.
pub type TxnDouble = TxnCell<f64>;
/// Transactional `bool`.
pub type TxnBoolean = TxnCell<bool>;
/// Transactional optional shared reference.
pub type TxnRef<T> = TxnCell<Option<Arc<T>>>;

/// A typed transactional memory cell.
///
/// Transactional accessors take the running [`Txn`]; the `atomic_*`
/// accessors run as their own single-object transaction.
pub struct TxnCell<V: TxnValue> {
    object: Arc<TxnObject>,
    stm: Arc<Stm>,
    marker: PhantomData<fn() -> V>,
}

impl<V: TxnValue> Clone for TxnCell<V> {
    fn clone(&self) -> Self {
        Self {
            object: Arc::clone(&self.object),
            stm: Arc::clone(&self.stm),
            marker: PhantomData,
        }
    }
}

impl<V: TxnValue> fmt::Debug for TxnCell<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxnCell")
            .field("object", &self.object)
            .finish()
    }
}

impl<V: TxnValue> TxnCell<V> {
    /// Creates a committed cell holding `initial`.
    pub fn new(stm: &Arc<Stm>, initial: V) -> Self {
        Self {
            object: stm.new_object(initial.into_payload()),
            stm: Arc::clone(stm),
            marker: PhantomData,
        }
    }

    /// Creates a cell inside `tx`; it becomes visible when `tx` commits.
    pub fn new_in(tx: &mut Txn, initial: V) -> Result<Self> {
        let object = tx.open_for_construction(initial.into_payload())?;
        Ok(Self {
            object,
            stm: Arc::clone(tx.stm()),
            marker: PhantomData,
        })
    }

    /// Identity of the underlying object.
    pub fn id(&self) -> ObjectId {
        self.object.id()
    }

    /// Underlying transactional object.
    pub fn object(&self) -> &Arc<TxnObject> {
        &self.object
    }

    /// Committed version.
    pub fn version(&self) -> u64 {
        self.object.version()
    }

    /// Reads the value seen by `tx`.
    pub fn get(&self, tx: &mut Txn) -> Result<V> {
        self.get_locked(tx, LockMode::None)
    }

    /// Reads while holding at least `lock_mode` for the rest of the attempt.
    pub fn get_locked(&self, tx: &mut Txn, lock_mode: LockMode) -> Result<V> {
        tx.read(&self.object, lock_mode)
            .map(|payload| V::from_payload(&payload))
    }

    /// Buffers `value` as this cell's new value in `tx`.
    pub fn set(&self, tx: &mut Txn, value: V) -> Result<()> {
        tx.write(&self.object, value.into_payload(), LockMode::None)
    }

    /// Sets `value` and returns the value it replaced.
    pub fn get_and_set(&self, tx: &mut Txn, value: V) -> Result<V> {
        let old = self.get(tx)?;
        self.set(tx, value)?;
        Ok(old)
    }

    /// Reads, applies `f` and writes back; returns the new value.
    pub fn alter<F>(&self, tx: &mut Txn, f: F) -> Result<V>
    where
        F: FnOnce(V) -> V,
    {
        let new = f(self.get(tx)?);
        self.set(tx, new.clone())?;
        Ok(new)
    }

    /// Defers `f` to commit time without reading the cell now.
    pub fn commute<F>(&self, tx: &mut Txn, f: F) -> Result<()>
    where
        F: Fn(V) -> V + Send + 'static,
    {
        tx.commute(
            &self.object,
            Box::new(move |payload| f(V::from_payload(payload)).into_payload()),
        )
    }

    /// Protects the read of this cell against write skew.
    pub fn ensure(&self, tx: &mut Txn) -> Result<()> {
        tx.ensure(&self.object)
    }

    /// Takes `lock_mode` on the cell until `tx` finishes.
    pub fn acquire(&self, tx: &mut Txn, lock_mode: LockMode) -> Result<()> {
        tx.acquire(&self.object, lock_mode)
    }

    /// Blocks (through retry) until the cell holds `expected`.
    ///
    /// Equality is payload equality: bit patterns for primitives, identity
    /// for references.
    pub fn await_value(&self, tx: &mut Txn, expected: V) -> Result<()> {
        let current = tx.read(&self.object, LockMode::None)?;
        if current.same_as(&expected.into_payload()) {
            Ok(())
        } else {
            tx.retry()
        }
    }

    /// Consistent committed value.
    pub fn atomic_get(&self) -> Result<V> {
        self.object
            .read_consistent(self.stm.config().spin_count)
            .map(|payload| V::from_payload(&payload))
            .ok_or(crate::types::StmError::Locked("object stayed exclusively locked"))
    }

    /// Last published value, without waiting for locks or validating.
    pub fn atomic_weak_get(&self) -> V {
        V::from_payload(&self.object.weak_value())
    }

    /// Publishes `value` in a single-object transaction.
    pub fn atomic_set(&self, value: V) -> Result<()> {
        self.atomic_get_and_set(value).map(|_| ())
    }

    /// Publishes `value` and returns the previous committed value.
    pub fn atomic_get_and_set(&self, value: V) -> Result<V> {
        let payload = value.into_payload();
        let (old, _) = self.atomic_update(move |_| Some(payload))?;
        Ok(V::from_payload(&old))
    }

    /// Sets `value` if the cell currently holds `expected` (payload equality).
    pub fn atomic_compare_and_set(&self, expected: V, value: V) -> Result<bool> {
        let expected = expected.into_payload();
        let value = value.into_payload();
        let mut swapped = false;
        self.atomic_update(|current| {
            if current.same_as(&expected) {
                swapped = true;
                Some(value)
            } else {
                None
            }
        })?;
        Ok(swapped)
    }

    fn atomic_update<F>(&self, f: F) -> Result<(Payload, Payload)>
    where
        F: FnOnce(&Payload) -> Option<Payload>,
    {
        self.object.atomic_update(
            self.stm.config().spin_count,
            self.stm.conflict_counter(),
            f,
        )
    }
}

impl<V: TxnNumber> TxnCell<V> {
    /// Commuting increment: concurrent increments never conflict.
    pub fn increment(&self, tx: &mut Txn, delta: V) -> Result<()> {
        self.commute(tx, move |value| value.plus(delta))
    }

    /// Adds `delta` and returns the previous value.
    pub fn get_and_increment(&self, tx: &mut Txn, delta: V) -> Result<V> {
        let old = self.get(tx)?;
        self.set(tx, old.plus(delta))?;
        Ok(old)
    }

    /// Adds `delta` and returns the new value.
    pub fn increment_and_get(&self, tx: &mut Txn, delta: V) -> Result<V> {
        self.alter(tx, |value| value.plus(delta))
    }

    /// Adds `delta` outside any transaction; returns the new value.
    pub fn atomic_increment_and_get(&self, delta: V) -> Result<V> {
        let (_, new) = self.atomic_update(|current| Some(V::from_payload(current).plus(delta).into_payload()))?;
        Ok(V::from_payload(&new))
    }

    /// Adds `delta` outside any transaction; returns the old value.
    pub fn atomic_get_and_increment(&self, delta: V) -> Result<V> {
        let (old, _) = self.atomic_update(|current| Some(V::from_payload(current).plus(delta).into_payload()))?;
        Ok(V::from_payload(&old))
    }
}
