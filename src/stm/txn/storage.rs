//! Tranlocal containers, one per flavor size class.

use std::slice;

use rustc_hash::FxHashMap;

use crate::stm::object::ObjectId;
use crate::stm::pool::ObjectPool;
use crate::stm::tranlocal::Tranlocal;

/// Storage of the tranlocals opened by one transaction attempt.
pub(crate) trait TranlocalStorage {
    /// Maximum number of tranlocals, or `None` when unbounded.
    fn capacity(&self) -> Option<usize>;

    /// Tranlocals currently held.
    fn as_slice(&self) -> &[Tranlocal];

    /// Mutable view of the held tranlocals.
    fn as_mut_slice(&mut self) -> &mut [Tranlocal];

    /// Position of the tranlocal shadowing `id`.
    fn find(&self, id: ObjectId) -> Option<usize>;

    /// Appends a bound tranlocal; the caller checked the capacity.
    fn push(&mut self, tranlocal: Tranlocal) -> usize;

    /// Moves every tranlocal out, in insertion order.
    fn drain(&mut self, sink: &mut dyn FnMut(Tranlocal));

    /// Number of tranlocals held.
    fn len(&self) -> usize {
        self.as_slice().len()
    }

    /// Whether another tranlocal fits.
    fn has_room(&self) -> bool {
        self.capacity().map_or(true, |cap| self.len() < cap)
    }
}

/// Exactly one slot.
#[derive(Debug, Default)]
pub(crate) struct MonoStorage {
    slot: Option<Tranlocal>,
}

impl TranlocalStorage for MonoStorage {
    fn capacity(&self) -> Option<usize> {
        Some(1)
    }

    fn as_slice(&self) -> &[Tranlocal] {
        match &self.slot {
            Some(tranlocal) => slice::from_ref(tranlocal),
            None => &[],
        }
    }

    fn as_mut_slice(&mut self) -> &mut [Tranlocal] {
        match &mut self.slot {
            Some(tranlocal) => slice::from_mut(tranlocal),
            None => &mut [],
        }
    }

    fn find(&self, id: ObjectId) -> Option<usize> {
        self.slot
            .as_ref()
            .filter(|t| t.owner_id() == Some(id))
            .map(|_| 0)
    }

    fn push(&mut self, tranlocal: Tranlocal) -> usize {
        debug_assert!(self.slot.is_none());
        self.slot = Some(tranlocal);
        0
    }

    fn drain(&mut self, sink: &mut dyn FnMut(Tranlocal)) {
        if let Some(tranlocal) = self.slot.take() {
            sink(tranlocal);
        }
    }
}

/// Bounded array searched linearly; cheap for the small transactions that
/// dominate real workloads.
#[derive(Debug)]
pub(crate) struct FixedStorage {
    items: Vec<Tranlocal>,
    capacity: usize,
}

impl FixedStorage {
    pub(crate) fn new(items: Vec<Tranlocal>, capacity: usize) -> Self {
        Self { items, capacity }
    }

    pub(crate) fn into_array(self) -> Vec<Tranlocal> {
        self.items
    }
}

impl TranlocalStorage for FixedStorage {
    fn capacity(&self) -> Option<usize> {
        Some(self.capacity)
    }

    fn as_slice(&self) -> &[Tranlocal] {
        &self.items
    }

    fn as_mut_slice(&mut self) -> &mut [Tranlocal] {
        &mut self.items
    }

    fn find(&self, id: ObjectId) -> Option<usize> {
        self.items.iter().position(|t| t.owner_id() == Some(id))
    }

    fn push(&mut self, tranlocal: Tranlocal) -> usize {
        self.items.push(tranlocal);
        self.items.len() - 1
    }

    fn drain(&mut self, sink: &mut dyn FnMut(Tranlocal)) {
        for tranlocal in self.items.drain(..) {
            sink(tranlocal);
        }
    }
}

/// Unbounded storage with a hash index.
#[derive(Debug)]
pub(crate) struct VariableStorage {
    items: Vec<Tranlocal>,
    index: FxHashMap<ObjectId, usize>,
}

impl VariableStorage {
    pub(crate) fn new(items: Vec<Tranlocal>) -> Self {
        Self {
            index: FxHashMap::with_capacity_and_hasher(items.capacity(), Default::default()),
            items,
        }
    }

    pub(crate) fn into_array(self) -> Vec<Tranlocal> {
        self.items
    }
}

impl TranlocalStorage for VariableStorage {
    fn capacity(&self) -> Option<usize> {
        None
    }

    fn as_slice(&self) -> &[Tranlocal] {
        &self.items
    }

    fn as_mut_slice(&mut self) -> &mut [Tranlocal] {
        &mut self.items
    }

    fn find(&self, id: ObjectId) -> Option<usize> {
        self.index.get(&id).copied()
    }

    fn push(&mut self, tranlocal: Tranlocal) -> usize {
        let idx = self.items.len();
        if let Some(id) = tranlocal.owner_id() {
            self.index.insert(id, idx);
        }
        self.items.push(tranlocal);
        idx
    }

    fn drain(&mut self, sink: &mut dyn FnMut(Tranlocal)) {
        self.index.clear();
        for tranlocal in self.items.drain(..) {
            sink(tranlocal);
        }
    }
}

/// Storage of the current attempt, selected by its flavor.
#[derive(Debug)]
pub(crate) enum Tranlocals {
    Mono(MonoStorage),
    Fixed(FixedStorage),
    Variable(VariableStorage),
}

impl Tranlocals {
    pub(crate) fn mono() -> Self {
        Tranlocals::Mono(MonoStorage::default())
    }

    pub(crate) fn fixed(pool: &mut dyn ObjectPool, capacity: usize) -> Self {
        Tranlocals::Fixed(FixedStorage::new(pool.take_array(capacity), capacity))
    }

    pub(crate) fn variable(pool: &mut dyn ObjectPool, initial_capacity: usize) -> Self {
        Tranlocals::Variable(VariableStorage::new(pool.take_array(initial_capacity)))
    }

    /// Hands the backing array back to `pool`; the storage must be empty.
    pub(crate) fn recycle(self, pool: &mut dyn ObjectPool) {
        debug_assert!(self.len() == 0);
        match self {
            Tranlocals::Mono(_) => {}
            Tranlocals::Fixed(storage) => pool.put_array(storage.into_array()),
            Tranlocals::Variable(storage) => pool.put_array(storage.into_array()),
        }
    }

    fn inner(&self) -> &dyn TranlocalStorage {
        match self {
            Tranlocals::Mono(storage) => storage,
            Tranlocals::Fixed(storage) => storage,
            Tranlocals::Variable(storage) => storage,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn TranlocalStorage {
        match self {
            Tranlocals::Mono(storage) => storage,
            Tranlocals::Fixed(storage) => storage,
            Tranlocals::Variable(storage) => storage,
        }
    }
}

impl TranlocalStorage for Tranlocals {
    fn capacity(&self) -> Option<usize> {
        self.inner().capacity()
    }

    fn as_slice(&self) -> &[Tranlocal] {
        self.inner().as_slice()
    }

    fn as_mut_slice(&mut self) -> &mut [Tranlocal] {
        self.inner_mut().as_mut_slice()
    }

    fn find(&self, id: ObjectId) -> Option<usize> {
        self.inner().find(id)
    }

    fn push(&mut self, tranlocal: Tranlocal) -> usize {
        self.inner_mut().push(tranlocal)
    }

    fn drain(&mut self, sink: &mut dyn FnMut(Tranlocal)) {
        self.inner_mut().drain(sink)
    }
}
