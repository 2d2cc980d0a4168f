//! Per-transaction recycling of tranlocals, tranlocal arrays and listener
//! nodes.
//!
//! A pool is leased by exactly one transaction at a time (and moves with it
//! across attempts), so it needs no synchronisation. When the transaction is
//! dropped the pool goes back to its runtime and the next transaction leases
//! it, free lists included. Everything handed back must be cleared; the pool
//! never hands out an object that still references an orec or a latch.

use crate::stm::listeners::ListenerNode;
use crate::stm::tranlocal::Tranlocal;

/// Default number of entries kept per free list.
pub const DEFAULT_POOL_LIMIT: usize = 64;

/// Number of idle pools a runtime keeps for later transactions.
pub const MAX_IDLE_POOLS: usize = 256;

/// Source of recyclable transaction scratch objects.
pub trait ObjectPool: Send + std::fmt::Debug {
    /// Takes a cleared tranlocal.
    fn take_tranlocal(&mut self) -> Tranlocal;

    /// Returns a tranlocal; it is cleared before reuse.
    fn put_tranlocal(&mut self, tranlocal: Tranlocal);

    /// Takes an empty tranlocal array with room for at least `capacity`.
    fn take_array(&mut self, capacity: usize) -> Vec<Tranlocal>;

    /// Returns an array; remaining entries are dropped.
    fn put_array(&mut self, array: Vec<Tranlocal>);

    /// Takes a cleared listener node.
    fn take_listener(&mut self) -> Box<ListenerNode>;

    /// Returns a listener node; it is cleared before reuse.
    fn put_listener(&mut self, node: Box<ListenerNode>);

    /// Current occupancy.
    fn stats(&self) -> PoolStats {
        PoolStats::default()
    }

    /// Whether a runtime should keep this pool for the next transaction.
    fn is_recyclable(&self) -> bool {
        false
    }
}

/// Free-list occupancy, for tests and diagnostics.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PoolStats {
    /// Pooled tranlocals.
    pub tranlocals: usize,
    /// Pooled arrays.
    pub arrays: usize,
    /// Pooled listener nodes.
    pub listeners: usize,
}

/// Bounded free lists.
#[derive(Debug)]
pub struct FreeListPool {
    tranlocals: Vec<Tranlocal>,
    arrays: Vec<Vec<Tranlocal>>,
    listeners: Vec<Box<ListenerNode>>,
    limit: usize,
}

impl FreeListPool {
    /// Creates a pool keeping at most `limit` entries per free list.
    pub fn new(limit: usize) -> Self {
        Self {
            tranlocals: Vec::new(),
            arrays: Vec::new(),
            listeners: Vec::new(),
            limit,
        }
    }
}

impl Default for FreeListPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_LIMIT)
    }
}

impl ObjectPool for FreeListPool {
    fn take_tranlocal(&mut self) -> Tranlocal {
        self.tranlocals.pop().unwrap_or_default()
    }

    fn put_tranlocal(&mut self, mut tranlocal: Tranlocal) {
        if self.tranlocals.len() >= self.limit {
            return;
        }
        tranlocal.clear();
        self.tranlocals.push(tranlocal);
    }

    fn take_array(&mut self, capacity: usize) -> Vec<Tranlocal> {
        match self.arrays.iter().position(|a| a.capacity() >= capacity) {
            Some(idx) => self.arrays.swap_remove(idx),
            None => Vec::with_capacity(capacity),
        }
    }

    fn put_array(&mut self, mut array: Vec<Tranlocal>) {
        if self.arrays.len() >= self.limit || array.capacity() == 0 {
            return;
        }
        array.clear();
        self.arrays.push(array);
    }

    fn take_listener(&mut self) -> Box<ListenerNode> {
        self.listeners.pop().unwrap_or_default()
    }

    fn put_listener(&mut self, mut node: Box<ListenerNode>) {
        if self.listeners.len() >= self.limit {
            return;
        }
        node.clear();
        self.listeners.push(node);
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            tranlocals: self.tranlocals.len(),
            arrays: self.arrays.len(),
            listeners: self.listeners.len(),
        }
    }

    fn is_recyclable(&self) -> bool {
        true
    }
}

/// Pool that always allocates; used when pooling is disabled and for
/// one-shot atomic operations.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoPool;

impl ObjectPool for NoPool {
    fn take_tranlocal(&mut self) -> Tranlocal {
        Tranlocal::default()
    }

    fn put_tranlocal(&mut self, _tranlocal: Tranlocal) {}

    fn take_array(&mut self, capacity: usize) -> Vec<Tranlocal> {
        Vec::with_capacity(capacity)
    }

    fn put_array(&mut self, _array: Vec<Tranlocal>) {}

    fn take_listener(&mut self) -> Box<ListenerNode> {
        Box::default()
    }

    fn put_listener(&mut self, _node: Box<ListenerNode>) {}
}
