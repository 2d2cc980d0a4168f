//! The runtime handle shared by every object and transaction.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, info};

use crate::primitives::concurrency::GlobalConflictCounter;
use crate::stm::config::{StmConfig, TxnConfig};
use crate::stm::executor::TxnExecutor;
use crate::stm::object::{ObjectId, Payload, PayloadKind, TxnObject};
use crate::stm::pool::{FreeListPool, NoPool, ObjectPool, PoolStats, MAX_IDLE_POOLS};
use crate::stm::speculative::SpeculativeConfiguration;
use crate::stm::txn::Txn;
use crate::types::Result;

/// Family used by [`Stm::atomically`].
pub const DEFAULT_FAMILY: &str = "default";

/// A transactional memory runtime.
///
/// Owns the state every transaction shares: the conflict counter, the
/// speculative profiles of each family and the object id sequence. Objects
/// and transactions of different runtimes must not be mixed.
#[derive(Debug)]
pub struct Stm {
    config: StmConfig,
    conflict_counter: GlobalConflictCounter,
    next_object_id: AtomicU64,
    profiles: Mutex<FxHashMap<String, Arc<SpeculativeConfiguration>>>,
    idle_pools: Mutex<Vec<Box<dyn ObjectPool>>>,
}

impl Stm {
    /// Creates a runtime after validating `config`.
    pub fn new(config: StmConfig) -> Result<Arc<Self>> {
        config.validate()?;
        info!(
            spin_count = config.spin_count,
            max_fixed_length = config.max_fixed_length,
            pooling = config.pooling,
            "stm runtime created"
        );
        Ok(Arc::new(Self {
            config,
            conflict_counter: GlobalConflictCounter::new(),
            next_object_id: AtomicU64::new(1),
            profiles: Mutex::new(FxHashMap::default()),
            idle_pools: Mutex::new(Vec::new()),
        }))
    }

    /// Runtime with [`StmConfig::default`].
    pub fn with_defaults() -> Arc<Self> {
        Arc::new(Self {
            config: StmConfig::default(),
            conflict_counter: GlobalConflictCounter::new(),
            next_object_id: AtomicU64::new(1),
            profiles: Mutex::new(FxHashMap::default()),
            idle_pools: Mutex::new(Vec::new()),
        })
    }

    /// Runtime-wide settings.
    pub fn config(&self) -> &StmConfig {
        &self.config
    }

    /// Counter bumped by every commit that publishes a write.
    pub fn conflict_counter(&self) -> &GlobalConflictCounter {
        &self.conflict_counter
    }

    /// Shared speculative profile of `family`, created on first use.
    pub fn speculative_config(&self, family: &str) -> Arc<SpeculativeConfiguration> {
        let mut profiles = self.profiles.lock();
        if let Some(profile) = profiles.get(family) {
            return Arc::clone(profile);
        }
        debug!(family, "speculative profile created");
        let profile = Arc::new(SpeculativeConfiguration::new(self.config.max_fixed_length));
        profiles.insert(family.to_owned(), Arc::clone(&profile));
        profile
    }

    /// Family configuration seeded with this runtime's defaults.
    pub fn txn_config(&self, family: impl Into<String>) -> TxnConfig {
        TxnConfig::from_stm_config(family, &self.config)
    }

    /// Starts a standalone transaction; the caller drives commit and abort.
    pub fn new_txn(self: &Arc<Self>, config: TxnConfig) -> Result<Txn> {
        config.validate()?;
        Ok(Txn::new(Arc::clone(self), Arc::new(config)))
    }

    /// Executor running closures under `config`.
    pub fn executor(self: &Arc<Self>, config: TxnConfig) -> Result<TxnExecutor> {
        TxnExecutor::new(Arc::clone(self), config)
    }

    /// Runs `body` atomically in the default family.
    pub fn atomically<T, F>(self: &Arc<Self>, body: F) -> Result<T>
    where
        F: FnMut(&mut Txn) -> Result<T>,
    {
        self.executor(self.txn_config(DEFAULT_FAMILY))?.execute(body)
    }

    fn next_id(&self) -> ObjectId {
        self.next_object_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Creates a committed object holding `initial`.
    pub fn new_object(&self, initial: Payload) -> Arc<TxnObject> {
        Arc::new(TxnObject::new(
            self.next_id(),
            initial,
            self.config.read_biased_threshold,
        ))
    }

    pub(crate) fn new_constructed_object(&self, kind: PayloadKind) -> Arc<TxnObject> {
        Arc::new(TxnObject::new_constructed(
            self.next_id(),
            kind,
            self.config.read_biased_threshold,
        ))
    }

    /// Hands out an idle pool, or a fresh one when none is left.
    pub(crate) fn lease_pool(&self) -> Box<dyn ObjectPool> {
        if !self.config.pooling {
            return Box::new(NoPool);
        }
        match self.idle_pools.lock().pop() {
            Some(pool) => pool,
            None => Box::new(FreeListPool::new(self.config.pool_limit)),
        }
    }

    /// Takes back a pool whose transaction is gone.
    pub(crate) fn return_pool(&self, pool: Box<dyn ObjectPool>) {
        if !pool.is_recyclable() {
            return;
        }
        let mut idle = self.idle_pools.lock();
        if idle.len() < MAX_IDLE_POOLS {
            idle.push(pool);
        }
    }

    /// Combined occupancy of the pools not leased by any transaction.
    pub fn idle_pool_stats(&self) -> PoolStats {
        self.idle_pools
            .lock()
            .iter()
            .map(|pool| pool.stats())
            .fold(PoolStats::default(), |acc, stats| PoolStats {
                tranlocals: acc.tranlocals + stats.tranlocals,
                arrays: acc.arrays + stats.arrays,
                listeners: acc.listeners + stats.listeners,
            })
    }

    /// Number of pools waiting for a transaction.
    pub fn idle_pool_count(&self) -> usize {
        self.idle_pools.lock().len()
    }
}
