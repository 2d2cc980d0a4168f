//! Runtime-wide and per-family configuration.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::primitives::concurrency::{BackoffPolicy, ExponentialBackoffPolicy, InterruptToken};
use crate::stm::orec::MAX_READONLY_COUNT;
use crate::stm::txn::TxnListener;
use crate::types::{IsolationLevel, LockMode, Result, StmError};

/// Policy shared by every transaction of one [`Stm`](crate::stm::Stm).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StmConfig {
    /// Spins spent waiting on a locked orec before reporting failure.
    pub spin_count: usize,
    /// Consecutive read-only departures that make an orec read biased.
    pub read_biased_threshold: u32,
    /// Largest object count served by the fixed-length flavors.
    pub max_fixed_length: usize,
    /// Read sets larger than this are not rescanned; a conflict is assumed.
    pub maximum_poor_mans_conflict_scan_length: usize,
    /// Recycle tranlocals and listener nodes through a per-transaction pool.
    pub pooling: bool,
    /// Free-list capacity of each pooled kind.
    pub pool_limit: usize,
    /// Default dirty check for new transaction families.
    pub dirty_check: bool,
    /// Default isolation for new transaction families.
    pub isolation: IsolationLevel,
    /// Default retry bound for new transaction families.
    pub max_retries: u32,
}

impl Default for StmConfig {
    fn default() -> Self {
        Self {
            spin_count: 64,
            read_biased_threshold: 128,
            max_fixed_length: 20,
            maximum_poor_mans_conflict_scan_length: 1024,
            pooling: true,
            pool_limit: 64,
            dirty_check: true,
            isolation: IsolationLevel::Snapshot,
            max_retries: 1000,
        }
    }
}

impl StmConfig {
    /// Longer spins and quicker read-biasing for heavily shared objects.
    pub fn high_contention() -> Self {
        Self {
            spin_count: 512,
            read_biased_threshold: 32,
            max_retries: 10_000,
            ..Self::default()
        }
    }

    /// Allocation baseline: no pooling, read-biasing effectively off.
    pub fn baseline() -> Self {
        Self {
            pooling: false,
            read_biased_threshold: MAX_READONLY_COUNT,
            ..Self::default()
        }
    }

    /// Parses a TOML document; missing keys keep their defaults.
    pub fn from_toml_str(contents: &str) -> std::result::Result<Self, ConfigError> {
        let config: StmConfig =
            toml::from_str(contents).map_err(|source| ConfigError::Parse {
                path: None,
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> std::result::Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: StmConfig =
            toml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: Some(path.to_path_buf()),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Renders the configuration as TOML.
    pub fn to_toml_string(&self) -> std::result::Result<String, ConfigError> {
        toml::to_string(self).map_err(|source| ConfigError::Serialize { source })
    }

    /// Rejects values the orec layout or the flavors cannot represent.
    pub fn validate(&self) -> Result<()> {
        if self.read_biased_threshold == 0 || self.read_biased_threshold > MAX_READONLY_COUNT {
            return Err(StmError::Invalid("read_biased_threshold must be within 1..=1023"));
        }
        if self.max_fixed_length < 2 {
            return Err(StmError::Invalid("max_fixed_length must be at least 2"));
        }
        if self.max_retries == 0 {
            return Err(StmError::Invalid("max_retries must be positive"));
        }
        Ok(())
    }
}

/// Failures while loading an [`StmConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read stm config {path}: {source}")]
    Read {
        /// File that was requested.
        path: PathBuf,
        /// Underlying I/O failure.
        source: std::io::Error,
    },
    /// The document is not valid TOML for [`StmConfig`].
    #[error("failed to parse stm config{}: {source}", path.as_ref().map(|p| format!(" {}", p.display())).unwrap_or_default())]
    Parse {
        /// File the document came from, if any.
        path: Option<PathBuf>,
        /// TOML decoding failure.
        source: toml::de::Error,
    },
    /// Rendering as TOML failed.
    #[error("failed to serialize stm config: {source}")]
    Serialize {
        /// TOML encoding failure.
        source: toml::ser::Error,
    },
    /// The values were rejected by [`StmConfig::validate`].
    #[error(transparent)]
    Invalid(#[from] StmError),
}

/// Configuration of one transaction family.
///
/// Built with chained setters and checked by [`validate`](Self::validate)
/// before the first transaction is created.
#[derive(Clone)]
pub struct TxnConfig {
    /// Name keying the speculative profile.
    pub family_name: String,
    /// Isolation level.
    pub isolation: IsolationLevel,
    /// Lock taken by every read.
    pub read_lock_mode: LockMode,
    /// Lock taken by every write.
    pub write_lock_mode: LockMode,
    /// Skip publishing writes that did not change the value.
    pub dirty_check: bool,
    /// Attempts allowed before [`StmError::TooManyRetries`].
    pub max_retries: u32,
    /// Budget for blocking retries, carried across attempts.
    pub timeout: Option<Duration>,
    /// Start lean and escalate on demand.
    pub speculative: bool,
    /// Allow the blocking retry to be interrupted.
    pub interruptible: bool,
    /// Token used to interrupt a blocked retry.
    pub interrupt_token: Option<Arc<InterruptToken>>,
    /// Allow explicit retry to block.
    pub blocking_allowed: bool,
    /// Pacing after conflicts.
    pub backoff: Arc<dyn BackoffPolicy>,
    /// Listeners attached to every attempt.
    pub permanent_listeners: Vec<Arc<dyn TxnListener>>,
    /// Reject writes.
    pub readonly: bool,
}

impl fmt::Debug for TxnConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxnConfig")
            .field("family_name", &self.family_name)
            .field("isolation", &self.isolation)
            .field("read_lock_mode", &self.read_lock_mode)
            .field("write_lock_mode", &self.write_lock_mode)
            .field("dirty_check", &self.dirty_check)
            .field("max_retries", &self.max_retries)
            .field("timeout", &self.timeout)
            .field("speculative", &self.speculative)
            .field("interruptible", &self.interruptible)
            .field("blocking_allowed", &self.blocking_allowed)
            .field("backoff", &self.backoff)
            .field("permanent_listeners", &self.permanent_listeners.len())
            .field("readonly", &self.readonly)
            .finish()
    }
}

impl TxnConfig {
    /// Defaults for a new family.
    pub fn new(family_name: impl Into<String>) -> Self {
        Self {
            family_name: family_name.into(),
            isolation: IsolationLevel::Snapshot,
            read_lock_mode: LockMode::None,
            write_lock_mode: LockMode::None,
            dirty_check: true,
            max_retries: 1000,
            timeout: None,
            speculative: true,
            interruptible: false,
            interrupt_token: None,
            blocking_allowed: true,
            backoff: Arc::new(ExponentialBackoffPolicy::default()),
            permanent_listeners: Vec::new(),
            readonly: false,
        }
    }

    /// Defaults taken from the runtime policy.
    pub fn from_stm_config(family_name: impl Into<String>, stm: &StmConfig) -> Self {
        Self {
            isolation: stm.isolation,
            dirty_check: stm.dirty_check,
            max_retries: stm.max_retries,
            ..Self::new(family_name)
        }
    }

    /// Isolation level of the family.
    pub fn isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }

    /// Lock taken by every read.
    pub fn read_lock_mode(mut self, mode: LockMode) -> Self {
        self.read_lock_mode = mode;
        self
    }

    /// Lock taken by every write.
    pub fn write_lock_mode(mut self, mode: LockMode) -> Self {
        self.write_lock_mode = mode;
        self
    }

    /// Skip publishing writes that leave the value unchanged.
    pub fn dirty_check(mut self, enabled: bool) -> Self {
        self.dirty_check = enabled;
        self
    }

    /// Attempts allowed before giving up with `TooManyRetries`.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Total time blocking retries may wait.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Start in the cheapest flavor the family profile allows.
    pub fn speculative(mut self, enabled: bool) -> Self {
        self.speculative = enabled;
        self
    }

    /// Makes blocking retries interruptible through `token`.
    pub fn interrupt_token(mut self, token: Arc<InterruptToken>) -> Self {
        self.interrupt_token = Some(token);
        self.interruptible = true;
        self
    }

    /// Whether `retry` may block at all.
    pub fn blocking_allowed(mut self, allowed: bool) -> Self {
        self.blocking_allowed = allowed;
        self
    }

    /// Delay applied between conflicting attempts.
    pub fn backoff(mut self, policy: Arc<dyn BackoffPolicy>) -> Self {
        self.backoff = policy;
        self
    }

    /// Listener notified for every transaction of the family.
    pub fn permanent_listener(mut self, listener: Arc<dyn TxnListener>) -> Self {
        self.permanent_listeners.push(listener);
        self
    }

    /// Reject writes in this family.
    pub fn readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }

    /// Checks the combination of settings.
    pub fn validate(&self) -> Result<()> {
        if self.family_name.is_empty() {
            return Err(StmError::Invalid("family name must not be empty"));
        }
        if self.write_lock_mode < self.read_lock_mode {
            return Err(StmError::Invalid("write lock mode weaker than read lock mode"));
        }
        if self.max_retries == 0 {
            return Err(StmError::Invalid("max_retries must be positive"));
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(StmError::Invalid("timeout must be positive"));
        }
        if self.interruptible && self.interrupt_token.is_none() {
            return Err(StmError::Invalid("interruptible transactions need an interrupt token"));
        }
        if self.readonly && self.write_lock_mode != LockMode::None {
            return Err(StmError::Invalid("readonly transactions cannot take write locks"));
        }
        Ok(())
    }
}
