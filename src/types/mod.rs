//! Shared vocabulary types and the crate-wide error enum.

use std::error::Error as StdError;
use std::fmt;

/// Errors raised by the transaction engine.
///
/// Conflicts, escalation signals and explicit retries are recoverable: the
/// [`TxnExecutor`](crate::stm::TxnExecutor) aborts the attempt and runs the
/// closure again. Everything else is surfaced to the caller once the
/// transaction has released every orec it touched.
#[derive(thiserror::Error, Debug)]
pub enum StmError {
    /// A version or lock mismatch was detected while reading or committing.
    #[error("read/write conflict: {0}")]
    ReadWriteConflict(&'static str),
    /// An explicit lock request was denied because of an incompatible holder.
    #[error("locked: {0}")]
    Locked(&'static str),
    /// The current transaction flavor cannot serve the request; the next
    /// attempt has to run in a richer flavor.
    #[error("speculative configuration failure: {0}")]
    SpeculativeConfiguration(SpeculativeFeature),
    /// Explicit blocking retry requested by the transaction body.
    #[error("retry requested")]
    Retry,
    /// A blocking retry exhausted the transaction timeout.
    #[error("blocking retry timed out")]
    RetryTimeout,
    /// A blocking retry was interrupted through its interrupt token.
    #[error("blocking retry interrupted")]
    RetryInterrupted,
    /// Retry was requested but nothing was read that could ever change.
    #[error("retry not possible: transaction has no tracked reads")]
    RetryNotPossible,
    /// Retry was requested but the configuration forbids blocking.
    #[error("retry not allowed: blocking is disabled for this transaction")]
    RetryNotAllowed,
    /// The attempt loop exceeded the configured retry bound.
    #[error("transaction family '{family}' exceeded {attempts} attempts")]
    TooManyRetries {
        /// Family name of the failing transaction.
        family: String,
        /// Number of attempts executed.
        attempts: u32,
    },
    /// Operation against a committed or aborted transaction.
    #[error("dead transaction: {0}")]
    DeadTransaction(&'static str),
    /// Operation that is illegal once the transaction is prepared.
    #[error("prepared transaction: {0}")]
    PreparedTransaction(&'static str),
    /// Invalid argument or configuration.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Failure raised by the transaction body itself.
    #[error("transaction body failed: {0}")]
    User(#[source] Box<dyn StdError + Send + Sync>),
}

impl StmError {
    /// Wraps an arbitrary error raised inside a transaction body.
    pub fn user<E>(err: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        StmError::User(err.into())
    }

    /// Returns `true` when the attempt loop handles the error by re-executing.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            StmError::ReadWriteConflict(_) | StmError::SpeculativeConfiguration(_) | StmError::Retry
        )
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, StmError>;

/// Lock strength a transaction holds (or requests) on one object.
///
/// Ordered from weakest to strongest; a transaction only ever upgrades.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[derive(serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LockMode {
    /// No lock; the object is only tracked for conflicts.
    #[default]
    None,
    /// Shared lock: blocks writers from committing.
    Read,
    /// Single-holder lock: other transactions may still read and read-lock.
    Write,
    /// Exclusive lock: no other lock holders and no new readers.
    Exclusive,
}

impl LockMode {
    pub(crate) const fn bits(self) -> u64 {
        match self {
            LockMode::None => 0,
            LockMode::Read => 1,
            LockMode::Write => 2,
            LockMode::Exclusive => 3,
        }
    }

    pub(crate) const fn from_bits(bits: u64) -> Self {
        match bits & 0b11 {
            0 => LockMode::None,
            1 => LockMode::Read,
            2 => LockMode::Write,
            _ => LockMode::Exclusive,
        }
    }
}

/// Isolation guarantee of a transaction.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
#[derive(serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationLevel {
    /// Consistent snapshot reads; write skew is possible.
    #[default]
    Snapshot,
    /// Every read is conflict checked at prepare; write skew is rejected.
    Serializable,
}

/// Lifecycle state of a single transaction attempt.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum TxnStatus {
    /// Accepting reads and writes.
    Active,
    /// Locks acquired and validated; only commit or abort remain.
    Prepared,
    /// Changes published.
    Committed,
    /// All interest released; nothing published.
    Aborted,
}

impl TxnStatus {
    /// Returns `true` for `Committed` and `Aborted`.
    pub fn is_dead(self) -> bool {
        matches!(self, TxnStatus::Committed | TxnStatus::Aborted)
    }
}

/// Representation used for one transaction attempt.
///
/// Lean flavors are cheaper but refuse every optional feature; fat flavors
/// support everything. Mono holds one object, fixed length a bounded array,
/// variable length grows without bound.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum TxnFlavor {
    /// One object, no optional features.
    LeanMono,
    /// Bounded object count, no optional features.
    LeanFixedLength,
    /// One object, all features.
    FatMono,
    /// Bounded object count, all features.
    FatFixedLength,
    /// Unbounded object count, all features.
    FatVariableLength,
}

impl TxnFlavor {
    /// Returns `true` for the lean flavors.
    pub fn is_lean(self) -> bool {
        matches!(self, TxnFlavor::LeanMono | TxnFlavor::LeanFixedLength)
    }
}

/// Feature whose use forces a transaction out of its current flavor.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum SpeculativeFeature {
    /// More objects were opened than the flavor can hold.
    Size,
    /// An object was constructed inside the transaction.
    Construction,
    /// A commuting update was registered.
    Commute,
    /// A read was ensured.
    Ensure,
    /// A lock was requested explicitly.
    Locks,
    /// A non-primitive payload was opened.
    NonPrimitivePayload,
    /// A blocking retry with a timeout was requested.
    Timeout,
    /// A transaction listener was registered.
    Listeners,
}

impl fmt::Display for SpeculativeFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SpeculativeFeature::Size => "size",
            SpeculativeFeature::Construction => "construction",
            SpeculativeFeature::Commute => "commute",
            SpeculativeFeature::Ensure => "ensure",
            SpeculativeFeature::Locks => "locks",
            SpeculativeFeature::NonPrimitivePayload => "non-primitive payload",
            SpeculativeFeature::Timeout => "timeout",
            SpeculativeFeature::Listeners => "listeners",
        };
        f.write_str(name)
    }
}
