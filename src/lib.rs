//! Umbra: an in-process software transactional memory.
//!
//! Shared cells are read and written inside transactions that either commit
//! atomically or leave no trace. Conflicts are detected through per-object
//! ownership records and a global conflict counter; transactions start in a
//! lean representation and escalate only when they use richer features.

#![warn(missing_docs)]

pub mod primitives;
pub mod stm;
pub mod types;

pub use stm::{Stm, StmConfig, Txn, TxnCell, TxnConfig, TxnExecutor};
pub use types::{IsolationLevel, LockMode, Result, StmError};
