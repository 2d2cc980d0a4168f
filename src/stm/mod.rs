//! Transactional memory engine.
//!
//! Objects are guarded by [`Orec`]s; a [`Txn`] collects [`Tranlocal`]s
//! while a closure runs and publishes them atomically on commit. The
//! [`TxnExecutor`] drives the attempt loop and [`TxnCell`] offers typed
//! access on top.
//!
//! ```
//! use umbra::stm::{Stm, TxnLong};
//!
//! let stm = Stm::with_defaults();
//! let from = TxnLong::new(&stm, 100);
//! let to = TxnLong::new(&stm, 0);
//! stm.atomically(|tx| {
//!     let amount = from.get(tx)?;
//!     from.set(tx, 0)?;
//!     to.set(tx, amount)
//! })
//! .unwrap();
//! assert_eq!(to.atomic_get().unwrap(), 100);
//! ```

pub mod cell;
pub mod config;
pub mod executor;
pub mod listeners;
pub mod object;
pub mod orec;
pub mod pool;
pub mod runtime;
pub mod speculative;
pub mod tranlocal;
pub mod txn;

pub use cell::{TxnBoolean, TxnCell, TxnDouble, TxnInteger, TxnLong, TxnNumber, TxnRef, TxnValue};
pub use config::{ConfigError, StmConfig, TxnConfig};
pub use executor::TxnExecutor;
pub use object::{ObjectId, Payload, PayloadKind, TxnObject};
pub use orec::{Arrival, Orec, OrecSnapshot, RegisterOutcome};
pub use pool::{FreeListPool, NoPool, ObjectPool, PoolStats};
pub use runtime::Stm;
pub use speculative::SpeculativeConfiguration;
pub use tranlocal::{Tranlocal, TranlocalMode};
pub use txn::{Txn, TxnEvent, TxnListener};
