//! Low-level building blocks shared by the transaction engine.

pub mod concurrency;
