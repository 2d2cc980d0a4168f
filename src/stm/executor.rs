//! Re-execution of transaction bodies until they commit.

use std::sync::Arc;

use tracing::{trace, warn};

use crate::stm::config::TxnConfig;
use crate::stm::runtime::Stm;
use crate::stm::txn::Txn;
use crate::types::{Result, StmError};

/// Runs closures as transactions, re-executing them until they commit.
///
/// Conflicts are retried after the family's backoff, escalation signals are
/// retried immediately in the richer flavor, explicit retries block until a
/// read object changes. Every other error aborts the attempt and is returned.
#[derive(Debug, Clone)]
pub struct TxnExecutor {
    stm: Arc<Stm>,
    config: Arc<TxnConfig>,
}

impl TxnExecutor {
    /// Validates `config` and builds an executor for its family.
    pub fn new(stm: Arc<Stm>, config: TxnConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            stm,
            config: Arc::new(config),
        })
    }

    /// Family configuration.
    pub fn config(&self) -> &TxnConfig {
        &self.config
    }

    /// Runtime the executor runs on.
    pub fn stm(&self) -> &Arc<Stm> {
        &self.stm
    }

    /// Executes `body` atomically and returns its result.
    ///
    /// `body` may run several times; it must not have side effects outside
    /// the transaction.
    pub fn execute<T, F>(&self, mut body: F) -> Result<T>
    where
        F: FnMut(&mut Txn) -> Result<T>,
    {
        let mut tx = Txn::new(Arc::clone(&self.stm), Arc::clone(&self.config));
        loop {
            let outcome = body(&mut tx).and_then(|value| tx.commit().map(|()| value));
            match outcome {
                Ok(value) => return Ok(value),
                Err(StmError::Retry) => tx.block_for_retry()?,
                Err(StmError::SpeculativeConfiguration(feature)) => {
                    tx.abort();
                    trace!(attempt = tx.attempt(), %feature, "re-executing after escalation");
                }
                Err(StmError::ReadWriteConflict(reason)) => {
                    tx.abort();
                    trace!(attempt = tx.attempt(), reason, "re-executing after conflict");
                    self.config.backoff.delay(tx.attempt());
                }
                Err(other) => {
                    tx.abort();
                    return Err(other);
                }
            }
            if tx.attempt() >= self.config.max_retries {
                warn!(
                    family = %self.config.family_name,
                    attempts = tx.attempt(),
                    "transaction exceeded its retry bound"
                );
                return Err(StmError::TooManyRetries {
                    family: self.config.family_name.clone(),
                    attempts: tx.attempt(),
                });
            }
            tx.restart();
        }
    }
}
