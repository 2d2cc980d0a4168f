/// Lifecycle points a [`TxnListener`] is told about.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum TxnEvent {
    /// Before any lock is taken for commit.
    PrePrepare,
    /// After every write is published and every waiter woken.
    PostCommit,
    /// After every orec interest is released.
    PostAbort,
}

/// Callback attached to a transaction attempt or, through
/// [`TxnConfig::permanent_listener`](crate::stm::TxnConfig::permanent_listener),
/// to every attempt of a family.
pub trait TxnListener: Send + Sync {
    /// Called on `event`.
    fn notify(&self, event: TxnEvent);
}

impl<F> TxnListener for F
where
    F: Fn(TxnEvent) + Send + Sync,
{
    fn notify(&self, event: TxnEvent) {
        self(event)
    }
}
