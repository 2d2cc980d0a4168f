//! Singly linked chains of retry latches waiting on one orec.

use std::sync::Arc;

use crate::primitives::concurrency::RetryLatch;
use crate::stm::pool::ObjectPool;

/// One waiting latch, tagged with the era it was registered in.
#[derive(Debug, Default)]
pub struct ListenerNode {
    pub(crate) latch: Option<Arc<RetryLatch>>,
    pub(crate) era: u64,
    pub(crate) next: Option<Box<ListenerNode>>,
}

impl ListenerNode {
    /// Returns `true` while the latch still waits in the registered era.
    fn is_live(&self) -> bool {
        match &self.latch {
            Some(latch) => latch.era() == self.era && !latch.is_open(),
            None => false,
        }
    }

    /// Clears the node so it can go back to a pool.
    pub(crate) fn clear(&mut self) {
        self.latch = None;
        self.era = 0;
        self.next = None;
    }

    /// Opens every latch in `chain` with its registered era and hands the
    /// nodes back to `pool`. Returns the number of latches signalled.
    pub fn open_all(mut chain: Option<Box<ListenerNode>>, pool: &mut dyn ObjectPool) -> usize {
        let mut opened = 0;
        while let Some(mut node) = chain {
            chain = node.next.take();
            if let Some(latch) = node.latch.take() {
                latch.open(node.era);
                opened += 1;
            }
            node.clear();
            pool.put_listener(node);
        }
        opened
    }

    /// Drops nodes whose latch moved on to a newer era or already opened,
    /// keeping the relative order of the rest.
    pub(crate) fn prune_stale(
        chain: Option<Box<ListenerNode>>,
        pool: &mut dyn ObjectPool,
    ) -> Option<Box<ListenerNode>> {
        Self::retain(chain, pool, |node| node.is_live())
    }

    /// Drops the nodes of `latch` along with every stale node.
    pub(crate) fn remove_latch(
        chain: Option<Box<ListenerNode>>,
        latch: &Arc<RetryLatch>,
        pool: &mut dyn ObjectPool,
    ) -> Option<Box<ListenerNode>> {
        Self::retain(chain, pool, |node| {
            node.is_live() && !node.latch.as_ref().is_some_and(|l| Arc::ptr_eq(l, latch))
        })
    }

    fn retain(
        mut chain: Option<Box<ListenerNode>>,
        pool: &mut dyn ObjectPool,
        keep: impl Fn(&ListenerNode) -> bool,
    ) -> Option<Box<ListenerNode>> {
        let mut live = Vec::new();
        while let Some(mut node) = chain {
            chain = node.next.take();
            if keep(&node) {
                live.push(node);
            } else {
                node.clear();
                pool.put_listener(node);
            }
        }
        let mut head = None;
        while let Some(mut node) = live.pop() {
            node.next = head;
            head = Some(node);
        }
        head
    }
}

impl Drop for ListenerNode {
    fn drop(&mut self) {
        // Unlink iteratively; long chains would otherwise recurse.
        let mut next = self.next.take();
        while let Some(mut node) = next {
            next = node.next.take();
        }
    }
}
