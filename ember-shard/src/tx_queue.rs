//! Per-shard ordered transaction queue.
//!
//! Entries are ordered by transaction id (the queue score). Positions are
//! stable slab handles so a transaction can remember where it sits and
//! remove itself in O(log n) regardless of what was inserted around it.

use std::collections::BTreeMap;
use std::sync::Arc;

use ember_common::ids::TxId;

use crate::QueuedTransaction;

struct Entry {
    score: TxId,
    trans: Arc<dyn QueuedTransaction>,
}

/// Slab-backed priority queue keyed by transaction id.
#[derive(Default)]
pub struct TxQueue {
    entries: Vec<Option<Entry>>,
    free: Vec<u32>,
    by_score: BTreeMap<TxId, u32>,
}

impl TxQueue {
    /// Sentinel position meaning "not queued".
    pub const END: u32 = u32::MAX;

    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a transaction with its `txid` as score and returns its
    /// position handle.
    pub fn insert(&mut self, trans: Arc<dyn QueuedTransaction>) -> u32 {
        let score = trans.txid();
        debug_assert!(
            !self.by_score.contains_key(&score),
            "txid already queued on this shard"
        );
        let entry = Entry { score, trans };
        let pos = if let Some(pos) = self.free.pop() {
            self.entries[pos as usize] = Some(entry);
            pos
        } else {
            let pos = u32::try_from(self.entries.len()).expect("queue slab exceeds u32 positions");
            debug_assert!(pos != Self::END);
            self.entries.push(Some(entry));
            pos
        };
        let _ = self.by_score.insert(score, pos);
        pos
    }

    /// Removes the entry at `pos`.
    pub fn remove(&mut self, pos: u32) {
        let slot = self
            .entries
            .get_mut(pos as usize)
            .expect("queue position out of range");
        let entry = slot.take().expect("queue position already vacant");
        let _ = self.by_score.remove(&entry.score);
        self.free.push(pos);
    }

    /// Returns the transaction stored at `pos`, if any.
    #[must_use]
    pub fn at(&self, pos: u32) -> Option<&Arc<dyn QueuedTransaction>> {
        self.entries
            .get(pos as usize)
            .and_then(Option::as_ref)
            .map(|entry| &entry.trans)
    }

    /// Returns the lowest-score entry without removing it.
    #[must_use]
    pub fn front(&self) -> Option<(TxId, Arc<dyn QueuedTransaction>)> {
        let (score, pos) = self.by_score.iter().next()?;
        let entry = self.entries[*pos as usize]
            .as_ref()
            .expect("score index points at vacant slot");
        Some((*score, Arc::clone(&entry.trans)))
    }

    /// Removes and returns the lowest-score entry.
    pub fn pop_front(&mut self) -> Option<Arc<dyn QueuedTransaction>> {
        let (score, pos) = {
            let (score, pos) = self.by_score.iter().next()?;
            (*score, *pos)
        };
        let _ = self.by_score.remove(&score);
        let entry = self.entries[pos as usize]
            .take()
            .expect("score index points at vacant slot");
        self.free.push(pos);
        Some(entry.trans)
    }

    /// Highest score currently queued.
    #[must_use]
    pub fn tail_score(&self) -> Option<TxId> {
        self.by_score.keys().next_back().copied()
    }

    /// Number of queued transactions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_score.len()
    }

    /// Whether the queue holds no transactions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_score.is_empty()
    }
}

impl std::fmt::Debug for TxQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxQueue")
            .field("len", &self.len())
            .field("tail_score", &self.tail_score())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::TxQueue;
    use crate::{EngineShard, QueuedTransaction};
    use ember_common::ids::{ShardId, TxId};
    use googletest::prelude::*;
    use rstest::rstest;
    use std::sync::Arc;

    #[derive(Debug)]
    struct StubTransaction {
        txid: TxId,
    }

    impl QueuedTransaction for StubTransaction {
        fn txid(&self) -> TxId {
            self.txid
        }
        fn is_armed_in_shard(&self, _sid: ShardId) -> bool {
            false
        }
        fn run_in_shard(&self, _shard: &mut EngineShard) -> bool {
            false
        }
        fn is_out_of_order_in_shard(&self, _sid: ShardId) -> bool {
            false
        }
        fn is_queued_in_shard(&self, _sid: ShardId) -> bool {
            true
        }
        fn is_expired_in_shard(&self, _sid: ShardId) -> bool {
            false
        }
        fn notify_suspended(&self, _committed_txid: TxId, _sid: ShardId) -> bool {
            false
        }
        fn on_converged(&self) {}
        fn on_dequeued(&self, _sid: ShardId) {}
        fn debug_id(&self) -> String {
            format!("stub@{}", self.txid)
        }
    }

    fn stub(txid: TxId) -> Arc<dyn QueuedTransaction> {
        Arc::new(StubTransaction { txid })
    }

    #[rstest]
    fn front_follows_score_order_not_insertion_order() {
        let mut queue = TxQueue::new();
        let _ = queue.insert(stub(30));
        let _ = queue.insert(stub(10));
        let _ = queue.insert(stub(20));

        let (score, _) = queue.front().expect("queue is populated");
        assert_that!(score, eq(10_u64));
        assert_that!(queue.tail_score(), eq(Some(30_u64)));
    }

    #[rstest]
    fn remove_by_position_keeps_other_entries() {
        let mut queue = TxQueue::new();
        let first = queue.insert(stub(1));
        let _second = queue.insert(stub(2));

        queue.remove(first);
        assert_that!(queue.len(), eq(1_usize));
        let (score, _) = queue.front().expect("second entry remains");
        assert_that!(score, eq(2_u64));
    }

    #[rstest]
    fn freed_positions_are_recycled() {
        let mut queue = TxQueue::new();
        let first = queue.insert(stub(1));
        queue.remove(first);
        let second = queue.insert(stub(2));
        assert_that!(second, eq(first));
        assert_that!(queue.at(second).is_some(), eq(true));
    }

    #[rstest]
    fn pop_front_drains_in_score_order() {
        let mut queue = TxQueue::new();
        let _ = queue.insert(stub(5));
        let _ = queue.insert(stub(3));
        let _ = queue.insert(stub(4));

        let mut drained = Vec::new();
        while let Some(trans) = queue.pop_front() {
            drained.push(trans.txid());
        }
        assert_that!(drained, eq(&vec![3_u64, 4, 5]));
        assert_that!(queue.is_empty(), eq(true));
    }
}
