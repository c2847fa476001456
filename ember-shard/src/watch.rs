//! Watched-key tables for blocking transactions.
//!
//! A blocking transaction registers itself on every key it waits for. A
//! writer that makes one of those keys ready marks it awakened; the shard
//! engine later drains the awakened set and notifies the first live waiter
//! of each key, preserving registration order.

use std::collections::VecDeque;
use std::sync::Arc;

use hashbrown::HashMap;

use ember_common::ids::{DbIndex, ShardId, TxId};

use crate::QueuedTransaction;

type KeyId = (DbIndex, Vec<u8>);

#[derive(Debug)]
struct WatchEntry {
    txid: TxId,
    trans: Arc<dyn QueuedTransaction>,
}

/// Registration-ordered watch queues per key plus the awakened-key set.
#[derive(Debug, Default)]
pub struct WatchTable {
    queues: HashMap<KeyId, VecDeque<WatchEntry>>,
    awakened: Vec<KeyId>,
}

impl WatchTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `trans` to the watch queue of `key`.
    pub fn add_watched(&mut self, db: DbIndex, key: &[u8], trans: Arc<dyn QueuedTransaction>) {
        self.queues
            .entry((db, key.to_vec()))
            .or_default()
            .push_back(WatchEntry {
                txid: trans.txid(),
                trans,
            });
    }

    /// Removes `txid` from the watch queue of `key`. Returns whether an
    /// entry was dropped.
    pub fn remove_watched(&mut self, db: DbIndex, key: &[u8], txid: TxId) -> bool {
        let key_id = (db, key.to_vec());
        let Some(queue) = self.queues.get_mut(&key_id) else {
            return false;
        };
        let before = queue.len();
        queue.retain(|entry| entry.txid != txid);
        let removed = queue.len() != before;
        if queue.is_empty() {
            let _ = self.queues.remove(&key_id);
        }
        removed
    }

    /// Drops expired waiters from the watch queues of `keys`.
    pub fn gc_watched<'a>(
        &mut self,
        sid: ShardId,
        db: DbIndex,
        keys: impl Iterator<Item = &'a [u8]>,
    ) {
        for key in keys {
            let key_id = (db, key.to_vec());
            let Some(queue) = self.queues.get_mut(&key_id) else {
                continue;
            };
            queue.retain(|entry| !entry.trans.is_expired_in_shard(sid));
            if queue.is_empty() {
                let _ = self.queues.remove(&key_id);
            }
        }
    }

    /// Records that a writer made `key` ready, if anyone watches it.
    pub fn mark_awakened(&mut self, db: DbIndex, key: &[u8]) {
        let key_id = (db, key.to_vec());
        if self.queues.contains_key(&key_id) && !self.awakened.contains(&key_id) {
            self.awakened.push(key_id);
        }
    }

    /// Takes the set of keys marked awakened since the last drain.
    pub fn drain_awakened(&mut self) -> Vec<KeyId> {
        std::mem::take(&mut self.awakened)
    }

    /// First waiter of `key`, if any.
    #[must_use]
    pub fn front(&self, db: DbIndex, key: &[u8]) -> Option<(TxId, Arc<dyn QueuedTransaction>)> {
        self.queues
            .get(&(db, key.to_vec()))
            .and_then(VecDeque::front)
            .map(|entry| (entry.txid, Arc::clone(&entry.trans)))
    }

    /// Removes every entry of `txid` across all queues, returning the keys
    /// whose queues were touched.
    pub fn purge_txid(&mut self, txid: TxId) -> Vec<KeyId> {
        let mut affected = Vec::new();
        self.queues.retain(|key_id, queue| {
            let before = queue.len();
            queue.retain(|entry| entry.txid != txid);
            if queue.len() != before {
                affected.push(key_id.clone());
            }
            !queue.is_empty()
        });
        affected
    }

    /// Whether any transaction watches `key`.
    #[must_use]
    pub fn is_watched(&self, db: DbIndex, key: &[u8]) -> bool {
        self.queues.contains_key(&(db, key.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::WatchTable;
    use crate::{EngineShard, QueuedTransaction};
    use ember_common::ids::{ShardId, TxId};
    use googletest::prelude::*;
    use rstest::rstest;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug)]
    struct StubWaiter {
        txid: TxId,
        expired: AtomicBool,
    }

    impl StubWaiter {
        fn new(txid: TxId) -> Arc<Self> {
            Arc::new(Self {
                txid,
                expired: AtomicBool::new(false),
            })
        }
    }

    impl QueuedTransaction for StubWaiter {
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
            false
        }
        fn is_expired_in_shard(&self, _sid: ShardId) -> bool {
            self.expired.load(Ordering::Relaxed)
        }
        fn notify_suspended(&self, _committed_txid: TxId, _sid: ShardId) -> bool {
            !self.expired.load(Ordering::Relaxed)
        }
        fn on_converged(&self) {}
        fn on_dequeued(&self, _sid: ShardId) {}
        fn debug_id(&self) -> String {
            format!("waiter@{}", self.txid)
        }
    }

    #[rstest]
    fn mark_awakened_ignores_unwatched_keys() {
        let mut table = WatchTable::new();
        table.mark_awakened(0, b"nobody");
        assert_that!(table.drain_awakened().is_empty(), eq(true));
    }

    #[rstest]
    fn mark_awakened_deduplicates_keys() {
        let mut table = WatchTable::new();
        table.add_watched(0, b"q", StubWaiter::new(7));
        table.mark_awakened(0, b"q");
        table.mark_awakened(0, b"q");
        assert_that!(table.drain_awakened().len(), eq(1_usize));
    }

    #[rstest]
    fn front_preserves_registration_order() {
        let mut table = WatchTable::new();
        table.add_watched(0, b"q", StubWaiter::new(1));
        table.add_watched(0, b"q", StubWaiter::new(2));

        let (txid, _) = table.front(0, b"q").expect("waiters registered");
        assert_that!(txid, eq(1_u64));
    }

    #[rstest]
    fn purge_txid_reports_affected_keys() {
        let mut table = WatchTable::new();
        table.add_watched(0, b"a", StubWaiter::new(9));
        table.add_watched(0, b"b", StubWaiter::new(9));
        table.add_watched(0, b"b", StubWaiter::new(5));

        let affected = table.purge_txid(9);
        assert_that!(affected.len(), eq(2_usize));
        assert_that!(table.is_watched(0, b"a"), eq(false));
        let (txid, _) = table.front(0, b"b").expect("remaining waiter");
        assert_that!(txid, eq(5_u64));
    }

    #[rstest]
    fn gc_watched_drops_expired_waiters_only() {
        let mut table = WatchTable::new();
        let expired = StubWaiter::new(3);
        expired.expired.store(true, Ordering::Relaxed);
        table.add_watched(0, b"q", expired);
        table.add_watched(0, b"q", StubWaiter::new(4));

        table.gc_watched(0, 0, std::iter::once(b"q".as_slice()));
        let (txid, _) = table.front(0, b"q").expect("live waiter remains");
        assert_that!(txid, eq(4_u64));
    }
}
