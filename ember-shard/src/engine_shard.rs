//! Single-threaded shard engine.
//!
//! An `EngineShard` is owned by exactly one worker thread; every method
//! takes `&mut self` and relies on that ownership instead of internal
//! locking. The coordinator reaches the shard only through tasks dispatched
//! over the worker's queue.

use std::sync::Arc;

use tracing::{debug, trace};

use ember_common::ids::{DbIndex, ShardId, TxId};

use crate::db_slice::DbSlice;
use crate::intent_lock::IntentLock;
use crate::tx_queue::TxQueue;
use crate::watch::WatchTable;
use crate::{KeyLockArgs, QueuedTransaction};

/// Per-shard execution state: queue, locks, keyspace, and watch tables.
#[derive(Debug)]
pub struct EngineShard {
    shard_id: ShardId,
    /// Highest transaction id whose hop ran from this shard's queue head.
    committed_txid: TxId,
    shard_lock: IntentLock,
    db_slice: DbSlice,
    txq: TxQueue,
    watch: WatchTable,
    /// Multi-hop transaction retained between hops; while present it halts
    /// the queue.
    continuation: Option<Arc<dyn QueuedTransaction>>,
    /// Woken blocking transactions that have not consumed their data yet;
    /// while non-empty the queue is halted so nothing runs between the wake
    /// and the waker's read.
    awakened_pending: hashbrown::HashSet<TxId>,
    waiting_convergence: Vec<(TxId, Arc<dyn QueuedTransaction>)>,
    quick_runs: u64,
}

impl EngineShard {
    /// Creates an idle shard engine.
    #[must_use]
    pub fn new(shard_id: ShardId) -> Self {
        Self {
            shard_id,
            committed_txid: 0,
            shard_lock: IntentLock::default(),
            db_slice: DbSlice::new(shard_id),
            txq: TxQueue::new(),
            watch: WatchTable::new(),
            continuation: None,
            awakened_pending: hashbrown::HashSet::new(),
            waiting_convergence: Vec::new(),
            quick_runs: 0,
        }
    }

    /// Owner shard id.
    #[must_use]
    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    /// Highest transaction id committed on this shard.
    #[must_use]
    pub fn committed_txid(&self) -> TxId {
        self.committed_txid
    }

    /// Whole-shard lock used by global transactions.
    #[must_use]
    pub fn shard_lock(&self) -> &IntentLock {
        &self.shard_lock
    }

    /// Mutable whole-shard lock.
    pub fn shard_lock_mut(&mut self) -> &mut IntentLock {
        &mut self.shard_lock
    }

    /// Keyspace slice.
    #[must_use]
    pub fn db_slice(&self) -> &DbSlice {
        &self.db_slice
    }

    /// Mutable keyspace slice.
    pub fn db_slice_mut(&mut self) -> &mut DbSlice {
        &mut self.db_slice
    }

    /// Transaction queue.
    #[must_use]
    pub fn txq(&self) -> &TxQueue {
        &self.txq
    }

    /// Mutable transaction queue.
    pub fn txq_mut(&mut self) -> &mut TxQueue {
        &mut self.txq
    }

    /// Counts one eager single-shard run that bypassed scheduling.
    pub fn inc_quick_run(&mut self) {
        self.quick_runs += 1;
    }

    /// Number of eager single-shard runs served by this shard.
    #[must_use]
    pub fn quick_run_count(&self) -> u64 {
        self.quick_runs
    }

    /// Drives queued work as far as it can go.
    ///
    /// Order of business: the retained continuation first (it halts the
    /// queue while present), then armed queue heads in txid order, then an
    /// armed out-of-order transaction handed in by the caller, and finally
    /// any convergence waiters unblocked by the progress above.
    pub fn poll_execution(&mut self, tag: &str, trans: Option<&Arc<dyn QueuedTransaction>>) {
        trace!(shard = self.shard_id, tag, "poll execution");
        let sid = self.shard_id;

        let mut trans = trans;
        if let Some(cont) = self.continuation.clone() {
            if let Some(candidate) = trans
                && candidate.txid() == cont.txid()
            {
                trans = None;
            }
            if cont.is_armed_in_shard(sid) {
                let keep = cont.run_in_shard(self);
                if !keep {
                    self.continuation = None;
                }
            }
        }

        if self.continuation.is_none() {
            loop {
                if !self.awakened_pending.is_empty() {
                    // A woken blocker owns the queue until it reads its
                    // data; running anything else here would break the
                    // atomicity of the wake.
                    break;
                }
                let Some((score, head)) = self.txq.front() else {
                    break;
                };
                if !head.is_armed_in_shard(sid) {
                    if head.is_expired_in_shard(sid) {
                        // A timed-out blocking transaction stays queued when
                        // it expires; discard the stale entry so the queue
                        // can advance.
                        debug!(shard = sid, id = %head.debug_id(), "dropping expired head");
                        let _ = self.txq.pop_front();
                        head.on_dequeued(sid);
                        continue;
                    }
                    break;
                }
                self.committed_txid = score;
                let keep = head.run_in_shard(self);
                if keep {
                    self.continuation = Some(head);
                    break;
                }
            }
        }

        if let Some(candidate) = trans
            && candidate.is_armed_in_shard(sid)
            && (candidate.is_out_of_order_in_shard(sid) || !candidate.is_queued_in_shard(sid))
        {
            trace!(shard = sid, id = %candidate.debug_id(), "running detached transaction");
            let keep = candidate.run_in_shard(self);
            if keep {
                // A non-concluding hop on a woken blocker: retain it like a
                // queue head that asked to be kept.
                debug_assert!(self.continuation.is_none());
                self.continuation = Some(Arc::clone(candidate));
            }
        }

        self.notify_converged();
    }

    /// Services the watch tables after a hop concluded.
    ///
    /// Wakes the first live waiter of every key a writer marked awakened.
    /// When `completed` names an awakened transaction that just finished
    /// running, its residual watch entries are purged and the next waiter of
    /// each affected key is notified.
    pub fn process_awakened(&mut self, completed: Option<TxId>) {
        for (db, key) in self.watch.drain_awakened() {
            self.wake_front_waiter(db, &key);
        }

        if let Some(txid) = completed {
            let _ = self.awakened_pending.remove(&txid);
            for (db, key) in self.watch.purge_txid(txid) {
                self.wake_front_waiter(db, &key);
            }
        }
    }

    fn wake_front_waiter(&mut self, db: DbIndex, key: &[u8]) {
        while let Some((txid, waiter)) = self.watch.front(db, key) {
            if !self.db_slice.contains(db, key) {
                // The data was consumed before the waiter got its turn.
                return;
            }
            if waiter.notify_suspended(self.committed_txid, self.shard_id) {
                debug!(shard = self.shard_id, id = %waiter.debug_id(), "woke suspended waiter");
                let _ = self.awakened_pending.insert(txid);
                return;
            }
            // Expired waiter: drop it and offer the key to the next one.
            let _ = self.watch.remove_watched(db, key, txid);
        }
    }

    /// Registers a blocking transaction on `key`'s watch queue.
    pub fn add_watched(&mut self, db: DbIndex, key: &[u8], trans: Arc<dyn QueuedTransaction>) {
        self.watch.add_watched(db, key, trans);
    }

    /// Removes a blocking transaction from `key`'s watch queue.
    pub fn removed_watched(&mut self, db: DbIndex, key: &[u8], txid: TxId) {
        let _ = self.watch.remove_watched(db, key, txid);
    }

    /// Drops expired waiters from the watch queues of `lock_args`' keys.
    pub fn gc_watched(&mut self, lock_args: &KeyLockArgs) {
        self.watch
            .gc_watched(self.shard_id, lock_args.db_index, lock_args.keys());
    }

    /// Marks `key` ready for its watchers; a later
    /// [`EngineShard::process_awakened`] delivers the wake.
    pub fn awake_watched(&mut self, db: DbIndex, key: &[u8]) {
        self.watch.mark_awakened(db, key);
    }

    /// Whether any transaction watches `key` on this shard.
    #[must_use]
    pub fn is_watched(&self, db: DbIndex, key: &[u8]) -> bool {
        self.watch.is_watched(db, key)
    }

    /// Clears the retained continuation when a multi transaction shuts
    /// down.
    pub fn shutdown_multi(&mut self, txid: TxId) {
        if self
            .continuation
            .as_ref()
            .is_some_and(|cont| cont.txid() == txid)
        {
            self.continuation = None;
        }
    }

    /// Whether the wake that `notify_txid` describes is fully applied on
    /// this shard: either the shard committed past it, or nothing older can
    /// still be pending here.
    #[must_use]
    pub fn has_result_converged(&self, notify_txid: TxId) -> bool {
        if self.committed_txid >= notify_txid {
            return true;
        }
        if self.continuation.is_some() {
            return false;
        }
        match self.txq.front() {
            None => true,
            Some((score, _)) => score > notify_txid,
        }
    }

    /// Completes `trans`' convergence wait now or parks it until the next
    /// poll makes enough progress.
    pub fn wait_for_convergence(&mut self, notify_txid: TxId, trans: Arc<dyn QueuedTransaction>) {
        if self.has_result_converged(notify_txid) {
            trans.on_converged();
            return;
        }
        trace!(shard = self.shard_id, notify_txid, id = %trans.debug_id(), "parked for convergence");
        self.waiting_convergence.push((notify_txid, trans));
    }

    fn notify_converged(&mut self) {
        let mut index = 0;
        while index < self.waiting_convergence.len() {
            let notify_txid = self.waiting_convergence[index].0;
            if self.has_result_converged(notify_txid) {
                let (_, trans) = self.waiting_convergence.swap_remove(index);
                trans.on_converged();
            } else {
                index += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::EngineShard;
    use crate::QueuedTransaction;
    use ember_common::ids::{ShardId, TxId};
    use googletest::prelude::*;
    use rstest::rstest;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// Minimal queue citizen: armed/expired toggles plus a run counter.
    #[derive(Debug)]
    struct ScriptedTransaction {
        txid: TxId,
        armed: AtomicBool,
        expired: AtomicBool,
        ooo: AtomicBool,
        runs: AtomicU32,
        keep_on_run: bool,
        queued_pos: AtomicU32,
    }

    impl ScriptedTransaction {
        fn new(txid: TxId) -> Arc<Self> {
            Arc::new(Self {
                txid,
                armed: AtomicBool::new(false),
                expired: AtomicBool::new(false),
                ooo: AtomicBool::new(false),
                runs: AtomicU32::new(0),
                keep_on_run: false,
                queued_pos: AtomicU32::new(crate::TxQueue::END),
            })
        }
    }

    impl QueuedTransaction for ScriptedTransaction {
        fn txid(&self) -> TxId {
            self.txid
        }
        fn is_armed_in_shard(&self, _sid: ShardId) -> bool {
            self.armed.load(Ordering::Acquire)
        }
        fn run_in_shard(&self, shard: &mut EngineShard) -> bool {
            self.armed.store(false, Ordering::Release);
            let _ = self.runs.fetch_add(1, Ordering::AcqRel);
            let pos = self.queued_pos.swap(crate::TxQueue::END, Ordering::AcqRel);
            if pos != crate::TxQueue::END {
                shard.txq_mut().remove(pos);
            }
            self.keep_on_run
        }
        fn is_out_of_order_in_shard(&self, _sid: ShardId) -> bool {
            self.ooo.load(Ordering::Acquire)
        }
        fn is_queued_in_shard(&self, _sid: ShardId) -> bool {
            self.queued_pos.load(Ordering::Acquire) != crate::TxQueue::END
        }
        fn is_expired_in_shard(&self, _sid: ShardId) -> bool {
            self.expired.load(Ordering::Acquire)
        }
        fn notify_suspended(&self, _committed_txid: TxId, _sid: ShardId) -> bool {
            !self.expired.load(Ordering::Acquire)
        }
        fn on_converged(&self) {}
        fn on_dequeued(&self, _sid: ShardId) {
            self.queued_pos.store(crate::TxQueue::END, Ordering::Release);
        }
        fn debug_id(&self) -> String {
            format!("scripted@{}", self.txid)
        }
    }

    fn enqueue(shard: &mut EngineShard, trans: &Arc<ScriptedTransaction>) {
        let pos = shard
            .txq_mut()
            .insert(Arc::clone(trans) as Arc<dyn QueuedTransaction>);
        trans.queued_pos.store(pos, Ordering::Release);
    }

    #[rstest]
    fn poll_runs_armed_heads_in_txid_order() {
        let mut shard = EngineShard::new(0);
        let first = ScriptedTransaction::new(10);
        let second = ScriptedTransaction::new(11);
        enqueue(&mut shard, &first);
        enqueue(&mut shard, &second);
        first.armed.store(true, Ordering::Release);
        second.armed.store(true, Ordering::Release);

        shard.poll_execution("test", None);

        assert_that!(first.runs.load(Ordering::Acquire), eq(1_u32));
        assert_that!(second.runs.load(Ordering::Acquire), eq(1_u32));
        assert_that!(shard.committed_txid(), eq(11_u64));
        assert_that!(shard.txq().is_empty(), eq(true));
    }

    #[rstest]
    fn unarmed_head_halts_the_queue() {
        let mut shard = EngineShard::new(0);
        let head = ScriptedTransaction::new(10);
        let tail = ScriptedTransaction::new(11);
        enqueue(&mut shard, &head);
        enqueue(&mut shard, &tail);
        tail.armed.store(true, Ordering::Release);

        shard.poll_execution("test", None);

        assert_that!(head.runs.load(Ordering::Acquire), eq(0_u32));
        assert_that!(tail.runs.load(Ordering::Acquire), eq(0_u32));
        assert_that!(shard.txq().len(), eq(2_usize));
    }

    #[rstest]
    fn expired_unarmed_head_is_discarded() {
        let mut shard = EngineShard::new(0);
        let expired = ScriptedTransaction::new(10);
        let next = ScriptedTransaction::new(11);
        enqueue(&mut shard, &expired);
        enqueue(&mut shard, &next);
        expired.expired.store(true, Ordering::Release);
        next.armed.store(true, Ordering::Release);

        shard.poll_execution("test", None);

        assert_that!(expired.runs.load(Ordering::Acquire), eq(0_u32));
        assert_that!(next.runs.load(Ordering::Acquire), eq(1_u32));
        assert_that!(shard.txq().is_empty(), eq(true));
    }

    #[rstest]
    fn out_of_order_transaction_runs_behind_a_stalled_head() {
        let mut shard = EngineShard::new(0);
        let stalled = ScriptedTransaction::new(10);
        let eager = ScriptedTransaction::new(11);
        enqueue(&mut shard, &stalled);
        enqueue(&mut shard, &eager);
        eager.armed.store(true, Ordering::Release);
        eager.ooo.store(true, Ordering::Release);

        let handle = Arc::clone(&eager) as Arc<dyn QueuedTransaction>;
        shard.poll_execution("test", Some(&handle));

        assert_that!(stalled.runs.load(Ordering::Acquire), eq(0_u32));
        assert_that!(eager.runs.load(Ordering::Acquire), eq(1_u32));
        assert_that!(shard.txq().len(), eq(1_usize));
    }

    #[rstest]
    fn convergence_completes_when_queue_is_beyond_notify() {
        let mut shard = EngineShard::new(0);
        assert_that!(shard.has_result_converged(42), eq(true));

        let pending = ScriptedTransaction::new(40);
        enqueue(&mut shard, &pending);
        assert_that!(shard.has_result_converged(42), eq(false));

        pending.armed.store(true, Ordering::Release);
        shard.poll_execution("test", None);
        assert_that!(shard.has_result_converged(42), eq(true));
    }
}
