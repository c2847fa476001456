//! Multi-transaction control: statement switching and the bulk unlock.

use std::sync::Arc;

use tracing::debug;

use ember_common::error::EmberResult;
use ember_core::command::{CommandSpec, opt};
use ember_shard::{LockMode, TxQueue};

use crate::transaction::{LockCnt, Transaction, require_multi};

impl Transaction {
    /// Switches the transaction to the next statement of a multi batch.
    ///
    /// The first call schedules the transaction under the enclosing multi
    /// descriptor (global batches take their whole-shard locks here); the
    /// routing state is then reset so the following
    /// [`Transaction::init_by_args`] can route the new statement.
    ///
    /// # Errors
    ///
    /// Returns an error when called on a non-multi transaction or when
    /// scheduling dispatch fails.
    pub fn set_exec_cmd(&self, cid: &'static CommandSpec) -> EmberResult<()> {
        require_multi(self)?;
        debug_assert!(self.read_cb().is_none());

        // Scheduling must happen before the descriptor swap: the lock union
        // and the lock mode belong to the enclosing multi command.
        if self.txid_relaxed() == 0 {
            self.schedule()?;
        }

        {
            let mut routing = self.write_routing();
            routing.unique_shard_cnt = 0;
            routing.args = Arc::new(Vec::new());
            routing.reverse_index.clear();
        }
        *self.write_cid() = cid;
        Ok(())
    }

    /// Releases everything a multi transaction accumulated: the recorded
    /// per-key lock counts on every shard, the whole-shard locks of global
    /// batches, and any residual queue entries.
    ///
    /// # Errors
    ///
    /// Returns an error when called on a non-multi transaction or when a
    /// shard worker can not accept the dispatch.
    pub fn unlock_multi(&self) -> EmberResult<()> {
        require_multi(self)?;
        debug!(id = %self.debug_id(), "unlock multi");

        let shard_count = self.shard_set().size();
        let mut sharded_keys: Vec<Vec<(Vec<u8>, LockCnt)>> =
            vec![Vec::new(); usize::from(shard_count)];
        let multi_opts = {
            let multi = self.multi_data().expect("checked by require_multi");
            let resolver = self.shard_set().resolver();
            for (key, lock_cnt) in &multi.locks {
                let sid = resolver.shard_for_key(key);
                sharded_keys[usize::from(sid)].push((key.clone(), *lock_cnt));
            }
            multi.multi_opts
        };
        let sharded_keys = Arc::new(sharded_keys);
        let db = self.db_index();
        let txid = self.txid_relaxed();

        let previous = self.add_run_count(u32::from(shard_count));
        debug_assert_eq!(previous, 0, "unlock overlaps a live hop");

        for sid in self.shard_set().shard_ids() {
            let this = self.self_arc();
            let sharded_keys = Arc::clone(&sharded_keys);
            self.shard_set().add(
                sid,
                Box::new(move |shard| {
                    if multi_opts & opt::GLOBAL_TRANS != 0 {
                        shard.shard_lock_mut().release(LockMode::Exclusive);
                    }

                    let sid = shard.shard_id();
                    for (key, lock_cnt) in &sharded_keys[usize::from(sid)] {
                        shard
                            .db_slice_mut()
                            .release_count(LockMode::Shared, db, key, lock_cnt.cnt[0]);
                        shard
                            .db_slice_mut()
                            .release_count(LockMode::Exclusive, db, key, lock_cnt.cnt[1]);
                    }

                    // A statement may never have armed this shard, leaving
                    // the scheduling-time queue entry behind; it sits at the
                    // head because everything older has drained.
                    let pos = {
                        let slots = this.read_slots();
                        slots[Transaction::slot_index(&slots, sid)]
                            .pq_pos
                            .swap(TxQueue::END, std::sync::atomic::Ordering::Relaxed)
                    };
                    if pos != TxQueue::END {
                        debug_assert!(
                            shard
                                .txq()
                                .front()
                                .is_some_and(|(score, _)| score == txid),
                            "residual multi entry must be the queue head"
                        );
                        shard.txq_mut().remove(pos);
                    }

                    shard.shutdown_multi(txid);
                    shard.process_awakened(None);
                    shard.poll_execution("unlockmulti", None);
                    let _ = this.decrease_run_cnt();
                }),
            )?;
        }

        self.wait_for_shard_callbacks();
        debug!(id = %self.debug_id(), "unlock multi finished");
        Ok(())
    }
}
