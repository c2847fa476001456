//! Hop execution: arming, dispatch, and the shard-side runner.

use std::sync::atomic::Ordering;

use tracing::{debug, trace};

use ember_common::error::{EmberResult, OpStatus};
use ember_common::ids::{ShardId, TxId};
use ember_shard::{EngineShard, QueuedTransaction, TxQueue};

use crate::transaction::{RunnableCallback, Transaction, coord, local_mask};

impl Transaction {
    /// Runs one hop of `cb` across the touched shards and waits for the
    /// barrier.
    ///
    /// `conclude` marks this hop as the transaction's last: locks are
    /// released on every shard as the callback finishes there (multi
    /// transactions keep theirs until [`Transaction::unlock_multi`]).
    ///
    /// # Errors
    ///
    /// Returns an error when a shard worker can not accept the dispatch.
    pub fn execute(&self, cb: RunnableCallback, conclude: bool) -> EmberResult<()> {
        self.install_cb(Some(cb));
        self.set_state(coord::EXEC);
        if conclude {
            self.set_state(coord::EXEC_CONCLUDING);
        } else {
            self.clear_state(coord::EXEC_CONCLUDING);
        }

        self.execute_async()?;

        trace!(id = %self.debug_id(), "waiting on hop barrier");
        self.wait_for_shard_callbacks();
        trace!(id = %self.debug_id(), "hop barrier released");

        self.install_cb(None);
        Ok(())
    }

    /// Concluding hop without a callback: releases this transaction's locks
    /// and expires any watch registrations it still holds.
    ///
    /// Used to abandon a watch that was registered by a non-concluding hop
    /// and never waited on.
    ///
    /// # Errors
    ///
    /// Returns an error when a shard worker can not accept the dispatch.
    pub fn execute_noop(&self) -> EmberResult<()> {
        debug_assert!(self.read_cb().is_none());
        self.set_state(coord::EXEC | coord::EXEC_CONCLUDING);
        self.execute_async()?;
        self.wait_for_shard_callbacks();
        Ok(())
    }

    /// Arms the touched shards and dispatches the hop without waiting.
    pub(crate) fn execute_async(&self) -> EmberResult<()> {
        let is_global = self.is_global();
        let (shard_cnt, unique_sid) = {
            let routing = self.read_routing();
            (routing.unique_shard_cnt, routing.unique_shard_id)
        };
        debug_assert!(shard_cnt > 0, "hop on a transaction with no shards");

        {
            let slots = self.read_slots();
            if shard_cnt == 1 {
                slots[Self::slot_index(&slots, unique_sid)].set_mask(local_mask::ARMED);
            } else {
                for slot in slots.iter() {
                    if !is_global && slot.arg_count.load(Ordering::Relaxed) <= 0 {
                        continue;
                    }
                    slot.set_mask(local_mask::ARMED);
                }
            }
        }

        let seq = self.seqlock_value();
        // Release-store after the arming writes: a shard that observes the
        // new run_count also observes its armed slot.
        self.publish_run_count(shard_cnt);

        let targets: Vec<ShardId> = if !is_global && shard_cnt == 1 {
            vec![unique_sid]
        } else {
            self.active_shards()
        };
        debug_assert_eq!(targets.len(), shard_cnt as usize);

        for sid in targets {
            // Each dispatched task owns its own reference, so a shard may
            // still touch the transaction after the coordinator finished the
            // hop on its side.
            let this = self.self_arc();
            self.shard_set().add(
                sid,
                Box::new(move |shard| {
                    let mask = this.slot_mask(shard.shard_id());
                    // The release-RMW orders the generation check after the
                    // mask load. A stale generation means the coordinator
                    // already crossed the barrier this dispatch belongs to,
                    // and the slot must not be touched through it.
                    let seq_after = this.seqlock_fenced();
                    let should_poll = seq_after == seq && mask & local_mask::ARMED != 0;
                    trace!(
                        id = %this.debug_id(),
                        shard = shard.shard_id(),
                        should_poll,
                        "exec dispatch"
                    );
                    if should_poll {
                        let handle = Transaction::queued_handle(&this);
                        shard.poll_execution("exec_cb", Some(&handle));
                    }
                }),
            )?;
        }
        Ok(())
    }

    /// Concluding path for a hop with no installed callback.
    fn run_noop_in_shard(&self, shard: &mut EngineShard, concluding: bool) -> bool {
        debug_assert!(!self.is_multi());
        debug_assert!(!self.is_global());
        let sid = shard.shard_id();
        debug!(id = %self.debug_id(), shard = sid, "noop hop");

        if self.unique_shard_cnt() == 1 {
            self.store_local_result(OpStatus::Ok);
        }

        let pos = {
            let slots = self.read_slots();
            slots[Self::slot_index(&slots, sid)]
                .pq_pos
                .swap(TxQueue::END, Ordering::Relaxed)
        };
        if pos != TxQueue::END {
            shard.txq_mut().remove(pos);
        }

        if concluding {
            let lock_args = self.get_lock_args(sid);
            let mask = self.slot_mask(sid);
            if mask & local_mask::KEYLOCK_ACQUIRED != 0 {
                shard.db_slice_mut().release(self.mode(), &lock_args);
            }
            {
                let slots = self.read_slots();
                let slot = &slots[Self::slot_index(&slots, sid)];
                slot.clear_mask(local_mask::KEYLOCK_ACQUIRED | local_mask::OUT_OF_ORDER);
                if mask & local_mask::SUSPENDED_Q != 0 {
                    slot.set_mask(local_mask::EXPIRED_Q);
                }
            }
            if mask & (local_mask::SUSPENDED_Q | local_mask::AWAKED_Q) != 0 {
                shard.gc_watched(&lock_args);
                // Abandoning a wake must also hand the queue back.
                shard.process_awakened(Some(self.txid_relaxed()));
            }
        }

        let _ = self.decrease_run_cnt();
        false
    }
}

impl QueuedTransaction for Transaction {
    fn txid(&self) -> TxId {
        self.txid_relaxed()
    }

    fn is_armed_in_shard(&self, sid: ShardId) -> bool {
        // run_count is checked first: the acquire load pairs with the
        // coordinator's release store and makes the arming writes visible.
        self.run_count_acquire() > 0 && self.slot_mask(sid) & local_mask::ARMED != 0
    }

    fn run_in_shard(&self, shard: &mut EngineShard) -> bool {
        debug_assert!(self.run_count_relaxed() > 0);
        debug_assert!(self.txid_relaxed() > 0);
        let sid = shard.shard_id();
        trace!(id = %self.debug_id(), shard = sid, "run in shard");

        {
            let slots = self.read_slots();
            let slot = &slots[Self::slot_index(&slots, sid)];
            debug_assert_ne!(slot.mask() & local_mask::ARMED, 0);
            slot.clear_mask(local_mask::ARMED);
            // Post-wake hops legitimately arm shards that are still
            // suspended (only the waking shard flipped to awaked); expired
            // slots never arm again.
            debug_assert_eq!(slot.mask() & local_mask::EXPIRED_Q, 0);
        }

        let mask = self.slot_mask(sid);
        let awaked_prerun = mask & local_mask::AWAKED_Q != 0;
        let concluding = self.state() & coord::EXEC_CONCLUDING != 0;
        // Multi transactions release in unlock_multi, never per hop.
        let should_release = concluding && !self.is_multi();
        let mode = self.mode();

        let Some(cb) = self.read_cb() else {
            return self.run_noop_in_shard(shard, concluding);
        };

        // Incremental batches schedule before their statements are known, so
        // each statement locks its own keys on first arrival; lock-ahead
        // transactions took theirs at scheduling.
        let incremental = self
            .multi_data()
            .is_some_and(|multi| multi.incremental);
        if incremental && mask & local_mask::KEYLOCK_ACQUIRED == 0 {
            debug_assert!(!awaked_prerun);
            {
                let slots = self.read_slots();
                slots[Self::slot_index(&slots, sid)].set_mask(local_mask::KEYLOCK_ACQUIRED);
            }
            let lock_args = self.get_lock_args(sid);
            let _ = shard.db_slice_mut().acquire(mode, &lock_args);
        }
        debug_assert!(
            self.is_global() || self.slot_mask(sid) & local_mask::KEYLOCK_ACQUIRED != 0
        );

        let status = cb(self, shard);

        if self.unique_shard_cnt() == 1 {
            // Only one shard runs the callback, so it alone owns the result
            // and may drop the callback early.
            self.install_cb(None);
            self.store_local_result(status);
        } else {
            assert_eq!(
                status,
                OpStatus::Ok,
                "multi-shard hop callbacks must encode failures in their own state"
            );
        }

        // The queue entry goes away on the first invocation; later hops run
        // through the shard's continuation slot instead.
        let pos = {
            let slots = self.read_slots();
            slots[Self::slot_index(&slots, sid)]
                .pq_pos
                .swap(TxQueue::END, Ordering::Relaxed)
        };
        if pos != TxQueue::END {
            shard.txq_mut().remove(pos);
        }

        if should_release {
            let is_suspended = self.slot_mask(sid) & local_mask::SUSPENDED_Q != 0;
            if self.is_global() {
                debug_assert!(!awaked_prerun && !is_suspended);
                shard.shard_lock_mut().release(mode);
            } else {
                // A suspended slot keeps its locks: future transactions on
                // those keys must order through the queue while we wait.
                if !is_suspended {
                    let lock_args = self.get_lock_args(sid);
                    shard.db_slice_mut().release(mode, &lock_args);
                    let slots = self.read_slots();
                    slots[Self::slot_index(&slots, sid)]
                        .clear_mask(local_mask::KEYLOCK_ACQUIRED);
                }
                {
                    let slots = self.read_slots();
                    slots[Self::slot_index(&slots, sid)].clear_mask(local_mask::OUT_OF_ORDER);
                }
                shard.process_awakened(awaked_prerun.then(|| self.txid_relaxed()));
            }
        }

        let _ = self.decrease_run_cnt();
        // Past this point the coordinator may already be gone from the hop.
        !should_release
    }

    fn is_out_of_order_in_shard(&self, sid: ShardId) -> bool {
        self.slot_mask(sid) & local_mask::OUT_OF_ORDER != 0
    }

    fn is_queued_in_shard(&self, sid: ShardId) -> bool {
        let slots = self.read_slots();
        slots[Self::slot_index(&slots, sid)]
            .pq_pos
            .load(Ordering::Relaxed)
            != TxQueue::END
    }

    fn is_expired_in_shard(&self, sid: ShardId) -> bool {
        self.slot_mask(sid) & local_mask::EXPIRED_Q != 0
    }

    fn notify_suspended(&self, committed_txid: TxId, sid: ShardId) -> bool {
        self.handle_notify_suspended(committed_txid, sid)
    }

    fn on_converged(&self) {
        let _ = self.decrease_run_cnt();
    }

    fn on_dequeued(&self, sid: ShardId) {
        let slots = self.read_slots();
        slots[Self::slot_index(&slots, sid)]
            .pq_pos
            .store(TxQueue::END, Ordering::Relaxed);
    }

    fn debug_id(&self) -> String {
        Transaction::debug_id(self)
    }
}
