//! Scheduling: txid allocation and the per-shard queue protocol.
//!
//! Scheduling is optimistic: the coordinator picks a fresh txid, asks every
//! touched shard to insert it into its queue, and retries with a higher
//! txid when any shard refuses. A shard refuses only when accepting would
//! reorder the queue around a transaction that may already be executing
//! eagerly under a lower txid.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tracing::debug;

use ember_common::error::{EmberResult, OpStatus};
use ember_common::ids::ShardId;
use ember_shard::{EngineShard, TxQueue};

use crate::transaction::{RunnableCallback, Transaction, coord, local_mask, next_txid};

impl Transaction {
    /// Schedules the transaction once; later calls are no-ops.
    ///
    /// # Errors
    ///
    /// Returns an error when a shard worker can not accept the scheduling
    /// task.
    pub fn schedule(&self) -> EmberResult<()> {
        if self.state() & coord::SCHED == 0 {
            self.schedule_internal()?;
        }
        Ok(())
    }

    /// Schedule-and-execute fast path for single-hop transactions.
    ///
    /// A non-multi transaction touching one shard skips scheduling entirely
    /// when its keys are uncontended: the callback runs eagerly on the shard
    /// thread without ever taking a txid. Everything else falls back to the
    /// regular schedule + execute pair.
    ///
    /// # Errors
    ///
    /// Returns an error when a shard worker can not accept the dispatch.
    pub fn schedule_single_hop(&self, cb: RunnableCallback) -> EmberResult<OpStatus> {
        debug_assert!(self.read_cb().is_none());
        self.install_cb(Some(cb));
        self.set_state(coord::EXEC | coord::EXEC_CONCLUDING);
        if !self.is_multi() {
            debug_assert_eq!(self.state() & coord::SCHED, 0);
        }

        let (shard_cnt, unique_sid) = {
            let routing = self.read_routing();
            (routing.unique_shard_cnt, routing.unique_shard_id)
        };
        let schedule_fast = shard_cnt == 1
            && !self.is_global()
            && !self.is_multi()
            && self.shard_set().config().enable_quick_run;

        if schedule_fast {
            {
                let slots = self.read_slots();
                debug_assert_eq!(slots.len(), 1);
                slots[0].set_mask(local_mask::ARMED);
            }
            let _ = self.add_run_count(1);

            // The task must not touch this stack frame: an eager run
            // releases the barrier from inside the closure, and the
            // coordinator may move past the wait before the closure returns.
            let this = self.self_arc();
            self.shard_set().add(
                unique_sid,
                Box::new(move |shard| {
                    let run_eager = this.schedule_unique_shard(shard);
                    if run_eager {
                        let _ = this.decrease_run_cnt();
                    }
                }),
            )?;
        } else {
            if !self.is_multi() {
                self.schedule_internal()?;
            }
            self.execute_async()?;
        }

        self.wait_for_shard_callbacks();
        self.install_cb(None);
        Ok(self.local_result())
    }

    pub(crate) fn schedule_internal(&self) -> EmberResult<()> {
        debug_assert_eq!(self.txid_relaxed(), 0);
        debug_assert_eq!(self.state() & (coord::SCHED | coord::OOO), 0);

        let span_all = self.is_global();
        let single_hop = self.state() & coord::EXEC_CONCLUDING != 0;
        let mode = self.mode();

        let active: Vec<ShardId> = if span_all {
            // Whole-shard locks are taken up front; queue insertion below
            // never reorders around them.
            self.shard_set().run_brief_in_parallel(
                move |shard| {
                    let _ = shard.shard_lock_mut().acquire(mode);
                },
                None,
            )?;
            self.shard_set().shard_ids().collect()
        } else {
            self.active_shards()
        };
        debug_assert!(!active.is_empty(), "scheduling requires routed shards");
        let num_shards = u32::try_from(active.len()).expect("shard count fits u32");

        loop {
            self.store_txid(next_txid());

            let success = Arc::new(AtomicU32::new(0));
            let lock_granted = Arc::new(AtomicU32::new(0));
            {
                let this = self.self_arc();
                let success = Arc::clone(&success);
                let lock_granted = Arc::clone(&lock_granted);
                let is_active = |sid: ShardId| active.contains(&sid);
                self.shard_set().run_brief_in_parallel(
                    move |shard| {
                        let (scheduled, granted) = this.schedule_in_shard(shard);
                        if scheduled {
                            let _ = success.fetch_add(1, Ordering::AcqRel);
                        }
                        if granted {
                            let _ = lock_granted.fetch_add(1, Ordering::AcqRel);
                        }
                    },
                    Some(&is_active),
                )?;
            }

            if success.load(Ordering::Acquire) == num_shards {
                // Out-of-order execution is only sound for single-hop
                // transactions whose every lock was granted on this attempt:
                // such a transaction has no conflicting predecessor anywhere.
                if single_hop && lock_granted.load(Ordering::Acquire) == num_shards && !span_all {
                    self.set_state(coord::OOO);
                }
                self.set_state(coord::SCHED);
                debug!(id = %self.debug_id(), ooo = self.is_ooo(), "scheduled");
                break;
            }

            debug!(id = %self.debug_id(), "cancelling partial schedule");
            let cancelled = Arc::new(AtomicU32::new(0));
            {
                let this = self.self_arc();
                let cancelled = Arc::clone(&cancelled);
                let is_active = |sid: ShardId| active.contains(&sid);
                self.shard_set().run_brief_in_parallel(
                    move |shard| {
                        if this.cancel_in_shard(shard) {
                            let _ = cancelled.fetch_add(1, Ordering::AcqRel);
                        }
                    },
                    Some(&is_active),
                )?;
            }
            debug_assert_eq!(
                cancelled.load(Ordering::Acquire),
                success.load(Ordering::Acquire),
                "every scheduled shard must roll back"
            );
        }

        if self.is_ooo() {
            let slots = self.read_slots();
            for slot in slots.iter() {
                slot.set_mask(local_mask::OUT_OF_ORDER);
            }
        }
        Ok(())
    }

    /// One shard's scheduling attempt. Returns `(scheduled, lock_granted)`.
    pub(crate) fn schedule_in_shard(&self, shard: &mut EngineShard) -> (bool, bool) {
        let txid = self.txid_relaxed();
        if shard.committed_txid() >= txid {
            // This txid is already in the shard's past; force a retry with
            // a fresh one.
            return (false, false);
        }

        let mode = self.mode();
        let spans_all = self.is_global();
        let sid = shard.shard_id();
        let mut lock_granted = false;

        if !spans_all {
            let shard_unlocked = shard.shard_lock().check(mode);
            let lock_args = self.get_lock_args(sid);
            // Queue members always hold intent locks; the grant outcome only
            // decides eligibility for eager execution.
            let acquired = shard.db_slice_mut().acquire(mode, &lock_args);
            {
                let slots = self.read_slots();
                slots[Self::slot_index(&slots, sid)].set_mask(local_mask::KEYLOCK_ACQUIRED);
            }
            lock_granted = acquired && shard_unlocked;
        }

        if !shard.txq().is_empty() {
            // Inserting before the current tail is only safe when our locks
            // were granted: a contended insert below the tail could break a
            // lower-txid transaction that already deduced it may run
            // eagerly.
            let to_proceed = lock_granted
                || shard
                    .txq()
                    .tail_score()
                    .is_some_and(|tail_score| tail_score < txid);
            if !to_proceed {
                let holds_keylock = {
                    let slots = self.read_slots();
                    slots[Self::slot_index(&slots, sid)].mask() & local_mask::KEYLOCK_ACQUIRED != 0
                };
                if holds_keylock {
                    let lock_args = self.get_lock_args(sid);
                    shard.db_slice_mut().release(mode, &lock_args);
                    let slots = self.read_slots();
                    slots[Self::slot_index(&slots, sid)]
                        .clear_mask(local_mask::KEYLOCK_ACQUIRED);
                }
                return (false, false);
            }
        }

        let pos = shard.txq_mut().insert(Self::queued_handle(&self.self_arc()));
        {
            let slots = self.read_slots();
            let slot = &slots[Self::slot_index(&slots, sid)];
            debug_assert_eq!(slot.pq_pos.load(Ordering::Relaxed), TxQueue::END);
            slot.pq_pos.store(pos, Ordering::Relaxed);
        }
        debug!(id = %self.debug_id(), shard = sid, pos, granted = lock_granted, "queued");
        (true, lock_granted)
    }

    /// Undoes one shard's successful scheduling attempt.
    pub(crate) fn cancel_in_shard(&self, shard: &mut EngineShard) -> bool {
        let sid = shard.shard_id();
        let pos = {
            let slots = self.read_slots();
            slots[Self::slot_index(&slots, sid)]
                .pq_pos
                .swap(TxQueue::END, Ordering::Relaxed)
        };
        if pos == TxQueue::END {
            return false;
        }
        debug_assert!(
            shard
                .txq()
                .at(pos)
                .is_some_and(|queued| queued.txid() == self.txid_relaxed()),
            "queue position does not hold this transaction"
        );
        shard.txq_mut().remove(pos);

        let holds_keylock = {
            let slots = self.read_slots();
            slots[Self::slot_index(&slots, sid)].mask() & local_mask::KEYLOCK_ACQUIRED != 0
        };
        if holds_keylock {
            let lock_args = self.get_lock_args(sid);
            shard.db_slice_mut().release(self.mode(), &lock_args);
            let slots = self.read_slots();
            slots[Self::slot_index(&slots, sid)].clear_mask(local_mask::KEYLOCK_ACQUIRED);
        }
        true
    }

    /// Shard-side half of the single-shard fast path. Returns `true` when
    /// the callback ran eagerly, `false` when the transaction was queued.
    pub(crate) fn schedule_unique_shard(&self, shard: &mut EngineShard) -> bool {
        debug_assert!(!self.is_multi());
        debug_assert_eq!(self.txid_relaxed(), 0);

        let sid = shard.shard_id();
        let mode = self.mode();
        let lock_args = self.get_lock_args(sid);
        {
            let slots = self.read_slots();
            debug_assert_eq!(slots.len(), 1);
            debug_assert_eq!(slots[0].pq_pos.load(Ordering::Relaxed), TxQueue::END);
        }

        // Uncontended keys: run the callback right here, without a txid or
        // a queue entry.
        if shard.db_slice().check_lock(mode, &lock_args) {
            self.run_quickie(shard);
            return true;
        }

        self.store_txid(next_txid());
        let pos = shard.txq_mut().insert(Self::queued_handle(&self.self_arc()));
        {
            let slots = self.read_slots();
            debug_assert_eq!(slots[0].mask() & local_mask::KEYLOCK_ACQUIRED, 0);
            slots[0].pq_pos.store(pos, Ordering::Relaxed);
        }
        let acquired = shard.db_slice_mut().acquire(mode, &lock_args);
        debug_assert!(!acquired, "check_lock above reported contention");
        {
            let slots = self.read_slots();
            slots[0].set_mask(local_mask::KEYLOCK_ACQUIRED);
        }

        debug!(id = %self.debug_id(), shard = sid, "rescheduled into queue");
        shard.poll_execution("schedule_unique", None);
        false
    }

    /// Runs the callback for an uncontended single-shard transaction.
    pub(crate) fn run_quickie(&self, shard: &mut EngineShard) {
        debug_assert!(!self.is_multi());
        debug_assert_eq!(self.txid_relaxed(), 0);
        shard.inc_quick_run();

        {
            let slots = self.read_slots();
            debug_assert_eq!(slots.len(), 1);
            debug_assert_eq!(
                slots[0].mask() & (local_mask::KEYLOCK_ACQUIRED | local_mask::OUT_OF_ORDER),
                0
            );
        }

        let cb = self
            .read_cb()
            .expect("quick run requires an installed callback");
        let status = cb(self, shard);
        self.store_local_result(status);

        let slots = self.read_slots();
        slots[0].clear_mask(local_mask::ARMED);
        drop(slots);
        self.install_cb(None);
    }

}
