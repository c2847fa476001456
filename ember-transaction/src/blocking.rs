//! Blocking transactions: watch registration, wake, expiry, convergence.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;

use tracing::debug;

use ember_common::error::{EmberResult, OpStatus};
use ember_common::ids::{INVALID_TXID, ShardId, TxId};
use ember_shard::EngineShard;

use crate::transaction::{Transaction, coord, local_mask};

impl Transaction {
    /// Parks the transaction on its keys until a writer wakes it or the
    /// deadline passes.
    ///
    /// Registers the transaction on every touched shard's watch tables
    /// (keeping its locks), then waits on the blocking condition variable.
    /// Returns `true` on a wake, `false` on timeout or cancellation; in the
    /// latter case the locks are already released and the shards marked
    /// expired.
    ///
    /// # Errors
    ///
    /// Returns an error when a shard worker can not accept a dispatch.
    pub fn wait_on_watch(&self, deadline: Option<Instant>) -> EmberResult<bool> {
        self.execute(
            Arc::new(|transaction, shard| transaction.add_to_watched_shard(shard)),
            true,
        )?;
        self.set_state(coord::BLOCKED);

        let wake_predicate = || {
            self.state() & coord::CANCELLED != 0
                || self.notify_txid.load(Ordering::Relaxed) != INVALID_TXID
        };
        let woken = match deadline {
            None => {
                debug!(id = %self.debug_id(), "blocking without deadline");
                self.blocking_ec.wait_until(wake_predicate);
                true
            }
            Some(deadline) => {
                debug!(id = %self.debug_id(), "blocking with deadline");
                self.blocking_ec.wait_deadline(wake_predicate, deadline)
            }
        };

        if self.state() & coord::CANCELLED != 0 || !woken {
            // Stale dispatches from the registration hop must not observe
            // the expiry protocol.
            self.bump_seqlock();
            self.expire_blocking()?;
            self.clear_state(coord::BLOCKED);
            return Ok(false);
        }

        // One shard woke us; make sure every other touched shard has seen
        // the waker's effects before the caller reads data.
        let shard_cnt = self.unique_shard_cnt();
        if shard_cnt > 1 {
            self.bump_seqlock();
            self.publish_run_count(shard_cnt);
            let notify = self.notify_txid.load(Ordering::Relaxed);
            for sid in self.active_shards() {
                debug_assert_eq!(self.slot_mask(sid) & local_mask::ARMED, 0);
                let this = self.self_arc();
                self.shard_set().add(
                    sid,
                    Box::new(move |shard| {
                        let sid = shard.shard_id();
                        if this.slot_mask(sid) & local_mask::AWAKED_Q != 0
                            || shard.has_result_converged(notify)
                        {
                            let _ = this.decrease_run_cnt();
                            return;
                        }
                        shard.wait_for_convergence(notify, Transaction::queued_handle(&this));
                    }),
                )?;
            }
            self.wait_for_shard_callbacks();
            debug!(id = %self.debug_id(), "wake converged");
        }

        self.clear_state(coord::BLOCKED);
        Ok(true)
    }

    /// Removes this transaction from every touched shard's watch tables and
    /// concludes, releasing its locks.
    ///
    /// # Errors
    ///
    /// Returns an error when a shard worker can not accept the dispatch.
    pub fn unregister_watch(&self) -> EmberResult<()> {
        self.execute(
            Arc::new(|transaction, shard| {
                let _ = transaction.remove_from_watched_shard(shard);
                OpStatus::Ok
            }),
            true,
        )
    }

    /// Wakes the blocking wait when the owner connection goes away.
    ///
    /// Safe to call repeatedly; only a blocked transaction reacts, and the
    /// waiter observes the cancellation exactly once.
    pub fn break_on_close(&self) {
        if self.state() & coord::BLOCKED != 0 {
            self.set_state(coord::CANCELLED);
            self.blocking_ec.notify();
        }
    }

    /// Expires the blocking wait: releases every touched shard's locks,
    /// marks the slots expired, and lets the queues advance.
    pub(crate) fn expire_blocking(&self) -> EmberResult<()> {
        debug!(id = %self.debug_id(), "expire blocking");
        debug_assert!(!self.is_global());

        let shard_cnt = self.unique_shard_cnt();
        self.publish_run_count(shard_cnt);

        for sid in self.active_shards() {
            let this = self.self_arc();
            self.shard_set().add(
                sid,
                Box::new(move |shard| {
                    let sid = shard.shard_id();
                    let lock_args = this.get_lock_args(sid);
                    shard.db_slice_mut().release(this.mode(), &lock_args);
                    {
                        let slots = this.read_slots();
                        let slot = &slots[Transaction::slot_index(&slots, sid)];
                        slot.set_mask(local_mask::EXPIRED_Q);
                        slot.clear_mask(local_mask::KEYLOCK_ACQUIRED);
                    }
                    // Drop our watch entries and hand any pending wake to
                    // the next waiter, then let stalled work proceed.
                    shard.process_awakened(Some(this.txid_relaxed()));
                    shard.poll_execution("expirecb", None);
                    let _ = this.decrease_run_cnt();
                }),
            )?;
        }

        self.wait_for_shard_callbacks();
        debug!(id = %self.debug_id(), "expire blocking finished");
        Ok(())
    }

    /// Shard-side watch registration; runs as a hop callback.
    pub(crate) fn add_to_watched_shard(&self, shard: &mut EngineShard) -> OpStatus {
        let sid = shard.shard_id();
        debug_assert_eq!(self.slot_mask(sid) & local_mask::SUSPENDED_Q, 0);

        let db = self.db_index();
        let this = self.self_arc();
        let lock_args = self.get_lock_args(sid);
        for key in lock_args.keys() {
            shard.add_watched(db, key, Transaction::queued_handle(&this));
        }
        {
            let slots = self.read_slots();
            slots[Self::slot_index(&slots, sid)].set_mask(local_mask::SUSPENDED_Q);
        }
        OpStatus::Ok
    }

    /// Shard-side watch removal. Clears the suspension (so a concluding hop
    /// releases the locks) while keeping the awaked/expired history bits.
    ///
    /// Callers that consume a wake fold this into their final data hop; a
    /// standalone cleanup goes through [`Transaction::unregister_watch`].
    pub fn remove_from_watched_shard(&self, shard: &mut EngineShard) -> bool {
        const WATCH_STATE: u16 =
            local_mask::SUSPENDED_Q | local_mask::AWAKED_Q | local_mask::EXPIRED_Q;

        let sid = shard.shard_id();
        if self.slot_mask(sid) & WATCH_STATE == 0 {
            return false;
        }
        {
            let slots = self.read_slots();
            slots[Self::slot_index(&slots, sid)].clear_mask(local_mask::SUSPENDED_Q);
        }

        let db = self.db_index();
        let txid = self.txid_relaxed();
        let lock_args = self.get_lock_args(sid);
        for key in lock_args.keys() {
            shard.removed_watched(db, key, txid);
        }
        true
    }

    /// Shard-side wake. Flips the slot from suspended to awaked and lowers
    /// `notify_txid` toward the earliest waker.
    pub(crate) fn handle_notify_suspended(&self, committed_txid: TxId, sid: ShardId) -> bool {
        let mask = self.slot_mask(sid);
        debug_assert_ne!(mask & local_mask::SUSPENDED_Q, 0);
        debug!(id = %self.debug_id(), shard = sid, mask, "notify suspended");

        if mask & local_mask::EXPIRED_Q != 0 {
            return false;
        }

        if mask & local_mask::SUSPENDED_Q != 0 {
            debug_assert_eq!(mask & local_mask::AWAKED_Q, 0);
            {
                let slots = self.read_slots();
                let slot = &slots[Self::slot_index(&slots, sid)];
                slot.clear_mask(local_mask::SUSPENDED_Q);
                slot.set_mask(local_mask::AWAKED_Q);
            }

            // Track the earliest waker across shards; only an improvement
            // notifies, so the coordinator wakes exactly once per earliest
            // wake.
            let mut current = self.notify_txid.load(Ordering::Relaxed);
            while committed_txid < current {
                match self.notify_txid.compare_exchange_weak(
                    current,
                    committed_txid,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        self.blocking_ec.notify();
                        break;
                    }
                    Err(actual) => current = actual,
                }
            }
            return true;
        }

        debug_assert_ne!(mask & local_mask::AWAKED_Q, 0);
        true
    }
}
