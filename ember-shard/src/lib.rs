//! Per-shard engine consumed by the transaction coordinator.
//!
//! Each shard is owned by exactly one worker thread ([`shard_set::ShardSet`])
//! that serially applies tasks against its [`engine_shard::EngineShard`]:
//! the intent-lock tables, the ordered transaction queue, the watch tables
//! for blocking transactions, and the keyspace slice. The coordinator lives
//! in a separate crate and is seen here only through the
//! [`QueuedTransaction`] trait.

pub mod db_slice;
pub mod engine_shard;
pub mod intent_lock;
pub mod shard_set;
pub mod tx_queue;
pub mod watch;

use std::sync::Arc;

use ember_common::ids::{DbIndex, ShardId, TxId};

pub use db_slice::DbSlice;
pub use engine_shard::EngineShard;
pub use intent_lock::{IntentLock, LockMode};
pub use shard_set::{ShardSet, ShardTask};
pub use tx_queue::TxQueue;

/// Coordinator-side transaction as seen by a shard.
///
/// Queue entries, watch-table entries, and convergence waiters all hold
/// `Arc<dyn QueuedTransaction>`, so the shard engine never names the
/// concrete coordinator type. Identity inside shard structures is the
/// transaction id: every queued or watching transaction has been scheduled
/// and therefore carries a unique positive `txid`.
pub trait QueuedTransaction: Send + Sync + std::fmt::Debug {
    /// Scheduled transaction id (positive once queued).
    fn txid(&self) -> TxId;

    /// Whether this shard's slot is armed for the current hop.
    fn is_armed_in_shard(&self, sid: ShardId) -> bool;

    /// Runs the current hop's callback on this shard. Returns `true` when
    /// the shard must retain the transaction as a continuation for a later
    /// hop.
    fn run_in_shard(&self, shard: &mut EngineShard) -> bool;

    /// Whether this shard's slot carries the out-of-order grant.
    fn is_out_of_order_in_shard(&self, sid: ShardId) -> bool;

    /// Whether this transaction currently occupies a queue position on this
    /// shard. Armed transactions without a position (retained multi-hop
    /// continuations, woken blockers) run directly when polled.
    fn is_queued_in_shard(&self, sid: ShardId) -> bool;

    /// Whether this shard's slot was expired by a timed-out blocking wait.
    fn is_expired_in_shard(&self, sid: ShardId) -> bool;

    /// Wakes a suspended blocking transaction. Returns `false` when the
    /// slot already expired and the caller should drop its watch entry.
    fn notify_suspended(&self, committed_txid: TxId, sid: ShardId) -> bool;

    /// Completes this transaction's convergence wait on the current shard.
    fn on_converged(&self);

    /// Records that the shard discarded this transaction's queue entry
    /// without running it (expired heads only).
    fn on_dequeued(&self, sid: ShardId);

    /// Short diagnostic identity for logs.
    fn debug_id(&self) -> String;
}

/// Shared, shard-scoped view into a transaction's argument array.
///
/// The coordinator sorts its argument vector by destination shard and hands
/// every shard a `(start, count)` window over the shared backing store, so
/// per-hop dispatch never copies keys.
#[derive(Debug, Clone)]
pub struct ShardArgs {
    backing: Arc<Vec<Vec<u8>>>,
    start: usize,
    count: usize,
}

impl ShardArgs {
    /// Creates a window over `backing`.
    ///
    /// Callers guarantee `start + count <= backing.len()`.
    #[must_use]
    pub fn new(backing: Arc<Vec<Vec<u8>>>, start: usize, count: usize) -> Self {
        debug_assert!(start + count <= backing.len());
        Self {
            backing,
            start,
            count,
        }
    }

    /// Window covering the whole backing array.
    #[must_use]
    pub fn whole(backing: Arc<Vec<Vec<u8>>>) -> Self {
        let count = backing.len();
        Self {
            backing,
            start: 0,
            count,
        }
    }

    /// Arguments inside the window.
    #[must_use]
    pub fn as_slice(&self) -> &[Vec<u8>] {
        &self.backing[self.start..self.start + self.count]
    }

    /// Number of arguments in the window.
    #[must_use]
    pub fn len(&self) -> usize {
        self.count
    }

    /// Whether the window is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Lock-table addressing for one shard of a transaction.
#[derive(Debug, Clone)]
pub struct KeyLockArgs {
    /// Logical database the keys live in.
    pub db_index: DbIndex,
    /// Distance between consecutive keys inside `args` (2 for key/value
    /// pair commands, 1 otherwise).
    pub key_step: usize,
    /// This shard's argument window.
    pub args: ShardArgs,
}

impl KeyLockArgs {
    /// Iterates the keys of the window, skipping values of stride-2
    /// commands.
    pub fn keys(&self) -> impl Iterator<Item = &[u8]> {
        self.args
            .as_slice()
            .iter()
            .step_by(self.key_step.max(1))
            .map(Vec::as_slice)
    }
}

#[cfg(test)]
mod tests {
    use super::{KeyLockArgs, ShardArgs};
    use googletest::prelude::*;
    use rstest::rstest;
    use std::sync::Arc;

    fn backing(values: &[&str]) -> Arc<Vec<Vec<u8>>> {
        Arc::new(values.iter().map(|value| value.as_bytes().to_vec()).collect())
    }

    #[rstest]
    fn shard_args_window_exposes_expected_slice() {
        let args = ShardArgs::new(backing(&["a", "b", "c", "d"]), 1, 2);
        assert_that!(args.len(), eq(2_usize));
        assert_that!(args.as_slice(), eq(&[b"b".to_vec(), b"c".to_vec()][..]));
    }

    #[rstest]
    fn lock_args_step_two_skips_values() {
        let lock_args = KeyLockArgs {
            db_index: 0,
            key_step: 2,
            args: ShardArgs::whole(backing(&["k1", "v1", "k2", "v2"])),
        };
        let keys = lock_args.keys().collect::<Vec<_>>();
        assert_that!(keys, eq(&vec![b"k1".as_slice(), b"k2".as_slice()]));
    }
}
