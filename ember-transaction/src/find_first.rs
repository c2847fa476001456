//! Deterministic "first existing key" across the touched shards.

use std::sync::{Arc, Mutex, PoisonError};
use std::sync::atomic::Ordering;

use ember_common::error::{EmberResult, OpError, OpResult, OpStatus};
use ember_common::ids::{INVALID_TXID, ShardId};

use crate::transaction::Transaction;

/// Outcome of [`Transaction::find_first`]: the owning shard and the key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindFirstResult {
    /// Shard holding the key.
    pub sid: ShardId,
    /// The matched key.
    pub key: Vec<u8>,
}

impl Transaction {
    /// Runs a non-concluding hop that inspects every touched shard and
    /// returns the existing key with the smallest caller-side argument
    /// index.
    ///
    /// After a wake, only shards that have caught up with the waker
    /// (`notify_txid`) are consulted, so the result reflects the waker's
    /// write.
    ///
    /// # Errors
    ///
    /// Returns an error when a shard worker can not accept the dispatch.
    /// The inner result is `Err(KeyNotFound)` when no shard matched and
    /// `Err(WrongType)` when any shard saw an incompatible value, which
    /// overrides every other shard's outcome.
    pub fn find_first(&self) -> EmberResult<OpResult<FindFirstResult>> {
        let notify = self.notify_txid.load(Ordering::Relaxed);
        let shard_count = usize::from(self.shard_set().size());
        let find_res: Arc<Mutex<Vec<OpResult<(usize, Vec<u8>)>>>> =
            Arc::new(Mutex::new(vec![Err(OpError::KeyNotFound); shard_count]));

        let find_res_for_cb = Arc::clone(&find_res);
        self.execute(
            Arc::new(move |transaction, shard| {
                if notify == INVALID_TXID || shard.committed_txid() == notify {
                    let sid = shard.shard_id();
                    let args = transaction.shard_args_in_shard(sid);
                    let found = shard.db_slice().find_first(transaction.db_index(), &args);
                    find_res_for_cb
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)[usize::from(sid)] = found;
                }
                OpStatus::Ok
            }),
            false,
        )?;

        let find_res = find_res.lock().unwrap_or_else(PoisonError::into_inner);
        let mut min_arg_index = usize::MAX;
        let mut result: Option<FindFirstResult> = None;
        for (sid, found) in find_res.iter().enumerate() {
            let (position, key) = match found {
                Err(OpError::KeyNotFound) => continue,
                Err(OpError::WrongType) => return Ok(Err(OpError::WrongType)),
                Ok(found) => found,
            };
            let sid = ShardId::try_from(sid).expect("shard id fits u16");
            let arg_index = self.reverse_arg_index(sid, *position);
            if arg_index < min_arg_index {
                min_arg_index = arg_index;
                result = Some(FindFirstResult {
                    sid,
                    key: key.clone(),
                });
            }
        }

        Ok(result.ok_or(OpError::KeyNotFound))
    }
}
