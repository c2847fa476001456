//! Shard-local keyspace slice with its intent-lock table.

use std::collections::VecDeque;

use hashbrown::HashMap;

use ember_common::error::{OpError, OpResult};
use ember_common::ids::{DbIndex, ShardId};

use crate::intent_lock::{IntentLock, LockMode};
use crate::{KeyLockArgs, ShardArgs};

/// Stored value of one key.
///
/// Only the shapes the coordinator can observe are modeled: plain strings
/// and lists (the latter so blocking pops and `WrongType` inspections have
/// something real to look at).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Binary-safe string payload.
    Str(Vec<u8>),
    /// Ordered list payload.
    List(VecDeque<Vec<u8>>),
}

type KeyId = (DbIndex, Vec<u8>);

/// Logical keyspace slice owned by a single shard.
#[derive(Debug)]
pub struct DbSlice {
    shard_id: ShardId,
    locks: HashMap<KeyId, IntentLock>,
    entries: HashMap<KeyId, Value>,
}

impl DbSlice {
    /// Creates an empty slice for `shard_id`.
    #[must_use]
    pub fn new(shard_id: ShardId) -> Self {
        Self {
            shard_id,
            locks: HashMap::new(),
            entries: HashMap::new(),
        }
    }

    /// Owner shard id.
    #[must_use]
    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    /// Acquires intent locks on every key of `lock_args`.
    ///
    /// The counts are taken unconditionally; the return value reports
    /// whether every grant was conflict-free at acquisition time.
    pub fn acquire(&mut self, mode: LockMode, lock_args: &KeyLockArgs) -> bool {
        let mut uncontended = true;
        for key in lock_args.keys() {
            let lock = self
                .locks
                .entry((lock_args.db_index, key.to_vec()))
                .or_default();
            uncontended &= lock.acquire(mode);
        }
        uncontended
    }

    /// Releases one intent hold per key of `lock_args`.
    pub fn release(&mut self, mode: LockMode, lock_args: &KeyLockArgs) {
        for key in lock_args.keys() {
            self.release_count(mode, lock_args.db_index, key, 1);
        }
    }

    /// Releases `count` accumulated holds on a single key.
    pub fn release_count(&mut self, mode: LockMode, db: DbIndex, key: &[u8], count: u32) {
        if count == 0 {
            return;
        }
        let key_id = (db, key.to_vec());
        let Some(lock) = self.locks.get_mut(&key_id) else {
            debug_assert!(false, "releasing a key that holds no lock");
            return;
        };
        lock.release_count(mode, count);
        if lock.is_free() {
            let _ = self.locks.remove(&key_id);
        }
    }

    /// Whether every key of `lock_args` could be acquired in `mode` without
    /// conflict, without taking anything.
    #[must_use]
    pub fn check_lock(&self, mode: LockMode, lock_args: &KeyLockArgs) -> bool {
        lock_args.keys().all(|key| {
            self.locks
                .get(&(lock_args.db_index, key.to_vec()))
                .is_none_or(|lock| lock.check(mode))
        })
    }

    /// Whether any intent hold remains for `key`.
    #[must_use]
    pub fn is_locked(&self, db: DbIndex, key: &[u8]) -> bool {
        self.locks.contains_key(&(db, key.to_vec()))
    }

    /// Finds the first argument position whose key exists in `db`.
    ///
    /// # Errors
    ///
    /// Returns [`OpError::KeyNotFound`] when no argument matches an existing
    /// key and [`OpError::WrongType`] when the first match is not a list
    /// (blocking pops only wait on list-shaped data).
    pub fn find_first(&self, db: DbIndex, args: &ShardArgs) -> OpResult<(usize, Vec<u8>)> {
        for (position, key) in args.as_slice().iter().enumerate() {
            match self.entries.get(&(db, key.clone())) {
                Some(Value::List(_)) => return Ok((position, key.clone())),
                Some(Value::Str(_)) => return Err(OpError::WrongType),
                None => {}
            }
        }
        Err(OpError::KeyNotFound)
    }

    /// Whether `key` exists in `db`.
    #[must_use]
    pub fn contains(&self, db: DbIndex, key: &[u8]) -> bool {
        self.entries.contains_key(&(db, key.to_vec()))
    }

    /// Stores a string value, replacing whatever was there.
    pub fn set_str(&mut self, db: DbIndex, key: &[u8], value: Vec<u8>) {
        let _ = self.entries.insert((db, key.to_vec()), Value::Str(value));
    }

    /// Reads a string value.
    ///
    /// # Errors
    ///
    /// Returns [`OpError::KeyNotFound`] for missing keys and
    /// [`OpError::WrongType`] for non-string values.
    pub fn get_str(&self, db: DbIndex, key: &[u8]) -> OpResult<&[u8]> {
        match self.entries.get(&(db, key.to_vec())) {
            Some(Value::Str(value)) => Ok(value.as_slice()),
            Some(Value::List(_)) => Err(OpError::WrongType),
            None => Err(OpError::KeyNotFound),
        }
    }

    /// Appends to a list, creating it when absent. Returns the new length.
    ///
    /// # Errors
    ///
    /// Returns [`OpError::WrongType`] when the key holds a non-list value.
    pub fn push_back(&mut self, db: DbIndex, key: &[u8], value: Vec<u8>) -> OpResult<usize> {
        let entry = self
            .entries
            .entry((db, key.to_vec()))
            .or_insert_with(|| Value::List(VecDeque::new()));
        match entry {
            Value::List(list) => {
                list.push_back(value);
                Ok(list.len())
            }
            Value::Str(_) => Err(OpError::WrongType),
        }
    }

    /// Pops the head of a list, dropping the key when it empties.
    ///
    /// # Errors
    ///
    /// Returns [`OpError::KeyNotFound`] for missing keys and
    /// [`OpError::WrongType`] for non-list values.
    pub fn pop_front(&mut self, db: DbIndex, key: &[u8]) -> OpResult<Vec<u8>> {
        let key_id = (db, key.to_vec());
        let Some(entry) = self.entries.get_mut(&key_id) else {
            return Err(OpError::KeyNotFound);
        };
        let Value::List(list) = entry else {
            return Err(OpError::WrongType);
        };
        let Some(value) = list.pop_front() else {
            let _ = self.entries.remove(&key_id);
            return Err(OpError::KeyNotFound);
        };
        if list.is_empty() {
            let _ = self.entries.remove(&key_id);
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::DbSlice;
    use crate::intent_lock::LockMode;
    use crate::{KeyLockArgs, ShardArgs};
    use ember_common::error::OpError;
    use googletest::prelude::*;
    use rstest::rstest;
    use std::sync::Arc;

    fn lock_args(keys: &[&str], step: usize) -> KeyLockArgs {
        let backing = Arc::new(
            keys.iter()
                .map(|key| key.as_bytes().to_vec())
                .collect::<Vec<_>>(),
        );
        KeyLockArgs {
            db_index: 0,
            key_step: step,
            args: ShardArgs::whole(backing),
        }
    }

    #[rstest]
    fn acquire_reports_contention_but_still_counts() {
        let mut slice = DbSlice::new(0);
        let args = lock_args(&["k"], 1);

        assert_that!(slice.acquire(LockMode::Exclusive, &args), eq(true));
        assert_that!(slice.acquire(LockMode::Exclusive, &args), eq(false));

        slice.release(LockMode::Exclusive, &args);
        assert_that!(slice.is_locked(0, b"k"), eq(true));
        slice.release(LockMode::Exclusive, &args);
        assert_that!(slice.is_locked(0, b"k"), eq(false));
    }

    #[rstest]
    fn check_lock_does_not_take_holds() {
        let mut slice = DbSlice::new(0);
        let args = lock_args(&["a", "b"], 1);

        assert_that!(slice.check_lock(LockMode::Exclusive, &args), eq(true));
        assert_that!(slice.is_locked(0, b"a"), eq(false));

        let _ = slice.acquire(LockMode::Shared, &args);
        assert_that!(slice.check_lock(LockMode::Exclusive, &args), eq(false));
        assert_that!(slice.check_lock(LockMode::Shared, &args), eq(true));
    }

    #[rstest]
    fn release_count_clears_accumulated_multi_holds() {
        let mut slice = DbSlice::new(0);
        let args = lock_args(&["k"], 1);
        let _ = slice.acquire(LockMode::Exclusive, &args);
        let _ = slice.acquire(LockMode::Exclusive, &args);

        slice.release_count(LockMode::Exclusive, 0, b"k", 2);
        assert_that!(slice.is_locked(0, b"k"), eq(false));
    }

    #[rstest]
    fn step_two_lock_args_only_lock_keys() {
        let mut slice = DbSlice::new(0);
        let args = lock_args(&["k1", "v1", "k2", "v2"], 2);
        let _ = slice.acquire(LockMode::Exclusive, &args);

        assert_that!(slice.is_locked(0, b"k1"), eq(true));
        assert_that!(slice.is_locked(0, b"v1"), eq(false));
        assert_that!(slice.is_locked(0, b"k2"), eq(true));
    }

    #[rstest]
    fn find_first_returns_earliest_existing_list() {
        let mut slice = DbSlice::new(0);
        let _ = slice.push_back(0, b"second", b"x".to_vec());

        let args = lock_args(&["missing", "second"], 1).args;
        let (position, key) = slice.find_first(0, &args).expect("a list exists");
        assert_that!(position, eq(1_usize));
        assert_that!(key, eq(&b"second".to_vec()));
    }

    #[rstest]
    fn find_first_reports_wrong_type_for_string_match() {
        let mut slice = DbSlice::new(0);
        slice.set_str(0, b"k", b"v".to_vec());

        let args = lock_args(&["k"], 1).args;
        assert_that!(slice.find_first(0, &args), eq(&Err(OpError::WrongType)));
    }

    #[rstest]
    fn pop_front_drains_and_drops_empty_lists() {
        let mut slice = DbSlice::new(0);
        let _ = slice.push_back(0, b"q", b"1".to_vec());
        let _ = slice.push_back(0, b"q", b"2".to_vec());

        assert_that!(slice.pop_front(0, b"q"), eq(&Ok(b"1".to_vec())));
        assert_that!(slice.pop_front(0, b"q"), eq(&Ok(b"2".to_vec())));
        assert_that!(slice.contains(0, b"q"), eq(false));
        assert_that!(slice.pop_front(0, b"q"), eq(&Err(OpError::KeyNotFound)));
    }
}
