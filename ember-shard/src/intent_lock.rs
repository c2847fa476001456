//! Shared/exclusive intent locks.
//!
//! Unlike a blocking reader/writer lock, an intent lock never refuses an
//! acquisition: every queue member holds intent counts on its keys while it
//! waits for its turn. `acquire` reports whether the grant was conflict-free
//! at the moment it was taken; the scheduler uses that signal to decide
//! between eager and queued execution.

/// Access mode of an intent lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Multiple readers are compatible with each other.
    Shared,
    /// Writers are compatible with nobody.
    Exclusive,
}

impl LockMode {
    /// Counter-slot index of this mode.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Shared => 0,
            Self::Exclusive => 1,
        }
    }
}

/// Counted two-mode lock used both per key and per shard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntentLock {
    cnt: [u32; 2],
}

impl IntentLock {
    /// Increments the counter for `mode` and returns whether the grant was
    /// free of conflicting holders at that moment.
    pub fn acquire(&mut self, mode: LockMode) -> bool {
        let granted = self.check(mode);
        self.cnt[mode.index()] += 1;
        granted
    }

    /// Decrements the counter for `mode`.
    pub fn release(&mut self, mode: LockMode) {
        self.release_count(mode, 1);
    }

    /// Decrements the counter for `mode` by `count`.
    pub fn release_count(&mut self, mode: LockMode, count: u32) {
        debug_assert!(self.cnt[mode.index()] >= count, "intent lock underflow");
        self.cnt[mode.index()] -= count;
    }

    /// Whether an acquisition in `mode` would be conflict-free right now.
    #[must_use]
    pub fn check(&self, mode: LockMode) -> bool {
        match mode {
            LockMode::Shared => self.cnt[LockMode::Exclusive.index()] == 0,
            LockMode::Exclusive => self.cnt == [0, 0],
        }
    }

    /// Whether no holder of either mode remains.
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.cnt == [0, 0]
    }
}

#[cfg(test)]
mod tests {
    use super::{IntentLock, LockMode};
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn shared_holders_are_compatible() {
        let mut lock = IntentLock::default();
        assert_that!(lock.acquire(LockMode::Shared), eq(true));
        assert_that!(lock.acquire(LockMode::Shared), eq(true));
        assert_that!(IntentLock::check(&lock, LockMode::Exclusive), eq(false));
    }

    #[rstest]
    fn exclusive_conflicts_with_everything() {
        let mut lock = IntentLock::default();
        assert_that!(lock.acquire(LockMode::Exclusive), eq(true));
        assert_that!(lock.acquire(LockMode::Shared), eq(false));
        assert_that!(lock.acquire(LockMode::Exclusive), eq(false));
    }

    #[rstest]
    fn contended_acquire_still_counts() {
        let mut lock = IntentLock::default();
        let _ = lock.acquire(LockMode::Exclusive);
        let _ = lock.acquire(LockMode::Exclusive);
        lock.release(LockMode::Exclusive);
        assert_that!(lock.is_free(), eq(false));
        lock.release(LockMode::Exclusive);
        assert_that!(lock.is_free(), eq(true));
    }

    #[rstest]
    fn release_count_drops_accumulated_holds() {
        let mut lock = IntentLock::default();
        let _ = lock.acquire(LockMode::Shared);
        let _ = lock.acquire(LockMode::Shared);
        let _ = lock.acquire(LockMode::Shared);
        lock.release_count(LockMode::Shared, 3);
        assert_that!(lock.is_free(), eq(true));
    }
}
