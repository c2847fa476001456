//! Coordinator-side wait/notify primitive.

use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Instant;

/// Predicate-driven wait point shared between a coordinator thread and the
/// shard workers that complete its hops.
///
/// Waiters re-check their predicate under the internal mutex, and notifiers
/// take the same mutex before signalling, so a notification can not slip
/// between the predicate check and the wait. The predicate itself reads
/// state the notifier published before calling [`EventCount::notify`]
/// (typically an atomic counter), which keeps the hot path lock-free.
#[derive(Debug, Default)]
pub struct EventCount {
    mutex: Mutex<()>,
    cond: Condvar,
}

impl EventCount {
    /// Creates an idle event count.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wakes every waiter so it re-evaluates its predicate.
    pub fn notify(&self) {
        let _guard = self.mutex.lock().unwrap_or_else(PoisonError::into_inner);
        self.cond.notify_all();
    }

    /// Blocks until `predicate` returns true.
    pub fn wait_until(&self, predicate: impl Fn() -> bool) {
        let mut guard = self.mutex.lock().unwrap_or_else(PoisonError::into_inner);
        while !predicate() {
            guard = self
                .cond
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Blocks until `predicate` returns true or `deadline` passes.
    ///
    /// Returns `true` when the predicate was satisfied and `false` on
    /// timeout.
    pub fn wait_deadline(&self, predicate: impl Fn() -> bool, deadline: Instant) -> bool {
        let mut guard = self.mutex.lock().unwrap_or_else(PoisonError::into_inner);
        while !predicate() {
            let now = Instant::now();
            if now >= deadline {
                return predicate();
            }
            let (next, timeout) = self
                .cond
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            guard = next;
            if timeout.timed_out() {
                return predicate();
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::EventCount;
    use googletest::prelude::*;
    use rstest::rstest;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::{Duration, Instant};

    #[rstest]
    fn wait_until_returns_once_predicate_flips() {
        let event = Arc::new(EventCount::new());
        let flag = Arc::new(AtomicBool::new(false));

        let notifier = {
            let event = Arc::clone(&event);
            let flag = Arc::clone(&flag);
            std::thread::spawn(move || {
                flag.store(true, Ordering::Release);
                event.notify();
            })
        };

        event.wait_until(|| flag.load(Ordering::Acquire));
        notifier.join().expect("notifier thread must not panic");
        assert_that!(flag.load(Ordering::Acquire), eq(true));
    }

    #[rstest]
    fn wait_deadline_times_out_without_notification() {
        let event = EventCount::new();
        let deadline = Instant::now() + Duration::from_millis(20);
        assert_that!(event.wait_deadline(|| false, deadline), eq(false));
    }

    #[rstest]
    fn wait_deadline_observes_already_true_predicate() {
        let event = EventCount::new();
        let deadline = Instant::now() + Duration::from_millis(20);
        assert_that!(event.wait_deadline(|| true, deadline), eq(true));
    }
}
