//! Shard worker pool.
//!
//! One OS thread per shard, each owning its [`EngineShard`] outright. The
//! coordinator submits closures over a per-shard channel; submission order
//! is execution order, which is what makes a dispatched task double as a
//! barrier against earlier writes to shared transaction state.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::thread::{self, JoinHandle};

use tracing::debug;

use ember_common::config::CoordinatorConfig;
use ember_common::error::{EmberError, EmberResult};
use ember_common::ids::{ShardCount, ShardId};
use ember_common::sync::EventCount;
use ember_core::sharding::ShardResolver;

use crate::engine_shard::EngineShard;

/// Unit of work executed on a shard's owner thread.
pub type ShardTask = Box<dyn FnOnce(&mut EngineShard) + Send + 'static>;

enum ShardCommand {
    Task(ShardTask),
    Shutdown,
}

struct ShardWorker {
    sender: mpsc::Sender<ShardCommand>,
    worker: Option<JoinHandle<()>>,
}

/// Fixed set of shard workers for one process.
///
/// The set also owns the key router: key-to-shard placement and the worker
/// pool describe the same routing domain and must agree on its size.
pub struct ShardSet {
    workers: Vec<ShardWorker>,
    shard_count: ShardCount,
    config: CoordinatorConfig,
    resolver: Arc<dyn ShardResolver>,
}

impl ShardSet {
    /// Spawns one worker thread per configured shard.
    #[must_use]
    pub fn new(config: &CoordinatorConfig, resolver: Arc<dyn ShardResolver>) -> Self {
        debug_assert!(resolver.shard_count() == config.shard_count);
        let shard_count = config.shard_count;
        let mut workers = Vec::with_capacity(usize::from(shard_count.get()));
        for sid in shard_count.shard_ids() {
            let (sender, receiver) = mpsc::channel::<ShardCommand>();
            let worker = thread::Builder::new()
                .name(format!("ember-shard-{sid}"))
                .spawn(move || shard_worker_main(sid, &receiver))
                .ok();
            workers.push(ShardWorker { sender, worker });
        }
        Self {
            workers,
            shard_count,
            config: config.clone(),
            resolver,
        }
    }

    /// Number of shards in the set.
    #[must_use]
    pub fn size(&self) -> u16 {
        self.shard_count.get()
    }

    /// Iterates every shard id of this set, in worker order.
    pub fn shard_ids(&self) -> impl Iterator<Item = ShardId> {
        self.shard_count.shard_ids()
    }

    /// Configuration this set was spawned with.
    #[must_use]
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Key router of this routing domain.
    #[must_use]
    pub fn resolver(&self) -> &Arc<dyn ShardResolver> {
        &self.resolver
    }

    /// Submits one task to `sid`'s worker queue.
    ///
    /// # Errors
    ///
    /// Returns an error when `sid` is out of range or the worker thread is
    /// gone.
    pub fn add(&self, sid: ShardId, task: ShardTask) -> EmberResult<()> {
        let worker = self
            .workers
            .get(usize::from(sid))
            .ok_or(EmberError::InvalidState("shard id is out of range"))?;
        worker
            .sender
            .send(ShardCommand::Task(task))
            .map_err(|_| EmberError::ShardUnavailable(sid))
    }

    /// Runs `task` on every shard selected by `is_active` (all shards when
    /// `None`) and blocks until each selected worker finished it.
    ///
    /// Tasks must not block: the workers run them inline and anything that
    /// waits on another shard would deadlock the set.
    ///
    /// # Errors
    ///
    /// Returns an error when a selected worker can not accept the task; in
    /// that case tasks already submitted still complete before this call
    /// returns.
    pub fn run_brief_in_parallel<F>(
        &self,
        task: F,
        is_active: Option<&dyn Fn(ShardId) -> bool>,
    ) -> EmberResult<()>
    where
        F: Fn(&mut EngineShard) + Send + Sync + 'static,
    {
        let task = Arc::new(task);
        let pending = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(EventCount::new());
        let mut submit_error = None;

        for sid in self.shard_count.shard_ids() {
            if let Some(predicate) = is_active
                && !predicate(sid)
            {
                continue;
            }
            let _ = pending.fetch_add(1, Ordering::AcqRel);
            let task = Arc::clone(&task);
            let pending_for_task = Arc::clone(&pending);
            let done_for_task = Arc::clone(&done);
            let outcome = self.add(
                sid,
                Box::new(move |shard| {
                    task(shard);
                    if pending_for_task.fetch_sub(1, Ordering::AcqRel) == 1 {
                        done_for_task.notify();
                    }
                }),
            );
            if let Err(error) = outcome {
                let _ = pending.fetch_sub(1, Ordering::AcqRel);
                submit_error = Some(error);
            }
        }

        done.wait_until(|| pending.load(Ordering::Acquire) == 0);
        match submit_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl Drop for ShardSet {
    fn drop(&mut self) {
        for worker in &self.workers {
            let _ = worker.sender.send(ShardCommand::Shutdown);
        }
        for worker in &mut self.workers {
            if let Some(handle) = worker.worker.take() {
                let _ = handle.join();
            }
        }
    }
}

impl std::fmt::Debug for ShardSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardSet")
            .field("shard_count", &self.shard_count)
            .finish_non_exhaustive()
    }
}

fn shard_worker_main(sid: ShardId, receiver: &mpsc::Receiver<ShardCommand>) {
    let mut shard = EngineShard::new(sid);
    debug!(shard = sid, "shard worker started");
    while let Ok(command) = receiver.recv() {
        match command {
            ShardCommand::Task(task) => task(&mut shard),
            ShardCommand::Shutdown => break,
        }
    }
    debug!(shard = sid, "shard worker stopped");
}

#[cfg(test)]
mod tests {
    use super::ShardSet;
    use ember_common::config::CoordinatorConfig;
    use ember_common::ids::ShardCount;
    use ember_core::sharding::HashTagShardResolver;
    use googletest::prelude::*;
    use rstest::rstest;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::mpsc;

    fn shard_set(count: u16) -> ShardSet {
        let shard_count = ShardCount::try_from(count).expect("literal is valid");
        let config = CoordinatorConfig {
            shard_count,
            ..CoordinatorConfig::default()
        };
        ShardSet::new(&config, Arc::new(HashTagShardResolver::new(shard_count)))
    }

    #[rstest]
    fn add_runs_task_on_owning_worker() {
        let set = shard_set(2);
        let (sender, receiver) = mpsc::channel();
        set.add(
            1,
            Box::new(move |shard| {
                let _ = sender.send(shard.shard_id());
            }),
        )
        .expect("shard worker is alive");

        assert_that!(receiver.recv().expect("task must run"), eq(1_u16));
    }

    #[rstest]
    fn add_rejects_out_of_range_shard() {
        let set = shard_set(2);
        let result = set.add(7, Box::new(|_| {}));
        assert_that!(result.is_err(), eq(true));
    }

    #[rstest]
    fn run_brief_in_parallel_visits_every_shard_before_returning() {
        let set = shard_set(4);
        let visited = Arc::new(AtomicU32::new(0));
        let visited_for_task = Arc::clone(&visited);

        set.run_brief_in_parallel(
            move |shard| {
                let _ = visited_for_task.fetch_or(1 << shard.shard_id(), Ordering::AcqRel);
            },
            None,
        )
        .expect("all workers are alive");

        assert_that!(visited.load(Ordering::Acquire), eq(0b1111_u32));
    }

    #[rstest]
    fn run_brief_in_parallel_honors_predicate() {
        let set = shard_set(4);
        let visited = Arc::new(AtomicU32::new(0));
        let visited_for_task = Arc::clone(&visited);

        set.run_brief_in_parallel(
            move |shard| {
                let _ = visited_for_task.fetch_or(1 << shard.shard_id(), Ordering::AcqRel);
            },
            Some(&|sid| sid.is_multiple_of(2)),
        )
        .expect("all workers are alive");

        assert_that!(visited.load(Ordering::Acquire), eq(0b0101_u32));
    }
}
