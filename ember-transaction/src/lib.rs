//! Cross-shard transaction coordinator.
//!
//! A [`Transaction`] drives one user-visible operation through one or more
//! hops across the shard workers that own its keys. Scheduling establishes a
//! global serialization order consistent with every touched shard's queue;
//! execution dispatches the caller's callback per shard behind a completion
//! barrier; blocking transactions park on watched keys until a writer wakes
//! them or their deadline passes.

mod blocking;
mod execution;
mod find_first;
mod multi;
mod scheduling;
mod transaction;


use std::sync::Arc;

use ember_common::config::CoordinatorConfig;
use ember_core::command::CommandSpec;
use ember_core::sharding::HashTagShardResolver;
use ember_shard::ShardSet;

pub use find_first::FindFirstResult;
pub use transaction::{RunnableCallback, Transaction};

/// Transaction subsystem bootstrap module.
#[derive(Debug)]
pub struct TransactionModule {
    /// Shard worker pool shared by every transaction this module creates.
    pub shard_set: Arc<ShardSet>,
}

impl TransactionModule {
    /// Spawns the shard workers and wires the coordinator around them.
    #[must_use]
    pub fn new(config: &CoordinatorConfig) -> Self {
        let resolver = Arc::new(HashTagShardResolver::new(config.shard_count));
        Self {
            shard_set: Arc::new(ShardSet::new(config, resolver)),
        }
    }

    /// Creates a transaction for one command descriptor.
    #[must_use]
    pub fn transaction(&self, cid: &'static CommandSpec) -> Arc<Transaction> {
        Transaction::new(cid, Arc::clone(&self.shard_set))
    }
}
