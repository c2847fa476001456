//! Command metadata and key routing for the ember coordinator.

pub mod command;
pub mod sharding;

pub use command::{CommandArity, CommandFrame, CommandSpec, KeyIndex, KeySpan, opt};
pub use sharding::{HashTagShardResolver, ShardResolver};
