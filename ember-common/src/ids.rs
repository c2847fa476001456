//! Canonical identifier types used across the coordinator and shard engine.

use std::num::NonZeroU16;

use crate::error::EmberError;

/// Numeric shard identifier inside a single process.
pub type ShardId = u16;

/// Logical database index.
pub type DbIndex = u16;

/// Monotonic transaction identifier allocated by coordinators.
///
/// Zero means "not scheduled yet"; every scheduled transaction carries a
/// process-unique positive value.
pub type TxId = u64;

/// Sentinel for "no transaction has notified us yet".
pub const INVALID_TXID: TxId = TxId::MAX;

/// Size of the shard routing domain.
///
/// Backed by `NonZeroU16`, so a zero-shard runtime is unrepresentable
/// instead of merely rejected at call sites. Construction goes through
/// `TryFrom<u16>` and surfaces the shared error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShardCount(NonZeroU16);

impl ShardCount {
    /// Returns the inner count.
    #[must_use]
    pub const fn get(self) -> u16 {
        self.0.get()
    }

    /// Iterates every shard id of the routing domain, in worker order.
    pub fn shard_ids(self) -> impl Iterator<Item = ShardId> {
        0..self.get()
    }

    /// Whether `sid` names a shard inside the routing domain.
    #[must_use]
    pub fn contains(self, sid: ShardId) -> bool {
        sid < self.get()
    }
}

impl TryFrom<u16> for ShardCount {
    type Error = EmberError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        NonZeroU16::new(value)
            .map(Self)
            .ok_or(EmberError::InvalidConfig("shard count must be non-zero"))
    }
}

#[cfg(test)]
mod tests {
    use super::{ShardCount, ShardId};
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn zero_shard_domain_is_unrepresentable() {
        assert_that!(ShardCount::try_from(0).is_err(), eq(true));
    }

    #[rstest]
    #[case(1)]
    #[case(6)]
    #[case(u16::MAX)]
    fn count_round_trips_through_try_from(#[case] input: u16) {
        let count = ShardCount::try_from(input).expect("positive count must be valid");
        assert_that!(count.get(), eq(input));
    }

    #[rstest]
    fn shard_ids_enumerate_the_whole_domain() {
        let count = ShardCount::try_from(3).expect("literal is valid");
        let ids = count.shard_ids().collect::<Vec<ShardId>>();
        assert_that!(ids, eq(&vec![0_u16, 1, 2]));
    }

    #[rstest]
    fn contains_matches_the_domain_boundary() {
        let count = ShardCount::try_from(4).expect("literal is valid");
        assert_that!(count.contains(3), eq(true));
        assert_that!(count.contains(4), eq(false));
    }
}
