//! Key-to-shard routing.

use ember_common::ids::{ShardCount, ShardId};

/// Resolves key ownership to a shard id.
pub trait ShardResolver: Send + Sync {
    /// Returns the owner shard for the given key bytes.
    fn shard_for_key(&self, key: &[u8]) -> ShardId;

    /// Number of shards in the routing domain.
    fn shard_count(&self) -> ShardCount;
}

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

/// The part of a key that participates in routing.
///
/// When the key contains a `{tag}` section with a non-empty tag, only the
/// tag bytes route; `user:{42}:cart` and `user:{42}:orders` land on the same
/// shard, which is how callers keep multi-key operations single-shard. Keys
/// without a tag (or with an empty `{}`) route by their full bytes.
fn routable_span(key: &[u8]) -> &[u8] {
    let Some(open) = key.iter().position(|byte| *byte == b'{') else {
        return key;
    };
    let tag_start = open + 1;
    let Some(tag_len) = key[tag_start..].iter().position(|byte| *byte == b'}') else {
        return key;
    };
    if tag_len == 0 {
        return key;
    }
    &key[tag_start..tag_start + tag_len]
}

/// Hash-tag aware routing over FNV-1a.
///
/// Routing must be stable for the lifetime of the process: the transaction
/// coordinator partitions argument lists by this mapping and the per-shard
/// lock tables are keyed by it.
#[derive(Debug, Clone)]
pub struct HashTagShardResolver {
    shard_count: ShardCount,
}

impl HashTagShardResolver {
    /// Builds a resolver for a specific shard count.
    #[must_use]
    pub fn new(shard_count: ShardCount) -> Self {
        Self { shard_count }
    }
}

impl ShardResolver for HashTagShardResolver {
    fn shard_for_key(&self, key: &[u8]) -> ShardId {
        let slot = fnv1a(routable_span(key)) % u64::from(self.shard_count.get());
        ShardId::try_from(slot).expect("remainder of a u16 modulus fits the shard id")
    }

    fn shard_count(&self) -> ShardCount {
        self.shard_count
    }
}
