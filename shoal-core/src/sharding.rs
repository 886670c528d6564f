//! Key-to-shard routing.

use shoal_common::ids::{ShardCount, ShardId};

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Returns the owner shard for the given key bytes.
///
/// The argument layout a coordinator computes and the lock table each shard owns both key off
/// this mapping, so it must not change for the lifetime of the process. FNV-1a is spelled out
/// here instead of going through the standard hasher: the mapping stays independent of std
/// internals, and the coordinator mostly routes short keys, where FNV is cheap.
#[must_use]
pub fn key_shard(key: &[u8], shard_count: ShardCount) -> ShardId {
    let mut hash = FNV_OFFSET;
    for byte in key {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    let shard = hash % u64::from(shard_count.get());
    ShardId::try_from(shard).expect("remainder of a u16 divisor fits u16")
}
