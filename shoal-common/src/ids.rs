//! Identifier types threaded through the coordinator and storage crates.

/// Index of one execution shard. Doubles as the index into a transaction's per-shard slots
/// whenever the slot layout spans the whole shard set.
pub type ShardId = u16;

/// Logical database index within a shard's slice.
pub type DbIndex = u16;

/// Scheduling order token drawn from the process-wide sequence. A transaction carries 0 until
/// its first successful scheduling round; once nonzero the value never changes.
pub type TxId = u64;

/// Validated size of the shard set.
///
/// The count is fixed at startup and threaded by value: slot layouts, broadcast fan-outs and
/// key routing all derive from it, so it must never be zero and must never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShardCount(u16);

impl ShardCount {
    /// Validates a raw count; at least one shard must own the keyspace.
    #[must_use]
    pub fn new(value: u16) -> Option<Self> {
        if value == 0 { None } else { Some(Self(value)) }
    }

    /// Raw count, for modulo routing and run-count arithmetic.
    #[must_use]
    pub const fn get(self) -> u16 {
        self.0
    }

    /// Number of per-shard slots a full-width transaction allocates.
    #[must_use]
    pub const fn slots(self) -> usize {
        self.0 as usize
    }

    /// Every shard id owned by a set of this size, in order.
    pub fn ids(self) -> impl Iterator<Item = ShardId> {
        0..self.0
    }
}

#[cfg(test)]
mod tests {
    use super::ShardCount;
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn a_shard_set_is_never_empty() {
        assert_that!(ShardCount::new(0), eq(None));
        let count = ShardCount::new(1).expect("one shard is the minimum");
        assert_that!(count.get(), eq(1_u16));
    }

    #[rstest]
    #[case(1)]
    #[case(4)]
    #[case(257)]
    fn ids_cover_the_slot_layout(#[case] raw: u16) {
        let count = ShardCount::new(raw).expect("literal is valid");
        let ids = count.ids().collect::<Vec<_>>();
        assert_that!(ids.len(), eq(count.slots()));
        assert_that!(ids.first().copied(), eq(Some(0_u16)));
        assert_that!(ids.last().copied(), eq(Some(raw - 1)));
    }
}
