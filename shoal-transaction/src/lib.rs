//! Transaction coordination for a sharded in-memory key-value store.
//!
//! Each shard owns its data partition and processes work serially on one dedicated thread. A
//! [`Transaction`] routes a command's key arguments to their owner shards, schedules itself into
//! the per-shard transaction queues so concurrent multi-shard commands observe one global order,
//! and drives the per-hop callbacks that actually touch the data. Blocking commands can suspend
//! on their keys and be awoken by concurrent mutators; multi-statement batches acquire their
//! locks up front or incrementally and release them in one sweep at the end.

pub mod engine_shard;
pub mod find_first;
pub mod shard_set;
pub mod transaction;
pub mod tx_queue;

pub use engine_shard::EngineShard;
pub use find_first::FindFirstResult;
pub use shard_set::ShardSet;
pub use transaction::{ShardArgs, ShardCallback, Transaction};
pub use tx_queue::TxQueue;

#[cfg(test)]
mod coordinator_tests;
