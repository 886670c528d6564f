//! Shard-local storage: the keyspace slice each shard owns and its intent-lock manager.

pub mod db_slice;
pub mod intent_lock;

pub use db_slice::{DbSlice, KeyLockArgs, Value};
pub use intent_lock::{IntentLock, IntentMode};
