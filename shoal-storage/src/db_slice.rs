//! The keyspace slice owned by one shard: values plus the per-key lock table.
//!
//! Only the owning shard's worker thread touches a slice; no internal synchronization exists or
//! is needed. The value model is deliberately small (strings and lists), just enough to observe
//! the coordinator's ordering and wake-up contracts end to end.

use std::collections::VecDeque;

use hashbrown::HashMap;
use shoal_common::ids::{DbIndex, ShardId};
use shoal_core::status::{OpResult, OpStatus};
use tracing::trace;

use crate::intent_lock::{IntentLock, IntentMode};

/// Lock request covering one shard's slice of a transaction's arguments.
///
/// `args` may interleave keys with values (`key_step == 2`); lock operations visit only the
/// keys, i.e. every `key_step`-th entry.
#[derive(Debug, Clone)]
pub struct KeyLockArgs {
    /// Target database.
    pub db: DbIndex,
    /// Distance between consecutive keys inside `args`.
    pub key_step: usize,
    /// The shard-local argument slice.
    pub args: Vec<Vec<u8>>,
}

impl KeyLockArgs {
    /// Iterates the key arguments, skipping interleaved values.
    pub fn keys(&self) -> impl Iterator<Item = &[u8]> {
        self.args
            .iter()
            .step_by(self.key_step.max(1))
            .map(Vec::as_slice)
    }
}

/// A stored value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Plain string payload.
    Str(Vec<u8>),
    /// List payload, pushed at the tail and popped at the head.
    List(VecDeque<Vec<u8>>),
}

#[derive(Debug, Default)]
struct DbTable {
    values: HashMap<Vec<u8>, Value>,
    locks: HashMap<Vec<u8>, IntentLock>,
}

/// Keyspace slice owned by a shard.
#[derive(Debug)]
pub struct DbSlice {
    shard_id: ShardId,
    tables: HashMap<DbIndex, DbTable>,
}

impl DbSlice {
    /// Creates the slice for `shard_id`.
    #[must_use]
    pub fn new(shard_id: ShardId) -> Self {
        Self {
            shard_id,
            tables: HashMap::new(),
        }
    }

    /// Owner shard id.
    #[must_use]
    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    fn table(&mut self, db: DbIndex) -> &mut DbTable {
        self.tables.entry(db).or_default()
    }

    /// Returns whether every key in `largs` could be acquired uncontended in `mode`.
    #[must_use]
    pub fn check(&self, mode: IntentMode, largs: &KeyLockArgs) -> bool {
        let Some(table) = self.tables.get(&largs.db) else {
            return true;
        };
        largs
            .keys()
            .all(|key| table.locks.get(key).is_none_or(|lock| lock.check(mode)))
    }

    /// Acquires every key in `largs` in `mode`.
    ///
    /// Returns whether the whole acquisition was uncontended. Contended keys are still recorded;
    /// the caller is expected to serialize through the shard's transaction queue.
    pub fn acquire(&mut self, mode: IntentMode, largs: &KeyLockArgs) -> bool {
        let table = self.table(largs.db);
        let mut uncontended = true;
        for key in largs.keys() {
            let lock = table.locks.entry_ref(key).or_default();
            uncontended &= lock.acquire(mode);
        }
        trace!(
            shard = self.shard_id,
            uncontended,
            keys = largs.args.len(),
            "acquired intent locks"
        );
        uncontended
    }

    /// Releases one holder of every key in `largs`.
    pub fn release(&mut self, mode: IntentMode, largs: &KeyLockArgs) {
        let table = self.table(largs.db);
        for key in largs.keys() {
            let Some(lock) = table.locks.get_mut(key) else {
                panic!("releasing a key that holds no lock");
            };
            lock.release(mode);
            if lock.is_free() {
                let _ = table.locks.remove(key);
            }
        }
    }

    /// Releases `count` holders of a single key, used when unwinding a batch's recorded locks.
    pub fn release_counted(&mut self, db: DbIndex, key: &[u8], mode: IntentMode, count: u32) {
        if count == 0 {
            return;
        }
        let table = self.table(db);
        let Some(lock) = table.locks.get_mut(key) else {
            panic!("releasing a key that holds no lock");
        };
        lock.release_count(mode, count);
        if lock.is_free() {
            let _ = table.locks.remove(key);
        }
    }

    /// Current lock holders for a key as `(shared, exclusive)`; `(0, 0)` when unlocked.
    #[must_use]
    pub fn lock_holders(&self, db: DbIndex, key: &[u8]) -> (u32, u32) {
        self.tables
            .get(&db)
            .and_then(|table| table.locks.get(key))
            .map_or((0, 0), IntentLock::holders)
    }

    /// Returns the first present key among `keys` as `(index, key)`.
    ///
    /// A present key with a non-list value short-circuits to `WrongType`; no present key yields
    /// `KeyNotFound`.
    pub fn find_first(&self, db: DbIndex, keys: &[Vec<u8>]) -> OpResult<(usize, Vec<u8>)> {
        let Some(table) = self.tables.get(&db) else {
            return Err(OpStatus::KeyNotFound);
        };
        for (index, key) in keys.iter().enumerate() {
            match table.values.get(key) {
                Some(Value::List(items)) if !items.is_empty() => {
                    return Ok((index, key.clone()));
                }
                Some(Value::List(_)) | None => {}
                Some(Value::Str(_)) => return Err(OpStatus::WrongType),
            }
        }
        Err(OpStatus::KeyNotFound)
    }

    /// Stores a string value.
    pub fn set(&mut self, db: DbIndex, key: &[u8], value: Vec<u8>) {
        let _ = self.table(db).values.insert(key.to_vec(), Value::Str(value));
    }

    /// Reads a string value.
    pub fn get(&self, db: DbIndex, key: &[u8]) -> OpResult<Vec<u8>> {
        match self.tables.get(&db).and_then(|table| table.values.get(key)) {
            Some(Value::Str(value)) => Ok(value.clone()),
            Some(Value::List(_)) => Err(OpStatus::WrongType),
            None => Err(OpStatus::KeyNotFound),
        }
    }

    /// Appends to a list value, creating it when absent. Returns the new length.
    pub fn rpush(&mut self, db: DbIndex, key: &[u8], values: Vec<Vec<u8>>) -> OpResult<usize> {
        let entry = self
            .table(db)
            .values
            .entry_ref(key)
            .or_insert_with(|| Value::List(VecDeque::new()));
        let Value::List(items) = entry else {
            return Err(OpStatus::WrongType);
        };
        items.extend(values);
        Ok(items.len())
    }

    /// Pops the head of a list value; removes the key when the list drains.
    pub fn lpop(&mut self, db: DbIndex, key: &[u8]) -> OpResult<Vec<u8>> {
        let table = self.table(db);
        let Some(value) = table.values.get_mut(key) else {
            return Err(OpStatus::KeyNotFound);
        };
        let Value::List(items) = value else {
            return Err(OpStatus::WrongType);
        };
        let Some(head) = items.pop_front() else {
            return Err(OpStatus::KeyNotFound);
        };
        if items.is_empty() {
            let _ = table.values.remove(key);
        }
        Ok(head)
    }
}

#[cfg(test)]
mod tests {
    use super::{DbSlice, KeyLockArgs};
    use crate::intent_lock::IntentMode;
    use googletest::prelude::*;
    use rstest::rstest;
    use shoal_core::status::OpStatus;

    fn lock_args(keys: &[&str], step: usize) -> KeyLockArgs {
        KeyLockArgs {
            db: 0,
            key_step: step,
            args: keys.iter().map(|key| key.as_bytes().to_vec()).collect(),
        }
    }

    #[rstest]
    fn acquire_reports_contention_and_release_frees() {
        let mut slice = DbSlice::new(0);
        let args = lock_args(&["a", "b"], 1);

        assert_that!(slice.acquire(IntentMode::Exclusive, &args), eq(true));
        assert_that!(slice.check(IntentMode::Shared, &args), eq(false));
        assert_that!(slice.acquire(IntentMode::Shared, &args), eq(false));

        slice.release(IntentMode::Shared, &args);
        slice.release(IntentMode::Exclusive, &args);
        assert_that!(slice.lock_holders(0, b"a"), eq((0, 0)));
        assert_that!(slice.lock_holders(0, b"b"), eq((0, 0)));
    }

    #[rstest]
    fn step_two_lock_args_skip_values() {
        let mut slice = DbSlice::new(0);
        let args = lock_args(&["k1", "v1", "k2", "v2"], 2);

        assert_that!(slice.acquire(IntentMode::Exclusive, &args), eq(true));
        assert_that!(slice.lock_holders(0, b"k1"), eq((0, 1)));
        assert_that!(slice.lock_holders(0, b"v1"), eq((0, 0)));
        assert_that!(slice.lock_holders(0, b"k2"), eq((0, 1)));
    }

    #[rstest]
    fn counted_release_unwinds_recorded_holders() {
        let mut slice = DbSlice::new(0);
        let args = lock_args(&["k"], 1);
        let _ = slice.acquire(IntentMode::Exclusive, &args);
        let _ = slice.acquire(IntentMode::Exclusive, &args);

        slice.release_counted(0, b"k", IntentMode::Exclusive, 2);
        assert_that!(slice.lock_holders(0, b"k"), eq((0, 0)));
    }

    #[rstest]
    fn find_first_prefers_earliest_argument() {
        let mut slice = DbSlice::new(0);
        let _ = slice.rpush(0, b"second", vec![b"x".to_vec()]);

        let keys = vec![b"first".to_vec(), b"second".to_vec()];
        let (index, key) = slice.find_first(0, &keys).expect("a key is present");
        assert_that!(index, eq(1_usize));
        assert_that!(key, eq(&b"second".to_vec()));
    }

    #[rstest]
    fn find_first_short_circuits_on_wrong_type() {
        let mut slice = DbSlice::new(0);
        slice.set(0, b"k", b"v".to_vec());

        let keys = vec![b"k".to_vec(), b"other".to_vec()];
        assert_that!(slice.find_first(0, &keys), eq(&Err(OpStatus::WrongType)));
    }

    #[rstest]
    fn list_ops_round_trip_and_drain() {
        let mut slice = DbSlice::new(0);
        let pushed = slice
            .rpush(0, b"l", vec![b"1".to_vec(), b"2".to_vec()])
            .expect("push into a fresh key");
        assert_that!(pushed, eq(2_usize));

        assert_that!(slice.lpop(0, b"l"), eq(&Ok(b"1".to_vec())));
        assert_that!(slice.lpop(0, b"l"), eq(&Ok(b"2".to_vec())));
        assert_that!(slice.lpop(0, b"l"), eq(&Err(OpStatus::KeyNotFound)));
    }
}
