//! Cross-shard "first present key" lookup used by blocking list commands.

use std::sync::{Arc, Mutex};

use shoal_common::ids::{ShardId, TxId};
use shoal_core::status::{OpResult, OpStatus};

use crate::engine_shard::EngineShard;
use crate::transaction::{NOTIFY_NONE, ShardCallback, Transaction};

/// Winning shard and key of a [`Transaction::find_first`] lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindFirstResult {
    /// Shard owning the found key.
    pub sid: ShardId,
    /// The found key.
    pub key: Vec<u8>,
}

/// Fan-out/fan-in aggregator: every shard reports its first hit, the fan-in picks the key with
/// the smallest index in the caller's original argument list.
pub(crate) struct FindFirstProcessor {
    /// Per-shard find results: the hit's index within the shard's argument slice and the key.
    results: Mutex<Vec<OpResult<(usize, Vec<u8>)>>>,
    notify_txid: TxId,
}

impl FindFirstProcessor {
    pub(crate) fn new(notify_txid: TxId, slots: usize) -> Arc<Self> {
        Arc::new(Self {
            results: Mutex::new(vec![Err(OpStatus::KeyNotFound); slots]),
            notify_txid,
        })
    }

    /// Runs the single-hop fan-out.
    pub(crate) fn find(self: &Arc<Self>, tx: &Arc<Transaction>) {
        let processor = Arc::clone(self);
        let callback: ShardCallback =
            Arc::new(move |tx, shard| processor.run_in_shard(tx, shard));
        tx.execute(callback, false);
    }

    fn run_in_shard(&self, tx: &Arc<Transaction>, shard: &mut EngineShard) -> OpStatus {
        // After a wake-up only the notifying shard is known to sit at the waking state; the
        // others report nothing rather than a stale or future view.
        if self.notify_txid == NOTIFY_NONE || shard.committed_txid() == self.notify_txid {
            let sid = shard.shard_id();
            let keys = tx.shard_args_in_shard(sid).to_vec();
            let found = shard.db_slice().find_first(tx.db_index(), &keys);
            self.results.lock().expect("find results lock poisoned")[usize::from(sid)] = found;
        }
        OpStatus::Ok
    }

    /// Fan-in: smallest original argument index wins; any wrong-type hit fails the lookup.
    pub(crate) fn process(&self, tx: &Arc<Transaction>) -> OpResult<FindFirstResult> {
        let results = self.results.lock().expect("find results lock poisoned");
        let mut best: Option<(usize, FindFirstResult)> = None;

        for (sid, entry) in results.iter().enumerate() {
            let sid = ShardId::try_from(sid).expect("shard id fits u16");
            match entry {
                Err(OpStatus::KeyNotFound) => {}
                Err(status) => return Err(*status),
                Ok((arg_index, key)) => {
                    let original = tx.reverse_arg_index(sid, *arg_index);
                    if best.as_ref().is_none_or(|(current, _)| original < *current) {
                        best = Some((
                            original,
                            FindFirstResult {
                                sid,
                                key: key.clone(),
                            },
                        ));
                    }
                }
            }
        }

        best.map(|(_, result)| result).ok_or(OpStatus::KeyNotFound)
    }
}
