//! Per-shard queue of pending transactions ordered by txid.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use shoal_common::ids::TxId;

use crate::transaction::Transaction;

/// Stable handle of a queued transaction; doubles as its ordering score.
pub type QueuePos = TxId;

/// Sentinel handle meaning "not queued".
pub const POS_END: QueuePos = QueuePos::MAX;

/// Ordered queue of transactions pending on one shard.
///
/// Entries are weak: the queue orders transactions but never keeps them alive. Only the owning
/// shard's worker thread touches the queue.
#[derive(Debug, Default)]
pub struct TxQueue {
    entries: BTreeMap<TxId, Weak<Transaction>>,
}

impl TxQueue {
    /// Inserts `tx` at the position keyed by `score` and returns its stable handle.
    pub fn insert(&mut self, score: TxId, tx: &Arc<Transaction>) -> QueuePos {
        assert!(score != POS_END, "txid collides with the queue sentinel");
        let prior = self.entries.insert(score, Arc::downgrade(tx));
        assert!(prior.is_none(), "txid {score} is already queued");
        score
    }

    /// Removes the entry behind `pos`; absent handles are ignored.
    pub fn remove(&mut self, pos: QueuePos) {
        let _ = self.entries.remove(&pos);
    }

    /// Returns the smallest-txid live entry, dropping dead ones on the way.
    pub fn front(&mut self) -> Option<(TxId, Arc<Transaction>)> {
        while let Some((&score, weak)) = self.entries.first_key_value() {
            if let Some(tx) = weak.upgrade() {
                return Some((score, tx));
            }
            let _ = self.entries.remove(&score);
        }
        None
    }

    /// Removes and returns the front entry.
    pub fn pop_front(&mut self) -> Option<(TxId, Arc<Transaction>)> {
        let (score, tx) = self.front()?;
        let _ = self.entries.remove(&score);
        Some((score, tx))
    }

    /// Returns the live entry behind `pos`, if any.
    #[must_use]
    pub fn at(&self, pos: QueuePos) -> Option<Arc<Transaction>> {
        self.entries.get(&pos).and_then(Weak::upgrade)
    }

    /// Largest queued txid; `None` on an empty queue.
    #[must_use]
    pub fn tail_score(&self) -> Option<TxId> {
        self.entries.last_key_value().map(|(&score, _)| score)
    }

    /// Returns whether no entries are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of queued entries, dead or alive.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
