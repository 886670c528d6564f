//! One execution shard: its queue, lock state, watch registry and the polling loop that
//! dispatches transaction hops in order.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use hashbrown::HashMap;
use shoal_common::ids::{DbIndex, ShardId, TxId};
use shoal_storage::db_slice::{DbSlice, KeyLockArgs};
use shoal_storage::intent_lock::IntentLock;
use tracing::{debug, trace};

use crate::transaction::{Transaction, mask};
use crate::tx_queue::TxQueue;

/// Per-key queue of transactions suspended on that key.
#[derive(Debug, Default)]
struct WatchQueue {
    items: VecDeque<Weak<Transaction>>,
    /// Set while the front entry has been notified and its post-wake hops are in flight.
    active: bool,
}

/// Counters exposed for observability and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShardStats {
    /// Single-shard transactions that ran inline without a txid or queue entry.
    pub quick_runs: u64,
}

/// A single-threaded execution shard.
///
/// All methods run on the owning worker thread; the struct carries no internal synchronization.
pub struct EngineShard {
    shard_id: ShardId,
    committed_txid: TxId,
    txq: TxQueue,
    db_slice: DbSlice,
    shard_lock: IntentLock,
    /// A transaction mid-way through a multi-hop run; the queue stays halted behind it.
    continuation: Option<Arc<Transaction>>,
    watches: HashMap<(DbIndex, Vec<u8>), WatchQueue>,
    /// Keys mutated since the last wake-up sweep.
    awakened_keys: Vec<(DbIndex, Vec<u8>)>,
    /// Woken transactions whose final hop has not finished yet; they halt the queue.
    awakened: Vec<Arc<Transaction>>,
    /// Transactions enrolled until `committed_txid` reaches their target.
    converge_waiters: Vec<(TxId, Arc<Transaction>)>,
    stats: ShardStats,
}

impl EngineShard {
    /// Creates the shard-local state for `shard_id`.
    #[must_use]
    pub fn new(shard_id: ShardId) -> Self {
        Self {
            shard_id,
            committed_txid: 0,
            txq: TxQueue::default(),
            db_slice: DbSlice::new(shard_id),
            shard_lock: IntentLock::default(),
            continuation: None,
            watches: HashMap::new(),
            awakened_keys: Vec::new(),
            awakened: Vec::new(),
            converge_waiters: Vec::new(),
            stats: ShardStats::default(),
        }
    }

    /// Owner shard id.
    #[must_use]
    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    /// Largest txid this shard has started running in queue order.
    #[must_use]
    pub fn committed_txid(&self) -> TxId {
        self.committed_txid
    }

    /// The keyspace slice this shard owns.
    #[must_use]
    pub fn db_slice(&self) -> &DbSlice {
        &self.db_slice
    }

    /// Mutable access to the keyspace slice.
    pub fn db_slice_mut(&mut self) -> &mut DbSlice {
        &mut self.db_slice
    }

    /// The coarse lock global transactions take on every shard.
    #[must_use]
    pub fn shard_lock(&self) -> &IntentLock {
        &self.shard_lock
    }

    /// Mutable access to the coarse shard lock.
    pub fn shard_lock_mut(&mut self) -> &mut IntentLock {
        &mut self.shard_lock
    }

    /// The pending-transaction queue.
    #[must_use]
    pub fn txq(&self) -> &TxQueue {
        &self.txq
    }

    /// Mutable access to the pending-transaction queue.
    pub fn txq_mut(&mut self) -> &mut TxQueue {
        &mut self.txq
    }

    /// Counters snapshot.
    #[must_use]
    pub fn stats(&self) -> ShardStats {
        self.stats
    }

    /// Records one quickie run.
    pub fn inc_quick_run(&mut self) {
        self.stats.quick_runs += 1;
    }

    /// Dispatches whatever work became runnable on this shard.
    ///
    /// `trans`, when present, is the transaction whose hop callback triggered this poll; it may
    /// run directly, through the queue, or not at all this round.
    pub fn poll_execution(&mut self, context: &str, trans: Option<&Arc<Transaction>>) {
        let sid = self.shard_id;
        trace!(shard = sid, context, "poll execution");

        // A transaction with no queue entry here either was awakened (and still owns its key
        // locks) or runs a post-wake/cleanup hop; the queue cannot order it, so it runs first.
        if let Some(tx) = trans {
            let lmask = tx.local_mask(sid);
            let is_continuation = self
                .continuation
                .as_ref()
                .is_some_and(|cont| Arc::ptr_eq(cont, tx));
            if (lmask & mask::ARMED) != 0 && !tx.is_queued_in(sid) && !is_continuation {
                let tx = Arc::clone(tx);
                let keep = tx.run_in_shard(self);
                if keep {
                    assert!(
                        self.continuation.is_none(),
                        "a direct run cannot preempt an unfinished continuation"
                    );
                    self.continuation = Some(tx);
                }
            }
        }

        // A continuation is a transaction past its first hop; it never re-enters the queue and
        // the queue stays halted until it concludes.
        if let Some(cont) = self.continuation.clone() {
            if cont.is_armed_in_shard(sid) {
                let keep = cont.run_in_shard(self);
                if !keep {
                    self.continuation = None;
                }
            }
            if self.continuation.is_some() {
                return;
            }
        }

        // Drain armed queue heads in txid order. The drain halts while a woken transaction is
        // mid-flight so its retrieval hops observe exactly the state that woke it.
        loop {
            if !self.awakened.is_empty() {
                break;
            }
            let Some((txid, head)) = self.txq.front() else {
                break;
            };
            if !head.is_armed_in_shard(sid) {
                break;
            }

            // Advance before running: scheduling attempts on other threads consult
            // committed_txid while the head's callback may still be executing.
            if self.committed_txid < txid {
                self.committed_txid = txid;
            }
            let keep = head.run_in_shard(self);
            self.release_converged();
            if keep {
                self.continuation = Some(head);
                break;
            }
        }

        // Out-of-order tail: every participating shard granted the locks at scheduling time,
        // so this hop cannot conflict with anything queued ahead of it.
        if let Some(tx) = trans {
            let lmask = tx.local_mask(sid);
            if (lmask & mask::ARMED) != 0 && (lmask & mask::OUT_OF_ORDER) != 0 {
                let tx = Arc::clone(tx);
                debug!(shard = sid, id = %tx.debug_id(), "running out of order");
                let keep = tx.run_in_shard(self);
                debug_assert!(!keep, "out-of-order runs are single-hop and concluding");
            }
        }
    }

    /// Marks `key` as mutated so the next wake-up sweep inspects its watch queue.
    pub fn awake_watched(&mut self, db: DbIndex, key: &[u8]) {
        if self.watches.contains_key(&(db, key.to_vec())) {
            self.awakened_keys.push((db, key.to_vec()));
        }
    }

    /// Wake-up sweep.
    ///
    /// Notifies the first live waiter of every key mutated since the last sweep. When
    /// `completed` is given (a woken transaction that just finished its final hop), it is
    /// retired from its watch queues and the wake is handed to the next waiter.
    pub fn process_awakened(&mut self, completed: Option<&Arc<Transaction>>) {
        let sid = self.shard_id;
        let committed = self.committed_txid;

        let keys = std::mem::take(&mut self.awakened_keys);
        for entry in keys {
            let Some(wq) = self.watches.get_mut(&entry) else {
                continue;
            };
            if wq.active {
                continue;
            }
            let _ = wake_first_waiter(wq, committed, sid, &mut self.awakened);
        }

        let Some(done) = completed else {
            return;
        };
        trace!(shard = sid, id = %done.debug_id(), "retiring awakened transaction");
        self.awakened.retain(|tx| !Arc::ptr_eq(tx, done));
        done.clear_awakened_in(sid);

        let db = done.db_index();
        let args = done.shard_args_in_shard(sid);
        for key in args.iter() {
            let entry = (db, key.to_vec());
            let Some(wq) = self.watches.get_mut(&entry) else {
                continue;
            };
            if let Some(front) = wq.items.front()
                && front.upgrade().is_some_and(|tx| Arc::ptr_eq(&tx, done))
            {
                let _ = wq.items.pop_front();
            }
            wq.active = false;
            let _ = wake_first_waiter(wq, committed, sid, &mut self.awakened);
            if wq.items.is_empty() {
                let _ = self.watches.remove(&entry);
            }
        }
    }

    /// Number of transactions watching `key`, dead entries included.
    #[must_use]
    pub fn watched_count(&self, db: DbIndex, key: &[u8]) -> usize {
        self.watches
            .get(&(db, key.to_vec()))
            .map_or(0, |wq| wq.items.len())
    }

    /// Registers `tx` as suspended on `key`.
    pub fn add_watched(&mut self, db: DbIndex, key: &[u8], tx: &Arc<Transaction>) {
        self.watches
            .entry((db, key.to_vec()))
            .or_default()
            .items
            .push_back(Arc::downgrade(tx));
    }

    /// Drops `tx` from `key`'s watch queue.
    pub fn removed_watched(&mut self, db: DbIndex, key: &[u8], tx: &Arc<Transaction>) {
        let entry = (db, key.to_vec());
        let Some(wq) = self.watches.get_mut(&entry) else {
            return;
        };
        wq.items
            .retain(|weak| weak.upgrade().is_none_or(|item| !Arc::ptr_eq(&item, tx)));
        if wq.items.is_empty() {
            let _ = self.watches.remove(&entry);
        }
    }

    /// Prunes dead and expired entries from the watch queues of `largs`' keys.
    pub fn gc_watched(&mut self, largs: &KeyLockArgs) {
        let sid = self.shard_id;
        for key in largs.keys() {
            let entry = (largs.db, key.to_vec());
            let Some(wq) = self.watches.get_mut(&entry) else {
                continue;
            };
            let front_before = wq.items.front().cloned();
            wq.items.retain(|weak| {
                weak.upgrade()
                    .is_some_and(|tx| (tx.local_mask(sid) & mask::EXPIRED_Q) == 0)
            });
            let front_pruned = match (&front_before, wq.items.front()) {
                (Some(before), Some(after)) => !Weak::ptr_eq(before, after),
                (Some(_), None) => true,
                (None, _) => false,
            };
            if front_pruned {
                // The notified waiter is gone; the next mutation must be able to wake another.
                wq.active = false;
            }
            if wq.items.is_empty() {
                let _ = self.watches.remove(&entry);
            }
        }
    }

    /// Returns whether this shard already applied state up to `txid`.
    #[must_use]
    pub fn has_result_converged(&self, txid: TxId) -> bool {
        self.committed_txid >= txid
    }

    /// Enrolls `tx` until `committed_txid` reaches `txid`; completes its run-count protocol
    /// when the target is already met.
    pub fn wait_for_convergence(&mut self, txid: TxId, tx: &Arc<Transaction>) {
        if self.has_result_converged(txid) {
            let _ = tx.decrease_run_cnt();
            return;
        }
        debug!(shard = self.shard_id, txid, id = %tx.debug_id(), "waiting for convergence");
        self.converge_waiters.push((txid, Arc::clone(tx)));
    }

    /// Clears the shard-local bookkeeping of a concluded batch.
    pub fn shutdown_multi(&mut self, tx: &Arc<Transaction>) {
        if self
            .continuation
            .as_ref()
            .is_some_and(|cont| Arc::ptr_eq(cont, tx))
        {
            self.continuation = None;
        }
        self.remove_awakened(tx);
    }

    /// Drops `tx` from the awakened halt set; used when an expiry races a wake-up.
    pub fn remove_awakened(&mut self, tx: &Arc<Transaction>) {
        self.awakened.retain(|item| !Arc::ptr_eq(item, tx));
    }

    fn release_converged(&mut self) {
        let committed = self.committed_txid;
        let mut released = Vec::new();
        self.converge_waiters.retain(|(target, tx)| {
            if *target <= committed {
                released.push(Arc::clone(tx));
                false
            } else {
                true
            }
        });
        for tx in released {
            let _ = tx.decrease_run_cnt();
        }
    }
}

/// Notifies the first live, non-expired waiter of `wq`. Returns whether one was activated.
fn wake_first_waiter(
    wq: &mut WatchQueue,
    committed: TxId,
    sid: ShardId,
    awakened: &mut Vec<Arc<Transaction>>,
) -> bool {
    while let Some(front) = wq.items.front() {
        let Some(tx) = front.upgrade() else {
            let _ = wq.items.pop_front();
            continue;
        };
        if (tx.local_mask(sid) & mask::EXPIRED_Q) != 0 {
            let _ = wq.items.pop_front();
            continue;
        }
        if tx.notify_suspended(committed, sid) {
            wq.active = true;
            if !awakened.iter().any(|item| Arc::ptr_eq(item, &tx)) {
                awakened.push(tx);
            }
            return true;
        }
        let _ = wq.items.pop_front();
    }
    false
}
