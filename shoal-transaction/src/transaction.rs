//! The transaction coordinator: argument sharding, scheduling, hop execution, blocking
//! wake-up and multi-statement batches.
//!
//! A transaction is shared between the coordinator thread that drives it and the shard workers
//! that run its callbacks. Four scenarios exist: a single-shard non-batch transaction keeps one
//! slot; any multi-shard, global or batch transaction keeps one slot per shard. The coordinator
//! only reads shard-written state after the run-count barrier, and shard workers only read
//! coordinator-written state after the submit barrier, which is what makes the plain-looking
//! accessors below sound.

use std::sync::atomic::{AtomicU8, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::Instant;

use hashbrown::{HashMap, HashSet};
use shoal_common::error::ShoalResult;
use shoal_common::ids::{DbIndex, ShardId, TxId};
use shoal_common::sync::EventCount;
use shoal_core::command::{CommandId, determine_keys, opt};
use shoal_core::sharding::key_shard;
use shoal_core::status::{OpResult, OpStatus};
use shoal_storage::db_slice::KeyLockArgs;
use shoal_storage::intent_lock::IntentMode;
use tracing::{debug, trace};

use crate::engine_shard::EngineShard;
use crate::find_first::{FindFirstProcessor, FindFirstResult};
use crate::shard_set::ShardSet;
use crate::tx_queue::POS_END;

/// Process-wide txid source; advances on every scheduling attempt.
static OP_SEQ: AtomicU64 = AtomicU64::new(1);

/// `notify_txid` sentinel: no shard has woken this transaction yet.
pub(crate) const NOTIFY_NONE: TxId = TxId::MAX;

/// Per-shard `local_mask` bits. Mutated only on the owning shard's thread; the coordinator reads
/// them after the run-count barrier.
pub mod mask {
    /// A hop for this shard is in flight.
    pub const ARMED: u16 = 1;
    /// Scheduling granted every lock; the hop may run ahead of earlier queue entries.
    pub const OUT_OF_ORDER: u16 = 1 << 1;
    /// This shard currently holds the transaction's per-key intent locks.
    pub const KEYLOCK_ACQUIRED: u16 = 1 << 2;
    /// Suspended on this shard's watch registry.
    pub const SUSPENDED_Q: u16 = 1 << 3;
    /// A concurrent mutator woke the transaction on this shard.
    pub const AWAKED_Q: u16 = 1 << 4;
    /// The blocking wait expired or was cancelled on this shard.
    pub const EXPIRED_Q: u16 = 1 << 5;
}

/// Coordinator-side state bits.
pub mod coord {
    /// Scheduling succeeded on every participating shard.
    pub const SCHED: u8 = 1;
    /// A hop is being executed.
    pub const EXEC: u8 = 1 << 1;
    /// The current hop is the transaction's last.
    pub const EXEC_CONCLUDING: u8 = 1 << 2;
    /// Parked in a blocking wait.
    pub const BLOCKED: u8 = 1 << 3;
    /// The blocking wait was cancelled.
    pub const CANCELLED: u8 = 1 << 4;
    /// The whole transaction runs out of order.
    pub const OOO: u8 = 1 << 5;
}

/// Per-hop callback run on shard threads.
///
/// Callbacks must not retain references to coordinator-stack data; everything they need travels
/// through the transaction or the shard.
pub type ShardCallback = Arc<dyn Fn(&Arc<Transaction>, &mut EngineShard) -> OpStatus + Send + Sync>;

/// Cheap view over one shard's slice of the transaction's arguments.
#[derive(Debug, Clone)]
pub struct ShardArgs {
    data: Arc<Vec<Vec<u8>>>,
    start: usize,
    count: usize,
}

impl ShardArgs {
    /// Number of arguments in this slice.
    #[must_use]
    pub fn len(&self) -> usize {
        self.count
    }

    /// Returns whether the slice is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Argument at `index` within the slice.
    #[must_use]
    pub fn get(&self, index: usize) -> &[u8] {
        &self.data[self.start + index]
    }

    /// Iterates the slice.
    pub fn iter(&self) -> impl Iterator<Item = &[u8]> {
        self.data[self.start..self.start + self.count]
            .iter()
            .map(Vec::as_slice)
    }

    /// Copies the slice out.
    #[must_use]
    pub fn to_vec(&self) -> Vec<Vec<u8>> {
        self.data[self.start..self.start + self.count].to_vec()
    }
}

/// Mutable per-shard slot. `pq_pos` is this transaction's queue handle on that shard.
#[derive(Debug)]
struct ShardSlot {
    local_mask: AtomicU16,
    pq_pos: AtomicU64,
}

impl Default for ShardSlot {
    fn default() -> Self {
        Self {
            local_mask: AtomicU16::new(0),
            pq_pos: AtomicU64::new(POS_END),
        }
    }
}

/// Slice bounds into the shard-sorted argument vector; -1 means "the whole vector".
#[derive(Debug, Clone, Copy)]
struct SliceBounds {
    start: i32,
    count: i32,
}

const WHOLE_ARGS: SliceBounds = SliceBounds {
    start: -1,
    count: -1,
};

/// Argument layout of the current statement. Rewritten by the coordinator between hops only.
#[derive(Debug, Default)]
struct ArgIndex {
    /// Key (and value) arguments re-sorted by owner shard.
    args: Arc<Vec<Vec<u8>>>,
    /// Original caller index of every `args` entry; unused on the single-shard path.
    reverse_index: Vec<u32>,
    /// Per-slot bounds into `args`; empty on the single-shard path.
    slices: Vec<SliceBounds>,
}

/// Holder counts a batch recorded for one key.
#[derive(Debug, Default, Clone, Copy)]
struct LockCnt {
    shared: u32,
    exclusive: u32,
}

/// State attached to EXEC/EVAL-style batch transactions.
#[derive(Debug)]
struct MultiData {
    /// Option mask of the batch command itself, captured at construction.
    multi_opts: u32,
    /// EXEC locks per statement; EVAL locks everything during scheduling.
    incremental: bool,
    /// Keys locked on behalf of the batch, by mode, released in one sweep by `unlock_multi`.
    locks: HashMap<Vec<u8>, LockCnt>,
    locks_recorded: bool,
}

/// A command's journey through the shard set.
pub struct Transaction {
    cid: RwLock<CommandId>,
    shard_set: Arc<ShardSet>,
    multi: Option<Mutex<MultiData>>,

    db_index: AtomicU16,
    txid: AtomicU64,
    coordinator_state: AtomicU8,

    args: RwLock<ArgIndex>,
    slots: OnceLock<Box<[ShardSlot]>>,
    unique_shard_cnt: AtomicU32,
    unique_shard_id: AtomicU16,

    cb: Mutex<Option<ShardCallback>>,
    local_result: Mutex<OpStatus>,
    run_count: AtomicU32,
    seqlock: AtomicU32,
    notify_txid: AtomicU64,

    run_ec: EventCount,
    blocking_ec: EventCount,
}

impl Transaction {
    /// Creates a transaction for `cid`. EXEC/EVAL/EVALSHA come out as batch transactions.
    #[must_use]
    pub fn new(cid: &CommandId, shard_set: &Arc<ShardSet>) -> Arc<Self> {
        let multi = matches!(cid.name(), "EXEC" | "EVAL" | "EVALSHA").then(|| {
            Mutex::new(MultiData {
                multi_opts: cid.opt_mask(),
                incremental: cid.name() == "EXEC",
                locks: HashMap::new(),
                locks_recorded: false,
            })
        });

        let tx = Self {
            cid: RwLock::new(*cid),
            shard_set: Arc::clone(shard_set),
            multi,
            db_index: AtomicU16::new(0),
            txid: AtomicU64::new(0),
            coordinator_state: AtomicU8::new(0),
            args: RwLock::new(ArgIndex::default()),
            slots: OnceLock::new(),
            unique_shard_cnt: AtomicU32::new(0),
            unique_shard_id: AtomicU16::new(0),
            cb: Mutex::new(None),
            local_result: Mutex::new(OpStatus::Ok),
            run_count: AtomicU32::new(0),
            seqlock: AtomicU32::new(0),
            notify_txid: AtomicU64::new(NOTIFY_NONE),
            run_ec: EventCount::default(),
            blocking_ec: EventCount::default(),
        };
        if tx.multi.is_some() {
            // Batches never resize their slots: statements come and go but the per-shard
            // queue handles must survive all of them.
            tx.ensure_slots(shard_set.shard_count().slots());
        }
        Arc::new(tx)
    }

    // ---------------------------------------------------------------- accessors

    /// Current command name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.cid_snapshot().name()
    }

    /// `name@txid/unique_shard_cnt`, for logs.
    #[must_use]
    pub fn debug_id(&self) -> String {
        format!(
            "{}@{}/{}",
            self.name(),
            self.txid.load(Ordering::Relaxed),
            self.unique_shard_cnt.load(Ordering::Relaxed)
        )
    }

    /// Scheduling order token; zero until scheduled.
    #[must_use]
    pub fn txid(&self) -> TxId {
        self.txid.load(Ordering::Relaxed)
    }

    /// Target database.
    #[must_use]
    pub fn db_index(&self) -> DbIndex {
        self.db_index.load(Ordering::Relaxed)
    }

    /// Returns whether the current command serializes through the coarse shard locks.
    #[must_use]
    pub fn is_global(&self) -> bool {
        self.cid_snapshot().has_opt(opt::GLOBAL_TRANS)
    }

    /// Returns whether this transaction is an EXEC/EVAL-style batch.
    #[must_use]
    pub fn is_multi(&self) -> bool {
        self.multi.is_some()
    }

    /// Lock mode the current command needs for its keys.
    #[must_use]
    pub fn mode(&self) -> IntentMode {
        if self.cid_snapshot().has_opt(opt::READONLY) {
            IntentMode::Shared
        } else {
            IntentMode::Exclusive
        }
    }

    /// Number of shards with at least one key.
    #[must_use]
    pub fn unique_shard_cnt(&self) -> u32 {
        self.unique_shard_cnt.load(Ordering::Relaxed)
    }

    /// The single participating shard; meaningful when [`Self::unique_shard_cnt`] is 1.
    #[must_use]
    pub fn unique_shard_id(&self) -> ShardId {
        self.unique_shard_id.load(Ordering::Relaxed)
    }

    /// Raw coordinator state bits, see [`coord`].
    #[must_use]
    pub fn coordinator_state(&self) -> u8 {
        self.coordinator_state.load(Ordering::Relaxed)
    }

    /// Returns whether the scheduling loop granted out-of-order execution.
    #[must_use]
    pub fn is_out_of_order(&self) -> bool {
        self.coord_has(coord::OOO)
    }

    /// Result of the last single-shard hop.
    #[must_use]
    pub fn local_result(&self) -> OpStatus {
        *self.local_result.lock().expect("local result lock poisoned")
    }

    /// Smallest committed txid among the shards that woke this transaction.
    #[must_use]
    pub fn notify_txid(&self) -> TxId {
        self.notify_txid.load(Ordering::Relaxed)
    }

    /// Shard callbacks still running in the current hop.
    #[must_use]
    pub fn run_count(&self) -> u32 {
        self.run_count.load(Ordering::Relaxed)
    }

    /// `local_mask` bits of this transaction on shard `sid`.
    #[must_use]
    pub fn local_mask(&self, sid: ShardId) -> u16 {
        self.slot(sid).local_mask.load(Ordering::Relaxed)
    }

    /// Returns whether this transaction holds a queue entry on shard `sid`.
    #[must_use]
    pub fn is_queued_in(&self, sid: ShardId) -> bool {
        self.slot(sid).pq_pos.load(Ordering::Relaxed) != POS_END
    }

    /// Returns whether a hop for shard `sid` is armed and in flight.
    #[must_use]
    pub fn is_armed_in_shard(&self, sid: ShardId) -> bool {
        // The run-count read orders before the mask read; an armed slot implies a live hop.
        self.run_count.load(Ordering::Acquire) > 0
            && (self.local_mask(sid) & mask::ARMED) != 0
    }

    /// The slice of arguments shard `sid` owns for the current statement.
    #[must_use]
    pub fn shard_args_in_shard(&self, sid: ShardId) -> ShardArgs {
        let index = self.args.read().expect("arg index lock poisoned");
        if self.unique_shard_cnt.load(Ordering::Relaxed) == 1 {
            let count = index.args.len();
            return ShardArgs {
                data: Arc::clone(&index.args),
                start: 0,
                count,
            };
        }
        let bounds = index.slices[usize::from(sid)];
        if bounds.start < 0 {
            let count = index.args.len();
            ShardArgs {
                data: Arc::clone(&index.args),
                start: 0,
                count,
            }
        } else {
            ShardArgs {
                data: Arc::clone(&index.args),
                start: usize::try_from(bounds.start).expect("non-negative slice start"),
                count: usize::try_from(bounds.count).expect("non-negative slice count"),
            }
        }
    }

    /// Maps `arg_index` within shard `sid`'s slice back to the caller's original key index.
    #[must_use]
    pub fn reverse_arg_index(&self, sid: ShardId, arg_index: usize) -> usize {
        if self.unique_shard_cnt.load(Ordering::Relaxed) == 1 {
            // The single-shard layout keeps the caller's order, no mapping is stored.
            return arg_index;
        }
        let index = self.args.read().expect("arg index lock poisoned");
        let bounds = index.slices[usize::from(sid)];
        let start = usize::try_from(bounds.start).expect("multi-shard slices are concrete");
        usize::try_from(index.reverse_index[start + arg_index]).expect("index fits usize")
    }

    /// Lock request covering shard `sid`'s keys for the current statement.
    #[must_use]
    pub fn get_lock_args(&self, sid: ShardId) -> KeyLockArgs {
        KeyLockArgs {
            db: self.db_index(),
            key_step: self.cid_snapshot().key_arg_step(),
            args: self.shard_args_in_shard(sid).to_vec(),
        }
    }

    // ---------------------------------------------------------------- argument sharding

    /// Classifies the command's key arguments by owner shard and lays out the per-shard slices.
    ///
    /// Called once per statement, strictly between hops; shard workers never observe a layout
    /// mid-rewrite because arming happens afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error when the command's key layout cannot be applied to `full_args`.
    pub fn init_by_args(&self, db: DbIndex, full_args: &[Vec<u8>]) -> ShoalResult<()> {
        self.db_index.store(db, Ordering::Relaxed);
        let shard_count = self.shard_set.shard_count();
        let total = shard_count.slots();

        if self.is_global() {
            self.ensure_slots(total);
            let mut index = self.args.write().expect("arg index lock poisoned");
            *index = ArgIndex {
                args: Arc::new(Vec::new()),
                reverse_index: Vec::new(),
                slices: vec![SliceBounds { start: 0, count: 0 }; total],
            };
            drop(index);
            self.unique_shard_cnt
                .store(u32::try_from(total).expect("shard count fits u32"), Ordering::Relaxed);
            return Ok(());
        }

        let cid = self.cid_snapshot();
        let key_index = determine_keys(&cid, full_args)?;

        if !key_index.has_keys() {
            // A zero-key script participates in nothing until its statements arrive.
            self.unique_shard_cnt.store(0, Ordering::Relaxed);
            return Ok(());
        }

        let incremental_locking = self.multi_incremental();
        let single_key =
            !self.is_multi() && key_index.start + key_index.step >= key_index.end;

        if single_key {
            self.ensure_slots(1);
            let args = full_args[key_index.start..key_index.start + key_index.step].to_vec();
            let sid = key_shard(&args[0], shard_count);

            let mut index = self.args.write().expect("arg index lock poisoned");
            *index = ArgIndex {
                args: Arc::new(args),
                reverse_index: Vec::new(),
                slices: Vec::new(),
            };
            drop(index);

            self.unique_shard_cnt.store(1, Ordering::Relaxed);
            self.unique_shard_id.store(sid, Ordering::Relaxed);
            trace!(id = %self.debug_id(), shard = sid, "single-key layout");
            return Ok(());
        }

        // Classify each key (and its paired value) by owner shard.
        let mut shard_args: Vec<Vec<Vec<u8>>> = vec![Vec::new(); total];
        let mut shard_index: Vec<Vec<u32>> = vec![Vec::new(); total];

        let mode = self.mode();
        let mut multi_guard = self
            .multi
            .as_ref()
            .map(|multi| multi.lock().expect("multi state lock poisoned"));
        let should_record_locks = multi_guard
            .as_ref()
            .is_some_and(|multi| multi.incremental || !multi.locks_recorded);
        let mut uniq_keys: HashSet<Vec<u8>> = HashSet::new();

        let mut position = key_index.start;
        while position < key_index.end {
            let key = &full_args[position];
            let sid = usize::from(key_shard(key, shard_count));
            shard_args[sid].push(key.clone());
            // The caller counts key positions from the argument after the command name.
            shard_index[sid].push(u32::try_from(position - 1).expect("argument index fits u32"));

            if should_record_locks
                && uniq_keys.insert(key.clone())
                && let Some(multi) = multi_guard.as_mut()
            {
                let counts = multi.locks.entry(key.clone()).or_default();
                match mode {
                    IntentMode::Shared => counts.shared += 1,
                    IntentMode::Exclusive => counts.exclusive += 1,
                }
            }

            if key_index.step == 2 {
                let value = &full_args[position + 1];
                shard_args[sid].push(value.clone());
                shard_index[sid].push(u32::try_from(position).expect("argument index fits u32"));
            }
            position += key_index.step;
        }

        if let Some(multi) = multi_guard.as_mut() {
            multi.locks_recorded = true;
        }
        drop(multi_guard);

        // Concatenate the per-shard segments and mirror the original indices.
        let mut flat = Vec::with_capacity(key_index.end - key_index.start);
        let mut reverse = Vec::with_capacity(key_index.end - key_index.start);
        let mut slices = vec![SliceBounds { start: 0, count: 0 }; total];
        let mut unique_cnt: u32 = 0;
        let mut unique_id: ShardId = 0;

        for sid in 0..total {
            slices[sid] = SliceBounds {
                start: i32::try_from(flat.len()).expect("argument count fits i32"),
                count: i32::try_from(shard_args[sid].len()).expect("argument count fits i32"),
            };
            if shard_args[sid].is_empty() {
                continue;
            }
            unique_cnt += 1;
            unique_id = ShardId::try_from(sid).expect("shard id fits u16");
            flat.append(&mut shard_args[sid]);
            reverse.extend_from_slice(&shard_index[sid]);
        }

        let collapse_single = !self.is_multi() && unique_cnt == 1;
        self.ensure_slots(if collapse_single { 1 } else { total });

        if incremental_locking {
            // Each statement of an incrementally locking batch re-acquires exactly its own
            // keys; stale per-slot lock flags from the previous statement must not suppress
            // that.
            for slot in self.slots.get().expect("slots are sized").iter() {
                slot.local_mask.store(0, Ordering::Relaxed);
            }
        }

        if unique_cnt == 1 {
            if !collapse_single {
                slices[usize::from(unique_id)] = WHOLE_ARGS;
            } else {
                slices = Vec::new();
                reverse = Vec::new();
            }
        }

        let mut index = self.args.write().expect("arg index lock poisoned");
        *index = ArgIndex {
            args: Arc::new(flat),
            reverse_index: reverse,
            slices,
        };
        drop(index);

        self.unique_shard_cnt.store(unique_cnt, Ordering::Relaxed);
        self.unique_shard_id.store(unique_id, Ordering::Relaxed);
        trace!(id = %self.debug_id(), shards = unique_cnt, "sharded layout");
        Ok(())
    }

    // ---------------------------------------------------------------- scheduling

    /// Obtains a coherent position in every participating shard's queue; no-op once scheduled.
    pub fn schedule(self: &Arc<Self>) {
        if self.txid.load(Ordering::Relaxed) == 0 && !self.coord_has(coord::SCHED) {
            self.schedule_internal();
        }
    }

    fn schedule_internal(self: &Arc<Self>) {
        debug_assert_eq!(self.txid.load(Ordering::Relaxed), 0);
        debug_assert!(!self.coord_has(coord::SCHED | coord::OOO));

        let span_all = self.is_global();
        let single_hop = self.coord_has(coord::EXEC_CONCLUDING);
        let mode = self.mode();

        let num_shards = if span_all {
            // Global transactions take the coarse lock everywhere before entering the queues.
            self.shard_set
                .broadcast(move |shard| {
                    let _ = shard.shard_lock_mut().acquire(mode);
                }, |_| true);
            u32::from(self.shard_set.size())
        } else {
            self.unique_shard_cnt.load(Ordering::Relaxed)
        };
        debug_assert!(num_shards > 0);

        loop {
            let txid = OP_SEQ.fetch_add(1, Ordering::Relaxed);
            self.txid.store(txid, Ordering::Relaxed);

            let success = Arc::new(AtomicU32::new(0));
            let lock_granted = Arc::new(AtomicU32::new(0));
            {
                let tx = Arc::clone(self);
                let success = Arc::clone(&success);
                let lock_granted = Arc::clone(&lock_granted);
                self.shard_set.broadcast(
                    move |shard| {
                        let (ok, granted) = tx.schedule_in_shard(shard);
                        if ok {
                            let _ = success.fetch_add(1, Ordering::Relaxed);
                        }
                        if granted {
                            let _ = lock_granted.fetch_add(1, Ordering::Relaxed);
                        }
                    },
                    |sid| self.shard_active(sid),
                );
            }

            if success.load(Ordering::Acquire) == num_shards {
                // Out-of-order execution is only sound for single-hop transactions: later
                // hops of a multi-hop transaction must observe the queue order.
                if single_hop && !span_all && lock_granted.load(Ordering::Relaxed) == num_shards
                {
                    self.coord_set(coord::OOO);
                    for slot in self.slots.get().expect("slots are sized").iter() {
                        let _ = slot.local_mask.fetch_or(mask::OUT_OF_ORDER, Ordering::Relaxed);
                    }
                }
                self.coord_set(coord::SCHED);
                debug!(id = %self.debug_id(), ooo = self.is_out_of_order(), "scheduled");
                break;
            }

            debug!(id = %self.debug_id(), "cancelling scheduling attempt");
            let tx = Arc::clone(self);
            self.shard_set.broadcast(
                move |shard| {
                    let _ = tx.cancel_in_shard(shard);
                },
                |sid| self.shard_active(sid),
            );
        }
    }

    /// Runs on the shard thread; returns `(schedule_success, lock_granted)`.
    fn schedule_in_shard(self: &Arc<Self>, shard: &mut EngineShard) -> (bool, bool) {
        let txid = self.txid.load(Ordering::Relaxed);
        if shard.committed_txid() >= txid {
            // Stale attempt; the retry loop will come back with a larger txid.
            return (false, false);
        }

        let spans_all = self.is_global();
        let mode = self.mode();
        let sid = shard.shard_id();
        let mut lock_granted = false;
        let mut lock_args = None;

        if !spans_all {
            let shard_unlocked = shard.shard_lock().check(mode);
            let largs = self.get_lock_args(sid);
            // Every queued transaction must hold its intent locks, granted or not; dequeue
            // order decides when the lock logically applies.
            lock_granted = shard.db_slice_mut().acquire(mode, &largs) && shard_unlocked;
            let _ = self
                .slot(sid)
                .local_mask
                .fetch_or(mask::KEYLOCK_ACQUIRED, Ordering::Relaxed);
            lock_args = Some(largs);
        }

        if !shard.txq().is_empty() {
            // Entering before the tail would reorder the queue; a tail that already holds its
            // locks may have advertised out-of-order eligibility, so reordering past it is
            // unsound.
            let to_proceed =
                lock_granted || shard.txq().tail_score().is_some_and(|tail| tail < txid);
            if !to_proceed {
                if let Some(largs) = &lock_args
                    && (self.local_mask(sid) & mask::KEYLOCK_ACQUIRED) != 0
                {
                    shard.db_slice_mut().release(mode, largs);
                    let _ = self
                        .slot(sid)
                        .local_mask
                        .fetch_and(!mask::KEYLOCK_ACQUIRED, Ordering::Relaxed);
                }
                return (false, false);
            }
        }

        let pos = shard.txq_mut().insert(txid, self);
        debug_assert_eq!(self.slot(sid).pq_pos.load(Ordering::Relaxed), POS_END);
        self.slot(sid).pq_pos.store(pos, Ordering::Relaxed);
        trace!(id = %self.debug_id(), shard = sid, qlen = shard.txq().len(), "queued in shard");

        (true, lock_granted)
    }

    /// Reverses a successful [`Self::schedule_in_shard`]; returns whether anything was undone.
    fn cancel_in_shard(&self, shard: &mut EngineShard) -> bool {
        let sid = shard.shard_id();
        let slot = self.slot(sid);

        let pos = slot.pq_pos.swap(POS_END, Ordering::Relaxed);
        if pos == POS_END {
            return false;
        }
        shard.txq_mut().remove(pos);

        if (slot.local_mask.load(Ordering::Relaxed) & mask::KEYLOCK_ACQUIRED) != 0 {
            let largs = self.get_lock_args(sid);
            shard.db_slice_mut().release(self.mode(), &largs);
            let _ = slot
                .local_mask
                .fetch_and(!mask::KEYLOCK_ACQUIRED, Ordering::Relaxed);
        }
        true
    }

    // ---------------------------------------------------------------- single hop

    /// Schedules and executes a one-hop transaction; the common path for plain commands.
    ///
    /// Single-shard uncontended commands run inline on the shard without ever taking a txid or
    /// a queue entry.
    pub fn schedule_single_hop(self: &Arc<Self>, callback: ShardCallback) -> OpStatus {
        self.install_callback(callback);
        *self.local_result.lock().expect("local result lock poisoned") = OpStatus::Ok;
        self.coord_set(coord::EXEC | coord::EXEC_CONCLUDING);

        let schedule_fast =
            self.unique_shard_cnt.load(Ordering::Relaxed) == 1 && !self.is_global() && !self.is_multi();

        if schedule_fast {
            debug_assert_eq!(self.slots.get().map(|slots| slots.len()), Some(1));
            let sid = self.unique_shard_id.load(Ordering::Relaxed);
            let _ = self.slot(sid).local_mask.fetch_or(mask::ARMED, Ordering::Relaxed);
            // Published before the submit barrier; the shard reads it after.
            let _ = self.run_count.fetch_add(1, Ordering::Release);

            let tx = Arc::clone(self);
            self.shard_set.submit(sid, move |shard| {
                let run_eager = tx.schedule_unique_shard(shard);
                if run_eager {
                    // Decrement only once the eager flag exists: the coordinator resumes the
                    // moment the count reaches zero and its stack unwinds.
                    let _ = tx.decrease_run_cnt();
                }
            });
        } else {
            if !self.is_multi() {
                self.schedule_internal();
            }
            self.execute_async();
        }

        trace!(id = %self.debug_id(), "single hop waiting");
        self.wait_for_shard_callbacks();
        self.clear_callback();
        self.local_result()
    }

    /// Runs on the shard thread. Returns `true` when the quickie path ran the callback inline;
    /// `false` when the transaction entered the queue instead.
    fn schedule_unique_shard(self: &Arc<Self>, shard: &mut EngineShard) -> bool {
        debug_assert!(!self.is_multi());
        debug_assert_eq!(self.txid.load(Ordering::Relaxed), 0);

        let mode = self.mode();
        let sid = shard.shard_id();
        let largs = self.get_lock_args(sid);
        debug_assert_eq!(self.slot(sid).pq_pos.load(Ordering::Relaxed), POS_END);

        // Uncontended keys under an unlocked shard run inline, skipping txid and queue.
        if shard.db_slice().check(mode, &largs) && shard.shard_lock().check(mode) {
            self.run_quickie(shard);
            return true;
        }

        let txid = OP_SEQ.fetch_add(1, Ordering::Relaxed);
        self.txid.store(txid, Ordering::Relaxed);
        let pos = shard.txq_mut().insert(txid, self);
        self.slot(sid).pq_pos.store(pos, Ordering::Relaxed);

        debug_assert_eq!(self.local_mask(sid) & mask::KEYLOCK_ACQUIRED, 0);
        let _ = shard.db_slice_mut().acquire(mode, &largs);
        let _ = self
            .slot(sid)
            .local_mask
            .fetch_or(mask::KEYLOCK_ACQUIRED, Ordering::Relaxed);

        debug!(id = %self.debug_id(), "rescheduling into the shard queue");
        shard.poll_execution("schedule_unique", None);
        false
    }

    /// Inline single-shard run without scheduling state.
    fn run_quickie(self: &Arc<Self>, shard: &mut EngineShard) {
        debug_assert!(!self.is_multi());
        debug_assert_eq!(self.txid.load(Ordering::Relaxed), 0);
        shard.inc_quick_run();

        let sid = shard.shard_id();
        debug_assert_eq!(
            self.local_mask(sid) & (mask::KEYLOCK_ACQUIRED | mask::OUT_OF_ORDER),
            0
        );
        trace!(id = %self.debug_id(), shard = sid, "quickie");

        let callback = self.callback_snapshot();
        let status = callback(self, shard);
        *self.local_result.lock().expect("local result lock poisoned") = status;

        let _ = self.slot(sid).local_mask.fetch_and(!mask::ARMED, Ordering::Relaxed);
        // Only this single shard runs the callback, so it can retire it directly.
        self.clear_callback();
    }

    // ---------------------------------------------------------------- execution hops

    /// Runs one hop of `callback` across the participating shards and waits for it.
    ///
    /// `conclude` marks the transaction's final hop, which releases its locks (except for
    /// batches, which release through [`Self::unlock_multi`]).
    pub fn execute(self: &Arc<Self>, callback: ShardCallback, conclude: bool) {
        self.install_callback(callback);
        self.coord_set(coord::EXEC);
        if conclude {
            self.coord_set(coord::EXEC_CONCLUDING);
        } else {
            self.coord_clear(coord::EXEC_CONCLUDING);
        }

        self.execute_async();

        trace!(id = %self.debug_id(), "hop waiting");
        self.wait_for_shard_callbacks();
        self.clear_callback();
    }

    /// Arms the participating shards and fans the current hop out to them.
    fn execute_async(self: &Arc<Self>) {
        let cnt = self.unique_shard_cnt.load(Ordering::Relaxed);
        debug_assert!(cnt > 0);
        let is_global = self.is_global();
        let shard_count = self.shard_set.shard_count();

        if !is_global && cnt == 1 {
            let sid = self.unique_shard_id.load(Ordering::Relaxed);
            let _ = self.slot(sid).local_mask.fetch_or(mask::ARMED, Ordering::Relaxed);
        } else {
            for sid in shard_count.ids() {
                if self.shard_active(sid) {
                    let _ = self.slot(sid).local_mask.fetch_or(mask::ARMED, Ordering::Relaxed);
                }
            }
        }

        let seq = self.seqlock.load(Ordering::Relaxed);
        // The release store pairs with the armed check on the shard side: no write above may
        // sink below it, so an armed shard observes a fully published hop.
        self.run_count.store(cnt, Ordering::Release);

        let submit_exec = |sid: ShardId| {
            let tx = Arc::clone(self);
            self.shard_set.submit(sid, move |shard| {
                let local_mask = tx.local_mask(shard.shard_id());
                // The RMW orders the mask read above before the generation check.
                let seq_after = tx.seqlock.fetch_add(0, Ordering::Release);
                if seq_after == seq && (local_mask & mask::ARMED) != 0 {
                    shard.poll_execution("exec_cb", Some(&tx));
                } else {
                    // Stale callback: the coordinator already finished this hop. Draining the
                    // queue is still useful, running the transaction is not.
                    shard.poll_execution("exec_stale", None);
                }
            });
        };

        if !is_global && cnt == 1 {
            submit_exec(self.unique_shard_id.load(Ordering::Relaxed));
        } else {
            for sid in shard_count.ids() {
                if self.shard_active(sid) {
                    submit_exec(sid);
                }
            }
        }
    }

    /// Runs this transaction's current hop on `shard`.
    ///
    /// Returns whether the shard should keep the transaction (as its continuation) for further
    /// hops.
    pub(crate) fn run_in_shard(self: &Arc<Self>, shard: &mut EngineShard) -> bool {
        debug_assert!(self.run_count.load(Ordering::Relaxed) > 0);
        debug_assert!(self.txid.load(Ordering::Relaxed) > 0);

        let sid = shard.shard_id();
        let slot = self.slot(sid);
        let entry_mask = slot.local_mask.load(Ordering::Relaxed);
        assert!((entry_mask & mask::ARMED) != 0, "running an unarmed hop");
        let _ = slot.local_mask.fetch_and(!mask::ARMED, Ordering::Relaxed);

        let awaked_prerun = (entry_mask & mask::AWAKED_Q) != 0;
        let incremental_lock = self.multi_incremental();
        // Batches release in unlock_multi; for everything else the concluding hop releases.
        let should_release = self.coord_has(coord::EXEC_CONCLUDING) && !self.is_multi();
        let mode = self.mode();

        trace!(id = %self.debug_id(), shard = sid, "run in shard");

        // Statements of an incrementally locking batch take their keys at first touch.
        if incremental_lock && (entry_mask & mask::KEYLOCK_ACQUIRED) == 0 {
            debug_assert!(!awaked_prerun, "batches cannot contain blocking statements");
            let _ = slot
                .local_mask
                .fetch_or(mask::KEYLOCK_ACQUIRED, Ordering::Relaxed);
            let largs = self.get_lock_args(sid);
            let _ = shard.db_slice_mut().acquire(mode, &largs);
        }

        let callback = self.callback_snapshot();
        let status = callback(self, shard);

        if self.unique_shard_cnt.load(Ordering::Relaxed) == 1 {
            // Only a single thread runs the callback, so it can retire it directly.
            self.clear_callback();
            *self.local_result.lock().expect("local result lock poisoned") = status;
        } else {
            assert_eq!(
                status,
                OpStatus::Ok,
                "multi-shard callbacks aggregate their results out of band"
            );
        }

        // The queue entry goes away on the first invocation; reruns go through the shard's
        // continuation slot.
        let pos = slot.pq_pos.swap(POS_END, Ordering::Relaxed);
        if pos != POS_END {
            shard.txq_mut().remove(pos);
        }

        if should_release {
            let cur_mask = slot.local_mask.load(Ordering::Relaxed);
            let is_suspended = (cur_mask & mask::SUSPENDED_Q) != 0;

            if self.is_global() {
                debug_assert!(!awaked_prerun && !is_suspended);
                shard.shard_lock_mut().release(mode);
            } else {
                // A suspended transaction keeps its locks: arrivals on those keys must stay
                // ordered through the queue until the wake-up completes.
                if !is_suspended && (cur_mask & mask::KEYLOCK_ACQUIRED) != 0 {
                    let largs = self.get_lock_args(sid);
                    shard.db_slice_mut().release(mode, &largs);
                    let _ = slot
                        .local_mask
                        .fetch_and(!mask::KEYLOCK_ACQUIRED, Ordering::Relaxed);
                }
                let _ = slot
                    .local_mask
                    .fetch_and(!mask::OUT_OF_ORDER, Ordering::Relaxed);

                let completed = awaked_prerun.then(|| Arc::clone(self));
                shard.process_awakened(completed.as_ref());
            }
        }

        let _ = self.decrease_run_cnt();
        // `self` may be concurrently destroyed past this point; the caller's clone is the only
        // guaranteed reference.

        !should_release
    }

    // ---------------------------------------------------------------- batches

    /// Installs the next statement of a batch; schedules the batch itself on first use.
    pub fn set_exec_cmd(self: &Arc<Self>, cid: &CommandId) {
        debug_assert!(self.is_multi());
        debug_assert!(self.cb.lock().expect("callback lock poisoned").is_none());

        // Scheduling must happen while the batch command is still installed: its option mask
        // decides the global footprint.
        if self.txid.load(Ordering::Relaxed) == 0 {
            self.schedule();
        }

        self.unique_shard_cnt.store(0, Ordering::Relaxed);
        let mut index = self.args.write().expect("arg index lock poisoned");
        *index = ArgIndex::default();
        drop(index);
        *self.cid.write().expect("command descriptor lock poisoned") = *cid;
    }

    /// Concludes a batch: releases every recorded lock and retires the queue entries.
    pub fn unlock_multi(self: &Arc<Self>) {
        debug!(id = %self.debug_id(), "unlock multi");
        let total = self.shard_set.shard_count().slots();

        let (sharded_keys, release_global) = {
            let multi = self
                .multi
                .as_ref()
                .expect("unlock_multi on a non-batch transaction")
                .lock()
                .expect("multi state lock poisoned");
            let mut sharded: Vec<Vec<(Vec<u8>, LockCnt)>> = vec![Vec::new(); total];
            for (key, counts) in &multi.locks {
                let sid = usize::from(key_shard(key, self.shard_set.shard_count()));
                sharded[sid].push((key.clone(), *counts));
            }
            (Arc::new(sharded), (multi.multi_opts & opt::GLOBAL_TRANS) != 0)
        };

        let prev = self.run_count.swap(
            u32::try_from(total).expect("shard count fits u32"),
            Ordering::Release,
        );
        debug_assert_eq!(prev, 0);

        for sid in self.shard_set.shard_count().ids() {
            let tx = Arc::clone(self);
            let sharded_keys = Arc::clone(&sharded_keys);
            self.shard_set.submit(sid, move |shard| {
                tx.unlock_multi_in_shard(shard, &sharded_keys, release_global);
            });
        }
        self.wait_for_shard_callbacks();
        debug!(id = %self.debug_id(), "unlock multi done");
    }

    fn unlock_multi_in_shard(
        self: &Arc<Self>,
        shard: &mut EngineShard,
        sharded_keys: &[Vec<(Vec<u8>, LockCnt)>],
        release_global: bool,
    ) {
        if release_global {
            shard.shard_lock_mut().release(IntentMode::Exclusive);
        }

        let sid = shard.shard_id();
        let db = self.db_index();
        for (key, counts) in &sharded_keys[usize::from(sid)] {
            if counts.shared > 0 {
                shard
                    .db_slice_mut()
                    .release_counted(db, key, IntentMode::Shared, counts.shared);
            }
            if counts.exclusive > 0 {
                shard
                    .db_slice_mut()
                    .release_counted(db, key, IntentMode::Exclusive, counts.exclusive);
            }
        }

        // Shards the batch never executed a statement on still carry its queue entry.
        let pos = self.slot(sid).pq_pos.swap(POS_END, Ordering::Relaxed);
        if pos != POS_END {
            shard.txq_mut().remove(pos);
        }

        shard.shutdown_multi(self);
        shard.process_awakened(None);
        shard.poll_execution("unlock_multi", None);
        let _ = self.decrease_run_cnt();
    }

    // ---------------------------------------------------------------- blocking

    /// Suspends on the transaction's keys until a mutation wakes it, the deadline passes, or
    /// the connection closes.
    ///
    /// Returns `false` on timeout or cancellation; the caller must not run further data hops in
    /// that case.
    pub fn wait_on_watch(self: &Arc<Self>, deadline: Option<Instant>) -> bool {
        trace!(id = %self.debug_id(), "wait on watch");
        let register: ShardCallback =
            Arc::new(|tx, shard| tx.add_to_watched_shard(shard));
        self.execute(register, true);
        self.coord_set(coord::BLOCKED);

        let woken = || {
            self.coord_has(coord::CANCELLED)
                || self.notify_txid.load(Ordering::Relaxed) != NOTIFY_NONE
        };
        let wait_ok = match deadline {
            None => {
                self.blocking_ec.wait_until(woken);
                true
            }
            Some(deadline) => self.blocking_ec.wait_until_deadline(woken, deadline),
        };

        if self.coord_has(coord::CANCELLED) || !wait_ok {
            self.expire_blocking();
            self.coord_clear(coord::BLOCKED);
            return false;
        }

        // A wake-up reached us from one shard; make sure every participating shard applied at
        // least the state that caused it before the caller reads anything.
        if self.unique_shard_cnt.load(Ordering::Relaxed) > 1 {
            self.run_count.store(
                self.unique_shard_cnt.load(Ordering::Relaxed),
                Ordering::Release,
            );
            for sid in self.shard_set.shard_count().ids() {
                if !self.shard_active(sid) {
                    continue;
                }
                let tx = Arc::clone(self);
                self.shard_set.submit(sid, move |shard| {
                    let notify = tx.notify_txid.load(Ordering::Relaxed);
                    let local_mask = tx.local_mask(shard.shard_id());
                    if (local_mask & mask::AWAKED_Q) != 0 || shard.has_result_converged(notify) {
                        let _ = tx.decrease_run_cnt();
                    } else {
                        shard.wait_for_convergence(notify, &tx);
                    }
                });
            }
            self.wait_for_shard_callbacks();
            trace!(id = %self.debug_id(), "convergence finished");
        }

        self.coord_clear(coord::BLOCKED);
        true
    }

    /// Marks the blocking wait expired and releases the suspend-time locks everywhere.
    fn expire_blocking(self: &Arc<Self>) {
        debug!(id = %self.debug_id(), "expire blocking");
        debug_assert!(!self.is_global());

        self.run_count.store(
            self.unique_shard_cnt.load(Ordering::Relaxed),
            Ordering::Release,
        );

        let submit_expire = |sid: ShardId| {
            let tx = Arc::clone(self);
            self.shard_set.submit(sid, move |shard| {
                let sid = shard.shard_id();
                let largs = tx.get_lock_args(sid);
                shard.db_slice_mut().release(tx.mode(), &largs);

                let slot = tx.slot(sid);
                let _ = slot.local_mask.fetch_or(mask::EXPIRED_Q, Ordering::Relaxed);
                let _ = slot
                    .local_mask
                    .fetch_and(!mask::KEYLOCK_ACQUIRED, Ordering::Relaxed);

                // A wake-up that lost the race against the deadline must not leave the queue
                // halted, and the watch registry must not resurrect this transaction.
                shard.remove_awakened(&tx);
                shard.gc_watched(&largs);
                shard.poll_execution("expire_cb", None);
                let _ = tx.decrease_run_cnt();
            });
        };

        if self.unique_shard_cnt.load(Ordering::Relaxed) == 1 {
            submit_expire(self.unique_shard_id.load(Ordering::Relaxed));
        } else {
            for sid in self.shard_set.shard_count().ids() {
                if self.shard_active(sid) {
                    debug_assert_eq!(self.local_mask(sid) & mask::ARMED, 0);
                    submit_expire(sid);
                }
            }
        }

        self.wait_for_shard_callbacks();
        debug!(id = %self.debug_id(), "expire blocking finished");
    }

    /// Removes the transaction from the watch registries it registered on.
    ///
    /// On shards that were never woken this also releases the suspend-time locks, so that no
    /// lock survives a blocking episode.
    pub fn unregister_watch(self: &Arc<Self>) {
        let remove: ShardCallback = Arc::new(|tx, shard| {
            let _ = tx.remove_from_watched_shard(shard);
            OpStatus::Ok
        });
        self.execute(remove, true);
    }

    /// Shard-side registration half of [`Self::wait_on_watch`].
    fn add_to_watched_shard(self: &Arc<Self>, shard: &mut EngineShard) -> OpStatus {
        let sid = shard.shard_id();
        let slot = self.slot(sid);
        debug_assert_eq!(slot.local_mask.load(Ordering::Relaxed) & mask::SUSPENDED_Q, 0);

        let db = self.db_index();
        let args = self.shard_args_in_shard(sid);
        for key in args.iter() {
            shard.add_watched(db, key, self);
        }
        let _ = slot.local_mask.fetch_or(mask::SUSPENDED_Q, Ordering::Relaxed);
        OpStatus::Ok
    }

    /// Shard-side half of [`Self::unregister_watch`]; returns whether anything was removed.
    fn remove_from_watched_shard(self: &Arc<Self>, shard: &mut EngineShard) -> bool {
        let sid = shard.shard_id();
        let slot = self.slot(sid);
        let local_mask = slot.local_mask.load(Ordering::Relaxed);

        const QUEUE_BITS: u16 = mask::SUSPENDED_Q | mask::AWAKED_Q | mask::EXPIRED_Q;
        if (local_mask & QUEUE_BITS) == 0 {
            return false;
        }

        let db = self.db_index();
        let args = self.shard_args_in_shard(sid);
        for key in args.iter() {
            shard.removed_watched(db, key, self);
        }

        // A shard that is still suspended was never woken; the locks from the suspend hop are
        // still held and nothing later in this hop will release them.
        if (local_mask & mask::SUSPENDED_Q) != 0 && (local_mask & mask::KEYLOCK_ACQUIRED) != 0 {
            let largs = self.get_lock_args(sid);
            shard.db_slice_mut().release(self.mode(), &largs);
            let _ = slot
                .local_mask
                .fetch_and(!mask::KEYLOCK_ACQUIRED, Ordering::Relaxed);
        }
        true
    }

    /// Called by shard-side mutators to wake a suspended transaction.
    ///
    /// Returns `false` iff the transaction already expired on this shard. Lowers `notify_txid`
    /// towards the notifying shard's committed txid and signals the waiting coordinator on the
    /// first improvement.
    pub fn notify_suspended(&self, committed_txid: TxId, sid: ShardId) -> bool {
        let slot = self.slot(sid);
        let local_mask = slot.local_mask.load(Ordering::Relaxed);
        trace!(id = %self.debug_id(), local_mask, "notify suspended");

        if (local_mask & mask::EXPIRED_Q) != 0 {
            return false;
        }

        if (local_mask & mask::SUSPENDED_Q) != 0 {
            debug_assert_eq!(local_mask & mask::AWAKED_Q, 0);
            let _ = slot.local_mask.fetch_and(!mask::SUSPENDED_Q, Ordering::Relaxed);
            let _ = slot.local_mask.fetch_or(mask::AWAKED_Q, Ordering::Relaxed);

            let mut current = self.notify_txid.load(Ordering::Relaxed);
            while committed_txid < current {
                match self.notify_txid.compare_exchange_weak(
                    current,
                    committed_txid,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        self.blocking_ec.notify();
                        break;
                    }
                    Err(observed) => current = observed,
                }
            }
            return true;
        }

        debug_assert!((local_mask & mask::AWAKED_Q) != 0);
        true
    }

    /// Cancels a blocking wait; called when the owning connection closes.
    pub fn break_on_close(&self) {
        if self.coord_has(coord::BLOCKED) {
            self.coord_set(coord::CANCELLED);
            self.blocking_ec.notify();
        }
    }

    /// Cross-shard lookup of the first present key, in caller argument order.
    pub fn find_first(self: &Arc<Self>) -> OpResult<FindFirstResult> {
        let processor = FindFirstProcessor::new(
            self.notify_txid.load(Ordering::Relaxed),
            self.shard_set.shard_count().slots(),
        );
        processor.find(self);
        processor.process(self)
    }

    // ---------------------------------------------------------------- internals

    pub(crate) fn clear_awakened_in(&self, sid: ShardId) {
        let _ = self
            .slot(sid)
            .local_mask
            .fetch_and(!mask::AWAKED_Q, Ordering::Relaxed);
    }

    /// Finishes this shard's part of the current hop.
    ///
    /// Callers must hold a strong reference across the call: the coordinator may observe zero
    /// and drop its own handle while the notify is still in flight.
    pub(crate) fn decrease_run_cnt(self: &Arc<Self>) -> u32 {
        let prev = self.run_count.fetch_sub(1, Ordering::Release);
        debug_assert!(prev >= 1);
        if prev == 1 {
            self.run_ec.notify();
        }
        prev
    }

    fn wait_for_shard_callbacks(&self) {
        self.run_ec
            .wait_until(|| self.run_count.load(Ordering::Acquire) == 0);
    }

    fn cid_snapshot(&self) -> CommandId {
        *self.cid.read().expect("command descriptor lock poisoned")
    }

    fn multi_incremental(&self) -> bool {
        self.multi.as_ref().is_some_and(|multi| {
            multi.lock().expect("multi state lock poisoned").incremental
        })
    }

    fn install_callback(&self, callback: ShardCallback) {
        let mut slot = self.cb.lock().expect("callback lock poisoned");
        debug_assert!(slot.is_none(), "previous hop callback not retired");
        *slot = Some(callback);
    }

    fn callback_snapshot(&self) -> ShardCallback {
        self.cb
            .lock()
            .expect("callback lock poisoned")
            .clone()
            .expect("hop callback installed before arming")
    }

    fn clear_callback(&self) {
        *self.cb.lock().expect("callback lock poisoned") = None;
        // Any straggler task from this hop now observes a stale generation and only drains.
        let _ = self.seqlock.fetch_add(1, Ordering::Release);
    }

    fn coord_set(&self, bits: u8) {
        let _ = self.coordinator_state.fetch_or(bits, Ordering::Relaxed);
    }

    fn coord_clear(&self, bits: u8) {
        let _ = self.coordinator_state.fetch_and(!bits, Ordering::Relaxed);
    }

    fn coord_has(&self, bits: u8) -> bool {
        (self.coordinator_state.load(Ordering::Relaxed) & bits) != 0
    }

    /// Returns whether shard `sid` participates in the current statement.
    fn shard_active(&self, sid: ShardId) -> bool {
        if self.is_global() {
            return true;
        }
        if self.unique_shard_cnt.load(Ordering::Relaxed) == 1 {
            return sid == self.unique_shard_id.load(Ordering::Relaxed);
        }
        let index = self.args.read().expect("arg index lock poisoned");
        index
            .slices
            .get(usize::from(sid))
            .is_some_and(|bounds| bounds.count != 0)
    }

    fn ensure_slots(&self, len: usize) {
        let slots = self.slots.get_or_init(|| {
            let mut slots = Vec::with_capacity(len);
            slots.resize_with(len, ShardSlot::default);
            slots.into_boxed_slice()
        });
        debug_assert_eq!(slots.len(), len, "slot layout is sized exactly once");
    }

    fn slot(&self, sid: ShardId) -> &ShardSlot {
        let slots = self.slots.get().expect("shard slots sized by init_by_args");
        let index = if slots.len() == 1 { 0 } else { usize::from(sid) };
        &slots[index]
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.debug_id())
            .field("state", &self.coordinator_state())
            .finish_non_exhaustive()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        trace!(txid = *self.txid.get_mut(), "transaction destroyed");
    }
}
