//! End-to-end coordinator scenarios: fast paths, ordering, batches, blocking and wake-up.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::channel;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use googletest::prelude::*;
use rstest::rstest;
use shoal_common::config::CoordinatorConfig;
use shoal_common::ids::{ShardId, TxId};
use shoal_core::command::{CommandId, opt};
use shoal_core::sharding::key_shard;
use shoal_core::status::OpStatus;

use crate::engine_shard::EngineShard;
use crate::shard_set::ShardSet;
use crate::transaction::{ShardCallback, Transaction, coord, mask};

// ---------------------------------------------------------------------- fixtures

const SET: CommandId = CommandId::new("SET", opt::WRITE, 1, 1, 1);
const GET: CommandId = CommandId::new("GET", opt::READONLY, 1, 1, 1);
const MGET: CommandId = CommandId::new("MGET", opt::READONLY, 1, -1, 1);
const MSET: CommandId = CommandId::new("MSET", opt::WRITE, 1, -1, 2);
const RPUSH: CommandId = CommandId::new("RPUSH", opt::WRITE, 1, 1, 1);
const BLPOP: CommandId = CommandId::new("BLPOP", opt::WRITE | opt::BLOCKING, 1, -2, 1);
const EXEC: CommandId = CommandId::new("EXEC", opt::GLOBAL_TRANS, 0, 0, 1);
const EVAL: CommandId = CommandId::new("EVAL", opt::WRITE | opt::VARIADIC_KEYS, 3, 0, 1);

fn shard_set(shards: u16) -> Arc<ShardSet> {
    ShardSet::new(&CoordinatorConfig {
        shard_count: shoal_common::ids::ShardCount::new(shards).expect("literal is valid"),
    })
}

fn arg_vec(parts: &[&[u8]]) -> Vec<Vec<u8>> {
    parts.iter().map(|part| part.to_vec()).collect()
}

/// Finds a key that hashes to `target` under the set's shard count.
fn key_for_shard(set: &Arc<ShardSet>, target: ShardId, tag: &str) -> Vec<u8> {
    let count = set.shard_count();
    (0..u32::MAX)
        .map(|i| format!("{tag}-{i}").into_bytes())
        .find(|key| key_shard(key, count) == target)
        .expect("every shard owns some key")
}

/// Runs `probe` on shard `sid`'s worker and returns its result.
fn on_shard<T: Send + 'static>(
    set: &Arc<ShardSet>,
    sid: ShardId,
    probe: impl FnOnce(&mut EngineShard) -> T + Send + 'static,
) -> T {
    let (sender, receiver) = channel();
    set.submit(sid, move |shard| {
        sender.send(probe(shard)).expect("probe receiver alive");
    });
    receiver.recv().expect("probe completed")
}

/// Callback writing `value` under the transaction's single key.
fn set_callback(value: &[u8]) -> ShardCallback {
    let value = value.to_vec();
    Arc::new(move |tx, shard| {
        let args = tx.shard_args_in_shard(shard.shard_id());
        let key = args.get(0).to_vec();
        shard.db_slice_mut().set(tx.db_index(), &key, value.clone());
        OpStatus::Ok
    })
}

/// Callback applying every key/value pair of the shard's slice.
fn mset_callback() -> ShardCallback {
    Arc::new(|tx, shard| {
        let args = tx.shard_args_in_shard(shard.shard_id());
        let mut index = 0;
        while index < args.len() {
            let key = args.get(index).to_vec();
            let value = args.get(index + 1).to_vec();
            shard.db_slice_mut().set(tx.db_index(), &key, value);
            index += 2;
        }
        OpStatus::Ok
    })
}

/// Callback pushing `value` onto the single list key and waking its watchers.
fn rpush_callback(value: &[u8]) -> ShardCallback {
    let value = value.to_vec();
    Arc::new(move |tx, shard| {
        let args = tx.shard_args_in_shard(shard.shard_id());
        let key = args.get(0).to_vec();
        let db = tx.db_index();
        let _ = shard
            .db_slice_mut()
            .rpush(db, &key, vec![value.clone()])
            .expect("fresh list key");
        shard.awake_watched(db, &key);
        OpStatus::Ok
    })
}

// ---------------------------------------------------------------------- fast paths

#[rstest]
fn single_key_set_takes_the_quickie_path() {
    let set = shard_set(4);
    let tx = Transaction::new(&SET, &set);
    tx.init_by_args(0, &arg_vec(&[b"SET", b"a", b"v"]))
        .expect("layout is valid");

    assert_that!(tx.unique_shard_cnt(), eq(1_u32));
    let sid = tx.unique_shard_id();

    let status = tx.schedule_single_hop(set_callback(b"v"));
    assert_that!(status, eq(OpStatus::Ok));

    // The uncontended path never allocates a txid or touches the queue.
    assert_that!(tx.txid(), eq(0_u64));
    assert_that!(tx.run_count(), eq(0_u32));

    let (quick_runs, queue_len, stored) = on_shard(&set, sid, |shard| {
        (
            shard.stats().quick_runs,
            shard.txq().len(),
            shard.db_slice().get(0, b"a"),
        )
    });
    assert_that!(quick_runs, eq(1_u64));
    assert_that!(queue_len, eq(0_usize));
    assert_that!(stored, eq(&Ok(b"v".to_vec())));
}

#[rstest]
fn multi_shard_read_runs_out_of_order_and_releases() {
    let set = shard_set(4);
    let k0 = key_for_shard(&set, 0, "m");
    let k1 = key_for_shard(&set, 1, "m");
    let k3 = key_for_shard(&set, 3, "m");

    let tx = Transaction::new(&MGET, &set);
    let full = arg_vec(&[b"MGET", &k0, &k1, &k3]);
    tx.init_by_args(0, &full).expect("layout is valid");
    assert_that!(tx.unique_shard_cnt(), eq(3_u32));

    // Each shard records (shard, original key index, key) for the fan-in checks below.
    let hits: Arc<Mutex<Vec<(ShardId, usize, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&hits);
    let callback: ShardCallback = Arc::new(move |tx, shard| {
        let sid = shard.shard_id();
        let args = tx.shard_args_in_shard(sid);
        let mut guard = sink.lock().expect("hit log");
        for (index, key) in args.iter().enumerate() {
            guard.push((sid, tx.reverse_arg_index(sid, index), key.to_vec()));
        }
        OpStatus::Ok
    });

    let status = tx.schedule_single_hop(callback);
    assert_that!(status, eq(OpStatus::Ok));
    assert_that!(tx.txid() > 0, eq(true));
    // Nothing contended, so the whole hop was granted out-of-order eligibility.
    assert_that!(tx.is_out_of_order(), eq(true));
    assert_that!(tx.run_count(), eq(0_u32));

    let hits = hits.lock().expect("hit log");
    assert_that!(hits.len(), eq(3_usize));
    let count = set.shard_count();
    for (sid, original, key) in hits.iter() {
        assert_that!(key_shard(key, count), eq(*sid));
        assert_that!(&full[original + 1], eq(key));
    }

    for (sid, key) in [(0, &k0), (1, &k1), (3, &k3)] {
        let key = key.clone();
        let holders = on_shard(&set, sid, move |shard| shard.db_slice().lock_holders(0, &key));
        assert_that!(holders, eq((0_u32, 0_u32)));
    }
}

// ---------------------------------------------------------------------- layout

#[rstest]
fn init_by_args_partitions_and_preserves_reverse_mapping() {
    let set = shard_set(4);
    let keys = [
        key_for_shard(&set, 0, "p"),
        key_for_shard(&set, 1, "p"),
        key_for_shard(&set, 2, "p"),
        key_for_shard(&set, 3, "p"),
        key_for_shard(&set, 0, "q"),
    ];
    let mut full = vec![b"MGET".to_vec()];
    full.extend(keys.iter().cloned());

    let tx = Transaction::new(&MGET, &set);
    tx.init_by_args(0, &full).expect("layout is valid");
    assert_that!(tx.unique_shard_cnt(), eq(4_u32));

    let count = set.shard_count();
    let mut seen = HashSet::new();
    for sid in count.ids() {
        let args = tx.shard_args_in_shard(sid);
        for (index, key) in args.iter().enumerate() {
            assert_that!(key_shard(key, count), eq(sid));
            let original = tx.reverse_arg_index(sid, index);
            assert_that!(&full[original + 1], eq(&key.to_vec()));
            let _ = seen.insert(original);
        }
    }
    assert_that!(seen, eq(&HashSet::from([0_usize, 1, 2, 3, 4])));
}

#[rstest]
fn step_two_layout_keeps_values_next_to_their_keys() {
    let set = shard_set(4);
    let ka = key_for_shard(&set, 0, "s");
    let kb = key_for_shard(&set, 2, "s");

    let tx = Transaction::new(&MSET, &set);
    let full = arg_vec(&[b"MSET", &ka, b"1", &kb, b"2"]);
    tx.init_by_args(0, &full).expect("layout is valid");
    assert_that!(tx.unique_shard_cnt(), eq(2_u32));

    for (sid, key, value) in [(0, &ka, b"1"), (2, &kb, b"2")] {
        let args = tx.shard_args_in_shard(sid);
        assert_that!(args.len(), eq(2_usize));
        assert_that!(args.get(0), eq(key.as_slice()));
        assert_that!(args.get(1), eq(value.as_slice()));
        // The value's original index directly follows its key's.
        assert_that!(
            tx.reverse_arg_index(sid, 1),
            eq(tx.reverse_arg_index(sid, 0) + 1)
        );
    }
}

// ---------------------------------------------------------------------- contention

#[rstest]
fn contended_transaction_drains_without_rescheduling() {
    let set = shard_set(2);
    let key = key_for_shard(&set, 0, "c");
    let order: Arc<Mutex<Vec<TxId>>> = Arc::new(Mutex::new(Vec::new()));

    let first = Transaction::new(&SET, &set);
    first
        .init_by_args(0, &arg_vec(&[b"SET", &key, b"v"]))
        .expect("layout is valid");
    first.schedule();

    let second = Transaction::new(&SET, &set);
    second
        .init_by_args(0, &arg_vec(&[b"SET", &key, b"w"]))
        .expect("layout is valid");
    second.schedule();

    assert_that!(first.txid() < second.txid(), eq(true));
    let second_txid = second.txid();

    let log_callback = |order: &Arc<Mutex<Vec<TxId>>>, value: &'static [u8]| -> ShardCallback {
        let order = Arc::clone(order);
        let value = value.to_vec();
        Arc::new(move |tx, shard| {
            let args = tx.shard_args_in_shard(shard.shard_id());
            let key = args.get(0).to_vec();
            shard.db_slice_mut().set(tx.db_index(), &key, value.clone());
            order.lock().expect("order log").push(tx.txid());
            OpStatus::Ok
        })
    };

    // The later transaction's hop arrives first; it must wait in the queue for the earlier
    // one to conclude, then run without a fresh scheduling round.
    let waiter = {
        let second = Arc::clone(&second);
        let callback = log_callback(&order, b"w");
        std::thread::spawn(move || second.execute(callback, true))
    };
    first.execute(log_callback(&order, b"v"), true);
    waiter.join().expect("second transaction finished");

    assert_that!(second.txid(), eq(second_txid));
    assert_that!(*order.lock().expect("order log"), eq(&vec![first.txid(), second_txid]));

    let probe_key = key.clone();
    let (holders, stored) = on_shard(&set, 0, move |shard| {
        (
            shard.db_slice().lock_holders(0, &probe_key),
            shard.db_slice().get(0, &probe_key),
        )
    });
    assert_that!(holders, eq((0_u32, 0_u32)));
    assert_that!(stored, eq(&Ok(b"w".to_vec())));
}

// ---------------------------------------------------------------------- batches

#[rstest]
fn exec_batch_releases_exactly_the_recorded_locks() {
    let set = shard_set(4);
    let x = key_for_shard(&set, 0, "x");
    let y = key_for_shard(&set, 1, "y");

    let tx = Transaction::new(&EXEC, &set);
    assert_that!(tx.is_multi(), eq(true));

    // Statement 1: SET x.
    tx.set_exec_cmd(&SET);
    tx.init_by_args(0, &arg_vec(&[b"SET", &x, b"1"]))
        .expect("layout is valid");
    assert_that!(tx.schedule_single_hop(set_callback(b"1")), eq(OpStatus::Ok));

    // Statement 2: GET y.
    tx.set_exec_cmd(&GET);
    tx.init_by_args(0, &arg_vec(&[b"GET", &y]))
        .expect("layout is valid");
    let read: ShardCallback = Arc::new(|tx, shard| {
        let args = tx.shard_args_in_shard(shard.shard_id());
        let _ = shard.db_slice().get(tx.db_index(), args.get(0));
        OpStatus::Ok
    });
    assert_that!(tx.schedule_single_hop(read), eq(OpStatus::Ok));

    // Statement 3: SET x again.
    tx.set_exec_cmd(&SET);
    tx.init_by_args(0, &arg_vec(&[b"SET", &x, b"2"]))
        .expect("layout is valid");
    assert_that!(tx.schedule_single_hop(set_callback(b"2")), eq(OpStatus::Ok));

    // Incremental locking recorded two exclusive holders of x and one shared holder of y.
    let probe_x = x.clone();
    let x_holders = on_shard(&set, 0, move |shard| shard.db_slice().lock_holders(0, &probe_x));
    assert_that!(x_holders, eq((0_u32, 2_u32)));
    let probe_y = y.clone();
    let y_holders = on_shard(&set, 1, move |shard| shard.db_slice().lock_holders(0, &probe_y));
    assert_that!(y_holders, eq((1_u32, 0_u32)));

    // The batch was scheduled globally: untouched shards still carry its queue entry and
    // coarse lock until the unlock sweep.
    let parked = on_shard(&set, 3, |shard| {
        (shard.txq().len(), shard.shard_lock().is_free())
    });
    assert_that!(parked, eq((1_usize, false)));

    tx.unlock_multi();

    for sid in set.shard_count().ids() {
        let x = x.clone();
        let y = y.clone();
        let (x_holders, y_holders, queue_len, shard_free) = on_shard(&set, sid, move |shard| {
            (
                shard.db_slice().lock_holders(0, &x),
                shard.db_slice().lock_holders(0, &y),
                shard.txq().len(),
                shard.shard_lock().is_free(),
            )
        });
        assert_that!(x_holders, eq((0_u32, 0_u32)));
        assert_that!(y_holders, eq((0_u32, 0_u32)));
        assert_that!(queue_len, eq(0_usize));
        assert_that!(shard_free, eq(true));
    }

    let probe_x = x.clone();
    let stored = on_shard(&set, 0, move |shard| shard.db_slice().get(0, &probe_x));
    assert_that!(stored, eq(&Ok(b"2".to_vec())));
}

#[rstest]
fn eval_batch_locks_all_keys_up_front() {
    let set = shard_set(4);
    let k0 = key_for_shard(&set, 0, "e");
    let k1 = key_for_shard(&set, 1, "e");

    let tx = Transaction::new(&EVAL, &set);
    tx.init_by_args(0, &arg_vec(&[b"EVAL", b"return 1", b"2", &k0, &k1]))
        .expect("layout is valid");
    assert_that!(tx.unique_shard_cnt(), eq(2_u32));
    tx.schedule();

    // Scheduling took every script key in one sweep.
    for (sid, key) in [(0, &k0), (1, &k1)] {
        let key = key.clone();
        let holders = on_shard(&set, sid, move |shard| shard.db_slice().lock_holders(0, &key));
        assert_that!(holders, eq((0_u32, 1_u32)));
    }

    // An inner statement neither re-acquires nor releases.
    tx.set_exec_cmd(&GET);
    tx.init_by_args(0, &arg_vec(&[b"GET", &k0]))
        .expect("layout is valid");
    let read: ShardCallback = Arc::new(|tx, shard| {
        let args = tx.shard_args_in_shard(shard.shard_id());
        let _ = shard.db_slice().get(tx.db_index(), args.get(0));
        OpStatus::Ok
    });
    assert_that!(tx.schedule_single_hop(read), eq(OpStatus::Ok));

    let probe = k0.clone();
    let holders = on_shard(&set, 0, move |shard| shard.db_slice().lock_holders(0, &probe));
    assert_that!(holders, eq((0_u32, 1_u32)));

    tx.unlock_multi();
    for (sid, key) in [(0, &k0), (1, &k1)] {
        let key = key.clone();
        let holders = on_shard(&set, sid, move |shard| shard.db_slice().lock_holders(0, &key));
        assert_that!(holders, eq((0_u32, 0_u32)));
    }
}

// ---------------------------------------------------------------------- blocking

#[rstest]
fn blocking_pop_is_woken_by_a_concurrent_push() {
    let set = shard_set(4);
    let key = key_for_shard(&set, 1, "b");

    let blocking = Transaction::new(&BLPOP, &set);
    blocking
        .init_by_args(0, &arg_vec(&[b"BLPOP", &key, b"0"]))
        .expect("layout is valid");
    assert_that!(blocking.unique_shard_cnt(), eq(1_u32));
    blocking.schedule();

    let popped: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));
    let waiter = {
        let blocking = Arc::clone(&blocking);
        let popped = Arc::clone(&popped);
        std::thread::spawn(move || {
            if !blocking.wait_on_watch(Some(Instant::now() + Duration::from_secs(5))) {
                return false;
            }
            let found = blocking.find_first().expect("the wake-up left a value");
            let found_sid = found.sid;
            let found_key = found.key;
            let sink = Arc::clone(&popped);
            let retrieve: ShardCallback = Arc::new(move |tx, shard| {
                if shard.shard_id() == found_sid {
                    let value = shard
                        .db_slice_mut()
                        .lpop(tx.db_index(), &found_key)
                        .expect("pushed value still present");
                    *sink.lock().expect("popped slot") = Some(value);
                }
                OpStatus::Ok
            });
            blocking.execute(retrieve, true);
            true
        })
    };

    // The pusher contends on the suspended transaction's lock, so it serializes through the
    // queue strictly after the suspension hop.
    let pusher = Transaction::new(&RPUSH, &set);
    pusher
        .init_by_args(0, &arg_vec(&[b"RPUSH", &key, b"payload"]))
        .expect("layout is valid");
    assert_that!(
        pusher.schedule_single_hop(rpush_callback(b"payload")),
        eq(OpStatus::Ok)
    );

    assert_that!(waiter.join().expect("waiter finished"), eq(true));
    assert_that!(
        popped.lock().expect("popped slot").clone(),
        eq(&Some(b"payload".to_vec()))
    );

    // The wake-up carried the pusher's commit position.
    assert_that!(blocking.notify_txid(), eq(pusher.txid()));
    assert_that!(blocking.run_count(), eq(0_u32));

    let probe = key.clone();
    let (holders, watchers) = on_shard(&set, 1, move |shard| {
        (
            shard.db_slice().lock_holders(0, &probe),
            shard.watched_count(0, &probe),
        )
    });
    assert_that!(holders, eq((0_u32, 0_u32)));
    assert_that!(watchers, eq(0_usize));
}

#[rstest]
fn blocking_pop_times_out_and_releases_its_locks() {
    let set = shard_set(4);
    let key = key_for_shard(&set, 2, "t");

    let blocking = Transaction::new(&BLPOP, &set);
    blocking
        .init_by_args(0, &arg_vec(&[b"BLPOP", &key, b"0"]))
        .expect("layout is valid");
    blocking.schedule();

    let woken = blocking.wait_on_watch(Some(Instant::now() + Duration::from_millis(50)));
    assert_that!(woken, eq(false));

    let sid = blocking.unique_shard_id();
    assert_that!(blocking.local_mask(sid) & mask::EXPIRED_Q, eq(mask::EXPIRED_Q));

    let probe = key.clone();
    let (holders, watchers) = on_shard(&set, sid, move |shard| {
        (
            shard.db_slice().lock_holders(0, &probe),
            shard.watched_count(0, &probe),
        )
    });
    assert_that!(holders, eq((0_u32, 0_u32)));
    assert_that!(watchers, eq(0_usize));
}

#[rstest]
fn close_cancels_a_blocking_wait() {
    let set = shard_set(2);
    let key = key_for_shard(&set, 0, "k");

    let blocking = Transaction::new(&BLPOP, &set);
    blocking
        .init_by_args(0, &arg_vec(&[b"BLPOP", &key, b"0"]))
        .expect("layout is valid");
    blocking.schedule();

    let waiter = {
        let blocking = Arc::clone(&blocking);
        std::thread::spawn(move || blocking.wait_on_watch(None))
    };

    while blocking.coordinator_state() & coord::BLOCKED == 0 {
        std::thread::sleep(Duration::from_millis(1));
    }
    blocking.break_on_close();

    assert_that!(waiter.join().expect("waiter finished"), eq(false));
    assert_that!(
        blocking.coordinator_state() & coord::CANCELLED,
        eq(coord::CANCELLED)
    );

    let probe = key.clone();
    let holders = on_shard(&set, 0, move |shard| shard.db_slice().lock_holders(0, &probe));
    assert_that!(holders, eq((0_u32, 0_u32)));
}

#[rstest]
fn multi_shard_wake_converges_every_participant() {
    let set = shard_set(2);
    let k0 = key_for_shard(&set, 0, "w");
    let k1 = key_for_shard(&set, 1, "w");

    let blocking = Transaction::new(&BLPOP, &set);
    blocking
        .init_by_args(0, &arg_vec(&[b"BLPOP", &k0, &k1, b"0"]))
        .expect("layout is valid");
    assert_that!(blocking.unique_shard_cnt(), eq(2_u32));
    blocking.schedule();

    let popped: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));
    let waiter = {
        let blocking = Arc::clone(&blocking);
        let popped = Arc::clone(&popped);
        std::thread::spawn(move || {
            if !blocking.wait_on_watch(Some(Instant::now() + Duration::from_secs(5))) {
                return false;
            }
            let found = blocking.find_first().expect("the wake-up left a value");
            let found_sid = found.sid;
            let found_key = found.key;
            let sink = Arc::clone(&popped);
            let retrieve: ShardCallback = Arc::new(move |tx, shard| {
                if shard.shard_id() == found_sid {
                    let value = shard
                        .db_slice_mut()
                        .lpop(tx.db_index(), &found_key)
                        .expect("pushed value still present");
                    *sink.lock().expect("popped slot") = Some(value);
                }
                OpStatus::Ok
            });
            blocking.execute(retrieve, true);
            blocking.unregister_watch();
            true
        })
    };

    let pusher = Transaction::new(&RPUSH, &set);
    pusher
        .init_by_args(0, &arg_vec(&[b"RPUSH", &k0, b"woke"]))
        .expect("layout is valid");
    assert_that!(
        pusher.schedule_single_hop(rpush_callback(b"woke")),
        eq(OpStatus::Ok)
    );

    // Traffic on the other shard carries its committed txid past the waking point, releasing
    // the convergence pass.
    let filler = Transaction::new(&SET, &set);
    filler
        .init_by_args(0, &arg_vec(&[b"SET", &k1, b"f"]))
        .expect("layout is valid");
    assert_that!(filler.schedule_single_hop(set_callback(b"f")), eq(OpStatus::Ok));

    assert_that!(waiter.join().expect("waiter finished"), eq(true));
    assert_that!(
        popped.lock().expect("popped slot").clone(),
        eq(&Some(b"woke".to_vec()))
    );

    let notify = blocking.notify_txid();
    assert_that!(notify, eq(pusher.txid()));
    for sid in set.shard_count().ids() {
        let committed = on_shard(&set, sid, |shard| shard.committed_txid());
        assert_that!(committed >= notify, eq(true));
    }

    for (sid, key) in [(0, &k0), (1, &k1)] {
        let key = key.clone();
        let (holders, watchers) = on_shard(&set, sid, move |shard| {
            (
                shard.db_slice().lock_holders(0, &key),
                shard.watched_count(0, &key),
            )
        });
        assert_that!(holders, eq((0_u32, 0_u32)));
        assert_that!(watchers, eq(0_usize));
    }
}

// ---------------------------------------------------------------------- randomized schedules

#[rstest]
fn concurrent_transactions_keep_per_shard_txid_order() {
    const THREADS: u64 = 6;
    const ROUNDS: u64 = 25;

    let set = shard_set(4);
    let shard_logs: Arc<Vec<Mutex<Vec<(TxId, bool)>>>> =
        Arc::new((0..4).map(|_| Mutex::new(Vec::new())).collect());
    let keys: Arc<Vec<Vec<u8>>> = Arc::new(
        (0..8)
            .map(|i| format!("pool-{i}").into_bytes())
            .collect(),
    );
    let seq = Arc::new(AtomicU64::new(0));

    let mut workers = Vec::new();
    for _ in 0..THREADS {
        let set = Arc::clone(&set);
        let shard_logs = Arc::clone(&shard_logs);
        let keys = Arc::clone(&keys);
        let seq = Arc::clone(&seq);
        workers.push(std::thread::spawn(move || {
            for _ in 0..ROUNDS {
                let round = seq.fetch_add(1, Ordering::Relaxed);
                let first = &keys[usize::try_from(round % 8).expect("index fits")];
                let second = &keys[usize::try_from((round / 3 + 1 + round % 7) % 8)
                    .expect("index fits")];
                if first == second {
                    continue;
                }

                let tx = Transaction::new(&MSET, &set);
                let full = arg_vec(&[b"MSET", first, b"a", second, b"b"]);
                tx.init_by_args(0, &full).expect("layout is valid");

                let logs = Arc::clone(&shard_logs);
                let callback: ShardCallback = Arc::new(move |tx, shard| {
                    let sid = shard.shard_id();
                    let args = tx.shard_args_in_shard(sid);
                    let mut index = 0;
                    while index < args.len() {
                        let key = args.get(index).to_vec();
                        let value = args.get(index + 1).to_vec();
                        shard.db_slice_mut().set(tx.db_index(), &key, value);
                        index += 2;
                    }
                    let out_of_order = (tx.local_mask(sid) & mask::OUT_OF_ORDER) != 0;
                    logs[usize::from(sid)]
                        .lock()
                        .expect("shard log")
                        .push((tx.txid(), out_of_order));
                    OpStatus::Ok
                });

                let status = tx.schedule_single_hop(callback);
                assert_that!(status, eq(OpStatus::Ok));
                assert_that!(tx.run_count(), eq(0_u32));
            }
        }));
    }
    for worker in workers {
        worker.join().expect("worker finished");
    }

    // In-order entries (queued, no out-of-order grant) must appear in ascending txid order on
    // every shard; quickies carry txid zero and are unordered by design.
    for log in shard_logs.iter() {
        let log = log.lock().expect("shard log");
        let ordered = log
            .iter()
            .filter(|entry| entry.0 > 0 && !entry.1)
            .map(|entry| entry.0)
            .collect::<Vec<_>>();
        let mut sorted = ordered.clone();
        sorted.sort_unstable();
        assert_that!(ordered, eq(&sorted));
    }

    // No transaction left a lock behind.
    for key in keys.iter() {
        let sid = key_shard(key, set.shard_count());
        let key = key.clone();
        let holders = on_shard(&set, sid, move |shard| shard.db_slice().lock_holders(0, &key));
        assert_that!(holders, eq((0_u32, 0_u32)));
    }
}
