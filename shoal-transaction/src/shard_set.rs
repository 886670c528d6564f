//! The fixed set of shard worker threads and the task barrier between coordinator and shards.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{Sender, channel};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use shoal_common::config::CoordinatorConfig;
use shoal_common::ids::{ShardCount, ShardId};
use shoal_common::sync::EventCount;
use tracing::debug;

use crate::engine_shard::EngineShard;

type ShardTask = Box<dyn FnOnce(&mut EngineShard) + Send + 'static>;

/// Fixed array of single-threaded execution shards.
///
/// Worker `i` exclusively owns [`EngineShard`] `i`; all cross-thread communication happens by
/// submitting tasks here. A submitted task observes everything the submitter wrote before
/// [`ShardSet::submit`], which is the happens-before barrier the coordinator protocol builds on.
pub struct ShardSet {
    senders: Vec<Sender<ShardTask>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shard_count: ShardCount,
}

impl ShardSet {
    /// Spawns one worker thread per shard.
    #[must_use]
    pub fn new(config: &CoordinatorConfig) -> Arc<Self> {
        let count = config.shard_count;
        let mut senders = Vec::with_capacity(count.slots());
        let mut workers = Vec::with_capacity(count.slots());

        for sid in count.ids() {
            let (sender, receiver) = channel::<ShardTask>();
            let handle = std::thread::Builder::new()
                .name(format!("shard-{sid}"))
                .spawn(move || {
                    let mut shard = EngineShard::new(sid);
                    while let Ok(task) = receiver.recv() {
                        task(&mut shard);
                    }
                    debug!(shard = sid, "shard worker drained");
                })
                .expect("spawning a shard worker thread");
            senders.push(sender);
            workers.push(handle);
        }

        Arc::new(Self {
            senders,
            workers: Mutex::new(workers),
            shard_count: count,
        })
    }

    /// Number of shards.
    #[must_use]
    pub fn size(&self) -> u16 {
        self.shard_count.get()
    }

    /// Shard count as the validated newtype.
    #[must_use]
    pub fn shard_count(&self) -> ShardCount {
        self.shard_count
    }

    /// Enqueues `task` on the worker owning shard `sid` and returns immediately.
    pub fn submit(&self, sid: ShardId, task: impl FnOnce(&mut EngineShard) + Send + 'static) {
        self.senders[usize::from(sid)]
            .send(Box::new(task))
            .expect("shard worker is alive for the lifetime of the set");
    }

    /// Runs `task` on every shard matching `active` and blocks until all of them completed.
    pub fn broadcast(
        &self,
        task: impl Fn(&mut EngineShard) + Send + Sync + 'static,
        mut active: impl FnMut(ShardId) -> bool,
    ) {
        let targets = self
            .shard_count
            .ids()
            .filter(|sid| active(*sid))
            .collect::<Vec<_>>();
        if targets.is_empty() {
            return;
        }

        let task = Arc::new(task);
        let pending = Arc::new(AtomicUsize::new(targets.len()));
        let done = Arc::new(EventCount::default());

        for sid in targets {
            let task = Arc::clone(&task);
            let pending = Arc::clone(&pending);
            let done = Arc::clone(&done);
            self.submit(sid, move |shard| {
                task(shard);
                if pending.fetch_sub(1, Ordering::Release) == 1 {
                    done.notify();
                }
            });
        }

        done.wait_until(|| pending.load(Ordering::Acquire) == 0);
    }
}

impl Drop for ShardSet {
    fn drop(&mut self) {
        // Closing the channels lets the workers drain and exit their receive loops.
        self.senders.clear();
        let workers = std::mem::take(
            &mut *self
                .workers
                .lock()
                .expect("shard worker registry poisoned"),
        );
        let current = std::thread::current().id();
        for handle in workers {
            // The final reference can be dropped by a worker-owned task; a worker must not
            // join itself.
            if handle.thread().id() == current {
                continue;
            }
            handle.join().expect("shard worker must not panic");
        }
    }
}

impl std::fmt::Debug for ShardSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardSet")
            .field("shard_count", &self.shard_count)
            .finish_non_exhaustive()
    }
}
