//! Await/notify primitive used by the coordinator barriers.

use std::sync::{Condvar, Mutex};
use std::time::Instant;

/// Condition-variable wrapper with the await/notify shape the coordinator needs.
///
/// Waiters re-check a predicate over state published through atomics. The notifier takes the
/// internal mutex before signalling, so a notify that races with the gap between a waiter's
/// predicate check and its park cannot be lost.
#[derive(Debug, Default)]
pub struct EventCount {
    mu: Mutex<()>,
    cond: Condvar,
}

impl EventCount {
    /// Wakes every current waiter. Callers must update the awaited state before notifying.
    pub fn notify(&self) {
        let _guard = self.mu.lock().expect("event count mutex poisoned");
        self.cond.notify_all();
    }

    /// Blocks the calling thread until `ready` returns true.
    pub fn wait_until(&self, mut ready: impl FnMut() -> bool) {
        let mut guard = self.mu.lock().expect("event count mutex poisoned");
        while !ready() {
            guard = self.cond.wait(guard).expect("event count mutex poisoned");
        }
    }

    /// Blocks until `ready` returns true or `deadline` passes.
    ///
    /// Returns `false` iff the deadline expired with `ready` still false.
    pub fn wait_until_deadline(&self, mut ready: impl FnMut() -> bool, deadline: Instant) -> bool {
        let mut guard = self.mu.lock().expect("event count mutex poisoned");
        while !ready() {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return false;
            };
            let (next, timeout) = self
                .cond
                .wait_timeout(guard, remaining)
                .expect("event count mutex poisoned");
            guard = next;
            if timeout.timed_out() && !ready() {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::EventCount;
    use googletest::prelude::*;
    use rstest::rstest;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::{Duration, Instant};

    #[rstest]
    fn wait_until_observes_state_published_before_notify() {
        let ec = Arc::new(EventCount::default());
        let flag = Arc::new(AtomicBool::new(false));

        let waiter = {
            let ec = Arc::clone(&ec);
            let flag = Arc::clone(&flag);
            std::thread::spawn(move || ec.wait_until(|| flag.load(Ordering::Acquire)))
        };

        flag.store(true, Ordering::Release);
        ec.notify();
        waiter.join().expect("waiter must finish");
        assert_that!(flag.load(Ordering::Acquire), eq(true));
    }

    #[rstest]
    fn deadline_wait_reports_expiry() {
        let ec = EventCount::default();
        let deadline = Instant::now() + Duration::from_millis(20);
        let woken = ec.wait_until_deadline(|| false, deadline);
        assert_that!(woken, eq(false));
    }

    #[rstest]
    fn deadline_wait_returns_immediately_when_ready() {
        let ec = EventCount::default();
        let deadline = Instant::now() + Duration::from_secs(5);
        let woken = ec.wait_until_deadline(|| true, deadline);
        assert_that!(woken, eq(true));
    }
}
