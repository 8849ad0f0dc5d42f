//! Parking primitive shared by the CPU workers of one scheduler.
//!
//! An idle worker calls [`MpmcWaiter::wait`] in a loop, threading a
//! `yields` counter through it. The first `spin_rounds` calls just yield.
//! On the next one the worker tries to become the single "sleepy"
//! candidate; while it stays sleepy it keeps yielding until `sleep_rounds`,
//! then parks on the condition variable. Producers call
//! [`MpmcWaiter::notify`], which is a single load unless someone is sleepy
//! or asleep. A worker that found work calls [`MpmcWaiter::stop_wait`].
//!
//! Parking is bounded by a timeout so a missed wakeup costs at most one
//! `park_timeout`.

use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::thread;
use std::time::Duration;

const AWAKE: u32 = 0;
const ASLEEP: u32 = 1;

fn has_worker(state: u32) -> bool {
    (state >> 1) != 0
}

fn with_worker(state: u32, worker: u32) -> u32 {
    state | ((worker + 1) << 1)
}

fn still_sleepy(state: u32, worker: u32) -> bool {
    (state >> 1) == worker + 1
}

/// See the module docs.
#[derive(Debug)]
pub struct MpmcWaiter {
    state: AtomicU32,
    mutex: Mutex<()>,
    cond: Condvar,
    spin_rounds: u32,
    sleep_rounds: u32,
    park_timeout: Duration,
    parks: AtomicU64,
}

impl MpmcWaiter {
    /// # Panics
    ///
    /// Panics unless `spin_rounds < sleep_rounds`.
    #[must_use]
    pub fn new(spin_rounds: u32, sleep_rounds: u32, park_timeout: Duration) -> Self {
        assert!(spin_rounds < sleep_rounds, "spin rounds must precede sleep rounds");
        Self {
            state: AtomicU32::new(AWAKE),
            mutex: Mutex::new(()),
            cond: Condvar::new(),
            spin_rounds,
            sleep_rounds,
            park_timeout,
            parks: AtomicU64::new(0),
        }
    }

    /// One idle round for `worker_id`; returns the next `yields` value.
    pub fn wait(&self, yields: u32, worker_id: u32) -> u32 {
        if yields < self.spin_rounds {
            thread::yield_now();
            return yields + 1;
        }
        if yields == self.spin_rounds {
            let state = self.state.load(Ordering::Relaxed);
            if !has_worker(state) {
                match self.state.compare_exchange(
                    state,
                    with_worker(state, worker_id),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        thread::yield_now();
                        return yields + 1;
                    }
                    Err(AWAKE) => return 0,
                    Err(_) => {}
                }
            }
            thread::yield_now();
            return 0;
        }
        if yields < self.sleep_rounds {
            let state = self.state.load(Ordering::Acquire);
            if still_sleepy(state, worker_id) {
                thread::yield_now();
                return yields + 1;
            }
            return 0;
        }

        let state = self.state.load(Ordering::Acquire);
        if still_sleepy(state, worker_id) {
            let guard = match self.mutex.lock() {
                Ok(g) => g,
                Err(e) => e.into_inner(),
            };
            if self
                .state
                .compare_exchange(state, ASLEEP, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.parks.fetch_add(1, Ordering::Relaxed);
                let _ = self.cond.wait_timeout(guard, self.park_timeout);
            }
        }
        0
    }

    /// Called by a worker that found work after `yields` idle rounds.
    pub fn stop_wait(&self, yields: u32, _worker_id: u32) -> u32 {
        if yields > self.spin_rounds {
            self.notify_cold();
        }
        0
    }

    /// Wakes the sleepy or sleeping worker, if any.
    pub fn notify(&self) {
        fence(Ordering::SeqCst);
        if self.state.load(Ordering::Acquire) == AWAKE {
            return;
        }
        self.notify_cold();
    }

    fn notify_cold(&self) {
        let old = self.state.swap(AWAKE, Ordering::Release);
        // A parked worker may coexist with a newer sleepy candidate.
        if old & ASLEEP != 0 {
            let _guard = match self.mutex.lock() {
                Ok(g) => g,
                Err(e) => e.into_inner(),
            };
            self.cond.notify_all();
        }
    }

    /// Times a worker actually parked on the condition variable.
    #[must_use]
    pub fn parks(&self) -> u64 {
        self.parks.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn spins_then_becomes_sleepy_then_parks() {
        let waiter = MpmcWaiter::new(2, 4, Duration::from_millis(1));
        let mut yields = 0;
        yields = waiter.wait(yields, 0);
        yields = waiter.wait(yields, 0);
        assert_eq!(yields, 2);
        yields = waiter.wait(yields, 0);
        assert_eq!(yields, 3, "first candidate becomes sleepy");
        assert!(still_sleepy(waiter.state.load(Ordering::Relaxed), 0));
        yields = waiter.wait(yields, 0);
        assert_eq!(yields, 4);
        yields = waiter.wait(yields, 0);
        assert_eq!(yields, 0);
        assert_eq!(waiter.parks(), 1);
    }

    #[test]
    fn second_candidate_does_not_become_sleepy() {
        let waiter = MpmcWaiter::new(1, 3, Duration::from_millis(1));
        let a = waiter.wait(1, 0);
        assert_eq!(a, 2);
        assert_eq!(waiter.wait(1, 1), 0);
        assert_eq!(waiter.wait(2, 1), 0);
    }

    #[test]
    fn notify_resets_sleepy_candidate() {
        let waiter = MpmcWaiter::new(0, 2, Duration::from_millis(1));
        assert_eq!(waiter.wait(0, 3), 1);
        waiter.notify();
        assert_eq!(waiter.state.load(Ordering::Relaxed), AWAKE);
        assert_eq!(waiter.wait(1, 3), 0);
    }

    #[test]
    fn notify_wakes_parked_worker() {
        let waiter = Arc::new(MpmcWaiter::new(0, 1, Duration::from_secs(5)));
        let woke = Arc::new(AtomicBool::new(false));
        let handle = {
            let waiter = Arc::clone(&waiter);
            let woke = Arc::clone(&woke);
            thread::spawn(move || {
                let start = Instant::now();
                let mut yields = 0;
                while waiter.parks() == 0 {
                    yields = waiter.wait(yields, 0);
                }
                woke.store(true, Ordering::Release);
                start.elapsed()
            })
        };
        while waiter.state.load(Ordering::Acquire) != ASLEEP {
            thread::yield_now();
        }
        waiter.notify();
        let elapsed = handle.join().unwrap();
        assert!(woke.load(Ordering::Acquire));
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn notify_wakes_parked_worker_behind_a_sleepy_one() {
        let waiter = Arc::new(MpmcWaiter::new(1, 2, Duration::from_secs(3)));
        let parked = {
            let waiter = Arc::clone(&waiter);
            thread::spawn(move || {
                let mut yields = waiter.wait(0, 0);
                yields = waiter.wait(yields, 0);
                assert_eq!(yields, 2);
                assert_eq!(waiter.wait(yields, 0), 0);
                Instant::now()
            })
        };
        while waiter.parks() == 0 || waiter.state.load(Ordering::Acquire) != ASLEEP {
            thread::yield_now();
        }

        let yields = waiter.wait(0, 1);
        assert_eq!(waiter.wait(yields, 1), 2);
        assert_eq!(waiter.state.load(Ordering::Acquire), with_worker(ASLEEP, 1));

        let notified = Instant::now();
        waiter.notify();
        let woke = parked.join().unwrap();
        assert!(woke.saturating_duration_since(notified) < Duration::from_millis(500));
        assert_eq!(waiter.state.load(Ordering::Acquire), AWAKE);
    }
}
