//! Epoch-based memory reclamation.
//!
//! Every thread slot publishes a local epoch: `2 * e` while it is inside a
//! critical section begun during global epoch `e`, and an odd value while
//! idle. Retired nodes go into one of three bags; the global epoch only
//! advances once every slot has been seen idle or on the current epoch,
//! and a slot empties its oldest bag each time it moves to a new epoch.
//!
//! Checking other slots is amortized: [`EpochLocker::lock`] inspects at most
//! one foreign slot every `check_interval` calls.
//!
//! # API
//!
//! - [`EpochReclamation::get_locker`] — claim a slot and return its [`EpochLocker`].
//! - [`EpochLocker::lock`] / [`EpochLocker::unlock`] — enter / leave a critical section.
//! - [`EpochLocker::retire`] — defer dropping a node.
//! - [`EpochLocker::collect`] — try to advance and free without retiring.
//! - [`EpochLocker::retire_sync`] — block until everything this slot retired is freed.

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_utils::CachePadded;

/// Default number of `lock` calls between two foreign-slot checks.
pub const DEFAULT_CHECK_INTERVAL: usize = 30;

const MAX_BAGS: usize = 3;

struct LocalData<T> {
    to_skip: usize,
    checked_thread_i: usize,
    bag_i: usize,
    bags: [Vec<Box<T>>; MAX_BAGS],
}

impl<T> LocalData<T> {
    fn undeleted(&self) -> usize {
        self.bags.iter().map(Vec::len).sum()
    }
}

struct ThreadData<T> {
    epoch: AtomicU64,
    claimed: AtomicBool,
    /// Only touched by the holder of `claimed`.
    local: UnsafeCell<LocalData<T>>,
}

impl<T> ThreadData<T> {
    fn new() -> Self {
        Self {
            epoch: AtomicU64::new(1),
            claimed: AtomicBool::new(false),
            local: UnsafeCell::new(LocalData {
                to_skip: 0,
                checked_thread_i: 0,
                bag_i: 0,
                bags: std::array::from_fn(|_| Vec::new()),
            }),
        }
    }
}

/// Epoch-based reclamation domain for nodes of type `T`.
pub struct EpochReclamation<T> {
    threads: Box<[CachePadded<ThreadData<T>>]>,
    epoch: CachePadded<AtomicU64>,
    check_interval: usize,
}

// SAFETY: Slot-local data is only reached through an `EpochLocker`, and at
// most one locker per slot exists at a time (guarded by `claimed`).
unsafe impl<T: Send> Send for EpochReclamation<T> {}
// SAFETY: See above; shared fields are atomics.
unsafe impl<T: Send> Sync for EpochReclamation<T> {}

impl<T> std::fmt::Debug for EpochReclamation<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpochReclamation")
            .field("threads", &self.threads.len())
            .field("epoch", &self.epoch.load(Ordering::Relaxed))
            .field("check_interval", &self.check_interval)
            .finish_non_exhaustive()
    }
}

impl<T> EpochReclamation<T> {
    #[must_use]
    pub fn new(threads_n: usize) -> Self {
        Self::with_check_interval(threads_n, DEFAULT_CHECK_INTERVAL)
    }

    #[must_use]
    pub fn with_check_interval(threads_n: usize, check_interval: usize) -> Self {
        let threads = (0..threads_n)
            .map(|_| CachePadded::new(ThreadData::new()))
            .collect();
        Self {
            threads,
            epoch: CachePadded::new(AtomicU64::new(1)),
            check_interval,
        }
    }

    /// Claims slot `thread_id`.
    ///
    /// # Panics
    ///
    /// Panics if the slot is out of range or already claimed by a live
    /// locker.
    pub fn get_locker(&self, thread_id: usize) -> EpochLocker<'_, T> {
        assert!(
            thread_id < self.threads.len(),
            "thread id {thread_id} out of range for {} epoch slots",
            self.threads.len()
        );
        let claimed = self.threads[thread_id]
            .claimed
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok();
        assert!(claimed, "epoch slot {thread_id} already has a locker");
        EpochLocker {
            ebr: self,
            thread_id,
            _not_sync: PhantomData,
        }
    }

    /// Retired but not yet freed nodes over all slots not currently held.
    /// Only meaningful once workers are quiescent.
    #[must_use]
    pub fn to_delete_size_unsafe(&self) -> usize {
        self.threads
            .iter()
            .filter(|t| !t.claimed.load(Ordering::Acquire))
            .map(|t| {
                // SAFETY: Unclaimed slots have no locker, so nobody mutates
                // their local data; a racing `get_locker` only reads after
                // the caller stops relying on this value.
                unsafe { (*t.local.get()).undeleted() }
            })
            .sum()
    }

    fn local_epoch_set(data: &ThreadData<T>, local: &mut LocalData<T>, new_epoch: u64) {
        if data.epoch.load(Ordering::Relaxed) / 2 != new_epoch {
            local.checked_thread_i = 0;
            local.to_skip = 0;
            local.bag_i = (local.bag_i + 1) % MAX_BAGS;
            local.bags[local.bag_i].clear();
        }
        data.epoch.store(new_epoch * 2, Ordering::SeqCst);
    }

    /// Inspects one foreign slot; advances the global epoch after a full
    /// pass. Returns `false` when the inspected slot blocks progress.
    fn step_check(&self, data: &ThreadData<T>, local: &mut LocalData<T>) -> bool {
        let epoch = data.epoch.load(Ordering::Relaxed) / 2;
        let checked = self.threads[local.checked_thread_i]
            .epoch
            .load(Ordering::SeqCst);
        if checked % 2 == 1 || checked / 2 == epoch {
            local.checked_thread_i += 1;
            if local.checked_thread_i == self.threads.len() {
                match self.epoch.compare_exchange(
                    epoch,
                    epoch + 1,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                ) {
                    Ok(_) => Self::local_epoch_set(data, local, epoch + 1),
                    Err(actual) => Self::local_epoch_set(data, local, actual),
                }
            }
            return true;
        }
        false
    }
}

/// Exclusive handle on one epoch slot. Dropping it marks the slot idle and
/// releases the claim.
pub struct EpochLocker<'a, T> {
    ebr: &'a EpochReclamation<T>,
    thread_id: usize,
    _not_sync: PhantomData<std::cell::Cell<()>>,
}

impl<T> std::fmt::Debug for EpochLocker<'_, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpochLocker")
            .field("thread_id", &self.thread_id)
            .finish_non_exhaustive()
    }
}

impl<T> EpochLocker<'_, T> {
    fn parts(&mut self) -> (&ThreadData<T>, &mut LocalData<T>) {
        let data = &*self.ebr.threads[self.thread_id];
        // SAFETY: This locker holds the slot's claim and `&mut self`, so it
        // is the only reference to the slot-local data.
        let local = unsafe { &mut *data.local.get() };
        (data, local)
    }

    /// Enters a critical section on the current global epoch.
    pub fn lock(&mut self) {
        let ebr = self.ebr;
        let interval = ebr.check_interval;
        let (data, local) = self.parts();
        let epoch = ebr.epoch.load(Ordering::SeqCst);
        EpochReclamation::local_epoch_set(data, local, epoch);
        if local.to_skip == 0 {
            local.to_skip = interval;
            ebr.step_check(data, local);
        } else {
            local.to_skip -= 1;
        }
    }

    /// Leaves the critical section; the slot no longer blocks progress.
    pub fn unlock(&mut self) {
        let (data, _) = self.parts();
        data.epoch.fetch_or(1, Ordering::SeqCst);
    }

    /// Defers dropping `node` until every slot has moved past the current
    /// epoch.
    pub fn retire(&mut self, node: Box<T>) {
        let (_, local) = self.parts();
        let bag = local.bag_i;
        local.bags[bag].push(node);
    }

    /// Catches up with the global epoch and checks slots until one blocks
    /// or nothing retired remains.
    pub fn collect(&mut self) {
        let ebr = self.ebr;
        let (data, local) = self.parts();
        EpochReclamation::local_epoch_set(data, local, ebr.epoch.load(Ordering::SeqCst));
        while ebr.step_check(data, local) && local.undeleted() != 0 {}
    }

    /// Goes idle and waits until everything retired through this slot has
    /// been freed. Requires other slots to make progress.
    pub fn retire_sync(&mut self) {
        loop {
            self.collect();
            self.unlock();
            let (_, local) = self.parts();
            if local.undeleted() == 0 {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Nodes retired through this slot and not yet freed.
    #[must_use]
    pub fn undeleted(&mut self) -> usize {
        self.parts().1.undeleted()
    }
}

impl<T> Drop for EpochLocker<'_, T> {
    fn drop(&mut self) {
        self.unlock();
        self.ebr.threads[self.thread_id]
            .claimed
            .store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_thread_frees_after_epochs_advance() {
        let ebr = EpochReclamation::<u64>::with_check_interval(1, 0);
        let mut locker = ebr.get_locker(0);
        locker.lock();
        locker.retire(Box::new(7));
        assert_eq!(locker.undeleted(), 1);
        locker.unlock();
        locker.retire_sync();
        assert_eq!(locker.undeleted(), 0);
    }

    #[test]
    fn active_slot_blocks_reclamation() {
        let ebr = EpochReclamation::<u64>::with_check_interval(2, 0);
        let mut writer = ebr.get_locker(0);
        let mut reader = ebr.get_locker(1);

        reader.lock();
        writer.lock();
        writer.retire(Box::new(1));
        writer.unlock();
        for _ in 0..10 {
            writer.collect();
        }
        // The reader entered before retirement and never left.
        assert_eq!(writer.undeleted(), 1);

        reader.unlock();
        writer.retire_sync();
        assert_eq!(writer.undeleted(), 0);
    }

    #[test]
    #[should_panic(expected = "already has a locker")]
    fn double_claim_is_fatal() {
        let ebr = EpochReclamation::<u64>::new(1);
        let _a = ebr.get_locker(0);
        let _b = ebr.get_locker(0);
    }

    #[test]
    fn dropping_locker_releases_claim() {
        let ebr = EpochReclamation::<u64>::new(1);
        drop(ebr.get_locker(0));
        let mut again = ebr.get_locker(0);
        again.lock();
        again.unlock();
    }
}
