//! Dense per-thread slot ids.
//!
//! Hazard pointer and MPMC queue state is indexed by a small integer per
//! thread. A slot is taken on a thread's first call to [`current`] and
//! returned to the free list when the thread exits, so the id space stays
//! bounded by the number of simultaneously live threads.
//!
//! Two live threads never share a slot. Structures indexed by slot id rely
//! on that for the exclusivity of their per-thread state.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Upper bound on simultaneously live threads that touch slot-indexed
/// structures.
pub const MAX_THREADS: usize = 256;

static NEXT: AtomicUsize = AtomicUsize::new(0);
static FREE: Mutex<Vec<usize>> = Mutex::new(Vec::new());

struct Slot(usize);

impl Slot {
    fn acquire() -> Self {
        let recycled = match FREE.lock() {
            Ok(mut free) => free.pop(),
            Err(e) => e.into_inner().pop(),
        };
        let id = recycled.unwrap_or_else(|| NEXT.fetch_add(1, Ordering::Relaxed));
        assert!(
            id < MAX_THREADS,
            "more than {MAX_THREADS} live threads use the actor runtime"
        );
        Self(id)
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        let mut free = match FREE.lock() {
            Ok(g) => g,
            Err(e) => e.into_inner(),
        };
        free.push(self.0);
    }
}

thread_local! {
    static SLOT: Slot = Slot::acquire();
}

/// Slot id of the calling thread, in `0..MAX_THREADS`.
#[must_use]
pub fn current() -> usize {
    SLOT.with(|slot| slot.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn stable_within_a_thread() {
        assert_eq!(current(), current());
        assert!(current() < MAX_THREADS);
    }

    #[test]
    fn live_threads_get_distinct_slots() {
        let n = 8;
        let barrier = Arc::new(Barrier::new(n));
        let handles: Vec<_> = (0..n)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let id = current();
                    // Keep every thread alive until all have taken a slot.
                    barrier.wait();
                    id
                })
            })
            .collect();
        let ids: HashSet<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(ids.len(), n);
    }
}
