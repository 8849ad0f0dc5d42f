//! Hazard pointers.
//!
//! Each thread slot owns `N` published pointer cells. A reader that loads a
//! shared pointer publishes it with [`HazardPointers::protect`] before
//! dereferencing; a writer that unlinks a node hands it to
//! [`HazardPointers::retire`], which frees it only once no slot of any
//! thread still publishes it.
//!
//! # API
//!
//! - [`HazardPointers::protect`] — publish and validate a pointer loaded from an atomic.
//! - [`HazardPointers::clear`] — drop a published pointer.
//! - [`HazardPointers::retire`] — defer freeing an unlinked node, then sweep.
//! - [`HazardPointers::holder`] — RAII [`Holder`] that clears its cell on drop.
//!
//! Thread ids are the dense slot ids from [`crate::internal::thread_id`].
//! Only the thread that owns a slot may publish through it.
//!
//! # Memory ordering
//!
//! Publication and validation use `SeqCst` so that a retiring thread's scan
//! (also `SeqCst`) cannot miss a pointer published before its unlink was
//! observed.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Mutex;

use crossbeam_utils::CachePadded;

struct ThreadData<T, const N: usize> {
    hazard: [AtomicPtr<T>; N],
    /// Nodes retired by this slot and not yet freed. Locked only by the
    /// owning thread and by `Drop`/size queries.
    to_delete: Mutex<Vec<*mut T>>,
}

impl<T, const N: usize> ThreadData<T, N> {
    fn new() -> Self {
        Self {
            hazard: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
            to_delete: Mutex::new(Vec::new()),
        }
    }
}

/// Hazard pointer domain for nodes of type `T`, `N` cells per thread.
///
/// Retired nodes must have been allocated with `Box::new` and be
/// unreachable from every shared root at the moment of retirement.
pub struct HazardPointers<T, const N: usize = 1> {
    threads: Box<[CachePadded<ThreadData<T, N>>]>,
}

// SAFETY: The raw pointers are owned nodes handed over through `retire`;
// they are only dereferenced (to drop them) by whichever thread frees them.
unsafe impl<T: Send, const N: usize> Send for HazardPointers<T, N> {}
// SAFETY: Hazard cells are atomics and retire lists sit behind mutexes.
unsafe impl<T: Send, const N: usize> Sync for HazardPointers<T, N> {}

impl<T, const N: usize> std::fmt::Debug for HazardPointers<T, N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HazardPointers")
            .field("threads", &self.threads.len())
            .field("cells_per_thread", &N)
            .field("to_delete", &self.to_delete_size_unsafe())
            .finish()
    }
}

impl<T, const N: usize> HazardPointers<T, N> {
    /// Creates a domain with room for `threads_n` thread slots.
    #[must_use]
    pub fn new(threads_n: usize) -> Self {
        let threads = (0..threads_n)
            .map(|_| CachePadded::new(ThreadData::new()))
            .collect();
        Self { threads }
    }

    fn thread(&self, thread_id: usize) -> &ThreadData<T, N> {
        assert!(
            thread_id < self.threads.len(),
            "thread id {thread_id} out of range for {} hazard slots",
            self.threads.len()
        );
        &self.threads[thread_id]
    }

    /// Loads `source`, publishes the value in cell `pos` and reloads until
    /// the published value matches the latest load.
    ///
    /// The returned pointer stays valid to dereference until the cell is
    /// cleared or overwritten, provided it was reachable from `source`.
    ///
    /// # Safety
    ///
    /// `thread_id` must be the calling thread's own slot id; no other live
    /// thread may publish through the same slot.
    pub unsafe fn protect(&self, thread_id: usize, pos: usize, source: &AtomicPtr<T>) -> *mut T {
        let cell = &self.thread(thread_id).hazard[pos];
        let mut saved = ptr::null_mut();
        loop {
            let current = source.load(Ordering::SeqCst);
            if current == saved {
                return current;
            }
            cell.store(current, Ordering::SeqCst);
            saved = current;
        }
    }

    /// Clears cell `pos` of `thread_id`.
    pub fn clear(&self, thread_id: usize, pos: usize) {
        self.thread(thread_id).hazard[pos].store(ptr::null_mut(), Ordering::Release);
    }

    /// Returns a guard over cell `pos` that clears it when dropped.
    ///
    /// # Safety
    ///
    /// Same slot ownership requirement as [`protect`](Self::protect).
    pub unsafe fn holder(&self, thread_id: usize, pos: usize) -> Holder<'_, T, N> {
        Holder {
            hp: self,
            thread_id,
            pos,
        }
    }

    /// Defers freeing `node` and frees every node retired by this slot that
    /// no thread currently protects.
    ///
    /// Passing a null `node` only sweeps.
    ///
    /// # Safety
    ///
    /// `node` must come from `Box::into_raw`, must be unreachable from all
    /// shared roots, and must not be retired twice.
    pub unsafe fn retire(&self, thread_id: usize, node: *mut T) {
        let data = self.thread(thread_id);
        let mut to_delete = match data.to_delete.lock() {
            Ok(g) => g,
            Err(e) => e.into_inner(),
        };
        if !node.is_null() {
            to_delete.push(node);
        }
        to_delete.retain(|&candidate| {
            if self.is_protected(candidate) {
                return true;
            }
            // SAFETY: `candidate` came from `Box::into_raw` per the retire
            // contract and no hazard cell publishes it. It is unreachable, so
            // no thread can publish it after this scan.
            drop(unsafe { Box::from_raw(candidate) });
            false
        });
    }

    fn is_protected(&self, node: *mut T) -> bool {
        self.threads.iter().any(|thread| {
            thread
                .hazard
                .iter()
                .any(|cell| cell.load(Ordering::SeqCst) == node)
        })
    }

    /// Number of retired but not yet freed nodes across all slots. The
    /// value may be stale as soon as it is returned.
    #[must_use]
    pub fn to_delete_size_unsafe(&self) -> usize {
        self.threads
            .iter()
            .map(|thread| match thread.to_delete.lock() {
                Ok(g) => g.len(),
                Err(e) => e.into_inner().len(),
            })
            .sum()
    }
}

impl<T, const N: usize> Drop for HazardPointers<T, N> {
    fn drop(&mut self) {
        for thread in self.threads.iter_mut() {
            let to_delete = match thread.to_delete.get_mut() {
                Ok(v) => v,
                Err(e) => e.into_inner(),
            };
            for node in to_delete.drain(..) {
                // SAFETY: `&mut self` means no thread can hold a protected
                // pointer any more; each node was boxed and retired once.
                drop(unsafe { Box::from_raw(node) });
            }
        }
    }
}

/// Clears one hazard cell when dropped.
pub struct Holder<'a, T, const N: usize> {
    hp: &'a HazardPointers<T, N>,
    thread_id: usize,
    pos: usize,
}

impl<T, const N: usize> std::fmt::Debug for Holder<'_, T, N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Holder")
            .field("thread_id", &self.thread_id)
            .field("pos", &self.pos)
            .finish()
    }
}

impl<T, const N: usize> Holder<'_, T, N> {
    /// Publishes the current value of `source` through this holder's cell.
    pub fn protect(&self, source: &AtomicPtr<T>) -> *mut T {
        // SAFETY: Holders are only created through `HazardPointers::holder`,
        // whose caller vouched for slot ownership.
        unsafe { self.hp.protect(self.thread_id, self.pos, source) }
    }

    pub fn clear(&self) {
        self.hp.clear(self.thread_id, self.pos);
    }
}

impl<T, const N: usize> Drop for Holder<'_, T, N> {
    fn drop(&mut self) {
        self.clear();
    }
}

// ── Tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::internal::rng::Xorshift64;
    use crate::internal::thread_id;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    static DROPS: AtomicUsize = AtomicUsize::new(0);

    struct Counted(u32);

    impl Drop for Counted {
        fn drop(&mut self) {
            DROPS.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn protected_node_survives_retire() {
        let hp = HazardPointers::<Counted, 1>::new(thread_id::MAX_THREADS);
        let tid = thread_id::current();
        let node = Box::into_raw(Box::new(Counted(1)));
        let source = AtomicPtr::new(node);

        // SAFETY: this thread owns slot `tid`.
        let holder = unsafe { hp.holder(tid, 0) };
        let seen = holder.protect(&source);
        assert_eq!(seen, node);

        source.store(ptr::null_mut(), Ordering::SeqCst);
        let before = DROPS.load(Ordering::Relaxed);
        // SAFETY: `node` is boxed, unlinked from `source` and retired once.
        unsafe { hp.retire(tid, node) };
        assert_eq!(hp.to_delete_size_unsafe(), 1);
        // SAFETY: still protected, so the node is alive.
        assert_eq!(unsafe { (*seen).0 }, 1);

        drop(holder);
        // SAFETY: null only sweeps.
        unsafe { hp.retire(tid, ptr::null_mut()) };
        assert_eq!(hp.to_delete_size_unsafe(), 0);
        assert!(DROPS.load(Ordering::Relaxed) > before);
    }

    #[test]
    fn drop_frees_pending_nodes() {
        let hp = HazardPointers::<Counted, 2>::new(4);
        let tid = 0;
        let node = Box::into_raw(Box::new(Counted(2)));
        let source = AtomicPtr::new(node);
        // SAFETY: slot 0 is only used by this test's thread.
        unsafe {
            hp.protect(tid, 1, &source);
            hp.retire(tid, node);
        }
        assert_eq!(hp.to_delete_size_unsafe(), 1);
        drop(hp);
    }

    #[test]
    fn stress_strings_never_observed_freed() {
        let threads_n = 10;
        let hp = Arc::new(HazardPointers::<String, 1>::new(thread_id::MAX_THREADS));
        let nodes: Arc<Vec<CachePadded<AtomicPtr<String>>>> = Arc::new(
            (0..threads_n)
                .map(|_| CachePadded::new(AtomicPtr::new(ptr::null_mut())))
                .collect(),
        );

        let handles: Vec<_> = (0..threads_n)
            .map(|_| {
                let hp = Arc::clone(&hp);
                let nodes = Arc::clone(&nodes);
                thread::spawn(move || {
                    let tid = thread_id::current();
                    let mut rng = Xorshift64::from_thread();
                    for _ in 0..20_000 {
                        let node = &nodes[rng.below(threads_n)];
                        // SAFETY: `tid` is this thread's slot.
                        let holder = unsafe { hp.holder(tid, 0) };
                        let s = holder.protect(node);
                        if !s.is_null() {
                            // SAFETY: protected and published from `node`.
                            let value = unsafe { &*s };
                            assert!(value == "one" || value == "twotwo");
                        }
                        if rng.one_in(6) {
                            let replacement = if rng.one_in(2) { "one" } else { "twotwo" };
                            let new = Box::into_raw(Box::new(replacement.to_owned()));
                            match node.compare_exchange(s, new, Ordering::AcqRel, Ordering::Acquire)
                            {
                                Ok(old) => {
                                    drop(holder);
                                    if !old.is_null() {
                                        // SAFETY: `old` was unlinked by our CAS.
                                        unsafe { hp.retire(tid, old) };
                                    }
                                }
                                // SAFETY: `new` never escaped this thread.
                                Err(_) => drop(unsafe { Box::from_raw(new) }),
                            }
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        for node in nodes.iter() {
            let p = node.swap(ptr::null_mut(), Ordering::AcqRel);
            if !p.is_null() {
                // SAFETY: all workers are joined; nothing is protected.
                unsafe { hp.retire(thread_id::current(), p) };
            }
        }
        // SAFETY: null only sweeps.
        unsafe { hp.retire(thread_id::current(), ptr::null_mut()) };
        // Worker slots may still hold nodes that were protected at their
        // last sweep; nothing is protected now, so a sweep per slot clears
        // them all.
        for slot in 0..thread_id::MAX_THREADS {
            // SAFETY: no other thread is running; sweeping any slot is fine.
            unsafe { hp.retire(slot, ptr::null_mut()) };
        }
        assert_eq!(hp.to_delete_size_unsafe(), 0);
    }
}
