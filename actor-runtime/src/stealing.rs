//! Bounded work-stealing ring buffer for CPU workers.
//!
//! - [`StealingQueue`] — owner handle: [`push`](StealingQueue::push) /
//!   [`pop`](StealingQueue::pop) and [`steal_from`](StealingQueue::steal_from).
//! - [`Stealer`] — shared handle other workers steal through.
//!
//! The ring holds owned pointers (`Box<T>` or `Arc<T>`, see [`RawHandle`])
//! as raw slots. The owner appends at `tail`; everyone, the owner included,
//! consumes at `head` with a CAS. On overflow the owner claims the oldest
//! half plus one entries and passes them to a callback, usually the shared
//! MPMC queue. A thief claims half of a victim's entries with one CAS on
//! the victim's `head` and copies them into its own ring.
//!
//! Only the owner writes `tail` and ring slots, which the split handles
//! enforce: `StealingQueue` is `Send` but not `Clone` or `Sync`.

use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;

/// Owned pointer types that can sit in a ring slot as a raw pointer.
///
/// # Safety
///
/// `from_raw(into_raw(x))` must give back `x`, and the pointer must stay
/// valid while parked.
pub unsafe trait RawHandle: Sized {
    type Target;
    fn into_raw(self) -> *mut Self::Target;
    /// # Safety
    ///
    /// `ptr` must come from [`RawHandle::into_raw`] and be converted back once.
    unsafe fn from_raw(ptr: *mut Self::Target) -> Self;
}

// SAFETY: `Box::into_raw` / `Box::from_raw` round-trip.
unsafe impl<T> RawHandle for Box<T> {
    type Target = T;
    fn into_raw(self) -> *mut T {
        Box::into_raw(self)
    }
    unsafe fn from_raw(ptr: *mut T) -> Self {
        // SAFETY: Forwarded contract.
        unsafe { Box::from_raw(ptr) }
    }
}

// SAFETY: `Arc::into_raw` / `Arc::from_raw` round-trip; the parked pointer
// keeps its strong count.
unsafe impl<T> RawHandle for Arc<T> {
    type Target = T;
    fn into_raw(self) -> *mut T {
        Arc::into_raw(self).cast_mut()
    }
    unsafe fn from_raw(ptr: *mut T) -> Self {
        // SAFETY: Forwarded contract.
        unsafe { Arc::from_raw(ptr.cast_const()) }
    }
}

struct Ring<P: RawHandle> {
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
    buf: Box<[AtomicPtr<P::Target>]>,
    mask: usize,
    _owns: PhantomData<P>,
}

impl<P: RawHandle> Ring<P> {
    fn capacity(&self) -> usize {
        self.buf.len()
    }

    fn slot(&self, pos: usize) -> &AtomicPtr<P::Target> {
        &self.buf[pos & self.mask]
    }
}

impl<P: RawHandle> Drop for Ring<P> {
    fn drop(&mut self) {
        let head = *self.head.get_mut();
        let tail = *self.tail.get_mut();
        let mut pos = head;
        while pos != tail {
            let raw = *self.buf[pos & self.mask].get_mut();
            // SAFETY: Slots in `head..tail` hold unclaimed handles.
            drop(unsafe { P::from_raw(raw) });
            pos = pos.wrapping_add(1);
        }
    }
}

/// Owner side of a worker's ring.
pub struct StealingQueue<P: RawHandle> {
    ring: Arc<Ring<P>>,
}

/// Shared side of a worker's ring.
pub struct Stealer<P: RawHandle> {
    ring: Arc<Ring<P>>,
}

// SAFETY: The owner handle moves between threads as a unit; parked values
// are `P: Send`.
unsafe impl<P: RawHandle + Send> Send for StealingQueue<P> {}
// SAFETY: Stealers only CAS `head` and read slots published by `tail`.
unsafe impl<P: RawHandle + Send> Send for Stealer<P> {}
// SAFETY: As above; every stealer operation is a read or a CAS.
unsafe impl<P: RawHandle + Send> Sync for Stealer<P> {}

impl<P: RawHandle> Clone for Stealer<P> {
    fn clone(&self) -> Self {
        Self {
            ring: Arc::clone(&self.ring),
        }
    }
}

impl<P: RawHandle> std::fmt::Debug for StealingQueue<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StealingQueue")
            .field("capacity", &self.ring.capacity())
            .field("len", &self.len())
            .finish()
    }
}

impl<P: RawHandle> std::fmt::Debug for Stealer<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stealer")
            .field("capacity", &self.ring.capacity())
            .finish()
    }
}

impl<P: RawHandle> StealingQueue<P> {
    /// Creates a ring and its stealer handle.
    ///
    /// # Panics
    ///
    /// Panics unless `capacity` is a power of two of at least 2.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, Stealer<P>) {
        assert!(
            capacity >= 2 && capacity.is_power_of_two(),
            "stealing queue capacity must be a power of two >= 2, got {capacity}"
        );
        let ring = Arc::new(Ring {
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            buf: (0..capacity)
                .map(|_| AtomicPtr::new(ptr::null_mut()))
                .collect(),
            mask: capacity - 1,
            _owns: PhantomData,
        });
        let stealer = Stealer {
            ring: Arc::clone(&ring),
        };
        (Self { ring }, stealer)
    }

    #[must_use]
    pub fn stealer(&self) -> Stealer<P> {
        Stealer {
            ring: Arc::clone(&self.ring),
        }
    }

    /// Appends `value`. When the ring is full, the oldest `capacity / 2 + 1`
    /// entries are handed to `overflow` first.
    pub fn push(&mut self, value: P, mut overflow: impl FnMut(P)) {
        let ring = &*self.ring;
        let raw = value.into_raw();
        loop {
            let tail = ring.tail.load(Ordering::Relaxed);
            let head = ring.head.load(Ordering::Acquire);
            if tail.wrapping_sub(head) < ring.capacity() {
                ring.slot(tail).store(raw, Ordering::Relaxed);
                ring.tail.store(tail.wrapping_add(1), Ordering::Release);
                return;
            }

            let n = ring.capacity() / 2 + 1;
            if ring
                .head
                .compare_exchange(
                    head,
                    head.wrapping_add(n),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                for i in 0..n {
                    let claimed = ring.slot(head.wrapping_add(i)).load(Ordering::Relaxed);
                    // SAFETY: The CAS on `head` made these slots ours.
                    overflow(unsafe { P::from_raw(claimed) });
                }
                tracing::trace!(count = n, "local queue overflow");
            }
        }
    }

    /// Takes the oldest entry.
    pub fn pop(&mut self) -> Option<P> {
        let ring = &*self.ring;
        loop {
            let head = ring.head.load(Ordering::Acquire);
            let tail = ring.tail.load(Ordering::Relaxed);
            if head == tail {
                return None;
            }
            let raw = ring.slot(head).load(Ordering::Relaxed);
            if ring
                .head
                .compare_exchange(
                    head,
                    head.wrapping_add(1),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                // SAFETY: The CAS claimed slot `head`.
                return Some(unsafe { P::from_raw(raw) });
            }
        }
    }

    /// Moves about half of `other`'s entries into this ring and returns one
    /// of them. Requires this ring to be empty.
    pub fn steal_from(&mut self, other: &Stealer<P>) -> Option<P> {
        let ring = &*self.ring;
        let victim = &*other.ring;
        if ptr::eq(ring, victim) {
            return None;
        }
        let tail = ring.tail.load(Ordering::Relaxed);
        let head = ring.head.load(Ordering::Relaxed);
        if tail != head {
            return None;
        }

        loop {
            let other_head = victim.head.load(Ordering::Acquire);
            let other_tail = victim.tail.load(Ordering::Acquire);
            let available = other_tail.wrapping_sub(other_head);
            if available == 0 || available > victim.capacity() {
                return None;
            }
            let n = (available - available / 2).min(ring.capacity());
            for i in 0..n {
                let raw = victim.slot(other_head.wrapping_add(i)).load(Ordering::Relaxed);
                ring.slot(tail.wrapping_add(i)).store(raw, Ordering::Relaxed);
            }
            if victim
                .head
                .compare_exchange(
                    other_head,
                    other_head.wrapping_add(n),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                // Keep the last copied entry for the caller, publish the rest.
                let last = ring.slot(tail.wrapping_add(n - 1)).load(Ordering::Relaxed);
                ring.tail.store(tail.wrapping_add(n - 1), Ordering::Release);
                // SAFETY: The CAS on the victim's head transferred these
                // entries to us; `last` is outside our published range.
                return Some(unsafe { P::from_raw(last) });
            }
        }
    }

    /// Entries currently buffered. May be stale under concurrent steals.
    #[must_use]
    pub fn len(&self) -> usize {
        let tail = self.ring.tail.load(Ordering::Relaxed);
        let head = self.ring.head.load(Ordering::Relaxed);
        tail.wrapping_sub(head)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<P: RawHandle> Stealer<P> {
    /// Racy emptiness check, used to skip obviously idle victims.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        let tail = self.ring.tail.load(Ordering::Acquire);
        let head = self.ring.head.load(Ordering::Acquire);
        tail.wrapping_sub(head) == 0
    }
}

// ── Tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_is_fifo() {
        let (mut q, _s) = StealingQueue::<Box<u32>>::new(8);
        for i in 0..5 {
            q.push(Box::new(i), |_| panic!("no overflow expected"));
        }
        assert_eq!(q.len(), 5);
        for i in 0..5 {
            assert_eq!(q.pop().map(|b| *b), Some(i));
        }
        assert!(q.pop().is_none());
    }

    #[test]
    fn overflow_hands_off_oldest_half_plus_one() {
        let (mut q, _s) = StealingQueue::<Box<u32>>::new(4);
        let mut spilled = Vec::new();
        for i in 0..5 {
            q.push(Box::new(i), |b| spilled.push(*b));
        }
        assert_eq!(spilled, vec![0, 1, 2]);
        let rest: Vec<_> = std::iter::from_fn(|| q.pop().map(|b| *b)).collect();
        assert_eq!(rest, vec![3, 4]);
    }

    #[test]
    fn steal_takes_half() {
        let (mut a, a_stealer) = StealingQueue::<Box<u32>>::new(16);
        let (mut b, _b_stealer) = StealingQueue::<Box<u32>>::new(16);
        for i in 0..8 {
            a.push(Box::new(i), |_| unreachable!());
        }
        let first = b.steal_from(&a_stealer).map(|v| *v);
        assert_eq!(first, Some(3));
        assert_eq!(b.len(), 3);
        assert_eq!(a.len(), 4);
        let stolen: Vec<_> = std::iter::from_fn(|| b.pop().map(|v| *v)).collect();
        assert_eq!(stolen, vec![0, 1, 2]);
    }

    #[test]
    fn steal_from_self_or_empty_victim_fails() {
        let (mut a, a_stealer) = StealingQueue::<Box<u32>>::new(4);
        let (_b, b_stealer) = StealingQueue::<Box<u32>>::new(4);
        assert!(a.steal_from(&b_stealer).is_none());
        a.push(Box::new(1), |_| unreachable!());
        assert!(a.steal_from(&a_stealer).is_none());
        assert!(b_stealer.is_empty());
    }

    #[test]
    fn drop_releases_parked_arcs() {
        let marker = Arc::new(());
        let (mut q, stealer) = StealingQueue::<Arc<()>>::new(8);
        for _ in 0..6 {
            q.push(Arc::clone(&marker), drop);
        }
        drop(q.pop());
        drop(q);
        drop(stealer);
        assert_eq!(Arc::strong_count(&marker), 1);
    }
}
