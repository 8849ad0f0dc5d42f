//! Unbounded MPMC queue built from linked blocks of single-assignment cells.
//!
//! A writer reserves a cell with `fetch_add` on the block's write cursor and
//! fills it; a reader reserves a cell with `fetch_add` on the read cursor
//! and consumes it. When a reader overtakes a writer on the same cell the
//! cell is marked taken and the writer retries further on. Exhausted blocks
//! are linked forward and unlinked blocks are reclaimed through hazard
//! pointers.
//!
//! `try_pop` never blocks: a reader that finds nothing returns `None`.
//! Shutdown is the producer's business, typically by pushing one sentinel
//! per reader.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU8, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use crate::hazard::HazardPointers;
use crate::internal::thread_id;

/// Cells per block unless configured otherwise.
pub const DEFAULT_BLOCK_SIZE: usize = 1024;

const EMPTY: u8 = 0;
const TAKEN: u8 = 1;
const VALUE: u8 = 2;

/// A cell that accepts at most one value and yields it at most once.
struct OneValue<T> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> OneValue<T> {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// Stores `value` unless a reader already gave up on this cell.
    ///
    /// Only the writer that reserved this cell may call this.
    fn set_value(&self, value: T) -> Result<(), T> {
        // SAFETY: The reserving writer is the only one writing the cell, and
        // readers never touch the payload before observing `VALUE`.
        unsafe { (*self.value.get()).write(value) };
        match self
            .state
            .compare_exchange(EMPTY, VALUE, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(()),
            // SAFETY: The CAS failed, so no reader will read the payload;
            // take it back.
            Err(_) => Err(unsafe { (*self.value.get()).assume_init_read() }),
        }
    }

    /// Takes the value if present; otherwise marks the cell taken so a late
    /// writer moves on. Only the reader that reserved this cell may call
    /// this.
    fn get_value(&self) -> Option<T> {
        if self.state.swap(TAKEN, Ordering::AcqRel) == VALUE {
            // SAFETY: `VALUE` was published after the payload write, and the
            // swap guarantees we are the only one to see it.
            Some(unsafe { (*self.value.get()).assume_init_read() })
        } else {
            None
        }
    }
}

impl<T> Drop for OneValue<T> {
    fn drop(&mut self) {
        if *self.state.get_mut() == VALUE {
            // SAFETY: `VALUE` means the payload is initialized and unread.
            unsafe { self.value.get_mut().assume_init_drop() };
        }
    }
}

struct Block<T> {
    write_pos: CachePadded<AtomicUsize>,
    read_pos: CachePadded<AtomicUsize>,
    data: Box<[OneValue<T>]>,
}

struct Node<T> {
    block: Block<T>,
    next: CachePadded<AtomicPtr<Node<T>>>,
}

impl<T> Node<T> {
    fn new(block_size: usize) -> Self {
        Self {
            block: Block {
                write_pos: CachePadded::new(AtomicUsize::new(0)),
                read_pos: CachePadded::new(AtomicUsize::new(0)),
                data: (0..block_size).map(|_| OneValue::new()).collect(),
            },
            next: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
        }
    }
}

/// Multi-producer multi-consumer queue. Any thread may push or pop.
pub struct MpmcQueue<T> {
    write_pos: CachePadded<AtomicPtr<Node<T>>>,
    read_pos: CachePadded<AtomicPtr<Node<T>>>,
    hazard: HazardPointers<Node<T>, 1>,
    block_size: usize,
}

// SAFETY: Values move between threads through the cells; nodes are owned
// by the queue and reclaimed through hazard pointers.
unsafe impl<T: Send> Send for MpmcQueue<T> {}
// SAFETY: All shared mutation goes through atomics and single-owner cells.
unsafe impl<T: Send> Sync for MpmcQueue<T> {}

impl<T> std::fmt::Debug for MpmcQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MpmcQueue")
            .field("block_size", &self.block_size)
            .field("hazard", &self.hazard)
            .finish_non_exhaustive()
    }
}

impl<T> Default for MpmcQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MpmcQueue<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::with_block_size(DEFAULT_BLOCK_SIZE)
    }

    /// # Panics
    ///
    /// Panics if `block_size` is zero.
    #[must_use]
    pub fn with_block_size(block_size: usize) -> Self {
        assert!(block_size > 0, "mpmc block size must be positive");
        let node = Box::into_raw(Box::new(Node::new(block_size)));
        Self {
            write_pos: CachePadded::new(AtomicPtr::new(node)),
            read_pos: CachePadded::new(AtomicPtr::new(node)),
            hazard: HazardPointers::new(thread_id::MAX_THREADS),
            block_size,
        }
    }

    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn push(&self, value: T) {
        let tid = thread_id::current();
        // SAFETY: `tid` is the calling thread's own slot.
        let holder = unsafe { self.hazard.holder(tid, 0) };
        let mut value = value;
        loop {
            let node = holder.protect(&self.write_pos);
            // SAFETY: `node` is protected and was reachable from `write_pos`,
            // so it has not been freed.
            let node_ref = unsafe { &*node };
            let block = &node_ref.block;
            let pos = block.write_pos.fetch_add(1, Ordering::AcqRel);
            if pos < self.block_size {
                match block.data[pos].set_value(value) {
                    Ok(()) => return,
                    Err(v) => value = v,
                }
                continue;
            }

            let next = node_ref.next.load(Ordering::Acquire);
            if !next.is_null() {
                let _ = self.write_pos.compare_exchange(
                    node,
                    next,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                );
                continue;
            }

            let new_node = Node::new(self.block_size);
            new_node.block.write_pos.store(1, Ordering::Relaxed);
            if new_node.block.data[0].set_value(value).is_err() {
                unreachable!("fresh cell cannot be taken");
            }
            let new_ptr = Box::into_raw(Box::new(new_node));
            match node_ref.next.compare_exchange(
                ptr::null_mut(),
                new_ptr,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    let _ = self.write_pos.compare_exchange(
                        node,
                        new_ptr,
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    );
                    return;
                }
                Err(_) => {
                    // SAFETY: `new_ptr` lost the race and was never shared.
                    let lost = unsafe { Box::from_raw(new_ptr) };
                    value = match lost.block.data[0].get_value() {
                        Some(v) => v,
                        None => unreachable!("value stored above"),
                    };
                }
            }
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        let tid = thread_id::current();
        // SAFETY: `tid` is the calling thread's own slot.
        let holder = unsafe { self.hazard.holder(tid, 0) };
        loop {
            let node = holder.protect(&self.read_pos);
            // SAFETY: protected and reachable from `read_pos`.
            let node_ref = unsafe { &*node };
            let block = &node_ref.block;
            if block.write_pos.load(Ordering::Acquire) <= block.read_pos.load(Ordering::Acquire)
                && node_ref.next.load(Ordering::Acquire).is_null()
            {
                return None;
            }
            let pos = block.read_pos.fetch_add(1, Ordering::AcqRel);
            if pos < self.block_size {
                if let Some(value) = block.data[pos].get_value() {
                    return Some(value);
                }
                continue;
            }

            let next = node_ref.next.load(Ordering::Acquire);
            if next.is_null() {
                return None;
            }
            if self
                .read_pos
                .compare_exchange(node, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                holder.clear();
                // SAFETY: `node` was unlinked from `read_pos` by our CAS;
                // `write_pos` has already moved past it (a writer linked
                // `next` only after seeing it full). Retired exactly once.
                unsafe { self.hazard.retire(tid, node) };
            }
        }
    }
}

impl<T> Drop for MpmcQueue<T> {
    fn drop(&mut self) {
        let mut node = *self.read_pos.get_mut();
        while !node.is_null() {
            // SAFETY: `&mut self` excludes concurrent access; nodes from
            // `read_pos` onward are owned by the queue and not retired.
            let mut boxed = unsafe { Box::from_raw(node) };
            node = *boxed.next.get_mut();
        }
    }
}
