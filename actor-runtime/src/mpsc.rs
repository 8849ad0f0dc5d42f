//! Lock-free MPSC link queue with a single reader.
//!
//! Producers prepend nodes to an atomic head with a CAS loop. The consumer
//! takes the whole list at once with an atomic exchange and hands it to a
//! [`Reader`], which reverses the batch once to restore push order and
//! appends it to its local buffer.
//!
//! Only one thread at a time may call [`MpscLinkQueue::pop_all`] for a given
//! queue and use the resulting [`Reader`]. The actor runtime guarantees this
//! through the actor lock; the queue itself does not check it.
//!
//! # Memory ordering
//!
//! - **push**: `Release` on the successful head CAS publishes the node.
//! - **pop_all**: `Acquire` on the exchange sees every published node.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

struct Node<T> {
    next: *mut Node<T>,
    value: T,
}

/// Multi-producer link queue; see the module docs.
pub struct MpscLinkQueue<T> {
    head: AtomicPtr<Node<T>>,
}

// SAFETY: Nodes are heap-allocated and handed off by pointer; values cross
// threads, hence `T: Send`.
unsafe impl<T: Send> Send for MpscLinkQueue<T> {}
// SAFETY: The only shared mutable state is the atomic head.
unsafe impl<T: Send> Sync for MpscLinkQueue<T> {}

impl<T> std::fmt::Debug for MpscLinkQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MpscLinkQueue")
            .field("head", &self.head.load(Ordering::Relaxed))
            .finish()
    }
}

impl<T> Default for MpscLinkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MpscLinkQueue<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Pushes `value`. Any thread may call this.
    ///
    /// Returns `true` if the queue was empty before the push, i.e. the
    /// consumer may need waking.
    pub fn push(&self, value: T) -> bool {
        let node = Box::into_raw(Box::new(Node {
            next: ptr::null_mut(),
            value,
        }));
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // SAFETY: `node` is ours until the CAS below publishes it.
            unsafe { (*node).next = head };
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return head.is_null(),
                Err(actual) => head = actual,
            }
        }
    }

    /// Pushes without atomics; requires exclusive access.
    pub fn push_unsafe(&mut self, value: T) -> bool {
        let head = self.head.get_mut();
        let was_empty = head.is_null();
        *head = Box::into_raw(Box::new(Node { next: *head, value }));
        was_empty
    }

    /// Moves every pushed value into `reader`, after anything it already
    /// holds.
    pub fn pop_all(&self, reader: &mut Reader<T>) {
        let list = self.head.swap(ptr::null_mut(), Ordering::Acquire);
        reader.add(list);
    }

    pub fn pop_all_unsafe(&mut self, reader: &mut Reader<T>) {
        let list = std::mem::replace(self.head.get_mut(), ptr::null_mut());
        reader.add(list);
    }

    /// True if nothing is waiting to be popped. Racy by nature.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }
}

impl<T> Drop for MpscLinkQueue<T> {
    fn drop(&mut self) {
        let mut reader = Reader::new();
        self.pop_all_unsafe(&mut reader);
    }
}

/// Consumer-side FIFO buffer for an [`MpscLinkQueue`].
pub struct Reader<T> {
    head: *mut Node<T>,
    tail: *mut Node<T>,
}

// SAFETY: The reader exclusively owns its nodes.
unsafe impl<T: Send> Send for Reader<T> {}

impl<T> std::fmt::Debug for Reader<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reader")
            .field("len", &self.calc_size())
            .finish()
    }
}

impl<T> Default for Reader<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Reader<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
        }
    }

    /// Takes the oldest buffered value.
    pub fn read(&mut self) -> Option<T> {
        if self.head.is_null() {
            return None;
        }
        // SAFETY: Buffered nodes came from `Box::into_raw` in `push` and are
        // owned exclusively by this reader.
        let node = unsafe { Box::from_raw(self.head) };
        self.head = node.next;
        if self.head.is_null() {
            self.tail = ptr::null_mut();
        }
        Some(node.value)
    }

    /// Puts `value` back in front of everything still buffered.
    pub fn delay(&mut self, value: T) {
        let node = Box::into_raw(Box::new(Node {
            next: self.head,
            value,
        }));
        if self.head.is_null() {
            self.tail = node;
        }
        self.head = node;
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    /// Walks the buffer; O(n).
    #[must_use]
    pub fn calc_size(&self) -> usize {
        let mut n = 0;
        let mut node = self.head;
        while !node.is_null() {
            n += 1;
            // SAFETY: Buffered nodes are valid and owned by this reader.
            node = unsafe { (*node).next };
        }
        n
    }

    /// Appends a LIFO list taken from the shared head, reversing it.
    fn add(&mut self, mut list: *mut Node<T>) {
        if list.is_null() {
            return;
        }
        let batch_tail = list;
        let mut batch_head = ptr::null_mut();
        while !list.is_null() {
            // SAFETY: `list` nodes were published by `push` and are now
            // exclusively ours after the exchange.
            let next = unsafe { (*list).next };
            // SAFETY: Same ownership as above.
            unsafe { (*list).next = batch_head };
            batch_head = list;
            list = next;
        }
        if self.tail.is_null() {
            self.head = batch_head;
        } else {
            // SAFETY: `tail` is a valid node owned by this reader.
            unsafe { (*self.tail).next = batch_head };
        }
        self.tail = batch_tail;
    }
}

impl<T> Drop for Reader<T> {
    fn drop(&mut self) {
        while self.read().is_some() {}
    }
}

// ── Tests ───────────────────────────────────────────────────────────────
