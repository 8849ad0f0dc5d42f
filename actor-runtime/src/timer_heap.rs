//! Indexed min-heap of actor alarms.
//!
//! One entry per actor, keyed by its alarm instant. Each [`ActorInfo`]
//! stores its own position in the heap, so re-arming or cancelling is
//! `O(log n)` without a search. The heap lives behind its scheduler's
//! mutex; the stored positions are only meaningful under that mutex.
//!
//! # Invariants
//!
//! - `entries[i].1.heap_pos() == i` for every entry.
//! - `entries[parent(i)].0 <= entries[i].0`.
//! - Actors not in the heap have `heap_pos() == NOT_IN_HEAP`.

use std::sync::Arc;
use std::time::Instant;

use crate::actor::{ActorInfo, ActorInfoPtr, NOT_IN_HEAP};

#[derive(Debug, Default)]
pub struct TimerHeap {
    entries: Vec<(Instant, ActorInfoPtr)>,
}

impl TimerHeap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Earliest deadline.
    #[must_use]
    pub fn peek_deadline(&self) -> Option<Instant> {
        self.entries.first().map(|(at, _)| *at)
    }

    #[must_use]
    pub fn contains(&self, info: &ActorInfo) -> bool {
        let pos = info.heap_pos();
        pos < self.entries.len() && std::ptr::eq(Arc::as_ptr(&self.entries[pos].1), info)
    }

    /// Arms, moves or (with `None`) cancels `info`'s alarm.
    pub fn set(&mut self, info: &ActorInfoPtr, at: Option<Instant>) {
        match at {
            Some(at) => self.insert_or_update(info, at),
            None => {
                self.remove(info);
            }
        }
    }

    pub fn insert_or_update(&mut self, info: &ActorInfoPtr, at: Instant) {
        if self.contains(info) {
            let pos = info.heap_pos();
            let old = std::mem::replace(&mut self.entries[pos].0, at);
            if at < old {
                self.sift_up(pos);
            } else {
                self.sift_down(pos);
            }
            return;
        }
        let pos = self.entries.len();
        self.entries.push((at, Arc::clone(info)));
        info.set_heap_pos(pos);
        self.sift_up(pos);
    }

    /// Returns `true` if `info` was in the heap.
    pub fn remove(&mut self, info: &ActorInfo) -> bool {
        if !self.contains(info) {
            return false;
        }
        let pos = info.heap_pos();
        self.remove_at(pos);
        true
    }

    /// Pops the earliest entry if it is due at `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<ActorInfoPtr> {
        match self.peek_deadline() {
            Some(at) if at <= now => Some(self.remove_at(0)),
            _ => None,
        }
    }

    /// Empties the heap, handing back every actor.
    pub fn drain(&mut self) -> Vec<ActorInfoPtr> {
        self.entries
            .drain(..)
            .map(|(_, info)| {
                info.set_heap_pos(NOT_IN_HEAP);
                info
            })
            .collect()
    }

    fn remove_at(&mut self, pos: usize) -> ActorInfoPtr {
        let last = self.entries.len() - 1;
        self.entries.swap(pos, last);
        let (_, info) = self.entries.pop().unwrap_or_else(|| unreachable!());
        info.set_heap_pos(NOT_IN_HEAP);
        if pos < self.entries.len() {
            self.entries[pos].1.set_heap_pos(pos);
            self.sift_down(pos);
            self.sift_up(pos);
        }
        info
    }

    fn sift_up(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if self.entries[parent].0 <= self.entries[pos].0 {
                break;
            }
            self.swap(pos, parent);
            pos = parent;
        }
    }

    fn sift_down(&mut self, mut pos: usize) {
        let len = self.entries.len();
        loop {
            let left = 2 * pos + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let child = if right < len && self.entries[right].0 < self.entries[left].0 {
                right
            } else {
                left
            };
            if self.entries[pos].0 <= self.entries[child].0 {
                break;
            }
            self.swap(pos, child);
            pos = child;
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.entries.swap(a, b);
        self.entries[a].1.set_heap_pos(a);
        self.entries[b].1.set_heap_pos(b);
    }
}

// ── Tests ───────────────────────────────────────────────────────────────
