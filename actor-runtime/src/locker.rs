//! Lock-free mutual exclusion over an [`ActorState`] word.
//!
//! Whoever holds the `locked` bit owns the actor: its payload, its
//! mailbox reader and its alarm. Signals sent while the actor is locked are
//! OR-ed into the word; the owner's unlock CAS then fails and the owner
//! folds them into its local flags instead of releasing. A sender that
//! finds the word unlocked takes the lock itself. Either way, every signal
//! is seen by some owner.
//!
//! The owner keeps its view of the word in [`ActorLocker::flags`]. Signals
//! present in the word at acquisition are moved into that view, so the
//! word itself carries only signals that arrived while locked.

use crate::state::{ActorFlags, ActorSignals, ActorState, SchedulerId};

/// What the locking executor is allowed to run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockerOptions {
    /// Run even if the actor is paused (executors taken from a queue).
    pub can_execute_paused: bool,
    /// Executing thread is a CPU worker (`true`) or the IO thread.
    pub is_shared: bool,
    /// Scheduler the executing thread belongs to; `None` never executes.
    pub scheduler_id: Option<SchedulerId>,
}

impl LockerOptions {
    #[must_use]
    pub fn with_can_execute_paused(mut self, value: bool) -> Self {
        self.can_execute_paused = value;
        self
    }

    #[must_use]
    pub fn with_is_shared(mut self, value: bool) -> Self {
        self.is_shared = value;
        self
    }

    #[must_use]
    pub fn with_scheduler_id(mut self, id: Option<SchedulerId>) -> Self {
        self.scheduler_id = id;
        self
    }
}

/// One attempt to own an actor; see the module docs.
#[derive(Debug)]
pub struct ActorLocker<'a> {
    state: &'a ActorState,
    flags: ActorFlags,
    /// Word value we installed when locking; the unlock CAS expects it.
    locked_word: ActorFlags,
    own_lock: bool,
    options: LockerOptions,
}

impl<'a> ActorLocker<'a> {
    #[must_use]
    pub fn new(state: &'a ActorState) -> Self {
        Self::with_options(state, LockerOptions::default())
    }

    #[must_use]
    pub fn with_options(state: &'a ActorState, options: LockerOptions) -> Self {
        let flags = state.flags();
        Self {
            state,
            flags,
            locked_word: flags,
            own_lock: false,
            options,
        }
    }

    /// Takes the lock if the word is unlocked. Fails on a locked or closed
    /// word; `flags()` then holds the observed value.
    pub fn try_lock(&mut self) -> bool {
        assert!(!self.own_lock, "actor locker already owns the lock");
        loop {
            if self.flags.is_locked() {
                return false;
            }
            let mut new_word = self.flags;
            new_word.set_locked(true);
            new_word.clear_signals();
            if self.state.compare_exchange(&mut self.flags, new_word) {
                self.flags.set_locked(true);
                self.locked_word = new_word;
                self.own_lock = true;
                return true;
            }
        }
    }

    /// Single CAS adding `signals` on top of the last observed word.
    pub fn try_add_signals(&mut self, signals: ActorSignals) -> bool {
        assert!(!self.own_lock, "lock owner must keep signals locally");
        let mut new_word = self.flags;
        new_word.add_signals(signals);
        if self.state.compare_exchange(&mut self.flags, new_word) {
            self.flags = new_word;
            return true;
        }
        false
    }

    /// Delivers `signals`. Returns `true` if the word was unlocked and this
    /// locker now owns it, in which case the signals are in `flags()` and
    /// the caller must process or re-publish them.
    pub fn add_signals(&mut self, signals: ActorSignals) -> bool {
        loop {
            if self.flags.is_closed() {
                return false;
            }
            if self.flags.is_locked() {
                if self.try_add_signals(signals) {
                    return false;
                }
            } else if self.try_lock() {
                self.flags.add_signals(signals);
                return true;
            }
        }
    }

    /// Publishes `flags` with the lock cleared. Fails if signals arrived
    /// since the lock was taken; they are then moved into `flags()` and the
    /// lock is kept.
    pub fn try_unlock(&mut self, mut flags: ActorFlags) -> bool {
        assert!(self.own_lock, "try_unlock without owning the lock");
        flags.set_locked(false);
        let mut current = self.locked_word;
        if self.state.compare_exchange(&mut current, flags) {
            self.flags = flags;
            self.own_lock = false;
            return true;
        }

        self.flags = flags;
        self.flags.set_locked(true);
        loop {
            debug_assert_eq!(
                {
                    let mut c = current;
                    c.clear_signals();
                    c
                },
                self.locked_word,
                "only signals may change under a held lock"
            );
            let mut stripped = current;
            let arrived = stripped.take_signals();
            if self.state.compare_exchange(&mut current, stripped) {
                self.flags.add_signals(arrived);
                self.locked_word = stripped;
                return false;
            }
        }
    }

    /// Marks the word closed and gives up ownership for good. The word
    /// stays locked, so no later locker can acquire it.
    pub fn close(&mut self) {
        assert!(self.own_lock, "close without owning the lock");
        let mut current = self.locked_word;
        loop {
            let mut closed = current;
            closed.clear_signals();
            closed.set_closed(true);
            closed.set_locked(true);
            if self.state.compare_exchange(&mut current, closed) {
                self.flags = closed;
                self.locked_word = closed;
                self.own_lock = false;
                return;
            }
        }
    }

    #[must_use]
    pub fn own_lock(&self) -> bool {
        self.own_lock
    }

    #[must_use]
    pub fn flags(&self) -> ActorFlags {
        self.flags
    }

    #[must_use]
    pub fn options(&self) -> LockerOptions {
        self.options
    }

    #[must_use]
    pub fn can_execute(&self) -> bool {
        self.options.scheduler_id == Some(self.flags.scheduler_id())
            && self.flags.is_shared() == self.options.is_shared
            && (self.options.can_execute_paused || !self.flags.is_pause())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Signal;
    use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
    use std::sync::Arc;
    use std::thread;

    fn signals(list: &[Signal]) -> ActorSignals {
        list.iter().copied().collect()
    }

    #[test]
    fn contended_signals_fail_the_unlock_and_are_folded() {
        let state = ActorState::default();
        let kill = signals(&[Signal::Kill]);
        let wakeup = signals(&[Signal::Wakeup]);
        let cpu = signals(&[Signal::Cpu]);

        let mut a = ActorLocker::new(&state);
        let mut b = ActorLocker::new(&state);
        let mut c = ActorLocker::new(&state);

        assert!(a.try_lock());
        assert!(a.own_lock());
        let flags = a.flags();
        assert!(a.try_unlock(flags));
        assert!(!a.own_lock());

        assert!(a.try_lock());
        assert!(!b.try_lock());
        assert!(!c.try_lock());

        assert!(b.try_add_signals(kill));
        // `c` last saw the word before `b` added Kill.
        assert!(!c.try_add_signals(wakeup));
        assert!(c.try_add_signals(wakeup));
        assert!(!c.add_signals(cpu));
        assert!(!a.flags().has_signals());
        assert!(!a.try_unlock(a.flags()));

        let mut flags = a.flags();
        assert_eq!(flags.signals(), signals(&[Signal::Kill, Signal::Wakeup, Signal::Cpu]));
        flags.clear_signals();
        assert!(a.try_unlock(flags));
        assert!(!state.flags().has_signals());
    }

    #[test]
    fn signal_racing_an_unlock_is_never_lost() {
        let state = ActorState::default();
        let kill = signals(&[Signal::Kill]);

        let mut b = ActorLocker::new(&state);
        assert!(b.try_lock());
        assert!(b.try_unlock(b.flags()));
        assert!(b.add_signals(kill), "unlocked word: sender takes the lock");
        assert!(b.flags().signals().has_signal(Signal::Kill));
        let mut flags = b.flags();
        flags.clear_signals();

        let mut a = ActorLocker::new(&state);
        assert!(!a.add_signals(kill));
        assert!(!b.try_unlock(flags));
        assert!(!a.add_signals(kill));
        assert!(!b.try_unlock(flags));
        assert!(b.flags().signals().has_signal(Signal::Kill));
        assert!(b.try_unlock(flags));
    }

    #[test]
    fn paused_word_is_still_lockable() {
        let state = ActorState::default();
        let mut a = ActorLocker::new(&state);
        assert!(a.try_lock());
        let mut flags = a.flags();
        flags.set_pause(true);
        assert!(a.try_unlock(flags));
        assert!(a.add_signals(signals(&[Signal::Wakeup])));
        assert!(!a.can_execute());
    }

    #[test]
    fn closed_word_rejects_lock_and_signals() {
        let state = ActorState::default();
        let mut owner = ActorLocker::new(&state);
        assert!(owner.try_lock());
        owner.close();
        assert!(!owner.own_lock());

        let mut late = ActorLocker::new(&state);
        assert!(!late.try_lock());
        assert!(!late.add_signals(signals(&[Signal::Wakeup])));
        assert!(state.flags().is_closed());
        assert!(!state.flags().has_signals());
    }

    #[test]
    fn can_execute_checks_scheduler_affinity_and_pause() {
        let mut initial = ActorFlags::new();
        initial.set_scheduler_id(SchedulerId::new(2));
        initial.set_shared(true);
        let state = ActorState::new(initial);

        let on_cpu = LockerOptions::default()
            .with_is_shared(true)
            .with_scheduler_id(Some(SchedulerId::new(2)));
        let mut locker = ActorLocker::with_options(&state, on_cpu);
        assert!(locker.try_lock());
        assert!(locker.can_execute());
        let mut flags = locker.flags();
        flags.set_pause(true);
        assert!(locker.try_unlock(flags));

        let mut plain = ActorLocker::with_options(&state, on_cpu);
        assert!(plain.try_lock());
        assert!(!plain.can_execute());
        assert!(plain.try_unlock(plain.flags()));

        let mut from_queue =
            ActorLocker::with_options(&state, on_cpu.with_can_execute_paused(true));
        assert!(from_queue.try_lock());
        assert!(from_queue.can_execute());
        assert!(from_queue.try_unlock(from_queue.flags()));

        let io = on_cpu.with_is_shared(false).with_can_execute_paused(true);
        let mut io_locker = ActorLocker::with_options(&state, io);
        assert!(io_locker.try_lock());
        assert!(!io_locker.can_execute());
        assert!(io_locker.try_unlock(io_locker.flags()));

        let other = on_cpu
            .with_scheduler_id(Some(SchedulerId::new(0)))
            .with_can_execute_paused(true);
        let mut foreign = ActorLocker::with_options(&state, other);
        assert!(foreign.try_lock());
        assert!(!foreign.can_execute());
        assert!(foreign.try_unlock(foreign.flags()));
    }

    /// Every thread either executes its own request under the lock or
    /// leaves it for the current owner via a `Cpu` signal; after each round
    /// all requests must have been answered.
    #[test]
    fn stress_no_request_left_behind() {
        const THREADS: usize = 5;
        const ROUNDS: usize = 20_000;

        struct Node {
            request: AtomicU32,
            response: AtomicU32,
        }

        let state = Arc::new(ActorState::default());
        let nodes: Arc<Vec<Node>> = Arc::new(
            (0..THREADS)
                .map(|_| Node {
                    request: AtomicU32::new(0),
                    response: AtomicU32::new(0),
                })
                .collect(),
        );
        let stages: Arc<[AtomicI32; 3]> = Arc::new(std::array::from_fn(|_| AtomicI32::new(0)));

        let stage = |value: &AtomicI32, need: i32| {
            value.fetch_add(1, Ordering::AcqRel);
            while value.load(Ordering::Acquire) < need {
                thread::yield_now();
            }
        };
        let do_work = |nodes: &[Node]| {
            for node in nodes {
                let query = node.request.load(Ordering::Acquire);
                if query != 0 {
                    node.response.store(query.wrapping_mul(query), Ordering::Relaxed);
                    node.request.store(0, Ordering::Relaxed);
                }
            }
        };

        let handles: Vec<_> = (0..THREADS)
            .map(|id| {
                let state = Arc::clone(&state);
                let nodes = Arc::clone(&nodes);
                let stages = Arc::clone(&stages);
                thread::spawn(move || {
                    for round in 1..ROUNDS {
                        let need = i32::try_from(THREADS * round).unwrap();
                        let query = u32::try_from(id).unwrap() + need.unsigned_abs();
                        let mut locker = ActorLocker::new(&state);
                        stage(&stages[0], need);
                        nodes[id].request.store(0, Ordering::Relaxed);
                        nodes[id].response.store(0, Ordering::Relaxed);
                        stage(&stages[1], need);
                        if locker.try_lock() {
                            nodes[id]
                                .response
                                .store(query.wrapping_mul(query), Ordering::Relaxed);
                        } else {
                            nodes[id].request.store(query, Ordering::Release);
                            locker.add_signals(ActorSignals::one(Signal::Cpu));
                        }
                        while locker.own_lock() {
                            let mut flags = locker.flags();
                            if flags.has_signals() {
                                do_work(&nodes);
                            }
                            flags.clear_signals();
                            locker.try_unlock(flags);
                        }

                        stage(&stages[2], need);
                        if id == 0 {
                            assert!(locker.add_signals(ActorSignals::new()));
                            assert!(!locker.flags().has_signals());
                            assert!(locker.try_unlock(locker.flags()));
                            for (other, node) in nodes.iter().enumerate() {
                                let q = u32::try_from(other).unwrap() + need.unsigned_abs();
                                assert_eq!(
                                    node.response.load(Ordering::Acquire),
                                    q.wrapping_mul(q),
                                    "thread {other} round {round}"
                                );
                            }
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }
}
