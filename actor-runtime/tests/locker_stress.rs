//! Many threads hammer one state word with signals. Whoever wins the lock
//! processes; everyone else only sets bits. No signal may be lost and no
//! two threads may own the word at once.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use actor_runtime::locker::ActorLocker;
use actor_runtime::state::{ActorSignals, ActorState, Signal};

const THREADS: usize = 8;
const SENDS: usize = 50_000;

struct Shared {
    state: ActorState,
    in_critical: AtomicBool,
    sent: AtomicUsize,
    seen: AtomicUsize,
    acquisitions: AtomicUsize,
}

fn enter(shared: &Shared) {
    assert!(
        !shared.in_critical.swap(true, Ordering::SeqCst),
        "two lock owners at once"
    );
}

fn leave(shared: &Shared) {
    shared.in_critical.store(false, Ordering::SeqCst);
}

#[test]
fn signals_are_never_lost() {
    common::init_test_logging();
    let shared = Arc::new(Shared {
        state: ActorState::default(),
        in_critical: AtomicBool::new(false),
        sent: AtomicUsize::new(0),
        seen: AtomicUsize::new(0),
        acquisitions: AtomicUsize::new(0),
    });
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let shared = Arc::clone(&shared);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..SENDS {
                    shared.sent.fetch_add(1, Ordering::SeqCst);
                    let mut locker = ActorLocker::new(&shared.state);
                    if !locker.add_signals(ActorSignals::one(Signal::Wakeup)) {
                        continue;
                    }
                    shared.acquisitions.fetch_add(1, Ordering::Relaxed);
                    enter(&shared);
                    loop {
                        let mut flags = locker.flags();
                        if flags.signals().has_signal(Signal::Wakeup) {
                            let sent = shared.sent.load(Ordering::SeqCst);
                            shared.seen.fetch_max(sent, Ordering::SeqCst);
                        }
                        flags.clear_signals();
                        leave(&shared);
                        if locker.try_unlock(flags) {
                            break;
                        }
                        enter(&shared);
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let total = THREADS * SENDS;
    assert_eq!(shared.sent.load(Ordering::SeqCst), total);
    assert_eq!(shared.seen.load(Ordering::SeqCst), total);
    assert!(shared.acquisitions.load(Ordering::Relaxed) > 0);
    let word = shared.state.flags();
    assert!(!word.is_locked());
    assert!(!word.has_signals());
}

#[test]
fn closed_word_rejects_signals() {
    let state = ActorState::default();
    let mut owner = ActorLocker::new(&state);
    assert!(owner.try_lock());
    owner.close();

    let mut late = ActorLocker::new(&state);
    assert!(!late.add_signals(ActorSignals::one(Signal::Kill)));
    assert!(!late.try_lock());
    let word = state.flags();
    assert!(word.is_closed());
    assert!(!word.has_signals());
}
