//! Per-actor state word.
//!
//! One `u64` per actor packs the signal bitset, the lock/pause/closed/
//! in-queue/shared bits and the owning scheduler id, so every transition
//! the locker makes is a single CAS.
//!
//! ```text
//! bits  0..9   signals (Wakeup, Alarm, Kill, StartUp, TearDown, Pop, Message, Io, Cpu)
//! bit   16     locked
//! bit   17     pause
//! bit   18     closed
//! bit   19     in_queue
//! bit   20     shared      (runs on CPU workers; clear = needs the IO thread)
//! bits  24..32 scheduler id
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

// ── Signals ─────────────────────────────────────────────────────────────

/// Lifecycle events delivered to an actor outside its mailbox. The
/// discriminant is the bit index and also the delivery priority: lower
/// values are handled first.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    Wakeup = 0,
    Alarm = 1,
    Kill = 2,
    StartUp = 3,
    TearDown = 4,
    Pop = 5,
    Message = 6,
    Io = 7,
    Cpu = 8,
}

impl Signal {
    pub const ALL: [Signal; 9] = [
        Signal::Wakeup,
        Signal::Alarm,
        Signal::Kill,
        Signal::StartUp,
        Signal::TearDown,
        Signal::Pop,
        Signal::Message,
        Signal::Io,
        Signal::Cpu,
    ];

    const fn bit(self) -> u32 {
        1 << self as u8
    }
}

const SIGNAL_MASK: u32 = (1 << Signal::ALL.len()) - 1;

/// A set of [`Signal`]s.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct ActorSignals(u32);

impl ActorSignals {
    #[must_use]
    pub const fn new() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn one(signal: Signal) -> Self {
        Self(signal.bit())
    }

    /// Builds a set from raw bits, dropping bits that name no signal.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw & SIGNAL_MASK)
    }

    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn has_signal(self, signal: Signal) -> bool {
        self.0 & signal.bit() != 0
    }

    pub fn add_signal(&mut self, signal: Signal) {
        self.0 |= signal.bit();
    }

    pub fn add_signals(&mut self, other: ActorSignals) {
        self.0 |= other.0;
    }

    pub fn clear_signal(&mut self, signal: Signal) {
        self.0 &= !signal.bit();
    }

    /// Highest-priority signal in the set.
    #[must_use]
    pub fn first_signal(self) -> Option<Signal> {
        if self.0 == 0 {
            return None;
        }
        Signal::ALL.get(self.0.trailing_zeros() as usize).copied()
    }
}

impl From<Signal> for ActorSignals {
    fn from(signal: Signal) -> Self {
        Self::one(signal)
    }
}

impl FromIterator<Signal> for ActorSignals {
    fn from_iter<I: IntoIterator<Item = Signal>>(iter: I) -> Self {
        let mut set = Self::new();
        for signal in iter {
            set.add_signal(signal);
        }
        set
    }
}

impl fmt::Debug for ActorSignals {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set()
            .entries(Signal::ALL.iter().filter(|s| self.has_signal(**s)))
            .finish()
    }
}

// ── Scheduler id ────────────────────────────────────────────────────────

/// Index of a scheduler inside its group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct SchedulerId(u8);

impl SchedulerId {
    #[must_use]
    pub const fn new(id: u8) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn value(self) -> u8 {
        self.0
    }

    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SchedulerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Flags ───────────────────────────────────────────────────────────────

const LOCKED: u64 = 1 << 16;
const PAUSE: u64 = 1 << 17;
const CLOSED: u64 = 1 << 18;
const IN_QUEUE: u64 = 1 << 19;
const SHARED: u64 = 1 << 20;
const SCHEDULER_SHIFT: u32 = 24;
const SCHEDULER_MASK: u64 = 0xFF << SCHEDULER_SHIFT;

/// Decoded value of the state word. Plain data; [`ActorState`] is the
/// atomic home.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct ActorFlags(u64);

macro_rules! flag_accessors {
    ($($get:ident, $set:ident, $bit:ident;)*) => {
        $(
            #[must_use]
            pub const fn $get(self) -> bool {
                self.0 & $bit != 0
            }

            pub fn $set(&mut self, value: bool) {
                if value {
                    self.0 |= $bit;
                } else {
                    self.0 &= !$bit;
                }
            }
        )*
    };
}

impl ActorFlags {
    #[must_use]
    pub const fn new() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    flag_accessors! {
        is_locked, set_locked, LOCKED;
        is_pause, set_pause, PAUSE;
        is_closed, set_closed, CLOSED;
        is_in_queue, set_in_queue, IN_QUEUE;
        is_shared, set_shared, SHARED;
    }

    #[must_use]
    pub const fn scheduler_id(self) -> SchedulerId {
        #[expect(
            clippy::cast_possible_truncation,
            reason = "masked to 8 bits before the cast"
        )]
        let id = ((self.0 & SCHEDULER_MASK) >> SCHEDULER_SHIFT) as u8;
        SchedulerId(id)
    }

    pub fn set_scheduler_id(&mut self, id: SchedulerId) {
        self.0 = (self.0 & !SCHEDULER_MASK) | (u64::from(id.0) << SCHEDULER_SHIFT);
    }

    #[must_use]
    pub const fn signals(self) -> ActorSignals {
        #[expect(
            clippy::cast_possible_truncation,
            reason = "signal bits live in the low 9 bits"
        )]
        let raw = (self.0 & SIGNAL_MASK as u64) as u32;
        ActorSignals(raw)
    }

    #[must_use]
    pub const fn has_signals(self) -> bool {
        self.0 & SIGNAL_MASK as u64 != 0
    }

    pub fn set_signals(&mut self, signals: ActorSignals) {
        self.0 = (self.0 & !u64::from(SIGNAL_MASK)) | u64::from(signals.0);
    }

    pub fn add_signals(&mut self, signals: ActorSignals) {
        self.0 |= u64::from(signals.0);
    }

    pub fn clear_signals(&mut self) {
        self.0 &= !u64::from(SIGNAL_MASK);
    }

    /// Returns the signals and clears them from `self`.
    pub fn take_signals(&mut self) -> ActorSignals {
        let signals = self.signals();
        self.clear_signals();
        signals
    }
}

impl fmt::Debug for ActorFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorFlags")
            .field("locked", &self.is_locked())
            .field("pause", &self.is_pause())
            .field("closed", &self.is_closed())
            .field("in_queue", &self.is_in_queue())
            .field("shared", &self.is_shared())
            .field("scheduler_id", &self.scheduler_id())
            .field("signals", &self.signals())
            .finish()
    }
}

// ── Atomic state ────────────────────────────────────────────────────────

/// The atomic state word itself.
pub struct ActorState {
    word: AtomicU64,
}

impl fmt::Debug for ActorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.flags(), f)
    }
}

impl Default for ActorState {
    fn default() -> Self {
        Self::new(ActorFlags::new())
    }
}

impl ActorState {
    #[must_use]
    pub const fn new(flags: ActorFlags) -> Self {
        Self {
            word: AtomicU64::new(flags.0),
        }
    }

    /// Acquire load.
    #[must_use]
    pub fn flags(&self) -> ActorFlags {
        ActorFlags(self.word.load(Ordering::Acquire))
    }

    /// Relaxed load, for fields that never change after creation (the
    /// scheduler id and the shared bit) or for diagnostics.
    #[must_use]
    pub fn flags_unsafe(&self) -> ActorFlags {
        ActorFlags(self.word.load(Ordering::Relaxed))
    }

    /// Plain store; only valid before the actor is published.
    pub fn set_flags_unsafe(&self, flags: ActorFlags) {
        self.word.store(flags.0, Ordering::Relaxed);
    }

    /// CAS from `*current` to `new`. On failure `*current` is refreshed
    /// with the observed value.
    pub fn compare_exchange(&self, current: &mut ActorFlags, new: ActorFlags) -> bool {
        match self
            .word
            .compare_exchange(current.0, new.0, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(actual) => {
                current.0 = actual;
                false
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn signals_follow_priority_order() {
        let mut signals: ActorSignals = [Signal::Kill, Signal::Alarm, Signal::Message, Signal::Cpu]
            .into_iter()
            .collect();
        let mut order = Vec::new();
        while let Some(signal) = signals.first_signal() {
            order.push(signal);
            signals.clear_signal(signal);
        }
        assert_eq!(
            order,
            vec![Signal::Alarm, Signal::Kill, Signal::Message, Signal::Cpu]
        );
        assert!(signals.is_empty());
    }

    #[test]
    fn flags_keep_fields_independent() {
        let mut flags = ActorFlags::new();
        flags.set_scheduler_id(SchedulerId::new(123));
        flags.set_locked(true);
        flags.set_in_queue(true);
        flags.add_signals(ActorSignals::one(Signal::Kill));
        flags.set_pause(true);
        flags.set_shared(true);

        assert_eq!(flags.scheduler_id(), SchedulerId::new(123));
        assert!(flags.is_locked());
        assert!(flags.is_in_queue());
        assert!(flags.is_pause());
        assert!(flags.is_shared());
        assert!(!flags.is_closed());
        assert_eq!(flags.signals(), ActorSignals::one(Signal::Kill));

        flags.set_locked(false);
        flags.set_closed(true);
        assert!(!flags.is_locked());
        assert!(flags.is_closed());
        assert_eq!(flags.take_signals(), ActorSignals::one(Signal::Kill));
        assert!(!flags.has_signals());
        assert_eq!(flags.scheduler_id(), SchedulerId::new(123));
    }

    #[test]
    fn state_cas_refreshes_expected_on_failure() {
        let state = ActorState::default();
        let mut stale = ActorFlags::new();
        let mut locked = ActorFlags::new();
        locked.set_locked(true);
        assert!(state.compare_exchange(&mut stale, locked));

        let mut expected = ActorFlags::new();
        assert!(!state.compare_exchange(&mut expected, ActorFlags::new()));
        assert_eq!(expected, locked);
    }

    fn any_signal() -> impl Strategy<Value = Signal> {
        (0..Signal::ALL.len()).prop_map(|i| Signal::ALL[i])
    }

    proptest! {
        #[test]
        fn raw_bits_outside_the_signal_range_are_ignored(raw in any::<u32>()) {
            let signals = ActorSignals::from_raw(raw);
            prop_assert_eq!(signals.raw() & !SIGNAL_MASK, 0);
        }

        #[test]
        fn first_signal_is_the_minimum(set in proptest::collection::vec(any_signal(), 1..9)) {
            let signals: ActorSignals = set.iter().copied().collect();
            let min = set.iter().map(|s| *s as u8).min();
            prop_assert_eq!(signals.first_signal().map(|s| s as u8), min);
        }

        #[test]
        fn signal_updates_never_touch_flag_bits(
            raw in any::<u64>(),
            set in proptest::collection::vec(any_signal(), 0..9),
        ) {
            let mut flags = ActorFlags::from_raw(raw);
            let before = flags;
            flags.set_signals(set.iter().copied().collect());
            prop_assert_eq!(flags.raw() & !u64::from(SIGNAL_MASK), before.raw() & !u64::from(SIGNAL_MASK));
            prop_assert_eq!(flags.scheduler_id(), before.scheduler_id());
            prop_assert_eq!(flags.is_locked(), before.is_locked());
        }
    }
}
