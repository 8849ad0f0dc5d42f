//! Scheduler groups.
//!
//! A group owns the dispatch state of all of its schedulers up front: the
//! shared CPU queue and its waiter, the IO queue with its reactor and the
//! timer heap. A [`Scheduler`](crate::scheduler::Scheduler) attaches the
//! threads to one of them. The group also carries the only process-wide
//! coordination state: the stop flag and the count of live schedulers.
//!
//! Lifecycle:
//!
//! ```text
//! SchedulerGroup::new ──> Scheduler::new + start (per id) ──> ... run ...
//!        ──> stop() ──> drop every Scheduler ──> close()
//! ```
//!
//! Dispatch-queue entries are `Option<ActorInfoPtr>`; `None` is the stop
//! sentinel, one per CPU worker and one for the IO thread.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Instant;

use crate::actor::{Actor, ActorInfoPtr, ActorOptions};
use crate::config::{GroupConfig, SchedulerConfig};
use crate::error::{Error, Result};
use crate::executor::SchedulerDispatcher;
use crate::handle::ActorOwn;
use crate::mpmc::MpmcQueue;
use crate::mpsc::Reader;
use crate::pollable::PollableQueue;
use crate::reactor::Reactor;
use crate::scheduler::SchedulerStats;
use crate::send;
use crate::state::SchedulerId;
use crate::timer_heap::TimerHeap;
use crate::waiter::MpmcWaiter;

/// A dispatch-queue entry; `None` asks the consumer to stop.
pub(crate) type QueueEntry = Option<ActorInfoPtr>;

// ── Per-scheduler state ─────────────────────────────────────────────────

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) runs: AtomicU64,
    pub(crate) steals: AtomicU64,
    pub(crate) overflows: AtomicU64,
    pub(crate) alarms: AtomicU64,
}

impl Counters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Queues and timers of one scheduler, reachable from every thread of the
/// group.
pub(crate) struct SchedulerShared {
    id: SchedulerId,
    config: SchedulerConfig,
    pub(crate) cpu_queue: MpmcQueue<QueueEntry>,
    pub(crate) cpu_waiter: MpmcWaiter,
    pub(crate) io_queue: PollableQueue<QueueEntry>,
    timers: Mutex<TimerHeap>,
    pub(crate) counters: Counters,
    /// Set while a `Scheduler` drives this id.
    pub(crate) taken: AtomicBool,
}

impl fmt::Debug for SchedulerShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerShared")
            .field("id", &self.id)
            .field("cpu_threads", &self.config.cpu_threads)
            .field("counters", &self.counters)
            .finish_non_exhaustive()
    }
}

impl SchedulerShared {
    fn new(id: SchedulerId, config: SchedulerConfig) -> Result<Self> {
        let reactor = Arc::new(Reactor::new()?);
        Ok(Self {
            id,
            cpu_queue: MpmcQueue::with_block_size(config.mpmc_block_size),
            cpu_waiter: MpmcWaiter::new(config.spin_rounds, config.sleep_rounds, config.park_timeout),
            io_queue: PollableQueue::new(reactor),
            timers: Mutex::new(TimerHeap::new()),
            counters: Counters::default(),
            taken: AtomicBool::new(false),
            config,
        })
    }

    pub(crate) fn id(&self) -> SchedulerId {
        self.id
    }

    pub(crate) fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub(crate) fn cpu_threads(&self) -> usize {
        self.config.cpu_threads
    }

    pub(crate) fn reactor(&self) -> &Arc<Reactor> {
        self.io_queue.reactor()
    }

    pub(crate) fn timers(&self) -> MutexGuard<'_, TimerHeap> {
        match self.timers.lock() {
            Ok(g) => g,
            Err(e) => e.into_inner(),
        }
    }

    /// Hands `info` to the IO thread or the CPU workers.
    pub(crate) fn push(&self, info: ActorInfoPtr, need_poll: bool) {
        if need_poll || self.cpu_threads() == 0 {
            self.io_queue.writer_put(Some(info));
        } else {
            self.cpu_queue.push(Some(info));
            self.cpu_waiter.notify();
        }
    }

    /// Moves `info`'s timer entry. Wakes the IO thread when the earliest
    /// deadline moves forward, unless the caller is that thread.
    pub(crate) fn set_alarm(&self, info: &ActorInfoPtr, at: Option<Instant>, wake_io: bool) {
        let mut timers = self.timers();
        let before = timers.peek_deadline();
        timers.set(info, at);
        let after = timers.peek_deadline();
        drop(timers);
        let earlier = match (before, after) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(before), Some(after)) => after < before,
        };
        if earlier && wake_io {
            self.reactor().notify();
        }
    }

    fn request_stop(&self) {
        for _ in 0..self.cpu_threads() {
            self.cpu_queue.push(None);
            self.cpu_waiter.notify();
        }
        self.io_queue.writer_put(None);
    }

    /// Drops everything still queued; returns how many entries went.
    fn drain(&self) -> usize {
        let mut dropped = 0;
        let mut reader = Reader::new();
        self.io_queue.reader_pop_all(&mut reader);
        while let Some(entry) = reader.read() {
            dropped += usize::from(entry.is_some());
        }
        while let Some(entry) = self.cpu_queue.try_pop() {
            dropped += usize::from(entry.is_some());
        }
        let timers = self.timers().drain();
        dropped += timers.len();
        dropped
    }

    pub(crate) fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            executor_runs: self.counters.runs.load(Ordering::Relaxed),
            steals: self.counters.steals.load(Ordering::Relaxed),
            overflows: self.counters.overflows.load(Ordering::Relaxed),
            alarms: self.counters.alarms.load(Ordering::Relaxed),
            parks: self.cpu_waiter.parks(),
        }
    }
}

// ── Group state ─────────────────────────────────────────────────────────

pub(crate) struct GroupShared {
    schedulers: Vec<SchedulerShared>,
    stop_requested: AtomicBool,
    active: Mutex<usize>,
    active_changed: Condvar,
}

impl fmt::Debug for GroupShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupShared")
            .field("schedulers", &self.schedulers.len())
            .field("stop_requested", &self.is_stop_requested())
            .finish_non_exhaustive()
    }
}

impl GroupShared {
    /// # Errors
    ///
    /// [`Error::SchedulerOutOfRange`] if the group has no such scheduler.
    pub(crate) fn scheduler(&self, id: SchedulerId) -> Result<&SchedulerShared> {
        self.schedulers
            .get(id.index())
            .ok_or(Error::SchedulerOutOfRange {
                id,
                count: self.schedulers.len(),
            })
    }

    pub(crate) fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    /// Sets the stop flag once and wakes every consumer of every queue.
    pub(crate) fn request_stop(&self) {
        if self
            .stop_requested
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        tracing::debug!(schedulers = self.schedulers.len(), "scheduler group stop requested");
        for scheduler in &self.schedulers {
            scheduler.request_stop();
        }
    }

    fn active(&self) -> MutexGuard<'_, usize> {
        match self.active.lock() {
            Ok(g) => g,
            Err(e) => e.into_inner(),
        }
    }

    pub(crate) fn scheduler_started(&self) {
        *self.active() += 1;
    }

    pub(crate) fn scheduler_stopped(&self) {
        let mut active = self.active();
        *active -= 1;
        drop(active);
        self.active_changed.notify_all();
    }
}

impl SchedulerDispatcher for GroupShared {
    fn scheduler_id(&self) -> Option<SchedulerId> {
        None
    }

    fn add_to_queue(&self, info: ActorInfoPtr, scheduler_id: SchedulerId, need_poll: bool) {
        match self.scheduler(scheduler_id) {
            Ok(scheduler) => scheduler.push(info, need_poll),
            Err(err) => tracing::warn!(actor = %info.name(), %err, "actor dropped from dispatch"),
        }
    }

    fn set_alarm_timestamp(&self, info: &ActorInfoPtr, at: Option<Instant>) {
        if let Ok(scheduler) = self.scheduler(info.scheduler_id()) {
            scheduler.set_alarm(info, at, true);
        }
    }
}

// ── Public handle ───────────────────────────────────────────────────────

/// Cloneable handle to a set of schedulers that stop and close together.
#[derive(Clone)]
pub struct SchedulerGroup {
    shared: Arc<GroupShared>,
}

impl fmt::Debug for SchedulerGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.shared, f)
    }
}

impl SchedulerGroup {
    /// Validates `config` and builds every scheduler's queues and reactor.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] for invalid tuning, [`Error::Io`] if a poller
    /// cannot be created.
    pub fn new(config: GroupConfig) -> Result<Self> {
        config.validate()?;
        let schedulers = config
            .schedulers
            .into_iter()
            .enumerate()
            .map(|(i, cfg)| {
                #[expect(
                    clippy::cast_possible_truncation,
                    reason = "validate() caps the group at 255 schedulers"
                )]
                let id = SchedulerId::new(i as u8);
                SchedulerShared::new(id, cfg)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            shared: Arc::new(GroupShared {
                schedulers,
                stop_requested: AtomicBool::new(false),
                active: Mutex::new(0),
                active_changed: Condvar::new(),
            }),
        })
    }

    pub(crate) fn from_shared(shared: Arc<GroupShared>) -> Self {
        Self { shared }
    }

    pub(crate) fn shared(&self) -> &Arc<GroupShared> {
        &self.shared
    }

    #[must_use]
    pub fn scheduler_count(&self) -> usize {
        self.shared.schedulers.len()
    }

    /// Registers `actor` from outside any scheduler thread. Without a
    /// scheduler id in `options` it lands on scheduler 0.
    ///
    /// # Errors
    ///
    /// [`Error::SchedulerOutOfRange`] for a scheduler the group lacks.
    pub fn create_actor<A: Actor>(&self, options: ActorOptions, actor: A) -> Result<ActorOwn<A>> {
        send::register(&self.shared, &*self.shared, options, actor)
    }

    /// Asks every scheduler of the group to stop. Idempotent.
    pub fn stop(&self) {
        self.shared.request_stop();
    }

    #[must_use]
    pub fn is_stop_requested(&self) -> bool {
        self.shared.is_stop_requested()
    }

    /// Counter snapshot for one scheduler.
    ///
    /// # Errors
    ///
    /// [`Error::SchedulerOutOfRange`] if the group has no such scheduler.
    pub fn stats(&self, id: SchedulerId) -> Result<SchedulerStats> {
        Ok(self.shared.scheduler(id)?.stats())
    }

    /// Waits for every scheduler to be dropped, then drops whatever is
    /// still queued or armed.
    ///
    /// # Panics
    ///
    /// Panics unless [`stop`](Self::stop) was called first.
    pub fn close(&self) {
        assert!(
            self.is_stop_requested(),
            "close of a scheduler group that was never asked to stop"
        );
        {
            let mut active = self.shared.active();
            while *active > 0 {
                active = match self.shared.active_changed.wait(active) {
                    Ok(g) => g,
                    Err(e) => e.into_inner(),
                };
            }
        }
        // Dropping an entry may hang up actors it owned, which queues them
        // again.
        let mut dropped = 0;
        loop {
            let n: usize = self.shared.schedulers.iter().map(SchedulerShared::drain).sum();
            if n == 0 {
                break;
            }
            dropped += n;
        }
        tracing::info!(
            schedulers = self.scheduler_count(),
            dropped,
            "scheduler group closed"
        );
    }
}

// ── Tests ───────────────────────────────────────────────────────────────
