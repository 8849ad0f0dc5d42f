//! Scheduler threads.
//!
//! A [`Scheduler`] drives one scheduler id of a [`SchedulerGroup`]:
//!
//! - **CPU workers** (`cpu_threads` OS threads). Each owns a local
//!   [`StealingQueue`]. A worker takes work from its local ring, else
//!   steals from a random sibling, else pops the shared MPMC queue, else
//!   idles through the [`MpmcWaiter`]. Every `global_queue_interval` ticks
//!   it looks at the shared queue first.
//! - **The IO thread**, which is whichever thread calls [`Scheduler::run`].
//!   Each iteration delivers `Alarm` to every actor whose deadline has
//!   passed, runs every actor queued for polling, then blocks in the
//!   reactor until the next deadline, a new queue entry, or `timeout`.
//!
//! Every thread runs with a [`SchedulerContext`] installed in a
//! thread-local. Sends made on that thread use the context as their
//! dispatcher, which is what lets an idle actor of the same scheduler run
//! inline.

use std::cell::{RefCell, RefMut};
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use polling::Event;

use crate::actor::ActorInfoPtr;
use crate::error::{Error, Result};
use crate::executor::{ActorExecutor, ExecutorOptions, SchedulerDispatcher};
use crate::group::{Counters, GroupShared, QueueEntry, SchedulerGroup, SchedulerShared};
use crate::internal::rng::Xorshift64;
use crate::internal::thread_id;
use crate::mpsc::Reader;
use crate::state::{ActorSignals, SchedulerId, Signal};
use crate::stealing::{StealingQueue, Stealer};

// ── Thread-local context ────────────────────────────────────────────────

thread_local! {
    /// Context of the scheduler thread running on this OS thread.
    static CURRENT: RefCell<Option<Rc<SchedulerContext>>> = const { RefCell::new(None) };
}

/// The context installed on this thread, if any.
pub(crate) fn current_context() -> Option<Rc<SchedulerContext>> {
    CURRENT
        .try_with(|current| current.borrow().clone())
        .ok()
        .flatten()
}

/// Installs a context and restores the previous one on drop.
struct ContextGuard {
    previous: Option<Rc<SchedulerContext>>,
}

impl ContextGuard {
    fn enter(ctx: Rc<SchedulerContext>) -> Self {
        let previous = CURRENT.with(|current| current.replace(Some(ctx)));
        Self { previous }
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        // The replaced context is dropped outside the borrow: dropping it
        // may release actors that send on the way out.
        let replaced = CURRENT.try_with(|current| current.replace(previous));
        drop(replaced);
    }
}

/// Dispatcher for the thread it is installed on.
pub(crate) struct SchedulerContext {
    group: Arc<GroupShared>,
    scheduler_id: SchedulerId,
    /// Local ring of a CPU worker; `None` on the IO thread.
    local: Option<RefCell<StealingQueue<ActorInfoPtr>>>,
}

impl fmt::Debug for SchedulerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerContext")
            .field("scheduler_id", &self.scheduler_id)
            .field("has_poll", &self.has_poll())
            .finish_non_exhaustive()
    }
}

impl SchedulerContext {
    fn io(group: Arc<GroupShared>, scheduler_id: SchedulerId) -> Self {
        Self {
            group,
            scheduler_id,
            local: None,
        }
    }

    fn cpu(
        group: Arc<GroupShared>,
        scheduler_id: SchedulerId,
        local: StealingQueue<ActorInfoPtr>,
    ) -> Self {
        Self {
            group,
            scheduler_id,
            local: Some(RefCell::new(local)),
        }
    }

    pub(crate) fn group(&self) -> &Arc<GroupShared> {
        &self.group
    }

    pub(crate) fn scheduler_id(&self) -> SchedulerId {
        self.scheduler_id
    }

    /// True on the IO thread.
    pub(crate) fn has_poll(&self) -> bool {
        self.local.is_none()
    }

    /// The worker's local ring, unless this is the IO thread or the ring is
    /// already borrowed further up the stack.
    fn local(&self) -> Option<RefMut<'_, StealingQueue<ActorInfoPtr>>> {
        self.local.as_ref()?.try_borrow_mut().ok()
    }

    /// Runs one queued actor.
    fn execute(&self, scheduler: &SchedulerShared, info: &ActorInfoPtr) {
        Counters::bump(&scheduler.counters.runs);
        let options = ExecutorOptions::default()
            .with_from_queue()
            .with_has_poll(self.has_poll());
        drop(ActorExecutor::new(info, self, options));
    }

    /// Raises `signal` on `info` from this thread, running it inline when
    /// it may.
    fn signal(&self, info: &ActorInfoPtr, signal: Signal) {
        let options = ExecutorOptions::default().with_has_poll(self.has_poll());
        let mut executor = ActorExecutor::new(info, self, options);
        executor.send_signals(ActorSignals::one(signal));
    }
}

impl SchedulerDispatcher for SchedulerContext {
    fn scheduler_id(&self) -> Option<SchedulerId> {
        Some(self.scheduler_id)
    }

    fn add_to_queue(&self, info: ActorInfoPtr, scheduler_id: SchedulerId, need_poll: bool) {
        if !need_poll && scheduler_id == self.scheduler_id {
            if let (Some(mut local), Ok(scheduler)) =
                (self.local(), self.group.scheduler(scheduler_id))
            {
                local.push(info, |overflow| {
                    Counters::bump(&scheduler.counters.overflows);
                    tracing::trace!(
                        %scheduler_id,
                        actor = %overflow.name(),
                        "local ring full, moved to shared queue"
                    );
                    scheduler.cpu_queue.push(Some(overflow));
                });
                drop(local);
                scheduler.cpu_waiter.notify();
                return;
            }
        }
        self.group.add_to_queue(info, scheduler_id, need_poll);
    }

    fn set_alarm_timestamp(&self, info: &ActorInfoPtr, at: Option<Instant>) {
        let target = info.scheduler_id();
        if let Ok(scheduler) = self.group.scheduler(target) {
            let on_io_thread = self.has_poll() && target == self.scheduler_id;
            scheduler.set_alarm(info, at, !on_io_thread);
        }
    }
}

// ── Stats ───────────────────────────────────────────────────────────────

/// Counter snapshot of one scheduler. All counters are cumulative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Actors run after being popped from a dispatch queue.
    pub executor_runs: u64,
    /// Successful steals from a sibling's local ring.
    pub steals: u64,
    /// Actors pushed to the shared queue because a local ring was full.
    pub overflows: u64,
    /// Alarms delivered by the IO thread.
    pub alarms: u64,
    /// Times a CPU worker parked.
    pub parks: u64,
}

// ── CPU worker ──────────────────────────────────────────────────────────

struct CpuWorker {
    ctx: Rc<SchedulerContext>,
    index: usize,
    stealers: Vec<Stealer<ActorInfoPtr>>,
    rng: Xorshift64,
    ticks: u32,
}

impl CpuWorker {
    fn run(mut self) {
        let ctx = Rc::clone(&self.ctx);
        let _guard = ContextGuard::enter(Rc::clone(&ctx));
        let Ok(scheduler) = ctx.group.scheduler(ctx.scheduler_id) else {
            return;
        };
        #[expect(
            clippy::cast_possible_truncation,
            reason = "thread slots are bounded by MAX_THREADS (256)"
        )]
        let worker_id = thread_id::current() as u32;

        let mut yields = 0;
        loop {
            match self.next(scheduler) {
                Some(Some(info)) => {
                    ctx.execute(scheduler, &info);
                    yields = scheduler.cpu_waiter.stop_wait(yields, worker_id);
                }
                Some(None) => {
                    tracing::debug!(
                        scheduler_id = %ctx.scheduler_id,
                        worker = self.index,
                        "cpu worker stopping"
                    );
                    return;
                }
                None => yields = scheduler.cpu_waiter.wait(yields, worker_id),
            }
        }
    }

    /// `Some(None)` is the stop sentinel; `None` means nothing to do.
    fn next(&mut self, scheduler: &SchedulerShared) -> Option<QueueEntry> {
        self.ticks = self.ticks.wrapping_add(1);
        if self.ticks % scheduler.config().global_queue_interval == 0 {
            if let Some(entry) = scheduler.cpu_queue.try_pop() {
                return Some(entry);
            }
        }
        if let Some(mut local) = self.ctx.local() {
            if let Some(info) = local.pop() {
                return Some(Some(info));
            }
            if let Some(info) = steal(
                &mut local,
                &self.stealers,
                self.index,
                &mut self.rng,
                scheduler,
            ) {
                return Some(Some(info));
            }
        }
        scheduler.cpu_queue.try_pop()
    }
}

/// Steals half of a random non-empty sibling's ring into `local`.
fn steal(
    local: &mut StealingQueue<ActorInfoPtr>,
    stealers: &[Stealer<ActorInfoPtr>],
    own_index: usize,
    rng: &mut Xorshift64,
    scheduler: &SchedulerShared,
) -> Option<ActorInfoPtr> {
    let n = stealers.len();
    if n <= 1 {
        return None;
    }
    let start = rng.below(n);
    for i in 0..n {
        let victim = (start + i) % n;
        if victim == own_index || stealers[victim].is_empty() {
            continue;
        }
        if let Some(info) = local.steal_from(&stealers[victim]) {
            Counters::bump(&scheduler.counters.steals);
            tracing::trace!(
                scheduler_id = %scheduler.id(),
                thief = own_index,
                victim,
                "stole work"
            );
            return Some(info);
        }
    }
    None
}

// ── Scheduler ───────────────────────────────────────────────────────────

/// Threads of one scheduler id. See the module docs.
///
/// The value is tied to the thread that created it: that thread is the IO
/// thread. Dropping it stops the whole group and joins the CPU workers.
pub struct Scheduler {
    group: Arc<GroupShared>,
    id: SchedulerId,
    io_context: Rc<SchedulerContext>,
    io_reader: Reader<QueueEntry>,
    events: Vec<Event>,
    cpu_threads: Vec<JoinHandle<()>>,
    started: bool,
    stopped: bool,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("id", &self.id)
            .field("cpu_threads", &self.cpu_threads.len())
            .field("stopped", &self.stopped)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Claims scheduler `id` of `group`. No threads are spawned until
    /// [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// [`Error::SchedulerOutOfRange`] for an id the group lacks and
    /// [`Error::SchedulerTaken`] if another `Scheduler` already drives it.
    pub fn new(group: &SchedulerGroup, id: SchedulerId) -> Result<Self> {
        let shared = Arc::clone(group.shared());
        let scheduler = shared.scheduler(id)?;
        if scheduler.taken.swap(true, Ordering::AcqRel) {
            return Err(Error::SchedulerTaken(id));
        }
        shared.scheduler_started();
        Ok(Self {
            io_context: Rc::new(SchedulerContext::io(Arc::clone(&shared), id)),
            group: shared,
            id,
            io_reader: Reader::new(),
            events: Vec::new(),
            cpu_threads: Vec::new(),
            started: false,
            stopped: false,
        })
    }

    #[must_use]
    pub fn id(&self) -> SchedulerId {
        self.id
    }

    #[must_use]
    pub fn group(&self) -> SchedulerGroup {
        SchedulerGroup::from_shared(Arc::clone(&self.group))
    }

    fn shared(&self) -> &SchedulerShared {
        match self.group.scheduler(self.id) {
            Ok(scheduler) => scheduler,
            Err(err) => unreachable!("scheduler claimed in new(): {err}"),
        }
    }

    /// Spawns the CPU workers. Calling it again is a no-op.
    ///
    /// # Errors
    ///
    /// [`Error::Io`] if a thread cannot be spawned. Workers spawned before
    /// the failure keep running until the scheduler is dropped.
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }
        self.started = true;
        let config = self.shared().config().clone();
        let (locals, stealers): (Vec<_>, Vec<_>) = (0..config.cpu_threads)
            .map(|_| StealingQueue::<ActorInfoPtr>::new(config.local_queue_capacity))
            .unzip();
        for (index, local) in locals.into_iter().enumerate() {
            let group = Arc::clone(&self.group);
            let stealers = stealers.clone();
            let id = self.id;
            let handle = thread::Builder::new()
                .name(format!("{}-s{}-cpu{index}", config.thread_name_prefix, id))
                .spawn(move || {
                    CpuWorker {
                        ctx: Rc::new(SchedulerContext::cpu(group, id, local)),
                        index,
                        stealers,
                        rng: Xorshift64::from_thread(),
                        ticks: 0,
                    }
                    .run();
                })?;
            self.cpu_threads.push(handle);
        }
        tracing::info!(
            scheduler_id = %self.id,
            cpu_threads = config.cpu_threads,
            "scheduler started"
        );
        Ok(())
    }

    /// Runs `f` on this thread as the IO thread, so sends and
    /// [`create_actor`](crate::send::create_actor) inside it use this
    /// scheduler.
    pub fn run_in_context<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = ContextGuard::enter(Rc::clone(&self.io_context));
        f()
    }

    /// One IO iteration, blocking for at most `timeout`. Returns `false`
    /// once the group is stopping; the CPU workers are joined by then.
    pub fn run(&mut self, timeout: Duration) -> bool {
        if self.stopped {
            return false;
        }
        let guard = ContextGuard::enter(Rc::clone(&self.io_context));
        let keep_going = !self.group.is_stop_requested() && self.run_once(timeout);
        drop(guard);
        if !keep_going {
            self.do_stop();
        }
        keep_going
    }

    fn run_once(&mut self, timeout: Duration) -> bool {
        let ctx = Rc::clone(&self.io_context);
        let scheduler = match self.group.scheduler(self.id) {
            Ok(scheduler) => scheduler,
            Err(_) => return false,
        };

        let now = Instant::now();
        let due: Vec<ActorInfoPtr> = {
            let mut timers = scheduler.timers();
            std::iter::from_fn(|| timers.pop_due(now)).collect()
        };
        for info in &due {
            Counters::bump(&scheduler.counters.alarms);
            tracing::trace!(actor = %info.name(), "alarm due");
            ctx.signal(info, Signal::Alarm);
        }

        scheduler.io_queue.reader_pop_all(&mut self.io_reader);
        let mut processed = 0usize;
        while let Some(entry) = self.io_reader.read() {
            let Some(info) = entry else {
                tracing::debug!(scheduler_id = %self.id, "io thread stopping");
                return false;
            };
            ctx.execute(scheduler, &info);
            processed += 1;
        }

        let mut wait = if processed == 0 { timeout } else { Duration::ZERO };
        if let Some(deadline) = scheduler.timers().peek_deadline() {
            wait = wait.min(deadline.saturating_duration_since(Instant::now()));
        }
        match scheduler.reactor().poll(&mut self.events, Some(wait)) {
            Ok(ready) => {
                for info in &ready {
                    ctx.signal(info, Signal::Io);
                }
            }
            Err(err) => tracing::warn!(scheduler_id = %self.id, %err, "reactor wait failed"),
        }
        true
    }

    /// Joins the CPU workers and releases this scheduler's slot in the
    /// group's active count.
    fn do_stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        for handle in self.cpu_threads.drain(..) {
            if handle.join().is_err() {
                tracing::warn!(scheduler_id = %self.id, "cpu worker panicked");
            }
        }
        while self.io_reader.read().is_some() {}
        self.shared().taken.store(false, Ordering::Release);
        tracing::info!(scheduler_id = %self.id, "scheduler stopped");
        self.group.scheduler_stopped();
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.group.request_stop();
        self.do_stop();
    }
}

// ── Tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{Actor, ActorContext, ActorOptions};
    use crate::config::{GroupConfig, SchedulerConfig};
    use crate::send::{create_actor, send_closure};

    fn group(cpu_threads: usize) -> SchedulerGroup {
        let config = SchedulerConfig::default().with_cpu_threads(cpu_threads);
        SchedulerGroup::new(GroupConfig::uniform(1, config)).unwrap()
    }

    #[derive(Default)]
    struct Recorder {
        seen: Vec<u32>,
    }
    impl Actor for Recorder {}

    #[test]
    fn context_is_scoped() {
        let group = group(0);
        let scheduler = Scheduler::new(&group, SchedulerId::new(0)).unwrap();
        assert!(current_context().is_none());
        let inside = scheduler.run_in_context(|| {
            let ctx = current_context().unwrap();
            assert!(ctx.has_poll());
            let nested = scheduler.run_in_context(|| current_context().is_some());
            nested && current_context().is_some()
        });
        assert!(inside);
        assert!(current_context().is_none());
    }

    #[test]
    fn scheduler_id_can_only_be_claimed_once() {
        let group = group(0);
        let first = Scheduler::new(&group, SchedulerId::new(0)).unwrap();
        let err = Scheduler::new(&group, SchedulerId::new(0)).unwrap_err();
        assert!(matches!(err, Error::SchedulerTaken(_)));
        assert!(matches!(
            Scheduler::new(&group, SchedulerId::new(1)),
            Err(Error::SchedulerOutOfRange { .. })
        ));
        drop(first);
        assert!(group.is_stop_requested());
        group.close();
    }

    #[test]
    fn io_only_scheduler_runs_actor_inline() {
        let group = group(0);
        let mut scheduler = Scheduler::new(&group, SchedulerId::new(0)).unwrap();
        scheduler.start().unwrap();
        let own = scheduler
            .run_in_context(|| {
                create_actor(ActorOptions::new().with_name("rec"), Recorder::default())
            })
            .unwrap();
        assert!(own.get().info().has_poll());

        // First iteration pops the new actor and runs `start_up`.
        assert!(scheduler.run(Duration::ZERO));
        assert_eq!(group.stats(SchedulerId::new(0)).unwrap().executor_runs, 1);

        let (tx, rx) = std::sync::mpsc::channel();
        scheduler.run_in_context(|| {
            send_closure(&own, |a: &mut Recorder, _| a.seen.push(1));
            send_closure(&own, move |a: &mut Recorder, _: &mut ActorContext<'_>| {
                a.seen.push(2);
                tx.send(a.seen.clone()).unwrap();
            });
        });
        // Idle actor on the IO thread's own scheduler: both ran inline.
        assert_eq!(rx.try_recv().unwrap(), vec![1, 2]);

        group.stop();
        assert!(!scheduler.run(Duration::ZERO));
        drop(own);
        drop(scheduler);
        group.close();
    }

    #[test]
    fn idle_workers_record_no_work() {
        let group = group(2);
        let mut scheduler = Scheduler::new(&group, SchedulerId::new(0)).unwrap();
        scheduler.start().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let stats = group.stats(SchedulerId::new(0)).unwrap();
        assert_eq!(
            (stats.executor_runs, stats.steals, stats.overflows, stats.alarms),
            (0, 0, 0, 0)
        );
        drop(scheduler);
        group.close();
    }
}
