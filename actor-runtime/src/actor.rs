//! Actors and the per-actor control block.
//!
//! An [`Actor`] is user behavior. It lives inside an [`ActorInfo`], the
//! reference-counted home that also holds the state word, the mailbox and
//! the alarm. Handlers receive an [`ActorContext`] through which they stop,
//! yield, arm timeouts and reach the scheduler's reactor.
//!
//! The actor payload and the alarm are only touched by the thread that
//! currently owns the actor lock (see [`crate::locker`]).

use std::any::{Any, TypeId};
use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::group::{GroupShared, SchedulerGroup};
use crate::handle::ActorId;
use crate::mailbox::{ActorMailbox, EMPTY_LINK_TOKEN};
use crate::reactor::{Interest, IoToken, RawSource, Readiness};
use crate::state::{ActorFlags, ActorSignals, ActorState, SchedulerId, Signal};

/// Shared pointer to an actor's control block.
pub type ActorInfoPtr = Arc<ActorInfo>;

// ── Actor trait ─────────────────────────────────────────────────────────

/// Upcast to [`Any`], implemented for every `'static` type.
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// User behavior scheduled by the runtime.
///
/// Every handler has a default, so `impl Actor for T {}` is a valid actor
/// that only reacts to messages. Handlers run to completion; there is no
/// preemption.
pub trait Actor: AsAny + Send {
    /// First handler to run. Yields by default, which leads to `wake_up`.
    fn start_up(&mut self, ctx: &mut ActorContext<'_>) {
        ctx.yield_now();
    }

    /// Last handler to run, right before the actor is dropped.
    fn tear_down(&mut self, _ctx: &mut ActorContext<'_>) {}

    /// The owning handle was dropped. Stops the actor by default.
    fn hang_up(&mut self, ctx: &mut ActorContext<'_>) {
        ctx.stop();
    }

    /// A shared handle was dropped; its token is in `ctx.link_token()`.
    fn hang_up_shared(&mut self, _ctx: &mut ActorContext<'_>) {}

    /// `Wakeup`, `Io` and `Cpu` signals.
    fn wake_up(&mut self, ctx: &mut ActorContext<'_>) {
        self.run_loop(ctx);
    }

    /// The alarm armed through the context is due.
    fn alarm(&mut self, ctx: &mut ActorContext<'_>) {
        self.run_loop(ctx);
    }

    /// Shared fallback for `wake_up` and `alarm`.
    fn run_loop(&mut self, _ctx: &mut ActorContext<'_>) {}
}

// ── Options ─────────────────────────────────────────────────────────────

/// Creation options for an actor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActorOptions {
    pub(crate) name: String,
    pub(crate) scheduler_id: Option<SchedulerId>,
    pub(crate) poll: bool,
}

impl ActorOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Pins the actor to a scheduler. Defaults to the creating thread's
    /// scheduler.
    #[must_use]
    pub fn on_scheduler(mut self, id: SchedulerId) -> Self {
        self.scheduler_id = Some(id);
        self
    }

    /// Poll affinity: the actor runs only on its scheduler's IO thread.
    #[must_use]
    pub fn with_poll(mut self, poll: bool) -> Self {
        self.poll = poll;
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn scheduler_id(&self) -> Option<SchedulerId> {
        self.scheduler_id
    }

    #[must_use]
    pub fn has_poll(&self) -> bool {
        self.poll
    }
}

// ── Control block ───────────────────────────────────────────────────────

pub(crate) const NOT_IN_HEAP: usize = usize::MAX;

/// Reference-counted home of one actor instance.
pub struct ActorInfo {
    state: ActorState,
    mailbox: ActorMailbox,
    actor: UnsafeCell<Option<Box<dyn Actor>>>,
    alarm: UnsafeCell<Option<Instant>>,
    /// Index in the owning scheduler's timer heap; guarded by its mutex.
    heap_pos: AtomicUsize,
    name: String,
    type_id: TypeId,
    group: Weak<GroupShared>,
}

// SAFETY: `actor` and `alarm` are only accessed through the unsafe methods
// below, whose contract requires holding the actor lock. Everything else is
// atomic or immutable.
unsafe impl Sync for ActorInfo {}

impl fmt::Debug for ActorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorInfo")
            .field("name", &self.name)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl ActorInfo {
    /// Builds an unlocked control block with `StartUp` pending and the
    /// `in_queue` bit set. The caller must enqueue it exactly once.
    pub(crate) fn new(
        actor: Box<dyn Actor>,
        options: &ActorOptions,
        scheduler_id: SchedulerId,
        group: Weak<GroupShared>,
    ) -> ActorInfoPtr {
        let mut flags = ActorFlags::new();
        flags.set_scheduler_id(scheduler_id);
        flags.set_shared(!options.poll);
        flags.set_in_queue(true);
        flags.set_signals(ActorSignals::one(Signal::StartUp));
        let type_id = (*actor).as_any().type_id();
        Arc::new(Self {
            state: ActorState::new(flags),
            mailbox: ActorMailbox::new(),
            actor: UnsafeCell::new(Some(actor)),
            alarm: UnsafeCell::new(None),
            heap_pos: AtomicUsize::new(NOT_IN_HEAP),
            name: options.name.clone(),
            type_id,
            group,
        })
    }

    /// A control block that belongs to no scheduler group. Useful for
    /// driving executors by hand.
    #[must_use]
    pub fn detached(actor: Box<dyn Actor>, options: &ActorOptions) -> ActorInfoPtr {
        Self::new(
            actor,
            options,
            options.scheduler_id.unwrap_or_default(),
            Weak::new(),
        )
    }

    #[must_use]
    pub fn state(&self) -> &ActorState {
        &self.state
    }

    #[must_use]
    pub fn mailbox(&self) -> &ActorMailbox {
        &self.mailbox
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn scheduler_id(&self) -> SchedulerId {
        self.state.flags_unsafe().scheduler_id()
    }

    #[must_use]
    pub fn has_poll(&self) -> bool {
        !self.state.flags_unsafe().is_shared()
    }

    /// `false` once the actor has been torn down.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        !self.state.flags().is_closed()
    }

    pub(crate) fn actor_type_id(&self) -> TypeId {
        self.type_id
    }

    pub(crate) fn group(&self) -> Option<Arc<GroupShared>> {
        self.group.upgrade()
    }

    pub(crate) fn heap_pos(&self) -> usize {
        self.heap_pos.load(Ordering::Relaxed)
    }

    pub(crate) fn set_heap_pos(&self, pos: usize) {
        self.heap_pos.store(pos, Ordering::Relaxed);
    }

    /// Moves the payload out for the duration of one executor run.
    ///
    /// # Safety
    ///
    /// The caller must hold the actor lock.
    pub(crate) unsafe fn take_actor(&self) -> Option<Box<dyn Actor>> {
        // SAFETY: lock ownership gives exclusive access to the cell.
        unsafe { (*self.actor.get()).take() }
    }

    /// # Safety
    ///
    /// The caller must hold the actor lock.
    pub(crate) unsafe fn put_actor(&self, actor: Box<dyn Actor>) {
        // SAFETY: lock ownership gives exclusive access to the cell.
        unsafe { *self.actor.get() = Some(actor) };
    }

    /// # Safety
    ///
    /// The caller must hold the actor lock.
    pub(crate) unsafe fn alarm(&self) -> Option<Instant> {
        // SAFETY: lock ownership gives exclusive access to the cell.
        unsafe { *self.alarm.get() }
    }

    /// # Safety
    ///
    /// The caller must hold the actor lock.
    pub(crate) unsafe fn set_alarm(&self, at: Option<Instant>) {
        // SAFETY: lock ownership gives exclusive access to the cell.
        unsafe { *self.alarm.get() = at };
    }
}

// ── Execution context ───────────────────────────────────────────────────

/// Handle passed to every actor handler.
///
/// `stop`, `yield_now` and a big message pausing the actor end the current
/// run; arming the alarm does not.
pub struct ActorContext<'a> {
    info: &'a ActorInfoPtr,
    stop: bool,
    pause: bool,
    yielded: bool,
    alarm: Option<Instant>,
    link_token: u64,
}

impl fmt::Debug for ActorContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorContext")
            .field("actor", &self.info.name())
            .field("stop", &self.stop)
            .field("pause", &self.pause)
            .field("yielded", &self.yielded)
            .field("alarm", &self.alarm)
            .field("link_token", &self.link_token)
            .finish()
    }
}

impl<'a> ActorContext<'a> {
    pub(crate) fn new(info: &'a ActorInfoPtr) -> Self {
        Self {
            info,
            stop: false,
            pause: false,
            yielded: false,
            alarm: None,
            link_token: EMPTY_LINK_TOKEN,
        }
    }

    /// Ends the actor after the current handler returns.
    pub fn stop(&mut self) {
        self.stop = true;
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stop
    }

    /// Ends the current run and schedules a `Wakeup`.
    pub fn yield_now(&mut self) {
        self.yielded = true;
    }

    pub(crate) fn set_pause(&mut self) {
        self.pause = true;
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.pause
    }

    pub(crate) fn has_yielded(&self) -> bool {
        self.yielded
    }

    /// True if the run loop must not pick up more work.
    pub(crate) fn has_flags(&self) -> bool {
        self.stop || self.pause || self.yielded
    }

    #[must_use]
    pub fn alarm_timestamp(&self) -> Option<Instant> {
        self.alarm
    }

    /// Arms (or with `None`, cancels) the `alarm` handler.
    pub fn set_alarm_timestamp(&mut self, at: Option<Instant>) {
        self.alarm = at;
    }

    pub fn set_timeout_in(&mut self, timeout: Duration) {
        self.alarm = Some(Instant::now() + timeout);
    }

    pub fn set_timeout_at(&mut self, at: Instant) {
        self.alarm = Some(at);
    }

    pub fn cancel_timeout(&mut self) {
        self.alarm = None;
    }

    #[must_use]
    pub fn has_timeout(&self) -> bool {
        self.alarm.is_some()
    }

    /// Token of the message being handled, or [`EMPTY_LINK_TOKEN`].
    #[must_use]
    pub fn link_token(&self) -> u64 {
        self.link_token
    }

    pub(crate) fn replace_link_token(&mut self, token: u64) -> u64 {
        std::mem::replace(&mut self.link_token, token)
    }

    /// Typed id of the running actor.
    ///
    /// # Panics
    ///
    /// Panics if the running actor is not an `A`.
    #[must_use]
    pub fn actor_id<A: Actor>(&self) -> ActorId<A> {
        assert!(
            self.info.actor_type_id() == TypeId::of::<A>(),
            "actor {:?} is not a {}",
            self.info.name(),
            std::any::type_name::<A>()
        );
        ActorId::from_info(Arc::clone(self.info))
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.info.name()
    }

    #[must_use]
    pub fn scheduler_id(&self) -> SchedulerId {
        self.info.scheduler_id()
    }

    #[must_use]
    pub fn scheduler_group(&self) -> Option<SchedulerGroup> {
        self.info.group().map(SchedulerGroup::from_shared)
    }

    /// Registers `source` with this actor's reactor; readiness arrives as
    /// `wake_up`.
    ///
    /// # Errors
    ///
    /// [`Error::NoScheduler`] if the actor's group is gone, otherwise
    /// registration failures from the OS poller.
    pub fn subscribe(&self, source: RawSource, interest: Interest) -> Result<IoToken> {
        let group = self.info.group().ok_or(Error::NoScheduler)?;
        let scheduler = group.scheduler(self.scheduler_id())?;
        Ok(scheduler.reactor().subscribe(source, interest, self.info)?)
    }

    /// # Errors
    ///
    /// See [`subscribe`](Self::subscribe).
    pub fn take_readiness(&self, token: IoToken) -> Result<Readiness> {
        let group = self.info.group().ok_or(Error::NoScheduler)?;
        let scheduler = group.scheduler(self.scheduler_id())?;
        Ok(scheduler.reactor().take_readiness(token)?)
    }

    /// # Errors
    ///
    /// See [`subscribe`](Self::subscribe).
    pub fn unsubscribe(&self, token: IoToken) -> Result<()> {
        let group = self.info.group().ok_or(Error::NoScheduler)?;
        let scheduler = group.scheduler(self.scheduler_id())?;
        Ok(scheduler.reactor().unsubscribe(token)?)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────
