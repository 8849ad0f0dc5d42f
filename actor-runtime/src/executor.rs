//! One run quantum of an actor.
//!
//! An [`ActorExecutor`] is created for every delivery attempt: by a worker
//! that popped the actor from a queue, by the IO thread delivering an alarm
//! or readiness, and by every send. Construction tries to take the actor
//! lock and, if the actor may run on this thread, drains its signals and
//! mailbox. While the executor lives, sends through it run inline when
//! possible. Dropping it publishes what is left: pending signals are folded
//! into the state word and, if the actor is idle with work left, it is
//! handed to the [`SchedulerDispatcher`] exactly once.
//!
//! ```text
//! not running --try_lock--> draining signals --> draining mailbox
//!      ^                          |                    |
//!      |        stop -> tear_down, drop payload, close |
//!      +--------- unlock (requeue if signals left) <---+
//!                                 ^
//!            big message -> pause +
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crate::actor::{Actor, ActorContext, ActorInfoPtr};
use crate::locker::{ActorLocker, LockerOptions};
use crate::mailbox::ActorMessage;
use crate::state::{ActorFlags, ActorSignals, SchedulerId, Signal};

/// What an executor needs from the thread it runs on.
pub trait SchedulerDispatcher {
    /// Scheduler this thread belongs to; `None` for threads outside any
    /// scheduler, which never execute actors inline.
    fn scheduler_id(&self) -> Option<SchedulerId>;

    /// Enqueues an idle actor that has work. Called once per transition of
    /// the `in_queue` bit from clear to set.
    fn add_to_queue(&self, info: ActorInfoPtr, scheduler_id: SchedulerId, need_poll: bool);

    /// Moves the actor's timer heap entry; `None` removes it.
    fn set_alarm_timestamp(&self, info: &ActorInfoPtr, at: Option<Instant>);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutorOptions {
    /// The actor was popped from a dispatch queue (consumes `in_queue`).
    pub from_queue: bool,
    /// Running on an IO thread.
    pub has_poll: bool,
    /// Never run inline; used by the `*_later` sends.
    pub deferred: bool,
}

impl ExecutorOptions {
    #[must_use]
    pub fn with_from_queue(mut self) -> Self {
        self.from_queue = true;
        self
    }

    #[must_use]
    pub fn with_has_poll(mut self, has_poll: bool) -> Self {
        self.has_poll = has_poll;
        self
    }

    #[must_use]
    pub fn with_deferred(mut self) -> Self {
        self.deferred = true;
        self
    }
}

/// See the module docs.
pub struct ActorExecutor<'a> {
    info: &'a ActorInfoPtr,
    dispatcher: &'a dyn SchedulerDispatcher,
    options: ExecutorOptions,
    locker: ActorLocker<'a>,
    ctx: ActorContext<'a>,
    /// Payload, held while this executor owns the lock and may run it.
    actor: Option<Box<dyn Actor>>,
    /// Alarm as stored in the control block when the payload was taken.
    stored_alarm: Option<Instant>,
    flags: ActorFlags,
    pending: ActorSignals,
}

impl fmt::Debug for ActorExecutor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorExecutor")
            .field("actor", &self.info.name())
            .field("options", &self.options)
            .field("own_lock", &self.locker.own_lock())
            .field("flags", &self.flags)
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}

impl<'a> ActorExecutor<'a> {
    /// Creates the executor and runs everything the actor has pending, if
    /// this thread may run it.
    pub fn new(
        info: &'a ActorInfoPtr,
        dispatcher: &'a dyn SchedulerDispatcher,
        options: ExecutorOptions,
    ) -> Self {
        let locker_options = LockerOptions::default()
            .with_can_execute_paused(options.from_queue)
            .with_is_shared(!options.has_poll)
            .with_scheduler_id(dispatcher.scheduler_id());
        let locker = ActorLocker::with_options(info.state(), locker_options);
        let flags = locker.flags();
        let mut executor = Self {
            info,
            dispatcher,
            options,
            locker,
            ctx: ActorContext::new(info),
            actor: None,
            stored_alarm: None,
            flags,
            pending: ActorSignals::new(),
        };
        executor.start();
        executor
    }

    /// Best guess whether the actor still accepts work.
    #[must_use]
    pub fn can_send(&self) -> bool {
        !self.flags.is_closed()
    }

    /// True if a message would run right now on this thread.
    #[must_use]
    pub fn can_send_immediate(&self) -> bool {
        !self.options.deferred
            && self.locker.own_lock()
            && self.actor.is_some()
            && !self.ctx.has_flags()
            && self.locker.can_execute()
    }

    /// Runs `message` inline if possible, otherwise queues it in the
    /// mailbox. Dropped if the actor is closed.
    pub fn send_message(&mut self, message: ActorMessage) {
        if !self.can_send() {
            return;
        }
        if self.can_send_immediate() {
            self.send_immediate_message(message);
            return;
        }
        self.info.mailbox().push(message);
        self.pending.add_signal(Signal::Message);
    }

    /// Delivers `signals` inline if possible, otherwise leaves them for the
    /// next owner.
    pub fn send_signals(&mut self, signals: ActorSignals) {
        if !self.can_send() {
            return;
        }
        let mut signals = signals;
        while self.can_send_immediate() && self.flush_one_signal(&mut signals) {}
        self.pending.add_signals(signals);
    }

    fn send_immediate_message(&mut self, message: ActorMessage) {
        if message.is_big() {
            self.delay_big(message);
            return;
        }
        if let Some(actor) = self.actor.as_deref_mut() {
            message.run(actor, &mut self.ctx);
        }
    }

    fn delay_big(&mut self, message: ActorMessage) {
        // SAFETY: only reached while owning the lock.
        unsafe { self.info.mailbox().delay(message) };
        self.pending.add_signal(Signal::Message);
        self.ctx.set_pause();
    }

    fn start(&mut self) {
        let mut signals = ActorSignals::new();
        if self.options.from_queue {
            signals.add_signal(Signal::Pop);
        }
        if self.options.deferred || !self.can_send() {
            self.pending.add_signals(signals);
            return;
        }

        self.locker.try_lock();
        self.flags = self.locker.flags();
        if !self.locker.own_lock() {
            self.pending.add_signals(signals);
            return;
        }
        if self.options.from_queue {
            self.flags.set_pause(false);
        }
        signals.add_signals(self.flags.take_signals());
        if !self.locker.can_execute() {
            debug_assert!(
                !self.options.from_queue,
                "actor {:?} queued on a thread that cannot run it",
                self.info.name()
            );
            self.pending.add_signals(signals);
            return;
        }

        // SAFETY: the lock is held until `finish` releases it.
        unsafe {
            self.actor = self.info.take_actor();
            self.stored_alarm = self.info.alarm();
            self.info.mailbox().pop_all();
        }
        self.ctx.set_alarm_timestamp(self.stored_alarm);

        while !self.ctx.has_flags() && self.flush_one(&mut signals) {}
        self.pending.add_signals(signals);
    }

    fn flush_one(&mut self, signals: &mut ActorSignals) -> bool {
        self.flush_one_signal(signals) || self.flush_one_message()
    }

    fn flush_one_signal(&mut self, signals: &mut ActorSignals) -> bool {
        let Some(signal) = signals.first_signal() else {
            return false;
        };
        signals.clear_signal(signal);
        let ctx = &mut self.ctx;
        match signal {
            Signal::Kill => ctx.stop(),
            Signal::Pop => self.flags.set_in_queue(false),
            Signal::Message => {}
            _ => {
                let Some(actor) = self.actor.as_deref_mut() else {
                    return true;
                };
                match signal {
                    Signal::Alarm => {
                        if ctx.alarm_timestamp().is_some_and(|at| at <= Instant::now()) {
                            ctx.cancel_timeout();
                            tracing::trace!(actor = %self.info.name(), "alarm");
                            actor.alarm(ctx);
                        }
                    }
                    Signal::StartUp => actor.start_up(ctx),
                    Signal::TearDown => actor.tear_down(ctx),
                    _ => actor.wake_up(ctx),
                }
            }
        }
        true
    }

    fn flush_one_message(&mut self) -> bool {
        // SAFETY: only reached while owning the lock.
        let Some(message) = (unsafe { self.info.mailbox().read() }) else {
            return false;
        };
        if message.is_big() && !self.options.from_queue {
            self.delay_big(message);
            return false;
        }
        if let Some(actor) = self.actor.as_deref_mut() {
            message.run(actor, &mut self.ctx);
        }
        true
    }

    fn finish(&mut self) {
        if !self.locker.own_lock() {
            if self.pending.is_empty() || !self.locker.add_signals(self.pending) {
                return;
            }
            // Took the lock on an idle actor; publish and requeue below.
            self.flags = self.locker.flags();
        }

        if self.actor.is_some() {
            if self.ctx.is_stopped() {
                self.close();
                return;
            }
            if self.ctx.is_paused() {
                self.flags.set_pause(true);
            }
            if self.ctx.has_yielded() {
                self.pending.add_signal(Signal::Wakeup);
            }
            let alarm = self.ctx.alarm_timestamp();
            if alarm != self.stored_alarm {
                // SAFETY: still owning the lock.
                unsafe { self.info.set_alarm(alarm) };
                self.dispatcher.set_alarm_timestamp(self.info, alarm);
            }
            if let Some(actor) = self.actor.take() {
                // SAFETY: still owning the lock.
                unsafe { self.info.put_actor(actor) };
            }
        }

        self.flags.add_signals(self.pending);
        let mut add_to_queue = false;
        loop {
            let mut signals = self.flags.signals();
            if signals.has_signal(Signal::Pop) {
                signals.clear_signal(Signal::Pop);
                self.flags.set_signals(signals);
                self.flags.set_in_queue(false);
            }
            if self.flags.has_signals() && !self.flags.is_in_queue() {
                add_to_queue = true;
                self.flags.set_in_queue(true);
            }
            if self.locker.try_unlock(self.flags) {
                if add_to_queue {
                    self.dispatcher.add_to_queue(
                        Arc::clone(self.info),
                        self.flags.scheduler_id(),
                        !self.flags.is_shared(),
                    );
                }
                return;
            }
            self.flags = self.locker.flags();
        }
    }

    /// Stop path: the only place the payload is dropped.
    fn close(&mut self) {
        if self.stored_alarm.is_some() || self.ctx.has_timeout() {
            // SAFETY: still owning the lock.
            unsafe { self.info.set_alarm(None) };
            self.dispatcher.set_alarm_timestamp(self.info, None);
        }
        if let Some(mut actor) = self.actor.take() {
            actor.tear_down(&mut self.ctx);
            drop(actor);
        }
        tracing::debug!(actor = %self.info.name(), "actor torn down");
        self.locker.close();
        // SAFETY: the word is closed and stays locked; no other thread can
        // become the reader.
        let dropped = unsafe { self.info.mailbox().clear() };
        if dropped > 0 {
            tracing::trace!(actor = %self.info.name(), dropped, "dropped undelivered messages");
        }
    }
}

impl Drop for ActorExecutor<'_> {
    fn drop(&mut self) {
        self.finish();
    }
}

// ── Tests ───────────────────────────────────────────────────────────────
