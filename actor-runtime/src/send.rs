//! Creating actors and sending them work.
//!
//! Every send builds a short-lived [`ActorExecutor`] for the target:
//!
//! - Inside a scheduler context (a CPU worker, the IO thread, or
//!   [`Scheduler::run_in_context`](crate::scheduler::Scheduler::run_in_context))
//!   the context is the dispatcher. If the target is idle and lives on
//!   this thread's scheduler, the work runs before the send returns.
//! - Outside any context the target's own group dispatches, and the work
//!   is always queued.
//! - With neither, the send is dropped and the function returns `false`.
//!
//! The `*_later` variants never run inline. They still keep per-sender
//! FIFO order with the immediate variants, since an immediate send to a
//! busy actor goes through the same mailbox.

use std::sync::Arc;

use crate::actor::{Actor, ActorContext, ActorInfo, ActorInfoPtr, ActorOptions};
use crate::error::{Error, Result};
use crate::executor::{ActorExecutor, ExecutorOptions, SchedulerDispatcher};
use crate::group::GroupShared;
use crate::handle::{ActorId, ActorOwn, ActorRef, AsActorRef};
use crate::mailbox::ActorMessage;
use crate::scheduler;
use crate::state::ActorSignals;

// ── Delivery ────────────────────────────────────────────────────────────

fn deliver(info: &ActorInfoPtr, deferred: bool, f: impl FnOnce(&mut ActorExecutor<'_>)) -> bool {
    let mut options = ExecutorOptions::default();
    if deferred {
        options = options.with_deferred();
    }
    if let Some(ctx) = scheduler::current_context() {
        let options = options.with_has_poll(ctx.has_poll());
        let mut executor = ActorExecutor::new(info, &*ctx, options);
        f(&mut executor);
        return true;
    }
    let Some(group) = info.group() else {
        return false;
    };
    let mut executor = ActorExecutor::new(info, &*group, options);
    f(&mut executor);
    true
}

/// Sends `message` to `target`, stamping it with the target's link token.
pub(crate) fn deliver_message(target: ActorRef<'_>, message: ActorMessage, deferred: bool) -> bool {
    let message = message.with_link_token(target.link_token);
    deliver(target.info, deferred, |executor| executor.send_message(message))
}

fn deliver_signals(target: ActorRef<'_>, signals: ActorSignals, deferred: bool) -> bool {
    deliver(target.info, deferred, |executor| executor.send_signals(signals))
}

// ── Public API ──────────────────────────────────────────────────────────

/// Runs `f` against the actor behind `target`.
///
/// Returns `false` if there was nothing to deliver through. A `true` result
/// does not mean the actor was alive; work sent to a closed actor is
/// dropped silently.
pub fn send_closure<A, F>(target: &impl AsActorRef<A>, f: F) -> bool
where
    A: Actor,
    F: FnOnce(&mut A, &mut ActorContext<'_>) + Send + 'static,
{
    deliver_message(target.as_actor_ref(), ActorMessage::from_fn::<A, F>(f), false)
}

/// Like [`send_closure`] but never runs `f` before returning.
pub fn send_closure_later<A, F>(target: &impl AsActorRef<A>, f: F) -> bool
where
    A: Actor,
    F: FnOnce(&mut A, &mut ActorContext<'_>) + Send + 'static,
{
    deliver_message(target.as_actor_ref(), ActorMessage::from_fn::<A, F>(f), true)
}

/// Runs `f` in the target's context without touching the actor itself.
pub fn send_lambda<A: ?Sized, F>(target: &impl AsActorRef<A>, f: F) -> bool
where
    F: FnOnce(&mut ActorContext<'_>) + Send + 'static,
{
    deliver_message(target.as_actor_ref(), lambda(f), false)
}

/// Like [`send_lambda`] but never runs `f` before returning.
pub fn send_lambda_later<A: ?Sized, F>(target: &impl AsActorRef<A>, f: F) -> bool
where
    F: FnOnce(&mut ActorContext<'_>) + Send + 'static,
{
    deliver_message(target.as_actor_ref(), lambda(f), true)
}

fn lambda<F>(f: F) -> ActorMessage
where
    F: FnOnce(&mut ActorContext<'_>) + Send + 'static,
{
    ActorMessage::new(Box::new(move |_: &mut dyn Actor, ctx: &mut ActorContext<'_>| f(ctx)))
}

/// Sends a prebuilt message, e.g. a [`big`](ActorMessage::big) one.
pub fn send_message<A: ?Sized>(target: &impl AsActorRef<A>, message: ActorMessage) -> bool {
    deliver_message(target.as_actor_ref(), message, false)
}

/// Like [`send_message`] but never runs it before returning.
pub fn send_message_later<A: ?Sized>(target: &impl AsActorRef<A>, message: ActorMessage) -> bool {
    deliver_message(target.as_actor_ref(), message, true)
}

/// Raises `signals` on the target. `Kill` stops it after the current run.
pub fn send_signals<A: ?Sized>(target: &impl AsActorRef<A>, signals: ActorSignals) -> bool {
    deliver_signals(target.as_actor_ref(), signals, false)
}

/// Like [`send_signals`] but never handles them before returning.
pub fn send_signals_later<A: ?Sized>(target: &impl AsActorRef<A>, signals: ActorSignals) -> bool {
    deliver_signals(target.as_actor_ref(), signals, true)
}

// ── Creation ────────────────────────────────────────────────────────────

/// Registers `actor` on the current thread's scheduler group.
///
/// The actor is queued with `StartUp` pending; `start_up` runs on the
/// thread that picks it up. It lands on `options`' scheduler or, if none
/// is given, on the calling thread's.
///
/// # Errors
///
/// [`Error::NoScheduler`] outside a scheduler context and
/// [`Error::SchedulerOutOfRange`] for a scheduler the group lacks.
pub fn create_actor<A: Actor>(mut options: ActorOptions, actor: A) -> Result<ActorOwn<A>> {
    let ctx = scheduler::current_context().ok_or(Error::NoScheduler)?;
    options.scheduler_id.get_or_insert(ctx.scheduler_id());
    register(ctx.group(), &*ctx, options, actor)
}

/// Shared by [`create_actor`] and
/// [`SchedulerGroup::create_actor`](crate::group::SchedulerGroup::create_actor).
pub(crate) fn register<A: Actor>(
    group: &Arc<GroupShared>,
    dispatcher: &dyn SchedulerDispatcher,
    mut options: ActorOptions,
    actor: A,
) -> Result<ActorOwn<A>> {
    let scheduler_id = options.scheduler_id.unwrap_or_default();
    let scheduler = group.scheduler(scheduler_id)?;
    if scheduler.cpu_threads() == 0 {
        options.poll = true;
    }
    let info = ActorInfo::new(Box::new(actor), &options, scheduler_id, Arc::downgrade(group));
    tracing::debug!(
        actor = %info.name(),
        %scheduler_id,
        poll = options.poll,
        "actor registered"
    );
    dispatcher.add_to_queue(Arc::clone(&info), scheduler_id, options.poll);
    Ok(ActorOwn::new(ActorId::from_info(info)))
}

// ── Tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Signal;

    struct Counter {
        hits: usize,
    }
    impl Actor for Counter {}

    #[test]
    fn sends_without_a_group_are_dropped() {
        let info = ActorInfo::detached(Box::new(Counter { hits: 0 }), &ActorOptions::new());
        let id: ActorId<Counter> = ActorId::from_info(Arc::clone(&info));
        assert!(!send_closure(&id, |a: &mut Counter, _| a.hits += 1));
        assert!(!send_lambda_later(&id, |ctx| ctx.stop()));
        assert!(!send_signals(&id, ActorSignals::one(Signal::Kill)));
        assert!(!send_message(&id, ActorMessage::hangup()));
        // SAFETY: no executor is running for this actor.
        assert_eq!(unsafe { info.mailbox().clear() }, 0);
        assert!(info.is_alive());
    }

    #[test]
    fn create_outside_a_context_fails() {
        let err = create_actor(ActorOptions::new(), Counter { hits: 0 }).unwrap_err();
        assert!(matches!(err, Error::NoScheduler));
    }
}
