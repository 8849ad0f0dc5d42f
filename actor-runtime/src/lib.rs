//! Lock-free actor execution core.
//!
//! Actors are plain structs implementing [`Actor`]. Each lives behind an
//! [`ActorInfo`]: one atomic state word (lock bit, flags, pending signals,
//! home scheduler), a mailbox and the boxed actor itself. Whoever wins the
//! lock bit drains signals and messages; everyone else only sets bits and
//! pushes messages, and the lock owner picks them up before it unlocks.
//!
//! A [`SchedulerGroup`] holds one or more schedulers. Each scheduler has
//! CPU workers sharing an MPMC queue (balanced further by per-worker
//! stealing rings) and one IO thread with a reactor and a timer heap.
//!
//! ```no_run
//! use std::time::Duration;
//! use actor_runtime::{
//!     create_actor, send_closure, Actor, ActorContext, ActorOptions, GroupConfig, Scheduler,
//!     SchedulerGroup, SchedulerId,
//! };
//!
//! struct Greeter;
//! impl Actor for Greeter {}
//!
//! let group = SchedulerGroup::new(GroupConfig::default())?;
//! let mut scheduler = Scheduler::new(&group, SchedulerId::new(0))?;
//! scheduler.start()?;
//! let greeter = scheduler.run_in_context(|| create_actor(ActorOptions::new(), Greeter))?;
//! let stopper = group.clone();
//! scheduler.run_in_context(|| {
//!     send_closure(&greeter, move |_: &mut Greeter, ctx: &mut ActorContext<'_>| {
//!         println!("hello from {}", ctx.name());
//!         stopper.stop();
//!     })
//! });
//! while scheduler.run(Duration::from_millis(10)) {}
//! drop(greeter);
//! drop(scheduler);
//! group.close();
//! # Ok::<(), actor_runtime::Error>(())
//! ```
//!
//! # Architecture
//!
//! ```text
//! Layer 0: internal (thread slots, rng), hazard, epoch
//! Layer 1: mpmc, mpsc, stealing, waiter (queues and parking)
//! Layer 2: reactor, pollable, timer_heap, state, locker
//! Layer 3: mailbox, actor, executor
//! Layer 4: handle, send, scheduler, group
//! ```

pub mod actor;
pub mod config;
pub mod epoch;
pub mod error;
pub mod executor;
pub mod group;
pub mod handle;
pub mod hazard;
pub(crate) mod internal;
pub mod locker;
pub mod mailbox;
pub mod mpmc;
pub mod mpsc;
pub mod pollable;
pub mod reactor;
pub mod scheduler;
pub mod send;
pub mod state;
pub mod stealing;
pub mod timer_heap;
pub mod waiter;

pub use actor::{Actor, ActorContext, ActorInfo, ActorInfoPtr, ActorOptions};
pub use config::{GroupConfig, SchedulerConfig};
pub use error::{ConfigError, Error, Result};
pub use internal::thread_id;
pub use handle::{ActorId, ActorOwn, ActorRef, ActorShared, AsActorRef};
pub use mailbox::ActorMessage;
pub use reactor::{Interest, IoToken, Readiness};
pub use scheduler::{Scheduler, SchedulerStats};
pub use group::SchedulerGroup;
pub use send::{
    create_actor, send_closure, send_closure_later, send_lambda, send_lambda_later, send_message,
    send_message_later, send_signals, send_signals_later,
};
pub use state::{ActorSignals, SchedulerId, Signal};
