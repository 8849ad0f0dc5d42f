//! Actor mailbox: messages and the queue they travel through.
//!
//! A message is a one-shot closure run against the actor, or one of the
//! two hang-up notifications sent when an owning or shared handle is
//! dropped. Each message carries a link token that the handler can read
//! through [`ActorContext::link_token`].
//!
//! The mailbox is an [`MpscLinkQueue`] plus the single reader owned by
//! whoever currently holds the actor's lock. Producers never touch the
//! reader.

use std::cell::UnsafeCell;
use std::fmt;

use crate::actor::{Actor, ActorContext};
use crate::mpsc::{MpscLinkQueue, Reader};

/// Token carried by messages that were not sent through a shared handle.
pub const EMPTY_LINK_TOKEN: u64 = u64::MAX;

/// Closure form of a message.
pub type ActorClosure = Box<dyn FnOnce(&mut dyn Actor, &mut ActorContext<'_>) + Send>;

enum MessageBody {
    Closure(ActorClosure),
    Hangup,
    HangupShared,
}

/// One mailbox entry.
pub struct ActorMessage {
    body: MessageBody,
    link_token: u64,
    big: bool,
}

impl fmt::Debug for ActorMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.body {
            MessageBody::Closure(_) => "closure",
            MessageBody::Hangup => "hangup",
            MessageBody::HangupShared => "hangup_shared",
        };
        f.debug_struct("ActorMessage")
            .field("kind", &kind)
            .field("link_token", &self.link_token)
            .field("big", &self.big)
            .finish()
    }
}

impl ActorMessage {
    /// Wraps a closure over the type-erased actor.
    #[must_use]
    pub fn new(closure: ActorClosure) -> Self {
        Self {
            body: MessageBody::Closure(closure),
            link_token: EMPTY_LINK_TOKEN,
            big: false,
        }
    }

    /// Wraps a closure over the concrete actor type `A`.
    ///
    /// The closure panics when run against an actor of another type;
    /// typed handles make that impossible.
    #[must_use]
    pub fn from_fn<A, F>(f: F) -> Self
    where
        A: Actor,
        F: FnOnce(&mut A, &mut ActorContext<'_>) + Send + 'static,
    {
        Self::new(Box::new(move |actor: &mut dyn Actor, ctx: &mut ActorContext<'_>| {
            let Some(actor) = actor.as_any_mut().downcast_mut::<A>() else {
                panic!(
                    "message for {} delivered to actor {:?}",
                    std::any::type_name::<A>(),
                    ctx.name()
                );
            };
            f(actor, ctx);
        }))
    }

    /// Sent when the owning handle is dropped.
    #[must_use]
    pub fn hangup() -> Self {
        Self {
            body: MessageBody::Hangup,
            link_token: EMPTY_LINK_TOKEN,
            big: false,
        }
    }

    /// Sent when a shared handle carrying `link_token` is dropped.
    #[must_use]
    pub fn hangup_shared(link_token: u64) -> Self {
        Self {
            body: MessageBody::HangupShared,
            link_token,
            big: false,
        }
    }

    #[must_use]
    pub fn with_link_token(mut self, link_token: u64) -> Self {
        self.link_token = link_token;
        self
    }

    /// A big message is never run inline by a sender; it is always handed
    /// to a scheduler thread.
    #[must_use]
    pub fn big(mut self) -> Self {
        self.big = true;
        self
    }

    pub fn set_big(&mut self, big: bool) {
        self.big = big;
    }

    #[must_use]
    pub fn is_big(&self) -> bool {
        self.big
    }

    #[must_use]
    pub fn link_token(&self) -> u64 {
        self.link_token
    }

    /// Delivers the message, exposing its link token for the duration of
    /// the handler.
    pub fn run(self, actor: &mut dyn Actor, ctx: &mut ActorContext<'_>) {
        let saved = ctx.replace_link_token(self.link_token);
        match self.body {
            MessageBody::Closure(f) => f(actor, ctx),
            MessageBody::Hangup => actor.hang_up(ctx),
            MessageBody::HangupShared => actor.hang_up_shared(ctx),
        }
        ctx.replace_link_token(saved);
    }
}

// ── Mailbox ─────────────────────────────────────────────────────────────

/// Lock-free inbox plus the lock owner's reader.
pub struct ActorMailbox {
    queue: MpscLinkQueue<ActorMessage>,
    reader: UnsafeCell<Reader<ActorMessage>>,
}

// SAFETY: the queue is a multi-producer structure; the reader is only
// reached through the unsafe accessors below, whose contract requires the
// caller to hold the actor lock.
unsafe impl Sync for ActorMailbox {}

impl fmt::Debug for ActorMailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorMailbox")
            .field("queue_empty", &self.queue.is_empty())
            .finish_non_exhaustive()
    }
}

impl Default for ActorMailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl ActorMailbox {
    #[must_use]
    pub fn new() -> Self {
        Self {
            queue: MpscLinkQueue::new(),
            reader: UnsafeCell::new(Reader::new()),
        }
    }

    /// Enqueues `message`; any thread. Returns `true` if the inbox was
    /// empty.
    pub fn push(&self, message: ActorMessage) -> bool {
        self.queue.push(message)
    }

    /// Moves the inbox into the reader.
    ///
    /// # Safety
    ///
    /// The caller must hold the actor lock.
    pub unsafe fn pop_all(&self) {
        // SAFETY: lock ownership makes the caller the only reader.
        let reader = unsafe { &mut *self.reader.get() };
        self.queue.pop_all(reader);
    }

    /// Next message in the reader, if any.
    ///
    /// # Safety
    ///
    /// The caller must hold the actor lock.
    pub unsafe fn read(&self) -> Option<ActorMessage> {
        // SAFETY: see `pop_all`.
        unsafe { (*self.reader.get()).read() }
    }

    /// Puts `message` back at the front of the reader.
    ///
    /// # Safety
    ///
    /// The caller must hold the actor lock.
    pub unsafe fn delay(&self, message: ActorMessage) {
        // SAFETY: see `pop_all`.
        unsafe { (*self.reader.get()).delay(message) };
    }

    /// Messages currently in the reader (not the inbox).
    ///
    /// # Safety
    ///
    /// The caller must hold the actor lock.
    pub unsafe fn reader_len(&self) -> usize {
        // SAFETY: see `pop_all`.
        unsafe { (*self.reader.get()).calc_size() }
    }

    /// Drops every pending message, inbox included. Returns how many were
    /// dropped.
    ///
    /// # Safety
    ///
    /// The caller must hold the actor lock.
    pub unsafe fn clear(&self) -> usize {
        let mut dropped = 0;
        // SAFETY: forwarded caller contract.
        unsafe {
            self.pop_all();
            while self.read().is_some() {
                dropped += 1;
            }
        }
        dropped
    }

    #[must_use]
    pub fn inbox_is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────
