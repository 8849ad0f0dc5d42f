//! Typed handles to actors.
//!
//! - [`ActorId`]: plain strong reference; cloning and dropping it has no
//!   effect on the actor.
//! - [`ActorOwn`]: the unique owner. Dropping it sends a hang-up, which
//!   stops the actor unless `Actor::hang_up` is overridden.
//! - [`ActorShared`]: a reference tagged with a link token. Dropping it
//!   sends a shared hang-up carrying the token.
//!
//! All three hand out an [`ActorRef`] for the send functions.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::actor::{Actor, ActorInfoPtr};
use crate::mailbox::{ActorMessage, EMPTY_LINK_TOKEN};
use crate::send;

/// Link token used by messages sent through an [`ActorOwn`].
pub const OWNER_LINK_TOKEN: u64 = 0;

/// Borrowed target of a send: an actor plus the link token the message
/// will carry.
#[derive(Clone, Copy)]
pub struct ActorRef<'a> {
    pub(crate) info: &'a ActorInfoPtr,
    pub(crate) link_token: u64,
}

impl fmt::Debug for ActorRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorRef")
            .field("actor", &self.info.name())
            .field("link_token", &self.link_token)
            .finish()
    }
}

impl<'a> ActorRef<'a> {
    #[must_use]
    pub fn new(info: &'a ActorInfoPtr, link_token: u64) -> Self {
        Self { info, link_token }
    }

    #[must_use]
    pub fn info(&self) -> &'a ActorInfoPtr {
        self.info
    }

    #[must_use]
    pub fn link_token(&self) -> u64 {
        self.link_token
    }
}

/// Anything messages for an `A` can be sent through.
pub trait AsActorRef<A: ?Sized> {
    fn as_actor_ref(&self) -> ActorRef<'_>;
}

// ── ActorId ─────────────────────────────────────────────────────────────

/// Strong, typed reference to an actor.
pub struct ActorId<A: ?Sized = dyn Actor> {
    info: ActorInfoPtr,
    _marker: PhantomData<fn() -> Box<A>>,
}

impl<A: ?Sized> ActorId<A> {
    pub(crate) fn from_info(info: ActorInfoPtr) -> Self {
        Self {
            info,
            _marker: PhantomData,
        }
    }

    #[must_use]
    pub fn info(&self) -> &ActorInfoPtr {
        &self.info
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.info.name()
    }

    /// `false` once the actor has been torn down.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.info.is_alive()
    }

    /// Forgets the concrete actor type.
    #[must_use]
    pub fn upcast(self) -> ActorId {
        ActorId::from_info(self.info)
    }

    /// Same actor, same target.
    #[must_use]
    pub fn ptr_eq<B: ?Sized>(&self, other: &ActorId<B>) -> bool {
        Arc::ptr_eq(&self.info, &other.info)
    }
}

impl<A: ?Sized> Clone for ActorId<A> {
    fn clone(&self) -> Self {
        Self::from_info(Arc::clone(&self.info))
    }
}

impl<A: ?Sized> fmt::Debug for ActorId<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ActorId").field(&self.info.name()).finish()
    }
}

impl<A: ?Sized> AsActorRef<A> for ActorId<A> {
    fn as_actor_ref(&self) -> ActorRef<'_> {
        ActorRef::new(&self.info, EMPTY_LINK_TOKEN)
    }
}

// ── ActorOwn ────────────────────────────────────────────────────────────

/// Unique owner of an actor; hangs up on drop.
pub struct ActorOwn<A: ?Sized = dyn Actor> {
    id: Option<ActorId<A>>,
}

impl<A: ?Sized> ActorOwn<A> {
    #[must_use]
    pub fn new(id: ActorId<A>) -> Self {
        Self { id: Some(id) }
    }

    #[must_use]
    pub fn empty() -> Self {
        Self { id: None }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.id.is_none()
    }

    /// # Panics
    ///
    /// Panics on an empty handle.
    #[must_use]
    pub fn get(&self) -> ActorId<A> {
        self.id().clone()
    }

    /// Gives up ownership without hanging up.
    ///
    /// # Panics
    ///
    /// Panics on an empty handle.
    #[must_use]
    pub fn release(mut self) -> ActorId<A> {
        match self.id.take() {
            Some(id) => id,
            None => panic!("release of an empty ActorOwn"),
        }
    }

    /// Hangs up the current actor and takes ownership of `id`.
    pub fn reset(&mut self, id: Option<ActorId<A>>) {
        self.hang_up();
        self.id = id;
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.id.as_ref().is_some_and(ActorId::is_alive)
    }

    fn id(&self) -> &ActorId<A> {
        match &self.id {
            Some(id) => id,
            None => panic!("use of an empty ActorOwn"),
        }
    }

    fn hang_up(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        let target = ActorRef::new(&id.info, OWNER_LINK_TOKEN);
        if !send::deliver_message(target, ActorMessage::hangup(), false) {
            tracing::warn!(actor = %id.name(), "hang-up dropped: no scheduler to deliver it");
        }
    }
}

impl<A: ?Sized> Drop for ActorOwn<A> {
    fn drop(&mut self) {
        self.hang_up();
    }
}

impl<A: ?Sized> Default for ActorOwn<A> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<A: ?Sized> fmt::Debug for ActorOwn<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ActorOwn").field(&self.id).finish()
    }
}

impl<A: ?Sized> AsActorRef<A> for ActorOwn<A> {
    fn as_actor_ref(&self) -> ActorRef<'_> {
        ActorRef::new(&self.id().info, OWNER_LINK_TOKEN)
    }
}

// ── ActorShared ─────────────────────────────────────────────────────────

/// Reference carrying a link token; sends a shared hang-up on drop.
pub struct ActorShared<A: ?Sized = dyn Actor> {
    id: Option<ActorId<A>>,
    token: u64,
}

impl<A: ?Sized> ActorShared<A> {
    /// # Panics
    ///
    /// Panics if `token` is the owner token or [`EMPTY_LINK_TOKEN`].
    #[must_use]
    pub fn new(id: ActorId<A>, token: u64) -> Self {
        assert!(
            token != OWNER_LINK_TOKEN && token != EMPTY_LINK_TOKEN,
            "ActorShared needs a non-empty link token, got {token}"
        );
        Self {
            id: Some(id),
            token,
        }
    }

    #[must_use]
    pub fn token(&self) -> u64 {
        self.token
    }

    /// # Panics
    ///
    /// Panics if the handle was released.
    #[must_use]
    pub fn get(&self) -> ActorId<A> {
        self.id().clone()
    }

    /// Drops the reference without the shared hang-up.
    ///
    /// # Panics
    ///
    /// Panics if the handle was already released.
    #[must_use]
    pub fn release(mut self) -> ActorId<A> {
        match self.id.take() {
            Some(id) => id,
            None => panic!("release of an empty ActorShared"),
        }
    }

    fn id(&self) -> &ActorId<A> {
        match &self.id {
            Some(id) => id,
            None => panic!("use of a released ActorShared"),
        }
    }
}

impl<A: ?Sized> Drop for ActorShared<A> {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        let target = ActorRef::new(&id.info, self.token);
        if !send::deliver_message(target, ActorMessage::hangup_shared(self.token), false) {
            tracing::warn!(
                actor = %id.name(),
                token = self.token,
                "shared hang-up dropped: no scheduler to deliver it"
            );
        }
    }
}

impl<A: ?Sized> fmt::Debug for ActorShared<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorShared")
            .field("id", &self.id)
            .field("token", &self.token)
            .finish()
    }
}

impl<A: ?Sized> AsActorRef<A> for ActorShared<A> {
    fn as_actor_ref(&self) -> ActorRef<'_> {
        ActorRef::new(&self.id().info, self.token)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{ActorInfo, ActorOptions};
    use crate::mailbox::ActorMailbox;

    struct Plain;
    impl Actor for Plain {}

    fn detached() -> ActorInfoPtr {
        ActorInfo::detached(Box::new(Plain), &ActorOptions::new().with_name("plain"))
    }

    fn drain(mailbox: &ActorMailbox) -> usize {
        // SAFETY: nothing else reads this mailbox in the test.
        unsafe { mailbox.clear() }
    }

    #[test]
    fn refs_carry_the_handle_token() {
        let info = detached();
        let id: ActorId<Plain> = ActorId::from_info(Arc::clone(&info));
        assert_eq!(id.as_actor_ref().link_token(), EMPTY_LINK_TOKEN);

        let own = ActorOwn::new(id.clone());
        assert_eq!(own.as_actor_ref().link_token(), OWNER_LINK_TOKEN);

        let shared = ActorShared::new(id.clone(), 42);
        assert_eq!(shared.as_actor_ref().link_token(), 42);
        assert_eq!(shared.token(), 42);

        assert!(own.get().ptr_eq(&id));
        assert_eq!(id.name(), "plain");
        assert!(id.clone().upcast().ptr_eq(&id));
        let _ = own.release();
        let _ = shared.release();
    }

    #[test]
    fn dropping_detached_handles_is_silent() {
        let info = detached();
        let id: ActorId<Plain> = ActorId::from_info(Arc::clone(&info));
        drop(ActorOwn::new(id.clone()));
        drop(ActorShared::new(id, 5));
        // No group and no scheduler context: nothing to deliver through.
        assert_eq!(drain(info.mailbox()), 0);
        assert!(info.is_alive());
    }

    #[test]
    fn release_skips_the_hang_up() {
        let info = detached();
        let own: ActorOwn<Plain> = ActorOwn::new(ActorId::from_info(Arc::clone(&info)));
        assert!(!own.is_empty());
        let id = own.release();
        assert!(id.is_alive());
        assert!(ActorOwn::<Plain>::empty().is_empty());
        assert!(!ActorOwn::<Plain>::default().is_alive());
    }

    #[test]
    #[should_panic(expected = "non-empty link token")]
    fn shared_rejects_owner_token() {
        let id: ActorId<Plain> = ActorId::from_info(detached());
        let _ = ActorShared::new(id, OWNER_LINK_TOKEN);
    }
}
