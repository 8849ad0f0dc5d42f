//! Readiness reactor for a scheduler's IO thread.
//!
//! Wraps a [`polling::Poller`]. Poll-affinity actors subscribe raw
//! descriptors; when one becomes ready the IO thread records the readiness
//! on the subscription and signals the actor with `Io`. Subscriptions are
//! one-shot: the descriptor is re-armed when the actor takes the recorded
//! readiness, so an actor that has not consumed an event is not flooded
//! with repeats.
//!
//! Any thread may call [`Reactor::notify`] to cut the IO thread's wait
//! short (new queue entries, earlier timers, stop).

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, Weak};
use std::time::Duration;

use polling::{Event, Poller};

use crate::actor::{ActorInfo, ActorInfoPtr};

/// Raw descriptor type accepted by [`Reactor::subscribe`].
#[cfg(unix)]
pub type RawSource = std::os::unix::io::RawFd;
#[cfg(windows)]
pub type RawSource = std::os::windows::io::RawSocket;

/// Readiness directions, used both as interest and as observed readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

/// Readiness observed on a subscription.
pub type Readiness = Interest;

impl Interest {
    pub const READABLE: Self = Self {
        readable: true,
        writable: false,
    };
    pub const WRITABLE: Self = Self {
        readable: false,
        writable: true,
    };
    pub const BOTH: Self = Self {
        readable: true,
        writable: true,
    };

    #[must_use]
    pub fn is_empty(self) -> bool {
        !self.readable && !self.writable
    }

    fn to_event(self, key: usize) -> Event {
        match (self.readable, self.writable) {
            (true, true) => Event::all(key),
            (true, false) => Event::readable(key),
            (false, true) => Event::writable(key),
            (false, false) => Event::none(key),
        }
    }
}

/// Handle returned by [`Reactor::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IoToken(usize);

struct Subscription {
    source: RawSource,
    interest: Interest,
    ready: Readiness,
    armed: bool,
    actor: Weak<ActorInfo>,
}

/// See the module docs.
pub struct Reactor {
    poller: Poller,
    subscriptions: Mutex<HashMap<usize, Subscription>>,
    next_key: AtomicUsize,
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("subscriptions", &self.subscription_count())
            .finish_non_exhaustive()
    }
}

impl Reactor {
    /// # Errors
    ///
    /// Fails if the OS poller cannot be created.
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poller: Poller::new()?,
            subscriptions: Mutex::new(HashMap::new()),
            next_key: AtomicUsize::new(0),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<usize, Subscription>> {
        match self.subscriptions.lock() {
            Ok(g) => g,
            Err(e) => e.into_inner(),
        }
    }

    /// Wakes a thread blocked in [`poll`](Self::poll).
    pub fn notify(&self) {
        if let Err(err) = self.poller.notify() {
            tracing::warn!(%err, "reactor notify failed");
        }
    }

    /// Registers `source` for `interest` on behalf of `actor`.
    ///
    /// The descriptor must stay open until [`unsubscribe`](Self::unsubscribe).
    ///
    /// # Errors
    ///
    /// Propagates registration failures from the OS poller.
    pub fn subscribe(
        &self,
        source: RawSource,
        interest: Interest,
        actor: &ActorInfoPtr,
    ) -> io::Result<IoToken> {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        let mut subs = self.lock();
        self.poller.add(source, interest.to_event(key))?;
        subs.insert(
            key,
            Subscription {
                source,
                interest,
                ready: Readiness::default(),
                armed: true,
                actor: std::sync::Arc::downgrade(actor),
            },
        );
        Ok(IoToken(key))
    }

    /// # Errors
    ///
    /// Propagates failures from the OS poller; unknown tokens are ignored.
    pub fn unsubscribe(&self, token: IoToken) -> io::Result<()> {
        let removed = self.lock().remove(&token.0);
        match removed {
            Some(sub) => self.poller.delete(sub.source),
            None => Ok(()),
        }
    }

    /// Returns and clears the readiness recorded for `token`, re-arming
    /// the descriptor.
    ///
    /// # Errors
    ///
    /// Propagates re-arm failures from the OS poller.
    pub fn take_readiness(&self, token: IoToken) -> io::Result<Readiness> {
        let mut subs = self.lock();
        let Some(sub) = subs.get_mut(&token.0) else {
            return Ok(Readiness::default());
        };
        let ready = std::mem::take(&mut sub.ready);
        if !sub.armed {
            self.poller.modify(sub.source, sub.interest.to_event(token.0))?;
            sub.armed = true;
        }
        Ok(ready)
    }

    /// Blocks for at most `timeout` and returns the live actors whose
    /// descriptors became ready.
    ///
    /// # Errors
    ///
    /// Propagates wait failures from the OS poller.
    pub fn poll(
        &self,
        events: &mut Vec<Event>,
        timeout: Option<Duration>,
    ) -> io::Result<Vec<ActorInfoPtr>> {
        events.clear();
        self.poller.wait(events, timeout)?;
        if events.is_empty() {
            return Ok(Vec::new());
        }
        let mut subs = self.lock();
        let mut ready = Vec::with_capacity(events.len());
        for event in events.iter() {
            let Some(sub) = subs.get_mut(&event.key) else {
                continue;
            };
            sub.ready.readable |= event.readable;
            sub.ready.writable |= event.writable;
            sub.armed = false;
            if let Some(actor) = sub.actor.upgrade() {
                ready.push(actor);
            }
        }
        Ok(ready)
    }

    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::actor::{Actor, ActorInfo, ActorOptions};
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::time::Instant;

    struct Idle;
    impl Actor for Idle {}

    #[test]
    fn notify_interrupts_wait() {
        let reactor = Reactor::new().unwrap();
        reactor.notify();
        let mut events = Vec::new();
        let start = Instant::now();
        let ready = reactor
            .poll(&mut events, Some(Duration::from_secs(5)))
            .unwrap();
        assert!(ready.is_empty());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn readable_descriptor_reports_its_actor_once_until_taken() {
        let reactor = Reactor::new().unwrap();
        let info = ActorInfo::detached(Box::new(Idle), &ActorOptions::new().with_name("io"));
        let (mut tx, rx) = UnixStream::pair().unwrap();
        let token = reactor
            .subscribe(rx.as_raw_fd(), Interest::READABLE, &info)
            .unwrap();
        assert_eq!(reactor.subscription_count(), 1);

        tx.write_all(b"x").unwrap();
        let mut events = Vec::new();
        let ready = reactor
            .poll(&mut events, Some(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(ready.len(), 1);
        assert!(std::sync::Arc::ptr_eq(&ready[0], &info));

        // Not re-armed yet: the still-readable descriptor stays quiet.
        let again = reactor
            .poll(&mut events, Some(Duration::from_millis(20)))
            .unwrap();
        assert!(again.is_empty());

        let readiness = reactor.take_readiness(token).unwrap();
        assert!(readiness.readable);
        assert!(reactor.take_readiness(token).unwrap().is_empty());

        reactor.unsubscribe(token).unwrap();
        assert_eq!(reactor.subscription_count(), 0);
    }
}
