//! MPSC queue whose consumer sleeps in a [`Reactor`].
//!
//! Producers push through [`PollableQueue::writer_put`]; the push that turns
//! the queue from empty to non-empty also notifies the reactor, so the IO
//! thread wakes up no more than once per batch.

use std::sync::Arc;

use crate::mpsc::{MpscLinkQueue, Reader};
use crate::reactor::Reactor;

#[derive(Debug)]
pub struct PollableQueue<T> {
    queue: MpscLinkQueue<T>,
    reactor: Arc<Reactor>,
}

impl<T> PollableQueue<T> {
    #[must_use]
    pub fn new(reactor: Arc<Reactor>) -> Self {
        Self {
            queue: MpscLinkQueue::new(),
            reactor,
        }
    }

    pub fn writer_put(&self, value: T) {
        if self.queue.push(value) {
            self.reactor.notify();
        }
    }

    /// Moves everything queued so far into `reader`; never blocks. Single
    /// consumer only.
    pub fn reader_pop_all(&self, reader: &mut Reader<T>) {
        self.queue.pop_all(reader);
    }

    #[must_use]
    pub fn reactor(&self) -> &Arc<Reactor> {
        &self.reactor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn first_put_wakes_the_reactor() {
        let reactor = Arc::new(Reactor::new().unwrap());
        let queue = PollableQueue::new(Arc::clone(&reactor));
        queue.writer_put(1);
        queue.writer_put(2);

        let mut events = Vec::new();
        let start = Instant::now();
        reactor
            .poll(&mut events, Some(Duration::from_secs(5)))
            .unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));

        let mut reader = Reader::new();
        queue.reader_pop_all(&mut reader);
        assert_eq!(reader.read(), Some(1));
        assert_eq!(reader.read(), Some(2));
        assert_eq!(reader.read(), None);
    }
}
