use std::fmt;
use std::io;
use std::sync::Arc;

use crossbeam_deque::{Injector, Steal};
use mio::Waker;

use crate::fiber::FiberId;

/// Cross-thread doorbell of one scheduler: a queue of requests plus a waker
/// registered with the scheduler's poller.
pub(crate) struct Shared {
    scheduler: usize,
    queue: Injector<FiberId>,
    waker: Waker,
}

impl Shared {
    pub(crate) fn new(scheduler: usize, waker: Waker) -> Self {
        Shared {
            scheduler,
            queue: Injector::new(),
            waker,
        }
    }

    fn push(&self, id: FiberId) -> io::Result<()> {
        self.queue.push(id);
        self.waker.wake()
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Hands back every queued request, oldest first.
    pub(crate) fn drain(&self) -> Vec<FiberId> {
        let mut ids = Vec::new();
        loop {
            match self.queue.steal() {
                Steal::Success(id) => ids.push(id),
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }
        ids
    }
}

/// A `Send + Sync` handle for waking fibers of a scheduler from other threads.
///
/// Requests are queued and carried out by the scheduler's own loop on its next
/// pass; they behave like [`wake`](crate::wake) called there, with one
/// difference: a request that finds the fiber running, ready or joining is
/// not dropped but kept, and the fiber's next [`park`](crate::park) returns
/// [`Wake::Notify`](crate::Wake::Notify) at once. While any `Remote` exists the
/// scheduler never reports a stall, since a wake may still arrive.
#[derive(Clone)]
pub struct Remote {
    shared: Arc<Shared>,
}

impl Remote {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Remote { shared }
    }

    pub fn wake(&self, id: FiberId) -> io::Result<()> {
        self.shared.push(id)
    }

    /// Id of the scheduler this handle talks to.
    pub fn scheduler(&self) -> usize {
        self.shared.scheduler
    }
}

impl fmt::Debug for Remote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Remote")
            .field("scheduler", &self.shared.scheduler)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use mio::{Events, Poll, Token};

    use super::*;

    fn shared(poll: &Poll) -> Arc<Shared> {
        Arc::new(Shared::new(0, Waker::new(poll.registry(), Token(0)).unwrap()))
    }

    #[test]
    fn requests_cross_threads_in_order() {
        let mut poll = Poll::new().unwrap();
        let shared = shared(&poll);
        let remote = Remote::new(shared.clone());
        let ids: Vec<_> = (0..3).map(|_| FiberId::next()).collect();
        let sent = ids.clone();
        thread::spawn(move || {
            for id in sent {
                remote.wake(id).unwrap();
            }
        })
        .join()
        .unwrap();

        let mut events = Events::with_capacity(4);
        poll.poll(&mut events, Some(Duration::from_millis(100))).unwrap();
        assert!(events.iter().any(|event| event.token() == Token(0)));
        assert!(shared.has_pending());
        assert_eq!(ids, shared.drain());
        assert!(shared.drain().is_empty());
        assert!(!shared.has_pending());
    }

    #[test]
    fn many_requests_are_all_kept() {
        let poll = Poll::new().unwrap();
        let shared = shared(&poll);
        let remote = Remote::new(shared.clone());
        let id = FiberId::next();
        for _ in 0..100_000 {
            remote.wake(id).unwrap();
        }
        assert_eq!(100_000, shared.drain().len());
    }
}
