use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};

use crate::error::{Error, Result};
use crate::fiber::FiberId;

// descriptors use their own number as token
const WAKER: Token = Token(usize::MAX);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Direction {
    Readable,
    Writable,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct IoKey {
    pub(crate) fd: RawFd,
    pub(crate) direction: Direction,
}

impl IoKey {
    pub(crate) fn new(fd: RawFd, direction: Direction) -> Self {
        IoKey { fd, direction }
    }
}

/// What one wait on the poller reported.
#[derive(Debug, Default)]
pub(crate) struct Polled {
    /// Ready waiters in ascending (descriptor, direction) order.
    pub(crate) ready: Vec<IoKey>,
    /// The remote [`Waker`] fired.
    pub(crate) remote: bool,
}

/// Fibers blocked on a descriptor, at most one per (descriptor, direction).
///
/// A descriptor is registered with the poller only while someone waits on it.
/// Registering one that is already ready reports it on the next poll, and a
/// woken waiter is deregistered at once, so readiness is never lost between
/// two waits even though the poller itself is edge-triggered.
pub(crate) struct IoWaiters {
    waiters: BTreeMap<IoKey, FiberId>,
    //第一次用到时才创建
    poll: Option<Poll>,
    events: Events,
}

impl IoWaiters {
    pub(crate) fn new() -> Self {
        IoWaiters {
            waiters: BTreeMap::new(),
            poll: None,
            events: Events::with_capacity(256),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.waiters.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    /// Registers `fiber` for `key`. An existing registration is left alone and
    /// reported as `InvalidState`; a descriptor the poller refuses (closed,
    /// or a regular file) is reported as `Io`.
    pub(crate) fn insert(&mut self, key: IoKey, fiber: FiberId) -> Result<()> {
        if self.waiters.contains_key(&key) {
            return Err(Error::InvalidState(
                "descriptor already has a waiter in that direction",
            ));
        }
        let before = self.interest(key.fd);
        self.waiters.insert(key, fiber);
        if let Err(e) = self.update(key.fd, before) {
            self.waiters.remove(&key);
            return Err(e.into());
        }
        Ok(())
    }

    pub(crate) fn remove(&mut self, key: IoKey) -> Option<FiberId> {
        let before = self.interest(key.fd);
        let fiber = self.waiters.remove(&key)?;
        if let Err(e) = self.update(key.fd, before) {
            // closing a descriptor already took it out of the poller
            tracing::trace!(fd = key.fd, error = %e, "descriptor already gone from the poller");
        }
        Some(fiber)
    }

    /// A waker that interrupts [`poll`](IoWaiters::poll) from any thread.
    /// Only one may exist per poller.
    pub(crate) fn waker(&mut self) -> io::Result<Waker> {
        Waker::new(selector(&mut self.poll)?.registry(), WAKER)
    }

    /// Waits up to `timeout` (forever when `None`) for any registered
    /// descriptor, or the waker, to become ready. Interruption by a signal is
    /// reported as nothing ready.
    pub(crate) fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Polled> {
        let mut polled = Polled::default();
        let poll = selector(&mut self.poll)?;
        if let Err(e) = poll.poll(&mut self.events, timeout.map(round_up)) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(polled);
            }
            return Err(e);
        }

        for event in self.events.iter() {
            if event.token() == WAKER {
                polled.remote = true;
                continue;
            }
            let fd = event.token().0 as RawFd;
            // errors and hang-ups wake both sides; the next syscall reports them
            let failed = event.is_error();
            if event.is_readable() || event.is_read_closed() || failed {
                polled.ready.push(IoKey::new(fd, Direction::Readable));
            }
            if event.is_writable() || event.is_write_closed() || failed {
                polled.ready.push(IoKey::new(fd, Direction::Writable));
            }
        }
        polled.ready.retain(|key| self.waiters.contains_key(key));
        polled.ready.sort();
        polled.ready.dedup();
        Ok(polled)
    }

    fn interest(&self, fd: RawFd) -> Option<Interest> {
        let readable = self.waiters.contains_key(&IoKey::new(fd, Direction::Readable));
        let writable = self.waiters.contains_key(&IoKey::new(fd, Direction::Writable));
        match (readable, writable) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    // bring the poller in line with the waiters on `fd`
    fn update(&mut self, fd: RawFd, before: Option<Interest>) -> io::Result<()> {
        let after = self.interest(fd);
        let registry = selector(&mut self.poll)?.registry();
        let mut source = SourceFd(&fd);
        let token = Token(fd as usize);
        match (before, after) {
            (None, Some(interest)) => registry.register(&mut source, token, interest),
            // also re-arms, so current readiness is reported again
            (Some(_), Some(interest)) => registry.reregister(&mut source, token, interest),
            (Some(_), None) => registry.deregister(&mut source),
            (None, None) => Ok(()),
        }
    }
}

impl fmt::Debug for IoWaiters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.waiters.iter()).finish()
    }
}

fn selector(slot: &mut Option<Poll>) -> io::Result<&mut Poll> {
    let poll = match slot.take() {
        Some(poll) => poll,
        None => Poll::new()?,
    };
    Ok(slot.insert(poll))
}

// the poller counts in milliseconds; round up so we never wake before a deadline
fn round_up(timeout: Duration) -> Duration {
    let ms = timeout.as_nanos().div_ceil(1_000_000);
    Duration::from_millis(ms.min(u64::MAX as u128) as u64)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::os::unix::io::RawFd;
    use std::time::Duration;

    use super::*;

    pub(crate) fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(0, unsafe { libc::pipe(fds.as_mut_ptr()) });
        (fds[0], fds[1])
    }

    fn close(fd: RawFd) {
        unsafe { libc::close(fd) };
    }

    fn write_byte(fd: RawFd) {
        assert_eq!(1, unsafe { libc::write(fd, b"x".as_ptr() as *const _, 1) });
    }

    #[test]
    fn timeouts_round_up() {
        assert_eq!(Duration::ZERO, round_up(Duration::ZERO));
        assert_eq!(Duration::from_millis(1), round_up(Duration::from_nanos(1)));
        assert_eq!(Duration::from_millis(2), round_up(Duration::from_micros(1500)));
        assert_eq!(Duration::from_millis(2), round_up(Duration::from_millis(2)));
    }

    #[test]
    fn double_registration_is_rejected() {
        let (r, w) = pipe();
        let mut waiters = IoWaiters::new();
        let a = FiberId::next();
        let b = FiberId::next();
        let key = IoKey::new(r, Direction::Readable);
        waiters.insert(key, a).unwrap();
        assert!(waiters.insert(key, b).unwrap_err().is_invalid_state());
        // the first registration survives
        assert_eq!(Some(a), waiters.remove(key));
        waiters.insert(IoKey::new(r, Direction::Writable), b).unwrap();
        assert_eq!(1, waiters.len());
        close(r);
        close(w);
    }

    #[test]
    fn refused_descriptor_is_an_io_error() {
        let mut waiters = IoWaiters::new();
        match waiters.insert(IoKey::new(RawFd::MAX, Direction::Readable), FiberId::next()) {
            Err(Error::Io(_)) => {}
            other => panic!("unexpected {:?}", other),
        }
        assert!(waiters.is_empty());
    }

    #[test]
    fn reports_ready_descriptors_in_order() {
        let (r1, w1) = pipe();
        let (r2, w2) = pipe();
        let mut waiters = IoWaiters::new();
        waiters.insert(IoKey::new(r2, Direction::Readable), FiberId::next()).unwrap();
        waiters.insert(IoKey::new(r1, Direction::Readable), FiberId::next()).unwrap();
        waiters.insert(IoKey::new(w1, Direction::Writable), FiberId::next()).unwrap();

        let polled = waiters.poll(Some(Duration::ZERO)).unwrap();
        assert_eq!(vec![IoKey::new(w1, Direction::Writable)], polled.ready);
        waiters.remove(IoKey::new(w1, Direction::Writable)).unwrap();

        write_byte(w2);
        write_byte(w1);
        let polled = waiters.poll(Some(Duration::from_millis(100))).unwrap();
        let mut expected = vec![
            IoKey::new(r1, Direction::Readable),
            IoKey::new(r2, Direction::Readable),
        ];
        expected.sort();
        assert_eq!(expected, polled.ready);
        assert!(!polled.remote);

        for fd in [r1, w1, r2, w2] {
            close(fd);
        }
    }

    #[test]
    fn readiness_survives_between_waits() {
        let (r, w) = pipe();
        write_byte(w);
        let mut waiters = IoWaiters::new();
        let key = IoKey::new(r, Direction::Readable);
        for _ in 0..3 {
            // already readable when registered: reported without a new edge
            waiters.insert(key, FiberId::next()).unwrap();
            let polled = waiters.poll(Some(Duration::from_millis(100))).unwrap();
            assert_eq!(vec![key], polled.ready);
            waiters.remove(key).unwrap();
        }
        close(r);
        close(w);
    }

    #[test]
    fn both_directions_of_one_descriptor() {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(0, unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        });
        let (a, b) = (fds[0], fds[1]);
        let mut waiters = IoWaiters::new();
        let readable = IoKey::new(a, Direction::Readable);
        let writable = IoKey::new(a, Direction::Writable);
        waiters.insert(readable, FiberId::next()).unwrap();
        waiters.insert(writable, FiberId::next()).unwrap();
        let polled = waiters.poll(Some(Duration::ZERO)).unwrap();
        assert_eq!(vec![writable], polled.ready);
        waiters.remove(writable).unwrap();

        write_byte(b);
        let polled = waiters.poll(Some(Duration::from_millis(100))).unwrap();
        assert_eq!(vec![readable], polled.ready);
        close(a);
        close(b);
    }

    #[test]
    fn waker_interrupts_poll() {
        let mut waiters = IoWaiters::new();
        let waker = waiters.waker().unwrap();
        let polled = waiters.poll(Some(Duration::ZERO)).unwrap();
        assert!(!polled.remote);
        std::thread::spawn(move || waker.wake().unwrap()).join().unwrap();
        let polled = waiters.poll(None).unwrap();
        assert!(polled.remote);
        assert!(polled.ready.is_empty());
    }

    #[test]
    fn hangup_wakes_readers() {
        let (r, w) = pipe();
        let mut waiters = IoWaiters::new();
        waiters.insert(IoKey::new(r, Direction::Readable), FiberId::next()).unwrap();
        close(w);
        let polled = waiters.poll(Some(Duration::from_millis(100))).unwrap();
        assert_eq!(vec![IoKey::new(r, Direction::Readable)], polled.ready);
        close(r);
    }
}
