//! Calls made from inside a running fiber. Each one talks to the scheduler
//! driving the current thread and fails with [`Error::InvalidState`] when there
//! is none.
//!
//! [`Error::InvalidState`]: crate::Error::InvalidState

use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::fiber::{Builder, FiberId, JoinHandle, Wake};
use crate::io::{Direction, IoKey};
use crate::scheduler::with_current;

/// Spawns a fiber on the current scheduler. The caller keeps running; the new
/// fiber goes to the back of the readiness queue.
pub fn spawn<F, T>(f: F) -> Result<JoinHandle<T>>
where
    F: FnOnce() -> T + 'static,
    T: 'static,
{
    Builder::new().spawn(f)
}

/// Moves the running fiber to the back of the readiness queue.
pub fn yield_now() -> Result<()> {
    with_current(|scheduler| scheduler.yield_now())?
}

/// Suspends the running fiber until `deadline`. A deadline already in the
/// past still gives every other ready fiber a turn first.
pub fn sleep_until(deadline: Instant) -> Result<Wake> {
    with_current(|scheduler| scheduler.sleep_until(timer::from_instant(deadline)))?
}

pub fn sleep_for(duration: Duration) -> Result<Wake> {
    with_current(|scheduler| scheduler.sleep_until(timer::get_timeout_time(duration)))?
}

/// Suspends the running fiber until `fd` is readable, or `deadline` passes.
///
/// Only one fiber may wait for a descriptor in each direction. Errors and
/// hang-ups count as readable; the following read reports them.
pub fn wait_readable(fd: RawFd, deadline: Option<Instant>) -> Result<Wake> {
    wait_io(fd, Direction::Readable, deadline)
}

/// Like [`wait_readable`], for writability.
pub fn wait_writable(fd: RawFd, deadline: Option<Instant>) -> Result<Wake> {
    wait_io(fd, Direction::Writable, deadline)
}

/// Direction-generic form of [`wait_readable`] and [`wait_writable`].
pub fn wait_io(fd: RawFd, direction: Direction, deadline: Option<Instant>) -> Result<Wake> {
    let key = IoKey::new(fd, direction);
    let deadline = deadline.map(timer::from_instant);
    with_current(|scheduler| scheduler.wait_io(key, deadline))?
}

/// Suspends the running fiber until some other code calls [`wake`] on it.
pub fn park() -> Result<Wake> {
    with_current(|scheduler| scheduler.park(None))?
}

pub fn park_until(deadline: Instant) -> Result<Wake> {
    with_current(|scheduler| scheduler.park(Some(timer::from_instant(deadline))))?
}

/// Ends the sleep, descriptor wait or park of `id`; see [`Scheduler::wake`].
///
/// [`Scheduler::wake`]: crate::Scheduler::wake
pub fn wake(id: FiberId) -> Result<bool> {
    with_current(|scheduler| scheduler.wake(id))?
}

/// The running fiber, or `None` outside of any fiber.
pub fn current_fiber() -> Option<FiberId> {
    with_current(|scheduler| scheduler.current_fiber()).ok().flatten()
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::io::tests::pipe;
    use crate::Scheduler;

    #[test]
    fn current_fiber_inside_and_out() {
        assert_eq!(None, current_fiber());
        let scheduler = Scheduler::new();
        let handle = scheduler.spawn(current_fiber).unwrap();
        scheduler.run().unwrap();
        assert_eq!(Some(handle.id()), handle.join().unwrap());
        assert_eq!(None, current_fiber());
    }

    #[test]
    fn sleep_until_past_deadline() {
        let scheduler = Scheduler::new();
        let past = Instant::now();
        let wake = scheduler.block_on(move || sleep_until(past).unwrap()).unwrap();
        assert_eq!(Wake::Timer, wake);
    }

    #[test]
    fn park_until_times_out() {
        let scheduler = Scheduler::new();
        let (wake, elapsed) = scheduler
            .block_on(|| {
                let start = Instant::now();
                let wake = park_until(start + Duration::from_millis(5)).unwrap();
                (wake, start.elapsed())
            })
            .unwrap();
        assert_eq!(Wake::Timer, wake);
        assert!(elapsed >= Duration::from_millis(5));
    }

    #[test]
    fn ping_pong_over_pipes() {
        let (r1, w1) = pipe();
        let (r2, w2) = pipe();
        let log = Rc::new(RefCell::new(Vec::new()));
        let scheduler = Scheduler::new();

        let l = log.clone();
        scheduler
            .spawn(move || {
                let mut buf = [0u8; 1];
                for i in 0..5u8 {
                    assert_eq!(Wake::Io, wait_writable(w1, None).unwrap());
                    assert_eq!(1, unsafe { libc::write(w1, [i].as_ptr() as *const _, 1) });
                    assert_eq!(Wake::Io, wait_readable(r2, None).unwrap());
                    assert_eq!(1, unsafe { libc::read(r2, buf.as_mut_ptr() as *mut _, 1) });
                    l.borrow_mut().push(("ping", buf[0]));
                }
            })
            .unwrap();
        let l = log.clone();
        scheduler
            .spawn(move || {
                let mut buf = [0u8; 1];
                for _ in 0..5 {
                    assert_eq!(Wake::Io, wait_readable(r1, None).unwrap());
                    assert_eq!(1, unsafe { libc::read(r1, buf.as_mut_ptr() as *mut _, 1) });
                    l.borrow_mut().push(("pong", buf[0]));
                    assert_eq!(1, unsafe { libc::write(w2, [buf[0] * 10].as_ptr() as *const _, 1) });
                }
            })
            .unwrap();
        scheduler.run().unwrap();

        let expected: Vec<_> = (0..5u8).flat_map(|i| [("pong", i), ("ping", i * 10)]).collect();
        assert_eq!(expected, *log.borrow());
        for fd in [r1, w1, r2, w2] {
            unsafe { libc::close(fd) };
        }
    }

    #[test]
    fn writable_and_readable_waiters_share_a_descriptor() {
        // a socketpair end is both readable and writable
        let mut fds = [0 as RawFd; 2];
        assert_eq!(0, unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        });
        let (a, b) = (fds[0], fds[1]);
        let scheduler = Scheduler::new();
        let reader = scheduler.spawn(move || wait_readable(a, None).unwrap()).unwrap();
        let writer = scheduler.spawn(move || wait_writable(a, None).unwrap()).unwrap();
        scheduler
            .spawn(move || {
                sleep_for(Duration::from_millis(1)).unwrap();
                assert_eq!(1, unsafe { libc::write(b, b"x".as_ptr() as *const _, 1) });
            })
            .unwrap();
        scheduler.run().unwrap();
        assert_eq!(Wake::Io, reader.join().unwrap());
        assert_eq!(Wake::Io, writer.join().unwrap());
        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }
}
