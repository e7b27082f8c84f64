use std::io;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use cothread::{Scheduler, Wake};
use tracing_subscriber::EnvFilter;

const ROUNDS: u32 = 10_000;

fn pipe() -> io::Result<(RawFd, RawFd)> {
    let mut fds = [0 as RawFd; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((fds[0], fds[1]))
}

fn send(fd: RawFd, value: u32) -> cothread::Result<()> {
    let bytes = value.to_ne_bytes();
    loop {
        let n = unsafe { libc::write(fd, bytes.as_ptr() as *const _, bytes.len()) };
        if n == bytes.len() as isize {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::WouldBlock {
            return Err(err.into());
        }
        cothread::wait_writable(fd, None)?;
    }
}

fn recv(fd: RawFd) -> cothread::Result<u32> {
    let mut bytes = [0u8; 4];
    loop {
        let n = unsafe { libc::read(fd, bytes.as_mut_ptr() as *mut _, bytes.len()) };
        if n == bytes.len() as isize {
            return Ok(u32::from_ne_bytes(bytes));
        }
        if n == 0 {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::WouldBlock {
            return Err(err.into());
        }
        // 对端一秒内没有回应就放弃
        let deadline = Instant::now() + Duration::from_secs(1);
        if cothread::wait_readable(fd, Some(deadline))? == Wake::Timer {
            return Err(io::Error::from(io::ErrorKind::TimedOut).into());
        }
    }
}

fn main() -> cothread::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let (ping_r, ping_w) = pipe()?;
    let (pong_r, pong_w) = pipe()?;
    let scheduler = Scheduler::new();

    let pong = cothread::Builder::new().name("pong").spawn_on(&scheduler, move || {
        for _ in 0..ROUNDS {
            let n = recv(ping_r)?;
            send(pong_w, n + 1)?;
        }
        Ok::<_, cothread::Error>(())
    })?;

    let start = Instant::now();
    let last = scheduler.block_on(move || {
        let mut n = 0;
        for _ in 0..ROUNDS {
            send(ping_w, n)?;
            n = recv(pong_r)?;
        }
        Ok::<_, cothread::Error>(n)
    })??;
    scheduler.run_until(&pong)?;
    pong.join()??;
    let elapsed = start.elapsed();
    println!(
        "{} round trips in {:?} ({:?} each), last value {}",
        ROUNDS,
        elapsed,
        elapsed / ROUNDS,
        last
    );
    tracing::info!(stats = ?scheduler.stats(), "done");
    for fd in [ping_r, ping_w, pong_r, pong_w] {
        unsafe { libc::close(fd) };
    }
    Ok(())
}
