//! Cooperative fibers on one OS thread.
//!
//! A [`Scheduler`] multiplexes fibers, each on its own guarded stack, and
//! switches between them only when the running fiber yields, sleeps, waits for
//! a descriptor, parks or joins another fiber. The loop then blocks on its
//! `mio` poller until a descriptor turns ready or the nearest deadline passes.
//!
//! ```no_run
//! use std::time::Duration;
//!
//! let scheduler = cothread::Scheduler::new();
//! let answer = scheduler
//!     .block_on(|| {
//!         let child = cothread::spawn(|| 21).unwrap();
//!         cothread::sleep_for(Duration::from_millis(1)).unwrap();
//!         child.join().unwrap() * 2
//!     })
//!     .unwrap();
//! assert_eq!(42, answer);
//! ```

mod context;

mod error;

mod config;

mod fiber;

mod io;

mod queue;

mod remote;

mod scheduler;

mod api;

pub use crate::api::{
    current_fiber, park, park_until, sleep_for, sleep_until, spawn, wait_io, wait_readable,
    wait_writable, wake, yield_now,
};
pub use crate::config::{Config, TieBreak};
pub use crate::error::{Error, Result};
pub use crate::fiber::{Builder, FiberId, JoinHandle, Status, Wake};
pub use crate::io::Direction;
pub use crate::remote::Remote;
pub use crate::scheduler::{Scheduler, Stats};
pub use memory_pool::memory::MemoryError;
