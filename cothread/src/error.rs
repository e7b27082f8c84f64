use std::io;
use std::sync::Arc;

use memory_pool::memory::MemoryError;
use thiserror::Error;

use crate::fiber::FiberId;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything the scheduler reports back to its callers.
///
/// A fiber running off the end of its stack is not represented here: it
/// aborts the process, since nothing on that stack can be trusted afterwards.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// A stack could not be allocated. Retrying later may succeed.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(#[from] MemoryError),

    /// The call is not valid in the current state: a programming error.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// The fiber's entry panicked; carries the panic message.
    #[error("fiber {fiber} panicked: {message}")]
    Panicked { fiber: FiberId, message: String },

    /// Fibers are still waiting but nothing can ever wake them.
    #[error("{blocked} fiber(s) blocked with no timer, descriptor or remote handle left to wake them")]
    Stalled { blocked: usize },

    /// A descriptor could not be registered, or the multiplexer itself failed;
    /// the latter ends the loop.
    #[error("i/o failed: {0}")]
    Io(Arc<io::Error>),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

impl Error {
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, Error::InvalidState(_))
    }
}
