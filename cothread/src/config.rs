use std::env;

/// Which wake wins when a descriptor turns ready and the same wait's deadline
/// expires within one pass of the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TieBreak {
    #[default]
    IoFirst,
    TimerFirst,
}

/// Knobs for a [`Scheduler`](crate::Scheduler).
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) stack_size: usize,
    pub(crate) max_cached_stacks: usize,
    pub(crate) redzone: usize,
    pub(crate) tie_break: TieBreak,
}

impl Config {
    pub fn new() -> Self {
        Config {
            stack_size: memory_pool::default_size(true),
            max_cached_stacks: 64,
            redzone: 256,
            tie_break: TieBreak::default(),
        }
    }

    /// Defaults, overridden by `COTHREAD_STACK_SIZE` and
    /// `COTHREAD_MAX_CACHED_STACKS` when they hold valid numbers.
    pub fn from_env() -> Self {
        let mut config = Config::new();
        if let Some(size) = read_env("COTHREAD_STACK_SIZE") {
            config.stack_size = size;
        }
        if let Some(max) = read_env("COTHREAD_MAX_CACHED_STACKS") {
            config.max_cached_stacks = max;
        }
        config
    }

    /// Default stack size for spawned fibers, rounded up to whole pages.
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    /// How many finished stacks of each size are kept for reuse.
    pub fn max_cached_stacks(mut self, max: usize) -> Self {
        self.max_cached_stacks = max;
        self
    }

    /// Minimum free stack a fiber must have left whenever it switches out.
    pub fn redzone(mut self, bytes: usize) -> Self {
        self.redzone = bytes;
        self
    }

    pub fn tie_break(mut self, tie_break: TieBreak) -> Self {
        self.tie_break = tie_break;
        self
    }

    pub fn get_stack_size(&self) -> usize {
        self.stack_size
    }

    pub fn get_tie_break(&self) -> TieBreak {
        self.tie_break
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::new()
    }
}

fn read_env(key: &str) -> Option<usize> {
    let value = env::var(key).ok()?;
    match value.trim().parse() {
        Ok(n) => Some(n),
        Err(_) => {
            tracing::warn!(key, value = %value, "ignoring malformed setting");
            None
        }
    }
}
