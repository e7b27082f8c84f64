//! Guarded stack memory for fibers, plus pools that recycle it.

pub mod pool;

pub mod memory;

mod system;

use std::collections::HashMap;

use crate::memory::{Memory, MemoryError};
use crate::pool::SizedMemoryPool;

pub use crate::system::{default_size, min_size, page_size};

/// One [`SizedMemoryPool`] per requested stack size, created on first use.
#[derive(Debug)]
pub struct MemoryPools {
    max_cached: usize,
    pools: HashMap<usize, SizedMemoryPool>,
}

impl MemoryPools {
    pub fn new(max_cached: usize) -> Self {
        MemoryPools {
            max_cached,
            pools: HashMap::new(),
        }
    }

    pub fn get(&self, size: usize) -> Option<&SizedMemoryPool> {
        self.pools.get(&size)
    }

    /// Hands out a stack of `size` bytes. The caller gives it back with
    /// [`MemoryPools::revert`] passing the same `size`.
    pub fn allocate(&mut self, size: usize) -> Result<Memory, MemoryError> {
        let max_cached = self.max_cached;
        self.pools
            .entry(size)
            .or_insert_with(|| SizedMemoryPool::new(size, max_cached))
            .allocate()
    }

    pub fn revert(&mut self, size: usize, stack: Memory) -> Result<(), MemoryError> {
        match self.pools.get_mut(&size) {
            Some(pool) => pool.revert(stack),
            // not ours: unmap it
            None => Ok(()),
        }
    }

    /// Stacks currently lent out across all sizes.
    pub fn using(&self) -> usize {
        self.pools.values().map(SizedMemoryPool::using).sum()
    }

    /// Stacks cached for reuse across all sizes.
    pub fn available(&self) -> usize {
        self.pools.values().map(SizedMemoryPool::available).sum()
    }
}

impl Default for MemoryPools {
    fn default() -> Self {
        MemoryPools::new(64)
    }
}

#[cfg(test)]
mod tests {
    use crate::{min_size, MemoryPools};

    #[test]
    fn test_memory_pools() {
        let size = min_size();
        let mut pools = MemoryPools::new(8);
        assert!(pools.get(size).is_none());
        let stack = pools.allocate(size).unwrap();
        assert_eq!(size, stack.len());
        let pool = pools.get(size).unwrap();
        assert_eq!(0, pool.available());
        assert_eq!(1, pool.using());

        pools.revert(size, stack).unwrap();
        assert_eq!(1, pools.available());
        assert_eq!(0, pools.using());

        let other = pools.allocate(size * 2).unwrap();
        assert_eq!(1, pools.using());
        pools.revert(size * 2, other).unwrap();
        assert_eq!(2, pools.available());
    }
}
