use crossbeam_deque::Worker;

use crate::memory::{Memory, MemoryError};
use crate::system;

/// Caches stacks of one size so finished fibers hand theirs to the next spawn.
#[derive(Debug)]
pub struct SizedMemoryPool {
    //每个栈的大小
    size: usize,
    //最多缓存多少个空闲栈
    max_cached: usize,
    //可用的栈
    available: Worker<Memory>,
    //已借出的栈数量
    using: usize,
}

impl SizedMemoryPool {
    pub fn new(size: usize, max_cached: usize) -> Self {
        SizedMemoryPool {
            size,
            max_cached,
            // lifo: the most recently released stack is the one still in cache
            available: Worker::new_lifo(),
            using: 0,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn allocate(&mut self) -> Result<Memory, MemoryError> {
        let stack = match self.available.pop() {
            Some(stack) => stack,
            None => {
                //新申请栈
                let stack = Memory::new(self.size)?;
                tracing::debug!(size = self.size, len = stack.len(), "mapped new stack");
                stack
            }
        };
        self.using += 1;
        Ok(stack)
    }

    /// Gives a stack back. It is kept for reuse unless the cache is full, in
    /// which case it is unmapped right away.
    pub fn revert(&mut self, stack: Memory) -> Result<(), MemoryError> {
        if stack.len() != self.stack_len() {
            return Err(MemoryError::SizeMismatch {
                expected: self.stack_len(),
                actual: stack.len(),
            });
        }
        self.using = self.using.saturating_sub(1);
        if self.available.len() < self.max_cached {
            self.available.push(stack);
        }
        Ok(())
    }

    /// Number of cached stacks ready to be handed out.
    pub fn available(&self) -> usize {
        self.available.len()
    }

    /// Number of stacks currently lent out.
    pub fn using(&self) -> usize {
        self.using
    }

    // length of the usable region of every stack this pool hands out
    fn stack_len(&self) -> usize {
        let page_size = system::page_size();
        let size = self.size.max(system::min_size());
        ((size - 1) & !(page_size - 1)) + page_size
    }
}

impl Default for SizedMemoryPool {
    fn default() -> Self {
        SizedMemoryPool::new(system::default_size(true), 64)
    }
}

#[cfg(test)]
mod tests {
    use std::ptr;

    use crate::pool::SizedMemoryPool;
    use crate::system;

    #[test]
    fn test_sized_memory_pool() {
        let size = system::min_size();
        let mut pool = SizedMemoryPool::new(size, 4);
        assert_eq!(0, pool.available());
        assert_eq!(0, pool.using());

        let stack = pool.allocate().unwrap();
        assert_eq!(size, stack.len());
        assert!(!stack.top().is_null());
        assert!(!stack.bottom().is_null());
        assert!(stack.is_protected());
        unsafe { ptr::write_bytes(stack.bottom() as *mut u8, 0x1d, stack.len()) };

        assert_eq!(0, pool.available());
        assert_eq!(1, pool.using());
        let top = stack.top();
        pool.revert(stack).unwrap();
        assert_eq!(1, pool.available());
        assert_eq!(0, pool.using());

        let again = pool.allocate().unwrap();
        assert_eq!(top, again.top());
        pool.revert(again).unwrap();
    }

    #[test]
    fn cache_is_bounded() {
        let mut pool = SizedMemoryPool::new(system::min_size(), 1);
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        assert_eq!(2, pool.using());
        pool.revert(a).unwrap();
        pool.revert(b).unwrap();
        assert_eq!(1, pool.available());
        assert_eq!(0, pool.using());
    }

    #[test]
    fn rejects_foreign_size() {
        let mut small = SizedMemoryPool::new(system::min_size(), 1);
        let mut large = SizedMemoryPool::new(system::min_size() * 2, 1);
        let stack = large.allocate().unwrap();
        assert!(small.revert(stack).is_err());
        assert_eq!(1, large.using());
    }
}
