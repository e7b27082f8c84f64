use std::collections::{HashSet, VecDeque};

use crate::error::{Error, Result};
use crate::fiber::FiberId;

/// Fibers that may run now, in the order they became ready.
#[derive(Debug, Default)]
pub(crate) struct ReadyQueue {
    queue: VecDeque<FiberId>,
    queued: HashSet<FiberId>,
}

impl ReadyQueue {
    pub(crate) fn new() -> Self {
        ReadyQueue::default()
    }

    /// Appends `id`. A fiber sits in the queue at most once.
    pub(crate) fn push(&mut self, id: FiberId) -> Result<()> {
        if !self.queued.insert(id) {
            return Err(Error::InvalidState("fiber is already in the readiness queue"));
        }
        self.queue.push_back(id);
        Ok(())
    }

    pub(crate) fn pop(&mut self) -> Option<FiberId> {
        let id = self.queue.pop_front()?;
        self.queued.remove(&id);
        Some(id)
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo() {
        let mut queue = ReadyQueue::new();
        let ids: Vec<_> = (0..3).map(|_| FiberId::next()).collect();
        for id in &ids {
            queue.push(*id).unwrap();
        }
        assert_eq!(3, queue.len());
        let popped: Vec<_> = std::iter::from_fn(|| queue.pop()).collect();
        assert_eq!(ids, popped);
        assert!(queue.is_empty());
    }

    #[test]
    fn no_duplicates() {
        let mut queue = ReadyQueue::new();
        let id = FiberId::next();
        queue.push(id).unwrap();
        assert!(queue.push(id).unwrap_err().is_invalid_state());
        assert_eq!(1, queue.len());
        // once popped it may come back
        assert_eq!(Some(id), queue.pop());
        queue.push(id).unwrap();
    }
}
