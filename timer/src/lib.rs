use std::collections::VecDeque;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;

const NANOS_PER_SEC: u64 = 1_000_000_000;

// every timestamp in this crate counts from here
static BASE: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic clock in ns since the first time anyone asked.
#[inline]
pub fn now() -> u64 {
    from_instant(Instant::now())
}

/// Converts an `Instant` to this crate's clock. Instants from before the
/// clock started map to 0, i.e. already expired.
#[inline]
pub fn from_instant(instant: Instant) -> u64 {
    dur_to_ns(instant.saturating_duration_since(*BASE))
}

#[inline]
fn dur_to_ns(dur: Duration) -> u64 {
    // Note that a duration is a (u64, u32) (seconds, nanoseconds) pair
    dur.as_secs()
        .saturating_mul(NANOS_PER_SEC)
        .saturating_add(u64::from(dur.subsec_nanos()))
}

/// Absolute deadline `dur` from now.
pub fn get_timeout_time(dur: Duration) -> u64 {
    now().saturating_add(dur_to_ns(dur))
}

/// Time left until `time`, zero if it already passed.
pub fn until(time: u64) -> Duration {
    Duration::from_nanos(time.saturating_sub(now()))
}

/// Everything due at one instant, in insertion order.
#[derive(Debug)]
pub struct TimerEntry<T> {
    time: u64,
    dequeue: VecDeque<T>,
}

impl<T> TimerEntry<T> {
    pub fn new(time: u64) -> Self {
        TimerEntry {
            time,
            dequeue: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.dequeue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dequeue.is_empty()
    }

    pub fn get_time(&self) -> u64 {
        self.time
    }

    pub fn pop_front(&mut self) -> Option<T> {
        self.dequeue.pop_front()
    }

    pub fn push_back(&mut self, t: T) {
        self.dequeue.push_back(t)
    }
}

impl<T: PartialEq> TimerEntry<T> {
    fn remove(&mut self, t: &T) -> bool {
        match self.dequeue.iter().position(|x| x == t) {
            Some(index) => self.dequeue.remove(index).is_some(),
            None => false,
        }
    }
}

/// Entries ordered by ascending time.
#[derive(Debug)]
pub struct TimerList<T> {
    dequeue: VecDeque<TimerEntry<T>>,
}

impl<T> TimerList<T> {
    pub fn new() -> Self {
        TimerList {
            dequeue: VecDeque::new(),
        }
    }

    /// Number of distinct times.
    pub fn len(&self) -> usize {
        self.dequeue.len()
    }

    /// Number of items across all times.
    pub fn count(&self) -> usize {
        self.dequeue.iter().map(TimerEntry::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.dequeue.is_empty()
    }

    pub fn insert(&mut self, time: u64, t: T) {
        match self.dequeue.binary_search_by(|x| x.time.cmp(&time)) {
            Ok(index) => self.dequeue[index].push_back(t),
            Err(index) => {
                let mut entry = TimerEntry::new(time);
                entry.push_back(t);
                self.dequeue.insert(index, entry);
            }
        }
    }

    pub fn front(&self) -> Option<&TimerEntry<T>> {
        self.dequeue.front()
    }

    pub fn pop_front(&mut self) -> Option<TimerEntry<T>> {
        self.dequeue.pop_front()
    }

    /// Earliest time anything is due.
    pub fn next_deadline(&self) -> Option<u64> {
        self.front().map(TimerEntry::get_time)
    }

    /// Removes everything due at or before `now`, earliest first.
    pub fn pop_expired(&mut self, now: u64) -> Vec<T> {
        let mut expired = Vec::new();
        while let Some(entry) = self.front() {
            if now < entry.get_time() {
                break;
            }
            if let Some(entry) = self.pop_front() {
                expired.extend(entry.dequeue);
            }
        }
        expired
    }
}

impl<T: PartialEq> TimerList<T> {
    /// Removes `t` from the entry at `time`. Returns false if it was not there.
    pub fn cancel(&mut self, time: u64, t: &T) -> bool {
        match self.dequeue.binary_search_by(|x| x.time.cmp(&time)) {
            Ok(index) => {
                let removed = self.dequeue[index].remove(t);
                if self.dequeue[index].is_empty() {
                    self.dequeue.remove(index);
                }
                removed
            }
            Err(_) => false,
        }
    }
}

impl<T> Default for TimerList<T> {
    fn default() -> Self {
        TimerList::new()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::{Duration, Instant};

    use crate::TimerList;

    #[test]
    fn now() {
        let a = crate::now();
        thread::sleep(Duration::from_millis(1));
        assert!(crate::now() > a);
    }

    #[test]
    fn instant_round_trip() {
        let deadline = crate::get_timeout_time(Duration::from_millis(50));
        let until = crate::until(deadline);
        assert!(until <= Duration::from_millis(50));
        assert!(until > Duration::ZERO);
        assert_eq!(0, crate::until(0).as_nanos());
        let later = Instant::now() + Duration::from_secs(1);
        assert!(crate::from_instant(later) > crate::now());
    }

    #[test]
    fn timer_list() {
        let mut list = TimerList::new();
        assert_eq!(list.len(), 0);
        list.insert(1, "a");
        assert_eq!(list.len(), 1);

        let mut entry = list.pop_front().unwrap();
        assert_eq!(entry.len(), 1);
        assert_eq!(Some("a"), entry.pop_front());
        assert!(list.is_empty());
    }

    #[test]
    fn ordered_by_time_then_insertion() {
        let mut list = TimerList::new();
        list.insert(30, 'd');
        list.insert(10, 'a');
        list.insert(20, 'c');
        list.insert(10, 'b');
        assert_eq!(3, list.len());
        assert_eq!(4, list.count());
        assert_eq!(Some(10), list.next_deadline());
        assert_eq!(vec!['a', 'b'], list.pop_expired(15));
        assert_eq!(vec!['c', 'd'], list.pop_expired(30));
        assert!(list.pop_expired(u64::MAX).is_empty());
    }

    #[test]
    fn cancel() {
        let mut list = TimerList::new();
        list.insert(10, 1);
        list.insert(10, 2);
        list.insert(20, 3);
        assert!(list.cancel(10, &1));
        assert!(!list.cancel(10, &1));
        assert!(!list.cancel(15, &2));
        assert!(list.cancel(20, &3));
        assert_eq!(1, list.len());
        assert_eq!(vec![2], list.pop_expired(100));
    }
}
