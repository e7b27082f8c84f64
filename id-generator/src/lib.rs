use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

/// Hands out process-wide, per-key increasing ids starting at 1.
pub struct IdGenerator {}

static ID_MAP: Lazy<RwLock<HashMap<&'static str, AtomicUsize>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

impl IdGenerator {
    pub fn next_id(key: &'static str) -> usize {
        // fast path: the counter for this key already exists
        if let Ok(map) = ID_MAP.read() {
            if let Some(id) = map.get(key) {
                return id.fetch_add(1, Ordering::SeqCst);
            }
        }
        let mut map = ID_MAP.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        map.entry(key)
            .or_insert_with(|| AtomicUsize::new(1))
            .fetch_add(1, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use crate::IdGenerator;
    use std::thread;

    #[test]
    fn test() {
        let key = "global";
        assert_eq!(1, IdGenerator::next_id(key));
        assert_eq!(2, IdGenerator::next_id(key));
        assert_eq!(3, IdGenerator::next_id(key));
    }

    #[test]
    fn unique_across_threads() {
        let key = "threads";
        let handles: Vec<_> = (0..4)
            .map(|_| thread::spawn(move || (0..100).map(|_| IdGenerator::next_id(key)).collect::<Vec<_>>()))
            .collect();
        let mut ids: Vec<usize> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(400, ids.len());
        assert_eq!(1, ids[0]);
    }
}
