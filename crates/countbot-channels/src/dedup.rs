//! Inbound dedup by provider-assigned message id.
//!
//! Platforms redeliver events after reconnects; each adapter keeps an LRU of
//! recently seen ids and drops repeats before they reach the bus.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

pub const DEFAULT_CAPACITY: usize = 1000;

pub struct SeenMessages {
    inner: Mutex<Inner>,
    capacity: usize,
}

struct Inner {
    set: HashSet<String>,
    order: VecDeque<String>,
}

impl SeenMessages {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                set: HashSet::with_capacity(capacity),
                order: VecDeque::with_capacity(capacity),
            }),
            capacity,
        }
    }

    /// Record `id`, returning `true` when it was seen before.
    pub fn check_and_insert(&self, id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.set.contains(id) {
            return true;
        }
        if inner.order.len() >= self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.set.remove(&oldest);
            }
        }
        inner.set.insert(id.to_string());
        inner.order.push_back(id.to_string());
        false
    }
}

impl Default for SeenMessages {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sighting_is_not_a_duplicate() {
        let seen = SeenMessages::default();
        assert!(!seen.check_and_insert("m1"));
        assert!(seen.check_and_insert("m1"));
    }

    #[test]
    fn capacity_evicts_oldest_first() {
        let seen = SeenMessages::new(2);
        seen.check_and_insert("a");
        seen.check_and_insert("b");
        seen.check_and_insert("c"); // evicts "a"
        assert!(!seen.check_and_insert("a")); // forgotten, so treated as new
        assert!(seen.check_and_insert("c")); // still tracked
    }
}
