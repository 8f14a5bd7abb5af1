//! Bounded cache of recently seen delivery ids.
//!
//! Idempotency only holds inside the retained window: once an id is evicted a
//! very late retry of it will be processed again.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

pub struct DeliveryDeduplicator {
    inner: Mutex<Window>,
}

struct Window {
    capacity: usize,
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl DeliveryDeduplicator {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Window {
                capacity: capacity.max(1),
                order: VecDeque::with_capacity(capacity.max(1)),
                seen: HashSet::with_capacity(capacity.max(1)),
            }),
        }
    }

    pub fn seen_before(&self, delivery_id: &str) -> bool {
        self.lock().seen.contains(delivery_id)
    }

    /// Record `delivery_id`, evicting the oldest entries once over capacity.
    /// Returns false if it was already present.
    pub fn mark_seen(&self, delivery_id: &str) -> bool {
        let mut window = self.lock();
        if !window.seen.insert(delivery_id.to_string()) {
            return false;
        }
        window.order.push_back(delivery_id.to_string());
        while window.order.len() > window.capacity {
            if let Some(oldest) = window.order.pop_front() {
                window.seen.remove(&oldest);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Window> {
        // A poisoned window is still consistent between statements.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for DeliveryDeduplicator {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_DEDUP_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn seen_before_does_not_mutate() {
        let dedup = DeliveryDeduplicator::new(10);
        assert!(!dedup.seen_before("a"));
        assert!(!dedup.seen_before("a"));
        assert!(dedup.is_empty());

        dedup.mark_seen("a");
        assert!(dedup.seen_before("a"));
        assert_eq!(dedup.len(), 1);
    }

    #[test]
    fn marking_twice_keeps_one_entry() {
        let dedup = DeliveryDeduplicator::new(10);
        assert!(dedup.mark_seen("a"));
        assert!(!dedup.mark_seen("a"));
        assert_eq!(dedup.len(), 1);
    }

    #[test]
    fn evicts_oldest_beyond_capacity() {
        let dedup = DeliveryDeduplicator::new(1000);
        for i in 0..1001 {
            dedup.mark_seen(&format!("delivery-{i}"));
        }
        assert_eq!(dedup.len(), 1000);
        assert!(!dedup.seen_before("delivery-0"));
        assert!(dedup.seen_before("delivery-1"));
        assert!(dedup.seen_before("delivery-1000"));
    }

    #[test]
    fn concurrent_marks_for_different_ids() {
        let dedup = Arc::new(DeliveryDeduplicator::new(10_000));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let dedup = dedup.clone();
                std::thread::spawn(move || {
                    for i in 0..500 {
                        let id = format!("{t}-{i}");
                        assert!(!dedup.seen_before(&id));
                        assert!(dedup.mark_seen(&id));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(dedup.len(), 4000);
    }
}
