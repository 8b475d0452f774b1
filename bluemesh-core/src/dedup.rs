//! Dedup window: bounded FIFO of recently seen message IDs.

use std::collections::{HashSet, VecDeque};

use parking_lot::Mutex;

use crate::wire::MessageId;

/// Default number of message IDs remembered.
pub const DEFAULT_HISTORY_LEN: usize = 256;

struct Window {
    seen: HashSet<MessageId>,
    order: VecDeque<MessageId>,
}

/// Decides novelty. Every method takes the single window lock, so concurrent
/// callers never both see the same ID as novel.
pub struct Deduplicator {
    capacity: usize,
    window: Mutex<Window>,
}

impl Deduplicator {
    /// `capacity` must be non-zero; `RouterConfig::validate` enforces this.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            window: Mutex::new(Window {
                seen: HashSet::with_capacity(capacity),
                order: VecDeque::with_capacity(capacity),
            }),
        }
    }

    /// Check-and-insert in one critical section. Returns true if `id` was novel.
    /// Eviction is strict FIFO: re-observing an ID does not refresh it.
    pub fn observe(&self, id: MessageId) -> bool {
        let mut w = self.window.lock();
        if !w.seen.insert(id) {
            return false;
        }
        w.order.push_back(id);
        while w.order.len() > self.capacity {
            if let Some(old) = w.order.pop_front() {
                w.seen.remove(&old);
            }
        }
        true
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.window.lock().seen.contains(id)
    }

    pub fn len(&self) -> usize {
        self.window.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LEN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::MESSAGE_ID_LEN;
    use std::sync::Arc;

    fn id(n: u32) -> MessageId {
        let mut b = [0u8; MESSAGE_ID_LEN];
        b[..4].copy_from_slice(&n.to_le_bytes());
        MessageId::from_bytes(b)
    }

    #[test]
    fn first_sight_is_novel_second_is_duplicate() {
        let d = Deduplicator::new(4);
        assert!(d.observe(id(1)));
        assert!(!d.observe(id(1)));
        assert_eq!(d.len(), 1);
    }

    #[test]
    fn equal_bytes_are_the_same_id() {
        let d = Deduplicator::new(4);
        let a = MessageId::from_bytes([9u8; MESSAGE_ID_LEN]);
        let b = MessageId::from_bytes([9u8; MESSAGE_ID_LEN]);
        assert!(d.observe(a));
        assert!(!d.observe(b));
    }

    #[test]
    fn window_keeps_most_recent_n() {
        let n = 5usize;
        let m = 12u32;
        let d = Deduplicator::new(n);
        for i in 0..m {
            assert!(d.observe(id(i)));
            assert!(d.len() <= n);
        }
        assert_eq!(d.len(), n);
        // The N most recent are still duplicates.
        for i in (m - n as u32)..m {
            assert!(d.contains(&id(i)), "id {} should remain", i);
        }
        // The earliest M - N fell out and are novel again.
        for i in 0..(m - n as u32) {
            assert!(!d.contains(&id(i)), "id {} should be evicted", i);
        }
        assert!(d.observe(id(0)));
    }

    #[test]
    fn eviction_is_fifo_not_lru() {
        let d = Deduplicator::new(2);
        assert!(d.observe(id(1)));
        assert!(d.observe(id(2)));
        // Seeing 1 again must not refresh it.
        assert!(!d.observe(id(1)));
        assert!(d.observe(id(3)));
        assert!(!d.contains(&id(1)));
        assert!(d.contains(&id(2)));
        assert!(d.contains(&id(3)));
    }

    #[test]
    fn concurrent_observers_agree_on_one_winner() {
        let d = Arc::new(Deduplicator::new(64));
        let target = id(42);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let d = d.clone();
                std::thread::spawn(move || d.observe(target))
            })
            .collect();
        let novel = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&b| b)
            .count();
        assert_eq!(novel, 1);
    }

    #[test]
    fn random_ids_respect_bound() {
        use rand::RngCore;
        let d = Deduplicator::new(16);
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let mut b = [0u8; MESSAGE_ID_LEN];
            rng.fill_bytes(&mut b);
            d.observe(MessageId::from_bytes(b));
            assert!(d.len() <= d.capacity());
        }
        assert_eq!(d.len(), 16);
    }
}
