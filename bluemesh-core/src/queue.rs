//! Inbound queue: routed payloads waiting for the application to pull them.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tracing::warn;

use crate::config::OverflowPolicy;

/// Result of `InboundQueue::push`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queue was full; the oldest payload was dropped to make room.
    EvictedOldest,
    /// Queue was full; the new payload was dropped.
    Rejected,
}

/// Bounded FIFO of payloads.
pub struct InboundQueue {
    capacity: usize,
    policy: OverflowPolicy,
    items: Mutex<VecDeque<Vec<u8>>>,
}

impl InboundQueue {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            capacity,
            policy,
            items: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, payload: Vec<u8>) -> PushOutcome {
        let mut items = self.items.lock();
        if items.len() < self.capacity {
            items.push_back(payload);
            return PushOutcome::Queued;
        }
        match self.policy {
            OverflowPolicy::DropOldest => {
                items.pop_front();
                items.push_back(payload);
                warn!(capacity = self.capacity, "inbound queue full, dropped oldest payload");
                PushOutcome::EvictedOldest
            }
            OverflowPolicy::DropNewest => {
                warn!(capacity = self.capacity, "inbound queue full, dropped new payload");
                PushOutcome::Rejected
            }
        }
    }

    /// Oldest payload, or None without waiting.
    pub fn pop(&self) -> Option<Vec<u8>> {
        self.items.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
