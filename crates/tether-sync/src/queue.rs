//! # Offline Queue
//!
//! Buffers publishes made while the session is not connected.
//!
//! ## Queue Behavior
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Offline Queue                                    │
//! │                                                                         │
//! │  offline:   publish(a) publish(b) publish(c)                            │
//! │                 │          │          │                                 │
//! │                 ▼          ▼          ▼                                 │
//! │             ┌──────┬──────┬──────┐                                      │
//! │   front ──► │  a   │  b   │  c   │ ◄── back                             │
//! │             └──────┴──────┴──────┘                                      │
//! │                                                                         │
//! │  full + Oldest:  a is dropped, d is appended   → [b, c, d]              │
//! │  full + Newest:  d is dropped                  → [a, b, c]              │
//! │                                                                         │
//! │  reconnect: drained from the front, one per drain tick.                 │
//! │  Publishes made during the drain go to the back, so the wire order      │
//! │  always equals the enqueue order.                                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, warn};

use crate::connector::OutboundPublish;

/// Which publish is discarded when a bounded queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DropPolicy {
    /// Discard the oldest queued publish to make room.
    #[default]
    Oldest,
    /// Discard the publish being added.
    Newest,
}

/// Result of adding a publish to the queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Enqueued {
    Queued,
    /// Queued after discarding this older publish.
    Displaced(OutboundPublish),
    /// Not queued; the queue was full and keeps its oldest entries.
    Dropped,
}

/// FIFO of pending publishes with an optional bound.
#[derive(Debug)]
pub struct OfflineQueue {
    items: VecDeque<OutboundPublish>,
    /// 0 = unbounded.
    max: usize,
    policy: DropPolicy,
    dropped: u64,
}

impl OfflineQueue {
    pub fn new(max: usize, policy: DropPolicy) -> Self {
        OfflineQueue {
            items: VecDeque::new(),
            max,
            policy,
            dropped: 0,
        }
    }

    pub fn push(&mut self, publish: OutboundPublish) -> Enqueued {
        if self.max == 0 || self.items.len() < self.max {
            debug!(topic = %publish.topic, queued = self.items.len() + 1, "Publish queued");
            self.items.push_back(publish);
            return Enqueued::Queued;
        }

        self.dropped += 1;
        match self.policy {
            DropPolicy::Oldest => match self.items.pop_front() {
                Some(oldest) => {
                    warn!(topic = %oldest.topic, max = self.max, "Offline queue full, dropped oldest publish");
                    self.items.push_back(publish);
                    Enqueued::Displaced(oldest)
                }
                None => {
                    self.items.push_back(publish);
                    Enqueued::Queued
                }
            },
            DropPolicy::Newest => {
                warn!(topic = %publish.topic, max = self.max, "Offline queue full, dropped new publish");
                Enqueued::Dropped
            }
        }
    }

    pub fn pop(&mut self) -> Option<OutboundPublish> {
        self.items.pop_front()
    }

    /// Puts a publish back at the front, used when a send fails mid-drain.
    pub fn requeue_front(&mut self, publish: OutboundPublish) {
        self.items.push_front(publish);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Total publishes discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::Qos;

    fn publish(n: u8) -> OutboundPublish {
        OutboundPublish {
            topic: format!("t/{}", n),
            payload: vec![n],
            qos: Qos::AtLeastOnce,
            retain: false,
        }
    }

    fn drain(queue: &mut OfflineQueue) -> Vec<u8> {
        std::iter::from_fn(|| queue.pop()).map(|p| p.payload[0]).collect()
    }

    #[test]
    fn test_unbounded_preserves_order() {
        let mut queue = OfflineQueue::new(0, DropPolicy::Oldest);
        for n in 0..100 {
            assert_eq!(queue.push(publish(n)), Enqueued::Queued);
        }
        assert_eq!(queue.len(), 100);
        assert_eq!(drain(&mut queue), (0..100).collect::<Vec<_>>());
        assert_eq!(queue.dropped(), 0);
    }

    #[test]
    fn test_bounded_drops_oldest() {
        let mut queue = OfflineQueue::new(3, DropPolicy::Oldest);
        for n in 1..=3 {
            queue.push(publish(n));
        }
        assert_eq!(queue.push(publish(4)), Enqueued::Displaced(publish(1)));
        assert_eq!(queue.dropped(), 1);
        assert_eq!(drain(&mut queue), vec![2, 3, 4]);
    }

    #[test]
    fn test_bounded_drops_newest() {
        let mut queue = OfflineQueue::new(2, DropPolicy::Newest);
        queue.push(publish(1));
        queue.push(publish(2));
        assert_eq!(queue.push(publish(3)), Enqueued::Dropped);
        assert_eq!(drain(&mut queue), vec![1, 2]);
        assert_eq!(queue.dropped(), 1);
    }

    #[test]
    fn test_requeue_front() {
        let mut queue = OfflineQueue::new(0, DropPolicy::Oldest);
        queue.push(publish(1));
        queue.push(publish(2));
        let first = queue.pop().unwrap();
        queue.requeue_front(first);
        assert_eq!(drain(&mut queue), vec![1, 2]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drop_policy_serde() {
        assert_eq!(
            serde_json::from_str::<DropPolicy>("\"newest\"").unwrap(),
            DropPolicy::Newest
        );
        assert_eq!(DropPolicy::default(), DropPolicy::Oldest);
    }
}
