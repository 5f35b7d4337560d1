use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;

/// Bounded record of recently seen dedupe keys.
///
/// Entries expire `retention` after they were first seen. When full, the
/// oldest entry is evicted to make room.
#[derive(Debug)]
pub struct DedupeWindow {
    capacity: usize,
    retention: Duration,
    seen: HashMap<String, Instant>,
    order: VecDeque<(String, Instant)>,
}

impl DedupeWindow {
    pub fn new(capacity: usize, retention: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            retention,
            seen: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Returns true when `key` was already seen within the retention period.
    /// Unseen keys are recorded.
    pub fn check_and_insert(&mut self, key: &str, now: Instant) -> bool {
        self.expire(now);
        if self.seen.contains_key(key) {
            return true;
        }

        while self.seen.len() >= self.capacity {
            match self.order.pop_front() {
                Some((oldest, _)) => {
                    self.seen.remove(&oldest);
                }
                None => break,
            }
        }

        self.seen.insert(key.to_string(), now);
        self.order.push_back((key.to_string(), now));
        false
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    fn expire(&mut self, now: Instant) {
        while let Some((key, seen_at)) = self.order.front() {
            if now.saturating_duration_since(*seen_at) < self.retention {
                break;
            }
            self.seen.remove(key);
            self.order.pop_front();
        }
    }
}
