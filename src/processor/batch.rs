use std::time::Duration;

use tokio::time::Instant;

use crate::event::{DeliveryBatch, FormattedMessage};

/// Groups formatted messages, closing a batch on size or age.
#[derive(Debug)]
pub struct Batcher {
    max_size: usize,
    max_wait: Duration,
    pending: Vec<FormattedMessage>,
    oldest: Option<Instant>,
}

impl Batcher {
    pub fn new(max_size: usize, max_wait: Duration) -> Self {
        Self {
            max_size: max_size.max(1),
            max_wait,
            pending: Vec::new(),
            oldest: None,
        }
    }

    /// Add a message; returns the batch it closed, if it filled one.
    pub fn push(&mut self, message: FormattedMessage, now: Instant) -> Option<DeliveryBatch> {
        if self.pending.is_empty() {
            self.oldest = Some(now);
        }
        self.pending.push(message);
        if self.pending.len() >= self.max_size {
            return self.take();
        }
        None
    }

    /// Close the pending batch if its oldest message has waited `max_wait`.
    pub fn flush_due(&mut self, now: Instant) -> Option<DeliveryBatch> {
        match self.deadline() {
            Some(deadline) if now >= deadline => self.take(),
            _ => None,
        }
    }

    /// When the pending batch must be flushed, if there is one.
    pub fn deadline(&self) -> Option<Instant> {
        self.oldest.map(|oldest| oldest + self.max_wait)
    }

    /// Close whatever is pending, regardless of age.
    pub fn take(&mut self) -> Option<DeliveryBatch> {
        self.oldest = None;
        if self.pending.is_empty() {
            return None;
        }
        Some(DeliveryBatch::new(std::mem::take(&mut self.pending)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use chrono::Utc;

    fn message(n: usize) -> FormattedMessage {
        FormattedMessage {
            kind: EventKind::PlainMessage,
            text: format!("message {}", n),
            dedupe_key: n.to_string(),
            created_at: Utc::now(),
            photo: None,
        }
    }

    fn texts(batch: &DeliveryBatch) -> Vec<String> {
        batch.iter().map(|m| m.text.clone()).collect()
    }

    #[test]
    fn test_flush_by_size() {
        let start = Instant::now();
        let mut batcher = Batcher::new(5, Duration::from_secs(2));

        for n in 0..4 {
            let at = start + Duration::from_millis(20 * n as u64);
            assert!(batcher.push(message(n), at).is_none());
        }
        let batch = batcher
            .push(message(4), start + Duration::from_millis(90))
            .expect("fifth message closes the batch");

        assert_eq!(
            texts(&batch),
            vec!["message 0", "message 1", "message 2", "message 3", "message 4"]
        );
        assert!(batcher.pending.is_empty());
        assert!(batcher.deadline().is_none());
    }

    #[test]
    fn test_flush_by_time() {
        let start = Instant::now();
        let mut batcher = Batcher::new(10, Duration::from_secs(2));

        batcher.push(message(0), start);
        batcher.push(message(1), start + Duration::from_millis(500));

        assert!(batcher.flush_due(start + Duration::from_millis(1_999)).is_none());
        assert_eq!(batcher.deadline(), Some(start + Duration::from_secs(2)));

        let batch = batcher
            .flush_due(start + Duration::from_millis(2_001))
            .expect("batch is due");
        assert_eq!(texts(&batch), vec!["message 0", "message 1"]);
    }

    #[test]
    fn test_deadline_restarts_with_next_message() {
        let start = Instant::now();
        let mut batcher = Batcher::new(10, Duration::from_secs(1));

        batcher.push(message(0), start);
        batcher.flush_due(start + Duration::from_secs(1));
        batcher.push(message(1), start + Duration::from_secs(5));

        assert_eq!(batcher.deadline(), Some(start + Duration::from_secs(6)));
        assert!(batcher.take().is_some());
        assert!(batcher.take().is_none());
    }
}
