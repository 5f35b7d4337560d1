use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::info;

/// Process-wide counters, shared between the pipeline stages. Counters only grow.
#[derive(Debug)]
pub struct Statistics {
    started_at: DateTime<Utc>,
    started: Instant,
    frames_received: AtomicU64,
    processed: AtomicU64,
    errors: AtomicU64,
    reconnects: AtomicU64,
    duplicates: AtomicU64,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, PartialEq)]
pub struct StatsSnapshot {
    pub started_at: DateTime<Utc>,
    pub uptime: Duration,
    pub frames_received: u64,
    pub processed: u64,
    pub errors: u64,
    pub reconnects: u64,
    pub duplicates: u64,
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

impl Statistics {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            started: Instant::now(),
            frames_received: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
        }
    }

    pub fn record_frame(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    /// A message reached the chat API
    pub fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            started_at: self.started_at,
            uptime: self.started.elapsed(),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
        }
    }
}

impl StatsSnapshot {
    pub fn log(&self) {
        info!(
            "Stats: uptime={}s frames={} processed={} errors={} reconnects={} duplicates={}",
            self.uptime.as_secs(),
            self.frames_received,
            self.processed,
            self.errors,
            self.reconnects,
            self.duplicates
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = Statistics::new();
        stats.record_frame();
        stats.record_frame();
        stats.record_processed();
        stats.record_error();
        stats.record_reconnect();
        stats.record_duplicate();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.frames_received, 2);
        assert_eq!(snapshot.processed, 1);
        assert_eq!(snapshot.errors, 1);
        assert_eq!(snapshot.reconnects, 1);
        assert_eq!(snapshot.duplicates, 1);
    }
}
