//! Pipeline counters

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Process-wide counters shared by the producer and consumer sides
pub struct PipelineMetrics {
    start_time: Instant,
    spins_played: AtomicU64,
    events_published: AtomicU64,
    publish_failures: AtomicU64,
    messages_acked: AtomicU64,
    messages_requeued: AtomicU64,
    messages_dead_lettered: AtomicU64,
    consumer_reconnects: AtomicU64,
}

/// Point-in-time copy of [`PipelineMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub spins_played: u64,
    pub events_published: u64,
    pub publish_failures: u64,
    pub messages_acked: u64,
    pub messages_requeued: u64,
    pub messages_dead_lettered: u64,
    pub consumer_reconnects: u64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            spins_played: AtomicU64::new(0),
            events_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            messages_acked: AtomicU64::new(0),
            messages_requeued: AtomicU64::new(0),
            messages_dead_lettered: AtomicU64::new(0),
            consumer_reconnects: AtomicU64::new(0),
        }
    }

    pub fn record_spin(&self) {
        self.spins_played.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_published(&self) {
        self.events_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish_failure(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ack(&self) {
        self.messages_acked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_requeue(&self) {
        self.messages_requeued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_letter(&self) {
        self.messages_dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.consumer_reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_runtime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Acked messages per second since start
    pub fn average_throughput(&self) -> f64 {
        let total_seconds = self.total_runtime().as_secs_f64();
        if total_seconds < 1.0 {
            return 0.0;
        }
        self.messages_acked.load(Ordering::Relaxed) as f64 / total_seconds
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            spins_played: self.spins_played.load(Ordering::Relaxed),
            events_published: self.events_published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            messages_acked: self.messages_acked.load(Ordering::Relaxed),
            messages_requeued: self.messages_requeued.load(Ordering::Relaxed),
            messages_dead_lettered: self.messages_dead_lettered.load(Ordering::Relaxed),
            consumer_reconnects: self.consumer_reconnects.load(Ordering::Relaxed),
        }
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = PipelineMetrics::new();
        metrics.record_spin();
        metrics.record_spin();
        metrics.record_published();
        metrics.record_requeue();
        metrics.record_dead_letter();

        let snap = metrics.snapshot();
        assert_eq!(snap.spins_played, 2);
        assert_eq!(snap.events_published, 1);
        assert_eq!(snap.messages_requeued, 1);
        assert_eq!(snap.messages_dead_lettered, 1);
        assert_eq!(snap.messages_acked, 0);
    }

    #[test]
    fn test_throughput_is_zero_right_after_start() {
        let metrics = PipelineMetrics::new();
        metrics.record_ack();
        assert_eq!(metrics.average_throughput(), 0.0);
    }
}
