use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters for coordination activity in this process
#[derive(Debug, Default)]
pub struct LiveMetrics {
    locks_acquired: AtomicU64,
    locks_contended: AtomicU64,
    claims_matched: AtomicU64,
    claims_won: AtomicU64,
    items_enqueued: AtomicU64,
    replenishments: AtomicU64,
    messages_pulled: AtomicU64,
    items_succeeded: AtomicU64,
    items_dead_lettered: AtomicU64,
    dead_letter_publish_failures: AtomicU64,
    ack_failures: AtomicU64,
}

/// Point-in-time copy of [`LiveMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub locks_acquired: u64,
    pub locks_contended: u64,
    pub claims_matched: u64,
    pub claims_won: u64,
    pub items_enqueued: u64,
    pub replenishments: u64,
    pub messages_pulled: u64,
    pub items_succeeded: u64,
    pub items_dead_lettered: u64,
    pub dead_letter_publish_failures: u64,
    pub ack_failures: u64,
}

impl MetricsSnapshot {
    /// Matched rows lost to a concurrent claimant
    pub fn claims_ceded(&self) -> u64 {
        self.claims_matched.saturating_sub(self.claims_won)
    }

    /// Share of processed items that succeeded, as a percentage
    pub fn success_rate(&self) -> f64 {
        let processed = self.items_succeeded + self.items_dead_lettered;
        if processed == 0 {
            100.0
        } else {
            (self.items_succeeded as f64 / processed as f64) * 100.0
        }
    }
}

impl LiveMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_lock(&self, acquired: bool) {
        if acquired {
            self.locks_acquired.fetch_add(1, Ordering::Relaxed);
        } else {
            self.locks_contended.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_claim(&self, matched: u64, won: u64) {
        self.claims_matched.fetch_add(matched, Ordering::Relaxed);
        self.claims_won.fetch_add(won, Ordering::Relaxed);
    }

    pub fn record_replenishment(&self, enqueued: u64) {
        self.replenishments.fetch_add(1, Ordering::Relaxed);
        self.items_enqueued.fetch_add(enqueued, Ordering::Relaxed);
    }

    pub fn record_pulled(&self, count: u64) {
        self.messages_pulled.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_succeeded(&self) {
        self.items_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_lettered(&self, published: bool) {
        self.items_dead_lettered.fetch_add(1, Ordering::Relaxed);
        if !published {
            self.dead_letter_publish_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_ack_failure(&self) {
        self.ack_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            locks_acquired: self.locks_acquired.load(Ordering::Relaxed),
            locks_contended: self.locks_contended.load(Ordering::Relaxed),
            claims_matched: self.claims_matched.load(Ordering::Relaxed),
            claims_won: self.claims_won.load(Ordering::Relaxed),
            items_enqueued: self.items_enqueued.load(Ordering::Relaxed),
            replenishments: self.replenishments.load(Ordering::Relaxed),
            messages_pulled: self.messages_pulled.load(Ordering::Relaxed),
            items_succeeded: self.items_succeeded.load(Ordering::Relaxed),
            items_dead_lettered: self.items_dead_lettered.load(Ordering::Relaxed),
            dead_letter_publish_failures: self.dead_letter_publish_failures.load(Ordering::Relaxed),
            ack_failures: self.ack_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_counters_track_ceded_rows() {
        let metrics = LiveMetrics::new();
        metrics.record_claim(50, 42);
        metrics.record_claim(10, 10);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.claims_matched, 60);
        assert_eq!(snapshot.claims_won, 52);
        assert_eq!(snapshot.claims_ceded(), 8);
    }

    #[test]
    fn test_success_rate() {
        let metrics = LiveMetrics::new();
        assert_eq!(metrics.snapshot().success_rate(), 100.0);

        metrics.record_succeeded();
        metrics.record_succeeded();
        metrics.record_succeeded();
        metrics.record_dead_lettered(false);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.success_rate(), 75.0);
        assert_eq!(snapshot.dead_letter_publish_failures, 1);
    }
}
