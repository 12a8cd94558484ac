use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Health accounting for the text-generation upstream.
#[derive(Debug, Default)]
pub struct UpstreamStats {
    pub request_count: AtomicU64,
    pub error_count: AtomicU64,
    // Latency stored as microseconds to allow atomic operations.
    pub ewma_latency_us: AtomicU64,
    pub consec_errors: AtomicU32,
}

#[derive(Debug, Serialize)]
pub struct StatsSnapshot {
    pub request_count: u64,
    pub error_count: u64,
    pub ewma_latency_ms: f64,
    pub consec_errors: u32,
    pub healthy: bool,
}

const UNHEALTHY_CONSEC_ERRORS: u32 = 5;

impl UpstreamStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, latency: Duration) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        self.consec_errors.store(0, Ordering::Relaxed);

        let latency_us = latency.as_micros() as u64;

        // Integer EWMA: new = (old * 7 + sample) / 8, alpha = 1/8.
        let mut old = self.ewma_latency_us.load(Ordering::Relaxed);
        loop {
            let new_val = if old == 0 {
                latency_us
            } else {
                (old * 7 + latency_us) / 8
            };
            match self.ewma_latency_us.compare_exchange_weak(
                old,
                new_val,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(x) => old = x,
            }
        }
    }

    pub fn record_failure(&self) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        self.error_count.fetch_add(1, Ordering::Relaxed);
        self.consec_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn is_healthy(&self) -> bool {
        self.consec_errors.load(Ordering::Relaxed) < UNHEALTHY_CONSEC_ERRORS
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            request_count: self.request_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            ewma_latency_ms: self.ewma_latency_us.load(Ordering::Relaxed) as f64 / 1000.0,
            consec_errors: self.consec_errors.load(Ordering::Relaxed),
            healthy: self.is_healthy(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ewma_tracks_latency() {
        let stats = UpstreamStats::new();
        stats.record_success(Duration::from_millis(100));
        assert_eq!(stats.ewma_latency_us.load(Ordering::Relaxed), 100_000);

        stats.record_success(Duration::from_millis(200));
        let ewma = stats.ewma_latency_us.load(Ordering::Relaxed);
        assert!(ewma > 100_000 && ewma < 200_000);
    }

    #[test]
    fn consecutive_failures_flip_health() {
        let stats = UpstreamStats::new();
        for _ in 0..5 {
            stats.record_failure();
        }
        assert!(!stats.is_healthy());

        stats.record_success(Duration::from_millis(50));
        assert!(stats.is_healthy());
        assert_eq!(stats.snapshot().error_count, 5);
    }
}
