//! Internal counters in the spirit of the original implementation's
//! Prometheus counters (`cache_hits_total`, `cache_misses_total`,
//! `wal_errors_total`, `wal_switchover_total`, `db_errors_total`). Exposing
//! these over an HTTP `/metrics` endpoint is out of scope for this crate;
//! what's kept is the counting itself plus `tracing` events at the call
//! sites, since an observability-free cache would be unrepresentative of how
//! this codebase actually ships things.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
pub struct Metrics {
    pub cache_hits: Counter,
    pub cache_misses: Counter,
    pub wal_errors: Counter,
    pub wal_switchovers: Counter,
    pub db_errors: Counter,
    pub replication_errors: Counter,
    pub corruption_events: Counter,
}

#[derive(Debug, Clone, Copy)]
pub struct MetricsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub wal_errors: u64,
    pub wal_switchovers: u64,
    pub db_errors: u64,
    pub replication_errors: u64,
    pub corruption_events: u64,
}

impl Metrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            cache_hits: self.cache_hits.get(),
            cache_misses: self.cache_misses.get(),
            wal_errors: self.wal_errors.get(),
            wal_switchovers: self.wal_switchovers.get(),
            db_errors: self.db_errors.get(),
            replication_errors: self.replication_errors.get(),
            corruption_events: self.corruption_events.get(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero_and_increment() {
        let metrics = Metrics::default();
        assert_eq!(metrics.snapshot().cache_hits, 0);
        metrics.cache_hits.inc();
        metrics.cache_hits.inc();
        assert_eq!(metrics.snapshot().cache_hits, 2);
    }
}
