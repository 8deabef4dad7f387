//! Monotonic counters exported through the admin `/stats` endpoint.
//!
//! Counters are updated with atomic arithmetic so the event path never takes
//! the model lock just to bump a number.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct Stats {
    running_servers: AtomicU64,
    launched_servers: AtomicU64,
    failed_servers: AtomicU64,
    cluster_livelocks: AtomicU64,
    cluster_reseeds: AtomicU64,
    healthy: AtomicU64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub running_servers: u64,
    pub launched_servers: u64,
    pub failed_servers: u64,
    pub cluster_livelocks: u64,
    pub cluster_reseeds: u64,
    pub healthy: u64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_running_servers(&self, count: u64) {
        self.running_servers.store(count, Ordering::Relaxed);
    }

    pub fn incr_launched_servers(&self) {
        self.launched_servers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_failed_servers(&self) {
        self.failed_servers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_cluster_livelocks(&self) {
        self.cluster_livelocks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_cluster_reseeds(&self) {
        self.cluster_reseeds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            running_servers: self.running_servers.load(Ordering::Relaxed),
            launched_servers: self.launched_servers.load(Ordering::Relaxed),
            failed_servers: self.failed_servers.load(Ordering::Relaxed),
            cluster_livelocks: self.cluster_livelocks.load(Ordering::Relaxed),
            cluster_reseeds: self.cluster_reseeds.load(Ordering::Relaxed),
            healthy: self.healthy.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_into_the_snapshot() {
        let stats = Stats::new();
        stats.incr_launched_servers();
        stats.incr_launched_servers();
        stats.incr_failed_servers();
        stats.set_running_servers(3);
        stats.set_healthy(true);

        let snap = stats.snapshot();
        assert_eq!(snap.launched_servers, 2);
        assert_eq!(snap.failed_servers, 1);
        assert_eq!(snap.running_servers, 3);
        assert_eq!(snap.healthy, 1);
        assert_eq!(snap.cluster_reseeds, 0);
    }

    #[test]
    fn snapshot_serializes_with_stable_field_names() {
        let json = serde_json::to_value(Stats::new().snapshot()).unwrap();
        for field in [
            "running_servers",
            "launched_servers",
            "failed_servers",
            "cluster_livelocks",
            "cluster_reseeds",
            "healthy",
        ] {
            assert!(json.get(field).is_some(), "missing field {}", field);
        }
    }
}
