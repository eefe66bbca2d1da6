//! Session-factory statistics.
//!
//! Counters are fire-and-forget: recording never fails and is a no-op when
//! statistics are disabled.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

/// Observability hook fed by sessions.
pub trait StatisticsSink: Send + Sync {
    fn is_enabled(&self) -> bool;

    fn optimistic_failure(&self, entity_name: &str);

    fn entity_loaded(&self, _entity_name: &str) {}

    fn entity_inserted(&self, _entity_name: &str) {}

    fn entity_updated(&self, _entity_name: &str) {}

    fn entity_deleted(&self, _entity_name: &str) {}

    fn flushed(&self) {}
}

/// Atomic counters with per-entity optimistic-failure tallies.
#[derive(Debug, Default)]
pub struct Statistics {
    enabled: AtomicBool,
    loads: AtomicU64,
    inserts: AtomicU64,
    updates: AtomicU64,
    deletes: AtomicU64,
    flushes: AtomicU64,
    optimistic_failures: AtomicU64,
    optimistic_failures_by_entity: Mutex<HashMap<String, u64>>,
}

/// Point-in-time copy of [`Statistics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct StatisticsSnapshot {
    pub loads: u64,
    pub inserts: u64,
    pub updates: u64,
    pub deletes: u64,
    pub flushes: u64,
    pub optimistic_failures: u64,
}

impl Statistics {
    pub fn new(enabled: bool) -> Self {
        let stats = Self::default();
        stats.enabled.store(enabled, Ordering::Relaxed);
        stats
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            loads: self.loads.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            optimistic_failures: self.optimistic_failures.load(Ordering::Relaxed),
        }
    }

    /// Optimistic failures recorded for one entity name.
    pub fn optimistic_failures_for(&self, entity_name: &str) -> u64 {
        self.optimistic_failures_by_entity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(entity_name)
            .copied()
            .unwrap_or(0)
    }

    pub fn clear(&self) {
        for counter in [
            &self.loads,
            &self.inserts,
            &self.updates,
            &self.deletes,
            &self.flushes,
            &self.optimistic_failures,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.optimistic_failures_by_entity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn bump(&self, counter: &AtomicU64) {
        if self.is_enabled() {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl StatisticsSink for Statistics {
    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn optimistic_failure(&self, entity_name: &str) {
        if !self.is_enabled() {
            return;
        }
        self.optimistic_failures.fetch_add(1, Ordering::Relaxed);
        *self
            .optimistic_failures_by_entity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(entity_name.to_string())
            .or_insert(0) += 1;
    }

    fn entity_loaded(&self, _entity_name: &str) {
        self.bump(&self.loads);
    }

    fn entity_inserted(&self, _entity_name: &str) {
        self.bump(&self.inserts);
    }

    fn entity_updated(&self, _entity_name: &str) {
        self.bump(&self.updates);
    }

    fn entity_deleted(&self, _entity_name: &str) {
        self.bump(&self.deletes);
    }

    fn flushed(&self) {
        self.bump(&self.flushes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_records_nothing() {
        let stats = Statistics::new(false);
        stats.optimistic_failure("Order");
        stats.entity_inserted("Order");
        assert_eq!(stats.snapshot(), StatisticsSnapshot::default());
        assert_eq!(stats.optimistic_failures_for("Order"), 0);
    }

    #[test]
    fn test_counts_per_entity() {
        let stats = Statistics::new(true);
        stats.optimistic_failure("Order");
        stats.optimistic_failure("Order");
        stats.optimistic_failure("Customer");
        stats.entity_loaded("Order");
        stats.flushed();

        let snap = stats.snapshot();
        assert_eq!(snap.optimistic_failures, 3);
        assert_eq!(snap.loads, 1);
        assert_eq!(snap.flushes, 1);
        assert_eq!(stats.optimistic_failures_for("Order"), 2);
        assert_eq!(stats.optimistic_failures_for("Customer"), 1);

        stats.clear();
        assert_eq!(stats.snapshot(), StatisticsSnapshot::default());
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = Statistics::new(true);
        stats.entity_deleted("Order");
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["deletes"], 1);
    }
}
