//! Runtime counters
//!
//! Lock-free counters incremented from worker tasks and snapshotted for
//! periodic status logs.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::classify::ErrorClass;

#[derive(Debug, Default)]
pub struct GlobalStats {
    cycles_started: AtomicU64,
    cycles_verified: AtomicU64,
    cycles_cancelled: AtomicU64,
    full_logins: AtomicU64,
    snapshot_restores: AtomicU64,
    toggle_corrections: AtomicU64,
    failures_transient: AtomicU64,
    failures_structural: AtomicU64,
    failures_authentication: AtomicU64,
    failures_resource: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub cycles_started: u64,
    pub cycles_verified: u64,
    pub cycles_cancelled: u64,
    pub full_logins: u64,
    pub snapshot_restores: u64,
    pub toggle_corrections: u64,
    pub failures_transient: u64,
    pub failures_structural: u64,
    pub failures_authentication: u64,
    pub failures_resource: u64,
}

impl GlobalStats {
    pub fn cycle_started(&self) {
        self.cycles_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cycle_verified(&self) {
        self.cycles_verified.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cycle_cancelled(&self) {
        self.cycles_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn full_login(&self) {
        self.full_logins.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot_restore(&self) {
        self.snapshot_restores.fetch_add(1, Ordering::Relaxed);
    }

    pub fn toggle_corrections(&self, count: u64) {
        self.toggle_corrections.fetch_add(count, Ordering::Relaxed);
    }

    pub fn failure(&self, class: ErrorClass) {
        let counter = match class {
            ErrorClass::Transient => &self.failures_transient,
            ErrorClass::Structural => &self.failures_structural,
            ErrorClass::Authentication => &self.failures_authentication,
            ErrorClass::Resource => &self.failures_resource,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            cycles_started: self.cycles_started.load(Ordering::Relaxed),
            cycles_verified: self.cycles_verified.load(Ordering::Relaxed),
            cycles_cancelled: self.cycles_cancelled.load(Ordering::Relaxed),
            full_logins: self.full_logins.load(Ordering::Relaxed),
            snapshot_restores: self.snapshot_restores.load(Ordering::Relaxed),
            toggle_corrections: self.toggle_corrections.load(Ordering::Relaxed),
            failures_transient: self.failures_transient.load(Ordering::Relaxed),
            failures_structural: self.failures_structural.load(Ordering::Relaxed),
            failures_authentication: self.failures_authentication.load(Ordering::Relaxed),
            failures_resource: self.failures_resource.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_land_in_their_class_counter() {
        let stats = GlobalStats::default();
        stats.failure(ErrorClass::Transient);
        stats.failure(ErrorClass::Transient);
        stats.failure(ErrorClass::Resource);

        let snap = stats.snapshot();
        assert_eq!(snap.failures_transient, 2);
        assert_eq!(snap.failures_resource, 1);
        assert_eq!(snap.failures_structural, 0);
    }
}
