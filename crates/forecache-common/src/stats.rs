//! Engine statistics
//!
//! Counters accumulate for the lifetime of the process and are only reset
//! by a restart. They are owned by the engine and updated through the
//! `record_*` methods; readers take a [`StatsSnapshot`].

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-lifetime counters
#[derive(Debug, Default)]
pub struct EngineStats {
    files_checked: AtomicU64,
    files_queued: AtomicU64,
    files_downloaded: AtomicU64,
    files_skipped: AtomicU64,
    files_deleted: AtomicU64,
    index_updates: AtomicU64,
    index_keys_expired: AtomicU64,
    status_errors: AtomicU64,
    download_errors: AtomicU64,
    oversize_errors: AtomicU64,
    timeouts: AtomicU64,
    index_errors: AtomicU64,
    config_errors: AtomicU64,
    last_check: Mutex<Option<DateTime<Utc>>>,
    last_cleanup: Mutex<Option<DateTime<Utc>>>,
}

/// Point-in-time copy of [`EngineStats`]
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub files_checked: u64,
    pub files_queued: u64,
    pub files_downloaded: u64,
    pub files_skipped: u64,
    pub files_deleted: u64,
    pub index_updates: u64,
    pub index_keys_expired: u64,
    pub status_errors: u64,
    pub download_errors: u64,
    pub oversize_errors: u64,
    pub timeouts: u64,
    pub index_errors: u64,
    pub config_errors: u64,
    pub last_check: Option<DateTime<Utc>>,
    pub last_cleanup: Option<DateTime<Utc>>,
}

impl StatsSnapshot {
    /// Sum of every error counter
    #[must_use]
    pub const fn total_errors(&self) -> u64 {
        self.status_errors
            + self.download_errors
            + self.oversize_errors
            + self.timeouts
            + self.index_errors
            + self.config_errors
    }
}

fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

impl EngineStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// One status check evaluated `checked` valid times
    pub fn record_check(&self, checked: u64, queued: u64, skipped: u64) {
        add(&self.files_checked, checked);
        add(&self.files_queued, queued);
        add(&self.files_skipped, skipped);
        *self.last_check.lock() = Some(Utc::now());
    }

    /// A single file was queued outside a status check
    pub fn record_queued(&self) {
        add(&self.files_queued, 1);
    }

    /// A single file was skipped outside a status check
    pub fn record_skipped(&self) {
        add(&self.files_skipped, 1);
    }

    pub fn record_download(&self) {
        add(&self.files_downloaded, 1);
    }

    pub fn record_deleted(&self) {
        add(&self.files_deleted, 1);
    }

    pub fn record_index_update(&self) {
        add(&self.index_updates, 1);
    }

    pub fn record_keys_expired(&self, n: u64) {
        add(&self.index_keys_expired, n);
    }

    pub fn record_cleanup(&self) {
        *self.last_cleanup.lock() = Some(Utc::now());
    }

    pub fn record_status_error(&self) {
        add(&self.status_errors, 1);
    }

    pub fn record_download_error(&self) {
        add(&self.download_errors, 1);
    }

    pub fn record_oversize(&self) {
        add(&self.oversize_errors, 1);
    }

    pub fn record_timeout(&self) {
        add(&self.timeouts, 1);
    }

    pub fn record_index_error(&self) {
        add(&self.index_errors, 1);
    }

    pub fn record_config_error(&self) {
        add(&self.config_errors, 1);
    }

    /// Copy the current values
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            files_checked: load(&self.files_checked),
            files_queued: load(&self.files_queued),
            files_downloaded: load(&self.files_downloaded),
            files_skipped: load(&self.files_skipped),
            files_deleted: load(&self.files_deleted),
            index_updates: load(&self.index_updates),
            index_keys_expired: load(&self.index_keys_expired),
            status_errors: load(&self.status_errors),
            download_errors: load(&self.download_errors),
            oversize_errors: load(&self.oversize_errors),
            timeouts: load(&self.timeouts),
            index_errors: load(&self.index_errors),
            config_errors: load(&self.config_errors),
            last_check: *self.last_check.lock(),
            last_cleanup: *self.last_cleanup.lock(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_check() {
        let stats = EngineStats::new();
        stats.record_check(10, 3, 7);
        stats.record_check(10, 0, 10);

        let snap = stats.snapshot();
        assert_eq!(snap.files_checked, 20);
        assert_eq!(snap.files_queued, 3);
        assert_eq!(snap.files_skipped, 17);
        assert!(snap.last_check.is_some());
        assert!(snap.last_cleanup.is_none());
    }

    #[test]
    fn test_total_errors() {
        let stats = EngineStats::new();
        stats.record_status_error();
        stats.record_download_error();
        stats.record_oversize();
        stats.record_timeout();
        stats.record_index_error();

        let snap = stats.snapshot();
        assert_eq!(snap.total_errors(), 5);
        assert_eq!(snap.config_errors, 0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = EngineStats::new();
        stats.record_download();
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["files_downloaded"], 1);
        assert!(json["last_check"].is_null());
    }
}
