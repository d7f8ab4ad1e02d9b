//! Retention sweep
//!
//! Two passes per model:
//!
//! - **Index pass**: drops index keys older than the model's
//!   `retentionHours`, when set.
//! - **Filesystem pass**: deletes data files whose mtime is older than the
//!   filesystem horizon (global `retention.filesystem_hours`, overridable per
//!   model), then prunes directories left empty.
//!
//! The horizons are independent; index keys are forecast times while the
//! filesystem pass looks at when a file was written. Deletions go through
//! the cleanup queue. In-progress `.tmp` files never match, and directories
//! holding an in-flight destination are never pruned.

use crate::cleanup::CleanupQueue;
use crate::ingest::InFlight;
use crate::queue::TaskOutcome;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use forecache_common::{EngineStats, ModelDefinition, ModelRegistry};
use forecache_index::PathIndex;
use serde::Serialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info, warn};
use walkdir::{DirEntry, WalkDir};

/// Totals for one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub keys_removed: u64,
    pub files_deleted: u64,
    pub dirs_pruned: u64,
    pub errors: u64,
}

impl SweepReport {
    fn merge(&mut self, other: Self) {
        self.keys_removed += other.keys_removed;
        self.files_deleted += other.files_deleted;
        self.dirs_pruned += other.dirs_pruned;
        self.errors += other.errors;
    }
}

/// Result of walking one model directory
#[derive(Debug, Default)]
struct Scan {
    /// Data files older than the cutoff
    expired: Vec<PathBuf>,
    /// Subdirectories, deepest first
    dirs: Vec<PathBuf>,
    errors: u64,
}

fn is_data_file(entry: &DirEntry, extensions: &[String]) -> bool {
    entry
        .file_name()
        .to_str()
        .is_some_and(|name| extensions.iter().any(|ext| name.ends_with(ext.as_str())))
}

/// Walk `root` bottom-up, collecting expired data files
fn scan_model_dir(root: &Path, extensions: &[String], cutoff: SystemTime) -> Scan {
    let mut scan = Scan::default();
    let walker = WalkDir::new(root)
        .min_depth(1)
        .contents_first(true)
        .into_iter()
        .filter_entry(|entry| entry.file_type().is_dir() || is_data_file(entry, extensions));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Failed to walk {}: {}", root.display(), e);
                scan.errors += 1;
                continue;
            }
        };
        if entry.file_type().is_dir() {
            scan.dirs.push(entry.into_path());
            continue;
        }
        if !entry.file_type().is_file() {
            continue;
        }
        let modified = entry
            .metadata()
            .map_err(std::io::Error::from)
            .and_then(|m| m.modified());
        match modified {
            Ok(modified) if modified < cutoff => scan.expired.push(entry.into_path()),
            Ok(_) => {}
            Err(e) => {
                warn!("Failed to stat {}: {}", entry.path().display(), e);
                scan.errors += 1;
            }
        }
    }
    scan
}

/// Runs retention sweeps over every registered model
pub struct Evictor {
    cache_root: PathBuf,
    registry: Arc<ModelRegistry>,
    index: Arc<PathIndex>,
    cleanup: Arc<CleanupQueue>,
    stats: Arc<EngineStats>,
    filesystem_hours: Option<u64>,
    placeholder_extension: Option<String>,
    in_flight: Arc<InFlight>,
}

impl Evictor {
    pub fn new(
        cache_root: PathBuf,
        registry: Arc<ModelRegistry>,
        index: Arc<PathIndex>,
        cleanup: Arc<CleanupQueue>,
        stats: Arc<EngineStats>,
        filesystem_hours: Option<u64>,
        placeholder_extension: Option<String>,
    ) -> Self {
        Self {
            cache_root,
            registry,
            index,
            cleanup,
            stats,
            filesystem_hours,
            placeholder_extension,
            in_flight: Arc::new(InFlight::default()),
        }
    }

    /// Leave directories holding an in-flight destination alone
    #[must_use]
    pub fn with_in_flight(mut self, in_flight: Arc<InFlight>) -> Self {
        self.in_flight = in_flight;
        self
    }

    /// Sweep all models relative to the current time
    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(Utc::now()).await
    }

    /// Sweep all models relative to `now`
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        info!("Starting retention sweep");
        let mut report = SweepReport::default();
        for model in self.registry.iter() {
            let model_report = self.sweep_model(model, now).await;
            if model_report.errors > 0 {
                warn!(
                    "Retention sweep for {} finished with {} errors",
                    model.name, model_report.errors
                );
            }
            report.merge(model_report);
        }
        self.stats.record_cleanup();
        info!(
            "Retention sweep completed: {} index keys, {} files, {} directories removed",
            report.keys_removed, report.files_deleted, report.dirs_pruned
        );
        report
    }

    async fn sweep_model(&self, model: &ModelDefinition, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        if let Some(hours) = model.retention_hours {
            let cutoff = index_cutoff(now, hours);
            match self.index.cleanup(&model.key, cutoff) {
                Ok(removed) => {
                    let removed = removed as u64;
                    report.keys_removed = removed;
                    self.stats.record_keys_expired(removed);
                }
                Err(e) => {
                    error!("Failed to clean index for {}: {}", model.name, e);
                    self.stats.record_index_error();
                    report.errors += 1;
                }
            }
        }

        if let Some(hours) = model.filesystem_retention_hours.or(self.filesystem_hours) {
            let cutoff = SystemTime::from(now)
                .checked_sub(Duration::from_secs(hours.saturating_mul(3600)))
                .unwrap_or(SystemTime::UNIX_EPOCH);
            report.merge(self.sweep_files(model, cutoff).await);
        }
        report
    }

    async fn sweep_files(&self, model: &ModelDefinition, cutoff: SystemTime) -> SweepReport {
        let mut report = SweepReport::default();
        let root = self.cache_root.join(&model.key);
        match tokio::fs::metadata(&root).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                warn!("{} is not a directory, skipping {}", root.display(), model.name);
                report.errors += 1;
                return report;
            }
            Err(e) if e.kind() == ErrorKind::NotFound => return report,
            Err(e) => {
                warn!("Failed to stat {}: {}", root.display(), e);
                report.errors += 1;
                return report;
            }
        }

        let mut extensions = vec![model.file_extension.clone()];
        if let Some(ext) = &self.placeholder_extension {
            extensions.push(ext.clone());
        }
        let scan = match tokio::task::spawn_blocking(move || {
            scan_model_dir(&root, &extensions, cutoff)
        })
        .await
        {
            Ok(scan) => scan,
            Err(e) => {
                error!("Directory walk for {} failed: {}", model.name, e);
                report.errors += 1;
                return report;
            }
        };
        report.errors += scan.errors;

        let handles: Vec<_> = scan
            .expired
            .into_iter()
            .map(|path| self.cleanup.delete(path))
            .collect();
        for handle in handles {
            match handle.wait().await {
                TaskOutcome::Completed => report.files_deleted += 1,
                _ => report.errors += 1,
            }
        }

        // Deepest first, so parents see their children gone
        for dir in &scan.dirs {
            if self.in_flight.has_destination_below(dir) {
                debug!("Keeping {}, download in flight", dir.display());
                continue;
            }
            if dir_is_empty(dir).await {
                match tokio::fs::remove_dir(dir).await {
                    Ok(()) => {
                        debug!("Pruned empty directory {}", dir.display());
                        report.dirs_pruned += 1;
                    }
                    Err(e) => debug!("Could not prune {}: {}", dir.display(), e),
                }
            }
        }
        report
    }
}

async fn dir_is_empty(dir: &Path) -> bool {
    match tokio::fs::read_dir(dir).await {
        Ok(mut entries) => matches!(entries.next_entry().await, Ok(None)),
        Err(_) => false,
    }
}

fn index_cutoff(now: DateTime<Utc>, hours: u64) -> DateTime<Utc> {
    i64::try_from(hours)
        .ok()
        .and_then(ChronoDuration::try_hours)
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use forecache_common::CheckSchedule;
    use forecache_common::config::QueueConfig;
    use std::fs::File;
    use tempfile::tempdir;

    fn model(key: &str, retention_hours: Option<u64>) -> ModelDefinition {
        ModelDefinition {
            key: key.to_string(),
            name: key.to_uppercase(),
            base_url: format!("http://localhost/{key}"),
            status_file: "/in-progress.json".to_string(),
            check_interval: CheckSchedule::from_millis(60_000),
            file_extension: ".om".to_string(),
            enabled: true,
            retention_hours,
            filesystem_retention_hours: None,
        }
    }

    fn write_aged(path: &Path, age: Duration) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let file = File::create(path).unwrap();
        file.set_modified(SystemTime::now() - age).unwrap();
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        cache: PathBuf,
        index: Arc<PathIndex>,
        stats: Arc<EngineStats>,
        in_flight: Arc<InFlight>,
        evictor: Evictor,
    }

    fn fixture(models: Vec<ModelDefinition>, filesystem_hours: Option<u64>) -> Fixture {
        let dir = tempdir().unwrap();
        let cache = dir.path().join("cache");
        let stats = Arc::new(EngineStats::new());
        let registry = Arc::new(ModelRegistry::from_models(models).unwrap());
        let cleanup = Arc::new(CleanupQueue::new(&QueueConfig::cleanup(), Arc::clone(&stats)));
        let index = Arc::new(
            PathIndex::open_for(dir.path().join("idx.redb"), &registry, cleanup.clone()).unwrap(),
        );
        let in_flight = Arc::new(InFlight::default());
        let evictor = Evictor::new(
            cache.clone(),
            registry,
            Arc::clone(&index),
            cleanup,
            Arc::clone(&stats),
            filesystem_hours,
            Some(".txt".to_string()),
        )
        .with_in_flight(Arc::clone(&in_flight));
        Fixture {
            _dir: dir,
            cache,
            index,
            stats,
            in_flight,
            evictor,
        }
    }

    #[tokio::test]
    async fn test_filesystem_pass_deletes_old_files_and_prunes() {
        let fx = fixture(vec![model("gfs", None)], Some(24));
        let old = fx.cache.join("gfs/2025/09/09/0000Z/2025-09-09T0100.om");
        let old_placeholder = fx.cache.join("gfs/2025/09/09/0000Z/2025-09-09T0200.txt");
        let fresh = fx.cache.join("gfs/2025/09/11/0000Z/2025-09-11T0100.om");
        let in_progress = fx.cache.join("gfs/2025/09/10/0000Z/2025-09-10T0100.om.tmp");
        write_aged(&old, Duration::from_secs(48 * 3600));
        write_aged(&old_placeholder, Duration::from_secs(48 * 3600));
        write_aged(&fresh, Duration::from_secs(60));
        write_aged(&in_progress, Duration::from_secs(48 * 3600));

        let report = fx.evictor.sweep().await;

        assert_eq!(report.files_deleted, 2);
        assert_eq!(report.errors, 0);
        assert!(!old.exists());
        assert!(!old_placeholder.exists());
        assert!(fresh.exists());
        assert!(in_progress.exists());
        // 0000Z, 09 emptied; 2025 and gfs still hold files
        assert!(!fx.cache.join("gfs/2025/09/09").exists());
        assert_eq!(report.dirs_pruned, 2);
        assert!(fx.cache.join("gfs").exists());
        assert_eq!(fx.stats.snapshot().files_deleted, 2);
        assert!(fx.stats.snapshot().last_cleanup.is_some());
    }

    #[tokio::test]
    async fn test_index_pass_uses_model_retention() {
        let fx = fixture(vec![model("gfs", Some(24)), model("icon", None)], None);
        let now = Utc::now();
        for hours_ago in [72, 48, 12, 1] {
            let key = forecache_common::path::format_index_key(now - ChronoDuration::hours(hours_ago));
            fx.index.set("gfs", &key, Path::new("/nowhere.om")).unwrap();
            fx.index.set("icon", &key, Path::new("/nowhere.om")).unwrap();
        }

        let report = fx.evictor.sweep_at(now).await;

        assert_eq!(report.keys_removed, 2);
        assert_eq!(fx.index.len("gfs").unwrap(), 2);
        // No retention configured: keys kept
        assert_eq!(fx.index.len("icon").unwrap(), 4);
        assert_eq!(fx.stats.snapshot().index_keys_expired, 2);
    }

    #[tokio::test]
    async fn test_model_filesystem_override() {
        let mut short = model("gfs", None);
        short.filesystem_retention_hours = Some(1);
        let fx = fixture(vec![short, model("icon", None)], Some(24));

        let gfs_file = fx.cache.join("gfs/2025/09/11/0000Z/2025-09-11T0100.om");
        let icon_file = fx.cache.join("icon/2025/09/11/0000Z/2025-09-11T0100.om");
        write_aged(&gfs_file, Duration::from_secs(3 * 3600));
        write_aged(&icon_file, Duration::from_secs(3 * 3600));

        let report = fx.evictor.sweep().await;
        assert_eq!(report.files_deleted, 1);
        assert!(!gfs_file.exists());
        assert!(icon_file.exists());
    }

    #[tokio::test]
    async fn test_missing_model_dir_is_not_an_error() {
        let fx = fixture(vec![model("gfs", Some(24))], Some(24));
        let report = fx.evictor.sweep().await;
        assert_eq!(report, SweepReport::default());
    }

    #[tokio::test]
    async fn test_directories_of_in_flight_downloads_are_kept() {
        let fx = fixture(vec![model("gfs", None)], Some(24));
        let run_dir = fx.cache.join("gfs/2025/09/11/0600Z");
        std::fs::create_dir_all(&run_dir).unwrap();
        std::fs::create_dir_all(fx.cache.join("gfs/2025/09/10/0000Z")).unwrap();
        fx.in_flight.insert(run_dir.join("2025-09-11T0700.om"));

        let report = fx.evictor.sweep().await;

        assert!(run_dir.exists());
        assert!(!fx.cache.join("gfs/2025/09/10").exists());
        assert_eq!(report.dirs_pruned, 2);
    }

    #[tokio::test]
    async fn test_broken_model_dir_does_not_stop_other_models() {
        let fx = fixture(vec![model("gfs", None), model("icon", None)], Some(24));
        // A plain file where the gfs directory belongs
        std::fs::create_dir_all(&fx.cache).unwrap();
        std::fs::write(fx.cache.join("gfs"), b"").unwrap();
        let icon_old = fx.cache.join("icon/2025/09/09/0000Z/2025-09-09T0100.om");
        write_aged(&icon_old, Duration::from_secs(48 * 3600));

        let report = fx.evictor.sweep().await;

        assert!(report.errors > 0);
        assert_eq!(report.files_deleted, 1);
        assert!(!icon_old.exists());
        assert!(fx.stats.snapshot().last_cleanup.is_some());
    }
}
