//! Engine facade
//!
//! [`Engine`] wires the path index, both queues, the downloader, the status
//! checker, the evictor and the scheduler together, and exposes the
//! operations the binary and any control plane use.

use crate::cleanup::CleanupQueue;
use crate::download::{Downloader, HttpDownloader, SimulatedDownloader};
use crate::evictor::{Evictor, SweepReport};
use crate::ingest::{Ingestor, SubmitOutcome};
use crate::queue::{Priority, QueueStatus, TaskQueue};
use crate::scheduler::{Scheduler, TriggerJob};
use crate::status::{CheckReport, StatusChecker};
use forecache_common::{
    EngineConfig, EngineStats, Error, ModelRegistry, ParsedCachePath, Result, StatsSnapshot,
};
use forecache_index::{PathIndex, RebuildReport};
use futures::FutureExt;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};

/// File written and removed by the startup write probe
pub const PROBE_FILE: &str = ".forecache-probe";

/// Trigger name of the retention sweep
const RETENTION_TRIGGER: &str = "retention";

/// How downloads are performed; fixed for the life of the engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Mode {
    /// Real HTTP transfers
    #[default]
    Live,
    /// Empty placeholder files, no network
    Simulated,
}

/// Gauges and counters of both queues
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueInfo {
    pub download: QueueStatus,
    pub cleanup: QueueStatus,
    /// Destinations queued or being downloaded
    pub in_flight: usize,
}

/// Ingestion and cache engine
pub struct Engine {
    config: EngineConfig,
    registry: Arc<ModelRegistry>,
    mode: Mode,
    cache_root: PathBuf,
    stats: Arc<EngineStats>,
    index: Arc<PathIndex>,
    cleanup: Arc<CleanupQueue>,
    ingestor: Arc<Ingestor>,
    checker: Arc<StatusChecker>,
    evictor: Arc<Evictor>,
    scheduler: Scheduler,
    started: AtomicBool,
}

impl Engine {
    /// Build the engine and open the path index.
    ///
    /// Must be called from within a tokio runtime. Fails with a startup
    /// error when the index cannot be opened, including when another
    /// process holds it.
    pub fn open(config: EngineConfig, registry: ModelRegistry, mode: Mode) -> Result<Self> {
        let cache_root = std::path::absolute(&config.storage.cache_dir).map_err(|e| {
            Error::startup(format!(
                "invalid cache directory {}: {e}",
                config.storage.cache_dir.display()
            ))
        })?;
        let registry = Arc::new(registry);
        let stats = Arc::new(EngineStats::new());

        let cleanup = Arc::new(CleanupQueue::new(&config.cleanup_queue, Arc::clone(&stats)));
        let index = PathIndex::open_for(&config.index.path, &registry, cleanup.clone())
            .map_err(|e| {
                Error::startup(format!(
                    "cannot open path index at {}: {e}",
                    config.index.path.display()
                ))
            })?;
        let index = Arc::new(index);

        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::startup(format!("cannot build HTTP client: {e}")))?;

        let downloader: Arc<dyn Downloader> = match mode {
            Mode::Live => Arc::new(HttpDownloader::new(
                client.clone(),
                config.storage.max_file_size,
            )),
            Mode::Simulated => Arc::new(SimulatedDownloader::new(
                config.simulation.placeholder_extension.clone(),
                config.simulation.delay(),
            )),
        };

        let ingestor = Arc::new(Ingestor::new(
            cache_root.clone(),
            downloader,
            Arc::clone(&index),
            TaskQueue::new("download", &config.download_queue, Arc::clone(&stats)),
            Arc::clone(&stats),
        ));
        let checker = Arc::new(StatusChecker::new(
            client,
            config.status.clone(),
            Arc::clone(&ingestor),
            Arc::clone(&stats),
        ));
        let placeholder = (mode == Mode::Simulated)
            .then(|| config.simulation.placeholder_extension.clone());
        let evictor = Arc::new(Evictor::new(
            cache_root.clone(),
            Arc::clone(&registry),
            Arc::clone(&index),
            Arc::clone(&cleanup),
            Arc::clone(&stats),
            config.retention.filesystem_hours,
            placeholder,
        )
        .with_in_flight(ingestor.in_flight_set()));

        Ok(Self {
            config,
            registry,
            mode,
            cache_root,
            stats,
            index,
            cleanup,
            ingestor,
            checker,
            evictor,
            scheduler: Scheduler::new(),
            started: AtomicBool::new(false),
        })
    }

    /// Prepare the cache directory and start every trigger
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::startup("engine already started"));
        }
        info!(
            "Starting forecache engine ({:?} mode) with {} models",
            self.mode,
            self.registry.len()
        );

        tokio::fs::create_dir_all(&self.cache_root)
            .await
            .map_err(|e| {
                Error::startup(format!(
                    "cannot create cache directory {}: {e}",
                    self.cache_root.display()
                ))
            })?;
        probe_cache_dir(&self.cache_root).await?;

        if self.config.index.rebuild_on_start {
            self.rebuild_index().await?;
        }

        for model in self.registry.enabled() {
            let checker = Arc::clone(&self.checker);
            let model = model.clone();
            let name = model.key.clone();
            let schedule = model.check_interval.clone();
            let job: TriggerJob = Arc::new(move || {
                let checker = Arc::clone(&checker);
                let model = model.clone();
                async move {
                    checker.check(&model).await;
                }
                .boxed()
            });
            self.schedule(&name, &schedule, job);
        }

        let evictor = Arc::clone(&self.evictor);
        let job: TriggerJob = Arc::new(move || {
            let evictor = Arc::clone(&evictor);
            async move {
                evictor.sweep().await;
            }
            .boxed()
        });
        self.schedule(
            RETENTION_TRIGGER,
            &self.config.retention.cleanup_schedule,
            job,
        );

        info!(
            "Engine started, {} triggers scheduled",
            self.scheduler.trigger_count()
        );
        Ok(())
    }

    fn schedule(
        &self,
        name: &str,
        schedule: &forecache_common::CheckSchedule,
        job: TriggerJob,
    ) {
        let result = schedule
            .to_cron_expression(name)
            .and_then(|expr| self.scheduler.add_trigger(name, &expr, job));
        if let Err(e) = result {
            error!("Not scheduling {}: {}", name, e);
            self.stats.record_config_error();
        }
    }

    /// Cancel triggers, then wait for both queues to drain.
    ///
    /// In-flight downloads and deletions are never cancelled.
    pub async fn stop(&self) {
        info!("Stopping forecache engine");
        self.scheduler.stop().await;

        let download = self.ingestor.queue();
        let cleanup = self.cleanup.queue();
        download.resume();
        cleanup.resume();
        info!(
            "Waiting for queues: {} downloads, {} deletions outstanding",
            download.size() + download.pending(),
            cleanup.size() + cleanup.pending()
        );
        // Downloads may supersede files and feed the cleanup queue
        download.drain().await;
        cleanup.drain().await;
        info!("Forecache engine stopped");
    }

    /// Run one status check for `model_key` now
    pub async fn check_now(&self, model_key: &str) -> Result<CheckReport> {
        let model = self.registry.require(model_key)?;
        Ok(self.checker.check(model).await)
    }

    /// Run one retention sweep now
    pub async fn cleanup_now(&self) -> SweepReport {
        self.evictor.sweep().await
    }

    /// Queue one file by its path relative to the cache root
    /// (`model/YYYY/MM/DD/HH00Z/forecast.ext`) at `priority`
    pub async fn download_with_priority(
        &self,
        relative_path: &str,
        priority: Priority,
    ) -> Result<SubmitOutcome> {
        let parsed = ParsedCachePath::parse(relative_path)?;
        let model = self.registry.require(&parsed.model_key)?;
        if !parsed.has_extension(&model.file_extension) {
            return Err(Error::InvalidPath {
                path: relative_path.to_string(),
                reason: format!("expected extension {}", model.file_extension),
            });
        }

        let outcome = self
            .ingestor
            .submit(model, &parsed.url_suffix(), &parsed.index_key, priority)
            .await;
        match outcome {
            SubmitOutcome::Queued => {
                self.stats.record_queued();
                info!("Queued {} at priority {}", parsed.relative(), priority);
            }
            SubmitOutcome::AlreadyCached => {
                self.stats.record_skipped();
                debug!("{} already cached", parsed.relative());
            }
            SubmitOutcome::InFlight => debug!("{} already in flight", parsed.relative()),
        }
        Ok(outcome)
    }

    /// Re-index files already on disk
    pub async fn rebuild_index(&self) -> Result<RebuildReport> {
        let index = Arc::clone(&self.index);
        let registry = Arc::clone(&self.registry);
        let root = self.cache_root.clone();
        let placeholder = (self.mode == Mode::Simulated)
            .then(|| self.config.simulation.placeholder_extension.clone());

        let report = tokio::task::spawn_blocking(move || {
            index.rebuild(&root, &registry, placeholder.as_deref())
        })
        .await
        .map_err(|e| Error::index(format!("index rebuild aborted: {e}")))?;

        if report.errors > 0 {
            warn!("Index rebuild finished with {} failed models", report.errors);
            for _ in 0..report.errors {
                self.stats.record_index_error();
            }
        }
        Ok(report)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn queue_info(&self) -> QueueInfo {
        QueueInfo {
            download: self.ingestor.status(),
            cleanup: self.cleanup.status(),
            in_flight: self.ingestor.in_flight(),
        }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn index(&self) -> &PathIndex {
        &self.index
    }

    pub const fn mode(&self) -> Mode {
        self.mode
    }

    /// Absolute cache root
    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }
}

/// Write, read back and delete a probe file
async fn probe_cache_dir(root: &Path) -> Result<()> {
    let probe = root.join(PROBE_FILE);
    let content = format!("forecache probe {}", chrono::Utc::now().to_rfc3339());

    let result = async {
        tokio::fs::write(&probe, &content).await?;
        let read_back = tokio::fs::read_to_string(&probe).await?;
        if read_back != content {
            return Err(std::io::Error::other("read content does not match"));
        }
        tokio::fs::remove_file(&probe).await
    }
    .await;

    match result {
        Ok(()) => {
            debug!("Cache directory {} is writable", root.display());
            Ok(())
        }
        Err(e) => {
            if let Err(cleanup) = tokio::fs::remove_file(&probe).await
                && cleanup.kind() != std::io::ErrorKind::NotFound
            {
                warn!("Could not remove probe file {}: {}", probe.display(), cleanup);
            }
            Err(Error::startup(format!(
                "cache directory {} failed write probe: {e}",
                root.display()
            )))
        }
    }
}
