//! Download submission and commit
//!
//! [`Ingestor`] decides whether a forecast file needs fetching, submits the
//! transfer to the download queue and, once the transfer succeeds, records
//! the file in the path index. Recording through `PathIndex::set` is the
//! only way a download becomes visible.

use crate::download::{DownloadError, Downloader};
use crate::queue::{Priority, QueueStatus, TaskQueue};
use forecache_common::{EngineStats, ModelDefinition};
use forecache_index::PathIndex;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What happened to a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// A transfer was queued
    Queued,
    /// The file is already on disk
    AlreadyCached,
    /// A transfer to the same destination is queued or running
    InFlight,
}

/// Destinations with a queued or running transfer
#[derive(Debug, Default)]
pub struct InFlight {
    paths: Mutex<HashSet<PathBuf>>,
}

impl InFlight {
    pub fn len(&self) -> usize {
        self.paths.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.lock().is_empty()
    }

    /// Whether any in-flight destination lies below `dir`
    pub fn has_destination_below(&self, dir: &Path) -> bool {
        self.paths.lock().iter().any(|path| path.starts_with(dir))
    }

    pub(crate) fn insert(&self, path: PathBuf) -> bool {
        self.paths.lock().insert(path)
    }
}

/// Releases an in-flight destination when the transfer ends or is dropped
struct InFlightGuard {
    in_flight: Arc<InFlight>,
    path: PathBuf,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.paths.lock().remove(&self.path);
    }
}

/// One transfer plus its index commit
struct DownloadJob {
    downloader: Arc<dyn Downloader>,
    index: Arc<PathIndex>,
    stats: Arc<EngineStats>,
    model_key: String,
    index_key: String,
    url: String,
    dest: PathBuf,
}

impl DownloadJob {
    async fn run(self) -> Result<(), DownloadError> {
        let bytes = match self.downloader.fetch(&self.url, &self.dest).await {
            Ok(bytes) => bytes,
            // Someone else committed it; nothing to index
            Err(DownloadError::AlreadyExists(path)) => {
                debug!("Skipping {}, already present", path.display());
                self.stats.record_skipped();
                return Ok(());
            }
            Err(e) => {
                self.record_failure(&e);
                return Err(e);
            }
        };
        self.stats.record_download();
        info!(
            "Downloaded {} for {} ({} bytes)",
            self.index_key, self.model_key, bytes
        );

        let stored = self.downloader.materialized_path(&self.dest);
        match self.index.set(&self.model_key, &self.index_key, &stored) {
            Ok(_) => {
                self.stats.record_index_update();
                Ok(())
            }
            Err(e) => {
                error!(
                    "Failed to index {} for {}: {}",
                    stored.display(),
                    self.model_key,
                    e
                );
                self.stats.record_index_error();
                Err(e.into())
            }
        }
    }

    fn record_failure(&self, e: &DownloadError) {
        match e {
            DownloadError::NotFound(url) => {
                warn!("File not found for {}: {}", self.model_key, url);
                self.stats.record_download_error();
            }
            DownloadError::Timeout(url) => {
                warn!("Download timed out for {}: {}", self.model_key, url);
                self.stats.record_timeout();
            }
            DownloadError::Oversize { limit, received } => {
                error!(
                    "Rejected {} for {}: {} bytes exceeds limit of {}",
                    self.url, self.model_key, received, limit
                );
                self.stats.record_oversize();
            }
            DownloadError::AlreadyExists(_) => self.stats.record_skipped(),
            DownloadError::Index(_) => self.stats.record_index_error(),
            DownloadError::Http(_) | DownloadError::Io(_) => {
                error!("Download failed for {} ({}): {}", self.model_key, self.url, e);
                self.stats.record_download_error();
            }
        }
    }
}

/// Submits transfers and commits them to the index
pub struct Ingestor {
    cache_root: PathBuf,
    downloader: Arc<dyn Downloader>,
    index: Arc<PathIndex>,
    queue: TaskQueue,
    stats: Arc<EngineStats>,
    in_flight: Arc<InFlight>,
}

impl Ingestor {
    pub fn new(
        cache_root: PathBuf,
        downloader: Arc<dyn Downloader>,
        index: Arc<PathIndex>,
        queue: TaskQueue,
        stats: Arc<EngineStats>,
    ) -> Self {
        Self {
            cache_root,
            downloader,
            index,
            queue,
            stats,
            in_flight: Arc::new(InFlight::default()),
        }
    }

    /// Local destination of a file given its path below the model directory
    pub fn destination(&self, model: &ModelDefinition, url_suffix: &str) -> PathBuf {
        self.cache_root.join(&model.key).join(url_suffix)
    }

    /// Whether the file for `dest` is on disk, in the form the downloader
    /// writes it
    pub async fn is_cached(&self, dest: &Path) -> bool {
        let path = self.downloader.materialized_path(dest);
        tokio::fs::try_exists(&path).await.unwrap_or(false)
    }

    /// Queue a transfer of `<base_url>/<url_suffix>` unless it is already
    /// cached or in flight
    pub async fn submit(
        &self,
        model: &ModelDefinition,
        url_suffix: &str,
        index_key: &str,
        priority: Priority,
    ) -> SubmitOutcome {
        let dest = self.destination(model, url_suffix);
        if self.is_cached(&dest).await {
            return SubmitOutcome::AlreadyCached;
        }
        if !self.in_flight.insert(dest.clone()) {
            return SubmitOutcome::InFlight;
        }

        let guard = InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
            path: dest.clone(),
        };
        let job = DownloadJob {
            downloader: Arc::clone(&self.downloader),
            index: Arc::clone(&self.index),
            stats: Arc::clone(&self.stats),
            model_key: model.key.clone(),
            index_key: index_key.to_string(),
            url: format!("{}/{}", model.base_url.trim_end_matches('/'), url_suffix),
            dest,
        };
        debug!(
            "Queueing {} for {} at priority {}",
            job.index_key, job.model_key, priority
        );
        let _handle = self.queue.enqueue(priority, async move {
            let _guard = guard;
            job.run().await
        });
        SubmitOutcome::Queued
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn status(&self) -> QueueStatus {
        self.queue.status()
    }

    /// Number of destinations queued or running
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// The shared set of in-flight destinations
    pub fn in_flight_set(&self) -> Arc<InFlight> {
        Arc::clone(&self.in_flight)
    }
}
