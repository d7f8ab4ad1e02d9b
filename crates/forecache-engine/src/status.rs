//! Status document polling
//!
//! Each model publishes a small JSON document listing the valid times of its
//! latest run. A check fetches it, resolves every valid time to a cache path
//! and queues whatever is not on disk yet. Checks never fail: every problem
//! is logged and counted.

use crate::ingest::{Ingestor, SubmitOutcome};
use crate::queue::DEFAULT_PRIORITY;
use forecache_common::config::StatusConfig;
use forecache_common::{CachePath, EngineStats, ModelDefinition};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Remote status document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusDocument {
    #[serde(default)]
    pub completed: bool,
    pub reference_time: String,
    #[serde(default)]
    pub valid_times: Vec<String>,
}

/// Outcome of one check
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CheckReport {
    /// Valid times evaluated
    pub checked: u64,
    /// Downloads queued
    pub queued: u64,
    /// Valid times already cached or in flight
    pub skipped: u64,
}

#[derive(Debug, thiserror::Error)]
enum StatusError {
    #[error("status document not found")]
    NotFound,
    #[error("status fetch timed out")]
    Timeout,
    #[error("{0}")]
    Http(#[from] reqwest::Error),
}

impl StatusError {
    fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else {
            Self::Http(e)
        }
    }
}

/// Polls status documents and feeds the download queue
pub struct StatusChecker {
    client: reqwest::Client,
    config: StatusConfig,
    ingestor: Arc<Ingestor>,
    stats: Arc<EngineStats>,
}

impl StatusChecker {
    pub const fn new(
        client: reqwest::Client,
        config: StatusConfig,
        ingestor: Arc<Ingestor>,
        stats: Arc<EngineStats>,
    ) -> Self {
        Self {
            client,
            config,
            ingestor,
            stats,
        }
    }

    async fn fetch(&self, url: &str) -> Result<StatusDocument, StatusError> {
        let response = self
            .client
            .get(url)
            .timeout(self.config.timeout())
            .send()
            .await
            .map_err(StatusError::from_reqwest)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(StatusError::NotFound);
        }
        response
            .error_for_status()
            .map_err(StatusError::from_reqwest)?
            .json::<StatusDocument>()
            .await
            .map_err(StatusError::from_reqwest)
    }

    /// Run one check for `model`
    pub async fn check(&self, model: &ModelDefinition) -> CheckReport {
        let url = model.status_url();
        debug!("Checking status for {} at {}", model.name, url);

        let document = match self.fetch(&url).await {
            Ok(document) => document,
            Err(StatusError::NotFound) => {
                warn!("Status file not found for {}: {}", model.name, url);
                return CheckReport::default();
            }
            Err(StatusError::Timeout) => {
                error!("Timed out fetching status for {}", model.name);
                self.stats.record_status_error();
                return CheckReport::default();
            }
            Err(e) => {
                error!("Failed to check status for {}: {}", model.name, e);
                self.stats.record_status_error();
                return CheckReport::default();
            }
        };

        if self.config.require_completed && !document.completed {
            info!("Run {} of {} is not completed yet", document.reference_time, model.name);
            return CheckReport::default();
        }

        let mut report = CheckReport::default();
        for valid_time in &document.valid_times {
            let path = match CachePath::resolve(
                &model.key,
                &document.reference_time,
                valid_time,
                &model.file_extension,
            ) {
                Ok(path) => path,
                Err(e) => {
                    warn!("Skipping valid time for {}: {}", model.name, e);
                    self.stats.record_status_error();
                    continue;
                }
            };

            report.checked += 1;
            match self
                .ingestor
                .submit(model, path.url_suffix(), path.index_key(), DEFAULT_PRIORITY)
                .await
            {
                SubmitOutcome::Queued => report.queued += 1,
                SubmitOutcome::AlreadyCached | SubmitOutcome::InFlight => report.skipped += 1,
            }
        }

        self.stats
            .record_check(report.checked, report.queued, report.skipped);
        info!(
            "Checked {}: {} valid times, {} queued, {} skipped",
            model.name, report.checked, report.queued, report.skipped
        );
        report
    }
}
