//! Cleanup queue: the single path for file deletions
//!
//! Both supersede removals from the path index and retention deletions from
//! the evictor are submitted here, so deletions share one bounded,
//! rate-limited pool.

use crate::queue::{DEFAULT_PRIORITY, QueueStatus, TaskHandle, TaskQueue};
use forecache_common::EngineStats;
use forecache_common::config::QueueConfig;
use forecache_index::RemovalSink;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

/// Deletion queue shared by the index and the evictor
pub struct CleanupQueue {
    queue: TaskQueue,
    stats: Arc<EngineStats>,
}

impl CleanupQueue {
    pub fn new(config: &QueueConfig, stats: Arc<EngineStats>) -> Self {
        Self {
            queue: TaskQueue::new("cleanup", config, Arc::clone(&stats)),
            stats,
        }
    }

    /// Queue deletion of one file. A missing file counts as done.
    pub fn delete(&self, path: PathBuf) -> TaskHandle {
        let stats = Arc::clone(&self.stats);
        self.queue.enqueue(DEFAULT_PRIORITY, async move {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    debug!("Deleted {}", path.display());
                    stats.record_deleted();
                    Ok(())
                }
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => {
                    warn!("Failed to delete {}: {}", path.display(), e);
                    Err(e)
                }
            }
        })
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn status(&self) -> QueueStatus {
        self.queue.status()
    }
}

impl RemovalSink for CleanupQueue {
    fn remove(&self, path: PathBuf) {
        drop(self.delete(path));
    }
}
