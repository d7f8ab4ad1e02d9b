//! Where superseded files go.
//!
//! The index never deletes files itself. When a `set` replaces a path that
//! still exists on disk, the old path is handed to a [`RemovalSink`]; the
//! engine routes it through its cleanup queue.

use std::path::PathBuf;
use tracing::{debug, warn};

/// Receives files that are no longer referenced by the index
pub trait RemovalSink: Send + Sync {
    /// Schedule `path` for deletion. Must not block on the deletion.
    fn remove(&self, path: PathBuf);
}

/// Deletes synchronously on the caller's thread
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectRemoval;

impl RemovalSink for DirectRemoval {
    fn remove(&self, path: PathBuf) {
        match std::fs::remove_file(&path) {
            Ok(()) => debug!("Removed superseded file {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
        }
    }
}
