//! Forecast file transfer
//!
//! A [`Downloader`] moves one remote file to one local destination. The
//! implementation is chosen once when the engine is built: [`HttpDownloader`]
//! for real transfers, [`SimulatedDownloader`] for dry runs that only write
//! placeholders.
//!
//! Real transfers stream into `<dest>.tmp` and are committed with a
//! no-clobber link, so `<dest>` is either absent or complete.

use async_trait::async_trait;
use forecache_index::IndexError;
use reqwest::StatusCode;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Suffix of in-progress transfers
pub const TEMP_SUFFIX: &str = ".tmp";

/// Error type for a single download
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("timed out fetching {0}")]
    Timeout(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("file exceeds size limit: received {received} bytes, limit {limit}")]
    Oversize { limit: u64, received: u64 },

    #[error("destination already exists: {}", .0.display())]
    AlreadyExists(PathBuf),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("index error: {0}")]
    Index(#[from] IndexError),
}

impl DownloadError {
    /// Map a client error, separating timeouts and 404s
    pub fn from_reqwest(url: &str, e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(url.to_string())
        } else if e.status() == Some(StatusCode::NOT_FOUND) {
            Self::NotFound(url.to_string())
        } else {
            Self::Http(e)
        }
    }
}

/// Path of the in-progress file for `dest`
#[must_use]
pub fn temp_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(TEMP_SUFFIX);
    PathBuf::from(name)
}

/// Moves one remote file to one local destination
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Extension written instead of the model's own, if any
    fn placeholder_extension(&self) -> Option<&str> {
        None
    }

    /// Where a transfer to `dest` actually lands on disk
    fn materialized_path(&self, dest: &Path) -> PathBuf {
        match self.placeholder_extension() {
            Some(ext) => dest.with_extension(ext.trim_start_matches('.')),
            None => dest.to_path_buf(),
        }
    }

    /// Fetch `url` into `dest`, returning the number of bytes written
    async fn fetch(&self, url: &str, dest: &Path) -> Result<u64, DownloadError>;
}

/// Removes the temp file when dropped, including on cancellation
struct TempFileGuard {
    path: PathBuf,
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed temp file {}", self.path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove temp file {}: {}", self.path.display(), e),
        }
    }
}

/// Streams forecast files over HTTP
pub struct HttpDownloader {
    client: reqwest::Client,
    max_file_size: u64,
}

impl HttpDownloader {
    pub const fn new(client: reqwest::Client, max_file_size: u64) -> Self {
        Self {
            client,
            max_file_size,
        }
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<u64, DownloadError> {
        if tokio::fs::try_exists(dest).await? {
            return Err(DownloadError::AlreadyExists(dest.to_path_buf()));
        }

        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| DownloadError::from_reqwest(url, e))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(DownloadError::NotFound(url.to_string()));
        }
        response = response
            .error_for_status()
            .map_err(|e| DownloadError::from_reqwest(url, e))?;

        if let Some(length) = response.content_length()
            && length > self.max_file_size
        {
            return Err(DownloadError::Oversize {
                limit: self.max_file_size,
                received: length,
            });
        }

        let tmp = temp_path(dest);
        let _guard = TempFileGuard { path: tmp.clone() };
        let mut file = create_temp_file(&tmp).await?;

        let mut received: u64 = 0;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| DownloadError::from_reqwest(url, e))?
        {
            received += u64::try_from(chunk.len()).unwrap_or(u64::MAX);
            if received > self.max_file_size {
                return Err(DownloadError::Oversize {
                    limit: self.max_file_size,
                    received,
                });
            }
            file.write_all(&chunk).await?;
        }
        file.sync_all().await?;
        drop(file);

        // No-clobber commit: linking fails if dest appeared meanwhile
        match tokio::fs::hard_link(&tmp, dest).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(DownloadError::AlreadyExists(dest.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        }

        debug!("Committed {} ({} bytes)", dest.display(), received);
        Ok(received)
    }
}

/// Create `tmp` and its directory. The directory is created only once the
/// response is in hand, and again if a sweep pruned it in between.
async fn create_temp_file(tmp: &Path) -> std::io::Result<tokio::fs::File> {
    let Some(parent) = tmp.parent() else {
        return tokio::fs::File::create(tmp).await;
    };
    tokio::fs::create_dir_all(parent).await?;
    match tokio::fs::File::create(tmp).await {
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!("Directory {} vanished, recreating", parent.display());
            tokio::fs::create_dir_all(parent).await?;
            tokio::fs::File::create(tmp).await
        }
        result => result,
    }
}

/// Writes empty placeholder files instead of transferring anything
pub struct SimulatedDownloader {
    placeholder_extension: String,
    delay: Duration,
}

impl SimulatedDownloader {
    pub fn new(placeholder_extension: impl Into<String>, delay: Duration) -> Self {
        Self {
            placeholder_extension: placeholder_extension.into(),
            delay,
        }
    }
}

#[async_trait]
impl Downloader for SimulatedDownloader {
    fn placeholder_extension(&self) -> Option<&str> {
        Some(&self.placeholder_extension)
    }

    async fn fetch(&self, url: &str, dest: &Path) -> Result<u64, DownloadError> {
        let path = self.materialized_path(dest);
        debug!("Simulating download of {} to {}", url, path.display());
        tokio::time::sleep(self.delay).await;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(_) => Ok(0),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                Err(DownloadError::AlreadyExists(path))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::StatusCode as HttpStatus;
    use axum::routing::get;
    use futures::StreamExt;
    use tempfile::tempdir;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn data_router() -> Router {
        Router::new()
            .route("/small.om", get(|| async { vec![7u8; 1024] }))
            .route("/large.om", get(|| async { vec![7u8; 64 * 1024] }))
            .route("/missing.om", get(|| async { HttpStatus::NOT_FOUND }))
            .route("/broken.om", get(|| async { HttpStatus::INTERNAL_SERVER_ERROR }))
    }

    #[test]
    fn test_temp_path() {
        assert_eq!(
            temp_path(Path::new("/c/gfs/2025-09-11T0700.om")),
            PathBuf::from("/c/gfs/2025-09-11T0700.om.tmp")
        );
    }

    #[tokio::test]
    async fn test_http_commit() {
        let base = serve(data_router()).await;
        let dir = tempdir().unwrap();
        let dest = dir.path().join("gfs/2025/09/11/0000Z/2025-09-11T0100.om");
        let downloader = HttpDownloader::new(reqwest::Client::new(), 4096);

        let bytes = downloader
            .fetch(&format!("{base}/small.om"), &dest)
            .await
            .unwrap();
        assert_eq!(bytes, 1024);
        assert_eq!(std::fs::metadata(&dest).unwrap().len(), 1024);
        assert!(!temp_path(&dest).exists());
    }

    #[tokio::test]
    async fn test_http_oversize_leaves_nothing() {
        let base = serve(data_router()).await;
        let dir = tempdir().unwrap();
        let dest = dir.path().join("2025-09-11T0100.om");
        let downloader = HttpDownloader::new(reqwest::Client::new(), 4096);

        let err = downloader
            .fetch(&format!("{base}/large.om"), &dest)
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Oversize { limit: 4096, .. }));
        assert!(!dest.exists());
        assert!(!temp_path(&dest).exists());
    }

    #[tokio::test]
    async fn test_http_not_found() {
        let base = serve(data_router()).await;
        let dir = tempdir().unwrap();
        let dest = dir.path().join("2025-09-11T0100.om");
        let downloader = HttpDownloader::new(reqwest::Client::new(), 4096);

        let err = downloader
            .fetch(&format!("{base}/missing.om"), &dest)
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::NotFound(_)));

        let err = downloader
            .fetch(&format!("{base}/broken.om"), &dest)
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Http(_)));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_http_no_clobber() {
        let base = serve(data_router()).await;
        let dir = tempdir().unwrap();
        let dest = dir.path().join("2025-09-11T0100.om");
        std::fs::write(&dest, b"existing").unwrap();
        let downloader = HttpDownloader::new(reqwest::Client::new(), 4096);

        let err = downloader
            .fetch(&format!("{base}/small.om"), &dest)
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::AlreadyExists(_)));
        assert_eq!(std::fs::read(&dest).unwrap(), b"existing");
    }

    #[tokio::test]
    async fn test_cancelled_transfer_removes_temp() {
        // First chunk arrives, the rest stalls
        let router = Router::new().route(
            "/slow.om",
            get(|| async {
                let first = futures::stream::once(async { Ok::<_, std::io::Error>(vec![0u8; 16]) });
                let stall = futures::stream::once(async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok::<_, std::io::Error>(vec![0u8; 16])
                });
                axum::body::Body::from_stream(first.chain(stall))
            }),
        );
        let base = serve(router).await;
        let dir = tempdir().unwrap();
        let dest = dir.path().join("2025-09-11T0100.om");
        let downloader = HttpDownloader::new(reqwest::Client::new(), 4096);

        let result = tokio::time::timeout(
            Duration::from_millis(100),
            downloader.fetch(&format!("{base}/slow.om"), &dest),
        )
        .await;
        assert!(result.is_err());
        assert!(!dest.exists());
        assert!(!temp_path(&dest).exists());
    }

    #[tokio::test]
    async fn test_directory_removed_while_waiting_for_response() {
        let router = Router::new().route(
            "/delayed.om",
            get(|| async {
                tokio::time::sleep(Duration::from_millis(300)).await;
                vec![3u8; 256]
            }),
        );
        let base = serve(router).await;
        let dir = tempdir().unwrap();
        let run_dir = dir.path().join("gfs/2025/09/11/0600Z");
        std::fs::create_dir_all(&run_dir).unwrap();
        let dest = run_dir.join("2025-09-11T0700.om");

        let fetch = tokio::spawn({
            let dest = dest.clone();
            async move {
                HttpDownloader::new(reqwest::Client::new(), 4096)
                    .fetch(&format!("{base}/delayed.om"), &dest)
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        std::fs::remove_dir_all(dir.path().join("gfs")).unwrap();

        assert_eq!(fetch.await.unwrap().unwrap(), 256);
        assert_eq!(std::fs::metadata(&dest).unwrap().len(), 256);
    }

    #[tokio::test]
    async fn test_simulated_placeholder() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("gfs/2025/09/11/0000Z/2025-09-11T0100.om");
        let downloader = SimulatedDownloader::new(".txt", Duration::from_millis(1));

        let placeholder = downloader.materialized_path(&dest);
        assert_eq!(placeholder, dest.with_extension("txt"));

        assert_eq!(downloader.fetch("http://unused", &dest).await.unwrap(), 0);
        assert_eq!(std::fs::metadata(&placeholder).unwrap().len(), 0);
        assert!(!dest.exists());

        assert!(matches!(
            downloader.fetch("http://unused", &dest).await,
            Err(DownloadError::AlreadyExists(_))
        ));
    }
}
