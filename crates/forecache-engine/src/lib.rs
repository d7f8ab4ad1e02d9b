//! Forecache Engine
//!
//! Ingestion and cache engine: per-model status polling, a priority download
//! queue with atomic-commit transfers, index commit and supersede, and the
//! retention sweep.
//!
//! # Architecture
//!
//! ```text
//! Scheduler ──► StatusChecker ──► Ingestor ──► download TaskQueue ──► Downloader
//!     │                                                 │
//!     │                                                 ▼
//!     └──────► Evictor ──► PathIndex ◄───────── PathIndex::set
//!                 │             │ (supersede)
//!                 ▼             ▼
//!              CleanupQueue ◄───┘
//! ```

pub mod cleanup;
pub mod download;
pub mod engine;
pub mod evictor;
pub mod ingest;
pub mod queue;
pub mod ratelimit;
pub mod scheduler;
pub mod status;

pub use cleanup::CleanupQueue;
pub use download::{DownloadError, Downloader, HttpDownloader, SimulatedDownloader};
pub use engine::{Engine, Mode, QueueInfo};
pub use evictor::{Evictor, SweepReport};
pub use ingest::{InFlight, Ingestor, SubmitOutcome};
pub use queue::{DEFAULT_PRIORITY, Priority, QueueStatus, TaskHandle, TaskOutcome, TaskQueue};
pub use scheduler::Scheduler;
pub use status::{CheckReport, StatusChecker, StatusDocument};
