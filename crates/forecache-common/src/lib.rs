//! Forecache Common - Shared types and utilities
//!
//! This crate provides the configuration model, the cache path layout,
//! error definitions and the statistics counters used across all
//! forecache components.

pub mod config;
pub mod error;
pub mod path;
pub mod schedule;
pub mod stats;

pub use config::{EngineConfig, ModelDefinition, ModelRegistry};
pub use error::{Error, Result};
pub use path::{CachePath, ParsedCachePath};
pub use schedule::CheckSchedule;
pub use stats::{EngineStats, StatsSnapshot};
