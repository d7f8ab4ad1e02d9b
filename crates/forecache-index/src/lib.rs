//! Forecache Path Index
//!
//! Durable, ordered mapping from forecast time to the cached file that
//! currently holds it, one redb table per model.

pub mod removal;
pub mod store;

// Re-exports
pub use removal::{DirectRemoval, RemovalSink};
pub use store::{IndexError, IndexResult, PathIndex, RebuildReport, SetOutcome};
