//! Checkpoint sinks.
//!
//! Snapshots are keyed by execution id and label. Saving under an existing
//! label replaces it; unlabelled saves go to [`DEFAULT_LABEL`].

mod memory;
mod sqlite;

pub use memory::MemoryCheckpointSink;
pub use sqlite::SqliteCheckpointSink;

/// Label used when a save carries none.
pub const DEFAULT_LABEL: &str = "latest";
