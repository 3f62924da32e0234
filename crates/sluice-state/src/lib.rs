//! Checkpoint persistence for the sluice engine.
//!
//! Provides the [`CheckpointStore`] trait with a [`SqliteCheckpointStore`]
//! implementation for durable runs and a [`MemoryCheckpointStore`] for
//! tests and throwaway pipelines.

#![warn(clippy::pedantic)]

pub mod backend;
pub mod error;
pub mod memory;
pub mod sqlite;

pub use backend::CheckpointStore;
pub use error::StateError;
pub use memory::MemoryCheckpointStore;
pub use sqlite::SqliteCheckpointStore;

/// Common imports for benchmarks and downstream callers.
pub mod prelude {
    pub use crate::backend::CheckpointStore;
    pub use crate::error::StateError;
    pub use crate::memory::MemoryCheckpointStore;
    pub use crate::sqlite::SqliteCheckpointStore;
    pub use sluice_types::checkpoint::{Checkpoint, CheckpointRecord};
    pub use sluice_types::state::{OperatorIndex, PipelineId};
}
