//! Shared sluice value types.
//!
//! Pure data types used by the state backends and the execution engine.
//! Kept in their own crate so both sides can share them without circular
//! dependencies.

pub mod checkpoint;
pub mod payload;
pub mod state;

pub use checkpoint::{Checkpoint, CheckpointRecord};
pub use payload::Payload;
pub use state::{OperatorIndex, PipelineId};
