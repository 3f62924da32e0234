//! Checkpoint store trait definition.
//!
//! [`CheckpointStore`] is the storage contract behind the engine's
//! checkpoint sink and checkpoint source. Operators write one record per
//! persist round; the driver marks a round durable with
//! [`CheckpointStore::commit`] once every operator has recorded it.

use bytes::Bytes;
use sluice_types::checkpoint::{Checkpoint, CheckpointRecord};
use sluice_types::state::{OperatorIndex, PipelineId};

use crate::error;

/// Storage contract for operator checkpoints.
///
/// Implementations must be `Send + Sync` for use behind `Arc<dyn CheckpointStore>`.
/// Calls are blocking; async callers should run them on a blocking thread.
pub trait CheckpointStore: Send + Sync {
    /// Record one operator's state for a round.
    ///
    /// Writing the same (pipeline, operator, epoch) twice replaces the
    /// earlier state.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn put(&self, record: &CheckpointRecord) -> error::Result<()>;

    /// Mark a round as durable for the whole pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::StaleCommit`](crate::error::StateError::StaleCommit)
    /// when `checkpoint` is not newer than the last committed round, or
    /// another [`StateError`](crate::error::StateError) on storage failure.
    fn commit(&self, pipeline: &PipelineId, checkpoint: Checkpoint) -> error::Result<()>;

    /// Delete records of rounds newer than the last committed one.
    ///
    /// A run that died mid-round leaves such records behind; the next run
    /// reuses their epochs, so they must go before it records anything.
    /// Returns the number of records removed.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn discard_uncommitted(&self, pipeline: &PipelineId) -> error::Result<usize>;

    /// Newest state recorded by `operator` in a committed round.
    ///
    /// Returns `Ok(None)` when nothing was committed yet or the operator
    /// never recorded state (operators with empty state skip the write).
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn get(&self, pipeline: &PipelineId, operator: OperatorIndex) -> error::Result<Option<Bytes>>;

    /// Last round marked durable for `pipeline`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`](crate::error::StateError) on storage failure.
    fn last_committed(&self, pipeline: &PipelineId) -> error::Result<Option<Checkpoint>>;
}
