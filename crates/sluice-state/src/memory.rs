//! In-process implementation of [`CheckpointStore`].
//!
//! Nothing survives the process; useful for tests and for pipelines that
//! checkpoint only to exercise the commit protocol.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use bytes::Bytes;
use sluice_types::checkpoint::{Checkpoint, CheckpointRecord};
use sluice_types::state::{OperatorIndex, PipelineId};

use crate::backend::CheckpointStore;
use crate::error::{self, StateError};

#[derive(Default)]
struct PipelineSlot {
    committed: Option<Checkpoint>,
    records: BTreeMap<(Checkpoint, OperatorIndex), Bytes>,
}

/// Checkpoint store held in a mutex-guarded map.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    pipelines: Mutex<HashMap<PipelineId, PipelineSlot>>,
}

impl MemoryCheckpointStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> error::Result<MutexGuard<'_, HashMap<PipelineId, PipelineSlot>>> {
        self.pipelines.lock().map_err(|_| StateError::LockPoisoned)
    }

    /// Number of records currently held for `pipeline`, committed or not.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::LockPoisoned`] if the map lock was poisoned.
    pub fn record_count(&self, pipeline: &PipelineId) -> error::Result<usize> {
        Ok(self
            .lock()?
            .get(pipeline)
            .map_or(0, |slot| slot.records.len()))
    }

    /// Epochs that have at least one record for `pipeline`, ascending.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::LockPoisoned`] if the map lock was poisoned.
    pub fn recorded_epochs(&self, pipeline: &PipelineId) -> error::Result<Vec<u64>> {
        let guard = self.lock()?;
        let mut epochs: Vec<u64> = guard
            .get(pipeline)
            .map(|slot| slot.records.keys().map(|(cp, _)| cp.epoch()).collect())
            .unwrap_or_default();
        epochs.dedup();
        Ok(epochs)
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn put(&self, record: &CheckpointRecord) -> error::Result<()> {
        self.lock()?
            .entry(record.pipeline.clone())
            .or_default()
            .records
            .insert((record.checkpoint, record.operator), record.state.clone());
        Ok(())
    }

    fn commit(&self, pipeline: &PipelineId, checkpoint: Checkpoint) -> error::Result<()> {
        let mut guard = self.lock()?;
        let slot = guard.entry(pipeline.clone()).or_default();
        if let Some(committed) = slot.committed {
            if checkpoint <= committed {
                return Err(StateError::StaleCommit {
                    attempted: checkpoint.epoch(),
                    committed: committed.epoch(),
                });
            }
        }
        slot.committed = Some(checkpoint);
        slot.records.retain(|(cp, _), _| *cp >= checkpoint);
        Ok(())
    }

    fn discard_uncommitted(&self, pipeline: &PipelineId) -> error::Result<usize> {
        let mut guard = self.lock()?;
        let Some(slot) = guard.get_mut(pipeline) else {
            return Ok(0);
        };
        let before = slot.records.len();
        let committed = slot.committed;
        slot.records
            .retain(|(cp, _), _| committed.is_some_and(|last| *cp <= last));
        Ok(before - slot.records.len())
    }

    fn get(&self, pipeline: &PipelineId, operator: OperatorIndex) -> error::Result<Option<Bytes>> {
        let guard = self.lock()?;
        Ok(guard.get(pipeline).and_then(|slot| {
            slot.committed
                .and_then(|cp| slot.records.get(&(cp, operator)).cloned())
        }))
    }

    fn last_committed(&self, pipeline: &PipelineId) -> error::Result<Option<Checkpoint>> {
        Ok(self.lock()?.get(pipeline).and_then(|slot| slot.committed))
    }
}
