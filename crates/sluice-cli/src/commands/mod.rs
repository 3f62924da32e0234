pub mod check;
pub mod run;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use sluice_engine::config::{parser, validator, PipelineConfig, StateBackendKind, StateConfig};
use sluice_state::{CheckpointStore, MemoryCheckpointStore, SqliteCheckpointStore};

/// Parse and validate the pipeline file at `path`.
pub(crate) fn load_pipeline(path: &Path) -> Result<PipelineConfig> {
    let config = parser::parse_pipeline(path)
        .with_context(|| format!("Failed to parse pipeline: {}", path.display()))?;
    validator::validate_pipeline(&config)?;
    Ok(config)
}

/// Open the checkpoint store the pipeline's `state` section names.
pub(crate) fn open_store(state: &StateConfig) -> Result<Arc<dyn CheckpointStore>> {
    match state.backend {
        StateBackendKind::Sqlite => {
            let path = Path::new(state.connection_path());
            let store = SqliteCheckpointStore::open(path).with_context(|| {
                format!("Failed to open checkpoint store: {}", path.display())
            })?;
            Ok(Arc::new(store))
        }
        StateBackendKind::Memory => Ok(Arc::new(MemoryCheckpointStore::new())),
    }
}
