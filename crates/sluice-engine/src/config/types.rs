//! Serde model of a pipeline definition file.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default location of the `SQLite` checkpoint database.
pub const DEFAULT_STATE_PATH: &str = ".sluice/state.db";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub version: String,
    pub pipeline: String,
    #[serde(default)]
    pub settings: PipelineSettings,
    #[serde(default)]
    pub state: StateConfig,
    pub operators: Vec<OperatorConfig>,
}

/// Checkpoint loop settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Time between checkpoint rounds.
    #[serde(default = "default_checkpoint_interval_ms")]
    pub checkpoint_interval_ms: u64,
    /// Maximum rounds outstanding at once. `0` disables checkpointing.
    #[serde(default = "default_checkpoints_in_flight")]
    pub checkpoints_in_flight: u32,
}

fn default_checkpoint_interval_ms() -> u64 {
    1_000
}

fn default_checkpoints_in_flight() -> u32 {
    1
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            checkpoint_interval_ms: default_checkpoint_interval_ms(),
            checkpoints_in_flight: default_checkpoints_in_flight(),
        }
    }
}

impl PipelineSettings {
    /// Settings that never start a checkpoint round.
    #[must_use]
    pub fn without_checkpoints() -> Self {
        Self {
            checkpoints_in_flight: 0,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.checkpoint_interval_ms)
    }

    #[must_use]
    pub fn checkpoints_enabled(&self) -> bool {
        self.checkpoints_in_flight > 0 && self.checkpoint_interval_ms > 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateBackendKind {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default)]
    pub backend: StateBackendKind,
    pub connection: Option<String>,
}

impl StateConfig {
    /// Database path for the `SQLite` backend.
    #[must_use]
    pub fn connection_path(&self) -> &str {
        self.connection.as_deref().unwrap_or(DEFAULT_STATE_PATH)
    }
}

/// One chain position, selected by its `use` key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "use", rename_all = "snake_case")]
pub enum OperatorConfig {
    /// Source of sequential `Int64` rows.
    Generate {
        batches: u64,
        #[serde(default = "default_rows_per_batch")]
        rows_per_batch: usize,
        /// Minimum time between batches; pulls arriving earlier wait.
        #[serde(default)]
        pace_ms: Option<u64>,
    },
    /// Forward at most `count` rows.
    Head { count: u64 },
    /// Terminal sink.
    Collect {
        #[serde(default = "default_batch_rows")]
        batch_rows: usize,
        /// Hold push acknowledgements while this many rows await a commit.
        #[serde(default)]
        buffer_rows: Option<usize>,
    },
}

fn default_rows_per_batch() -> usize {
    1_024
}

fn default_batch_rows() -> usize {
    1_024
}

impl OperatorConfig {
    /// The `use` key.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Generate { .. } => "generate",
            Self::Head { .. } => "head",
            Self::Collect { .. } => "collect",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_minimal_pipeline() {
        let yaml = r#"
version: "1.0"
pipeline: gen_to_collect
operators:
  - use: generate
    batches: 3
  - use: collect
"#;
        let config: PipelineConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.pipeline, "gen_to_collect");
        assert_eq!(config.operators.len(), 2);
        assert_eq!(
            config.operators[0],
            OperatorConfig::Generate {
                batches: 3,
                rows_per_batch: 1_024,
                pace_ms: None,
            }
        );
        // Defaults applied
        assert_eq!(config.settings, PipelineSettings::default());
        assert_eq!(config.state.backend, StateBackendKind::Sqlite);
        assert_eq!(config.state.connection_path(), DEFAULT_STATE_PATH);
    }

    #[test]
    fn test_deserialize_full_pipeline() {
        let yaml = r#"
version: "1.0"
pipeline: full
settings:
  checkpoint_interval_ms: 250
  checkpoints_in_flight: 3
state:
  backend: memory
operators:
  - use: generate
    batches: 10
    rows_per_batch: 8
    pace_ms: 5
  - use: head
    count: 20
  - use: collect
    batch_rows: 4
    buffer_rows: 16
"#;
        let config: PipelineConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.settings.checkpoint_interval(), Duration::from_millis(250));
        assert_eq!(config.settings.checkpoints_in_flight, 3);
        assert_eq!(config.state.backend, StateBackendKind::Memory);
        assert_eq!(config.operators[1], OperatorConfig::Head { count: 20 });
        assert_eq!(config.operators[2].kind(), "collect");
    }

    #[test]
    fn test_unknown_operator_rejected() {
        let yaml = r#"
version: "1.0"
pipeline: p
operators:
  - use: teleport
"#;
        assert!(serde_yaml::from_str::<PipelineConfig>(yaml).is_err());
    }

    #[test]
    fn test_checkpoints_disabled_by_zero_in_flight() {
        assert!(PipelineSettings::default().checkpoints_enabled());
        assert!(!PipelineSettings::without_checkpoints().checkpoints_enabled());
        let zero_interval = PipelineSettings {
            checkpoint_interval_ms: 0,
            checkpoints_in_flight: 1,
        };
        assert!(!zero_interval.checkpoints_enabled());
    }
}
