//! Semantic validation for parsed pipeline configuration values.

use anyhow::{bail, Result};

use crate::config::types::{OperatorConfig, PipelineConfig, StateBackendKind};

/// Validate a parsed pipeline configuration.
/// Returns `Ok(())` if valid, Err with all validation errors if not.
///
/// # Errors
///
/// Returns an error listing all validation failures found in the pipeline config.
pub fn validate_pipeline(config: &PipelineConfig) -> Result<()> {
    let mut errors = Vec::new();

    if config.version != "1.0" {
        errors.push(format!(
            "Unsupported pipeline version '{}', expected '1.0'",
            config.version
        ));
    }

    if config.pipeline.trim().is_empty() {
        errors.push("Pipeline name must not be empty".to_string());
    }

    if config.operators.is_empty() {
        errors.push("Pipeline must define at least one operator".to_string());
    }

    let last = config.operators.len().saturating_sub(1);
    for (i, operator) in config.operators.iter().enumerate() {
        match operator {
            OperatorConfig::Generate { rows_per_batch, .. } => {
                if i != 0 {
                    errors.push(format!(
                        "operators[{i}]: 'generate' is a source and must come first"
                    ));
                }
                if *rows_per_batch == 0 {
                    errors.push(format!("operators[{i}]: rows_per_batch must be at least 1"));
                }
            }
            OperatorConfig::Head { .. } => {}
            OperatorConfig::Collect {
                batch_rows,
                buffer_rows,
            } => {
                if i != last {
                    errors.push(format!(
                        "operators[{i}]: 'collect' is a sink and must come last"
                    ));
                }
                if *batch_rows == 0 {
                    errors.push(format!("operators[{i}]: batch_rows must be at least 1"));
                }
                if *buffer_rows == Some(0) {
                    errors.push(format!("operators[{i}]: buffer_rows must be at least 1"));
                }
                if buffer_rows.is_some() && !config.settings.checkpoints_enabled() {
                    errors.push(format!(
                        "operators[{i}]: buffer_rows releases on commit and needs checkpoints enabled"
                    ));
                }
            }
        }
    }

    if config.settings.checkpoints_in_flight > 0 && config.settings.checkpoint_interval_ms == 0 {
        errors.push("checkpoint_interval_ms must be > 0 when checkpoints are enabled".to_string());
    }

    if config.state.backend == StateBackendKind::Sqlite
        && config
            .state
            .connection
            .as_deref()
            .is_some_and(|c| c.trim().is_empty())
    {
        errors.push("state.connection must not be empty".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        bail!("Pipeline validation failed:\n  - {}", errors.join("\n  - "));
    }
}
