use std::path::Path;

use anyhow::{Context, Result};
use sluice_engine::builtin::build_plan;
use sluice_types::state::PipelineId;

use super::{load_pipeline, open_store};

/// Execute the `check` command: validate the pipeline and open its state backend.
pub async fn execute(pipeline_path: &Path) -> Result<()> {
    let config = load_pipeline(pipeline_path)?;
    println!("Pipeline structure: OK");

    let (plan, _) = build_plan(&config);
    for (i, operator) in plan.operators.iter().enumerate() {
        println!("  [{i}] {}", operator.name());
    }

    let store = open_store(&config.state)?;
    let id = PipelineId::new(config.pipeline.as_str());
    let last = tokio::task::spawn_blocking(move || store.last_committed(&id))
        .await
        .context("State backend check panicked")?
        .context("Failed to read checkpoint store")?;

    match last {
        Some(checkpoint) => println!("State backend:     OK (last committed {checkpoint})"),
        None => println!("State backend:     OK (no committed checkpoint)"),
    }
    println!("\nAll checks passed.");
    Ok(())
}
