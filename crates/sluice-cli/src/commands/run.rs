use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use sluice_engine::actor::{ActorId, ExitSignal};
use sluice_engine::builtin::build_plan;
use sluice_engine::{make_pipeline, CheckpointSource, ExecCtx, Request};
use sluice_types::state::PipelineId;

use super::{load_pipeline, open_store};

/// Execute the `run` command: parse, validate, and run a pipeline.
pub async fn execute(pipeline_path: &Path, resume: bool) -> Result<()> {
    let config = load_pipeline(pipeline_path)?;

    tracing::info!(
        pipeline = %config.pipeline,
        operators = config.operators.len(),
        checkpoint_interval_ms = config.settings.checkpoint_interval_ms,
        checkpoints_in_flight = config.settings.checkpoints_in_flight,
        resume,
        "Pipeline validated"
    );

    let store = open_store(&config.state)?;
    let id = PipelineId::new(config.pipeline.as_str());
    let source = CheckpointSource::new(Arc::clone(&store));
    let resumed_from = if resume {
        source
            .last_committed(&id)
            .await
            .context("Failed to read checkpoint store")?
    } else {
        None
    };
    match resumed_from {
        Some(checkpoint) => tracing::info!(pipeline = %id, %checkpoint, "Resuming"),
        None if resume => tracing::warn!(pipeline = %id, "No committed checkpoint, starting fresh"),
        None => {}
    }

    let (plan, collected) = build_plan(&config);
    let ctx = ExecCtx::current(Arc::clone(&store))?;
    let started_at = Instant::now();
    let mut handle = make_pipeline(plan, config.settings, resume.then_some(source.clone()), &ctx);

    let drained = handle.take_output().map(|mut output| {
        tokio::spawn(async move {
            let mut rows = 0_usize;
            while let Some(payload) = output.recv().await {
                rows += payload.len();
            }
            rows
        })
    });

    handle.start().await.context("Failed to start pipeline")?;

    let pipeline = handle.actor().clone();
    let finished = handle.wait();
    tokio::pin!(finished);
    let result = tokio::select! {
        result = &mut finished => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!(pipeline = %id, "Interrupted, shutting down (Ctrl-C again to kill)");
            pipeline
                .request(ActorId::EXTERNAL, Request::Stop)
                .await
                .context("Failed to request shutdown")?;
            tokio::select! {
                result = &mut finished => result,
                _ = tokio::signal::ctrl_c() => {
                    tracing::warn!(pipeline = %id, "Killing pipeline");
                    pipeline.send_exit(ExitSignal::Kill);
                    finished.await
                }
            }
        }
    };
    result.with_context(|| format!("Pipeline '{id}' failed"))?;

    let passed_through = match drained {
        Some(task) => task.await.context("Output drain panicked")?,
        None => 0,
    };
    let last = source
        .last_committed(&id)
        .await
        .context("Failed to read checkpoint store")?;
    let duration = started_at.elapsed().as_secs_f64();

    println!("Pipeline '{}' completed successfully.", config.pipeline);
    if let Some(sink) = collected {
        let rows = sink.rows();
        println!("  Rows collected:  {rows}");
        println!("  Batches:         {}", sink.batches().len());
        if duration > 0.0 {
            println!("  Throughput:      {:.0} rows/sec", rows as f64 / duration);
        }
    }
    if passed_through > 0 {
        println!("  Rows past chain: {passed_through}");
    }
    match last {
        Some(checkpoint) => println!("  Last committed:  {checkpoint}"),
        None => println!("  Last committed:  none"),
    }
    println!("  Duration:        {duration:.2}s");

    Ok(())
}
