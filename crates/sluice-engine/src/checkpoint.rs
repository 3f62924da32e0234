//! Checkpoint sink and checkpoint source.
//!
//! The sink is a small actor in front of a [`CheckpointStore`]: operators
//! hand it their serialized state during a persist round and the pipeline
//! marks rounds durable through it. The source is the read side used when
//! a chain is resumed. Store calls are blocking and run on the blocking
//! thread pool.

use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use sluice_state::CheckpointStore;
use sluice_types::checkpoint::{Checkpoint, CheckpointRecord};
use sluice_types::state::{OperatorIndex, PipelineId};
use tokio::sync::{mpsc, oneshot};

use crate::error::EngineError;

enum SinkCommand {
    Persist {
        record: CheckpointRecord,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Commit {
        pipeline: PipelineId,
        checkpoint: Checkpoint,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    LastCommitted {
        pipeline: PipelineId,
        reply: oneshot::Sender<Result<Option<Checkpoint>, EngineError>>,
    },
    DiscardUncommitted {
        pipeline: PipelineId,
        reply: oneshot::Sender<Result<usize, EngineError>>,
    },
}

/// Handle to a running checkpoint sink. Cheap to clone and shared by every
/// operator in a chain.
#[derive(Clone)]
pub struct CheckpointSinkRef {
    commands: mpsc::UnboundedSender<SinkCommand>,
}

impl std::fmt::Debug for CheckpointSinkRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointSinkRef").finish_non_exhaustive()
    }
}

/// Spawn a sink task over `store` on the current runtime.
///
/// The task ends once every handle has been dropped. Commands are applied
/// one at a time in arrival order.
pub fn spawn_checkpoint_sink(store: Arc<dyn CheckpointStore>) -> CheckpointSinkRef {
    let (tx, mut rx) = mpsc::unbounded_channel::<SinkCommand>();
    tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            match command {
                SinkCommand::Persist { record, reply } => {
                    let store = Arc::clone(&store);
                    let result = blocking(move || store.put(&record)).await;
                    let _ = reply.send(result);
                }
                SinkCommand::Commit {
                    pipeline,
                    checkpoint,
                    reply,
                } => {
                    let store = Arc::clone(&store);
                    let result = blocking(move || store.commit(&pipeline, checkpoint)).await;
                    let _ = reply.send(result);
                }
                SinkCommand::LastCommitted { pipeline, reply } => {
                    let store = Arc::clone(&store);
                    let result = blocking(move || store.last_committed(&pipeline)).await;
                    let _ = reply.send(result);
                }
                SinkCommand::DiscardUncommitted { pipeline, reply } => {
                    let store = Arc::clone(&store);
                    let result = blocking(move || store.discard_uncommitted(&pipeline)).await;
                    let _ = reply.send(result);
                }
            }
        }
        tracing::debug!("checkpoint sink closed");
    });
    CheckpointSinkRef { commands: tx }
}

impl CheckpointSinkRef {
    /// Record one operator's state. Resolves once the store acknowledged.
    pub fn persist(&self, record: CheckpointRecord) -> BoxFuture<'static, Result<(), EngineError>> {
        let (reply, rx) = oneshot::channel();
        let sent = self.commands.send(SinkCommand::Persist { record, reply });
        await_sink(sent.is_ok(), rx)
    }

    /// Mark a round as durable for `pipeline`.
    pub fn commit_round(
        &self,
        pipeline: PipelineId,
        checkpoint: Checkpoint,
    ) -> BoxFuture<'static, Result<(), EngineError>> {
        let (reply, rx) = oneshot::channel();
        let sent = self.commands.send(SinkCommand::Commit {
            pipeline,
            checkpoint,
            reply,
        });
        await_sink(sent.is_ok(), rx)
    }

    /// Last durable round for `pipeline`, if any.
    pub fn last_committed(
        &self,
        pipeline: PipelineId,
    ) -> BoxFuture<'static, Result<Option<Checkpoint>, EngineError>> {
        let (reply, rx) = oneshot::channel();
        let sent = self
            .commands
            .send(SinkCommand::LastCommitted { pipeline, reply });
        await_sink(sent.is_ok(), rx)
    }

    /// Drop records left behind by rounds that never committed.
    pub fn discard_uncommitted(
        &self,
        pipeline: PipelineId,
    ) -> BoxFuture<'static, Result<usize, EngineError>> {
        let (reply, rx) = oneshot::channel();
        let sent = self
            .commands
            .send(SinkCommand::DiscardUncommitted { pipeline, reply });
        await_sink(sent.is_ok(), rx)
    }
}

fn await_sink<T: Send + 'static>(
    sent: bool,
    rx: oneshot::Receiver<Result<T, EngineError>>,
) -> BoxFuture<'static, Result<T, EngineError>> {
    async move {
        if !sent {
            return Err(EngineError::Unavailable("checkpoint sink".into()));
        }
        rx.await
            .unwrap_or_else(|_| Err(EngineError::Unavailable("checkpoint sink".into())))
    }
    .boxed()
}

async fn blocking<T, F>(f: F) -> Result<T, EngineError>
where
    T: Send + 'static,
    F: FnOnce() -> sluice_state::error::Result<T> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result.map_err(EngineError::from),
        Err(join) => Err(EngineError::Panicked(format!(
            "checkpoint store task failed: {join}"
        ))),
    }
}

/// Read side of the checkpoint store, used to resume a chain.
#[derive(Clone)]
pub struct CheckpointSource {
    store: Arc<dyn CheckpointStore>,
}

impl CheckpointSource {
    #[must_use]
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self { store }
    }

    /// State operator `index` recorded in the last committed round.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Checkpoint`] on store failure.
    pub async fn get(
        &self,
        pipeline: &PipelineId,
        index: OperatorIndex,
    ) -> Result<Option<Bytes>, EngineError> {
        let store = Arc::clone(&self.store);
        let pipeline = pipeline.clone();
        blocking(move || store.get(&pipeline, index)).await
    }

    /// Last committed round for `pipeline`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Checkpoint`] on store failure.
    pub async fn last_committed(
        &self,
        pipeline: &PipelineId,
    ) -> Result<Option<Checkpoint>, EngineError> {
        let store = Arc::clone(&self.store);
        let pipeline = pipeline.clone();
        blocking(move || store.last_committed(&pipeline)).await
    }
}
