//! The operator contract.
//!
//! An [`Operator`] is one stage of a chain. The engine runs each operator
//! in its own task and calls exactly one hook per incoming message, in
//! arrival order. Hooks never block: anything that has to wait (a neighbour
//! acknowledging a push, the checkpoint sink recording state, a timer) is
//! expressed through the [`OperatorContext`] and completes later.

mod context;
pub(crate) mod runner;

use std::sync::Arc;

use bytes::Bytes;
use sluice_types::checkpoint::Checkpoint;
use sluice_types::payload::Payload;
use sluice_types::state::PipelineId;

pub use context::OperatorContext;

use crate::error::ExitReason;

/// One pipeline stage.
///
/// Every hook has a default, so a pass-through operator needs no code.
/// The defaults for `on_done` and `on_stop` finish the operator, which is
/// what a stage without buffered work wants.
pub trait Operator: Send + 'static {
    /// Neighbour handles have been installed.
    fn on_connect(&mut self, _ctx: &mut OperatorContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Begin producing or consuming. Call [`OperatorContext::defer_ack`] to
    /// hold the start acknowledgement until the operator is ready.
    fn on_start(&mut self, _ctx: &mut OperatorContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Data from upstream.
    fn on_push(&mut self, ctx: &mut OperatorContext, payload: Payload) -> anyhow::Result<()> {
        ctx.push(payload);
        Ok(())
    }

    /// Demand from downstream.
    fn on_pull(&mut self, ctx: &mut OperatorContext, items: u64) -> anyhow::Result<()> {
        ctx.pull(items);
        Ok(())
    }

    /// Private state to record for a checkpoint. Empty means nothing to
    /// record; a resumed instance then starts fresh.
    fn serialize(&self) -> anyhow::Result<Bytes> {
        Ok(Bytes::new())
    }

    /// A checkpoint barrier arrived from upstream.
    ///
    /// Overrides must end by calling [`OperatorContext::checkpoint`] with
    /// the same token; an operator that swallows a barrier fails.
    fn on_persist(
        &mut self,
        ctx: &mut OperatorContext,
        checkpoint: Checkpoint,
    ) -> anyhow::Result<()> {
        let state = self.serialize()?;
        ctx.checkpoint(checkpoint, state)
    }

    /// The round `checkpoint` is durable across the whole chain.
    fn on_commit(
        &mut self,
        _ctx: &mut OperatorContext,
        _checkpoint: Checkpoint,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Upstream has no more data.
    fn on_done(&mut self, ctx: &mut OperatorContext) -> anyhow::Result<()> {
        ctx.finish();
        Ok(())
    }

    /// Downstream wants no more data.
    fn on_stop(&mut self, ctx: &mut OperatorContext) -> anyhow::Result<()> {
        ctx.finish();
        Ok(())
    }

    /// A timer registered with [`OperatorContext::wake_after`] fired.
    fn on_wake(&mut self, _ctx: &mut OperatorContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Last call before the task ends.
    fn on_exit(&mut self, _reason: &ExitReason) {}
}

/// Constructs operator instances for one plan position.
pub trait OperatorFactory: Send + Sync {
    fn name(&self) -> &str;

    /// Build an instance, restoring from `restore` when the chain resumes
    /// from a committed checkpoint.
    ///
    /// # Errors
    ///
    /// Returns an error when the restore bytes cannot be decoded.
    fn instantiate(&self, restore: Option<Bytes>) -> anyhow::Result<Box<dyn Operator>>;
}

struct FnFactory<F> {
    name: String,
    build: F,
}

impl<F> OperatorFactory for FnFactory<F>
where
    F: Fn(Option<Bytes>) -> anyhow::Result<Box<dyn Operator>> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn instantiate(&self, restore: Option<Bytes>) -> anyhow::Result<Box<dyn Operator>> {
        (self.build)(restore)
    }
}

/// Factory from a closure.
pub fn factory_fn<F>(name: impl Into<String>, build: F) -> Arc<dyn OperatorFactory>
where
    F: Fn(Option<Bytes>) -> anyhow::Result<Box<dyn Operator>> + Send + Sync + 'static,
{
    Arc::new(FnFactory {
        name: name.into(),
        build,
    })
}

/// Ordered operator factories for one chain. Never mutated once built.
#[derive(Clone)]
pub struct OperatorPlan {
    pub id: PipelineId,
    pub operators: Vec<Arc<dyn OperatorFactory>>,
}

impl OperatorPlan {
    #[must_use]
    pub fn new(id: impl Into<PipelineId>, operators: Vec<Arc<dyn OperatorFactory>>) -> Self {
        Self {
            id: id.into(),
            operators,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.operators.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }
}

impl std::fmt::Debug for OperatorPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperatorPlan")
            .field("id", &self.id)
            .field(
                "operators",
                &self.operators.iter().map(|o| o.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Requests whose acknowledgement an operator may hold back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    Start,
    Push,
    Pull,
}

/// Operator state machine.
///
/// `no_more_input` and `no_more_output` are tracked separately as flags on
/// the context; they may be reached from `Running` in either order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Lifecycle {
    Created,
    Connected,
    /// `start` received, acknowledgement outstanding.
    Started,
    Running,
    /// `finish` called; the coordinator is told once outgoing links drain.
    ShutdownRequested,
    Terminated,
}
