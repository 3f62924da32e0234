//! Actor-based execution engine for sluice pipelines.
//!
//! A [`pipeline`] owns one [`subpipeline`], which owns an ordered chain of
//! operators. Every stage runs as its own tokio task and talks to its
//! neighbours only through request messages. The pipeline drives periodic
//! checkpoint rounds through the chain and coordinates a cooperative
//! shutdown once every operator is done.

pub mod actor;
pub mod builtin;
pub mod checkpoint;
pub mod config;
pub mod connection;
pub mod error;
pub(crate) mod link;
pub mod operator;
pub mod pipeline;
pub mod subpipeline;

pub use actor::{ActorId, ActorRef, Request};
pub use checkpoint::{spawn_checkpoint_sink, CheckpointSinkRef, CheckpointSource};
pub use connection::ConnectionDescriptor;
pub use error::{EngineError, ExitReason};
pub use operator::{AckKind, Lifecycle, Operator, OperatorContext, OperatorFactory, OperatorPlan};
pub use pipeline::{make_pipeline, ExecCtx, PipelineHandle};
pub use subpipeline::{make_subpipeline, SubpipelineHandle};
