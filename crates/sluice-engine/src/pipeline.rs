//! Outer pipeline driver.
//!
//! A pipeline owns exactly one subpipeline and stands at both of its
//! boundaries. It holds the host's `start` until the chain is connected,
//! runs the periodic checkpoint loop once the chain started, and marks a
//! round durable in the checkpoint store as soon as the barrier made it
//! through the whole chain, before telling operators to commit.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use sluice_state::CheckpointStore;
use sluice_types::checkpoint::Checkpoint;
use sluice_types::payload::Payload;
use sluice_types::state::PipelineId;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::actor::{self, ActorId, ActorRef, Envelope, ExitSignal, Mailbox, Reply, Request, Responder};
use crate::checkpoint::{spawn_checkpoint_sink, CheckpointSinkRef, CheckpointSource};
use crate::config::PipelineSettings;
use crate::connection::ConnectionDescriptor;
use crate::error::{EngineError, ExitReason};
use crate::operator::OperatorPlan;
use crate::subpipeline::{join_reason, make_subpipeline};

/// Where pipelines run and persist.
#[derive(Clone)]
pub struct ExecCtx {
    pub store: Arc<dyn CheckpointStore>,
    pub runtime: Handle,
}

impl ExecCtx {
    #[must_use]
    pub fn new(store: Arc<dyn CheckpointStore>, runtime: Handle) -> Self {
        Self { store, runtime }
    }

    /// Context on the runtime the caller is running in.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Unavailable`] outside a tokio runtime.
    pub fn current(store: Arc<dyn CheckpointStore>) -> Result<Self, EngineError> {
        let runtime = Handle::try_current()
            .map_err(|e| EngineError::Unavailable(format!("tokio runtime ({e})")))?;
        Ok(Self { store, runtime })
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Host-side handle to a running pipeline.
pub struct PipelineHandle {
    id: PipelineId,
    actor: ActorRef,
    task: JoinHandle<ExitReason>,
    output: Option<mpsc::UnboundedReceiver<Payload>>,
}

impl PipelineHandle {
    #[must_use]
    pub fn id(&self) -> &PipelineId {
        &self.id
    }

    #[must_use]
    pub fn actor(&self) -> &ActorRef {
        &self.actor
    }

    /// Start the chain. Resolves once every operator acknowledged `start`.
    pub fn start(&self) -> BoxFuture<'static, Reply> {
        self.actor.request(ActorId::EXTERNAL, Request::Start)
    }

    /// Ask the chain to wind down. Outstanding checkpoint rounds still
    /// complete; no new round starts.
    pub fn shutdown(&self) -> BoxFuture<'static, Reply> {
        self.actor.request(ActorId::EXTERNAL, Request::Stop)
    }

    /// Terminate immediately.
    pub fn kill(&self) {
        self.actor.send_exit(ExitSignal::Kill);
    }

    /// Payloads the last operator pushed past the chain end.
    pub fn take_output(&mut self) -> Option<mpsc::UnboundedReceiver<Payload>> {
        self.output.take()
    }

    /// Wait for the pipeline to exit.
    ///
    /// # Errors
    ///
    /// Returns the single wrapped error of a pipeline that did not exit on
    /// request.
    pub async fn wait(self) -> Result<(), EngineError> {
        join_reason(self.task.await).into_result()
    }
}

/// Spawn a pipeline over `plan`.
///
/// With `resume`, operators restore from the last committed round and
/// epochs continue after it.
pub fn make_pipeline(
    plan: OperatorPlan,
    settings: PipelineSettings,
    resume: Option<CheckpointSource>,
    ctx: &ExecCtx,
) -> PipelineHandle {
    let id = plan.id.clone();
    let (me, mailbox) = actor::mailbox(format!("pipeline/{id}"));
    let (output_tx, output_rx) = mpsc::unbounded_channel();
    let (sub, sub_task) = make_subpipeline(plan, resume, ctx).into_parts();
    let driver = Pipeline::new(id.clone(), me.clone(), settings, sub, output_tx);
    let store = Arc::clone(&ctx.store);
    let task = ctx
        .runtime
        .spawn(async move { driver.run(mailbox, sub_task, store).await });
    PipelineHandle {
        id,
        actor: me,
        task,
        output: Some(output_rx),
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

enum DriverEvent {
    Connected(Reply),
    Started(Reply),
    PersistIssued {
        checkpoint: Checkpoint,
        result: Reply,
    },
    Committed {
        checkpoint: Checkpoint,
        result: Reply,
    },
    Forwarded {
        request: &'static str,
        result: Reply,
        on_ack: Option<Responder>,
    },
}

struct Pipeline {
    id: PipelineId,
    me: ActorRef,
    settings: PipelineSettings,
    sub: ActorRef,
    sink: Option<CheckpointSinkRef>,
    output: mpsc::UnboundedSender<Payload>,

    connected: bool,
    asked_for_exit: bool,
    start_sent: bool,
    pending_start: Option<Responder>,
    pending_stop: Option<Responder>,
    input_done: bool,

    next_checkpoint: Checkpoint,
    outstanding: BTreeSet<Checkpoint>,
    ticker: Option<Interval>,

    pending: FuturesUnordered<BoxFuture<'static, DriverEvent>>,
}

impl Pipeline {
    fn new(
        id: PipelineId,
        me: ActorRef,
        settings: PipelineSettings,
        sub: ActorRef,
        output: mpsc::UnboundedSender<Payload>,
    ) -> Self {
        Self {
            id,
            me,
            settings,
            sub,
            sink: None,
            output,
            connected: false,
            asked_for_exit: false,
            start_sent: false,
            pending_start: None,
            pending_stop: None,
            input_done: false,
            next_checkpoint: Checkpoint::new(1),
            outstanding: BTreeSet::new(),
            ticker: None,
            pending: FuturesUnordered::new(),
        }
    }

    async fn run(
        mut self,
        mut mailbox: Mailbox,
        mut sub_task: JoinHandle<ExitReason>,
        store: Arc<dyn CheckpointStore>,
    ) -> ExitReason {
        let sink = spawn_checkpoint_sink(store);
        match self.prepare_epochs(&sink).await {
            Ok(discarded) => {
                tracing::info!(
                    pipeline = %self.id,
                    first_epoch = self.next_checkpoint.epoch(),
                    discarded,
                    "Pipeline created"
                );
            }
            Err(err) => {
                tracing::error!(pipeline = %self.id, error = %err, "Failed to read checkpoint store");
                self.sub.send_exit(ExitSignal::Kill);
                let _ = sub_task.await;
                return ExitReason::Failed(err);
            }
        }

        let descriptor = ConnectionDescriptor {
            upstream: Some(self.me.clone()),
            downstream: Some(self.me.clone()),
            checkpoint_sink: sink.clone(),
            coordinator: self.me.clone(),
        };
        self.sink = Some(sink);
        let connected = self
            .sub
            .request(self.me.id(), Request::Connect(descriptor));
        self.pending.push(connected.map(DriverEvent::Connected).boxed());

        loop {
            let step = tokio::select! {
                biased;
                Some(signal) = mailbox.exits.recv() => {
                    tracing::info!(pipeline = %self.id, signal = ?signal, "Pipeline received exit signal");
                    self.sub.send_exit(signal);
                    let _ = (&mut sub_task).await;
                    return match signal {
                        ExitSignal::Requested => ExitReason::Requested,
                        ExitSignal::Kill => ExitReason::Killed,
                    };
                }
                joined = &mut sub_task => return self.on_subpipeline_exit(joined),
                Some(event) = self.pending.next(), if !self.pending.is_empty() => {
                    self.on_event(event)
                }
                () = next_tick(&mut self.ticker), if self.ticker.is_some() => {
                    self.on_tick();
                    Ok(())
                }
                Some(envelope) = mailbox.requests.recv() => self.on_request(envelope),
            };
            if let Err(err) = step {
                tracing::error!(pipeline = %self.id, error = %err, "Pipeline failed");
                self.sub.send_exit(ExitSignal::Kill);
                let _ = sub_task.await;
                return ExitReason::Failed(err);
            }
        }
    }

    /// Continue epochs after the last committed round and drop whatever a
    /// dead run recorded past it, so a reused epoch starts empty.
    async fn prepare_epochs(&mut self, sink: &CheckpointSinkRef) -> Result<usize, EngineError> {
        let last = sink.last_committed(self.id.clone()).await?;
        self.next_checkpoint = last.map_or(Checkpoint::new(1), Checkpoint::next);
        sink.discard_uncommitted(self.id.clone()).await
    }

    fn on_subpipeline_exit(&self, joined: Result<ExitReason, JoinError>) -> ExitReason {
        match join_reason(joined) {
            ExitReason::Requested => {
                tracing::info!(
                    pipeline = %self.id,
                    last_epoch = self.next_checkpoint.epoch().saturating_sub(1),
                    "Pipeline finished"
                );
                ExitReason::Requested
            }
            reason => {
                tracing::warn!(pipeline = %self.id, reason = %reason, "Subpipeline exited unexpectedly");
                ExitReason::Failed(EngineError::Subpipeline(Box::new(reason.into_error())))
            }
        }
    }

    // -- checkpoint loop ----------------------------------------------------

    fn start_ticker(&mut self) {
        if !self.settings.checkpoints_enabled() || self.asked_for_exit {
            return;
        }
        let period = self.settings.checkpoint_interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.ticker = Some(ticker);
    }

    fn on_tick(&mut self) {
        if self.asked_for_exit {
            self.ticker = None;
            return;
        }
        let max = self.settings.checkpoints_in_flight as usize;
        if self.outstanding.len() >= max {
            tracing::debug!(
                pipeline = %self.id,
                outstanding = self.outstanding.len(),
                "Skipping checkpoint, too many in flight"
            );
            return;
        }
        let checkpoint = self.next_checkpoint;
        self.next_checkpoint = checkpoint.next();
        self.outstanding.insert(checkpoint);
        tracing::debug!(pipeline = %self.id, epoch = checkpoint.epoch(), "Starting checkpoint round");
        let issued = self
            .sub
            .request(self.me.id(), Request::Persist(checkpoint));
        self.pending.push(
            issued
                .map(move |result| DriverEvent::PersistIssued { checkpoint, result })
                .boxed(),
        );
    }

    /// A barrier made it through the whole chain: make the round durable,
    /// then let the operators act on it.
    fn on_traversed(&mut self, checkpoint: Checkpoint) -> Result<(), EngineError> {
        if !self.outstanding.contains(&checkpoint) {
            return Err(EngineError::protocol(format!(
                "{checkpoint} returned from the chain but was never issued"
            )));
        }
        let Some(sink) = self.sink.clone() else {
            return Err(EngineError::Unavailable("checkpoint sink".into()));
        };
        let id = self.id.clone();
        let sub = self.sub.clone();
        let me = self.me.id();
        let commit = async move {
            sink.commit_round(id, checkpoint).await?;
            sub.request(me, Request::Commit(checkpoint))
                .await
                .map_err(|e| EngineError::request_failed("commit", sub.name(), e))
        };
        self.pending.push(
            commit
                .map(move |result| DriverEvent::Committed { checkpoint, result })
                .boxed(),
        );
        Ok(())
    }

    fn stop_checkpointing(&mut self) {
        self.asked_for_exit = true;
        self.ticker = None;
    }

    // -- requests -----------------------------------------------------------

    fn on_request(&mut self, envelope: Envelope) -> Result<(), EngineError> {
        let Envelope {
            from,
            request,
            reply,
        } = envelope;
        if from == self.sub.id() {
            self.from_chain(request, reply)
        } else {
            self.from_host(request, reply);
            Ok(())
        }
    }

    fn from_host(&mut self, request: Request, reply: Responder) {
        match request {
            Request::Start => {
                if self.start_sent || self.pending_start.is_some() {
                    reply.fail(EngineError::protocol("pipeline started twice"));
                    return;
                }
                self.pending_start = Some(reply);
                self.try_start();
            }
            Request::Stop | Request::Shutdown => {
                tracing::info!(pipeline = %self.id, "Shutdown requested");
                self.stop_checkpointing();
                if self.connected {
                    self.forward_stop(reply);
                } else if self.pending_stop.is_none() {
                    self.pending_stop = Some(reply);
                } else {
                    reply.ok();
                }
            }
            other => reply.fail(EngineError::protocol(format!(
                "hosts cannot send {} to a pipeline",
                other.kind()
            ))),
        }
    }

    fn forward_stop(&mut self, reply: Responder) {
        let stopped = self.sub.request(self.me.id(), Request::Stop);
        self.pending.push(
            stopped
                .map(move |result| DriverEvent::Forwarded {
                    request: "stop",
                    result,
                    on_ack: Some(reply),
                })
                .boxed(),
        );
    }

    fn try_start(&mut self) {
        if self.start_sent || !self.connected || self.pending_start.is_none() {
            return;
        }
        self.start_sent = true;
        let started = self.sub.request(self.me.id(), Request::Start);
        self.pending.push(started.map(DriverEvent::Started).boxed());
    }

    fn from_chain(&mut self, request: Request, reply: Responder) -> Result<(), EngineError> {
        match request {
            Request::Persist(checkpoint) => {
                reply.ok();
                self.on_traversed(checkpoint)?;
            }
            Request::Shutdown => {
                reply.ok();
                if !self.asked_for_exit {
                    tracing::info!(pipeline = %self.id, "Chain ready for shutdown, stopping checkpoints");
                }
                self.stop_checkpointing();
            }
            Request::Push(payload) => {
                reply.ok();
                if self.output.send(payload).is_err() {
                    tracing::trace!(pipeline = %self.id, "Output receiver dropped");
                }
            }
            Request::Done => {
                reply.ok();
                tracing::debug!(pipeline = %self.id, "Chain output complete");
            }
            Request::Pull(_) => {
                reply.ok();
                if !std::mem::replace(&mut self.input_done, true) {
                    let done = self.sub.request(self.me.id(), Request::Done);
                    self.pending.push(
                        done.map(|result| DriverEvent::Forwarded {
                            request: "done",
                            result,
                            on_ack: None,
                        })
                        .boxed(),
                    );
                }
            }
            Request::Stop => reply.ok(),
            other => reply.fail(EngineError::protocol(format!(
                "a chain cannot send {} to its pipeline",
                other.kind()
            ))),
        }
        Ok(())
    }

    // -- completions --------------------------------------------------------

    fn on_event(&mut self, event: DriverEvent) -> Result<(), EngineError> {
        match event {
            DriverEvent::Connected(result) => {
                result.map_err(|e| EngineError::request_failed("connect", self.sub.name(), e))?;
                self.connected = true;
                tracing::info!(pipeline = %self.id, "Pipeline connected");
                if let Some(reply) = self.pending_stop.take() {
                    self.forward_stop(reply);
                }
                self.try_start();
            }
            DriverEvent::Started(result) => {
                result.map_err(|e| EngineError::request_failed("start", self.sub.name(), e))?;
                tracing::info!(
                    pipeline = %self.id,
                    checkpoint_interval_ms = self.settings.checkpoint_interval_ms,
                    checkpoints_in_flight = self.settings.checkpoints_in_flight,
                    "Pipeline started"
                );
                if let Some(reply) = self.pending_start.take() {
                    reply.ok();
                }
                self.start_ticker();
            }
            DriverEvent::PersistIssued { checkpoint, result } => match result {
                Ok(()) => {
                    tracing::trace!(pipeline = %self.id, epoch = checkpoint.epoch(), "Checkpoint accepted");
                }
                Err(EngineError::RoundDropped(dropped)) => {
                    self.outstanding.remove(&dropped);
                    tracing::debug!(pipeline = %self.id, epoch = dropped.epoch(), "Checkpoint dropped by chain");
                }
                Err(err) => {
                    return Err(EngineError::request_failed("persist", self.sub.name(), err));
                }
            },
            DriverEvent::Committed { checkpoint, result } => {
                result?;
                self.outstanding.remove(&checkpoint);
                tracing::debug!(pipeline = %self.id, epoch = checkpoint.epoch(), "Checkpoint committed");
            }
            DriverEvent::Forwarded {
                request,
                result,
                on_ack,
            } => match on_ack {
                Some(reply) => reply.send(result),
                None => {
                    result.map_err(|e| EngineError::request_failed(request, self.sub.name(), e))?;
                }
            },
        }
        Ok(())
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idle_driver(settings: PipelineSettings) -> (Pipeline, Mailbox) {
        let (me, _) = actor::mailbox("pipeline/test");
        let (sub, sub_mailbox) = actor::mailbox("subpipeline/test");
        let (output, _) = mpsc::unbounded_channel();
        let driver = Pipeline::new(PipelineId::new("test"), me, settings, sub, output);
        (driver, sub_mailbox)
    }

    #[test]
    fn dropped_round_frees_its_in_flight_slot() {
        let (mut driver, _sub) = idle_driver(PipelineSettings::default());

        driver.on_tick();
        assert_eq!(driver.outstanding.len(), 1);
        driver.on_tick();
        assert_eq!(driver.outstanding.len(), 1, "limit of one round in flight");

        driver
            .on_event(DriverEvent::PersistIssued {
                checkpoint: Checkpoint::new(1),
                result: Err(EngineError::RoundDropped(Checkpoint::new(1))),
            })
            .unwrap();
        assert!(driver.outstanding.is_empty());

        driver.on_tick();
        assert_eq!(
            driver.outstanding.iter().copied().collect::<Vec<_>>(),
            [Checkpoint::new(2)]
        );
    }

    #[test]
    fn other_persist_failures_fail_the_pipeline() {
        let (mut driver, _sub) = idle_driver(PipelineSettings::default());
        driver.on_tick();
        let err = driver
            .on_event(DriverEvent::PersistIssued {
                checkpoint: Checkpoint::new(1),
                result: Err(EngineError::protocol("boom")),
            })
            .unwrap_err();
        assert!(matches!(err, EngineError::RequestFailed { request: "persist", .. }));
        assert_eq!(driver.outstanding.len(), 1);
    }
}
