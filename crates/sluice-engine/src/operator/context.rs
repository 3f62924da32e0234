use std::time::Duration;

use anyhow::bail;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::FutureExt;
use sluice_types::checkpoint::{Checkpoint, CheckpointRecord};
use sluice_types::payload::Payload;
use sluice_types::state::{OperatorIndex, PipelineId};

use crate::actor::{ActorId, Reply, Request, Responder};
use crate::connection::ConnectionDescriptor;
use crate::error::EngineError;
use crate::link::{Link, LinkAck, Side};
use crate::operator::{AckKind, Lifecycle};

/// Work an operator is waiting on.
pub(crate) enum OperatorEvent {
    Link(LinkAck),
    StateRecorded {
        checkpoint: Checkpoint,
        result: Result<(), EngineError>,
    },
    Wake,
    ShutdownNoticed(Reply),
}

/// An operator's view of the chain.
///
/// Everything here is non-blocking: sends are queued on per-neighbour links
/// and completions come back through the runner.
pub struct OperatorContext {
    pipeline: PipelineId,
    index: OperatorIndex,
    name: String,
    id: ActorId,
    lifecycle: Lifecycle,
    descriptor: Option<ConnectionDescriptor>,
    upstream: Option<Link>,
    downstream: Option<Link>,
    pub(crate) start_received: bool,
    pub(crate) upstream_done: bool,
    pub(crate) downstream_stopped: bool,
    input_closed: bool,
    output_closed: bool,
    finish_requested: bool,
    shutdown_sent: bool,
    current: Option<(AckKind, Responder)>,
    deferred: Vec<(AckKind, Responder)>,
    persisting: Option<Checkpoint>,
    pub(crate) pending: FuturesUnordered<BoxFuture<'static, OperatorEvent>>,
}

impl OperatorContext {
    pub(crate) fn new(pipeline: PipelineId, index: OperatorIndex, name: String, id: ActorId) -> Self {
        Self {
            pipeline,
            index,
            name,
            id,
            lifecycle: Lifecycle::Created,
            descriptor: None,
            upstream: None,
            downstream: None,
            start_received: false,
            upstream_done: false,
            downstream_stopped: false,
            input_closed: false,
            output_closed: false,
            finish_requested: false,
            shutdown_sent: false,
            current: None,
            deferred: Vec::new(),
            persisting: None,
            pending: FuturesUnordered::new(),
        }
    }

    #[must_use]
    pub fn pipeline(&self) -> &PipelineId {
        &self.pipeline
    }

    #[must_use]
    pub fn index(&self) -> OperatorIndex {
        self.index
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    #[must_use]
    pub fn is_input_closed(&self) -> bool {
        self.input_closed
    }

    #[must_use]
    pub fn is_output_closed(&self) -> bool {
        self.output_closed
    }

    #[must_use]
    pub fn descriptor(&self) -> Option<&ConnectionDescriptor> {
        self.descriptor.as_ref()
    }

    /// Send data downstream.
    pub fn push(&mut self, payload: Payload) {
        if self.output_closed {
            tracing::warn!(
                pipeline = %self.pipeline,
                operator = %self.index,
                rows = payload.len(),
                "Dropping push after no_more_output"
            );
            return;
        }
        self.send_downstream(Request::Push(payload));
    }

    /// Ask upstream for more data.
    pub fn pull(&mut self, items: u64) {
        if self.input_closed {
            return;
        }
        self.send_upstream(Request::Pull(items));
    }

    /// Record `state` for `checkpoint` and forward the barrier downstream.
    ///
    /// Only valid while handling the matching `persist`. Non-empty state is
    /// handed to the checkpoint sink first; the barrier leaves this operator
    /// after the sink acknowledged it, ahead of anything pushed later.
    ///
    /// # Errors
    ///
    /// Fails when `checkpoint` is not the round being persisted.
    pub fn checkpoint(&mut self, checkpoint: Checkpoint, state: Bytes) -> anyhow::Result<()> {
        if self.persisting != Some(checkpoint) {
            bail!("{checkpoint} is not being persisted by this operator");
        }
        self.persisting = None;
        let (Some(descriptor), Some(downstream)) = (&self.descriptor, &mut self.downstream) else {
            bail!("checkpoint before connect");
        };
        if state.is_empty() {
            downstream.enqueue(Request::Persist(checkpoint));
            return Ok(());
        }
        downstream.enqueue_barrier(checkpoint);
        tracing::debug!(
            pipeline = %self.pipeline,
            operator = %self.index,
            epoch = checkpoint.epoch(),
            bytes = state.len(),
            "Recording operator state"
        );
        let record = CheckpointRecord {
            pipeline: self.pipeline.clone(),
            operator: self.index,
            checkpoint,
            state,
        };
        let recorded = descriptor.checkpoint_sink.persist(record);
        self.pending.push(
            recorded
                .map(move |result| OperatorEvent::StateRecorded { checkpoint, result })
                .boxed(),
        );
        Ok(())
    }

    /// Tell upstream to stop sending. Sends `stop` at most once.
    pub fn no_more_input(&mut self) {
        if self.input_closed {
            return;
        }
        self.send_upstream(Request::Stop);
        self.input_closed = true;
    }

    /// Tell downstream nothing more is coming. Sends `done` at most once.
    pub fn no_more_output(&mut self) {
        if self.output_closed {
            return;
        }
        self.send_downstream(Request::Done);
        self.output_closed = true;
    }

    /// Close both directions and report ready for shutdown.
    ///
    /// The coordinator is told once, after every queued message to the
    /// neighbours has been acknowledged. Held acknowledgements are released.
    pub fn finish(&mut self) {
        self.no_more_input();
        self.no_more_output();
        if self.finish_requested {
            return;
        }
        self.finish_requested = true;
        self.lifecycle = Lifecycle::ShutdownRequested;
        for (_, responder) in self.deferred.drain(..) {
            responder.ok();
        }
        tracing::debug!(
            pipeline = %self.pipeline,
            operator = %self.index,
            "Operator finishing"
        );
    }

    /// Hold the acknowledgement of the request being handled.
    ///
    /// Returns `false` outside a `start`, `push` or `pull` handler.
    pub fn defer_ack(&mut self) -> bool {
        match self.current.take() {
            Some(held) => {
                self.deferred.push(held);
                true
            }
            None => false,
        }
    }

    /// Acknowledge a held request of `kind`. Returns `false` if none is held.
    pub fn release(&mut self, kind: AckKind) -> bool {
        let Some(pos) = self.deferred.iter().position(|(k, _)| *k == kind) else {
            return false;
        };
        let (_, responder) = self.deferred.remove(pos);
        responder.ok();
        self.acknowledged(kind);
        true
    }

    #[must_use]
    pub fn is_deferred(&self, kind: AckKind) -> bool {
        self.deferred.iter().any(|(k, _)| *k == kind)
    }

    /// Call [`Operator::on_wake`](crate::Operator::on_wake) after `delay`.
    pub fn wake_after(&mut self, delay: Duration) {
        self.pending
            .push(tokio::time::sleep(delay).map(|()| OperatorEvent::Wake).boxed());
    }

    // -----------------------------------------------------------------------
    // Runner side
    // -----------------------------------------------------------------------

    pub(crate) fn install(&mut self, descriptor: ConnectionDescriptor) {
        self.upstream = Some(Link::new(
            Side::Upstream,
            self.id,
            descriptor.upstream_target().clone(),
        ));
        self.downstream = Some(Link::new(
            Side::Downstream,
            self.id,
            descriptor.downstream_target().clone(),
        ));
        self.descriptor = Some(descriptor);
        self.lifecycle = Lifecycle::Connected;
    }

    pub(crate) fn mark_started(&mut self) {
        self.start_received = true;
        self.lifecycle = Lifecycle::Started;
    }

    pub(crate) fn mark_terminated(&mut self) {
        self.lifecycle = Lifecycle::Terminated;
    }

    pub(crate) fn begin(&mut self, kind: AckKind, responder: Responder) {
        self.current = Some((kind, responder));
    }

    /// Acknowledge the current request unless the handler deferred it.
    pub(crate) fn settle(&mut self) {
        if let Some((kind, responder)) = self.current.take() {
            responder.ok();
            self.acknowledged(kind);
        }
    }

    pub(crate) fn begin_persist(&mut self, checkpoint: Checkpoint) {
        self.persisting = Some(checkpoint);
    }

    /// The round still open after `on_persist` returned, if the operator
    /// did not forward it.
    pub(crate) fn take_unforwarded(&mut self) -> Option<Checkpoint> {
        self.persisting.take()
    }

    fn acknowledged(&mut self, kind: AckKind) {
        if kind == AckKind::Start && self.lifecycle == Lifecycle::Started {
            self.lifecycle = Lifecycle::Running;
        }
    }

    fn send_upstream(&mut self, request: Request) {
        match &mut self.upstream {
            Some(link) => link.enqueue(request),
            None => tracing::warn!(
                pipeline = %self.pipeline,
                operator = %self.index,
                request = request.kind(),
                "Dropping upstream request before connect"
            ),
        }
    }

    fn send_downstream(&mut self, request: Request) {
        match &mut self.downstream {
            Some(link) => link.enqueue(request),
            None => tracing::warn!(
                pipeline = %self.pipeline,
                operator = %self.index,
                request = request.kind(),
                "Dropping downstream request before connect"
            ),
        }
    }

    pub(crate) fn link_mut(&mut self, side: Side) -> Option<&mut Link> {
        match side {
            Side::Upstream => self.upstream.as_mut(),
            Side::Downstream => self.downstream.as_mut(),
            Side::ChainHead | Side::ChainTail => None,
        }
    }

    pub(crate) fn release_barrier(&mut self, checkpoint: Checkpoint) -> bool {
        self.downstream
            .as_mut()
            .is_some_and(|link| link.release_barrier(checkpoint))
    }

    /// Send whatever the links allow, then notify the coordinator once the
    /// operator finished and its links drained.
    pub(crate) fn flush(&mut self) {
        for link in [&mut self.upstream, &mut self.downstream].into_iter().flatten() {
            if let Some(sent) = link.dispatch() {
                self.pending.push(sent.map(OperatorEvent::Link).boxed());
            }
        }
        if !self.finish_requested || self.shutdown_sent {
            return;
        }
        let drained = [&self.upstream, &self.downstream]
            .into_iter()
            .flatten()
            .all(Link::is_idle);
        if !drained {
            return;
        }
        let Some(descriptor) = &self.descriptor else {
            return;
        };
        self.shutdown_sent = true;
        let noticed = descriptor.coordinator.request(self.id, Request::Shutdown);
        self.pending
            .push(noticed.map(OperatorEvent::ShutdownNoticed).boxed());
        tracing::debug!(
            pipeline = %self.pipeline,
            operator = %self.index,
            "Operator ready for shutdown"
        );
    }

    /// Coordinator name for error messages.
    pub(crate) fn coordinator_name(&self) -> String {
        self.descriptor
            .as_ref()
            .map_or_else(|| "coordinator".to_string(), |d| d.coordinator.name().to_string())
    }
}
