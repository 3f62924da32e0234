//! Chain manager.
//!
//! A subpipeline spawns the operators of one [`OperatorPlan`], wires each
//! to its neighbours and fans every lifecycle signal out across the chain.
//! Towards its owner it behaves like a single operator: the owner connects
//! it, starts it, sends it checkpoint barriers and commits, and receives
//! the chain's boundary traffic plus one shutdown-readiness notice.
//!
//! Shutdown is cooperative. Operators report readiness one by one; exit
//! signals go out only once every operator is ready and no checkpoint
//! round is still in flight.

use std::collections::{BTreeSet, HashMap};

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use sluice_types::checkpoint::Checkpoint;
use sluice_types::payload::Payload;
use sluice_types::state::{OperatorIndex, PipelineId};
use tokio::task::{JoinError, JoinHandle, JoinSet};

use crate::actor::{self, ActorId, ActorRef, Envelope, ExitSignal, Mailbox, Reply, Request, Responder};
use crate::checkpoint::CheckpointSource;
use crate::connection::ConnectionDescriptor;
use crate::error::{EngineError, ExitReason};
use crate::link::{Link, LinkAck, Side};
use crate::operator::runner::operator_task;
use crate::operator::{OperatorContext, OperatorPlan};
use crate::pipeline::ExecCtx;

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Owner-side handle to a running subpipeline.
///
/// The request helpers send from [`ActorId::EXTERNAL`]. Owners that are
/// actors themselves send through [`SubpipelineHandle::actor`] with their
/// own id so the chain can attribute boundary traffic.
pub struct SubpipelineHandle {
    actor: ActorRef,
    task: JoinHandle<ExitReason>,
}

impl SubpipelineHandle {
    #[must_use]
    pub fn actor(&self) -> &ActorRef {
        &self.actor
    }

    pub fn connect(&self, descriptor: ConnectionDescriptor) -> BoxFuture<'static, Reply> {
        self.send(Request::Connect(descriptor))
    }

    pub fn start(&self) -> BoxFuture<'static, Reply> {
        self.send(Request::Start)
    }

    pub fn persist(&self, checkpoint: Checkpoint) -> BoxFuture<'static, Reply> {
        self.send(Request::Persist(checkpoint))
    }

    pub fn commit(&self, checkpoint: Checkpoint) -> BoxFuture<'static, Reply> {
        self.send(Request::Commit(checkpoint))
    }

    pub fn push(&self, payload: Payload) -> BoxFuture<'static, Reply> {
        self.send(Request::Push(payload))
    }

    pub fn pull(&self, items: u64) -> BoxFuture<'static, Reply> {
        self.send(Request::Pull(items))
    }

    pub fn done(&self) -> BoxFuture<'static, Reply> {
        self.send(Request::Done)
    }

    pub fn stop(&self) -> BoxFuture<'static, Reply> {
        self.send(Request::Stop)
    }

    /// Tear the chain down immediately.
    pub fn kill(&self) {
        self.actor.send_exit(ExitSignal::Kill);
    }

    /// Wait for the chain to terminate.
    pub async fn wait(self) -> ExitReason {
        join_reason(self.task.await)
    }

    pub(crate) fn into_parts(self) -> (ActorRef, JoinHandle<ExitReason>) {
        (self.actor, self.task)
    }

    fn send(&self, request: Request) -> BoxFuture<'static, Reply> {
        self.actor.request(ActorId::EXTERNAL, request)
    }
}

pub(crate) fn join_reason(joined: Result<ExitReason, JoinError>) -> ExitReason {
    joined.unwrap_or_else(|err| ExitReason::Failed(EngineError::Panicked(err.to_string())))
}

/// Spawn the chain described by `plan`.
///
/// When `resume` is given, every operator is restored from the state it
/// recorded in the last committed round. The returned handle is live
/// immediately; requests queue until spawning completes.
pub fn make_subpipeline(
    plan: OperatorPlan,
    resume: Option<CheckpointSource>,
    ctx: &ExecCtx,
) -> SubpipelineHandle {
    let (me, mailbox) = actor::mailbox(format!("subpipeline/{}", plan.id));
    let runtime = ctx.runtime.clone();
    let task_me = me.clone();
    let task = ctx.runtime.spawn(async move {
        match spawn_chain(&plan, resume, &task_me, &runtime).await {
            Ok(chain) => chain.run(mailbox).await,
            Err(err) => {
                tracing::error!(pipeline = %plan.id, error = %err, "Failed to spawn chain");
                ExitReason::Failed(err)
            }
        }
    });
    SubpipelineHandle { actor: me, task }
}

async fn spawn_chain(
    plan: &OperatorPlan,
    resume: Option<CheckpointSource>,
    me: &ActorRef,
    runtime: &tokio::runtime::Handle,
) -> Result<Subpipeline, EngineError> {
    if plan.is_empty() {
        return Err(EngineError::protocol("operator plan is empty"));
    }

    let restores = futures::future::try_join_all((0..plan.len()).map(|i| {
        let resume = resume.clone();
        let id = plan.id.clone();
        async move {
            match resume {
                Some(source) => source.get(&id, OperatorIndex::new(i)).await,
                None => Ok(None),
            }
        }
    }))
    .await?;

    let mut chain = Subpipeline::new(plan.id.clone(), me.clone());
    for (i, (factory, restore)) in plan.operators.iter().zip(restores).enumerate() {
        let index = OperatorIndex::new(i);
        let name = factory.name().to_string();
        let resumed = restore.is_some();
        let operator = factory
            .instantiate(restore)
            .map_err(|source| EngineError::Spawn {
                index,
                name: name.clone(),
                source,
            })?;
        let (actor, mailbox) = actor::mailbox(format!("{}/{}#{}", plan.id, name, i));
        let ctx = OperatorContext::new(plan.id.clone(), index, name.clone(), actor.id());
        chain
            .tasks
            .spawn_on(operator_task(operator, ctx, mailbox), runtime);
        tracing::info!(
            pipeline = %plan.id,
            operator = i,
            name = %name,
            resumed,
            "Spawned operator"
        );
        chain.index_of.insert(actor.id(), index);
        chain.operators.push(actor);
        chain.names.push(name);
    }
    chain.ready = vec![false; chain.operators.len()];
    chain.head = Some(Link::new(Side::ChainHead, me.id(), chain.operators[0].clone()));
    chain.tail = chain
        .operators
        .last()
        .map(|last| Link::new(Side::ChainTail, me.id(), last.clone()));
    Ok(chain)
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

enum ChainEvent {
    Connected {
        index: OperatorIndex,
        result: Reply,
    },
    Started {
        index: OperatorIndex,
        result: Reply,
    },
    Committed {
        checkpoint: Checkpoint,
        index: OperatorIndex,
        result: Reply,
    },
    Link(LinkAck),
    OwnerNotified(Reply),
}

struct CommitRound {
    remaining: usize,
    responder: Option<Responder>,
}

struct Subpipeline {
    id: PipelineId,
    me: ActorRef,
    operators: Vec<ActorRef>,
    names: Vec<String>,
    index_of: HashMap<ActorId, OperatorIndex>,
    tasks: JoinSet<(OperatorIndex, ExitReason)>,

    owner: Option<ConnectionDescriptor>,
    owner_up: Option<Link>,
    owner_down: Option<Link>,
    head: Option<Link>,
    tail: Option<Link>,

    pending_connect: Option<Responder>,
    pending_start: Option<Responder>,
    connect_sent: bool,
    start_sent: bool,

    rounds: HashMap<Checkpoint, CommitRound>,
    in_flight: BTreeSet<Checkpoint>,
    traversed: BTreeSet<Checkpoint>,

    connected: usize,
    started: usize,
    ready: Vec<bool>,
    shutdown_ready: usize,
    exited: usize,
    checkpoints_in_flight: usize,

    asked_for_exit: bool,
    shutting_down: bool,

    pending: FuturesUnordered<BoxFuture<'static, ChainEvent>>,
}

impl Subpipeline {
    fn new(id: PipelineId, me: ActorRef) -> Self {
        Self {
            id,
            me,
            operators: Vec::new(),
            names: Vec::new(),
            index_of: HashMap::new(),
            tasks: JoinSet::new(),
            owner: None,
            owner_up: None,
            owner_down: None,
            head: None,
            tail: None,
            pending_connect: None,
            pending_start: None,
            connect_sent: false,
            start_sent: false,
            rounds: HashMap::new(),
            in_flight: BTreeSet::new(),
            traversed: BTreeSet::new(),
            connected: 0,
            started: 0,
            ready: Vec::new(),
            shutdown_ready: 0,
            exited: 0,
            checkpoints_in_flight: 0,
            asked_for_exit: false,
            shutting_down: false,
            pending: FuturesUnordered::new(),
        }
    }

    fn len(&self) -> usize {
        self.operators.len()
    }

    async fn run(mut self, mut mailbox: Mailbox) -> ExitReason {
        loop {
            self.flush();
            if self.shutting_down && self.exited == self.len() {
                tracing::info!(pipeline = %self.id, "Chain shut down");
                return ExitReason::Requested;
            }
            let step = tokio::select! {
                biased;
                Some(signal) = mailbox.exits.recv() => {
                    return self.terminate(signal).await;
                }
                Some(joined) = self.tasks.join_next() => self.on_operator_exit(joined),
                Some(event) = self.pending.next(), if !self.pending.is_empty() => {
                    self.on_event(event)
                }
                Some(envelope) = mailbox.requests.recv() => self.on_request(envelope),
            };
            if let Err(err) = step {
                return self.fail(err).await;
            }
        }
    }

    // -- termination --------------------------------------------------------

    async fn terminate(&mut self, signal: ExitSignal) -> ExitReason {
        tracing::info!(pipeline = %self.id, signal = ?signal, "Chain received exit signal");
        for op in &self.operators {
            op.send_exit(signal);
        }
        self.drain().await;
        match signal {
            ExitSignal::Requested => ExitReason::Requested,
            ExitSignal::Kill => ExitReason::Killed,
        }
    }

    async fn fail(&mut self, err: EngineError) -> ExitReason {
        tracing::warn!(pipeline = %self.id, "Tearing down chain after failure");
        for op in &self.operators {
            op.send_exit(ExitSignal::Kill);
        }
        self.drain().await;
        ExitReason::Failed(err)
    }

    async fn drain(&mut self) {
        while self.tasks.join_next().await.is_some() {}
    }

    fn on_operator_exit(
        &mut self,
        joined: Result<(OperatorIndex, ExitReason), JoinError>,
    ) -> Result<(), EngineError> {
        let (index, reason) = joined.map_err(|err| EngineError::Panicked(err.to_string()))?;
        self.exited += 1;
        if self.shutting_down && reason.is_requested() {
            tracing::debug!(pipeline = %self.id, operator = %index, "Operator shut down");
            return Ok(());
        }
        tracing::warn!(
            pipeline = %self.id,
            operator = %index,
            reason = %reason,
            "Operator exited unexpectedly"
        );
        Err(EngineError::OperatorExited {
            index,
            name: self.names[index.get()].clone(),
            source: Box::new(reason.into_error()),
        })
    }

    fn check_for_shutdown(&mut self) {
        if self.shutting_down || self.shutdown_ready < self.len() {
            return;
        }
        if self.checkpoints_in_flight > 0 {
            tracing::debug!(
                pipeline = %self.id,
                in_flight = self.checkpoints_in_flight,
                "Shutdown postponed until outstanding checkpoints commit"
            );
            return;
        }
        self.shutting_down = true;
        tracing::info!(pipeline = %self.id, "Shutting down chain");
        for op in &self.operators {
            op.send_exit(ExitSignal::Requested);
        }
    }

    // -- outgoing -----------------------------------------------------------

    fn flush(&mut self) {
        for link in [
            &mut self.head,
            &mut self.tail,
            &mut self.owner_up,
            &mut self.owner_down,
        ]
        .into_iter()
        .flatten()
        {
            if let Some(sent) = link.dispatch() {
                self.pending.push(sent.map(ChainEvent::Link).boxed());
            }
        }
    }

    fn link_mut(&mut self, side: Side) -> Option<&mut Link> {
        match side {
            Side::ChainHead => self.head.as_mut(),
            Side::ChainTail => self.tail.as_mut(),
            Side::Upstream => self.owner_up.as_mut(),
            Side::Downstream => self.owner_down.as_mut(),
        }
    }

    fn try_connect(&mut self) {
        if self.connect_sent {
            return;
        }
        let Some(owner) = &self.owner else {
            return;
        };
        self.connect_sent = true;
        let last = self.len() - 1;
        for (i, op) in self.operators.iter().enumerate() {
            let descriptor = ConnectionDescriptor {
                upstream: (i > 0).then(|| self.operators[i - 1].clone()),
                downstream: (i < last).then(|| self.operators[i + 1].clone()),
                checkpoint_sink: owner.checkpoint_sink.clone(),
                coordinator: self.me.clone(),
            };
            let index = OperatorIndex::new(i);
            let reply = op.request(self.me.id(), Request::Connect(descriptor));
            self.pending
                .push(reply.map(move |result| ChainEvent::Connected { index, result }).boxed());
        }
    }

    fn try_start(&mut self) {
        if self.start_sent || self.pending_start.is_none() || self.connected < self.len() {
            return;
        }
        self.start_sent = true;
        for (i, op) in self.operators.iter().enumerate() {
            let index = OperatorIndex::new(i);
            let reply = op.request(self.me.id(), Request::Start);
            self.pending
                .push(reply.map(move |result| ChainEvent::Started { index, result }).boxed());
        }
    }

    // -- incoming -----------------------------------------------------------

    fn on_request(&mut self, envelope: Envelope) -> Result<(), EngineError> {
        let Envelope {
            from,
            request,
            reply,
        } = envelope;
        match self.index_of.get(&from).copied() {
            Some(index) => {
                self.from_operator(index, request, reply);
                Ok(())
            }
            None => self.from_owner(request, reply),
        }
    }

    fn from_owner(&mut self, request: Request, reply: Responder) -> Result<(), EngineError> {
        match request {
            Request::Connect(descriptor) => {
                if self.owner.is_some() {
                    reply.fail(EngineError::protocol("subpipeline connected twice"));
                    return Ok(());
                }
                self.owner_up = Some(Link::new(
                    Side::Upstream,
                    self.me.id(),
                    descriptor.upstream_target().clone(),
                ));
                self.owner_down = Some(Link::new(
                    Side::Downstream,
                    self.me.id(),
                    descriptor.downstream_target().clone(),
                ));
                self.owner = Some(descriptor);
                self.pending_connect = Some(reply);
                self.try_connect();
            }
            Request::Start => {
                if self.start_sent || self.pending_start.is_some() {
                    reply.fail(EngineError::protocol("subpipeline started twice"));
                    return Ok(());
                }
                self.pending_start = Some(reply);
                self.try_start();
            }
            Request::Persist(checkpoint) => self.begin_round(checkpoint, reply),
            Request::Commit(checkpoint) => self.begin_commit(checkpoint, reply),
            Request::Push(payload) => self.proxy(Side::ChainHead, Request::Push(payload), reply),
            Request::Done => self.proxy(Side::ChainHead, Request::Done, reply),
            Request::Pull(items) => self.proxy(Side::ChainTail, Request::Pull(items), reply),
            Request::Stop => {
                tracing::info!(pipeline = %self.id, "Stop requested by owner");
                self.proxy(Side::ChainTail, Request::Stop, reply);
            }
            Request::Shutdown => {
                reply.fail(EngineError::protocol(
                    "shutdown readiness is reported by the chain, not to it",
                ));
            }
        }
        Ok(())
    }

    fn begin_round(&mut self, checkpoint: Checkpoint, reply: Responder) {
        if self.asked_for_exit {
            tracing::warn!(
                pipeline = %self.id,
                epoch = checkpoint.epoch(),
                "Dropping new checkpoint round during shutdown"
            );
            reply.fail(EngineError::RoundDropped(checkpoint));
            return;
        }
        if self.connected < self.len() {
            reply.fail(EngineError::protocol(format!(
                "{checkpoint} issued before the chain connected"
            )));
            return;
        }
        if !self.in_flight.insert(checkpoint) {
            reply.fail(EngineError::protocol(format!("{checkpoint} is already in flight")));
            return;
        }
        self.checkpoints_in_flight += 1;
        tracing::debug!(
            pipeline = %self.id,
            epoch = checkpoint.epoch(),
            in_flight = self.checkpoints_in_flight,
            "Checkpoint entering chain"
        );
        if let Some(head) = &mut self.head {
            head.enqueue(Request::Persist(checkpoint));
        }
        reply.ok();
    }

    fn begin_commit(&mut self, checkpoint: Checkpoint, reply: Responder) {
        if !self.in_flight.contains(&checkpoint) {
            reply.fail(EngineError::protocol(format!(
                "commit for {checkpoint}, which is not in flight"
            )));
            return;
        }
        if !self.traversed.contains(&checkpoint) {
            reply.fail(EngineError::protocol(format!(
                "commit for {checkpoint} before it traversed the chain"
            )));
            return;
        }
        if self.rounds.contains_key(&checkpoint) {
            reply.fail(EngineError::protocol(format!(
                "{checkpoint} is already being committed"
            )));
            return;
        }
        for (i, op) in self.operators.iter().enumerate() {
            let index = OperatorIndex::new(i);
            let acked = op.request(self.me.id(), Request::Commit(checkpoint));
            self.pending.push(
                acked
                    .map(move |result| ChainEvent::Committed {
                        checkpoint,
                        index,
                        result,
                    })
                    .boxed(),
            );
        }
        self.rounds.insert(
            checkpoint,
            CommitRound {
                remaining: self.len(),
                responder: Some(reply),
            },
        );
    }

    fn proxy(&mut self, side: Side, request: Request, reply: Responder) {
        match self.link_mut(side) {
            Some(link) => link.proxy(request, reply),
            None => reply.fail(EngineError::protocol(format!(
                "{} before the chain connected",
                request.kind()
            ))),
        }
    }

    fn from_operator(&mut self, index: OperatorIndex, request: Request, reply: Responder) {
        let is_head = index.get() == 0;
        let is_tail = index.get() + 1 == self.len();
        match request {
            Request::Shutdown => {
                reply.ok();
                self.mark_ready(index);
            }
            Request::Pull(_) | Request::Stop if is_head => {
                self.proxy(Side::Upstream, request, reply);
            }
            Request::Persist(checkpoint) if is_tail => {
                if !self.in_flight.contains(&checkpoint) {
                    reply.fail(EngineError::protocol(format!(
                        "{checkpoint} reached the chain end but was never issued"
                    )));
                    return;
                }
                self.traversed.insert(checkpoint);
                tracing::debug!(
                    pipeline = %self.id,
                    epoch = checkpoint.epoch(),
                    "Checkpoint traversed chain"
                );
                self.proxy(Side::Downstream, request, reply);
            }
            Request::Push(_) | Request::Done if is_tail => {
                self.proxy(Side::Downstream, request, reply);
            }
            other => {
                reply.fail(EngineError::protocol(format!(
                    "operator #{index} sent {} to its chain",
                    other.kind()
                )));
            }
        }
    }

    fn mark_ready(&mut self, index: OperatorIndex) {
        if std::mem::replace(&mut self.ready[index.get()], true) {
            return;
        }
        self.shutdown_ready += 1;
        tracing::debug!(
            pipeline = %self.id,
            operator = %index,
            ready = self.shutdown_ready,
            total = self.len(),
            "Operator ready for shutdown"
        );
        if self.shutdown_ready == self.len() && !self.asked_for_exit {
            self.asked_for_exit = true;
            tracing::info!(pipeline = %self.id, "All operators ready for shutdown");
            if let Some(owner) = &self.owner {
                let noticed = owner.coordinator.request(self.me.id(), Request::Shutdown);
                self.pending
                    .push(noticed.map(ChainEvent::OwnerNotified).boxed());
            }
        }
        self.check_for_shutdown();
    }

    fn on_event(&mut self, event: ChainEvent) -> Result<(), EngineError> {
        match event {
            ChainEvent::Connected { index, result } => {
                result.map_err(|e| self.operator_request_failed("connect", index, e))?;
                self.connected += 1;
                if self.connected == self.len() {
                    tracing::info!(pipeline = %self.id, operators = self.len(), "Chain connected");
                    if let Some(reply) = self.pending_connect.take() {
                        reply.ok();
                    }
                    self.try_start();
                }
            }
            ChainEvent::Started { index, result } => {
                result.map_err(|e| self.operator_request_failed("start", index, e))?;
                self.started += 1;
                if self.started == self.len() {
                    tracing::info!(pipeline = %self.id, "Chain started");
                    if let Some(reply) = self.pending_start.take() {
                        reply.ok();
                    }
                }
            }
            ChainEvent::Committed {
                checkpoint,
                index,
                result,
            } => {
                result.map_err(|e| self.operator_request_failed("commit", index, e))?;
                self.on_committed(checkpoint)?;
            }
            ChainEvent::Link(ack) => {
                if let Some(link) = self.link_mut(ack.side) {
                    link.acknowledged();
                }
                match ack.on_ack {
                    Some(responder) => responder.send(ack.result),
                    None => {
                        if let Err(err) = ack.result {
                            return Err(EngineError::request_failed(ack.request, &ack.target, err));
                        }
                    }
                }
            }
            ChainEvent::OwnerNotified(result) => {
                if let Err(err) = result {
                    let target = self
                        .owner
                        .as_ref()
                        .map_or("owner", |o| o.coordinator.name())
                        .to_string();
                    return Err(EngineError::request_failed("shutdown", &target, err));
                }
            }
        }
        Ok(())
    }

    fn on_committed(&mut self, checkpoint: Checkpoint) -> Result<(), EngineError> {
        let Some(round) = self.rounds.get_mut(&checkpoint) else {
            return Err(EngineError::protocol(format!(
                "acknowledgement for unknown commit of {checkpoint}"
            )));
        };
        round.remaining -= 1;
        if round.remaining > 0 {
            return Ok(());
        }
        let responder = self
            .rounds
            .remove(&checkpoint)
            .and_then(|mut round| round.responder.take());
        self.in_flight.remove(&checkpoint);
        self.traversed.remove(&checkpoint);
        self.checkpoints_in_flight -= 1;
        debug_assert_eq!(self.checkpoints_in_flight, self.in_flight.len());
        tracing::debug!(
            pipeline = %self.id,
            epoch = checkpoint.epoch(),
            in_flight = self.checkpoints_in_flight,
            "Checkpoint committed"
        );
        if let Some(reply) = responder {
            reply.ok();
        }
        self.check_for_shutdown();
        Ok(())
    }

    fn operator_request_failed(
        &self,
        request: &'static str,
        index: OperatorIndex,
        err: EngineError,
    ) -> EngineError {
        EngineError::request_failed(request, self.operators[index.get()].name(), err)
    }
}
