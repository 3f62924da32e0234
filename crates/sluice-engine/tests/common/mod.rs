//! Shared helpers for engine integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use arrow::array::Int64Array;
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use sluice_engine::actor::{self, ActorId, ActorRef};
use sluice_engine::operator::factory_fn;
use sluice_engine::{
    spawn_checkpoint_sink, AckKind, ConnectionDescriptor, ExitReason, Lifecycle, Operator,
    OperatorContext, OperatorPlan, Request,
};
use sluice_state::MemoryCheckpointStore;
use sluice_types::checkpoint::Checkpoint;
use sluice_types::payload::Payload;
use tokio::sync::mpsc;

pub const WAIT: Duration = Duration::from_secs(5);

/// What a recorder operator saw, tagged with its chain index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Seen {
    Connected(usize),
    Started(usize),
    Pushed(usize, usize),
    Persisted(usize, u64),
    Committed(usize, u64),
    Done(usize),
    Stopped(usize),
    Exited(usize, String),
    /// Lifecycle observed in the named hook.
    Lifecycle(usize, &'static str, Lifecycle),
}

/// Knobs for a recorder operator.
#[derive(Debug, Clone, Copy, Default)]
pub struct Behavior {
    /// Call `finish` from `on_start`.
    pub finish_on_start: bool,
    /// Fail the operator on the first push.
    pub fail_on_push: bool,
    /// Panic on the first push.
    pub panic_on_push: bool,
    /// Serialize non-empty state so persist goes through the sink.
    pub record_state: bool,
    /// Call every termination helper several times.
    pub repeat_helpers: bool,
    /// Report `ctx.lifecycle()` from each hook and after finishing.
    pub track_lifecycle: bool,
    /// Report `stop` but keep running.
    pub ignore_stop: bool,
    /// Hold every push acknowledgement; each pull releases one.
    pub hold_pushes: bool,
}

/// Pass-through operator that reports every hook.
pub struct Recorder {
    index: usize,
    behavior: Behavior,
    seen: mpsc::UnboundedSender<Seen>,
}

impl Recorder {
    fn report(&self, seen: Seen) {
        let _ = self.seen.send(seen);
    }

    fn lifecycle(&self, hook: &'static str, ctx: &OperatorContext) {
        if self.behavior.track_lifecycle {
            self.report(Seen::Lifecycle(self.index, hook, ctx.lifecycle()));
        }
    }

    fn wind_down(&self, ctx: &mut OperatorContext) {
        let repeats = if self.behavior.repeat_helpers { 3 } else { 1 };
        for _ in 0..repeats {
            ctx.no_more_input();
            ctx.no_more_output();
            ctx.finish();
        }
        self.lifecycle("finish", ctx);
    }
}

impl Operator for Recorder {
    fn on_connect(&mut self, ctx: &mut OperatorContext) -> anyhow::Result<()> {
        self.report(Seen::Connected(self.index));
        self.lifecycle("connect", ctx);
        Ok(())
    }

    fn on_start(&mut self, ctx: &mut OperatorContext) -> anyhow::Result<()> {
        self.report(Seen::Started(self.index));
        self.lifecycle("start", ctx);
        if self.behavior.finish_on_start {
            self.wind_down(ctx);
        }
        Ok(())
    }

    fn on_push(&mut self, ctx: &mut OperatorContext, payload: Payload) -> anyhow::Result<()> {
        if self.behavior.fail_on_push {
            anyhow::bail!("recorder #{} refuses input", self.index);
        }
        assert!(!self.behavior.panic_on_push, "recorder #{} blew up", self.index);
        self.report(Seen::Pushed(self.index, payload.len()));
        self.lifecycle("push", ctx);
        ctx.push(payload);
        if self.behavior.hold_pushes {
            ctx.defer_ack();
        }
        Ok(())
    }

    fn on_pull(&mut self, ctx: &mut OperatorContext, items: u64) -> anyhow::Result<()> {
        if self.behavior.hold_pushes {
            ctx.release(AckKind::Push);
        } else {
            ctx.pull(items);
        }
        Ok(())
    }

    fn serialize(&self) -> anyhow::Result<Bytes> {
        if self.behavior.record_state {
            Ok(Bytes::from(format!("recorder-{}", self.index)))
        } else {
            Ok(Bytes::new())
        }
    }

    fn on_persist(
        &mut self,
        ctx: &mut OperatorContext,
        checkpoint: Checkpoint,
    ) -> anyhow::Result<()> {
        self.report(Seen::Persisted(self.index, checkpoint.epoch()));
        self.lifecycle("persist", ctx);
        let state = self.serialize()?;
        ctx.checkpoint(checkpoint, state)
    }

    fn on_commit(
        &mut self,
        _ctx: &mut OperatorContext,
        checkpoint: Checkpoint,
    ) -> anyhow::Result<()> {
        self.report(Seen::Committed(self.index, checkpoint.epoch()));
        Ok(())
    }

    fn on_done(&mut self, ctx: &mut OperatorContext) -> anyhow::Result<()> {
        self.report(Seen::Done(self.index));
        self.wind_down(ctx);
        Ok(())
    }

    fn on_stop(&mut self, ctx: &mut OperatorContext) -> anyhow::Result<()> {
        self.report(Seen::Stopped(self.index));
        if !self.behavior.ignore_stop {
            self.wind_down(ctx);
        }
        Ok(())
    }

    fn on_exit(&mut self, reason: &ExitReason) {
        self.report(Seen::Exited(self.index, reason.to_string()));
    }
}

/// Plan of `len` recorders; `behavior` picks the knobs per index.
pub fn recorder_plan(
    id: &str,
    len: usize,
    behavior: impl Fn(usize) -> Behavior,
) -> (OperatorPlan, mpsc::UnboundedReceiver<Seen>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let operators = (0..len)
        .map(|index| {
            let seen = tx.clone();
            let behavior = behavior(index);
            factory_fn(format!("recorder{index}"), move |_restore| {
                Ok(Box::new(Recorder {
                    index,
                    behavior,
                    seen: seen.clone(),
                }) as Box<dyn Operator>)
            })
        })
        .collect();
    (OperatorPlan::new(id, operators), rx)
}

/// Next event matching `pred`, skipping others.
pub async fn next_matching(
    rx: &mut mpsc::UnboundedReceiver<Seen>,
    pred: impl Fn(&Seen) -> bool,
) -> Seen {
    tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Some(seen) if pred(&seen) => return seen,
                Some(_) => {}
                None => panic!("recorder channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for recorder event")
}

/// Everything already queued.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<Seen>) -> Vec<Seen> {
    let mut out = Vec::new();
    while let Ok(seen) = rx.try_recv() {
        out.push(seen);
    }
    out
}

/// A request that reached the test owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observed {
    pub from: ActorId,
    pub kind: &'static str,
    pub epoch: Option<u64>,
}

/// Chain owner backed by a plain mailbox. Acknowledges everything.
pub struct TestOwner {
    pub actor: ActorRef,
    pub observed: mpsc::UnboundedReceiver<Observed>,
}

impl TestOwner {
    pub fn spawn() -> Self {
        let (actor, mut mailbox) = actor::mailbox("test-owner");
        let (tx, observed) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(envelope) = mailbox.requests.recv().await {
                let epoch = match &envelope.request {
                    Request::Persist(cp) | Request::Commit(cp) => Some(cp.epoch()),
                    _ => None,
                };
                let _ = tx.send(Observed {
                    from: envelope.from,
                    kind: envelope.request.kind(),
                    epoch,
                });
                envelope.reply.ok();
            }
        });
        Self { actor, observed }
    }

    /// Descriptor that makes this owner both boundary ports and coordinator.
    pub fn descriptor(&self) -> ConnectionDescriptor {
        ConnectionDescriptor {
            upstream: None,
            downstream: None,
            checkpoint_sink: spawn_checkpoint_sink(Arc::new(MemoryCheckpointStore::new())),
            coordinator: self.actor.clone(),
        }
    }

    pub async fn next_of(&mut self, kind: &str) -> Observed {
        tokio::time::timeout(WAIT, async {
            loop {
                match self.observed.recv().await {
                    Some(obs) if obs.kind == kind => return obs,
                    Some(_) => {}
                    None => panic!("owner channel closed"),
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {kind}"))
    }

    pub fn drain(&mut self) -> Vec<Observed> {
        let mut out = Vec::new();
        while let Ok(obs) = self.observed.try_recv() {
            out.push(obs);
        }
        out
    }
}

/// One-column `Int64` batch.
pub fn seq_batch(values: impl IntoIterator<Item = i64>) -> Payload {
    let schema = Arc::new(Schema::new(vec![Field::new("seq", DataType::Int64, false)]));
    let values: Vec<i64> = values.into_iter().collect();
    RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(values))])
        .expect("valid batch")
        .into()
}

/// All `seq` values across `batches`, in order.
pub fn seq_values(batches: &[Payload]) -> Vec<i64> {
    batches
        .iter()
        .filter_map(Payload::as_events)
        .flat_map(|batch| {
            batch
                .column(0)
                .as_any()
                .downcast_ref::<Int64Array>()
                .expect("seq column")
                .values()
                .to_vec()
        })
        .collect()
}
