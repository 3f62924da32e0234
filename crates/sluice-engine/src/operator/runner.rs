//! Operator task: one mailbox, one hook per message, fault boundary.

use std::panic::AssertUnwindSafe;

use futures::{FutureExt, StreamExt};
use sluice_types::state::OperatorIndex;

use crate::actor::{Envelope, ExitSignal, Mailbox, Request};
use crate::error::{panic_message, EngineError, ExitReason};
use crate::operator::context::{OperatorContext, OperatorEvent};
use crate::operator::{AckKind, Operator};

/// Run `operator` until an exit signal or a fault, catching panics.
///
/// Faults are logged here, once; owners only wrap the returned reason.
pub(crate) async fn operator_task(
    operator: Box<dyn Operator>,
    ctx: OperatorContext,
    mailbox: Mailbox,
) -> (OperatorIndex, ExitReason) {
    let index = ctx.index();
    let pipeline = ctx.pipeline().clone();
    let name = ctx.name().to_string();
    let reason = match AssertUnwindSafe(run_operator(operator, ctx, mailbox))
        .catch_unwind()
        .await
    {
        Ok(reason) => reason,
        Err(payload) => {
            let msg = panic_message(payload.as_ref());
            tracing::error!(
                pipeline = %pipeline,
                operator = %index,
                name = %name,
                panic = %msg,
                "Operator panicked"
            );
            ExitReason::Failed(EngineError::Panicked(msg))
        }
    };
    (index, reason)
}

async fn run_operator(
    mut operator: Box<dyn Operator>,
    mut ctx: OperatorContext,
    mut mailbox: Mailbox,
) -> ExitReason {
    loop {
        ctx.flush();
        let step = tokio::select! {
            biased;
            Some(signal) = mailbox.exits.recv() => {
                let reason = match signal {
                    ExitSignal::Requested => ExitReason::Requested,
                    ExitSignal::Kill => ExitReason::Killed,
                };
                return exit(operator.as_mut(), &mut ctx, reason);
            }
            Some(event) = ctx.pending.next(), if !ctx.pending.is_empty() => {
                handle_event(operator.as_mut(), &mut ctx, event)
            }
            envelope = mailbox.requests.recv() => match envelope {
                Some(envelope) => handle_request(operator.as_mut(), &mut ctx, envelope),
                None => return exit(operator.as_mut(), &mut ctx, ExitReason::Normal),
            },
        };
        if let Err(err) = step {
            tracing::error!(
                pipeline = %ctx.pipeline(),
                operator = %ctx.index(),
                name = %ctx.name(),
                error = %err,
                "Operator failed"
            );
            return exit(operator.as_mut(), &mut ctx, ExitReason::Failed(err));
        }
    }
}

fn exit(operator: &mut dyn Operator, ctx: &mut OperatorContext, reason: ExitReason) -> ExitReason {
    ctx.mark_terminated();
    operator.on_exit(&reason);
    tracing::debug!(
        pipeline = %ctx.pipeline(),
        operator = %ctx.index(),
        reason = %reason,
        "Operator exited"
    );
    reason
}

fn handle_request(
    operator: &mut dyn Operator,
    ctx: &mut OperatorContext,
    envelope: Envelope,
) -> Result<(), EngineError> {
    let Envelope { request, reply, .. } = envelope;
    match request {
        Request::Connect(descriptor) => {
            if ctx.descriptor().is_some() {
                reply.fail(EngineError::protocol(format!(
                    "operator #{} connected twice",
                    ctx.index()
                )));
                return Ok(());
            }
            ctx.install(descriptor);
            operator.on_connect(ctx).map_err(EngineError::Operator)?;
            reply.ok();
        }
        Request::Start => {
            if ctx.start_received {
                reply.fail(EngineError::protocol(format!(
                    "operator #{} received a second start",
                    ctx.index()
                )));
                return Ok(());
            }
            if ctx.descriptor().is_none() {
                reply.fail(EngineError::protocol(format!(
                    "operator #{} started before connect",
                    ctx.index()
                )));
                return Ok(());
            }
            ctx.mark_started();
            ctx.begin(AckKind::Start, reply);
            operator.on_start(ctx).map_err(EngineError::Operator)?;
            ctx.settle();
        }
        Request::Push(payload) => {
            if ctx.is_input_closed() {
                tracing::trace!(
                    pipeline = %ctx.pipeline(),
                    operator = %ctx.index(),
                    "Ignoring push after no_more_input"
                );
                reply.ok();
                return Ok(());
            }
            ctx.begin(AckKind::Push, reply);
            operator
                .on_push(ctx, payload)
                .map_err(EngineError::Operator)?;
            ctx.settle();
        }
        Request::Pull(items) => {
            if ctx.is_output_closed() {
                reply.ok();
                return Ok(());
            }
            ctx.begin(AckKind::Pull, reply);
            operator
                .on_pull(ctx, items)
                .map_err(EngineError::Operator)?;
            ctx.settle();
        }
        Request::Persist(checkpoint) => {
            reply.ok();
            ctx.begin_persist(checkpoint);
            operator
                .on_persist(ctx, checkpoint)
                .map_err(EngineError::Operator)?;
            if let Some(open) = ctx.take_unforwarded() {
                return Err(EngineError::protocol(format!(
                    "operator #{} did not forward {open}",
                    ctx.index()
                )));
            }
        }
        Request::Commit(checkpoint) => {
            operator
                .on_commit(ctx, checkpoint)
                .map_err(EngineError::Operator)?;
            reply.ok();
        }
        Request::Done => {
            reply.ok();
            if !ctx.upstream_done {
                ctx.upstream_done = true;
                operator.on_done(ctx).map_err(EngineError::Operator)?;
            }
        }
        Request::Stop => {
            reply.ok();
            if !ctx.downstream_stopped {
                ctx.downstream_stopped = true;
                operator.on_stop(ctx).map_err(EngineError::Operator)?;
            }
        }
        Request::Shutdown => {
            reply.fail(EngineError::protocol(format!(
                "operator #{} does not coordinate shutdown",
                ctx.index()
            )));
        }
    }
    Ok(())
}

fn handle_event(
    operator: &mut dyn Operator,
    ctx: &mut OperatorContext,
    event: OperatorEvent,
) -> Result<(), EngineError> {
    match event {
        OperatorEvent::Link(ack) => {
            if let Some(link) = ctx.link_mut(ack.side) {
                link.acknowledged();
            }
            match (ack.on_ack, ack.result) {
                (Some(responder), result) => responder.send(result),
                (None, Ok(())) => {}
                // A neighbour that went away is the chain's failure to report.
                (None, Err(EngineError::Unavailable(target))) => {
                    tracing::debug!(
                        pipeline = %ctx.pipeline(),
                        operator = %ctx.index(),
                        request = ack.request,
                        target = %target,
                        "Neighbour gone, waiting for teardown"
                    );
                }
                (None, Err(err)) => {
                    return Err(EngineError::request_failed(ack.request, &ack.target, err));
                }
            }
        }
        OperatorEvent::StateRecorded { checkpoint, result } => {
            result?;
            ctx.release_barrier(checkpoint);
        }
        OperatorEvent::Wake => {
            operator.on_wake(ctx).map_err(EngineError::Operator)?;
        }
        OperatorEvent::ShutdownNoticed(result) => {
            if let Err(err) = result {
                let coordinator = ctx.coordinator_name();
                return Err(EngineError::request_failed("shutdown", &coordinator, err));
            }
        }
    }
    Ok(())
}
