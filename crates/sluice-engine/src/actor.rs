//! Actor plumbing shared by operators, subpipelines and pipelines.
//!
//! Every actor owns a [`Mailbox`] with two queues: protocol requests and
//! exit signals. Requests carry a [`Responder`]; the requester holds the
//! matching future and resumes when the reply arrives, so no actor ever
//! blocks waiting on another. Exit signals are polled first.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use sluice_types::checkpoint::Checkpoint;
use sluice_types::payload::Payload;
use tokio::sync::{mpsc, oneshot};

use crate::connection::ConnectionDescriptor;
use crate::error::EngineError;

static NEXT_ACTOR_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique actor identity, used to attribute requests to senders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActorId(u64);

impl ActorId {
    /// Sender identity for requests issued from outside any actor (hosts, tests).
    pub const EXTERNAL: ActorId = ActorId(0);

    fn next() -> Self {
        Self(NEXT_ACTOR_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ActorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "actor#{}", self.0)
    }
}

/// The closed set of protocol messages.
#[derive(Debug)]
pub enum Request {
    /// Deliver the neighbour handles. Sent exactly once, before `Start`.
    Connect(ConnectionDescriptor),
    Start,
    /// A full checkpoint round has been made durable.
    Commit(Checkpoint),
    Push(Payload),
    /// Downstream demand for roughly this many rows.
    Pull(u64),
    /// Checkpoint barrier travelling front to back.
    Persist(Checkpoint),
    /// Upstream has no more data.
    Done,
    /// Downstream wants no more data.
    Stop,
    /// Sender is ready to shut down. Addressed to a coordinator.
    Shutdown,
}

impl Request {
    /// Short name used in logs and errors.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connect(_) => "connect",
            Self::Start => "start",
            Self::Commit(_) => "commit",
            Self::Push(_) => "push",
            Self::Pull(_) => "pull",
            Self::Persist(_) => "persist",
            Self::Done => "done",
            Self::Stop => "stop",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Answer to a [`Request`].
pub type Reply = Result<(), EngineError>;

/// One-shot reply channel attached to every request.
#[derive(Debug)]
pub struct Responder(pub(crate) oneshot::Sender<Reply>);

impl Responder {
    /// Answer the request. A requester that went away is ignored.
    pub fn send(self, reply: Reply) {
        let _ = self.0.send(reply);
    }

    pub fn ok(self) {
        self.send(Ok(()));
    }

    pub fn fail(self, err: EngineError) {
        self.send(Err(err));
    }
}

/// A request plus its sender and reply channel.
#[derive(Debug)]
pub struct Envelope {
    pub from: ActorId,
    pub request: Request,
    pub reply: Responder,
}

/// Out-of-band termination signal, handled before any queued request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitSignal {
    /// Shut down as part of an orderly teardown.
    Requested,
    /// Terminate immediately because a peer failed or the host gave up.
    Kill,
}

/// Cloneable handle to an actor's mailbox.
#[derive(Clone)]
pub struct ActorRef {
    id: ActorId,
    name: Arc<str>,
    requests: mpsc::UnboundedSender<Envelope>,
    exits: mpsc::UnboundedSender<ExitSignal>,
}

impl ActorRef {
    #[must_use]
    pub fn id(&self) -> ActorId {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue `request` now and return a future for the reply.
    ///
    /// The message is in the target's mailbox before this returns, so two
    /// requests issued in sequence arrive in that order even if their
    /// futures are polled out of order.
    pub fn request(&self, from: ActorId, request: Request) -> BoxFuture<'static, Reply> {
        let (tx, rx) = oneshot::channel();
        let sent = self.requests.send(Envelope {
            from,
            request,
            reply: Responder(tx),
        });
        let target = Arc::clone(&self.name);
        async move {
            if sent.is_err() {
                return Err(EngineError::Unavailable(target.to_string()));
            }
            match rx.await {
                Ok(reply) => reply,
                Err(_) => Err(EngineError::Unavailable(target.to_string())),
            }
        }
        .boxed()
    }

    /// Deliver an exit signal. Signals to a terminated actor are dropped.
    pub fn send_exit(&self, signal: ExitSignal) {
        let _ = self.exits.send(signal);
    }
}

impl std::fmt::Debug for ActorRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActorRef")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

/// Receiving side of an actor.
pub struct Mailbox {
    pub requests: mpsc::UnboundedReceiver<Envelope>,
    pub exits: mpsc::UnboundedReceiver<ExitSignal>,
}

/// Create a fresh actor identity with its mailbox.
///
/// Hosts and nested-pipeline operators use this to act as the owner of a
/// chain: pass the returned [`ActorRef`] in a [`ConnectionDescriptor`] and
/// answer the requests that arrive on the [`Mailbox`].
pub fn mailbox(name: impl Into<Arc<str>>) -> (ActorRef, Mailbox) {
    let (req_tx, req_rx) = mpsc::unbounded_channel();
    let (exit_tx, exit_rx) = mpsc::unbounded_channel();
    let actor = ActorRef {
        id: ActorId::next(),
        name: name.into(),
        requests: req_tx,
        exits: exit_tx,
    };
    (
        actor,
        Mailbox {
            requests: req_rx,
            exits: exit_rx,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn request_roundtrip() {
        let (actor, mut mailbox) = mailbox("echo");
        let reply = actor.request(ActorId::EXTERNAL, Request::Start);

        let envelope = mailbox.requests.recv().await.unwrap();
        assert_eq!(envelope.from, ActorId::EXTERNAL);
        assert_eq!(envelope.request.kind(), "start");
        envelope.reply.ok();

        assert!(reply.await.is_ok());
    }

    #[tokio::test]
    async fn requests_are_enqueued_eagerly_in_order() {
        let (actor, mut mailbox) = mailbox("ordered");
        let first = actor.request(ActorId::EXTERNAL, Request::Pull(1));
        let second = actor.request(ActorId::EXTERNAL, Request::Done);
        drop(second);
        drop(first);

        let a = mailbox.requests.recv().await.unwrap();
        let b = mailbox.requests.recv().await.unwrap();
        assert_eq!(a.request.kind(), "pull");
        assert_eq!(b.request.kind(), "done");
    }

    #[tokio::test]
    async fn dropped_responder_means_unavailable() {
        let (actor, mut mailbox) = mailbox("gone");
        let reply = actor.request(ActorId::EXTERNAL, Request::Stop);
        drop(mailbox.requests.recv().await.unwrap());
        assert!(matches!(reply.await, Err(EngineError::Unavailable(name)) if name == "gone"));
    }

    #[tokio::test]
    async fn closed_mailbox_means_unavailable() {
        let (actor, mailbox) = mailbox("closed");
        drop(mailbox);
        let reply = actor.request(ActorId::EXTERNAL, Request::Start).await;
        assert!(matches!(reply, Err(EngineError::Unavailable(_))));
    }

    #[test]
    fn ids_are_unique() {
        let (a, _ma) = mailbox("a");
        let (b, _mb) = mailbox("b");
        assert_ne!(a.id(), b.id());
        assert_ne!(a.id(), ActorId::EXTERNAL);
    }
}
