//! Ordered outbox from one actor to one neighbour.
//!
//! A link keeps at most one request unacknowledged. Everything queued
//! behind it waits, which gives per-link FIFO delivery and lets a receiver
//! exert backpressure simply by holding its reply. A checkpoint barrier
//! holds its slot in the queue until the sender's own state has been
//! recorded; nothing queued after it can overtake it.

use std::collections::VecDeque;

use futures::future::BoxFuture;
use futures::FutureExt;
use sluice_types::checkpoint::Checkpoint;

use crate::actor::{ActorId, ActorRef, Reply, Request, Responder};

/// Which neighbour a link points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    Upstream,
    Downstream,
    /// Chain owner towards its first operator.
    ChainHead,
    /// Chain owner towards its last operator.
    ChainTail,
}

enum Outgoing {
    Request {
        request: Request,
        on_ack: Option<Responder>,
    },
    Barrier(Checkpoint),
}

/// Completion of one link request.
pub(crate) struct LinkAck {
    pub side: Side,
    pub request: &'static str,
    pub target: String,
    /// Original requester when this link proxies someone else's request.
    pub on_ack: Option<Responder>,
    pub result: Reply,
}

pub(crate) struct Link {
    side: Side,
    from: ActorId,
    target: ActorRef,
    queue: VecDeque<Outgoing>,
    in_flight: bool,
}

impl Link {
    pub fn new(side: Side, from: ActorId, target: ActorRef) -> Self {
        Self {
            side,
            from,
            target,
            queue: VecDeque::new(),
            in_flight: false,
        }
    }

    pub fn target(&self) -> &ActorRef {
        &self.target
    }

    pub fn enqueue(&mut self, request: Request) {
        self.queue.push_back(Outgoing::Request {
            request,
            on_ack: None,
        });
    }

    /// Queue a request on behalf of another actor; its reply is relayed.
    pub fn proxy(&mut self, request: Request, on_ack: Responder) {
        self.queue.push_back(Outgoing::Request {
            request,
            on_ack: Some(on_ack),
        });
    }

    pub fn enqueue_barrier(&mut self, checkpoint: Checkpoint) {
        self.queue.push_back(Outgoing::Barrier(checkpoint));
    }

    /// Turn the barrier for `checkpoint` into the `persist` it stands for.
    pub fn release_barrier(&mut self, checkpoint: Checkpoint) -> bool {
        for slot in &mut self.queue {
            if matches!(slot, Outgoing::Barrier(cp) if *cp == checkpoint) {
                *slot = Outgoing::Request {
                    request: Request::Persist(checkpoint),
                    on_ack: None,
                };
                return true;
            }
        }
        false
    }

    /// Send the next queued request if the link is free.
    pub fn dispatch(&mut self) -> Option<BoxFuture<'static, LinkAck>> {
        if self.in_flight || !matches!(self.queue.front(), Some(Outgoing::Request { .. })) {
            return None;
        }
        let Some(Outgoing::Request { request, on_ack }) = self.queue.pop_front() else {
            return None;
        };
        self.in_flight = true;
        let side = self.side;
        let kind = request.kind();
        let target = self.target.name().to_string();
        let reply = self.target.request(self.from, request);
        Some(
            reply
                .map(move |result| LinkAck {
                    side,
                    request: kind,
                    target,
                    on_ack,
                    result,
                })
                .boxed(),
        )
    }

    pub fn acknowledged(&mut self) {
        self.in_flight = false;
    }

    /// Nothing queued and nothing awaiting a reply.
    pub fn is_idle(&self) -> bool {
        !self.in_flight && self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::mailbox;

    #[tokio::test]
    async fn one_request_in_flight_at_a_time() {
        let (target, mut mb) = mailbox("peer");
        let mut link = Link::new(Side::Downstream, ActorId::EXTERNAL, target);
        link.enqueue(Request::Pull(1));
        link.enqueue(Request::Done);

        let first = link.dispatch().unwrap();
        assert!(link.dispatch().is_none());

        let env = mb.requests.recv().await.unwrap();
        assert_eq!(env.request.kind(), "pull");
        env.reply.ok();
        let ack = first.await;
        assert!(ack.result.is_ok());
        assert_eq!(ack.side, Side::Downstream);
        link.acknowledged();

        assert!(link.dispatch().is_some());
        assert_eq!(mb.requests.recv().await.unwrap().request.kind(), "done");
    }

    #[tokio::test]
    async fn barrier_blocks_until_released() {
        let (target, mut mb) = mailbox("peer");
        let mut link = Link::new(Side::Downstream, ActorId::EXTERNAL, target);
        let cp = Checkpoint::new(4);
        link.enqueue_barrier(cp);
        link.enqueue(Request::Done);

        assert!(link.dispatch().is_none());
        assert!(!link.is_idle());
        assert!(link.release_barrier(cp));

        let ack = link.dispatch().unwrap();
        let env = mb.requests.recv().await.unwrap();
        assert!(matches!(env.request, Request::Persist(c) if c == cp));
        env.reply.ok();
        ack.await;
        link.acknowledged();

        assert!(link.dispatch().is_some());
        assert_eq!(mb.requests.recv().await.unwrap().request.kind(), "done");
    }

    #[tokio::test]
    async fn proxied_reply_is_carried_back() {
        let (target, mut mb) = mailbox("peer");
        let mut link = Link::new(Side::ChainTail, ActorId::EXTERNAL, target);
        let (tx, rx) = tokio::sync::oneshot::channel();
        link.proxy(Request::Stop, Responder(tx));

        let ack = link.dispatch().unwrap();
        mb.requests.recv().await.unwrap().reply.ok();
        let ack = ack.await;
        ack.on_ack.unwrap().send(ack.result);
        assert!(rx.await.unwrap().is_ok());
    }
}
