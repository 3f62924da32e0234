//! Neighbour handles delivered to an operator before it starts.

use crate::actor::ActorRef;
use crate::checkpoint::CheckpointSinkRef;

/// The four handles an operator talks to.
///
/// `upstream` and `downstream` are `None` at the chain boundary: the first
/// operator has no upstream peer and the last has no downstream peer.
/// Messages for a missing neighbour are routed to `coordinator`, the chain
/// owner, which proxies them outward.
#[derive(Debug, Clone)]
pub struct ConnectionDescriptor {
    pub upstream: Option<ActorRef>,
    pub downstream: Option<ActorRef>,
    pub checkpoint_sink: CheckpointSinkRef,
    pub coordinator: ActorRef,
}

impl ConnectionDescriptor {
    /// Actor that receives upstream-bound requests (`pull`, `stop`).
    #[must_use]
    pub fn upstream_target(&self) -> &ActorRef {
        self.upstream.as_ref().unwrap_or(&self.coordinator)
    }

    /// Actor that receives downstream-bound requests (`push`, `persist`, `done`).
    #[must_use]
    pub fn downstream_target(&self) -> &ActorRef {
        self.downstream.as_ref().unwrap_or(&self.coordinator)
    }

    #[must_use]
    pub fn is_chain_head(&self) -> bool {
        self.upstream.is_none()
    }

    #[must_use]
    pub fn is_chain_tail(&self) -> bool {
        self.downstream.is_none()
    }
}
