//! Engine error model and actor exit reasons.

use sluice_state::StateError;
use sluice_types::checkpoint::Checkpoint;
use sluice_types::state::OperatorIndex;

/// Top-level error surfaced to the embedding host.
///
/// Errors nest the way actors do: an operator fault is wrapped by its
/// subpipeline, which is wrapped again by the owning pipeline. The host
/// receives exactly one of these per terminated pipeline.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Operator handler returned an error.
    #[error("operator fault: {0:#}")]
    Operator(anyhow::Error),

    /// Operator task panicked.
    #[error("operator panicked: {0}")]
    Panicked(String),

    /// Actor was killed by an exit signal.
    #[error("killed")]
    Killed,

    /// Actor stopped without being asked to.
    #[error("terminated without a shutdown request")]
    Terminated,

    /// An operator left the chain for a reason other than a requested shutdown.
    #[error("operator #{index} ({name}) exited unexpectedly: {source}")]
    OperatorExited {
        index: OperatorIndex,
        name: String,
        #[source]
        source: Box<EngineError>,
    },

    /// The owned subpipeline failed.
    #[error("subpipeline failed: {0}")]
    Subpipeline(#[source] Box<EngineError>),

    /// A protocol request issued by an actor was answered with an error.
    #[error("{request} request to {target} failed: {source}")]
    RequestFailed {
        request: &'static str,
        target: String,
        #[source]
        source: Box<EngineError>,
    },

    /// A message arrived that the protocol does not allow in this state.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A new checkpoint round reached a chain that is already shutting down.
    /// The round was not started and will never return.
    #[error("{0} dropped, chain is shutting down")]
    RoundDropped(Checkpoint),

    /// The target actor is gone.
    #[error("actor {0} is unavailable")]
    Unavailable(String),

    /// Checkpoint store failure.
    #[error("checkpoint store: {0}")]
    Checkpoint(#[from] StateError),

    /// An operator could not be restored or instantiated.
    #[error("failed to spawn operator #{index} ({name}): {source:#}")]
    Spawn {
        index: OperatorIndex,
        name: String,
        source: anyhow::Error,
    },
}

impl EngineError {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub(crate) fn request_failed(request: &'static str, target: &str, source: EngineError) -> Self {
        Self::RequestFailed {
            request,
            target: target.to_string(),
            source: Box::new(source),
        }
    }
}

/// Why an actor task ended.
#[derive(Debug)]
pub enum ExitReason {
    /// The owner asked the actor to shut down. The only clean exit.
    Requested,
    /// The actor stopped on its own.
    Normal,
    /// The actor was killed by its owner.
    Killed,
    /// The actor failed.
    Failed(EngineError),
}

impl ExitReason {
    #[must_use]
    pub fn is_requested(&self) -> bool {
        matches!(self, Self::Requested)
    }

    /// Convert a non-clean exit into the error that describes it.
    #[must_use]
    pub fn into_error(self) -> EngineError {
        match self {
            Self::Requested | Self::Normal => EngineError::Terminated,
            Self::Killed => EngineError::Killed,
            Self::Failed(err) => err,
        }
    }

    /// `Ok` for a requested exit, the describing error otherwise.
    ///
    /// # Errors
    ///
    /// Returns the wrapped [`EngineError`] for every reason but `Requested`.
    pub fn into_result(self) -> Result<(), EngineError> {
        if self.is_requested() {
            Ok(())
        } else {
            Err(self.into_error())
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Requested => f.write_str("requested"),
            Self::Normal => f.write_str("normal"),
            Self::Killed => f.write_str("killed"),
            Self::Failed(err) => write!(f, "failed: {err}"),
        }
    }
}

/// Best-effort text for a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
