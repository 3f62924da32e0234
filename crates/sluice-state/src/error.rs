//! Checkpoint store error types.

/// Errors produced by [`CheckpointStore`](crate::CheckpointStore) operations.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Underlying `SQLite` failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Backend failure annotated with the operation that hit it.
    #[error("{context}: {source}")]
    Backend {
        context: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    /// File-system I/O failure (e.g. creating the database directory).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A commit referenced an epoch that is not newer than the last one.
    #[error("epoch {attempted} is not newer than committed epoch {committed}")]
    StaleCommit { attempted: u64, committed: u64 },

    /// Internal mutex was poisoned by a panicked thread.
    #[error("checkpoint store lock poisoned")]
    LockPoisoned,
}

impl StateError {
    /// Wrap a raw `SQLite` error.
    #[must_use]
    pub fn backend(err: rusqlite::Error) -> Self {
        Self::Sqlite(err)
    }

    /// Wrap a raw `SQLite` error with the failing operation's name.
    #[must_use]
    pub fn backend_context(context: &'static str, err: rusqlite::Error) -> Self {
        Self::Backend {
            context,
            source: err,
        }
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, StateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_error_displays_context() {
        let inner = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(1),
            Some("table not found".into()),
        );
        let err = StateError::backend(inner);
        let msg = err.to_string();
        assert!(msg.contains("sqlite"), "got: {msg}");
    }

    #[test]
    fn backend_context_prefixes_operation() {
        let err = StateError::backend_context("put: execute", rusqlite::Error::InvalidQuery);
        assert!(err.to_string().starts_with("put: execute:"), "got: {err}");
    }

    #[test]
    fn stale_commit_names_both_epochs() {
        let err = StateError::StaleCommit {
            attempted: 2,
            committed: 5,
        };
        assert_eq!(
            err.to_string(),
            "epoch 2 is not newer than committed epoch 5"
        );
    }

    #[test]
    fn lock_poisoned_displays() {
        assert_eq!(
            StateError::LockPoisoned.to_string(),
            "checkpoint store lock poisoned"
        );
    }

    #[test]
    fn io_error_wraps() {
        let inner = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err = StateError::Io(inner);
        assert!(err.to_string().contains("i/o"));
    }
}
