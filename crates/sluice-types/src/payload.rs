//! Data moved between operators.
//!
//! A [`Payload`] is either a tabular Arrow batch (events) or a raw byte
//! chunk. Ownership moves to the receiver on every push. A batch with zero
//! rows is the "nothing ready yet" sentinel used by polling sources.

use std::sync::Arc;

use arrow::datatypes::Schema;
use arrow::record_batch::RecordBatch;
use bytes::Bytes;

#[derive(Debug, Clone)]
pub enum Payload {
    /// Tabular batch of events.
    Events(RecordBatch),
    /// Raw, unparsed bytes.
    Bytes(Bytes),
}

impl Payload {
    /// Zero-row batch with the given schema.
    #[must_use]
    pub fn empty_events(schema: Arc<Schema>) -> Self {
        Self::Events(RecordBatch::new_empty(schema))
    }

    /// Number of rows for event batches, number of bytes for chunks.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Events(batch) => batch.num_rows(),
            Self::Bytes(chunk) => chunk.len(),
        }
    }

    /// `true` for the empty sentinel.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn as_events(&self) -> Option<&RecordBatch> {
        match self {
            Self::Events(batch) => Some(batch),
            Self::Bytes(_) => None,
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Bytes(chunk) => Some(chunk),
            Self::Events(_) => None,
        }
    }

    /// Short human-readable kind, used in log fields.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Events(_) => "events",
            Self::Bytes(_) => "bytes",
        }
    }
}

impl From<RecordBatch> for Payload {
    fn from(batch: RecordBatch) -> Self {
        Self::Events(batch)
    }
}

impl From<Bytes> for Payload {
    fn from(chunk: Bytes) -> Self {
        Self::Bytes(chunk)
    }
}
