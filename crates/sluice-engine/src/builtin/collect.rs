//! `collect`: the terminal sink, delivering batches to an in-process
//! [`CollectHandle`].
//!
//! Rows are held until the checkpoint round that covers them commits, or
//! until upstream reports done. With `buffer_rows` set the sink stops asking
//! for more once that many uncommitted rows are held.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use sluice_types::checkpoint::Checkpoint;
use sluice_types::payload::Payload;

use crate::builtin::{decode_counter, encode_counter, ensure_nonzero, rows};
use crate::operator::{AckKind, Operator, OperatorContext};

#[derive(Debug, Default)]
struct Delivered {
    batches: Vec<Payload>,
    rows: u64,
}

/// Read side of a `collect` sink. Clones share the same delivery log.
#[derive(Debug, Clone, Default)]
pub struct CollectHandle {
    inner: Arc<Mutex<Delivered>>,
}

impl CollectHandle {
    fn lock(&self) -> MutexGuard<'_, Delivered> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn deliver(&self, batches: impl IntoIterator<Item = Payload>) {
        let mut delivered = self.lock();
        for payload in batches {
            delivered.rows += rows(payload.len());
            delivered.batches.push(payload);
        }
    }

    /// Rows delivered by this process.
    #[must_use]
    pub fn rows(&self) -> u64 {
        self.lock().rows
    }

    /// Snapshot of the delivered batches, in arrival order.
    #[must_use]
    pub fn batches(&self) -> Vec<Payload> {
        self.lock().batches.clone()
    }
}

pub struct Collect {
    batch_rows: u64,
    buffer_rows: Option<u64>,
    handle: CollectHandle,
    /// Accepted since the last barrier.
    open: Vec<Payload>,
    /// Sealed at a barrier, waiting for that round to commit.
    sealed: Vec<(Checkpoint, Vec<Payload>)>,
    uncommitted_rows: u64,
    /// Rows accepted across all runs of this pipeline.
    accepted: u64,
    waiting_for_commit: bool,
}

impl Collect {
    /// # Errors
    ///
    /// Fails on a zero batch or buffer size, or undecodable restore bytes.
    pub fn new(
        batch_rows: usize,
        buffer_rows: Option<usize>,
        handle: CollectHandle,
        restore: Option<Bytes>,
    ) -> anyhow::Result<Self> {
        ensure_nonzero("collect", "batch_rows", rows(batch_rows))?;
        if let Some(buffer) = buffer_rows {
            ensure_nonzero("collect", "buffer_rows", rows(buffer))?;
        }
        let accepted = decode_counter("collect", restore)?.unwrap_or(0);
        Ok(Self {
            batch_rows: rows(batch_rows),
            buffer_rows: buffer_rows.map(rows),
            handle,
            open: Vec::new(),
            sealed: Vec::new(),
            uncommitted_rows: 0,
            accepted,
            waiting_for_commit: false,
        })
    }

    /// Rows accepted so far, including before a restore.
    #[must_use]
    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    fn buffer_full(&self) -> bool {
        self.buffer_rows
            .is_some_and(|limit| self.uncommitted_rows >= limit)
    }

    fn publish_through(&mut self, checkpoint: Checkpoint) {
        let split = self
            .sealed
            .iter()
            .position(|(sealed_at, _)| *sealed_at > checkpoint)
            .unwrap_or(self.sealed.len());
        for (_, batches) in self.sealed.drain(..split) {
            self.uncommitted_rows -= batches.iter().map(|p| rows(p.len())).sum::<u64>();
            self.handle.deliver(batches);
        }
    }
}

impl Operator for Collect {
    fn on_start(&mut self, ctx: &mut OperatorContext) -> anyhow::Result<()> {
        ctx.pull(self.batch_rows);
        Ok(())
    }

    fn on_push(&mut self, ctx: &mut OperatorContext, payload: Payload) -> anyhow::Result<()> {
        let len = rows(payload.len());
        self.accepted += len;
        self.open.push(payload);
        self.uncommitted_rows += len;
        if !self.buffer_full() {
            ctx.pull(self.batch_rows);
            return Ok(());
        }
        // Only hold the ack while a sealed round is pending; its commit releases it.
        if !self.sealed.is_empty() {
            ctx.defer_ack();
        }
        self.waiting_for_commit = true;
        tracing::debug!(
            pipeline = %ctx.pipeline(),
            operator = %ctx.index(),
            uncommitted_rows = self.uncommitted_rows,
            "Collect buffer full, waiting for commit"
        );
        Ok(())
    }

    fn on_pull(&mut self, _ctx: &mut OperatorContext, _items: u64) -> anyhow::Result<()> {
        Ok(())
    }

    fn serialize(&self) -> anyhow::Result<Bytes> {
        Ok(encode_counter(self.accepted))
    }

    fn on_persist(
        &mut self,
        ctx: &mut OperatorContext,
        checkpoint: Checkpoint,
    ) -> anyhow::Result<()> {
        let open = std::mem::take(&mut self.open);
        if !open.is_empty() {
            self.sealed.push((checkpoint, open));
        }
        ctx.checkpoint(checkpoint, self.serialize()?)
    }

    fn on_commit(
        &mut self,
        ctx: &mut OperatorContext,
        checkpoint: Checkpoint,
    ) -> anyhow::Result<()> {
        self.publish_through(checkpoint);
        // The next barrier is queued behind a held push.
        ctx.release(AckKind::Push);
        if self.waiting_for_commit && !self.buffer_full() {
            self.waiting_for_commit = false;
            ctx.pull(self.batch_rows);
        }
        Ok(())
    }

    fn on_done(&mut self, ctx: &mut OperatorContext) -> anyhow::Result<()> {
        for (_, batches) in self.sealed.drain(..) {
            self.handle.deliver(batches);
        }
        self.handle.deliver(self.open.drain(..));
        self.uncommitted_rows = 0;
        ctx.finish();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::record_batch::RecordBatch;

    use super::*;

    fn batch(n: i64) -> Payload {
        let schema = Arc::new(Schema::new(vec![Field::new("seq", DataType::Int64, false)]));
        let values: Vec<i64> = (0..n).collect();
        RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(values))])
            .unwrap()
            .into()
    }

    #[test]
    fn publish_through_releases_only_committed_rounds() {
        let handle = CollectHandle::default();
        let mut sink = Collect::new(4, Some(100), handle.clone(), None).unwrap();
        sink.sealed.push((Checkpoint::new(1), vec![batch(3)]));
        sink.sealed.push((Checkpoint::new(2), vec![batch(2), batch(2)]));
        sink.uncommitted_rows = 7;

        sink.publish_through(Checkpoint::new(1));
        assert_eq!(handle.rows(), 3);
        assert_eq!(sink.uncommitted_rows, 4);

        sink.publish_through(Checkpoint::new(2));
        assert_eq!(handle.rows(), 7);
        assert_eq!(handle.batches().len(), 3);
        assert!(sink.sealed.is_empty());
    }

    #[test]
    fn restore_continues_accepted_count() {
        let sink = Collect::new(4, None, CollectHandle::default(), Some(encode_counter(12))).unwrap();
        assert_eq!(sink.accepted(), 12);
        assert_eq!(sink.serialize().unwrap(), encode_counter(12));
    }

    #[test]
    fn zero_buffer_rejected() {
        assert!(Collect::new(4, Some(0), CollectHandle::default(), None).is_err());
    }
}
