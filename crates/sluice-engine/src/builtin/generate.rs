//! `generate`: a demand-driven source of sequential `Int64` rows.
//!
//! Each pull adds to outstanding demand; the source answers with whole
//! batches until demand is met. With a pace set, a batch is not ready until
//! the pace interval elapsed since the previous one. The not-ready step
//! yields a zero-row batch, and the operator re-polls itself from a timer
//! instead of pushing it.

use std::sync::Arc;
use std::time::Duration;

use arrow::array::Int64Array;
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use sluice_types::payload::Payload;
use tokio::time::Instant;

use crate::builtin::{decode_counter, encode_counter, ensure_nonzero, rows};
use crate::operator::{Operator, OperatorContext};

pub struct Generate {
    schema: SchemaRef,
    batches: u64,
    rows_per_batch: usize,
    pace: Option<Duration>,
    emitted: u64,
    demand: u64,
    next_ready: Option<Instant>,
    wake_armed: bool,
}

impl Generate {
    /// # Errors
    ///
    /// Fails on a zero batch size or undecodable restore bytes.
    pub fn new(
        batches: u64,
        rows_per_batch: usize,
        pace_ms: Option<u64>,
        restore: Option<Bytes>,
    ) -> anyhow::Result<Self> {
        ensure_nonzero("generate", "rows_per_batch", rows(rows_per_batch))?;
        let emitted = decode_counter("generate", restore)?.unwrap_or(0);
        Ok(Self {
            schema: Arc::new(Schema::new(vec![Field::new("seq", DataType::Int64, false)])),
            batches,
            rows_per_batch,
            pace: pace_ms.map(Duration::from_millis),
            emitted,
            demand: 0,
            next_ready: None,
            wake_armed: false,
        })
    }

    /// Batches emitted so far, including before a restore.
    #[must_use]
    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    fn exhausted(&self) -> bool {
        self.emitted >= self.batches
    }

    /// Next batch, or a zero-row batch when the pace has not elapsed.
    fn poll_batch(&mut self, now: Instant) -> anyhow::Result<Payload> {
        if self.next_ready.is_some_and(|ready| now < ready) {
            return Ok(Payload::empty_events(Arc::clone(&self.schema)));
        }
        #[allow(clippy::cast_possible_wrap)]
        let first = (self.emitted * rows(self.rows_per_batch)) as i64;
        let values: Vec<i64> = (first..).take(self.rows_per_batch).collect();
        let batch = RecordBatch::try_new(
            Arc::clone(&self.schema),
            vec![Arc::new(Int64Array::from(values))],
        )?;
        self.emitted += 1;
        self.next_ready = self.pace.map(|pace| now + pace);
        Ok(Payload::Events(batch))
    }

    fn emit(&mut self, ctx: &mut OperatorContext) -> anyhow::Result<()> {
        while self.demand > 0 && !self.exhausted() {
            let payload = self.poll_batch(Instant::now())?;
            if payload.is_empty() {
                if !self.wake_armed {
                    let wait = self
                        .next_ready
                        .map_or(Duration::ZERO, |ready| ready - Instant::now());
                    ctx.wake_after(wait);
                    self.wake_armed = true;
                }
                return Ok(());
            }
            self.demand = self.demand.saturating_sub(rows(payload.len()));
            ctx.push(payload);
        }
        if self.exhausted() {
            ctx.finish();
        }
        Ok(())
    }
}

impl Operator for Generate {
    fn on_start(&mut self, ctx: &mut OperatorContext) -> anyhow::Result<()> {
        if self.exhausted() {
            ctx.finish();
        }
        Ok(())
    }

    fn on_push(&mut self, _ctx: &mut OperatorContext, _payload: Payload) -> anyhow::Result<()> {
        anyhow::bail!("generate is a source and accepts no input")
    }

    fn on_pull(&mut self, ctx: &mut OperatorContext, items: u64) -> anyhow::Result<()> {
        self.demand = self.demand.saturating_add(items);
        self.emit(ctx)
    }

    fn on_wake(&mut self, ctx: &mut OperatorContext) -> anyhow::Result<()> {
        self.wake_armed = false;
        self.emit(ctx)
    }

    fn serialize(&self) -> anyhow::Result<Bytes> {
        Ok(encode_counter(self.emitted))
    }
}
