//! `head`: forward at most `count` rows, then finish.

use bytes::Bytes;
use sluice_types::payload::Payload;

use crate::builtin::{decode_counter, encode_counter, rows};
use crate::operator::{Operator, OperatorContext};

pub struct Head {
    remaining: u64,
}

impl Head {
    /// # Errors
    ///
    /// Fails when `restore` is not a persisted row counter.
    pub fn new(count: u64, restore: Option<Bytes>) -> anyhow::Result<Self> {
        let remaining = decode_counter("head", restore)?.unwrap_or(count);
        Ok(Self { remaining })
    }

    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.remaining
    }
}

fn truncate(payload: Payload, keep: usize) -> Payload {
    match payload {
        Payload::Events(batch) => Payload::Events(batch.slice(0, keep)),
        Payload::Bytes(chunk) => Payload::Bytes(chunk.slice(..keep)),
    }
}

impl Operator for Head {
    fn on_start(&mut self, ctx: &mut OperatorContext) -> anyhow::Result<()> {
        if self.remaining == 0 {
            ctx.finish();
        }
        Ok(())
    }

    fn on_push(&mut self, ctx: &mut OperatorContext, payload: Payload) -> anyhow::Result<()> {
        if self.remaining == 0 {
            return Ok(());
        }
        let len = rows(payload.len());
        if len <= self.remaining {
            self.remaining -= len;
            ctx.push(payload);
        } else {
            let keep = usize::try_from(self.remaining)?;
            self.remaining = 0;
            ctx.push(truncate(payload, keep));
        }
        if self.remaining == 0 {
            ctx.finish();
        }
        Ok(())
    }

    fn on_pull(&mut self, ctx: &mut OperatorContext, items: u64) -> anyhow::Result<()> {
        if self.remaining == 0 {
            ctx.finish();
        } else {
            ctx.pull(items.min(self.remaining));
        }
        Ok(())
    }

    fn serialize(&self) -> anyhow::Result<Bytes> {
        Ok(encode_counter(self.remaining))
    }
}
