//! Built-in operators and plan construction from a parsed definition.

mod collect;
mod generate;
mod head;

use std::sync::Arc;

use anyhow::{bail, Context};
use bytes::Bytes;

pub use collect::{Collect, CollectHandle};
pub use generate::Generate;
pub use head::Head;

use crate::config::{OperatorConfig, PipelineConfig};
use crate::operator::{factory_fn, OperatorFactory, OperatorPlan};

/// Build the operator plan for `config`.
///
/// Returns the collect handle when the chain ends in `collect`.
#[must_use]
pub fn build_plan(config: &PipelineConfig) -> (OperatorPlan, Option<CollectHandle>) {
    let mut sink = None;
    let operators = config
        .operators
        .iter()
        .map(|operator| factory(operator, &mut sink))
        .collect();
    (
        OperatorPlan::new(config.pipeline.as_str(), operators),
        sink,
    )
}

fn factory(config: &OperatorConfig, sink: &mut Option<CollectHandle>) -> Arc<dyn OperatorFactory> {
    match *config {
        OperatorConfig::Generate {
            batches,
            rows_per_batch,
            pace_ms,
        } => factory_fn("generate", move |restore| {
            Ok(Box::new(Generate::new(batches, rows_per_batch, pace_ms, restore)?) as _)
        }),
        OperatorConfig::Head { count } => factory_fn("head", move |restore| {
            Ok(Box::new(Head::new(count, restore)?) as _)
        }),
        OperatorConfig::Collect {
            batch_rows,
            buffer_rows,
        } => {
            let handle = CollectHandle::default();
            *sink = Some(handle.clone());
            factory_fn("collect", move |restore| {
                Ok(Box::new(Collect::new(batch_rows, buffer_rows, handle.clone(), restore)?) as _)
            })
        }
    }
}

/// Decode a counter persisted with [`encode_counter`].
pub(crate) fn decode_counter(name: &str, restore: Option<Bytes>) -> anyhow::Result<Option<u64>> {
    let Some(bytes) = restore else {
        return Ok(None);
    };
    let raw: [u8; 8] = bytes
        .as_ref()
        .try_into()
        .with_context(|| format!("{name}: expected 8 checkpoint bytes, got {}", bytes.len()))?;
    Ok(Some(u64::from_le_bytes(raw)))
}

pub(crate) fn encode_counter(value: u64) -> Bytes {
    Bytes::copy_from_slice(&value.to_le_bytes())
}

pub(crate) fn rows(len: usize) -> u64 {
    u64::try_from(len).unwrap_or(u64::MAX)
}

pub(crate) fn ensure_nonzero(name: &str, field: &str, value: u64) -> anyhow::Result<()> {
    if value == 0 {
        bail!("{name}: {field} must be at least 1");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parser::parse_pipeline_str;

    #[test]
    fn counter_roundtrip_and_bad_length() {
        assert_eq!(
            decode_counter("head", Some(encode_counter(42))).unwrap(),
            Some(42)
        );
        assert_eq!(decode_counter("head", None).unwrap(), None);
        let err = decode_counter("head", Some(Bytes::from_static(b"abc"))).unwrap_err();
        assert!(err.to_string().contains("expected 8 checkpoint bytes"));
    }

    #[test]
    fn build_plan_follows_definition_order() {
        let config = parse_pipeline_str(
            r#"
version: "1.0"
pipeline: plan_order
operators:
  - use: generate
    batches: 1
  - use: head
    count: 1
  - use: collect
"#,
        )
        .unwrap();
        let (plan, sink) = build_plan(&config);
        assert_eq!(plan.id.as_str(), "plan_order");
        let names: Vec<&str> = plan.operators.iter().map(|f| f.name()).collect();
        assert_eq!(names, ["generate", "head", "collect"]);
        assert!(sink.is_some());
    }
}
