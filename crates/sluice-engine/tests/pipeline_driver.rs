//! Pipeline driver tests over the built-in operators.

mod common;

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use bytes::Bytes;
use common::{recorder_plan, seq_values, Behavior, WAIT};
use sluice_engine::builtin::{build_plan, CollectHandle};
use sluice_engine::config::parser::parse_pipeline_str;
use sluice_engine::config::{PipelineConfig, PipelineSettings};
use sluice_engine::{
    make_pipeline, CheckpointSource, EngineError, ExecCtx, OperatorPlan, PipelineHandle,
};
use sluice_state::error::Result as StateResult;
use sluice_state::{CheckpointStore, MemoryCheckpointStore, SqliteCheckpointStore};
use sluice_types::checkpoint::{Checkpoint, CheckpointRecord};
use sluice_types::state::{OperatorIndex, PipelineId};
use tokio::sync::mpsc;

fn config(yaml: &str) -> PipelineConfig {
    parse_pipeline_str(yaml).expect("test pipeline parses")
}

fn plan(config: &PipelineConfig) -> (OperatorPlan, CollectHandle) {
    let (plan, sink) = build_plan(config);
    (plan, sink.expect("pipeline ends in collect"))
}

async fn finish(handle: PipelineHandle) -> Result<(), EngineError> {
    tokio::time::timeout(WAIT, handle.wait())
        .await
        .expect("pipeline did not exit")
}

fn decode(bytes: &Bytes) -> u64 {
    u64::from_le_bytes(bytes.as_ref().try_into().expect("8-byte counter"))
}

/// Memory store whose writes block until the gate opens.
struct GatedStore {
    inner: MemoryCheckpointStore,
    open: Mutex<bool>,
    opened: Condvar,
    attempts: mpsc::UnboundedSender<(usize, u64)>,
}

impl GatedStore {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(usize, u64)>) {
        let (attempts, rx) = mpsc::unbounded_channel();
        let store = Arc::new(Self {
            inner: MemoryCheckpointStore::new(),
            open: Mutex::new(false),
            opened: Condvar::new(),
            attempts,
        });
        (store, rx)
    }

    fn release(&self) {
        *self.open.lock().unwrap() = true;
        self.opened.notify_all();
    }
}

impl CheckpointStore for GatedStore {
    fn put(&self, record: &CheckpointRecord) -> StateResult<()> {
        let _ = self
            .attempts
            .send((record.operator.get(), record.checkpoint.epoch()));
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.opened.wait(open).unwrap();
        }
        drop(open);
        self.inner.put(record)
    }

    fn commit(&self, pipeline: &PipelineId, checkpoint: Checkpoint) -> StateResult<()> {
        self.inner.commit(pipeline, checkpoint)
    }

    fn discard_uncommitted(&self, pipeline: &PipelineId) -> StateResult<usize> {
        self.inner.discard_uncommitted(pipeline)
    }

    fn get(&self, pipeline: &PipelineId, operator: OperatorIndex) -> StateResult<Option<Bytes>> {
        self.inner.get(pipeline, operator)
    }

    fn last_committed(&self, pipeline: &PipelineId) -> StateResult<Option<Checkpoint>> {
        self.inner.last_committed(pipeline)
    }
}

#[tokio::test]
async fn generate_head_collect_runs_to_completion() {
    let config = config(
        r#"
version: "1.0"
pipeline: e2e_head
settings:
  checkpoints_in_flight: 0
operators:
  - use: generate
    batches: 10
    rows_per_batch: 4
  - use: head
    count: 25
  - use: collect
    batch_rows: 16
"#,
    );
    let (plan, collected) = plan(&config);
    let ctx = ExecCtx::current(Arc::new(MemoryCheckpointStore::new())).unwrap();
    let handle = make_pipeline(plan, config.settings, None, &ctx);

    handle.start().await.unwrap();
    finish(handle).await.unwrap();

    assert_eq!(collected.rows(), 25);
    assert_eq!(seq_values(&collected.batches()), (0..25).collect::<Vec<_>>());
}

#[tokio::test]
async fn checkpointed_run_commits_rounds_and_delivers_everything() {
    let config = config(
        r#"
version: "1.0"
pipeline: e2e_checkpointed
settings:
  checkpoint_interval_ms: 10
  checkpoints_in_flight: 2
operators:
  - use: generate
    batches: 12
    rows_per_batch: 3
    pace_ms: 5
  - use: collect
    batch_rows: 3
    buffer_rows: 9
"#,
    );
    let (plan, collected) = plan(&config);
    let store = Arc::new(MemoryCheckpointStore::new());
    let ctx = ExecCtx::current(store.clone()).unwrap();
    let handle = make_pipeline(plan, config.settings, None, &ctx);

    handle.start().await.unwrap();
    finish(handle).await.unwrap();

    assert_eq!(seq_values(&collected.batches()), (0..36).collect::<Vec<_>>());
    let id = PipelineId::new("e2e_checkpointed");
    assert!(store.last_committed(&id).unwrap().is_some());
}

#[tokio::test]
async fn host_shutdown_lets_the_round_in_flight_finish() {
    let config = config(
        r#"
version: "1.0"
pipeline: scenario_c
settings:
  checkpoint_interval_ms: 10
  checkpoints_in_flight: 1
operators:
  - use: generate
    batches: 100000
    rows_per_batch: 8
    pace_ms: 5
  - use: collect
    batch_rows: 8
"#,
    );
    let (plan, _collected) = plan(&config);
    let (store, mut attempts) = GatedStore::new();
    let ctx = ExecCtx::current(store.clone()).unwrap();
    let handle = make_pipeline(plan, config.settings, None, &ctx);
    handle.start().await.unwrap();

    let first = tokio::time::timeout(WAIT, attempts.recv())
        .await
        .expect("a checkpoint round starts")
        .unwrap();
    assert_eq!(first, (0, 1));

    handle.shutdown().await.unwrap();
    store.release();
    finish(handle).await.unwrap();

    let id = PipelineId::new("scenario_c");
    assert_eq!(store.last_committed(&id).unwrap(), Some(Checkpoint::new(1)));
    let mut epochs = vec![first.1];
    while let Ok((_, epoch)) = attempts.try_recv() {
        epochs.push(epoch);
    }
    assert!(epochs.iter().all(|&e| e == 1), "later rounds started: {epochs:?}");
    assert!(store.get(&id, OperatorIndex::new(0)).unwrap().is_some());
}

#[tokio::test]
async fn killed_pipeline_resumes_from_last_commit() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.db");
    let yaml = r#"
version: "1.0"
pipeline: resumable
settings:
  checkpoint_interval_ms: 15
operators:
  - use: generate
    batches: 40
    rows_per_batch: 2
    pace_ms: 10
  - use: collect
    batch_rows: 2
    buffer_rows: 64
"#;
    let id = PipelineId::new("resumable");

    let config1 = config(yaml);
    let (plan1, first_run) = plan(&config1);
    let store = Arc::new(SqliteCheckpointStore::open(&path).unwrap());
    let ctx = ExecCtx::current(store.clone()).unwrap();
    let handle = make_pipeline(plan1, config1.settings, None, &ctx);
    handle.start().await.unwrap();

    tokio::time::timeout(WAIT, async {
        while store.last_committed(&id).unwrap().is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("a round commits");
    handle.kill();
    assert!(matches!(finish(handle).await, Err(EngineError::Killed)));
    drop(ctx);
    drop(store);

    let store = Arc::new(SqliteCheckpointStore::open(&path).unwrap());
    let committed = store.last_committed(&id).unwrap().unwrap();
    let offset = decode(&store.get(&id, OperatorIndex::new(0)).unwrap().unwrap());
    let resume_from = i64::try_from(offset * 2).unwrap();

    let config2 = config(yaml);
    let (plan2, second_run) = plan(&config2);
    let ctx = ExecCtx::current(store.clone()).unwrap();
    let source = CheckpointSource::new(store.clone());
    let handle = make_pipeline(plan2, config2.settings, Some(source), &ctx);
    handle.start().await.unwrap();
    finish(handle).await.unwrap();

    let before = seq_values(&first_run.batches());
    let after = seq_values(&second_run.batches());
    assert!(before.iter().all(|&v| v < resume_from), "{before:?} past {resume_from}");
    assert_eq!(before, (0..i64::try_from(before.len()).unwrap()).collect::<Vec<_>>());
    assert_eq!(after, (resume_from..80).collect::<Vec<_>>());
    assert!(store.last_committed(&id).unwrap().unwrap() >= committed);
}

#[tokio::test]
async fn epochs_continue_after_the_last_committed_round() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let id = PipelineId::new("epochs");
    store.commit(&id, Checkpoint::new(41)).unwrap();

    let config = config(
        r#"
version: "1.0"
pipeline: epochs
settings:
  checkpoint_interval_ms: 10
operators:
  - use: generate
    batches: 20
    rows_per_batch: 1
    pace_ms: 10
  - use: collect
    batch_rows: 1
"#,
    );
    let (plan, collected) = plan(&config);
    let ctx = ExecCtx::current(store.clone()).unwrap();
    let handle = make_pipeline(plan, config.settings, None, &ctx);
    handle.start().await.unwrap();
    finish(handle).await.unwrap();

    assert_eq!(collected.rows(), 20);
    let last = store.last_committed(&id).unwrap().unwrap();
    assert!(last.epoch() > 41, "epoch went back to {last}");
}

#[tokio::test]
async fn failing_operator_surfaces_one_wrapped_error() {
    let config = config(
        r#"
version: "1.0"
pipeline: bad_restore
operators:
  - use: generate
    batches: 3
  - use: collect
"#,
    );
    let (plan, _collected) = plan(&config);
    let store = Arc::new(MemoryCheckpointStore::new());
    let id = PipelineId::new("bad_restore");
    store
        .put(&CheckpointRecord {
            pipeline: id.clone(),
            operator: OperatorIndex::new(0),
            checkpoint: Checkpoint::new(1),
            state: Bytes::from_static(b"not a counter"),
        })
        .unwrap();
    store.commit(&id, Checkpoint::new(1)).unwrap();

    let ctx = ExecCtx::current(store.clone()).unwrap();
    let handle = make_pipeline(
        plan,
        config.settings,
        Some(CheckpointSource::new(store)),
        &ctx,
    );
    let err = finish(handle).await.unwrap_err();
    match err {
        EngineError::Subpipeline(inner) => {
            assert!(matches!(*inner, EngineError::Spawn { .. }), "got {inner}");
        }
        other => panic!("expected subpipeline failure, got {other}"),
    }
}

#[tokio::test]
async fn rounds_left_by_a_dead_run_are_never_restored() {
    let store = Arc::new(MemoryCheckpointStore::new());
    let id = PipelineId::new("dead_run");
    store.commit(&id, Checkpoint::new(1)).unwrap();
    // A run that died after recording epoch 2 but before committing it.
    store
        .put(&CheckpointRecord {
            pipeline: id.clone(),
            operator: OperatorIndex::new(0),
            checkpoint: Checkpoint::new(2),
            state: Bytes::from_static(b"uncommitted"),
        })
        .unwrap();

    // The new run's operator records nothing, so epoch 2 commits empty.
    let (plan, _seen) = recorder_plan("dead_run", 1, |_| Behavior::default());
    let settings = PipelineSettings {
        checkpoint_interval_ms: 10,
        checkpoints_in_flight: 1,
    };
    let ctx = ExecCtx::current(store.clone()).unwrap();
    let handle = make_pipeline(plan, settings, Some(CheckpointSource::new(store.clone())), &ctx);
    handle.start().await.unwrap();

    tokio::time::timeout(WAIT, async {
        while store.last_committed(&id).unwrap() < Some(Checkpoint::new(2)) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("epoch 2 commits");
    handle.kill();
    assert!(matches!(finish(handle).await, Err(EngineError::Killed)));

    assert_eq!(store.get(&id, OperatorIndex::new(0)).unwrap(), None);
    assert!(!store.recorded_epochs(&id).unwrap().contains(&2));
}
