//! Coordinator reconciliation over the full scheduler + executor stack.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};

use rill_common::{
    BucketId, ControllerConfig, MetricsRegistry, OrgId, SchedulerConfig, TaskId,
};
use rill_kv::MemKv;
use rill_query::{Controller, JsonProgramResolver, Program, ProgramOutput, ReadProgram};
use rill_storage::{Engine, MemEngine, Point, ReadFilterSpec, ReadSpec, StorageReader, TimeBounds};
use rill_task::{
    Clock, Coordinator, Executor, FireExecutor, ManualClock, RunStatus, SchedulableService,
    ScheduleSpec, Scheduler, StaticIdentityService, TaskDescriptor, TaskStatus, TaskStore,
};

const ORG: OrgId = OrgId(1);
const SRC_BUCKET: BucketId = BucketId(10);
const DST_BUCKET: BucketId = BucketId(20);

fn at(rfc3339: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(rfc3339).unwrap().with_timezone(&Utc)
}

struct Stack {
    engine: Arc<MemEngine>,
    store: Arc<TaskStore<MemKv>>,
    coordinator: Coordinator<MemKv>,
    clock: Arc<ManualClock>,
}

fn stack(start: DateTime<Utc>) -> Stack {
    let engine = Arc::new(MemEngine::new());
    engine.open().unwrap();
    let mut tags = BTreeMap::new();
    tags.insert("t0".to_string(), "a".to_string());
    let base = start.timestamp_nanos_opt().unwrap();
    let points: Vec<Point> = (0..4)
        .map(|i| Point::float("m0", tags.clone(), "f0", base + i * 1_000, i as f64))
        .collect();
    engine.write_points(ORG, SRC_BUCKET, points).unwrap();

    let clock = ManualClock::new(start);
    let store = Arc::new(TaskStore::new(Arc::new(MemKv::new())));
    let reader = StorageReader::new(Arc::clone(&engine) as Arc<dyn Engine>);
    let controller = Controller::new(
        ControllerConfig::default(),
        reader,
        MetricsRegistry::new(),
    );
    let executor = Arc::new(Executor::new(
        Arc::clone(&store),
        controller,
        Arc::new(JsonProgramResolver),
        Arc::new(StaticIdentityService),
        Arc::clone(&engine) as Arc<dyn rill_storage::PointsWriter>,
        rill_common::ExecutorConfig::default(),
        Arc::clone(&clock) as Arc<dyn Clock>,
        MetricsRegistry::new(),
    ));
    let scheduler = Arc::new(Scheduler::new(
        SchedulerConfig::default(),
        Arc::clone(&executor) as Arc<dyn FireExecutor>,
        Arc::clone(&store) as Arc<dyn SchedulableService>,
        Arc::clone(&clock) as Arc<dyn Clock>,
        None,
        MetricsRegistry::new(),
    ));
    let coordinator = Coordinator::new(Arc::clone(&store), scheduler, executor);
    Stack {
        engine,
        store,
        coordinator,
        clock,
    }
}

fn copy_task(start: DateTime<Utc>) -> TaskDescriptor {
    let base = start.timestamp_nanos_opt().unwrap();
    let program = ReadProgram::new(
        ReadSpec::Filter(ReadFilterSpec {
            org: ORG,
            bucket: SRC_BUCKET,
            bounds: TimeBounds::new(base, base + 10_000).unwrap(),
            predicate: None,
        }),
        Some(ProgramOutput {
            org: ORG,
            bucket: DST_BUCKET,
        }),
    )
    .source()
    .to_string();
    TaskDescriptor {
        id: TaskId(0),
        org: ORG,
        name: "copy".into(),
        schedule: ScheduleSpec::Every { seconds: 60 },
        offset_secs: 0,
        program,
        status: TaskStatus::Active,
        owner_id: 1,
        created_at: base,
    }
}

async fn wait_for_runs(
    store: &TaskStore<MemKv>,
    task: TaskId,
    want: usize,
) -> Vec<rill_task::Run> {
    for _ in 0..500 {
        let runs = store.list_runs(task).unwrap();
        let terminal = runs.iter().filter(|r| r.status.is_terminal()).count();
        if terminal >= want {
            return runs;
        }
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }
    panic!("task {task} never reached {want} terminal runs");
}

#[tokio::test]
async fn created_tasks_fire_and_record_successful_runs() {
    let t0 = at("2020-01-01T00:00:00Z");
    let stack = stack(t0);
    let task = stack.store.create_task(copy_task(t0)).unwrap();
    stack.coordinator.task_created(&task).unwrap();

    stack.clock.advance(Duration::seconds(61));
    let runs = wait_for_runs(&stack.store, task.id, 1).await;
    assert_eq!(runs[0].status, RunStatus::Success);
    assert_eq!(
        runs[0].scheduled_for,
        at("2020-01-01T00:01:00Z").timestamp_nanos_opt().unwrap()
    );

    // The run's query copied the source points.
    let base = t0.timestamp_nanos_opt().unwrap();
    let written = stack
        .engine
        .read_series(ORG, DST_BUCKET, None, TimeBounds::new(base, base + 10_000).unwrap())
        .unwrap();
    assert_eq!(written.len(), 1);

    // latest_completed never passes latest_scheduled.
    let cursor = stack.store.cursor(task.id).unwrap();
    assert!(cursor.latest_completed <= cursor.latest_scheduled);
    assert_eq!(
        cursor.latest_scheduled,
        at("2020-01-01T00:01:00Z").timestamp_nanos_opt().unwrap()
    );
}

#[tokio::test]
async fn deactivating_a_task_withdraws_it() {
    let t0 = at("2020-01-01T00:00:00Z");
    let stack = stack(t0);
    let task = stack.store.create_task(copy_task(t0)).unwrap();
    stack.coordinator.task_created(&task).unwrap();

    stack.clock.advance(Duration::seconds(61));
    wait_for_runs(&stack.store, task.id, 1).await;

    let mut inactive = task.clone();
    inactive.status = TaskStatus::Inactive;
    stack.store.update_task(&inactive).unwrap();
    stack.coordinator.task_updated(&inactive).unwrap();
    // Give the withdrawal time to land before advancing the clock.
    tokio::time::sleep(StdDuration::from_millis(50)).await;

    stack.clock.advance(Duration::seconds(120));
    tokio::time::sleep(StdDuration::from_millis(200)).await;
    let runs = stack.store.list_runs(task.id).unwrap();
    assert_eq!(runs.len(), 1, "inactive task must not fire");

    // Re-activation re-enrolls with the cursor preserved: the missed
    // fires replay from latest_scheduled, not from creation.
    let mut active = inactive.clone();
    active.status = TaskStatus::Active;
    stack.store.update_task(&active).unwrap();
    stack.coordinator.task_updated(&active).unwrap();

    let runs = wait_for_runs(&stack.store, task.id, 3).await;
    let mut scheduled: Vec<i64> = runs.iter().map(|r| r.scheduled_for).collect();
    let sorted = {
        let mut s = scheduled.clone();
        s.sort();
        s
    };
    assert_eq!(scheduled, sorted, "runs observed in ascending scheduled_for");
    scheduled.dedup();
    assert_eq!(scheduled.len(), runs.len(), "no duplicate fires");
}

#[tokio::test]
async fn repeated_notifications_are_idempotent() {
    let t0 = at("2020-01-01T00:00:00Z");
    let stack = stack(t0);
    let task = stack.store.create_task(copy_task(t0)).unwrap();
    stack.coordinator.task_created(&task).unwrap();
    stack.coordinator.task_updated(&task).unwrap();
    stack.coordinator.task_updated(&task).unwrap();

    stack.clock.advance(Duration::seconds(61));
    wait_for_runs(&stack.store, task.id, 1).await;
    tokio::time::sleep(StdDuration::from_millis(200)).await;
    let runs = stack.store.list_runs(task.id).unwrap();
    assert_eq!(runs.len(), 1, "one fire despite repeated enrolls");
}

#[tokio::test]
async fn replay_existing_enrolls_active_tasks_and_settles_stale_runs() {
    let t0 = at("2020-01-01T00:00:00Z");
    let stack = stack(t0);
    let task = stack.store.create_task(copy_task(t0)).unwrap();
    // A run left over from a previous process, never finished.
    let stale = stack.store.create_run(task.id, 123).unwrap();

    let enrolled = stack.coordinator.replay_existing().unwrap();
    assert_eq!(enrolled, 1);

    let recovered = stack.store.get_run(task.id, stale.id).unwrap();
    assert_eq!(recovered.status, RunStatus::Failed);
    assert!(recovered.error.as_deref().unwrap().contains("not resumable"));

    stack.clock.advance(Duration::seconds(61));
    wait_for_runs(&stack.store, task.id, 2).await;

    stack.coordinator.task_deleted(task.id).unwrap();
}
