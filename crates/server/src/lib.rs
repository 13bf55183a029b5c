//! Composition layer: builds the engine, read path, query controller,
//! and task system into one running server.
//!
//! This is deliberately plain wiring. Every component is constructed
//! explicitly with its collaborators injected (one metrics registry, one
//! clock, one memory pool inside the controller); nothing reaches for
//! ambient state. The task CRUD surface here is the thin middleware that
//! keeps the durable store and the coordinator in step.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use rill_common::{BucketId, MetricsRegistry, OrgId, Result, ServerConfig, TaskId};
use rill_kv::MemKv;
use rill_query::{Controller, JsonProgramResolver, Program, Query};
use rill_storage::{Engine, MemEngine, Point, PointsWriter, Predicate, StorageReader, TimeBounds};
use rill_task::{
    Clock, Coordinator, Executor, FireExecutor, SchedulableService, Scheduler, ScheduleSpec,
    StaticIdentityService, SystemClock, TaskDescriptor, TaskStatus, TaskStore,
};

/// Fields for creating a task through the server surface.
#[derive(Debug, Clone)]
pub struct CreateTask {
    /// Owning organization.
    pub org: OrgId,
    /// Human-readable name.
    pub name: String,
    /// When the task fires.
    pub schedule: ScheduleSpec,
    /// Fire delay in seconds.
    pub offset_secs: i64,
    /// Program source.
    pub program: String,
    /// Identity the task runs as.
    pub owner_id: u64,
}

/// A composed, running Rill server.
pub struct Server {
    engine: Arc<MemEngine>,
    reader: StorageReader,
    controller: Controller,
    store: Arc<TaskStore<MemKv>>,
    scheduler: Arc<Scheduler>,
    coordinator: Coordinator<MemKv>,
    clock: Arc<dyn Clock>,
    metrics: MetricsRegistry,
}

impl Server {
    /// Start with the system clock. Must be called within a tokio
    /// runtime; the scheduler worker spawns onto it.
    pub fn start(config: ServerConfig) -> Result<Self> {
        Self::start_with(config, Arc::new(SystemClock))
    }

    /// Start with an injected clock; tests drive a manual one.
    pub fn start_with(config: ServerConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let metrics = MetricsRegistry::new();

        let engine = Arc::new(MemEngine::new());
        engine.open()?;
        let reader = StorageReader::new(Arc::clone(&engine) as Arc<dyn Engine>);
        let controller = Controller::new(config.controller, reader.clone(), metrics.clone());

        let store = Arc::new(TaskStore::new(Arc::new(MemKv::new())));
        let executor = Arc::new(Executor::new(
            Arc::clone(&store),
            controller.clone(),
            Arc::new(JsonProgramResolver),
            Arc::new(StaticIdentityService),
            Arc::clone(&engine) as Arc<dyn PointsWriter>,
            config.executor,
            Arc::clone(&clock),
            metrics.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            config.scheduler,
            Arc::clone(&executor) as Arc<dyn FireExecutor>,
            Arc::clone(&store) as Arc<dyn SchedulableService>,
            Arc::clone(&clock),
            None,
            metrics.clone(),
        ));
        let coordinator = Coordinator::new(
            Arc::clone(&store),
            Arc::clone(&scheduler),
            Arc::clone(&executor),
        );
        let enrolled = coordinator.replay_existing()?;
        info!(enrolled, "server started");

        Ok(Self {
            engine,
            reader,
            controller,
            store,
            scheduler,
            coordinator,
            clock,
            metrics,
        })
    }

    /// Ingest points.
    pub fn write_points(&self, org: OrgId, bucket: BucketId, points: Vec<Point>) -> Result<()> {
        self.engine.write_points(org, bucket, points)
    }

    /// Delete samples matching a predicate within bounds.
    pub fn delete_series(
        &self,
        org: OrgId,
        bucket: BucketId,
        predicate: Option<&Predicate>,
        bounds: TimeBounds,
    ) -> Result<()> {
        self.engine.delete_series(org, bucket, predicate, bounds)
    }

    /// Submit a query program.
    pub fn submit_query(&self, program: Arc<dyn Program>, org: OrgId) -> Result<Query> {
        self.controller.submit(program, org)
    }

    /// Create a task and enroll it with the scheduler.
    pub fn create_task(&self, create: CreateTask) -> Result<TaskDescriptor> {
        let created_at = self
            .clock
            .now()
            .timestamp_nanos_opt()
            .unwrap_or_default();
        let task = self.store.create_task(TaskDescriptor {
            id: TaskId(0),
            org: create.org,
            name: create.name,
            schedule: create.schedule,
            offset_secs: create.offset_secs,
            program: create.program,
            status: TaskStatus::Active,
            owner_id: create.owner_id,
            created_at,
        })?;
        self.coordinator.task_created(&task)?;
        Ok(task)
    }

    /// Update a task and reconcile the scheduler.
    pub fn update_task(&self, task: &TaskDescriptor) -> Result<()> {
        self.store.update_task(task)?;
        self.coordinator.task_updated(task)
    }

    /// Delete a task with its runs and cursor.
    pub fn delete_task(&self, id: TaskId) -> Result<()> {
        self.store.delete_task(id)?;
        self.coordinator.task_deleted(id)
    }

    /// The durable task store.
    pub fn task_store(&self) -> &Arc<TaskStore<MemKv>> {
        &self.store
    }

    /// The storage read surface.
    pub fn reader(&self) -> &StorageReader {
        &self.reader
    }

    /// The query controller.
    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    /// Everything on the metrics surface, Prometheus text format.
    pub fn prometheus_metrics(&self) -> String {
        self.metrics.render_prometheus()
    }

    /// Two-phase shutdown: stop scheduling, drain the controller up to
    /// `deadline`, close the engine.
    pub async fn shutdown(self, deadline: Duration) -> Result<()> {
        self.scheduler.stop().await;
        self.controller.shutdown(deadline).await;
        self.engine.close()?;
        info!("server stopped");
        Ok(())
    }
}
