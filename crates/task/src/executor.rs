//! Runs one task instance through the query controller and records it.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use tracing::{debug, warn};

use crate::schedule::Schedule;
use crate::scheduler::{Clock, FireExecutor};
use crate::store::TaskStore;
use crate::task::{Run, RunStatus, TaskDescriptor};
use rill_common::{ErrorKind, ExecutorConfig, MetricsRegistry, Result, RillError, RunId, TaskId};
use rill_kv::KvStore;
use rill_query::{Controller, ProgramOutput, ProgramResolver, QueryResults};
use rill_storage::{batch_points, PointsWriter, TableStream};

/// A resolved caller identity attached to a run's query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Stable user identifier.
    pub id: u64,
    /// Display name.
    pub name: String,
}

/// Resolves task owners to identities.
pub trait IdentityService: Send + Sync + 'static {
    /// Look up the identity a task runs as.
    fn find(&self, owner_id: u64) -> Result<Identity>;
}

/// Identity service that accepts every owner; used when authentication
/// is delegated to an outer layer.
#[derive(Debug, Default)]
pub struct StaticIdentityService;

impl IdentityService for StaticIdentityService {
    fn find(&self, owner_id: u64) -> Result<Identity> {
        Ok(Identity {
            id: owner_id,
            name: format!("user-{owner_id:016x}"),
        })
    }
}

const WRITE_BACKOFF_INITIAL_MS: u64 = 100;

/// Executes task instances: creates the run record, submits the program,
/// drains results into the points writer, and maintains the cursor.
pub struct Executor<S: KvStore> {
    store: Arc<TaskStore<S>>,
    controller: Controller,
    resolver: Arc<dyn ProgramResolver>,
    identities: Arc<dyn IdentityService>,
    writer: Arc<dyn PointsWriter>,
    config: ExecutorConfig,
    clock: Arc<dyn Clock>,
    metrics: MetricsRegistry,
}

impl<S: KvStore> Executor<S> {
    /// Wire an executor.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<TaskStore<S>>,
        controller: Controller,
        resolver: Arc<dyn ProgramResolver>,
        identities: Arc<dyn IdentityService>,
        writer: Arc<dyn PointsWriter>,
        config: ExecutorConfig,
        clock: Arc<dyn Clock>,
        metrics: MetricsRegistry,
    ) -> Self {
        Self {
            store,
            controller,
            resolver,
            identities,
            writer,
            config,
            clock,
            metrics,
        }
    }

    /// Execute one fire and return its run record.
    pub async fn execute_run(
        &self,
        task_id: TaskId,
        scheduled_for: DateTime<Utc>,
    ) -> Result<Run> {
        let task = self.store.get_task(task_id)?;
        let scheduled_ns = scheduled_for
            .timestamp_nanos_opt()
            .ok_or_else(|| RillError::InvalidArgument("scheduled_for out of range".into()))?;
        let mut run = self.store.create_run(task_id, scheduled_ns)?;
        run.log_line(self.now_ns(), "run scheduled");

        let started = std::time::Instant::now();
        let outcome = self.drive(&task, scheduled_for, &mut run).await;
        run.finished_at = Some(self.now_ns());
        let status = match &outcome {
            Ok(()) => RunStatus::Success,
            Err(err) => {
                run.error = Some(err.to_string());
                run.log_line(self.now_ns(), format!("run failed: {err}"));
                RunStatus::Failed
            }
        };
        run.status = status;
        self.store.update_run(&run)?;
        self.metrics.inc_executor_runs(status.as_str());
        self.metrics.observe_run_latency(started.elapsed());

        let advance_cursor = match &outcome {
            Ok(()) => true,
            // A run that died on its deadline must not wedge the task, and
            // the record-failures policy opts every failure in.
            Err(err) => self.config.record_failures || err.kind() == ErrorKind::DeadlineExceeded,
        };
        if advance_cursor {
            if let Err(err) = self.store.advance_latest_completed(task_id, scheduled_ns) {
                warn!(task = %task_id, error = %err, "latest_completed update failed");
            }
        }
        match outcome {
            Ok(()) => Ok(run),
            Err(err) => Err(err),
        }
    }

    /// Re-attach to a run found non-terminal at startup. Programs are not
    /// resumable, so the run fails with a recovery diagnostic.
    pub fn resume_current_run(&self, task_id: TaskId, run_id: RunId) -> Result<Run> {
        let mut run = self.store.get_run(task_id, run_id)?;
        if run.status.is_terminal() {
            return Err(RillError::Conflict(format!(
                "run {run_id} already finished as {}",
                run.status.as_str()
            )));
        }
        run.status = RunStatus::Failed;
        run.error = Some("recovered after restart: program state is not resumable".into());
        run.finished_at = Some(self.now_ns());
        run.log_line(self.now_ns(), "recovered after restart; marking failed");
        self.store.update_run(&run)?;
        self.metrics.inc_executor_runs(RunStatus::Failed.as_str());
        Ok(run)
    }

    async fn drive(
        &self,
        task: &TaskDescriptor,
        scheduled_for: DateTime<Utc>,
        run: &mut Run,
    ) -> Result<()> {
        let identity = self.identities.find(task.owner_id)?;
        let schedule = Schedule::parse(&task.schedule)?;
        let period = schedule.period(scheduled_for);
        let deadline = scheduled_for
            + Duration::nanoseconds(
                (period.num_nanoseconds().unwrap_or(i64::MAX) as f64
                    * self.config.run_deadline_multiplier) as i64,
            );
        let remaining = deadline - self.clock.now();
        let remaining = remaining.to_std().map_err(|_| {
            RillError::DeadlineExceeded(format!(
                "run deadline {deadline} passed before execution began"
            ))
        })?;

        let program = self.resolver.compile(&task.program)?;
        let output = self.resolver.output(&task.program)?;
        let mut query = self.controller.submit(program, task.org)?;
        debug!(task = %task.id, run = %run.id, query = %query.id(), user = identity.id, "run submitted");

        run.status = RunStatus::Started;
        run.started_at = Some(self.now_ns());
        run.log_line(self.now_ns(), format!("started as {}", identity.name));
        self.store.update_run(run)?;

        // Admission may queue behind other work; the fire is bounded by
        // the schedule period.
        let results = match tokio::time::timeout(remaining, query.results()).await {
            Ok(results) => results?,
            Err(_) => {
                query.cancel();
                return Err(RillError::DeadlineExceeded(format!(
                    "run missed its deadline {deadline} waiting for admission"
                )));
            }
        };

        let (tables, rows, points) = self.drain(results, deadline)?;
        run.log_line(
            self.now_ns(),
            format!("query produced {tables} tables, {rows} rows"),
        );

        if let Some(ProgramOutput { org, bucket }) = output {
            let count = points.len();
            self.write_with_backoff(org, bucket, points, deadline).await?;
            run.log_line(self.now_ns(), format!("wrote {count} points"));
        }
        Ok(())
    }

    /// Drain the result stream, honoring the run deadline between tables.
    fn drain(
        &self,
        mut results: QueryResults,
        deadline: DateTime<Utc>,
    ) -> Result<(usize, usize, Vec<rill_storage::Point>)> {
        let mut tables = 0usize;
        let mut rows = 0usize;
        let mut points = Vec::new();
        while let Some(mut table) = results.next_table()? {
            if self.clock.now() >= deadline {
                return Err(RillError::DeadlineExceeded(format!(
                    "run missed its deadline {deadline} while draining results"
                )));
            }
            tables += 1;
            rows += table.num_rows();
            let batch = table.take_batch()?;
            points.extend(batch_points(&batch)?);
        }
        Ok((tables, rows, points))
    }

    /// Retry engine writes with exponential backoff while `unavailable`,
    /// capped at the run deadline. Writers are idempotent within a run.
    async fn write_with_backoff(
        &self,
        org: rill_common::OrgId,
        bucket: rill_common::BucketId,
        points: Vec<rill_storage::Point>,
        deadline: DateTime<Utc>,
    ) -> Result<()> {
        let mut backoff = std::time::Duration::from_millis(WRITE_BACKOFF_INITIAL_MS);
        loop {
            match self.writer.write(org, bucket, points.clone()) {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Unavailable => {
                    if self.clock.now() + Duration::from_std(backoff).unwrap_or_default()
                        >= deadline
                    {
                        return Err(RillError::DeadlineExceeded(format!(
                            "points write still unavailable at deadline {deadline}: {err}"
                        )));
                    }
                    warn!(error = %err, backoff_ms = backoff.as_millis() as u64, "points write unavailable; backing off");
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn now_ns(&self) -> i64 {
        self.clock.now().timestamp_nanos_opt().unwrap_or(0)
    }
}

#[async_trait]
impl<S: KvStore> FireExecutor for Executor<S> {
    async fn execute(&self, id: TaskId, scheduled_for: DateTime<Utc>) -> Result<()> {
        self.execute_run(id, scheduled_for).await.map(|_| ())
    }
}

/// Scheduler cursor updates write through the schedulable store.
impl<S: KvStore> crate::scheduler::SchedulableService for TaskStore<S> {
    fn update_latest_scheduled(
        &self,
        id: TaskId,
        scheduled_for: DateTime<Utc>,
    ) -> Result<()> {
        let ns = scheduled_for
            .timestamp_nanos_opt()
            .ok_or_else(|| RillError::InvalidArgument("scheduled_for out of range".into()))?;
        self.advance_latest_scheduled(id, ns)
    }
}

/// Nanosecond cursor value back to a UTC instant.
pub fn ns_to_datetime(ns: i64) -> DateTime<Utc> {
    Utc.timestamp_nanos(ns)
}
