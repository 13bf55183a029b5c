//! Bridges the task CRUD surface and the scheduler.
//!
//! The coordinator keeps its own snapshot of what the scheduler was told
//! and turns task create/update/delete notifications into the minimal
//! enroll / update / withdraw intents, sent one way over the scheduler's
//! control channel. On startup it replays every active task out of the
//! store and re-attaches to runs that were in flight when the process
//! died.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Duration;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::executor::{ns_to_datetime, Executor};
use crate::schedule::{Schedule, ScheduleSpec};
use crate::scheduler::{SchedulableTask, Scheduler};
use crate::store::TaskStore;
use crate::task::{TaskDescriptor, TaskStatus};
use rill_common::{Result, TaskId};
use rill_kv::KvStore;

#[derive(Debug, Clone, PartialEq)]
struct TaskSnapshot {
    schedule: ScheduleSpec,
    offset_secs: i64,
    status: TaskStatus,
}

impl TaskSnapshot {
    fn of(task: &TaskDescriptor) -> Self {
        Self {
            schedule: task.schedule.clone(),
            offset_secs: task.offset_secs,
            status: task.status,
        }
    }
}

/// Reconciles the live task set with scheduler subscriptions.
pub struct Coordinator<S: KvStore> {
    store: Arc<TaskStore<S>>,
    scheduler: Arc<Scheduler>,
    executor: Arc<Executor<S>>,
    view: Mutex<HashMap<TaskId, TaskSnapshot>>,
}

impl<S: KvStore> Coordinator<S> {
    /// Wire a coordinator.
    pub fn new(
        store: Arc<TaskStore<S>>,
        scheduler: Arc<Scheduler>,
        executor: Arc<Executor<S>>,
    ) -> Self {
        Self {
            store,
            scheduler,
            executor,
            view: Mutex::new(HashMap::new()),
        }
    }

    /// A task was created on the CRUD surface.
    pub fn task_created(&self, task: &TaskDescriptor) -> Result<()> {
        self.reconcile(task)
    }

    /// A task was updated on the CRUD surface.
    pub fn task_updated(&self, task: &TaskDescriptor) -> Result<()> {
        self.reconcile(task)
    }

    /// A task was deleted on the CRUD surface.
    pub fn task_deleted(&self, id: TaskId) -> Result<()> {
        self.view.lock().remove(&id);
        self.scheduler.release(id)
    }

    /// Diff the descriptor against the scheduler's view and issue the
    /// minimal intent. Repeated calls with an unchanged descriptor are
    /// no-ops.
    fn reconcile(&self, task: &TaskDescriptor) -> Result<()> {
        let snapshot = TaskSnapshot::of(task);
        {
            let view = self.view.lock();
            if view.get(&task.id) == Some(&snapshot) {
                return Ok(());
            }
        }
        match task.status {
            TaskStatus::Inactive => {
                self.scheduler.release(task.id)?;
            }
            TaskStatus::Active => {
                self.scheduler.schedule(self.schedulable(task)?)?;
            }
        }
        self.view.lock().insert(task.id, snapshot);
        Ok(())
    }

    /// Build the scheduler's view of a task, seeding the cursor from the
    /// durable store (or creation time for never-fired tasks) so that
    /// re-activation preserves `latest_scheduled`.
    fn schedulable(&self, task: &TaskDescriptor) -> Result<SchedulableTask> {
        let schedule = Schedule::parse(&task.schedule)?;
        let cursor = self.store.cursor(task.id)?;
        let latest = if cursor.latest_scheduled > 0 {
            cursor.latest_scheduled
        } else {
            task.created_at
        };
        Ok(SchedulableTask {
            id: task.id,
            schedule,
            offset: Duration::seconds(task.offset_secs),
            latest_scheduled: ns_to_datetime(latest),
        })
    }

    /// Replay all stored active tasks into the scheduler and settle runs
    /// left non-terminal by a crash. Returns how many tasks enrolled.
    pub fn replay_existing(&self) -> Result<usize> {
        let tasks = self.store.list_tasks(None)?;
        let mut enrolled = 0usize;
        for task in tasks {
            for run in self.store.current_runs(task.id)? {
                match self.executor.resume_current_run(task.id, run.id) {
                    Ok(run) => {
                        warn!(task = %task.id, run = %run.id, "recovered in-flight run");
                    }
                    Err(err) => {
                        warn!(task = %task.id, run = %run.id, error = %err, "run recovery failed");
                    }
                }
            }
            if task.status == TaskStatus::Active {
                self.reconcile(&task)?;
                enrolled += 1;
            }
        }
        info!(enrolled, "replayed stored tasks into the scheduler");
        Ok(enrolled)
    }
}
