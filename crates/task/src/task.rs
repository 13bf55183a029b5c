//! Durable task and run records.

use serde::{Deserialize, Serialize};

use crate::schedule::ScheduleSpec;
use rill_common::{OrgId, RunId, TaskId};

/// Whether a task is eligible for scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Enrolled with the scheduler.
    Active,
    /// Retained but never fired.
    Inactive,
}

/// A stored task definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    /// Store-assigned identifier.
    pub id: TaskId,
    /// Owning organization.
    pub org: OrgId,
    /// Human-readable name.
    pub name: String,
    /// When the task fires.
    pub schedule: ScheduleSpec,
    /// Delay between the logical `scheduled_for` and the wall-clock fire,
    /// in seconds.
    #[serde(default)]
    pub offset_secs: i64,
    /// Dataflow program source executed on each fire.
    pub program: String,
    /// Scheduling eligibility.
    pub status: TaskStatus,
    /// Identity the task runs as.
    pub owner_id: u64,
    /// Creation time in UTC nanoseconds; seeds the schedule cursor.
    pub created_at: i64,
}

/// The durable schedule cursor of one task.
///
/// Invariant: `latest_completed <= latest_scheduled <= now`. Zero means
/// unset; the task's `created_at` seeds the first fire computation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCursor {
    /// Newest `scheduled_for` handed to the executor, UTC nanoseconds.
    #[serde(default)]
    pub latest_scheduled: i64,
    /// Newest `scheduled_for` whose run completed, UTC nanoseconds.
    #[serde(default)]
    pub latest_completed: i64,
}

/// Terminal and non-terminal run states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Created, not yet started.
    Scheduled,
    /// Executing.
    Started,
    /// Finished cleanly.
    Success,
    /// Finished with an error.
    Failed,
    /// Terminated by cancellation.
    Canceled,
}

impl RunStatus {
    /// Whether the run may never change again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Success | RunStatus::Failed | RunStatus::Canceled
        )
    }

    /// Stable lowercase name, used as a metrics label.
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Scheduled => "scheduled",
            RunStatus::Started => "started",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Canceled => "canceled",
        }
    }
}

/// One log line attached to a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLogLine {
    /// When the line was recorded, UTC nanoseconds.
    pub time: i64,
    /// Message text.
    pub message: String,
}

/// The observable record of one task fire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// Store-assigned identifier.
    pub id: RunId,
    /// Owning task.
    pub task_id: TaskId,
    /// Logical fire time, UTC nanoseconds.
    pub scheduled_for: i64,
    /// Wall time execution began.
    #[serde(default)]
    pub started_at: Option<i64>,
    /// Wall time the run reached a terminal state.
    #[serde(default)]
    pub finished_at: Option<i64>,
    /// Current status.
    pub status: RunStatus,
    /// Terminal error message, when failed.
    #[serde(default)]
    pub error: Option<String>,
    /// Collected log lines.
    #[serde(default)]
    pub log: Vec<RunLogLine>,
}

impl Run {
    /// Append a log line.
    pub fn log_line(&mut self, time: i64, message: impl Into<String>) {
        self.log.push(RunLogLine {
            time,
            message: message.into(),
        });
    }
}
