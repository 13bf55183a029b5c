//! The task system: durable periodic tasks driven through the query
//! controller.
//!
//! Architecture role:
//! - [`store`] persists tasks, runs, and schedule cursors in the ordered
//!   KV, with check-and-set cursor advances
//! - [`scheduler`] discovers due task instances on a logical clock and
//!   dispatches them into a bounded pool
//! - [`executor`] runs one instance through the query controller and
//!   records the run
//! - [`coordinator`] reconciles the CRUD surface with scheduler
//!   subscriptions and replays durable state after a restart
//!
//! Components exchange work through channels and traits only; nothing
//! here holds a pointer back to its caller.

/// The coordinator between CRUD and scheduler.
pub mod coordinator;
/// Run execution through the query controller.
pub mod executor;
/// Cron and fixed-period schedules.
pub mod schedule;
/// The clock-driven scheduler.
pub mod scheduler;
/// Durable task / run / cursor persistence.
pub mod store;
/// Task and run records.
pub mod task;

pub use coordinator::Coordinator;
pub use executor::{Executor, Identity, IdentityService, StaticIdentityService};
pub use schedule::{Schedule, ScheduleSpec};
pub use scheduler::{
    Clock, ErrorHook, FireExecutor, ManualClock, SchedulableService, SchedulableTask, Scheduler,
    SystemClock,
};
pub use store::TaskStore;
pub use task::{Run, RunLogLine, RunStatus, TaskCursor, TaskDescriptor, TaskStatus};
