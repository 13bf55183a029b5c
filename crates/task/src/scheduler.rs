//! The clock-driven task scheduler.
//!
//! One worker owns a min-heap keyed by `scheduled_for + offset` and a
//! task map with generation counters; stale heap entries are invalidated
//! lazily by generation. All mutations (enroll, update, withdraw) arrive
//! over a single control channel, so the heap is never touched from
//! outside the worker. Fires dispatch into a bounded pool; when the pool
//! is saturated the scheduler records `behind` and keeps serving control
//! messages instead of blocking on a permit. A task never has two
//! executions in flight: a fire coming due while the previous one still
//! runs is deferred until that run completes.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, Notify, Semaphore};
use tracing::{debug, info, warn};

use crate::schedule::Schedule;
use rill_common::{MetricsRegistry, Result, RillError, SchedulerConfig, TaskId};

/// Logical clock driving the scheduler, injected for deterministic tests.
#[async_trait]
pub trait Clock: Send + Sync + 'static {
    /// Current UTC time.
    fn now(&self) -> DateTime<Utc>;

    /// Resolve once `now() >= until`.
    async fn sleep_until(&self, until: DateTime<Utc>);
}

/// Wall-clock time via tokio timers.
#[derive(Debug, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep_until(&self, until: DateTime<Utc>) {
        let now = Utc::now();
        if until <= now {
            return;
        }
        let wait = (until - now)
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);
        tokio::time::sleep(wait).await;
    }
}

/// Hand-advanced clock for tests.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
    changed: Notify,
}

impl ManualClock {
    /// Start the clock at `now`.
    pub fn new(now: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(now),
            changed: Notify::new(),
        })
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        {
            let mut now = self.now.lock();
            *now += by;
        }
        self.changed.notify_waiters();
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }

    async fn sleep_until(&self, until: DateTime<Utc>) {
        loop {
            // Register before checking so an advance between the check and
            // the await is not lost.
            let notified = self.changed.notified();
            if self.now() >= until {
                return;
            }
            notified.await;
        }
    }
}

/// The executor seam the scheduler dispatches into.
#[async_trait]
pub trait FireExecutor: Send + Sync + 'static {
    /// Run one task instance.
    async fn execute(&self, id: TaskId, scheduled_for: DateTime<Utc>) -> Result<()>;
}

/// Durable cursor updates issued before each dispatch.
pub trait SchedulableService: Send + Sync + 'static {
    /// Persist that `scheduled_for` was handed to the executor.
    fn update_latest_scheduled(&self, id: TaskId, scheduled_for: DateTime<Utc>) -> Result<()>;
}

/// Invoked with every executor failure; fires are never retried.
pub type ErrorHook = Arc<dyn Fn(TaskId, DateTime<Utc>, &RillError) + Send + Sync>;

/// A task as the scheduler tracks it.
#[derive(Debug, Clone)]
pub struct SchedulableTask {
    /// Task identifier.
    pub id: TaskId,
    /// Parsed schedule.
    pub schedule: Schedule,
    /// Delay between `scheduled_for` and the wall-clock fire.
    pub offset: Duration,
    /// Durable high-water mark; the next fire is computed after it.
    pub latest_scheduled: DateTime<Utc>,
}

enum Ctl {
    Schedule(SchedulableTask),
    Release(TaskId),
    Stop(oneshot::Sender<()>),
}

struct HeapEntry {
    fire_at: DateTime<Utc>,
    scheduled_for: DateTime<Utc>,
    id: TaskId,
    generation: u64,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at && self.id == other.id
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    // Reversed: BinaryHeap is a max-heap and we want the earliest fire.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .fire_at
            .cmp(&self.fire_at)
            .then_with(|| other.id.cmp(&self.id))
    }
}

struct Tracked {
    task: SchedulableTask,
    generation: u64,
    in_flight: bool,
    deferred: Option<HeapEntry>,
}

struct Worker {
    config: SchedulerConfig,
    executor: Arc<dyn FireExecutor>,
    service: Arc<dyn SchedulableService>,
    clock: Arc<dyn Clock>,
    error_hook: Option<ErrorHook>,
    metrics: MetricsRegistry,

    heap: BinaryHeap<HeapEntry>,
    tasks: HashMap<TaskId, Tracked>,
    pool: Arc<Semaphore>,
    done_tx: mpsc::UnboundedSender<(TaskId, DateTime<Utc>, Result<()>)>,
    /// Set when a due fire found no pool permit; the fire branch parks
    /// until a completion frees a slot, keeping the worker off a spin.
    saturated: bool,
}

/// Handle to the scheduler worker.
pub struct Scheduler {
    ctl: mpsc::UnboundedSender<Ctl>,
}

impl Scheduler {
    /// Spawn the scheduler worker. Must be called within a tokio runtime.
    pub fn new(
        config: SchedulerConfig,
        executor: Arc<dyn FireExecutor>,
        service: Arc<dyn SchedulableService>,
        clock: Arc<dyn Clock>,
        error_hook: Option<ErrorHook>,
        metrics: MetricsRegistry,
    ) -> Self {
        let (ctl_tx, ctl_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let worker = Worker {
            pool: Arc::new(Semaphore::new(config.workers.max(1))),
            config,
            executor,
            service,
            clock,
            error_hook,
            metrics,
            heap: BinaryHeap::new(),
            tasks: HashMap::new(),
            done_tx,
            saturated: false,
        };
        tokio::spawn(worker.run(ctl_rx, done_rx));
        Self { ctl: ctl_tx }
    }

    /// Enroll a task or update its descriptor; idempotent.
    pub fn schedule(&self, task: SchedulableTask) -> Result<()> {
        self.ctl
            .send(Ctl::Schedule(task))
            .map_err(|_| RillError::Unavailable("scheduler worker stopped".into()))
    }

    /// Withdraw a task; pending fires are discarded, an in-flight run is
    /// left to finish.
    pub fn release(&self, id: TaskId) -> Result<()> {
        self.ctl
            .send(Ctl::Release(id))
            .map_err(|_| RillError::Unavailable("scheduler worker stopped".into()))
    }

    /// Stop the worker after it drains its control queue.
    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self.ctl.send(Ctl::Stop(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

impl Worker {
    async fn run(
        mut self,
        mut ctl_rx: mpsc::UnboundedReceiver<Ctl>,
        mut done_rx: mpsc::UnboundedReceiver<(TaskId, DateTime<Utc>, Result<()>)>,
    ) {
        info!(workers = self.config.workers, "task scheduler started");
        loop {
            let next_fire = if self.saturated {
                None
            } else {
                self.next_valid_fire()
            };
            let clock = Arc::clone(&self.clock);
            tokio::select! {
                msg = ctl_rx.recv() => match msg {
                    Some(Ctl::Schedule(task)) => self.enroll(task),
                    Some(Ctl::Release(id)) => self.withdraw(id),
                    Some(Ctl::Stop(reply)) => {
                        let _ = reply.send(());
                        break;
                    }
                    None => break,
                },
                done = done_rx.recv() => {
                    if let Some((id, scheduled_for, result)) = done {
                        self.on_done(id, scheduled_for, result);
                    }
                }
                _ = clock.sleep_until(next_fire.unwrap_or_else(far_future)),
                    if next_fire.is_some() =>
                {
                    self.fire_due();
                }
            }
        }
        info!("task scheduler stopped");
    }

    /// Earliest fire among non-stale heap entries.
    fn next_valid_fire(&mut self) -> Option<DateTime<Utc>> {
        while let Some(entry) = self.heap.peek() {
            if self.entry_is_stale(entry) {
                self.heap.pop();
                continue;
            }
            return Some(entry.fire_at);
        }
        None
    }

    fn entry_is_stale(&self, entry: &HeapEntry) -> bool {
        match self.tasks.get(&entry.id) {
            Some(tracked) => tracked.generation != entry.generation,
            None => true,
        }
    }

    fn enroll(&mut self, task: SchedulableTask) {
        let id = task.id;
        let generation = match self.tasks.get(&id) {
            Some(tracked) => tracked.generation + 1,
            None => 1,
        };
        // Preserve monotonicity across re-enrollment: never step the
        // cursor backwards.
        let latest = match self.tasks.get(&id) {
            Some(tracked) => tracked.task.latest_scheduled.max(task.latest_scheduled),
            None => task.latest_scheduled,
        };
        let mut task = task;
        task.latest_scheduled = latest;

        let next = self.first_fire(&task);
        let in_flight = self
            .tasks
            .get(&id)
            .map(|tracked| tracked.in_flight)
            .unwrap_or(false);
        self.tasks.insert(
            id,
            Tracked {
                task: task.clone(),
                generation,
                in_flight,
                deferred: None,
            },
        );
        if let Some(scheduled_for) = next {
            let fire_at = scheduled_for + task.offset;
            debug!(task = %id, %scheduled_for, %fire_at, "task enrolled");
            self.heap.push(HeapEntry {
                fire_at,
                scheduled_for,
                id,
                generation,
            });
        }
        self.metrics.set_scheduler_pending(self.tasks.len());
    }

    /// Next `scheduled_for` strictly after the task's cursor, skipped
    /// forward past the catch-up horizon when the task was off for long.
    fn first_fire(&self, task: &SchedulableTask) -> Option<DateTime<Utc>> {
        let next = task.schedule.next_fire(task.latest_scheduled)?;
        let max_catchup = Duration::from_std(self.config.max_catchup)
            .unwrap_or_else(|_| Duration::days(1));
        let horizon = self.clock.now() - max_catchup;
        if next + task.offset >= horizon {
            return Some(next);
        }
        // Too far behind: drop fires older than the horizon.
        let jump_from = horizon - task.offset - Duration::nanoseconds(1);
        let skipped_to = task.schedule.next_fire(jump_from)?;
        warn!(
            task = %task.id,
            from = %next,
            to = %skipped_to,
            "catch-up window exceeded; dropping older fires"
        );
        Some(skipped_to)
    }

    fn withdraw(&mut self, id: TaskId) {
        // Heap entries go stale once the task is gone.
        if self.tasks.remove(&id).is_some() {
            debug!(task = %id, "task withdrawn");
        }
        self.metrics.set_scheduler_pending(self.tasks.len());
    }

    fn fire_due(&mut self) {
        self.saturated = false;
        let now = self.clock.now();
        loop {
            let Some(entry) = self.heap.peek() else {
                break;
            };
            if entry.fire_at > now {
                break;
            }
            let entry = self.heap.pop().expect("peeked entry");
            if self.entry_is_stale(&entry) {
                continue;
            }
            let tracked = self.tasks.get_mut(&entry.id).expect("tracked task");
            if tracked.in_flight {
                // One outstanding fire per task; re-queued on completion.
                tracked.deferred = Some(entry);
                continue;
            }
            let Ok(permit) = Arc::clone(&self.pool).try_acquire_owned() else {
                // Pool saturated: keep the entry and park the fire branch;
                // completions free a slot and re-trigger firing. Control
                // traffic keeps flowing meanwhile.
                self.heap.push(entry);
                self.saturated = true;
                break;
            };

            let id = entry.id;
            let scheduled_for = entry.scheduled_for;
            if let Err(err) = self.service.update_latest_scheduled(id, scheduled_for) {
                warn!(task = %id, %scheduled_for, error = %err, "latest_scheduled update failed");
                if let Some(hook) = &self.error_hook {
                    hook(id, scheduled_for, &err);
                }
            }
            tracked.task.latest_scheduled = scheduled_for;
            tracked.in_flight = true;

            // Queue the following occurrence immediately so catch-up
            // replays stay dense and ordered.
            if let Some(next) = tracked.task.schedule.next_fire(scheduled_for) {
                self.heap.push(HeapEntry {
                    fire_at: next + tracked.task.offset,
                    scheduled_for: next,
                    id,
                    generation: tracked.generation,
                });
            }

            self.metrics.inc_scheduler_fires("dispatched");
            debug!(task = %id, %scheduled_for, "task dispatched");
            let executor = Arc::clone(&self.executor);
            let done_tx = self.done_tx.clone();
            tokio::spawn(async move {
                let result = executor.execute(id, scheduled_for).await;
                drop(permit);
                let _ = done_tx.send((id, scheduled_for, result));
            });
        }
        let behind = if self.saturated {
            self.heap
                .iter()
                .filter(|entry| entry.fire_at <= now && !self.entry_is_stale(entry))
                .count()
        } else {
            0
        };
        self.metrics.set_scheduler_behind(behind);
    }

    fn on_done(&mut self, id: TaskId, scheduled_for: DateTime<Utc>, result: Result<()>) {
        if let Err(err) = &result {
            self.metrics.inc_scheduler_fires("error");
            warn!(task = %id, %scheduled_for, error = %err, "task execution failed");
            if let Some(hook) = &self.error_hook {
                hook(id, scheduled_for, err);
            }
        } else {
            self.metrics.inc_scheduler_fires("ok");
        }
        if let Some(tracked) = self.tasks.get_mut(&id) {
            tracked.in_flight = false;
            if let Some(deferred) = tracked.deferred.take() {
                if deferred.generation == tracked.generation {
                    self.heap.push(deferred);
                }
            }
        }
        // A free pool slot may unblock fires that were behind.
        self.fire_due();
    }
}

fn far_future() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(9999, 1, 1, 0, 0, 0).single().expect("valid date")
}
