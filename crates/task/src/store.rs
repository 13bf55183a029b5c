//! The schedulable store: durable tasks, runs, and schedule cursors over
//! an ordered KV.
//!
//! Key layout:
//! - `t/<org>/<taskID>` → task descriptor
//! - `r/<taskID>/<runID>` → run record
//! - `c/<taskID>` → `{latest_scheduled, latest_completed}`
//! - `m/next_id` → identifier counter
//!
//! Values are JSON behind a `[version u8][u32 LE length]` envelope;
//! readers ignore trailing bytes past the declared length and unknown
//! JSON fields, which is what forward compatibility rests on. Cursor
//! updates are check-and-set against the stored value inside one
//! serializable transaction.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::task::{Run, RunStatus, TaskCursor, TaskDescriptor};
use rill_kv::{KvStore, ReadTx, WriteTx};
use rill_common::{OrgId, Result, RillError, RunId, TaskId};

const RECORD_VERSION: u8 = 1;

fn encode_record<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(value)
        .map_err(|e| RillError::Internal(format!("record encode failed: {e}")))?;
    let mut out = Vec::with_capacity(5 + payload.len());
    out.push(RECORD_VERSION);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

fn decode_record<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    if bytes.len() < 5 {
        return Err(RillError::Internal("record too short".into()));
    }
    if bytes[0] != RECORD_VERSION {
        return Err(RillError::Internal(format!(
            "unsupported record version {}",
            bytes[0]
        )));
    }
    let len = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as usize;
    let payload = bytes
        .get(5..5 + len)
        .ok_or_else(|| RillError::Internal("record length exceeds value".into()))?;
    serde_json::from_slice(payload)
        .map_err(|e| RillError::Internal(format!("record decode failed: {e}")))
}

fn task_key(org: OrgId, id: TaskId) -> Vec<u8> {
    let mut key = Vec::with_capacity(2 + 8 + 1 + 8);
    key.extend_from_slice(b"t/");
    key.extend_from_slice(&org.to_bytes());
    key.push(b'/');
    key.extend_from_slice(&id.to_bytes());
    key
}

fn run_key(task: TaskId, run: RunId) -> Vec<u8> {
    let mut key = Vec::with_capacity(2 + 8 + 1 + 8);
    key.extend_from_slice(b"r/");
    key.extend_from_slice(&task.to_bytes());
    key.push(b'/');
    key.extend_from_slice(&run.to_bytes());
    key
}

fn run_prefix(task: TaskId) -> Vec<u8> {
    let mut key = Vec::with_capacity(2 + 8 + 1);
    key.extend_from_slice(b"r/");
    key.extend_from_slice(&task.to_bytes());
    key.push(b'/');
    key
}

fn cursor_key(task: TaskId) -> Vec<u8> {
    let mut key = Vec::with_capacity(2 + 8);
    key.extend_from_slice(b"c/");
    key.extend_from_slice(&task.to_bytes());
    key
}

const NEXT_ID_KEY: &[u8] = b"m/next_id";

fn next_id(tx: &mut dyn WriteTx) -> Result<u64> {
    let current = match tx.get(NEXT_ID_KEY)? {
        Some(bytes) => {
            let raw: [u8; 8] = bytes
                .try_into()
                .map_err(|_| RillError::Internal("malformed id counter".into()))?;
            u64::from_be_bytes(raw)
        }
        None => 1,
    };
    tx.put(NEXT_ID_KEY, &(current + 1).to_be_bytes())?;
    Ok(current)
}

fn find_task_in<T: ReadTx + ?Sized>(tx: &T, id: TaskId) -> Result<Option<TaskDescriptor>> {
    for (key, value) in tx.cursor(b"t/")? {
        if key.ends_with(&id.to_bytes()) {
            let task: TaskDescriptor = decode_record(&value)?;
            if task.id == id {
                return Ok(Some(task));
            }
        }
    }
    Ok(None)
}

/// Durable task, run, and cursor persistence.
pub struct TaskStore<S: KvStore> {
    kv: Arc<S>,
}

impl<S: KvStore> TaskStore<S> {
    /// Wrap an ordered KV store.
    pub fn new(kv: Arc<S>) -> Self {
        Self { kv }
    }

    /// Persist a new task; the store assigns its identifier.
    pub fn create_task(&self, mut task: TaskDescriptor) -> Result<TaskDescriptor> {
        self.kv.update(|tx| {
            task.id = TaskId(next_id(tx)?);
            tx.put(&task_key(task.org, task.id), &encode_record(&task)?)?;
            Ok(task.clone())
        })
    }

    /// Look up one task by id.
    pub fn get_task(&self, id: TaskId) -> Result<TaskDescriptor> {
        self.kv.view(|tx| {
            find_task_in(tx, id)?
                .ok_or_else(|| RillError::NotFound(format!("task {id} does not exist")))
        })
    }

    /// Replace an existing task definition.
    pub fn update_task(&self, task: &TaskDescriptor) -> Result<()> {
        self.kv.update(|tx| {
            if find_task_in(tx, task.id)?.is_none() {
                return Err(RillError::NotFound(format!(
                    "task {} does not exist",
                    task.id
                )));
            }
            tx.put(&task_key(task.org, task.id), &encode_record(task)?)
        })
    }

    /// Remove a task with its runs and cursor.
    pub fn delete_task(&self, id: TaskId) -> Result<()> {
        self.kv.update(|tx| {
            let task = find_task_in(tx, id)?
                .ok_or_else(|| RillError::NotFound(format!("task {id} does not exist")))?;
            tx.delete(&task_key(task.org, task.id))?;
            tx.delete(&cursor_key(id))?;
            let runs: Vec<Vec<u8>> = tx.cursor(&run_prefix(id))?.map(|(k, _)| k).collect();
            for key in runs {
                tx.delete(&key)?;
            }
            Ok(())
        })
    }

    /// Every stored task, optionally restricted to one organization.
    pub fn list_tasks(&self, org: Option<OrgId>) -> Result<Vec<TaskDescriptor>> {
        let prefix = match org {
            Some(org) => {
                let mut p = b"t/".to_vec();
                p.extend_from_slice(&org.to_bytes());
                p.push(b'/');
                p
            }
            None => b"t/".to_vec(),
        };
        self.kv.view(|tx| {
            tx.cursor(&prefix)?
                .map(|(_, value)| decode_record(&value))
                .collect()
        })
    }

    /// Create a run in the `scheduled` state.
    pub fn create_run(&self, task_id: TaskId, scheduled_for: i64) -> Result<Run> {
        self.kv.update(|tx| {
            if find_task_in(tx, task_id)?.is_none() {
                return Err(RillError::NotFound(format!(
                    "task {task_id} does not exist"
                )));
            }
            let run = Run {
                id: RunId(next_id(tx)?),
                task_id,
                scheduled_for,
                started_at: None,
                finished_at: None,
                status: RunStatus::Scheduled,
                error: None,
                log: Vec::new(),
            };
            tx.put(&run_key(task_id, run.id), &encode_record(&run)?)?;
            Ok(run)
        })
    }

    /// Look up one run.
    pub fn get_run(&self, task_id: TaskId, run_id: RunId) -> Result<Run> {
        self.kv.view(|tx| {
            match tx.get(&run_key(task_id, run_id))? {
                Some(value) => decode_record(&value),
                None => Err(RillError::NotFound(format!(
                    "run {run_id} of task {task_id} does not exist"
                ))),
            }
        })
    }

    /// Persist a run update. Runs are append-only once terminal: touching
    /// a terminal run is a `conflict`.
    pub fn update_run(&self, run: &Run) -> Result<()> {
        self.kv.update(|tx| {
            let key = run_key(run.task_id, run.id);
            let stored: Run = match tx.get(&key)? {
                Some(value) => decode_record(&value)?,
                None => {
                    return Err(RillError::NotFound(format!(
                        "run {} of task {} does not exist",
                        run.id, run.task_id
                    )))
                }
            };
            if stored.status.is_terminal() {
                return Err(RillError::Conflict(format!(
                    "run {} is already terminal ({})",
                    run.id,
                    stored.status.as_str()
                )));
            }
            tx.put(&key, &encode_record(run)?)
        })
    }

    /// Every run of a task, in run-id order.
    pub fn list_runs(&self, task_id: TaskId) -> Result<Vec<Run>> {
        self.kv.view(|tx| {
            tx.cursor(&run_prefix(task_id))?
                .map(|(_, value)| decode_record(&value))
                .collect()
        })
    }

    /// Non-terminal runs of a task, used by startup recovery.
    pub fn current_runs(&self, task_id: TaskId) -> Result<Vec<Run>> {
        Ok(self
            .list_runs(task_id)?
            .into_iter()
            .filter(|run| !run.status.is_terminal())
            .collect())
    }

    /// The task's schedule cursor; zeros when never fired.
    pub fn cursor(&self, task_id: TaskId) -> Result<TaskCursor> {
        self.kv.view(|tx| {
            match tx.get(&cursor_key(task_id))? {
                Some(value) => decode_record(&value),
                None => Ok(TaskCursor::default()),
            }
        })
    }

    /// Check-and-set advance of `latest_scheduled`. Equal values are a
    /// no-op (replay after restart); regressions are a `conflict`.
    pub fn advance_latest_scheduled(&self, task_id: TaskId, to: i64) -> Result<()> {
        self.kv.update(|tx| {
            let key = cursor_key(task_id);
            let mut cursor: TaskCursor = match tx.get(&key)? {
                Some(value) => decode_record(&value)?,
                None => TaskCursor::default(),
            };
            if to < cursor.latest_scheduled {
                return Err(RillError::Conflict(format!(
                    "latest_scheduled of task {task_id} is {} > {to}",
                    cursor.latest_scheduled
                )));
            }
            if to == cursor.latest_scheduled {
                return Ok(());
            }
            cursor.latest_scheduled = to;
            tx.put(&key, &encode_record(&cursor)?)
        })
    }

    /// Check-and-set advance of `latest_completed`, bounded by
    /// `latest_scheduled`.
    pub fn advance_latest_completed(&self, task_id: TaskId, to: i64) -> Result<()> {
        self.kv.update(|tx| {
            let key = cursor_key(task_id);
            let mut cursor: TaskCursor = match tx.get(&key)? {
                Some(value) => decode_record(&value)?,
                None => TaskCursor::default(),
            };
            if to < cursor.latest_completed {
                return Err(RillError::Conflict(format!(
                    "latest_completed of task {task_id} is {} > {to}",
                    cursor.latest_completed
                )));
            }
            if to > cursor.latest_scheduled {
                return Err(RillError::Conflict(format!(
                    "latest_completed {to} would pass latest_scheduled {}",
                    cursor.latest_scheduled
                )));
            }
            cursor.latest_completed = to;
            tx.put(&key, &encode_record(&cursor)?)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::ScheduleSpec;
    use crate::task::TaskStatus;
    use rill_kv::MemKv;

    fn store() -> TaskStore<MemKv> {
        TaskStore::new(Arc::new(MemKv::new()))
    }

    fn descriptor() -> TaskDescriptor {
        TaskDescriptor {
            id: TaskId(0),
            org: OrgId(7),
            name: "rollup".into(),
            schedule: ScheduleSpec::Every { seconds: 60 },
            offset_secs: 0,
            program: "{}".into(),
            status: TaskStatus::Active,
            owner_id: 42,
            created_at: 1_000,
        }
    }

    #[test]
    fn task_crud_round_trips() {
        let store = store();
        let created = store.create_task(descriptor()).unwrap();
        assert_ne!(created.id, TaskId(0));
        assert_eq!(store.get_task(created.id).unwrap(), created);

        let mut updated = created.clone();
        updated.status = TaskStatus::Inactive;
        store.update_task(&updated).unwrap();
        assert_eq!(store.get_task(created.id).unwrap().status, TaskStatus::Inactive);

        assert_eq!(store.list_tasks(Some(OrgId(7))).unwrap().len(), 1);
        assert_eq!(store.list_tasks(Some(OrgId(8))).unwrap().len(), 0);

        store.delete_task(created.id).unwrap();
        assert!(store.get_task(created.id).is_err());
    }

    #[test]
    fn run_updates_reject_terminal_mutation() {
        let store = store();
        let task = store.create_task(descriptor()).unwrap();
        let mut run = store.create_run(task.id, 5_000).unwrap();
        assert_eq!(run.status, RunStatus::Scheduled);

        run.status = RunStatus::Success;
        run.finished_at = Some(6_000);
        store.update_run(&run).unwrap();

        run.status = RunStatus::Failed;
        let err = store.update_run(&run).unwrap_err();
        assert_eq!(err.kind(), rill_common::ErrorKind::Conflict);
    }

    #[test]
    fn cursors_advance_monotonically() {
        let store = store();
        let task = store.create_task(descriptor()).unwrap();

        store.advance_latest_scheduled(task.id, 100).unwrap();
        // Replays of the same value are a no-op.
        store.advance_latest_scheduled(task.id, 100).unwrap();
        let err = store.advance_latest_scheduled(task.id, 50).unwrap_err();
        assert_eq!(err.kind(), rill_common::ErrorKind::Conflict);

        // latest_completed never passes latest_scheduled.
        let err = store.advance_latest_completed(task.id, 150).unwrap_err();
        assert_eq!(err.kind(), rill_common::ErrorKind::Conflict);
        store.advance_latest_completed(task.id, 100).unwrap();

        let cursor = store.cursor(task.id).unwrap();
        assert_eq!(cursor.latest_scheduled, 100);
        assert_eq!(cursor.latest_completed, 100);
    }

    #[test]
    fn records_ignore_trailing_bytes() {
        let run = Run {
            id: RunId(1),
            task_id: TaskId(2),
            scheduled_for: 3,
            started_at: None,
            finished_at: None,
            status: RunStatus::Scheduled,
            error: None,
            log: Vec::new(),
        };
        let mut encoded = encode_record(&run).unwrap();
        encoded.extend_from_slice(b"future-extension");
        let decoded: Run = decode_record(&encoded).unwrap();
        assert_eq!(decoded, run);
    }

    #[test]
    fn delete_task_removes_runs_and_cursor() {
        let store = store();
        let task = store.create_task(descriptor()).unwrap();
        store.create_run(task.id, 1).unwrap();
        store.create_run(task.id, 2).unwrap();
        store.advance_latest_scheduled(task.id, 2).unwrap();

        store.delete_task(task.id).unwrap();
        assert!(store.list_runs(task.id).unwrap().is_empty());
        assert_eq!(store.cursor(task.id).unwrap(), TaskCursor::default());
    }
}
