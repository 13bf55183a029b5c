//! The query controller: admission, fair queueing, memory budgets, and
//! cancellation for dataflow programs.
//!
//! Submission is cheap: the program is fingerprinted and either promoted
//! to running (reserving its initial memory from the pool) or queued
//! FIFO. The read work itself runs lazily on whichever worker drains the
//! query's [`QueryResults`] stream; a query reaches a terminal state when
//! its stream ends, errors, is canceled, or is dropped, and each terminal
//! transition releases memory and promotes as many queued queries as fit.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::program::{Program, ProgramContext};
use rill_common::{
    Allocator, ControllerConfig, ErrorKind, MemoryPool, MetricsRegistry, OrgId, QueryId, Result,
    RillError,
};
use rill_storage::{BoxTableStream, StorageReader, Table, TableStream};

/// Lifecycle of one query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    /// Waiting for admission.
    Queued,
    /// Admitted; its stream may be drained.
    Running,
    /// Stream fully consumed.
    Finished,
    /// Terminated by an error.
    Errored,
    /// Terminated by cancellation.
    Canceled,
}

impl QueryState {
    fn is_terminal(self) -> bool {
        matches!(
            self,
            QueryState::Finished | QueryState::Errored | QueryState::Canceled
        )
    }

    fn as_str(self) -> &'static str {
        match self {
            QueryState::Queued => "queued",
            QueryState::Running => "running",
            QueryState::Finished => "finished",
            QueryState::Errored => "errored",
            QueryState::Canceled => "canceled",
        }
    }
}

/// How a query terminated.
enum Outcome {
    Finished,
    Errored(ErrorKind, String),
    Canceled,
}

struct StateCell {
    state: QueryState,
    error: Option<(ErrorKind, String)>,
    promoted_at: Option<Instant>,
}

struct QueryShared {
    id: QueryId,
    fingerprint: String,
    org: OrgId,
    submitted_at: Instant,
    cancel: CancellationToken,
    alloc: OnceLock<Allocator>,
    cell: Mutex<StateCell>,
}

impl QueryShared {
    fn state(&self) -> QueryState {
        self.cell.lock().state
    }

    fn terminal_error(&self) -> Option<RillError> {
        let cell = self.cell.lock();
        match cell.state {
            QueryState::Errored => cell
                .error
                .as_ref()
                .map(|(kind, msg)| RillError::from_kind(*kind, msg.clone())),
            QueryState::Canceled => Some(RillError::Canceled(format!(
                "query {} was canceled",
                self.id
            ))),
            _ => None,
        }
    }
}

struct Pending {
    shared: Arc<QueryShared>,
    program: Arc<dyn Program>,
    results_tx: oneshot::Sender<Result<QueryResults>>,
}

struct CtrlState {
    queue: VecDeque<Pending>,
    running: usize,
    active: HashMap<QueryId, Arc<QueryShared>>,
    next_id: u64,
    shutdown: bool,
}

struct ControllerInner {
    config: ControllerConfig,
    pool: Arc<MemoryPool>,
    metrics: MetricsRegistry,
    reader: StorageReader,
    state: Mutex<CtrlState>,
    drained: Notify,
}

/// The admission-controlled query executor.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<ControllerInner>,
}

impl Controller {
    /// Build a controller over a storage reader.
    pub fn new(config: ControllerConfig, reader: StorageReader, metrics: MetricsRegistry) -> Self {
        let pool = MemoryPool::new(config.effective_max_memory_bytes());
        Self {
            inner: Arc::new(ControllerInner {
                config,
                pool,
                metrics,
                reader,
                state: Mutex::new(CtrlState {
                    queue: VecDeque::new(),
                    running: 0,
                    active: HashMap::new(),
                    next_id: 1,
                    shutdown: false,
                }),
                drained: Notify::new(),
            }),
        }
    }

    /// Submit a program for execution as `org`.
    ///
    /// Fails fast with `resource exhausted` when the queue is full and
    /// with `unavailable` after shutdown began.
    pub fn submit(&self, program: Arc<dyn Program>, org: OrgId) -> Result<Query> {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if state.shutdown {
            return Err(RillError::Unavailable("controller is shutting down".into()));
        }
        if state.queue.len() >= inner.config.queue_size {
            return Err(RillError::ResourceExhausted(format!(
                "query queue is full ({} queued)",
                state.queue.len()
            )));
        }
        let id = QueryId(state.next_id);
        state.next_id += 1;
        let fingerprint = fingerprint(org, program.source());
        let shared = Arc::new(QueryShared {
            id,
            fingerprint,
            org,
            submitted_at: Instant::now(),
            cancel: CancellationToken::new(),
            alloc: OnceLock::new(),
            cell: Mutex::new(StateCell {
                state: QueryState::Queued,
                error: None,
                promoted_at: None,
            }),
        });
        let (results_tx, results_rx) = oneshot::channel();
        state.queue.push_back(Pending {
            shared: Arc::clone(&shared),
            program,
            results_tx,
        });
        debug!(query = %id, org = %org, "query submitted");
        let orphans = inner.try_promote(&mut state);
        inner.update_gauges(&state);
        drop(state);
        drop(orphans);
        Ok(Query {
            shared,
            results: Some(results_rx),
            controller: Arc::downgrade(&self.inner),
        })
    }

    /// Render the controller's metrics registry.
    pub fn prometheus_metrics(&self) -> String {
        self.inner.metrics.render_prometheus()
    }

    /// Bytes currently reserved across all running queries.
    pub fn memory_used(&self) -> u64 {
        self.inner.pool.used()
    }

    /// Drain: stop admitting, cancel every query, wait up to `deadline`
    /// for streams to settle, then force-release whatever remains.
    pub async fn shutdown(&self, deadline: Duration) {
        let inner = &self.inner;
        let (drained_queue, active) = {
            let mut state = inner.state.lock();
            state.shutdown = true;
            let drained: Vec<Pending> = state.queue.drain(..).collect();
            let active: Vec<Arc<QueryShared>> = state.active.values().cloned().collect();
            inner.update_gauges(&state);
            (drained, active)
        };
        for pending in drained_queue {
            inner.mark_terminal(&pending.shared, Outcome::Canceled);
            let _ = pending
                .results_tx
                .send(Err(RillError::Canceled("controller shut down".into())));
        }
        for shared in &active {
            shared.cancel.cancel();
        }
        info!(active = active.len(), "controller draining");

        let wait_all = async {
            loop {
                if self.inner.state.lock().active.is_empty() {
                    return;
                }
                self.inner.drained.notified().await;
            }
        };
        if tokio::time::timeout(deadline, wait_all).await.is_err() {
            // Force-release queries that did not settle in time.
            let leftovers: Vec<Arc<QueryShared>> = {
                let state = inner.state.lock();
                state.active.values().cloned().collect()
            };
            warn!(leftover = leftovers.len(), "controller shutdown deadline hit");
            for shared in leftovers {
                if inner.mark_terminal(&shared, Outcome::Canceled) {
                    inner.finish_running(shared.id);
                }
            }
        }
    }
}

impl ControllerInner {
    /// Promote queue heads in order while capacity and memory allow.
    ///
    /// Caller holds the state lock. Streams whose handle is already gone
    /// are returned instead of dropped: their Drop re-enters the state
    /// lock, so the caller must release it first.
    #[must_use]
    fn try_promote(self: &Arc<Self>, state: &mut CtrlState) -> Vec<QueryResults> {
        let mut orphans = Vec::new();
        loop {
            let Some(front) = state.queue.front() else {
                return orphans;
            };
            // Cancellation while queued: drop out of the queue without
            // consuming a running slot.
            if front.shared.cancel.is_cancelled() {
                let pending = state.queue.pop_front().expect("front exists");
                self.mark_terminal(&pending.shared, Outcome::Canceled);
                let _ = pending.results_tx.send(Err(RillError::Canceled(format!(
                    "query {} was canceled",
                    pending.shared.id
                ))));
                continue;
            }
            if state.running >= self.config.concurrency_quota {
                return orphans;
            }
            let alloc = match Allocator::with_pool(
                Arc::clone(&self.pool),
                self.config.initial_memory_bytes_quota_per_query,
                self.config.memory_bytes_quota_per_query,
            ) {
                Ok(alloc) => alloc,
                // The head does not fit; promotion stays strict FIFO.
                Err(_) => return orphans,
            };
            let pending = state.queue.pop_front().expect("front exists");
            let shared = pending.shared;
            let _ = shared.alloc.set(alloc.clone());
            {
                let mut cell = shared.cell.lock();
                cell.state = QueryState::Running;
                cell.promoted_at = Some(Instant::now());
            }
            state.running += 1;
            state.active.insert(shared.id, Arc::clone(&shared));
            self.metrics
                .observe_queue_latency(shared.submitted_at.elapsed());
            debug!(query = %shared.id, "query promoted");

            let results = QueryResults {
                shared: Arc::clone(&shared),
                program: Some(pending.program),
                stream: None,
                controller: Arc::clone(self),
            };
            if let Err(Ok(results)) = pending.results_tx.send(Ok(results)) {
                orphans.push(results);
            }
        }
    }

    /// Transition to a terminal state once; releases the reservation and
    /// records terminal metrics. Returns false when already terminal.
    fn mark_terminal(&self, shared: &QueryShared, outcome: Outcome) -> bool {
        let (prior, elapsed) = {
            let mut cell = shared.cell.lock();
            if cell.state.is_terminal() {
                return false;
            }
            let prior = cell.state;
            cell.state = match &outcome {
                Outcome::Finished => QueryState::Finished,
                Outcome::Errored(kind, msg) => {
                    cell.error = Some((*kind, msg.clone()));
                    QueryState::Errored
                }
                Outcome::Canceled => QueryState::Canceled,
            };
            (prior, cell.promoted_at.map(|at| at.elapsed()))
        };
        if let Some(alloc) = shared.alloc.get() {
            alloc.release_all();
        }
        if let Some(elapsed) = elapsed {
            self.metrics.observe_execution_latency(elapsed);
        }
        self.metrics
            .inc_queries_completed(shared.state().as_str());
        debug!(query = %shared.id, from = prior.as_str(), to = shared.state().as_str(), "query terminal");
        true
    }

    /// Bookkeeping after a running query reached a terminal state.
    fn finish_running(self: &Arc<Self>, id: QueryId) {
        let orphans = {
            let mut state = self.state.lock();
            if state.active.remove(&id).is_none() {
                return;
            }
            state.running -= 1;
            let orphans = self.try_promote(&mut state);
            self.update_gauges(&state);
            if state.active.is_empty() {
                self.drained.notify_waiters();
            }
            orphans
        };
        drop(orphans);
    }

    /// Asynchronous, idempotent cancel.
    fn cancel_query(self: &Arc<Self>, id: QueryId) {
        let mut state = self.state.lock();
        if let Some(at) = state.queue.iter().position(|p| p.shared.id == id) {
            let pending = state.queue.remove(at).expect("index in range");
            self.mark_terminal(&pending.shared, Outcome::Canceled);
            let _ = pending.results_tx.send(Err(RillError::Canceled(format!(
                "query {id} was canceled"
            ))));
            let orphans = self.try_promote(&mut state);
            self.update_gauges(&state);
            drop(state);
            drop(orphans);
            return;
        }
        let Some(shared) = state.active.get(&id).cloned() else {
            return;
        };
        drop(state);
        shared.cancel.cancel();
        if self.mark_terminal(&shared, Outcome::Canceled) {
            self.finish_running(id);
        }
    }

    fn update_gauges(&self, state: &CtrlState) {
        self.metrics.set_queries_queued(state.queue.len());
        self.metrics.set_queries_running(state.running);
        self.metrics.set_memory_used_bytes(self.pool.used());
    }
}

fn fingerprint(org: OrgId, source: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(org.0.to_be_bytes());
    hasher.update(source.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Handle to a submitted query.
pub struct Query {
    shared: Arc<QueryShared>,
    results: Option<oneshot::Receiver<Result<QueryResults>>>,
    controller: Weak<ControllerInner>,
}

impl Query {
    /// Controller-assigned identifier.
    pub fn id(&self) -> QueryId {
        self.shared.id
    }

    /// Fingerprint of (org, program source).
    pub fn fingerprint(&self) -> &str {
        &self.shared.fingerprint
    }

    /// Organization the query runs as.
    pub fn org(&self) -> OrgId {
        self.shared.org
    }

    /// Current lifecycle state.
    pub fn state(&self) -> QueryState {
        self.shared.state()
    }

    /// Bytes this query currently holds against its quota.
    pub fn memory_used(&self) -> u64 {
        self.shared.alloc.get().map(|a| a.used()).unwrap_or(0)
    }

    /// Terminal error, when the query errored or was canceled.
    pub fn error(&self) -> Option<RillError> {
        self.shared.terminal_error()
    }

    /// Await admission and return the result stream. Single-shot.
    pub async fn results(&mut self) -> Result<QueryResults> {
        let rx = self.results.take().ok_or_else(|| {
            RillError::Internal(format!("query {} results taken twice", self.shared.id))
        })?;
        match rx.await {
            Ok(results) => results,
            Err(_) => Err(self.shared.terminal_error().unwrap_or_else(|| {
                RillError::Internal(format!("query {} lost its controller", self.shared.id))
            })),
        }
    }

    /// Request cancellation; asynchronous and idempotent.
    pub fn cancel(&self) {
        self.shared.cancel.cancel();
        if let Some(inner) = self.controller.upgrade() {
            inner.cancel_query(self.shared.id);
        }
    }
}

/// The lazy result stream of an admitted query.
///
/// The program starts on the first poll; every poll observes cancellation
/// and terminal state before touching the underlying read stream.
pub struct QueryResults {
    shared: Arc<QueryShared>,
    program: Option<Arc<dyn Program>>,
    stream: Option<BoxTableStream>,
    controller: Arc<ControllerInner>,
}

impl QueryResults {
    fn settle(&self, outcome: Outcome) {
        if self.controller.mark_terminal(&self.shared, outcome) {
            self.controller.finish_running(self.shared.id);
        }
    }
}

impl TableStream for QueryResults {
    fn next_table(&mut self) -> Result<Option<Table>> {
        if let Some(err) = self.shared.terminal_error() {
            return Err(err);
        }
        if self.shared.cancel.is_cancelled() {
            self.settle(Outcome::Canceled);
            return Err(RillError::Canceled(format!(
                "query {} was canceled",
                self.shared.id
            )));
        }
        if self.stream.is_none() {
            let program = self.program.take().ok_or_else(|| {
                RillError::Internal(format!(
                    "query {} polled after terminal state",
                    self.shared.id
                ))
            })?;
            let alloc = self
                .shared
                .alloc
                .get()
                .cloned()
                .unwrap_or_else(Allocator::unlimited);
            let ctx = ProgramContext {
                org: self.shared.org,
                alloc,
                cancel: self.shared.cancel.clone(),
                reader: self.controller.reader.clone(),
            };
            match program.start(&ctx) {
                Ok(stream) => self.stream = Some(stream),
                Err(err) => {
                    self.settle(Outcome::Errored(err.kind(), err.message()));
                    return Err(err);
                }
            }
        }
        match self.stream.as_mut().expect("stream started").next_table() {
            Ok(Some(table)) => Ok(Some(table)),
            Ok(None) => {
                self.settle(Outcome::Finished);
                Ok(None)
            }
            Err(err) => {
                self.settle(Outcome::Errored(err.kind(), err.message()));
                Err(err)
            }
        }
    }
}

impl Drop for QueryResults {
    fn drop(&mut self) {
        // An unconsumed stream counts as canceled; a fully consumed or
        // errored one is already terminal and this is a no-op.
        self.settle(Outcome::Canceled);
    }
}

#[cfg(test)]
mod tests {
    use super::fingerprint;
    use rill_common::OrgId;

    #[test]
    fn fingerprints_differ_by_org_and_source() {
        let a = fingerprint(OrgId(1), "x");
        let b = fingerprint(OrgId(2), "x");
        let c = fingerprint(OrgId(1), "y");
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, fingerprint(OrgId(1), "x"));
    }
}
