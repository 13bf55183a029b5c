use std::sync::Arc;
use std::time::Duration;

use prometheus::{
    CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};

/// Shared metrics surface for the controller, scheduler, and executor.
///
/// Cloning shares the underlying registry; components record through typed
/// methods and the composition layer renders the Prometheus text format.
#[derive(Clone, Debug)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    registry: Registry,

    queries_queued: Gauge,
    queries_running: Gauge,
    queries_completed: CounterVec,
    query_queue_seconds: Histogram,
    query_execution_seconds: Histogram,
    memory_used_bytes: Gauge,

    scheduler_pending: Gauge,
    scheduler_fires: CounterVec,
    scheduler_behind: Gauge,

    executor_runs: CounterVec,
    executor_run_seconds: Histogram,
}

impl MetricsRegistry {
    /// Create a registry with every Rill metric family registered.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::new()),
        }
    }

    /// A query entered or left the queued state.
    pub fn set_queries_queued(&self, queued: usize) {
        self.inner.queries_queued.set(queued as f64);
    }

    /// A query entered or left the running state.
    pub fn set_queries_running(&self, running: usize) {
        self.inner.queries_running.set(running as f64);
    }

    /// A query reached a terminal state: `finished`, `errored`, `canceled`.
    pub fn inc_queries_completed(&self, state: &str) {
        self.inner
            .queries_completed
            .with_label_values(&[state])
            .inc();
    }

    /// Time a query spent waiting for admission.
    pub fn observe_queue_latency(&self, wait: Duration) {
        self.inner
            .query_queue_seconds
            .observe(wait.as_secs_f64().max(0.0));
    }

    /// Time from promotion to terminal state.
    pub fn observe_execution_latency(&self, elapsed: Duration) {
        self.inner
            .query_execution_seconds
            .observe(elapsed.as_secs_f64().max(0.0));
    }

    /// Current process-wide query memory reservation.
    pub fn set_memory_used_bytes(&self, bytes: u64) {
        self.inner.memory_used_bytes.set(bytes as f64);
    }

    /// Tasks currently enrolled with a pending fire.
    pub fn set_scheduler_pending(&self, pending: usize) {
        self.inner.scheduler_pending.set(pending as f64);
    }

    /// A task instance was handed to the executor pool.
    pub fn inc_scheduler_fires(&self, status: &str) {
        self.inner.scheduler_fires.with_label_values(&[status]).inc();
    }

    /// Due fires that could not be dispatched because the pool is saturated.
    pub fn set_scheduler_behind(&self, behind: usize) {
        self.inner.scheduler_behind.set(behind as f64);
    }

    /// A run reached a terminal state: `success`, `failed`, `canceled`.
    pub fn inc_executor_runs(&self, status: &str) {
        self.inner.executor_runs.with_label_values(&[status]).inc();
    }

    /// Wall time of one executed run.
    pub fn observe_run_latency(&self, elapsed: Duration) {
        self.inner
            .executor_run_seconds
            .observe(elapsed.as_secs_f64().max(0.0));
    }

    /// Render everything in the Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let metric_families = self.inner.registry.gather();
        let mut out = Vec::new();
        let enc = TextEncoder::new();
        if enc.encode(&metric_families, &mut out).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&out).to_string()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsInner {
    fn new() -> Self {
        let registry = Registry::new();

        let queries_queued = gauge(
            &registry,
            "rill_query_queued",
            "Queries currently waiting for admission",
        );
        let queries_running = gauge(
            &registry,
            "rill_query_running",
            "Queries currently executing",
        );
        let queries_completed = counter_vec(
            &registry,
            "rill_query_completed_total",
            "Queries by terminal state",
            &["state"],
        );
        let query_queue_seconds = histogram(
            &registry,
            "rill_query_queue_seconds",
            "Time queries spend waiting for admission",
        );
        let query_execution_seconds = histogram(
            &registry,
            "rill_query_execution_seconds",
            "Time from promotion to terminal state",
        );
        let memory_used_bytes = gauge(
            &registry,
            "rill_query_memory_used_bytes",
            "Process-wide query memory reservation",
        );

        let scheduler_pending = gauge(
            &registry,
            "rill_scheduler_pending_tasks",
            "Tasks enrolled with a pending fire",
        );
        let scheduler_fires = counter_vec(
            &registry,
            "rill_scheduler_fires_total",
            "Task instances dispatched to the executor pool",
            &["status"],
        );
        let scheduler_behind = gauge(
            &registry,
            "rill_scheduler_behind_tasks",
            "Due fires waiting on a saturated executor pool",
        );

        let executor_runs = counter_vec(
            &registry,
            "rill_executor_runs_total",
            "Task runs by terminal status",
            &["status"],
        );
        let executor_run_seconds = histogram(
            &registry,
            "rill_executor_run_seconds",
            "Wall time of executed runs",
        );

        Self {
            registry,
            queries_queued,
            queries_running,
            queries_completed,
            query_queue_seconds,
            query_execution_seconds,
            memory_used_bytes,
            scheduler_pending,
            scheduler_fires,
            scheduler_behind,
            executor_runs,
            executor_run_seconds,
        }
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> CounterVec {
    let c = CounterVec::new(Opts::new(name, help), labels).expect("counter vec");
    registry
        .register(Box::new(c.clone()))
        .expect("register counter");
    c
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Gauge {
    let g = Gauge::with_opts(Opts::new(name, help)).expect("gauge");
    registry
        .register(Box::new(g.clone()))
        .expect("register gauge");
    g
}

fn histogram(registry: &Registry, name: &str, help: &str) -> Histogram {
    let h = Histogram::with_opts(HistogramOpts::new(name, help)).expect("histogram");
    registry
        .register(Box::new(h.clone()))
        .expect("register histogram");
    h
}

#[cfg(test)]
mod tests {
    use super::MetricsRegistry;
    use std::time::Duration;

    #[test]
    fn renders_prometheus_text() {
        let m = MetricsRegistry::new();
        m.set_queries_running(2);
        m.inc_queries_completed("finished");
        m.observe_queue_latency(Duration::from_millis(5));
        let text = m.render_prometheus();
        assert!(text.contains("rill_query_running"));
        assert!(text.contains("rill_query_completed_total"));
        assert!(text.contains("finished"));
    }

    #[test]
    fn renders_all_metric_families() {
        let m = MetricsRegistry::new();
        m.set_queries_queued(1);
        m.set_queries_running(1);
        m.inc_queries_completed("errored");
        m.observe_queue_latency(Duration::from_millis(1));
        m.observe_execution_latency(Duration::from_millis(2));
        m.set_memory_used_bytes(1024);
        m.set_scheduler_pending(3);
        m.inc_scheduler_fires("ok");
        m.set_scheduler_behind(1);
        m.inc_executor_runs("success");
        m.observe_run_latency(Duration::from_millis(3));
        let text = m.render_prometheus();

        assert!(text.contains("rill_query_queued"));
        assert!(text.contains("rill_query_queue_seconds"));
        assert!(text.contains("rill_query_execution_seconds"));
        assert!(text.contains("rill_query_memory_used_bytes"));
        assert!(text.contains("rill_scheduler_pending_tasks"));
        assert!(text.contains("rill_scheduler_fires_total"));
        assert!(text.contains("rill_scheduler_behind_tasks"));
        assert!(text.contains("rill_executor_runs_total"));
        assert!(text.contains("rill_executor_run_seconds"));
    }
}
