use crate::error::Error;

use std::sync::Arc;

use opentelemetry::trace::TraceId;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::exemplar::HistogramWithExemplars;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::{Registry, Unit};
use tokio::time::Instant;

/// Process-wide metric families, registered under the `configbutler` prefix.
#[derive(Clone)]
pub struct Metrics {
    pub watch: WatchMetrics,
    pub correlation: CorrelationMetrics,
    pub git: GitMetrics,
    pub reconcile: ReconcileMetrics,
    pub ready: Gauge,
    pub registry: Arc<Registry>,
}

impl Metrics {
    pub fn new(mut registry: Registry) -> Self {
        let watch = WatchMetrics::default().register(&mut registry);
        let correlation = CorrelationMetrics::default().register(&mut registry);
        let git = GitMetrics::default().register(&mut registry);
        let reconcile = ReconcileMetrics::default().register(&mut registry);
        let ready = Gauge::default();
        registry.register(
            "ready",
            "1 once the watch plane and controllers are running",
            ready.clone(),
        );
        Self {
            watch,
            correlation,
            git,
            reconcile,
            ready,
            registry: Arc::new(registry),
        }
    }

    pub fn ready_set(&self, v: i64) {
        self.ready.set(v);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics::new(Registry::with_prefix("configbutler"))
    }
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug, Default)]
pub struct TraceLabel {
    pub id: String,
}

impl TryFrom<&TraceId> for TraceLabel {
    type Error = Error;

    fn try_from(id: &TraceId) -> Result<TraceLabel, Self::Error> {
        if std::matches!(id, &TraceId::INVALID) {
            Err(Error::InvalidTraceId)
        } else {
            Ok(Self { id: id.to_string() })
        }
    }
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug, Default)]
pub struct OperationLabel {
    pub operation: String,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug, Default)]
pub struct ErrorLabels {
    pub controller: String,
    pub error: String,
}

/// Per branch worker; the repo label is a short hash of the remote URL so
/// credentials embedded in URLs never reach the metrics endpoint.
#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug, Default)]
pub struct WorkerLabels {
    pub repo: String,
    pub branch: String,
}

#[derive(Clone)]
pub struct WatchMetrics {
    pub objects_scanned: Counter,
    pub events: Family<OperationLabel, Counter>,
    pub failures: Counter,
    pub active_informers: Gauge,
}

impl Default for WatchMetrics {
    fn default() -> Self {
        Self {
            objects_scanned: Counter::default(),
            events: Family::default(),
            failures: Counter::default(),
            active_informers: Gauge::default(),
        }
    }
}

impl WatchMetrics {
    pub fn register(self, r: &mut Registry) -> Self {
        r.register(
            "objects_scanned",
            "objects listed or watched by the dynamic watch plane",
            self.objects_scanned.clone(),
        );
        r.register(
            "watch_events",
            "enriched events handed to the router, by operation",
            self.events.clone(),
        );
        r.register(
            "watch_failures",
            "watch stream errors, including desyncs",
            self.failures.clone(),
        );
        r.register(
            "active_informers",
            "dynamic informers currently running",
            self.active_informers.clone(),
        );
        self
    }

    pub fn event_inc(&self, operation: crate::event::Operation) {
        self.events
            .get_or_create(&OperationLabel {
                operation: operation.to_string(),
            })
            .inc();
    }
}

#[derive(Clone)]
pub struct CorrelationMetrics {
    pub put: Counter,
    pub hit: Counter,
    pub miss: Counter,
    pub evictions: Counter,
}

impl Default for CorrelationMetrics {
    fn default() -> Self {
        Self {
            put: Counter::default(),
            hit: Counter::default(),
            miss: Counter::default(),
            evictions: Counter::default(),
        }
    }
}

impl CorrelationMetrics {
    pub fn register(self, r: &mut Registry) -> Self {
        r.register("corr_put", "admission records stored", self.put.clone());
        r.register("corr_hit", "watch events attributed", self.hit.clone());
        r.register("corr_miss", "watch events without attribution", self.miss.clone());
        r.register(
            "corr_evictions",
            "admission records evicted by the size bound",
            self.evictions.clone(),
        );
        self
    }
}

#[derive(Clone)]
pub struct GitMetrics {
    pub objects_written: Counter,
    pub files_deleted: Counter,
    pub commits: Counter,
    pub commit_bytes: Counter,
    pub rebase_retries: Counter,
    pub push_failures: Counter,
    pub queue_depth: Family<WorkerLabels, Gauge>,
}

impl Default for GitMetrics {
    fn default() -> Self {
        Self {
            objects_written: Counter::default(),
            files_deleted: Counter::default(),
            commits: Counter::default(),
            commit_bytes: Counter::default(),
            rebase_retries: Counter::default(),
            push_failures: Counter::default(),
            queue_depth: Family::default(),
        }
    }
}

impl GitMetrics {
    pub fn register(self, r: &mut Registry) -> Self {
        r.register(
            "objects_written",
            "resource files written into checkouts",
            self.objects_written.clone(),
        );
        r.register(
            "files_deleted",
            "resource files removed from checkouts",
            self.files_deleted.clone(),
        );
        r.register("commits", "commits created", self.commits.clone());
        r.register(
            "commit_bytes",
            "payload bytes included in commits",
            self.commit_bytes.clone(),
        );
        r.register(
            "rebase_retries",
            "push retries after non-fast-forward rejection",
            self.rebase_retries.clone(),
        );
        r.register(
            "push_failures",
            "pushes abandoned after the retry budget",
            self.push_failures.clone(),
        );
        r.register(
            "branch_worker_queue_depth",
            "events pending per branch worker",
            self.queue_depth.clone(),
        );
        self
    }

    pub fn queue_depth_set(&self, labels: &WorkerLabels, depth: usize) {
        self.queue_depth.get_or_create(labels).set(depth as i64);
    }
}

#[derive(Clone)]
pub struct ReconcileMetrics {
    pub runs: Counter,
    pub failures: Family<ErrorLabels, Counter>,
    pub startup_duration: HistogramWithExemplars<TraceLabel>,
}

impl Default for ReconcileMetrics {
    fn default() -> Self {
        Self {
            runs: Counter::default(),
            failures: Family::default(),
            startup_duration: HistogramWithExemplars::new(
                [0.1, 0.5, 1., 5., 15., 60., 300.].into_iter(),
            ),
        }
    }
}

impl ReconcileMetrics {
    pub fn register(self, r: &mut Registry) -> Self {
        r.register_with_unit(
            "reconcile_startup_duration",
            "wall time of per-destination startup reconciles",
            Unit::Seconds,
            self.startup_duration.clone(),
        );
        r.register(
            "reconcile_runs",
            "controller reconciliations",
            self.runs.clone(),
        );
        r.register(
            "reconcile_failures",
            "controller reconciliation errors",
            self.failures.clone(),
        );
        self
    }

    pub fn failure_inc(&self, controller: &str, error: &Error) {
        self.failures
            .get_or_create(&ErrorLabels {
                controller: controller.to_string(),
                error: error.metric_label(),
            })
            .inc();
    }

    pub fn startup_measure(&self, trace_id: &TraceId) -> StartupMeasurer {
        self.runs.inc();
        StartupMeasurer {
            start: Instant::now(),
            labels: trace_id.try_into().ok(),
            metric: self.startup_duration.clone(),
        }
    }
}

/// Observes the startup reconcile duration on drop.
pub struct StartupMeasurer {
    start: Instant,
    labels: Option<TraceLabel>,
    metric: HistogramWithExemplars<TraceLabel>,
}

impl Drop for StartupMeasurer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        let labels = self.labels.take();
        self.metric.observe(duration, labels);
    }
}
