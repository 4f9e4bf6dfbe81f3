use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Metrics collector for observability
#[derive(Debug, Default)]
pub struct Metrics {
    /// Route reconciles completed (any outcome)
    pub route_reconciles: AtomicU64,
    /// Monitor reconciles completed (any outcome)
    pub monitor_reconciles: AtomicU64,
    /// Reconciles that returned a retryable error
    pub reconcile_errors: AtomicU64,
    /// Routes rejected by validation
    pub validation_failures: AtomicU64,
    /// Monitor records created by the route watcher
    pub monitors_created: AtomicU64,
    /// Monitor records updated by the route watcher
    pub monitors_updated: AtomicU64,
    /// Monitor records deleted by the route watcher
    pub monitors_deleted: AtomicU64,
    /// Calls made to the monitoring service
    pub external_creates: AtomicU64,
    pub external_updates: AtomicU64,
    pub external_deletes: AtomicU64,
}

impl Metrics {
    /// Create a new metrics instance
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// Get current metrics as a formatted string
    pub fn summary(&self) -> String {
        format!(
            "reconciles route={} monitor={} errors={} invalid={} | records +{} ~{} -{} | external +{} ~{} -{}",
            Self::get(&self.route_reconciles),
            Self::get(&self.monitor_reconciles),
            Self::get(&self.reconcile_errors),
            Self::get(&self.validation_failures),
            Self::get(&self.monitors_created),
            Self::get(&self.monitors_updated),
            Self::get(&self.monitors_deleted),
            Self::get(&self.external_creates),
            Self::get(&self.external_updates),
            Self::get(&self.external_deletes),
        )
    }

    /// Export metrics in Prometheus format
    pub fn prometheus(&self) -> String {
        format!(
            r#"# HELP routewatch_reconciles_total Reconciles completed per controller
# TYPE routewatch_reconciles_total counter
routewatch_reconciles_total{{controller="route"}} {}
routewatch_reconciles_total{{controller="monitor"}} {}

# HELP routewatch_reconcile_errors_total Reconciles that failed and were requeued
# TYPE routewatch_reconcile_errors_total counter
routewatch_reconcile_errors_total {}

# HELP routewatch_validation_failures_total Routes rejected by validation
# TYPE routewatch_validation_failures_total counter
routewatch_validation_failures_total {}

# HELP routewatch_monitor_writes_total Monitor records written by the route watcher
# TYPE routewatch_monitor_writes_total counter
routewatch_monitor_writes_total{{op="create"}} {}
routewatch_monitor_writes_total{{op="update"}} {}
routewatch_monitor_writes_total{{op="delete"}} {}

# HELP routewatch_external_calls_total Calls to the monitoring service
# TYPE routewatch_external_calls_total counter
routewatch_external_calls_total{{op="create"}} {}
routewatch_external_calls_total{{op="update"}} {}
routewatch_external_calls_total{{op="delete"}} {}
"#,
            Self::get(&self.route_reconciles),
            Self::get(&self.monitor_reconciles),
            Self::get(&self.reconcile_errors),
            Self::get(&self.validation_failures),
            Self::get(&self.monitors_created),
            Self::get(&self.monitors_updated),
            Self::get(&self.monitors_deleted),
            Self::get(&self.external_creates),
            Self::get(&self.external_updates),
            Self::get(&self.external_deletes),
        )
    }

    /// Log periodic status
    pub fn log_status(&self) {
        info!("{}", self.summary());
    }
}
