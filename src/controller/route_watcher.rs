//! Route Watcher
//!
//! Reconciles one route key: creates, updates or deletes the Monitor record
//! stored under the same key. Monitors without the ownership label are never
//! touched.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{cancellable, Action, Reconciler};
use crate::desired::{derive_desired, monitoring_enabled, DesiredMonitorSpec};
use crate::domain::{Monitor, ObjectKey, Route, MONITOR_TYPE_HTTP};
use crate::error::{OperatorError, Result};
use crate::ownership::{
    managed_annotations, managed_labels, ownership, route_owner_reference, Ownership,
};
use crate::services::Metrics;
use crate::store::{MonitorStore, RouteStore};

/// Retry delay while an old Monitor is still draining its finalizer
const DELETION_POLL_DELAY: Duration = Duration::from_secs(5);

/// Result of one route reconcile
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Created,
    Updated { fields: Vec<&'static str> },
    Unchanged,
    Deleted,
    /// Route gone or disabled and no Monitor exists
    NothingToClean,
    /// Monitor exists but is not ours
    Skipped(Ownership),
    /// Route enabled but the old Monitor is still being deleted
    DeletionInProgress,
    /// Route gone or disabled and the Monitor is already being deleted
    CleanupPending,
}

/// Why a Monitor is being removed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CleanupReason {
    RouteDeleted,
    MonitoringDisabled,
}

impl CleanupReason {
    fn as_str(&self) -> &'static str {
        match self {
            CleanupReason::RouteDeleted => "route deleted",
            CleanupReason::MonitoringDisabled => "monitoring disabled",
        }
    }
}

/// The Monitor record generated for `route`: same key, ownership markers and
/// an owner link when the route has a uid
pub fn generated_monitor(route: &Route, desired: &DesiredMonitorSpec) -> Monitor {
    let mut monitor = Monitor::new(route.key.clone(), desired.to_monitor_spec());
    monitor.metadata.labels = managed_labels();
    monitor.metadata.annotations = managed_annotations(&route.key);
    monitor.metadata.owner_references = route_owner_reference(route).into_iter().collect();
    monitor
}

pub struct RouteWatcher {
    routes: Arc<dyn RouteStore>,
    monitors: Arc<dyn MonitorStore>,
    default_interval: Option<String>,
    metrics: Arc<Metrics>,
}

impl RouteWatcher {
    pub fn new(
        routes: Arc<dyn RouteStore>,
        monitors: Arc<dyn MonitorStore>,
        default_interval: Option<String>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            routes,
            monitors,
            default_interval: default_interval.filter(|v| !v.is_empty()),
            metrics,
        }
    }

    pub async fn reconcile_route(
        &self,
        key: &ObjectKey,
        cancel: &CancellationToken,
    ) -> Result<RouteOutcome> {
        let route = match cancellable(cancel, self.routes.get_route(key)).await? {
            Some(route) => route,
            None => {
                info!(route = %key, "Route not found, checking for monitor to clean up");
                return self.cleanup(key, CleanupReason::RouteDeleted, cancel).await;
            }
        };

        if !monitoring_enabled(&route) {
            info!(route = %key, "Monitoring disabled for route via annotation");
            return self
                .cleanup(key, CleanupReason::MonitoringDisabled, cancel)
                .await;
        }

        let desired = match derive_desired(&route, self.default_interval.as_deref()) {
            Ok(desired) => desired,
            Err(e) => {
                Metrics::inc(&self.metrics.validation_failures);
                return Err(e);
            }
        };

        match cancellable(cancel, self.monitors.get_monitor(key)).await? {
            None => self.create_monitor(&route, &desired, cancel).await,
            Some(monitor) => {
                self.update_if_needed(monitor, &route.key, &desired, cancel)
                    .await
            }
        }
    }

    async fn create_monitor(
        &self,
        route: &Route,
        desired: &DesiredMonitorSpec,
        cancel: &CancellationToken,
    ) -> Result<RouteOutcome> {
        if route.uid.is_none() {
            warn!(route = %route.key, "Route has no uid, creating monitor without owner link");
        }
        let monitor = generated_monitor(route, desired);

        info!(
            monitor = %monitor.key,
            target = %monitor.spec.target,
            interval = %monitor.spec.interval,
            "Creating monitor for route"
        );
        cancellable(cancel, self.monitors.create_monitor(&monitor)).await?;
        Metrics::inc(&self.metrics.monitors_created);

        Ok(RouteOutcome::Created)
    }

    async fn update_if_needed(
        &self,
        mut monitor: Monitor,
        route_key: &ObjectKey,
        desired: &DesiredMonitorSpec,
        cancel: &CancellationToken,
    ) -> Result<RouteOutcome> {
        let owner = ownership(&monitor, route_key);
        if !owner.is_managed() {
            info!(monitor = %monitor.key, ?owner, "Monitor not created by route watcher, skipping update");
            return Ok(RouteOutcome::Skipped(owner));
        }

        if monitor.is_deletion_requested() {
            debug!(monitor = %monitor.key, "Monitor is being deleted, waiting before recreating");
            return Ok(RouteOutcome::DeletionInProgress);
        }

        let mut fields = Vec::new();

        if monitor.spec.target != desired.target {
            info!(
                monitor = %monitor.key,
                current = %monitor.spec.target,
                expected = %desired.target,
                "Target mismatch, updating monitor"
            );
            monitor.spec.target = desired.target.clone();
            fields.push("target");
        }

        if monitor.spec.interval != desired.interval {
            info!(
                monitor = %monitor.key,
                current = %monitor.spec.interval,
                expected = %desired.interval,
                "Interval mismatch, updating monitor"
            );
            monitor.spec.interval = desired.interval.clone();
            fields.push("interval");
        }

        if monitor.spec.kind != MONITOR_TYPE_HTTP {
            info!(
                monitor = %monitor.key,
                current = %monitor.spec.kind,
                expected = MONITOR_TYPE_HTTP,
                "Type mismatch, updating monitor"
            );
            monitor.spec.kind = MONITOR_TYPE_HTTP.to_string();
            fields.push("type");
        }

        if fields.is_empty() {
            debug!(monitor = %monitor.key, "Monitor is up to date");
            return Ok(RouteOutcome::Unchanged);
        }

        cancellable(cancel, self.monitors.update_monitor(&monitor)).await?;
        Metrics::inc(&self.metrics.monitors_updated);
        info!(monitor = %monitor.key, ?fields, "Updated monitor");

        Ok(RouteOutcome::Updated { fields })
    }

    async fn cleanup(
        &self,
        key: &ObjectKey,
        reason: CleanupReason,
        cancel: &CancellationToken,
    ) -> Result<RouteOutcome> {
        let monitor = match cancellable(cancel, self.monitors.get_monitor(key)).await? {
            Some(monitor) => monitor,
            None => {
                debug!(route = %key, reason = reason.as_str(), "No monitor to clean up");
                return Ok(RouteOutcome::NothingToClean);
            }
        };

        let owner = ownership(&monitor, key);
        if !owner.is_managed() {
            info!(monitor = %monitor.key, ?owner, "Monitor not created by route watcher, not cleaning up");
            return Ok(RouteOutcome::Skipped(owner));
        }

        if monitor.is_deletion_requested() {
            debug!(monitor = %monitor.key, "Monitor deletion already requested");
            return Ok(RouteOutcome::CleanupPending);
        }

        info!(monitor = %monitor.key, reason = reason.as_str(), "Deleting monitor");
        match cancellable(cancel, self.monitors.delete_monitor(key)).await {
            Ok(()) => {}
            Err(OperatorError::NotFound { .. }) => {
                debug!(monitor = %key, "Monitor already deleted");
            }
            Err(e) => return Err(e),
        }
        Metrics::inc(&self.metrics.monitors_deleted);

        Ok(RouteOutcome::Deleted)
    }
}

#[async_trait]
impl Reconciler for RouteWatcher {
    fn name(&self) -> &'static str {
        "route-watcher"
    }

    async fn reconcile(&self, key: &ObjectKey, cancel: &CancellationToken) -> Result<Action> {
        let outcome = self.reconcile_route(key, cancel).await;
        Metrics::inc(&self.metrics.route_reconciles);

        match outcome? {
            RouteOutcome::DeletionInProgress => Ok(Action::RequeueAfter(DELETION_POLL_DELAY)),
            _ => Ok(Action::Done),
        }
    }
}
