//! Monitor Lifecycle Reconciler
//!
//! Mirrors one Monitor record into the external monitoring service:
//!
//! - `Fresh`: attach the finalizer and stop, so no external side effect can
//!   happen before deletion is guaranteed to be reconcilable
//! - `Armed`: create the external check and record its id in status
//! - `Synced`: push the full spec to the stored id (blind upsert)
//! - `Deleting`: delete the external check, then release the finalizer

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{cancellable, Action, Reconciler};
use crate::domain::{Monitor, MonitorPhase, ObjectKey, ResourceKind, MONITOR_FINALIZER};
use crate::error::{ExternalOperation, OperatorError, Result};
use crate::monitoring::{DeleteOutcome, MonitorRequest, MonitoringService};
use crate::services::Metrics;
use crate::store::MonitorStore;

/// Attempts at recording a freshly created external id when the status write conflicts
const STATUS_WRITE_ATTEMPTS: u32 = 3;

/// Result of one Monitor reconcile
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleOutcome {
    /// Record not found (already removed)
    Absent,
    FinalizerAttached,
    Created { external_id: String },
    /// Full spec pushed to the existing external check
    Pushed,
    /// Finalizer removed; the store may now drop the record
    Released { external_deleted: bool },
    /// Deletion in progress but our finalizer is already gone
    AlreadyReleased,
}

impl LifecycleOutcome {
    /// Phase the record is in after this outcome, when it moved or was rewritten
    pub fn phase(&self) -> Option<MonitorPhase> {
        match self {
            LifecycleOutcome::FinalizerAttached => Some(MonitorPhase::Armed),
            LifecycleOutcome::Created { .. } | LifecycleOutcome::Pushed => {
                Some(MonitorPhase::Synced)
            }
            LifecycleOutcome::Released { .. } => Some(MonitorPhase::Gone),
            LifecycleOutcome::Absent | LifecycleOutcome::AlreadyReleased => None,
        }
    }
}

pub struct MonitorLifecycleReconciler {
    monitors: Arc<dyn MonitorStore>,
    service: Arc<dyn MonitoringService>,
    retry_count: i32,
    metrics: Arc<Metrics>,
}

impl MonitorLifecycleReconciler {
    pub fn new(
        monitors: Arc<dyn MonitorStore>,
        service: Arc<dyn MonitoringService>,
        retry_count: i32,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            monitors,
            service,
            retry_count,
            metrics,
        }
    }

    pub async fn reconcile_monitor(
        &self,
        key: &ObjectKey,
        cancel: &CancellationToken,
    ) -> Result<LifecycleOutcome> {
        let monitor = match cancellable(cancel, self.monitors.get_monitor(key)).await? {
            Some(monitor) => monitor,
            None => {
                debug!(monitor = %key, "Monitor not found, nothing to do");
                return Ok(LifecycleOutcome::Absent);
            }
        };

        let phase = MonitorPhase::of(&monitor);
        debug!(monitor = %key, %phase, "Reconciling monitor");

        let outcome = match phase {
            MonitorPhase::Gone => LifecycleOutcome::Absent,
            MonitorPhase::Deleting => self.finalize(monitor, cancel).await?,
            MonitorPhase::Fresh => self.attach_finalizer(monitor, cancel).await?,
            MonitorPhase::Armed => self.create_external(monitor, cancel).await?,
            MonitorPhase::Synced => self.push_external(&monitor, cancel).await?,
        };

        if let Some(next) = outcome.phase() {
            debug_assert!(
                phase.can_transition_to(next),
                "illegal monitor transition {} -> {}",
                phase,
                next
            );
            if next != phase {
                debug!(monitor = %key, from = %phase, to = %next, "Monitor phase advanced");
            }
        }
        Ok(outcome)
    }

    async fn attach_finalizer(
        &self,
        mut monitor: Monitor,
        cancel: &CancellationToken,
    ) -> Result<LifecycleOutcome> {
        monitor.metadata.add_finalizer(MONITOR_FINALIZER);
        if let Err(e) = cancellable(cancel, self.monitors.update_monitor(&monitor)).await {
            error!(monitor = %monitor.key, error = %e, "Failed to add finalizer");
            return Err(e);
        }

        info!(monitor = %monitor.key, "Added finalizer to monitor");
        Ok(LifecycleOutcome::FinalizerAttached)
    }

    async fn create_external(
        &self,
        mut monitor: Monitor,
        cancel: &CancellationToken,
    ) -> Result<LifecycleOutcome> {
        let request = MonitorRequest::from_monitor(&monitor, self.retry_count);
        info!(monitor = %monitor.key, target = %request.target, "Creating monitor in monitoring service");

        Metrics::inc(&self.metrics.external_creates);
        let external_id = match cancellable(cancel, self.service.create(&request)).await {
            Ok(id) if !id.is_empty() => id,
            Ok(_) => {
                return Err(OperatorError::External {
                    operation: ExternalOperation::Create,
                    subject: monitor.key.to_string(),
                    status: None,
                    message: "response carried no id".to_string(),
                })
            }
            Err(e) => {
                error!(monitor = %monitor.key, error = %e, "Failed to create monitor in monitoring service");
                return Err(e);
            }
        };

        monitor.status.external_id = external_id.clone();
        self.persist_external_id(monitor, cancel).await?;

        info!(external_id = %external_id, "Created monitor in monitoring service and updated status");
        Ok(LifecycleOutcome::Created { external_id })
    }

    /// Write the new external id to status. Version conflicts (usually a
    /// concurrent spec update) re-read the record and retry the write.
    async fn persist_external_id(
        &self,
        mut monitor: Monitor,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let external_id = monitor.status.external_id.clone();
        let mut attempt = 1;

        loop {
            match cancellable(cancel, self.monitors.update_monitor_status(&monitor)).await {
                Ok(_) => return Ok(()),
                Err(e) if e.is_conflict() && attempt < STATUS_WRITE_ATTEMPTS => {
                    warn!(monitor = %monitor.key, attempt, "Status write conflicted, re-reading monitor");
                    attempt += 1;

                    let latest = cancellable(cancel, self.monitors.get_monitor(&monitor.key))
                        .await?
                        .ok_or_else(|| OperatorError::NotFound {
                            kind: ResourceKind::Monitor,
                            key: monitor.key.clone(),
                        })?;

                    if let Some(existing) = latest.external_id() {
                        if existing != external_id {
                            return Err(OperatorError::Internal(format!(
                                "monitor {} already records external id {}, created {}",
                                monitor.key, existing, external_id
                            )));
                        }
                        return Ok(());
                    }

                    monitor = latest;
                    monitor.status.external_id = external_id.clone();
                }
                Err(e) => {
                    error!(
                        monitor = %monitor.key,
                        external_id = %external_id,
                        error = %e,
                        "Failed to update Monitor status with external ID"
                    );
                    return Err(e);
                }
            }
        }
    }

    async fn push_external(
        &self,
        monitor: &Monitor,
        cancel: &CancellationToken,
    ) -> Result<LifecycleOutcome> {
        let external_id = monitor.status.external_id.as_str();
        let request = MonitorRequest::from_monitor(monitor, self.retry_count);
        debug!(external_id, "Updating monitor in monitoring service");

        Metrics::inc(&self.metrics.external_updates);
        match cancellable(cancel, self.service.update(external_id, &request)).await {
            Ok(()) => {
                debug!(external_id, "Updated monitor in monitoring service");
                Ok(LifecycleOutcome::Pushed)
            }
            Err(e) if e.is_not_found() => {
                // Recreation is deliberately not attempted; the id stays recorded.
                warn!(
                    monitor = %monitor.key,
                    external_id,
                    error = %e,
                    "Update failed, monitor might have been deleted externally"
                );
                Err(e)
            }
            Err(e) => {
                error!(monitor = %monitor.key, external_id, error = %e, "Failed to update monitor in monitoring service");
                Err(e)
            }
        }
    }

    async fn finalize(
        &self,
        mut monitor: Monitor,
        cancel: &CancellationToken,
    ) -> Result<LifecycleOutcome> {
        if !monitor.metadata.has_finalizer(MONITOR_FINALIZER) {
            debug!(monitor = %monitor.key, "Finalizer not found, nothing to do");
            return Ok(LifecycleOutcome::AlreadyReleased);
        }

        let mut external_deleted = false;
        if let Some(external_id) = monitor.external_id() {
            info!(external_id, "Deleting monitor from monitoring service");

            Metrics::inc(&self.metrics.external_deletes);
            match cancellable(cancel, self.service.delete(external_id)).await {
                Ok(DeleteOutcome::Deleted) => {
                    info!(external_id, "Deleted monitor from monitoring service");
                    external_deleted = true;
                }
                Ok(DeleteOutcome::NotFound) => {
                    info!(external_id, "Monitor already deleted in monitoring service");
                }
                Err(e) if e.is_not_found() => {
                    info!(external_id, "Monitor already deleted in monitoring service");
                }
                Err(e) => {
                    error!(external_id, error = %e, "Failed to delete monitor in monitoring service");
                    return Err(e);
                }
            }
        }

        monitor.metadata.remove_finalizer(MONITOR_FINALIZER);
        if let Err(e) = cancellable(cancel, self.monitors.update_monitor(&monitor)).await {
            error!(monitor = %monitor.key, error = %e, "Failed to remove finalizer");
            return Err(e);
        }

        info!(monitor = %monitor.key, "Removed finalizer, monitor will be deleted");
        Ok(LifecycleOutcome::Released { external_deleted })
    }
}

#[async_trait]
impl Reconciler for MonitorLifecycleReconciler {
    fn name(&self) -> &'static str {
        "monitor-lifecycle"
    }

    async fn reconcile(&self, key: &ObjectKey, cancel: &CancellationToken) -> Result<Action> {
        let outcome = self.reconcile_monitor(key, cancel).await;
        Metrics::inc(&self.metrics.monitor_reconciles);
        outcome.map(|_| Action::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Lifecycle, MonitorSpec};
    use crate::error::StoreOperation;
    use crate::monitoring::MockMonitoringService;
    use crate::store::MockMonitorStore;

    fn key() -> ObjectKey {
        ObjectKey::new("default", "my-app")
    }

    fn fresh() -> Monitor {
        let mut m = Monitor::new(
            key(),
            MonitorSpec {
                kind: "http".to_string(),
                target: "http://myapp.example.com/health".to_string(),
                interval: "30".to_string(),
            },
        );
        m.metadata.resource_version = Some("1".to_string());
        m
    }

    fn armed() -> Monitor {
        let mut m = fresh();
        m.metadata.add_finalizer(MONITOR_FINALIZER);
        m
    }

    fn synced() -> Monitor {
        let mut m = armed();
        m.status.external_id = "ext-42".to_string();
        m
    }

    fn deleting(mut m: Monitor) -> Monitor {
        m.metadata.lifecycle = Lifecycle::PendingDeletion;
        m
    }

    fn store_returning(monitor: Option<Monitor>) -> MockMonitorStore {
        let mut store = MockMonitorStore::new();
        store
            .expect_get_monitor()
            .returning(move |_| Ok(monitor.clone()));
        store
    }

    fn reconciler(store: MockMonitorStore, service: MockMonitoringService) -> MonitorLifecycleReconciler {
        MonitorLifecycleReconciler::new(Arc::new(store), Arc::new(service), 0, Arc::new(Metrics::new()))
    }

    async fn run(r: &MonitorLifecycleReconciler) -> Result<LifecycleOutcome> {
        r.reconcile_monitor(&key(), &CancellationToken::new()).await
    }

    #[tokio::test]
    async fn test_fresh_monitor_only_attaches_finalizer() {
        let mut store = store_returning(Some(fresh()));
        store
            .expect_update_monitor()
            .times(1)
            .withf(|m| m.metadata.has_finalizer(MONITOR_FINALIZER))
            .returning(|m| Ok(m.clone()));

        let mut service = MockMonitoringService::new();
        service.expect_create().times(0);

        let outcome = run(&reconciler(store, service)).await.unwrap();
        assert_eq!(outcome, LifecycleOutcome::FinalizerAttached);
    }

    #[tokio::test]
    async fn test_armed_monitor_is_created_and_status_written() {
        let mut store = store_returning(Some(armed()));
        store
            .expect_update_monitor_status()
            .times(1)
            .withf(|m| m.status.external_id == "ext-1")
            .returning(|m| Ok(m.clone()));

        let mut service = MockMonitoringService::new();
        service
            .expect_create()
            .times(1)
            .withf(|req| {
                req.name == "my-app"
                    && req.kind == "http"
                    && req.target == "http://myapp.example.com/health"
                    && req.interval == "30"
                    && req.retry_count == 0
            })
            .returning(|_| Ok("ext-1".to_string()));

        let outcome = run(&reconciler(store, service)).await.unwrap();
        assert_eq!(
            outcome,
            LifecycleOutcome::Created {
                external_id: "ext-1".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_create_failure_leaves_status_untouched() {
        let mut store = store_returning(Some(armed()));
        store.expect_update_monitor_status().times(0);

        let mut service = MockMonitoringService::new();
        service.expect_create().returning(|_| {
            Err(OperatorError::External {
                operation: ExternalOperation::Create,
                subject: "my-app".to_string(),
                status: Some(503),
                message: "unavailable".to_string(),
            })
        });

        let err = run(&reconciler(store, service)).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_status_conflict_is_retried_with_latest_version() {
        let mut store = MockMonitorStore::new();
        let mut seq = mockall::Sequence::new();
        store
            .expect_get_monitor()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Some(armed())));
        store
            .expect_update_monitor_status()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|m| {
                Err(OperatorError::Conflict {
                    kind: ResourceKind::Monitor,
                    key: m.key.clone(),
                    operation: StoreOperation::UpdateStatus,
                })
            });
        store
            .expect_get_monitor()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| {
                let mut latest = armed();
                latest.metadata.resource_version = Some("2".to_string());
                Ok(Some(latest))
            });
        store
            .expect_update_monitor_status()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|m| {
                m.metadata.resource_version.as_deref() == Some("2") && m.status.external_id == "ext-1"
            })
            .returning(|m| Ok(m.clone()));

        let mut service = MockMonitoringService::new();
        service
            .expect_create()
            .times(1)
            .returning(|_| Ok("ext-1".to_string()));

        let outcome = run(&reconciler(store, service)).await.unwrap();
        assert!(matches!(outcome, LifecycleOutcome::Created { .. }));
    }

    #[tokio::test]
    async fn test_synced_monitor_pushes_full_spec() {
        let store = store_returning(Some(synced()));

        let mut service = MockMonitoringService::new();
        service
            .expect_update()
            .times(1)
            .withf(|id, req| id == "ext-42" && req.target == "http://myapp.example.com/health")
            .returning(|_, _| Ok(()));
        service.expect_create().times(0);

        let outcome = run(&reconciler(store, service)).await.unwrap();
        assert_eq!(outcome, LifecycleOutcome::Pushed);
    }

    #[tokio::test]
    async fn test_update_not_found_keeps_external_id() {
        let mut store = store_returning(Some(synced()));
        store.expect_update_monitor_status().times(0);
        store.expect_update_monitor().times(0);

        let mut service = MockMonitoringService::new();
        service.expect_update().returning(|id, _| {
            Err(OperatorError::ExternalNotFound {
                operation: ExternalOperation::Update,
                id: id.to_string(),
            })
        });
        service.expect_create().times(0);

        let err = run(&reconciler(store, service)).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_deletion_removes_external_then_finalizer() {
        let mut store = store_returning(Some(deleting(synced())));
        store
            .expect_update_monitor()
            .times(1)
            .withf(|m| !m.metadata.has_finalizer(MONITOR_FINALIZER))
            .returning(|m| Ok(m.clone()));

        let mut service = MockMonitoringService::new();
        service
            .expect_delete()
            .times(1)
            .withf(|id| id == "ext-42")
            .returning(|_| Ok(DeleteOutcome::Deleted));

        let outcome = run(&reconciler(store, service)).await.unwrap();
        assert_eq!(
            outcome,
            LifecycleOutcome::Released {
                external_deleted: true
            }
        );
    }

    #[tokio::test]
    async fn test_deletion_tolerates_external_not_found() {
        let mut store = store_returning(Some(deleting(synced())));
        store
            .expect_update_monitor()
            .times(1)
            .withf(|m| m.metadata.finalizers.is_empty())
            .returning(|m| Ok(m.clone()));

        let mut service = MockMonitoringService::new();
        service
            .expect_delete()
            .returning(|_| Ok(DeleteOutcome::NotFound));

        let outcome = run(&reconciler(store, service)).await.unwrap();
        assert_eq!(
            outcome,
            LifecycleOutcome::Released {
                external_deleted: false
            }
        );
    }

    #[tokio::test]
    async fn test_deletion_failure_retains_finalizer() {
        let mut store = store_returning(Some(deleting(synced())));
        store.expect_update_monitor().times(0);

        let mut service = MockMonitoringService::new();
        service.expect_delete().returning(|id| {
            Err(OperatorError::External {
                operation: ExternalOperation::Delete,
                subject: id.to_string(),
                status: Some(500),
                message: "boom".to_string(),
            })
        });

        assert!(run(&reconciler(store, service)).await.is_err());
    }

    #[tokio::test]
    async fn test_deletion_without_external_id_skips_service() {
        let mut store = store_returning(Some(deleting(armed())));
        store
            .expect_update_monitor()
            .times(1)
            .returning(|m| Ok(m.clone()));

        let mut service = MockMonitoringService::new();
        service.expect_delete().times(0);

        let outcome = run(&reconciler(store, service)).await.unwrap();
        assert_eq!(
            outcome,
            LifecycleOutcome::Released {
                external_deleted: false
            }
        );
    }

    #[tokio::test]
    async fn test_deletion_without_finalizer_is_noop() {
        let mut store = store_returning(Some(deleting(fresh())));
        store.expect_update_monitor().times(0);

        let mut service = MockMonitoringService::new();
        service.expect_delete().times(0);

        let outcome = run(&reconciler(store, service)).await.unwrap();
        assert_eq!(outcome, LifecycleOutcome::AlreadyReleased);
    }

    #[tokio::test]
    async fn test_missing_monitor_is_noop() {
        let store = store_returning(None);
        let service = MockMonitoringService::new();

        let outcome = run(&reconciler(store, service)).await.unwrap();
        assert_eq!(outcome, LifecycleOutcome::Absent);
    }

    #[tokio::test]
    async fn test_cancelled_reconcile_makes_no_calls() {
        let store = store_returning(Some(armed()));
        let mut service = MockMonitoringService::new();
        service.expect_create().times(0);
        let r = reconciler(store, service);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = r.reconcile_monitor(&key(), &cancel).await.unwrap_err();
        assert!(matches!(err, OperatorError::Cancelled));
    }

    #[test]
    fn test_outcomes_are_legal_phase_transitions() {
        let steps = [
            (fresh(), LifecycleOutcome::FinalizerAttached),
            (
                armed(),
                LifecycleOutcome::Created {
                    external_id: "ext-42".to_string(),
                },
            ),
            (synced(), LifecycleOutcome::Pushed),
            (
                deleting(synced()),
                LifecycleOutcome::Released {
                    external_deleted: true,
                },
            ),
        ];
        for (monitor, outcome) in steps {
            let from = MonitorPhase::of(&monitor);
            let to = outcome.phase().unwrap();
            assert!(from.can_transition_to(to), "{from} -> {to}");
        }

        assert_eq!(LifecycleOutcome::Absent.phase(), None);
        assert_eq!(LifecycleOutcome::AlreadyReleased.phase(), None);
    }
}
