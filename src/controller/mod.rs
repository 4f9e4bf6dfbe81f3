//! Reconcilers and the runtime that drives them
//!
//! `route_watcher` turns routes into Monitor records, `monitor_lifecycle`
//! mirrors Monitor records into the monitoring service. `queue` and `runtime`
//! provide per-key serialization and retry scheduling.

pub mod monitor_lifecycle;
pub mod queue;
pub mod route_watcher;
pub mod runtime;

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::domain::ObjectKey;
use crate::error::{OperatorError, Result};

pub use monitor_lifecycle::{LifecycleOutcome, MonitorLifecycleReconciler};
pub use queue::{BackoffPolicy, WorkQueue};
pub use route_watcher::{generated_monitor, RouteOutcome, RouteWatcher};
pub use runtime::{Controller, ControllerHandle, Operator, OperatorHandle, RuntimeSettings};

/// What the runtime should do with a key after a successful reconcile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Done,
    RequeueAfter(Duration),
}

#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn reconcile(&self, key: &ObjectKey, cancel: &CancellationToken) -> Result<Action>;
}

/// Race `fut` against `cancel`; a fired token wins with `OperatorError::Cancelled`
pub async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(OperatorError::Cancelled),
        result = fut => result,
    }
}
