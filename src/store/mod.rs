//! Declarative API store interface
//!
//! Both controllers talk to the store only through these traits. Writes carry
//! the record's `resource_version`; a stale write fails with
//! [`OperatorError::Conflict`](crate::error::OperatorError::Conflict).

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::domain::{Monitor, ObjectKey, ResourceKind, Route};
use crate::error::Result;

/// Change notification for one object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: ResourceKind,
    pub key: ObjectKey,
    /// For Monitor events: the route the Monitor was generated from
    pub source_route: Option<ObjectKey>,
}

impl WatchEvent {
    pub fn route(key: ObjectKey) -> Self {
        Self {
            kind: ResourceKind::Route,
            key,
            source_route: None,
        }
    }

    pub fn monitor(key: ObjectKey, source_route: Option<ObjectKey>) -> Self {
        Self {
            kind: ResourceKind::Monitor,
            key,
            source_route,
        }
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait RouteStore: Send + Sync {
    /// `Ok(None)` when the route does not exist
    async fn get_route(&self, key: &ObjectKey) -> Result<Option<Route>>;

    async fn list_routes(&self) -> Result<Vec<Route>>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait MonitorStore: Send + Sync {
    /// `Ok(None)` when the monitor does not exist
    async fn get_monitor(&self, key: &ObjectKey) -> Result<Option<Monitor>>;

    async fn list_monitors(&self) -> Result<Vec<Monitor>>;

    async fn create_monitor(&self, monitor: &Monitor) -> Result<Monitor>;

    /// Replace spec and metadata; status is ignored
    async fn update_monitor(&self, monitor: &Monitor) -> Result<Monitor>;

    /// Replace status only
    async fn update_monitor_status(&self, monitor: &Monitor) -> Result<Monitor>;

    /// Request deletion. Records with finalizers move to `PendingDeletion`;
    /// a missing record yields `OperatorError::NotFound`.
    async fn delete_monitor(&self, key: &ObjectKey) -> Result<()>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait WatchSource: Send + Sync {
    /// Send an event for every existing object of `kind`, then for every
    /// change, until `cancel` fires or the receiver is dropped.
    async fn watch(
        &self,
        kind: ResourceKind,
        tx: mpsc::Sender<WatchEvent>,
        cancel: CancellationToken,
    ) -> Result<()>;
}
