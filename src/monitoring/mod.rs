//! External monitoring service interface
//!
//! The service addresses checks by an opaque id and offers no fetch-by-id,
//! so `update` is a blind "set desired state": callers always send the full
//! request and repeated calls converge.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};

use crate::domain::Monitor;
use crate::error::Result;

/// Retry count sent with every check when none is configured
pub const DEFAULT_RETRY_COUNT: i32 = 0;

/// Full desired state of one external check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorRequest {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub target: String,
    pub interval: String,
    pub retry_count: i32,
}

impl MonitorRequest {
    pub fn from_monitor(monitor: &Monitor, retry_count: i32) -> Self {
        Self {
            name: monitor.name().to_string(),
            kind: monitor.spec.kind.clone(),
            target: monitor.spec.target.clone(),
            interval: monitor.spec.interval.clone(),
            retry_count,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// The record was already gone
    NotFound,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait MonitoringService: Send + Sync {
    /// Create a check and return its identifier
    async fn create(&self, request: &MonitorRequest) -> Result<String>;

    /// Overwrite the check `id` with `request`.
    /// A missing record surfaces as `OperatorError::ExternalNotFound`.
    async fn update(&self, id: &str, request: &MonitorRequest) -> Result<()>;

    async fn delete(&self, id: &str) -> Result<DeleteOutcome>;
}
