use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::ObjectKey;

/// The only check type the route watcher produces
pub const MONITOR_TYPE_HTTP: &str = "http";

/// Explicit deletion lifecycle carried on every stored record.
///
/// Stores translate their native deletion marker (for Kubernetes, a set
/// `deletionTimestamp`) into this tag so the lifecycle reconciler never has to
/// inspect store-specific fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    #[default]
    Active,
    /// Deletion requested, blocked by at least one finalizer
    PendingDeletion,
    /// Removed from the store
    Gone,
}

impl Lifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Active => "active",
            Lifecycle::PendingDeletion => "pending_deletion",
            Lifecycle::Gone => "gone",
        }
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Link from a dependent record to the object that owns it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
    pub controller: bool,
    pub block_owner_deletion: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub finalizers: Vec<String>,
    pub owner_references: Vec<OwnerReference>,
    /// Optimistic concurrency token; `None` on records not yet stored
    pub resource_version: Option<String>,
    pub lifecycle: Lifecycle,
    pub deletion_requested_at: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    /// Returns true if the finalizer was added
    pub fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.has_finalizer(finalizer) {
            return false;
        }
        self.finalizers.push(finalizer.to_string());
        true
    }

    /// Returns true if the finalizer was present
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let before = self.finalizers.len();
        self.finalizers.retain(|f| f != finalizer);
        before != self.finalizers.len()
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorSpec {
    #[serde(rename = "type")]
    pub kind: String,
    pub target: String,
    /// Check interval in seconds, string encoded
    pub interval: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorStatus {
    /// Identifier assigned by the monitoring service; empty until created there
    #[serde(default)]
    pub external_id: String,
}

/// Declarative description of one external health check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Monitor {
    pub key: ObjectKey,
    pub metadata: ObjectMeta,
    pub spec: MonitorSpec,
    pub status: MonitorStatus,
}

impl Monitor {
    pub fn new(key: ObjectKey, spec: MonitorSpec) -> Self {
        Self {
            key,
            metadata: ObjectMeta::default(),
            spec,
            status: MonitorStatus::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.key.name
    }

    pub fn external_id(&self) -> Option<&str> {
        if self.status.external_id.is_empty() {
            None
        } else {
            Some(&self.status.external_id)
        }
    }

    pub fn is_deletion_requested(&self) -> bool {
        self.metadata.lifecycle != Lifecycle::Active
    }
}
