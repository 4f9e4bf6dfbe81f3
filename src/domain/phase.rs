use serde::{Deserialize, Serialize};
use std::fmt;

use super::{Lifecycle, Monitor};

/// Finalizer that blocks removal of a Monitor until its external record is cleaned up
pub const MONITOR_FINALIZER: &str = "monitoring.routewatch.dev/finalizer";

/// Lifecycle reconciler states, derived from a stored Monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MonitorPhase {
    /// No finalizer yet
    Fresh,
    /// Finalizer attached, not yet created remotely
    Armed,
    /// Finalizer attached and external id recorded
    Synced,
    /// Deletion requested
    Deleting,
    /// Removed from the store
    Gone,
}

impl MonitorPhase {
    /// Deletion takes precedence over every other observation.
    pub fn of(monitor: &Monitor) -> Self {
        match monitor.metadata.lifecycle {
            Lifecycle::Gone => MonitorPhase::Gone,
            Lifecycle::PendingDeletion => MonitorPhase::Deleting,
            Lifecycle::Active => {
                if !monitor.metadata.has_finalizer(MONITOR_FINALIZER) {
                    MonitorPhase::Fresh
                } else if monitor.external_id().is_none() {
                    MonitorPhase::Armed
                } else {
                    MonitorPhase::Synced
                }
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorPhase::Fresh => "FRESH",
            MonitorPhase::Armed => "ARMED",
            MonitorPhase::Synced => "SYNCED",
            MonitorPhase::Deleting => "DELETING",
            MonitorPhase::Gone => "GONE",
        }
    }

    /// Check if one reconcile step may move a record from this phase to `target`
    pub fn can_transition_to(&self, target: MonitorPhase) -> bool {
        use MonitorPhase::*;

        match (self, target) {
            (Fresh, Armed) => true,
            (Armed, Synced) => true,
            // Repeated pushes leave the record where it is
            (Synced, Synced) => true,
            (Fresh | Armed | Synced, Deleting) => true,
            (Deleting, Gone) => true,
            _ => false,
        }
    }
}

impl fmt::Display for MonitorPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
