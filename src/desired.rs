//! Desired-state derivation
//!
//! Maps a route definition to the health check it asks for. Pure: no store or
//! network access, so every rule here is covered by plain unit tests.

use serde::{Deserialize, Serialize};

use crate::domain::{MonitorSpec, Route, MONITOR_TYPE_HTTP};
use crate::error::{OperatorError, Result};

/// Route annotation carrying a URL path suffix
pub const PATH_ANNOTATION: &str = "routewatch.dev/path";
/// Route annotation overriding the check interval (decimal seconds)
pub const INTERVAL_ANNOTATION: &str = "routewatch.dev/interval";
/// Route annotation; `"false"` or `"disabled"` turns monitoring off
pub const MONITOR_ANNOTATION: &str = "routewatch.dev/monitor";

/// Interval used when neither the route nor the process configures one
pub const FALLBACK_INTERVAL: &str = "30";

/// Health check a route asks for, recomputed on every reconcile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredMonitorSpec {
    pub target: String,
    pub interval: String,
    pub enabled: bool,
}

impl DesiredMonitorSpec {
    pub fn to_monitor_spec(&self) -> MonitorSpec {
        MonitorSpec {
            kind: MONITOR_TYPE_HTTP.to_string(),
            target: self.target.clone(),
            interval: self.interval.clone(),
        }
    }
}

/// Whether the route opts in to monitoring. Absent or any other value enables it.
pub fn monitoring_enabled(route: &Route) -> bool {
    !matches!(route.annotation(MONITOR_ANNOTATION), Some("false" | "disabled"))
}

/// Build `scheme://host[path]` from the first rule of the route
pub fn target_url(route: &Route) -> Result<String> {
    let rule = route
        .rules
        .first()
        .ok_or_else(|| OperatorError::validation(&route.key, "no rules found in route"))?;

    if rule.host.is_empty() {
        return Err(OperatorError::validation(
            &route.key,
            "no host found in first route rule",
        ));
    }

    let scheme = if route.tls.is_empty() { "http" } else { "https" };
    let mut target = format!("{}://{}", scheme, rule.host);

    if let Some(path) = route.annotation(PATH_ANNOTATION).and_then(normalize_path) {
        target.push_str(&path);
    }

    Ok(target)
}

/// Leading slash added, one trailing slash removed (except for `/` itself).
/// Empty input means no path.
pub fn normalize_path(raw: &str) -> Option<String> {
    if raw.is_empty() {
        return None;
    }

    let mut path = if raw.starts_with('/') {
        raw.to_string()
    } else {
        format!("/{}", raw)
    };

    if path.len() > 1 && path.ends_with('/') {
        path.pop();
    }

    Some(path)
}

/// Route annotation, then process default, then [`FALLBACK_INTERVAL`]
pub fn resolve_interval(route: &Route, default_interval: Option<&str>) -> String {
    route
        .annotation(INTERVAL_ANNOTATION)
        .filter(|v| !v.is_empty())
        .or(default_interval.filter(|v| !v.is_empty()))
        .unwrap_or(FALLBACK_INTERVAL)
        .to_string()
}

/// Derive the desired monitor for a route.
///
/// Validates even disabled routes; use [`monitoring_enabled`] alone when only
/// the cleanup decision is needed.
pub fn derive_desired(route: &Route, default_interval: Option<&str>) -> Result<DesiredMonitorSpec> {
    Ok(DesiredMonitorSpec {
        target: target_url(route)?,
        interval: resolve_interval(route, default_interval),
        enabled: monitoring_enabled(route),
    })
}
