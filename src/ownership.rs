//! Ownership markers written on generated Monitors, and the single predicate
//! both cleanup paths and the update path consult.

use std::collections::BTreeMap;

use crate::domain::{Monitor, ObjectKey, OwnerReference, Route};

pub const SOURCE_LABEL: &str = "routewatch.dev/source";
pub const SOURCE_LABEL_VALUE: &str = "route-watcher";
pub const TARGET_TYPE_LABEL: &str = "routewatch.dev/target-type";
pub const AUTO_GENERATED_ANNOTATION: &str = "routewatch.dev/auto-generated";
pub const SOURCE_ROUTE_ANNOTATION: &str = "routewatch.dev/source-route";

pub const ROUTE_API_VERSION: &str = "networking.k8s.io/v1";
pub const ROUTE_KIND: &str = "Ingress";

/// How a Monitor relates to the route watcher for a given route key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ownership {
    /// Carries the ownership label and points at this route (or at nothing)
    Managed,
    /// No ownership label: created by someone else
    Unmanaged,
    /// Ownership label present but generated for a different route
    ForeignSource(String),
}

impl Ownership {
    pub fn is_managed(&self) -> bool {
        matches!(self, Ownership::Managed)
    }
}

/// Decide whether `monitor` is ours to update or delete on behalf of `route_key`.
///
/// A record is managed when it has `source=route-watcher` and its
/// source-route annotation, if present, names `route_key`.
pub fn ownership(monitor: &Monitor, route_key: &ObjectKey) -> Ownership {
    if monitor.metadata.label(SOURCE_LABEL) != Some(SOURCE_LABEL_VALUE) {
        return Ownership::Unmanaged;
    }

    match monitor.metadata.annotation(SOURCE_ROUTE_ANNOTATION) {
        Some(source) if source != route_key.to_string() => {
            Ownership::ForeignSource(source.to_string())
        }
        _ => Ownership::Managed,
    }
}

pub fn managed_labels() -> BTreeMap<String, String> {
    BTreeMap::from([
        (SOURCE_LABEL.to_string(), SOURCE_LABEL_VALUE.to_string()),
        (TARGET_TYPE_LABEL.to_string(), "http".to_string()),
    ])
}

pub fn managed_annotations(route_key: &ObjectKey) -> BTreeMap<String, String> {
    BTreeMap::from([
        (AUTO_GENERATED_ANNOTATION.to_string(), "true".to_string()),
        (SOURCE_ROUTE_ANNOTATION.to_string(), route_key.to_string()),
    ])
}

/// Controller owner link so the platform garbage-collects the Monitor with its route.
/// Routes without a uid (not yet persisted) get no link.
pub fn route_owner_reference(route: &Route) -> Option<OwnerReference> {
    let uid = route.uid.as_ref()?;
    Some(OwnerReference {
        api_version: ROUTE_API_VERSION.to_string(),
        kind: ROUTE_KIND.to_string(),
        name: route.key.name.clone(),
        uid: uid.clone(),
        controller: true,
        block_owner_deletion: true,
    })
}

/// Route a Monitor was generated from: source annotation first, then a route owner link
pub fn source_route(monitor: &Monitor) -> Option<ObjectKey> {
    if let Some(source) = monitor.metadata.annotation(SOURCE_ROUTE_ANNOTATION) {
        if let Ok(key) = source.parse() {
            return Some(key);
        }
    }

    monitor
        .metadata
        .owner_references
        .iter()
        .find(|o| o.kind == ROUTE_KIND && o.controller)
        .map(|o| ObjectKey::new(monitor.key.namespace.clone(), o.name.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MonitorSpec;

    fn monitor() -> Monitor {
        Monitor::new(ObjectKey::new("default", "web"), MonitorSpec::default())
    }

    #[test]
    fn test_unlabelled_monitor_is_unmanaged() {
        let key = ObjectKey::new("default", "web");
        assert_eq!(ownership(&monitor(), &key), Ownership::Unmanaged);

        let mut m = monitor();
        m.metadata
            .labels
            .insert(SOURCE_LABEL.to_string(), "someone-else".to_string());
        assert_eq!(ownership(&m, &key), Ownership::Unmanaged);
    }

    #[test]
    fn test_labelled_monitor_is_managed() {
        let key = ObjectKey::new("default", "web");
        let mut m = monitor();
        m.metadata.labels = managed_labels();
        assert!(ownership(&m, &key).is_managed());

        m.metadata.annotations = managed_annotations(&key);
        assert!(ownership(&m, &key).is_managed());
    }

    #[test]
    fn test_source_mismatch_is_not_managed() {
        let key = ObjectKey::new("default", "web");
        let mut m = monitor();
        m.metadata.labels = managed_labels();
        m.metadata.annotations = managed_annotations(&ObjectKey::new("other", "web"));
        assert_eq!(
            ownership(&m, &key),
            Ownership::ForeignSource("other/web".to_string())
        );
    }

    #[test]
    fn test_owner_reference_requires_uid() {
        let route = Route::new(ObjectKey::new("default", "web"));
        assert!(route_owner_reference(&route).is_none());

        let owner = route_owner_reference(&route.with_uid("uid-1")).unwrap();
        assert_eq!(owner.kind, "Ingress");
        assert_eq!(owner.name, "web");
        assert!(owner.controller);
    }

    #[test]
    fn test_source_route_falls_back_to_owner() {
        let mut m = monitor();
        assert_eq!(source_route(&m), None);

        let route = Route::new(ObjectKey::new("default", "site")).with_uid("u");
        m.metadata
            .owner_references
            .push(route_owner_reference(&route).unwrap());
        assert_eq!(source_route(&m), Some(ObjectKey::new("default", "site")));

        m.metadata.annotations = managed_annotations(&ObjectKey::new("default", "web"));
        assert_eq!(source_route(&m), Some(ObjectKey::new("default", "web")));
    }
}
