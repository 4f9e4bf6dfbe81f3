use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::ObjectKey;

/// Ingress-like route definition, read-only to the controllers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub key: ObjectKey,
    /// Cluster-assigned uid, needed for owner links
    #[serde(default)]
    pub uid: Option<String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub rules: Vec<RouteRule>,
    #[serde(default)]
    pub tls: Vec<RouteTls>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRule {
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub paths: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteTls {
    #[serde(default)]
    pub hosts: Vec<String>,
}

impl Route {
    pub fn new(key: ObjectKey) -> Self {
        Self {
            key,
            uid: None,
            annotations: BTreeMap::new(),
            rules: Vec::new(),
            tls: Vec::new(),
        }
    }

    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = Some(uid.into());
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.rules.push(RouteRule {
            host: host.into(),
            paths: Vec::new(),
        });
        self
    }

    pub fn with_tls(mut self, hosts: &[&str]) -> Self {
        self.tls.push(RouteTls {
            hosts: hosts.iter().map(|h| h.to_string()).collect(),
        });
        self
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }
}
