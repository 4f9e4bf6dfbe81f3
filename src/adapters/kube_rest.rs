//! Kubernetes API server adapter over plain REST
//!
//! Ingresses are read from `networking.k8s.io/v1`, Monitors live in the
//! `monitoring.routewatch.dev/v1alpha1` custom resource with a `status`
//! subresource. Watches follow the list-then-watch protocol and fall back to
//! a relist when the server answers `410 Gone`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::KubeConfig;
use crate::domain::{
    Lifecycle, Monitor, MonitorSpec, MonitorStatus, ObjectKey, ObjectMeta, OwnerReference,
    ResourceKind, Route, RouteRule, RouteTls,
};
use crate::error::{OperatorError, Result, StoreOperation};
use crate::ownership;
use crate::store::{MonitorStore, RouteStore, WatchEvent, WatchSource};

pub const MONITOR_GROUP: &str = "monitoring.routewatch.dev";
pub const MONITOR_VERSION: &str = "v1alpha1";
pub const MONITOR_KIND: &str = "Monitor";

const INGRESS_API: &str = "/apis/networking.k8s.io/v1";
const INGRESS_PLURAL: &str = "ingresses";
const MONITOR_PLURAL: &str = "monitors";
const WATCH_TIMEOUT_SECS: u64 = 300;
/// Longest watch event line accepted before the watch is failed
const MAX_WATCH_LINE_BYTES: usize = 4 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owner_references: Vec<WireOwnerReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl WireMeta {
    fn key(&self, default_namespace: &str) -> ObjectKey {
        ObjectKey::new(
            self.namespace
                .clone()
                .unwrap_or_else(|| default_namespace.to_string()),
            self.name.clone(),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireOwnerReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
    #[serde(default)]
    pub controller: bool,
    #[serde(default)]
    pub block_owner_deletion: bool,
}

impl From<&WireOwnerReference> for OwnerReference {
    fn from(o: &WireOwnerReference) -> Self {
        OwnerReference {
            api_version: o.api_version.clone(),
            kind: o.kind.clone(),
            name: o.name.clone(),
            uid: o.uid.clone(),
            controller: o.controller,
            block_owner_deletion: o.block_owner_deletion,
        }
    }
}

impl From<&OwnerReference> for WireOwnerReference {
    fn from(o: &OwnerReference) -> Self {
        WireOwnerReference {
            api_version: o.api_version.clone(),
            kind: o.kind.clone(),
            name: o.name.clone(),
            uid: o.uid.clone(),
            controller: o.controller,
            block_owner_deletion: o.block_owner_deletion,
        }
    }
}

/// `networking.k8s.io/v1` Ingress, reduced to the fields routes need
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngressObject {
    #[serde(default)]
    pub metadata: WireMeta,
    #[serde(default)]
    pub spec: IngressSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngressSpec {
    #[serde(default)]
    pub rules: Vec<IngressRule>,
    #[serde(default)]
    pub tls: Vec<IngressTls>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngressRule {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub http: Option<IngressHttp>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngressHttp {
    #[serde(default)]
    pub paths: Vec<IngressPath>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngressPath {
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngressTls {
    #[serde(default)]
    pub hosts: Vec<String>,
}

impl IngressObject {
    pub fn into_route(self, default_namespace: &str) -> Route {
        let key = self.metadata.key(default_namespace);
        Route {
            key,
            uid: self.metadata.uid,
            annotations: self.metadata.annotations,
            rules: self
                .spec
                .rules
                .into_iter()
                .map(|rule| RouteRule {
                    host: rule.host.unwrap_or_default(),
                    paths: rule
                        .http
                        .map(|http| http.paths.into_iter().filter_map(|p| p.path).collect())
                        .unwrap_or_default(),
                })
                .collect(),
            tls: self
                .spec
                .tls
                .into_iter()
                .map(|tls| RouteTls { hosts: tls.hosts })
                .collect(),
        }
    }
}

/// Monitor custom resource as stored by the API server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorObject {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    pub metadata: WireMeta,
    #[serde(default)]
    pub spec: MonitorSpec,
    #[serde(default)]
    pub status: WireMonitorStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMonitorStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub external_id: String,
}

impl MonitorObject {
    pub fn from_monitor(monitor: &Monitor) -> Self {
        let meta = &monitor.metadata;
        MonitorObject {
            api_version: format!("{}/{}", MONITOR_GROUP, MONITOR_VERSION),
            kind: MONITOR_KIND.to_string(),
            metadata: WireMeta {
                name: monitor.key.name.clone(),
                namespace: Some(monitor.key.namespace.clone()),
                uid: None,
                resource_version: meta.resource_version.clone(),
                labels: meta.labels.clone(),
                annotations: meta.annotations.clone(),
                finalizers: meta.finalizers.clone(),
                owner_references: meta.owner_references.iter().map(Into::into).collect(),
                deletion_timestamp: None,
            },
            spec: monitor.spec.clone(),
            status: WireMonitorStatus {
                external_id: monitor.status.external_id.clone(),
            },
        }
    }

    pub fn into_monitor(self, default_namespace: &str) -> Monitor {
        let key = self.metadata.key(default_namespace);
        let meta = self.metadata;
        Monitor {
            key,
            metadata: ObjectMeta {
                owner_references: meta.owner_references.iter().map(Into::into).collect(),
                labels: meta.labels,
                annotations: meta.annotations,
                finalizers: meta.finalizers,
                resource_version: meta.resource_version,
                lifecycle: if meta.deletion_timestamp.is_some() {
                    Lifecycle::PendingDeletion
                } else {
                    Lifecycle::Active
                },
                deletion_requested_at: meta.deletion_timestamp,
            },
            spec: self.spec,
            status: MonitorStatus {
                external_id: self.status.external_id,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct ObjectList<T> {
    #[serde(default)]
    metadata: ListMeta,
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListMeta {
    #[serde(default)]
    resource_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WatchLine {
    #[serde(rename = "type")]
    event_type: String,
    object: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct KubeRestStore {
    http: Client,
    api_url: String,
    token: Option<String>,
    timeout: Duration,
    /// Watch scope; all namespaces when `None`
    namespace: Option<String>,
}

impl KubeRestStore {
    pub fn new(
        api_url: &str,
        token: Option<String>,
        ca_pem: Option<&[u8]>,
        timeout: Duration,
        namespace: Option<String>,
    ) -> Result<Self> {
        let mut builder =
            Client::builder().user_agent(concat!("routewatch/", env!("CARGO_PKG_VERSION")));
        if let Some(pem) = ca_pem {
            let cert = reqwest::Certificate::from_pem(pem).map_err(|e| {
                OperatorError::InvalidConfig(format!("invalid cluster CA certificate: {}", e))
            })?;
            builder = builder.add_root_certificate(cert);
        }
        let http = builder.build().map_err(|e| {
            OperatorError::Internal(format!("failed to build Kubernetes HTTP client: {}", e))
        })?;

        Ok(Self {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
            token: token
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty()),
            timeout,
            namespace: namespace.filter(|ns| !ns.is_empty()),
        })
    }

    /// Build from config; missing token or CA files are skipped
    pub fn from_config(config: &KubeConfig, namespace: Option<String>) -> Result<Self> {
        let token = match std::fs::read_to_string(&config.token_file) {
            Ok(token) => Some(token),
            Err(e) => {
                warn!(
                    path = %config.token_file,
                    error = %e,
                    "No service account token, using anonymous access"
                );
                None
            }
        };
        let ca = std::fs::read(&config.ca_file).ok();
        if ca.is_none() {
            debug!(path = %config.ca_file, "No cluster CA file, using system roots");
        }

        info!(api = %config.api_url, namespace = ?namespace, "Connecting to Kubernetes API");
        Self::new(
            &config.api_url,
            token,
            ca.as_deref(),
            Duration::from_secs(config.timeout_secs),
            namespace,
        )
    }

    fn monitor_api() -> String {
        format!("/apis/{}/{}", MONITOR_GROUP, MONITOR_VERSION)
    }

    fn collection_url(&self, kind: ResourceKind, namespace: Option<&str>) -> String {
        let (api, plural) = match kind {
            ResourceKind::Route => (INGRESS_API.to_string(), INGRESS_PLURAL),
            ResourceKind::Monitor => (Self::monitor_api(), MONITOR_PLURAL),
        };
        match namespace {
            Some(ns) => format!("{}{}/namespaces/{}/{}", self.api_url, api, ns, plural),
            None => format!("{}{}/{}", self.api_url, api, plural),
        }
    }

    fn object_url(&self, kind: ResourceKind, key: &ObjectKey) -> String {
        format!(
            "{}/{}",
            self.collection_url(kind, Some(&key.namespace)),
            urlencoding::encode(&key.name)
        )
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        let req = req.header(ACCEPT, "application/json");
        match &self.token {
            Some(token) => req.header(AUTHORIZATION, format!("Bearer {}", token)),
            None => req,
        }
    }

    async fn send(
        &self,
        req: RequestBuilder,
        kind: ResourceKind,
        key: &ObjectKey,
        operation: StoreOperation,
    ) -> Result<Response> {
        self.authorize(req)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| OperatorError::store(kind, key, operation, e.to_string()))
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        resp: Response,
        kind: ResourceKind,
        key: &ObjectKey,
        operation: StoreOperation,
    ) -> Result<T> {
        resp.json().await.map_err(|e| {
            OperatorError::store(kind, key, operation, format!("invalid response body: {}", e))
        })
    }

    /// Collection-wide key used in list and watch errors
    fn collection_key(&self) -> ObjectKey {
        ObjectKey::new(self.default_namespace(), "*")
    }

    async fn error_for(
        resp: Response,
        kind: ResourceKind,
        key: &ObjectKey,
        operation: StoreOperation,
    ) -> OperatorError {
        match resp.status() {
            StatusCode::NOT_FOUND => OperatorError::NotFound {
                kind,
                key: key.clone(),
            },
            StatusCode::CONFLICT => OperatorError::Conflict {
                kind,
                key: key.clone(),
                operation,
            },
            status => {
                let body = resp.text().await.unwrap_or_default();
                OperatorError::store(kind, key, operation, format!("{}: {}", status, body))
            }
        }
    }

    fn default_namespace(&self) -> &str {
        self.namespace.as_deref().unwrap_or("default")
    }

    async fn write_monitor(
        &self,
        req: RequestBuilder,
        monitor: &Monitor,
        operation: StoreOperation,
    ) -> Result<Monitor> {
        let kind = ResourceKind::Monitor;
        let key = &monitor.key;
        let req = req.json(&MonitorObject::from_monitor(monitor));
        let resp = self.send(req, kind, key, operation).await?;
        if !resp.status().is_success() {
            return Err(Self::error_for(resp, kind, key, operation).await);
        }
        let object: MonitorObject = Self::decode(resp, kind, key, operation).await?;
        Ok(object.into_monitor(&key.namespace))
    }

    async fn list_raw<T: serde::de::DeserializeOwned>(
        &self,
        kind: ResourceKind,
    ) -> Result<(Vec<T>, Option<String>)> {
        let url = self.collection_url(kind, self.namespace.as_deref());
        let key = self.collection_key();
        let op = StoreOperation::List;
        let resp = self.send(self.http.get(&url), kind, &key, op).await?;
        if !resp.status().is_success() {
            return Err(Self::error_for(resp, kind, &key, op).await);
        }
        let list: ObjectList<T> = Self::decode(resp, kind, &key, op).await?;
        Ok((list.items, list.metadata.resource_version))
    }

    /// Decode one listed or streamed object, naming it in the error when possible
    fn decode_object<T: serde::de::DeserializeOwned>(
        &self,
        kind: ResourceKind,
        object: serde_json::Value,
        operation: StoreOperation,
    ) -> Result<T> {
        let field = |name: &str| {
            object
                .pointer(&format!("/metadata/{}", name))
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };
        let key = ObjectKey::new(
            field("namespace").unwrap_or_else(|| self.default_namespace().to_string()),
            field("name").unwrap_or_else(|| "*".to_string()),
        );
        serde_json::from_value(object).map_err(|e| {
            OperatorError::store(kind, &key, operation, format!("invalid object: {}", e))
        })
    }

    fn event_for(
        &self,
        kind: ResourceKind,
        object: serde_json::Value,
        operation: StoreOperation,
    ) -> Result<(WatchEvent, Option<String>)> {
        match kind {
            ResourceKind::Route => {
                let ingress: IngressObject = self.decode_object(kind, object, operation)?;
                let version = ingress.metadata.resource_version.clone();
                let route = ingress.into_route(self.default_namespace());
                Ok((WatchEvent::route(route.key), version))
            }
            ResourceKind::Monitor => {
                let object: MonitorObject = self.decode_object(kind, object, operation)?;
                let version = object.metadata.resource_version.clone();
                let monitor = object.into_monitor(self.default_namespace());
                let source = ownership::source_route(&monitor);
                Ok((WatchEvent::monitor(monitor.key, source), version))
            }
        }
    }

    /// Initial listing as events plus the collection resource version
    async fn list_events(&self, kind: ResourceKind) -> Result<(Vec<WatchEvent>, Option<String>)> {
        let (items, version) = self.list_raw::<serde_json::Value>(kind).await?;
        let mut events = Vec::with_capacity(items.len());
        for item in items {
            events.push(self.event_for(kind, item, StoreOperation::List)?.0);
        }
        Ok((events, version))
    }
}

#[async_trait]
impl RouteStore for KubeRestStore {
    async fn get_route(&self, key: &ObjectKey) -> Result<Option<Route>> {
        let (kind, op) = (ResourceKind::Route, StoreOperation::Get);
        let resp = self
            .send(self.http.get(self.object_url(kind, key)), kind, key, op)
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(Self::error_for(resp, kind, key, op).await);
        }
        let ingress: IngressObject = Self::decode(resp, kind, key, op).await?;
        Ok(Some(ingress.into_route(&key.namespace)))
    }

    async fn list_routes(&self) -> Result<Vec<Route>> {
        let (items, _) = self.list_raw::<IngressObject>(ResourceKind::Route).await?;
        let namespace = self.default_namespace().to_string();
        Ok(items.into_iter().map(|i| i.into_route(&namespace)).collect())
    }
}

#[async_trait]
impl MonitorStore for KubeRestStore {
    async fn get_monitor(&self, key: &ObjectKey) -> Result<Option<Monitor>> {
        let (kind, op) = (ResourceKind::Monitor, StoreOperation::Get);
        let resp = self
            .send(self.http.get(self.object_url(kind, key)), kind, key, op)
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(Self::error_for(resp, kind, key, op).await);
        }
        let object: MonitorObject = Self::decode(resp, kind, key, op).await?;
        Ok(Some(object.into_monitor(&key.namespace)))
    }

    async fn list_monitors(&self) -> Result<Vec<Monitor>> {
        let (items, _) = self.list_raw::<MonitorObject>(ResourceKind::Monitor).await?;
        let namespace = self.default_namespace().to_string();
        Ok(items.into_iter().map(|m| m.into_monitor(&namespace)).collect())
    }

    async fn create_monitor(&self, monitor: &Monitor) -> Result<Monitor> {
        let url = self.collection_url(ResourceKind::Monitor, Some(&monitor.key.namespace));
        self.write_monitor(self.http.post(url), monitor, StoreOperation::Create)
            .await
    }

    async fn update_monitor(&self, monitor: &Monitor) -> Result<Monitor> {
        let url = self.object_url(ResourceKind::Monitor, &monitor.key);
        self.write_monitor(self.http.put(url), monitor, StoreOperation::Update)
            .await
    }

    async fn update_monitor_status(&self, monitor: &Monitor) -> Result<Monitor> {
        let url = format!("{}/status", self.object_url(ResourceKind::Monitor, &monitor.key));
        self.write_monitor(self.http.put(url), monitor, StoreOperation::UpdateStatus)
            .await
    }

    async fn delete_monitor(&self, key: &ObjectKey) -> Result<()> {
        let (kind, op) = (ResourceKind::Monitor, StoreOperation::Delete);
        let resp = self
            .send(self.http.delete(self.object_url(kind, key)), kind, key, op)
            .await?;
        if !resp.status().is_success() {
            return Err(Self::error_for(resp, kind, key, op).await);
        }
        Ok(())
    }
}

#[async_trait]
impl WatchSource for KubeRestStore {
    async fn watch(
        &self,
        kind: ResourceKind,
        tx: mpsc::Sender<WatchEvent>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let (existing, mut version) = self.list_events(kind).await?;
        for event in existing {
            if tx.send(event).await.is_err() {
                return Ok(());
            }
        }

        let url = self.collection_url(kind, self.namespace.as_deref());
        let key = self.collection_key();
        let op = StoreOperation::Watch;
        let watch_error = |message: String| OperatorError::store(kind, &key, op, message);
        loop {
            let mut query = vec![
                ("watch", "1".to_string()),
                ("allowWatchBookmarks", "true".to_string()),
                ("timeoutSeconds", WATCH_TIMEOUT_SECS.to_string()),
            ];
            if let Some(v) = &version {
                query.push(("resourceVersion", v.clone()));
            }

            let req = self.authorize(self.http.get(&url).query(&query));
            let mut resp = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                resp = req.send() => resp.map_err(|e| watch_error(e.to_string()))?,
            };

            if resp.status() == StatusCode::GONE {
                debug!(kind = kind.as_str(), "Watch version expired, relisting");
                return Ok(());
            }
            if !resp.status().is_success() {
                return Err(Self::error_for(resp, kind, &key, op).await);
            }

            let mut buf: Vec<u8> = Vec::new();
            loop {
                let chunk = tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    chunk = resp.chunk() => chunk.map_err(|e| watch_error(e.to_string()))?,
                };
                let Some(bytes) = chunk else { break };
                buf.extend_from_slice(&bytes);

                while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buf.drain(..=pos).collect();
                    if line.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    let line: WatchLine = serde_json::from_slice(&line)
                        .map_err(|e| watch_error(format!("invalid watch event: {}", e)))?;
                    match line.event_type.as_str() {
                        "ERROR" => {
                            let code = line.object.get("code").and_then(|c| c.as_u64());
                            if code == Some(410) {
                                debug!(kind = kind.as_str(), "Watch version expired, relisting");
                                return Ok(());
                            }
                            return Err(watch_error(line.object.to_string()));
                        }
                        "BOOKMARK" => {
                            version = line
                                .object
                                .pointer("/metadata/resourceVersion")
                                .and_then(|v| v.as_str())
                                .map(str::to_string)
                                .or(version);
                        }
                        _ => {
                            let (event, event_version) = self.event_for(kind, line.object, op)?;
                            if event_version.is_some() {
                                version = event_version;
                            }
                            if tx.send(event).await.is_err() {
                                return Ok(());
                            }
                        }
                    }
                }

                if buf.len() > MAX_WATCH_LINE_BYTES {
                    return Err(watch_error(format!(
                        "watch event exceeds {} bytes without a line break",
                        MAX_WATCH_LINE_BYTES
                    )));
                }
            }
        }
    }
}
