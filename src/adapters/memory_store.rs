//! In-process declarative store
//!
//! Mirrors the API server semantics the controllers rely on: resource
//! versions with stale-write rejection, finalizer-blocked deletion, status as
//! a separate write, owner-reference garbage collection and list-then-watch.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::{Lifecycle, Monitor, ObjectKey, ResourceKind, Route};
use crate::error::{OperatorError, Result, StoreOperation};
use crate::ownership;
use crate::store::{MonitorStore, RouteStore, WatchEvent, WatchSource};

const EVENT_BUFFER: usize = 1024;

#[derive(Debug, Default)]
struct StoreState {
    routes: BTreeMap<ObjectKey, Route>,
    monitors: BTreeMap<ObjectKey, Monitor>,
    version: u64,
    uid_seq: u64,
}

impl StoreState {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }
}

#[derive(Debug)]
pub struct InMemoryStore {
    state: RwLock<StoreState>,
    events: broadcast::Sender<WatchEvent>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            state: RwLock::new(StoreState::default()),
            events,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreState> {
        self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: WatchEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn emit_monitor(&self, monitor: &Monitor) {
        self.emit(WatchEvent::monitor(
            monitor.key.clone(),
            ownership::source_route(monitor),
        ));
    }

    /// Create or replace a route. Routes without a uid are assigned one.
    pub fn put_route(&self, mut route: Route) -> Route {
        {
            let mut state = self.write();
            if route.uid.is_none() {
                let existing = state.routes.get(&route.key).and_then(|r| r.uid.clone());
                route.uid = match existing {
                    Some(uid) => Some(uid),
                    None => {
                        state.uid_seq += 1;
                        Some(format!("route-uid-{}", state.uid_seq))
                    }
                };
            }
            state.routes.insert(route.key.clone(), route.clone());
        }
        self.emit(WatchEvent::route(route.key.clone()));
        route
    }

    /// Remove a route and request deletion of every Monitor it owns
    pub fn delete_route(&self, key: &ObjectKey) -> Option<Route> {
        let (removed, touched) = {
            let mut state = self.write();
            let removed = state.routes.remove(key);
            let mut touched = Vec::new();

            if let Some(uid) = removed.as_ref().and_then(|r| r.uid.clone()) {
                let owned: Vec<ObjectKey> = state
                    .monitors
                    .values()
                    .filter(|m| m.metadata.owner_references.iter().any(|o| o.uid == uid))
                    .map(|m| m.key.clone())
                    .collect();
                for monitor_key in owned {
                    if let Some(m) = Self::request_deletion(&mut state, &monitor_key) {
                        touched.push(m);
                    }
                }
            }
            (removed, touched)
        };

        if removed.is_some() {
            self.emit(WatchEvent::route(key.clone()));
        }
        for monitor in &touched {
            debug!(monitor = %monitor.key, "Garbage-collecting owned monitor");
            self.emit_monitor(monitor);
        }
        removed
    }

    /// Mark pending or remove; returns the record as it was left
    fn request_deletion(state: &mut StoreState, key: &ObjectKey) -> Option<Monitor> {
        let existing = state.monitors.get(key)?.clone();
        if existing.metadata.finalizers.is_empty() {
            let mut gone = state.monitors.remove(key)?;
            gone.metadata.lifecycle = Lifecycle::Gone;
            return Some(gone);
        }

        if existing.metadata.lifecycle == Lifecycle::PendingDeletion {
            return Some(existing);
        }

        let version = state.next_version();
        let monitor = state.monitors.get_mut(key)?;
        monitor.metadata.lifecycle = Lifecycle::PendingDeletion;
        monitor.metadata.deletion_requested_at = Some(Utc::now());
        monitor.metadata.resource_version = Some(version);
        Some(monitor.clone())
    }

    fn not_found(key: &ObjectKey) -> OperatorError {
        OperatorError::NotFound {
            kind: ResourceKind::Monitor,
            key: key.clone(),
        }
    }

    fn check_version(stored: &Monitor, incoming: &Monitor, operation: StoreOperation) -> Result<()> {
        if stored.metadata.resource_version != incoming.metadata.resource_version {
            return Err(OperatorError::Conflict {
                kind: ResourceKind::Monitor,
                key: incoming.key.clone(),
                operation,
            });
        }
        Ok(())
    }

    pub fn monitor_count(&self) -> usize {
        self.read().monitors.len()
    }

    fn snapshot(&self, kind: ResourceKind) -> Vec<WatchEvent> {
        let state = self.read();
        match kind {
            ResourceKind::Route => state
                .routes
                .keys()
                .cloned()
                .map(WatchEvent::route)
                .collect(),
            ResourceKind::Monitor => state
                .monitors
                .values()
                .map(|m| WatchEvent::monitor(m.key.clone(), ownership::source_route(m)))
                .collect(),
        }
    }
}

#[async_trait]
impl RouteStore for InMemoryStore {
    async fn get_route(&self, key: &ObjectKey) -> Result<Option<Route>> {
        Ok(self.read().routes.get(key).cloned())
    }

    async fn list_routes(&self) -> Result<Vec<Route>> {
        Ok(self.read().routes.values().cloned().collect())
    }
}

#[async_trait]
impl MonitorStore for InMemoryStore {
    async fn get_monitor(&self, key: &ObjectKey) -> Result<Option<Monitor>> {
        Ok(self.read().monitors.get(key).cloned())
    }

    async fn list_monitors(&self) -> Result<Vec<Monitor>> {
        Ok(self.read().monitors.values().cloned().collect())
    }

    async fn create_monitor(&self, monitor: &Monitor) -> Result<Monitor> {
        let created = {
            let mut state = self.write();
            if state.monitors.contains_key(&monitor.key) {
                return Err(OperatorError::Conflict {
                    kind: ResourceKind::Monitor,
                    key: monitor.key.clone(),
                    operation: StoreOperation::Create,
                });
            }

            let mut created = monitor.clone();
            created.status = Default::default();
            created.metadata.lifecycle = Lifecycle::Active;
            created.metadata.deletion_requested_at = None;
            created.metadata.resource_version = Some(state.next_version());
            state.monitors.insert(created.key.clone(), created.clone());
            created
        };

        self.emit_monitor(&created);
        Ok(created)
    }

    async fn update_monitor(&self, monitor: &Monitor) -> Result<Monitor> {
        let updated = {
            let mut state = self.write();
            let stored = state
                .monitors
                .get(&monitor.key)
                .cloned()
                .ok_or_else(|| Self::not_found(&monitor.key))?;
            Self::check_version(&stored, monitor, StoreOperation::Update)?;

            let mut updated = stored.clone();
            updated.spec = monitor.spec.clone();
            updated.metadata.labels = monitor.metadata.labels.clone();
            updated.metadata.annotations = monitor.metadata.annotations.clone();
            updated.metadata.owner_references = monitor.metadata.owner_references.clone();
            updated.metadata.finalizers = monitor.metadata.finalizers.clone();

            if updated.metadata.lifecycle == Lifecycle::PendingDeletion
                && updated.metadata.finalizers.is_empty()
            {
                state.monitors.remove(&monitor.key);
                updated.metadata.lifecycle = Lifecycle::Gone;
            } else {
                updated.metadata.resource_version = Some(state.next_version());
                state.monitors.insert(updated.key.clone(), updated.clone());
            }
            updated
        };

        self.emit_monitor(&updated);
        Ok(updated)
    }

    async fn update_monitor_status(&self, monitor: &Monitor) -> Result<Monitor> {
        let updated = {
            let mut state = self.write();
            let stored = state
                .monitors
                .get(&monitor.key)
                .cloned()
                .ok_or_else(|| Self::not_found(&monitor.key))?;
            Self::check_version(&stored, monitor, StoreOperation::UpdateStatus)?;

            let mut updated = stored;
            updated.status = monitor.status.clone();
            updated.metadata.resource_version = Some(state.next_version());
            state.monitors.insert(updated.key.clone(), updated.clone());
            updated
        };

        self.emit_monitor(&updated);
        Ok(updated)
    }

    async fn delete_monitor(&self, key: &ObjectKey) -> Result<()> {
        let touched = {
            let mut state = self.write();
            Self::request_deletion(&mut state, key).ok_or_else(|| Self::not_found(key))?
        };
        self.emit_monitor(&touched);
        Ok(())
    }
}

#[async_trait]
impl WatchSource for InMemoryStore {
    async fn watch(
        &self,
        kind: ResourceKind,
        tx: mpsc::Sender<WatchEvent>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut rx = self.events.subscribe();
        let mut pending = self.snapshot(kind);

        loop {
            for event in pending.drain(..) {
                if tx.send(event).await.is_err() {
                    return Ok(());
                }
            }

            let event = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                event = rx.recv() => event,
            };

            match event {
                Ok(event) if event.kind == kind => pending.push(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(kind = kind.as_str(), skipped, "Watch lagged, relisting");
                    pending = self.snapshot(kind);
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            }
        }
    }
}
