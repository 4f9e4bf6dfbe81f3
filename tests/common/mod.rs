#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use routewatch::adapters::InMemoryStore;
use routewatch::controller::{MonitorLifecycleReconciler, RouteWatcher};
use routewatch::domain::{ObjectKey, Route};
use routewatch::error::{ExternalOperation, OperatorError, Result};
use routewatch::monitoring::{DeleteOutcome, MonitorRequest, MonitoringService};
use routewatch::services::Metrics;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Create(String),
    Update(String, String),
    Delete(String),
}

/// Monitoring service double that keeps its records in memory
#[derive(Default)]
pub struct RecordingService {
    state: Mutex<ServiceState>,
}

#[derive(Default)]
struct ServiceState {
    next_id: u32,
    records: BTreeMap<String, MonitorRequest>,
    calls: Vec<Call>,
}

impl RecordingService {
    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn records(&self) -> BTreeMap<String, MonitorRequest> {
        self.state.lock().unwrap().records.clone()
    }

    /// Remove a record behind the controller's back
    pub fn drop_record(&self, id: &str) {
        self.state.lock().unwrap().records.remove(id);
    }
}

#[async_trait]
impl MonitoringService for RecordingService {
    async fn create(&self, request: &MonitorRequest) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("mon-{}", state.next_id);
        state.records.insert(id.clone(), request.clone());
        state.calls.push(Call::Create(request.name.clone()));
        Ok(id)
    }

    async fn update(&self, id: &str, request: &MonitorRequest) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .calls
            .push(Call::Update(id.to_string(), request.interval.clone()));
        match state.records.get_mut(id) {
            Some(record) => {
                *record = request.clone();
                Ok(())
            }
            None => Err(OperatorError::ExternalNotFound {
                operation: ExternalOperation::Update,
                id: id.to_string(),
            }),
        }
    }

    async fn delete(&self, id: &str) -> Result<DeleteOutcome> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Delete(id.to_string()));
        Ok(match state.records.remove(id) {
            Some(_) => DeleteOutcome::Deleted,
            None => DeleteOutcome::NotFound,
        })
    }
}

pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub service: Arc<RecordingService>,
    pub metrics: Arc<Metrics>,
    pub watcher: RouteWatcher,
    pub lifecycle: MonitorLifecycleReconciler,
}

impl Harness {
    pub fn new(default_interval: Option<&str>) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let service = Arc::new(RecordingService::default());
        let metrics = Arc::new(Metrics::new());
        let watcher = RouteWatcher::new(
            store.clone(),
            store.clone(),
            default_interval.map(str::to_string),
            Arc::clone(&metrics),
        );
        let lifecycle =
            MonitorLifecycleReconciler::new(store.clone(), service.clone(), 0, Arc::clone(&metrics));
        Self {
            store,
            service,
            metrics,
            watcher,
            lifecycle,
        }
    }
}

pub fn key(name: &str) -> ObjectKey {
    ObjectKey::new("default", name)
}

pub fn app_route() -> Route {
    Route::new(key("my-app"))
        .with_host("myapp.example.com")
        .with_tls(&["myapp.example.com"])
        .with_annotation("routewatch.dev/path", "/health")
        .with_annotation("routewatch.dev/interval", "15")
}
