mod common;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use common::{app_route, key, RecordingService};
use routewatch::adapters::InMemoryStore;
use routewatch::controller::{BackoffPolicy, Operator, RuntimeSettings};
use routewatch::services::{HealthState, Metrics};
use routewatch::store::MonitorStore;
use tokio_util::sync::CancellationToken;

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

fn settings() -> RuntimeSettings {
    RuntimeSettings {
        workers: 2,
        backoff: BackoffPolicy::new(Duration::from_millis(10), Duration::from_millis(200)),
        conflict_delay: Duration::from_millis(5),
        resync: None,
        default_interval: None,
    }
}

#[tokio::test]
async fn test_operator_converges_on_route_lifecycle() {
    let store = Arc::new(InMemoryStore::new());
    let service = Arc::new(RecordingService::default());
    let metrics = Arc::new(Metrics::new());
    let health = Arc::new(HealthState::new(Arc::clone(&metrics)));

    let operator = Operator {
        routes: store.clone(),
        monitors: store.clone(),
        watch: store.clone(),
        service: service.clone(),
        metrics: Arc::clone(&metrics),
        health: Some(Arc::clone(&health)),
        retry_count: 0,
        settings: settings(),
    };
    let handle = operator.start(CancellationToken::new()).await.unwrap();
    assert!(health.is_ready());

    let (s, svc) = (&store, &service);
    store.put_route(app_route());
    eventually("external check creation", move || async move {
        match s.get_monitor(&key("my-app")).await.unwrap() {
            Some(m) => m.external_id().is_some() && svc.records().len() == 1,
            None => false,
        }
    })
    .await;

    let record = service.records().into_values().next().unwrap();
    assert_eq!(record.target, "https://myapp.example.com/health");
    assert_eq!(record.interval, "15");

    store.delete_route(&key("my-app"));
    eventually("external check removal", move || async move {
        svc.records().is_empty() && s.get_monitor(&key("my-app")).await.unwrap().is_none()
    })
    .await;

    handle.shutdown().await;
    assert!(!health.is_ready());
    assert!(Metrics::get(&metrics.external_creates) >= 1);
    assert_eq!(Metrics::get(&metrics.external_deletes), 1);
}

#[tokio::test]
async fn test_operator_picks_up_existing_routes_at_start() {
    let store = Arc::new(InMemoryStore::new());
    let service = Arc::new(RecordingService::default());
    store.put_route(app_route());
    store.put_route(
        routewatch::domain::Route::new(key("docs")).with_host("docs.example.com"),
    );

    let operator = Operator {
        routes: store.clone(),
        monitors: store.clone(),
        watch: store.clone(),
        service: service.clone(),
        metrics: Arc::new(Metrics::new()),
        health: None,
        retry_count: 0,
        settings: settings(),
    };
    let handle = operator.start(CancellationToken::new()).await.unwrap();

    let svc = &service;
    eventually("both checks created", move || async move { svc.records().len() == 2 }).await;

    let targets: Vec<String> = service
        .records()
        .into_values()
        .map(|r| r.target)
        .collect();
    assert!(targets.contains(&"http://docs.example.com".to_string()));

    handle.shutdown().await;
}
