//! Worker pools, watch pumps and resync for the two reconcilers

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Action, BackoffPolicy, MonitorLifecycleReconciler, Reconciler, RouteWatcher, WorkQueue};
use crate::config::ControllerConfig;
use crate::domain::{ObjectKey, ResourceKind};
use crate::error::{OperatorError, Result};
use crate::monitoring::MonitoringService;
use crate::ownership;
use crate::services::{HealthState, Metrics};
use crate::store::{MonitorStore, RouteStore, WatchEvent, WatchSource};

/// Delay before a failed watch is re-established
const WATCH_RESTART_DELAY: Duration = Duration::from_secs(5);
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// How the runtime disposed of a key after one reconcile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Finished,
    Requeued(Duration),
    Backoff(Duration),
    Dropped,
}

/// Runs a [`Reconciler`] over the keys of one [`WorkQueue`]
pub struct Controller<R: Reconciler> {
    reconciler: Arc<R>,
    queue: Arc<WorkQueue>,
    workers: usize,
    conflict_delay: Duration,
    metrics: Arc<Metrics>,
}

impl<R: Reconciler> Controller<R> {
    pub fn new(
        reconciler: Arc<R>,
        queue: Arc<WorkQueue>,
        workers: usize,
        conflict_delay: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            reconciler,
            queue,
            workers: workers.max(1),
            conflict_delay,
            metrics,
        }
    }

    pub fn queue(&self) -> Arc<WorkQueue> {
        Arc::clone(&self.queue)
    }

    /// Reconcile `key` once and schedule its follow-up
    pub async fn process(&self, key: &ObjectKey, cancel: &CancellationToken) -> Disposition {
        let name = self.reconciler.name();
        let child = cancel.child_token();
        let result = self.reconciler.reconcile(key, &child).await;

        let disposition = match result {
            Ok(Action::Done) => {
                self.queue.forget(key);
                Disposition::Finished
            }
            Ok(Action::RequeueAfter(delay)) => {
                self.queue.forget(key);
                self.queue.add_after(key.clone(), delay);
                Disposition::Requeued(delay)
            }
            Err(e) if e.is_conflict() => {
                debug!(controller = name, key = %key, "Write conflict, retrying shortly");
                self.queue.add_after(key.clone(), self.conflict_delay);
                Disposition::Requeued(self.conflict_delay)
            }
            Err(OperatorError::Cancelled) => {
                self.queue.forget(key);
                Disposition::Dropped
            }
            Err(e) if !e.is_retryable() => {
                warn!(controller = name, key = %key, error = %e, "Reconcile rejected, not retrying");
                self.queue.forget(key);
                Disposition::Dropped
            }
            Err(e) => {
                Metrics::inc(&self.metrics.reconcile_errors);
                let delay = self.queue.add_rate_limited(key.clone());
                error!(
                    controller = name,
                    key = %key,
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "Reconcile failed"
                );
                Disposition::Backoff(delay)
            }
        };

        self.queue.done(key);
        disposition
    }

    /// Spawn the worker pool
    pub fn start(self, cancel: CancellationToken) -> ControllerHandle {
        let name = self.reconciler.name();
        let queue = Arc::clone(&self.queue);
        let workers = self.workers;
        let controller = Arc::new(self);

        info!(controller = name, workers, "Starting controller");
        let tasks = (0..workers)
            .map(|worker| {
                let controller = Arc::clone(&controller);
                let cancel = cancel.clone();
                tokio::spawn(async move { controller.worker_loop(worker, cancel).await })
            })
            .collect();

        ControllerHandle { name, queue, tasks }
    }

    async fn worker_loop(&self, worker: usize, cancel: CancellationToken) {
        loop {
            let key = tokio::select! {
                _ = cancel.cancelled() => break,
                key = self.queue.next() => match key {
                    Some(key) => key,
                    None => break,
                },
            };
            self.process(&key, &cancel).await;
        }
        debug!(controller = self.reconciler.name(), worker, "Worker stopped");
    }
}

pub struct ControllerHandle {
    name: &'static str,
    queue: Arc<WorkQueue>,
    tasks: Vec<JoinHandle<()>>,
}

impl ControllerHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn queue(&self) -> Arc<WorkQueue> {
        Arc::clone(&self.queue)
    }

    /// Stop handing out keys and wait for in-flight reconciles
    pub async fn shutdown(self) {
        self.queue.shutdown();
        for result in join_all(self.tasks).await {
            if let Err(e) = result {
                error!(controller = self.name, error = %e, "Worker task panicked");
            }
        }
        info!(controller = self.name, "Controller stopped");
    }
}

/// Route a watch event to the queues it triggers
pub fn enqueue_event(event: WatchEvent, routes: &WorkQueue, monitors: &WorkQueue) {
    match event.kind {
        ResourceKind::Route => routes.add(event.key),
        ResourceKind::Monitor => {
            if let Some(source) = event.source_route {
                routes.add(source);
            }
            monitors.add(event.key);
        }
    }
}

/// Forward events from `rx` into the queues until cancelled or the channel closes
pub async fn dispatch_events(
    mut rx: mpsc::Receiver<WatchEvent>,
    routes: Arc<WorkQueue>,
    monitors: Arc<WorkQueue>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        enqueue_event(event, &routes, &monitors);
    }
}

/// Keep a watch of `kind` open, re-establishing it after errors
pub fn spawn_watch(
    source: Arc<dyn WatchSource>,
    kind: ResourceKind,
    tx: mpsc::Sender<WatchEvent>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while !cancel.is_cancelled() {
            match source.watch(kind, tx.clone(), cancel.clone()).await {
                Ok(()) if cancel.is_cancelled() || tx.is_closed() => break,
                Ok(()) => debug!(kind = kind.as_str(), "Watch ended, restarting"),
                Err(e) => {
                    warn!(kind = kind.as_str(), error = %e, "Watch failed, restarting");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(WATCH_RESTART_DELAY) => {}
                    }
                }
            }
        }
    })
}

/// Enqueue every known route and monitor
pub async fn enqueue_all(
    route_store: &dyn RouteStore,
    monitor_store: &dyn MonitorStore,
    routes: &WorkQueue,
    monitors: &WorkQueue,
) -> Result<usize> {
    let mut count = 0;
    for route in route_store.list_routes().await? {
        routes.add(route.key);
        count += 1;
    }
    for monitor in monitor_store.list_monitors().await? {
        enqueue_event(
            WatchEvent::monitor(monitor.key.clone(), ownership::source_route(&monitor)),
            routes,
            monitors,
        );
        count += 1;
    }
    Ok(count)
}

/// Runtime knobs derived from [`ControllerConfig`]
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub workers: usize,
    pub backoff: BackoffPolicy,
    pub conflict_delay: Duration,
    pub resync: Option<Duration>,
    pub default_interval: Option<String>,
}

impl RuntimeSettings {
    pub fn from_config(config: &ControllerConfig) -> Self {
        Self {
            workers: config.workers,
            backoff: BackoffPolicy::new(config.base_backoff(), config.max_backoff()),
            conflict_delay: config.conflict_delay(),
            resync: config.resync_period(),
            default_interval: config.default_interval.clone(),
        }
    }
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self::from_config(&ControllerConfig::default())
    }
}

/// Both controllers wired to one store and one monitoring service
pub struct Operator {
    pub routes: Arc<dyn RouteStore>,
    pub monitors: Arc<dyn MonitorStore>,
    pub watch: Arc<dyn WatchSource>,
    pub service: Arc<dyn MonitoringService>,
    pub metrics: Arc<Metrics>,
    pub health: Option<Arc<HealthState>>,
    pub retry_count: i32,
    pub settings: RuntimeSettings,
}

impl Operator {
    /// Start watches, workers and resync. Marks the health state ready once
    /// the initial listing of both kinds has succeeded.
    pub async fn start(self, cancel: CancellationToken) -> Result<OperatorHandle> {
        let settings = &self.settings;
        let route_queue = WorkQueue::new(settings.backoff);
        let monitor_queue = WorkQueue::new(settings.backoff);

        let enqueued = enqueue_all(
            self.routes.as_ref(),
            self.monitors.as_ref(),
            &route_queue,
            &monitor_queue,
        )
        .await?;
        info!(objects = enqueued, "Initial listing complete");

        let watcher = RouteWatcher::new(
            Arc::clone(&self.routes),
            Arc::clone(&self.monitors),
            settings.default_interval.clone(),
            Arc::clone(&self.metrics),
        );
        let lifecycle = MonitorLifecycleReconciler::new(
            Arc::clone(&self.monitors),
            Arc::clone(&self.service),
            self.retry_count,
            Arc::clone(&self.metrics),
        );

        let route_controller = Controller::new(
            Arc::new(watcher),
            Arc::clone(&route_queue),
            settings.workers,
            settings.conflict_delay,
            Arc::clone(&self.metrics),
        )
        .start(cancel.clone());
        let monitor_controller = Controller::new(
            Arc::new(lifecycle),
            Arc::clone(&monitor_queue),
            settings.workers,
            settings.conflict_delay,
            Arc::clone(&self.metrics),
        )
        .start(cancel.clone());

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let mut tasks = vec![
            spawn_watch(
                Arc::clone(&self.watch),
                ResourceKind::Route,
                tx.clone(),
                cancel.clone(),
            ),
            spawn_watch(
                Arc::clone(&self.watch),
                ResourceKind::Monitor,
                tx,
                cancel.clone(),
            ),
            tokio::spawn(dispatch_events(
                rx,
                Arc::clone(&route_queue),
                Arc::clone(&monitor_queue),
                cancel.clone(),
            )),
        ];

        if let Some(period) = settings.resync {
            let routes = Arc::clone(&self.routes);
            let monitors = Arc::clone(&self.monitors);
            let route_queue = Arc::clone(&route_queue);
            let monitor_queue = Arc::clone(&monitor_queue);
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                    let listed = enqueue_all(
                        routes.as_ref(),
                        monitors.as_ref(),
                        &route_queue,
                        &monitor_queue,
                    )
                    .await;
                    match listed {
                        Ok(count) => debug!(objects = count, "Resync enqueued"),
                        Err(e) => warn!(error = %e, "Resync listing failed"),
                    }
                }
            }));
        }

        if let Some(health) = &self.health {
            health.set_ready(true);
        }

        Ok(OperatorHandle {
            controllers: vec![route_controller, monitor_controller],
            tasks,
            health: self.health,
            cancel,
        })
    }
}

pub struct OperatorHandle {
    controllers: Vec<ControllerHandle>,
    tasks: Vec<JoinHandle<()>>,
    health: Option<Arc<HealthState>>,
    cancel: CancellationToken,
}

impl OperatorHandle {
    /// Cancel everything and wait for workers to drain
    pub async fn shutdown(self) {
        if let Some(health) = &self.health {
            health.set_ready(false);
        }
        self.cancel.cancel();
        join_all(self.tasks).await;
        join_all(self.controllers.into_iter().map(ControllerHandle::shutdown)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct ScriptedReconciler {
        script: Mutex<VecDeque<Result<Action>>>,
        calls: AtomicUsize,
    }

    impl ScriptedReconciler {
        fn with(results: Vec<Result<Action>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(results.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl Reconciler for ScriptedReconciler {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn reconcile(&self, _key: &ObjectKey, _cancel: &CancellationToken) -> Result<Action> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(Action::Done))
        }
    }

    fn key() -> ObjectKey {
        ObjectKey::new("default", "my-app")
    }

    fn controller(reconciler: Arc<ScriptedReconciler>) -> Controller<ScriptedReconciler> {
        Controller::new(
            reconciler,
            WorkQueue::new(BackoffPolicy::new(
                Duration::from_millis(100),
                Duration::from_secs(5),
            )),
            2,
            Duration::from_millis(10),
            Arc::new(Metrics::new()),
        )
    }

    #[tokio::test]
    async fn test_done_forgets_failures() {
        let c = controller(ScriptedReconciler::with(vec![]));
        c.queue.add_rate_limited(key());
        let disposition = c.process(&key(), &CancellationToken::new()).await;
        assert_eq!(disposition, Disposition::Finished);
        assert_eq!(c.queue.failures(&key()), 0);
    }

    #[tokio::test]
    async fn test_retryable_error_backs_off_and_counts() {
        let c = controller(ScriptedReconciler::with(vec![
            Err(OperatorError::Internal("boom".into())),
            Err(OperatorError::Internal("boom".into())),
        ]));
        let cancel = CancellationToken::new();

        assert_eq!(
            c.process(&key(), &cancel).await,
            Disposition::Backoff(Duration::from_millis(100))
        );
        assert_eq!(
            c.process(&key(), &cancel).await,
            Disposition::Backoff(Duration::from_millis(200))
        );
        assert_eq!(Metrics::get(&c.metrics.reconcile_errors), 2);
    }

    #[tokio::test]
    async fn test_validation_error_is_not_retried() {
        let c = controller(ScriptedReconciler::with(vec![Err(OperatorError::validation(
            &key(),
            "no rules",
        ))]));
        let disposition = c.process(&key(), &CancellationToken::new()).await;
        assert_eq!(disposition, Disposition::Dropped);
        assert_eq!(c.queue.failures(&key()), 0);
        assert_eq!(Metrics::get(&c.metrics.reconcile_errors), 0);
    }

    #[tokio::test]
    async fn test_conflict_uses_short_delay_without_failure_count() {
        let c = controller(ScriptedReconciler::with(vec![Err(OperatorError::Conflict {
            kind: ResourceKind::Monitor,
            key: key(),
            operation: crate::error::StoreOperation::Update,
        })]));
        let disposition = c.process(&key(), &CancellationToken::new()).await;
        assert_eq!(disposition, Disposition::Requeued(Duration::from_millis(10)));
        assert_eq!(c.queue.failures(&key()), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_workers_retry_until_success() {
        let reconciler = ScriptedReconciler::with(vec![
            Err(OperatorError::Internal("down".into())),
            Ok(Action::RequeueAfter(Duration::from_secs(1))),
        ]);
        let c = controller(Arc::clone(&reconciler));
        let queue = c.queue();
        let cancel = CancellationToken::new();
        let handle = c.start(cancel.clone());

        queue.add(key());
        tokio::time::sleep(Duration::from_secs(3)).await;

        // error, requeue-after, then the default Done
        assert_eq!(reconciler.calls(), 3);
        assert_eq!(queue.failures(&key()), 0);

        cancel.cancel();
        handle.shutdown().await;
    }

    #[test]
    fn test_monitor_event_triggers_source_route() {
        let routes = WorkQueue::new(BackoffPolicy::default());
        let monitors = WorkQueue::new(BackoffPolicy::default());

        enqueue_event(
            WatchEvent::monitor(key(), Some(ObjectKey::new("default", "owner"))),
            &routes,
            &monitors,
        );
        enqueue_event(
            WatchEvent::monitor(ObjectKey::new("default", "manual"), None),
            &routes,
            &monitors,
        );
        enqueue_event(WatchEvent::route(key()), &routes, &monitors);

        assert_eq!(monitors.len(), 2);
        assert_eq!(routes.len(), 2);
    }

    #[test]
    fn test_settings_from_config() {
        let settings = RuntimeSettings::from_config(&ControllerConfig::default());
        assert_eq!(settings.workers, 4);
        assert_eq!(settings.backoff.base, Duration::from_millis(500));
        assert_eq!(settings.conflict_delay, Duration::from_millis(100));
    }
}
