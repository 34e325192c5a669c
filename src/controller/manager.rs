//! Controller Manager
//!
//! Hosts any number of reconcilers. Each gets its own work queue and worker
//! pool, an initial full list of its primary kind, a periodic resync, and one
//! watch per watched kind whose events are routed into the queue.
//!
//! ```text
//!   watch(kind) ──▶ EventRouter ──▶ WorkQueue ──▶ workers ──▶ Reconciler
//!        ▲                              ▲
//!   relist on error               resync timer
//! ```

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{FutureExt, StreamExt};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use super::queue::{QueueConfig, WorkQueue};
use super::reconciler::Reconciler;
use super::router::{EventRouter, WatchSpec};
use crate::domain::ports::{Kind, ListParams, ObjectKey, ObjectStore};
use crate::error::{Error, ErrorClass, Result};
use crate::metrics;

/// Delay before re-opening a failed watch.
const WATCH_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Workers per controller
    pub workers: usize,
    /// Full relist interval; also the retry delay for permanent errors
    pub resync_interval: Duration,
    pub queue: QueueConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            resync_interval: Duration::from_secs(300),
            queue: QueueConfig::default(),
        }
    }
}

struct Registration {
    reconciler: Arc<dyn Reconciler>,
    spec: WatchSpec,
}

pub struct ControllerManager {
    store: Arc<dyn ObjectStore>,
    config: ManagerConfig,
    registrations: Vec<Registration>,
}

impl ControllerManager {
    pub fn new(store: Arc<dyn ObjectStore>, config: ManagerConfig) -> Self {
        Self {
            store,
            config,
            registrations: Vec::new(),
        }
    }

    /// Register a reconciler with the kinds it watches.
    pub fn register(&mut self, reconciler: Arc<dyn Reconciler>, spec: WatchSpec) -> Result<()> {
        if spec.primary != reconciler.kind() {
            return Err(Error::Config(format!(
                "controller {} reconciles {} but watches {} as primary",
                reconciler.name(),
                reconciler.kind(),
                spec.primary
            )));
        }
        if self
            .registrations
            .iter()
            .any(|r| r.reconciler.name() == reconciler.name())
        {
            return Err(Error::Config(format!(
                "controller {} registered twice",
                reconciler.name()
            )));
        }
        self.registrations.push(Registration { reconciler, spec });
        Ok(())
    }

    pub fn controller_names(&self) -> Vec<&'static str> {
        self.registrations.iter().map(|r| r.reconciler.name()).collect()
    }

    /// Run all controllers until `shutdown` is cancelled.
    ///
    /// In-flight reconciles finish before this returns.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let mut tasks = JoinSet::new();
        let mut queues = Vec::new();

        for registration in self.registrations {
            let name = registration.reconciler.name();
            let queue = Arc::new(WorkQueue::new(self.config.queue));
            let router = Arc::new(EventRouter::new(
                Arc::clone(&self.store),
                registration.spec,
            ));
            queues.push(Arc::clone(&queue));

            info!(
                controller = name,
                primary = %registration.reconciler.kind(),
                workers = self.config.workers,
                "Starting controller"
            );

            let primary = router.spec().primary;

            for kind in router.spec().watched_kinds() {
                let task = watch_loop(
                    Arc::clone(&self.store),
                    Arc::clone(&router),
                    Arc::clone(&queue),
                    kind,
                    name,
                    shutdown.clone(),
                );
                tasks.spawn(task.instrument(tracing::info_span!("watch", controller = name, kind = %kind)));
            }

            tasks.spawn(resync_loop(
                Arc::clone(&self.store),
                Arc::clone(&queue),
                primary,
                name,
                self.config.resync_interval,
                shutdown.clone(),
            ));

            for _ in 0..self.config.workers.max(1) {
                tasks.spawn(worker_loop(
                    Arc::clone(&registration.reconciler),
                    Arc::clone(&queue),
                    self.config.resync_interval,
                ));
            }
        }

        shutdown.cancelled().await;
        info!("Shutting down controllers");
        for queue in &queues {
            queue.shutdown();
        }

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Controller task failed");
            }
        }
        info!("Controllers stopped");
        Ok(())
    }
}

async fn enqueue_all(store: &dyn ObjectStore, kind: Kind, queue: &Arc<WorkQueue<ObjectKey>>, name: &str) {
    match store.list(kind, &ListParams::all()).await {
        Ok(objects) => {
            debug!(controller = name, count = objects.len(), "Enqueued all primaries");
            for object in objects {
                queue.add(object.key());
            }
            metrics::set_queue_depth(name, queue.len());
        }
        Err(e) => warn!(controller = name, error = %e, "Failed to list primaries"),
    }
}

async fn watch_loop(
    store: Arc<dyn ObjectStore>,
    router: Arc<EventRouter>,
    queue: Arc<WorkQueue<ObjectKey>>,
    kind: Kind,
    name: &'static str,
    shutdown: CancellationToken,
) {
    let primary = router.spec().primary;
    let mut reopened = false;

    while !shutdown.is_cancelled() {
        let mut stream = match store.watch(kind).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "Failed to open watch");
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(WATCH_RETRY_DELAY) => continue,
                }
            }
        };

        // The primary watch lists once it is open so no change falls between
        // the list and the first event. Any reopened watch relists as well.
        if reopened || kind == primary {
            enqueue_all(store.as_ref(), primary, &queue, name).await;
        }
        reopened = true;

        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => return,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(event)) => match router.route(&event.object).await {
                    Ok(keys) => {
                        for key in keys {
                            queue.add(key);
                        }
                        metrics::set_queue_depth(name, queue.len());
                    }
                    Err(e) => warn!(object = %event.object.key(), error = %e, "Failed to route event"),
                },
                Some(Err(e)) => {
                    warn!(error = %e, "Watch failed, relisting");
                    break;
                }
                None => {
                    debug!("Watch stream ended");
                    break;
                }
            }
        }
    }
}

async fn resync_loop(
    store: Arc<dyn ObjectStore>,
    queue: Arc<WorkQueue<ObjectKey>>,
    primary: Kind,
    name: &'static str,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => enqueue_all(store.as_ref(), primary, &queue, name).await,
        }
    }
}

async fn worker_loop(
    reconciler: Arc<dyn Reconciler>,
    queue: Arc<WorkQueue<ObjectKey>>,
    resync_interval: Duration,
) {
    while let Some(key) = queue.get().await {
        process(reconciler.as_ref(), &queue, &key, resync_interval).await;
        queue.done(&key);
        metrics::set_queue_depth(reconciler.name(), queue.len());
    }
}

/// Run one reconcile pass and apply the retry policy for its outcome.
pub(crate) async fn process(
    reconciler: &dyn Reconciler,
    queue: &Arc<WorkQueue<ObjectKey>>,
    key: &ObjectKey,
    resync_interval: Duration,
) {
    let name = reconciler.name();
    let started = Instant::now();
    let span = tracing::info_span!("reconcile", controller = name, key = %key);

    let outcome = AssertUnwindSafe(reconciler.reconcile(key))
        .catch_unwind()
        .instrument(span.clone())
        .await
        .unwrap_or_else(|panic| {
            Err(Error::Invariant(format!(
                "reconcile panicked: {}",
                panic_message(panic.as_ref())
            )))
        });

    let _entered = span.enter();
    let result = match outcome {
        Ok(action) => {
            queue.forget(key);
            if let Some(delay) = action.requeue_after() {
                queue.add_after(key.clone(), delay);
            }
            debug!("Reconciled");
            "success"
        }
        Err(e) => match e.class() {
            ErrorClass::NotFound => {
                debug!(error = %e, "Object vanished during reconcile");
                queue.forget(key);
                "not_found"
            }
            ErrorClass::Conflict => {
                debug!(error = %e, "Write conflict, retrying");
                queue.add_rate_limited(key.clone());
                "conflict"
            }
            ErrorClass::Transient => {
                warn!(error = %e, retries = queue.num_requeues(key), "Reconcile failed, retrying");
                queue.add_rate_limited(key.clone());
                "transient"
            }
            ErrorClass::Permanent => {
                warn!(error = %e, "Reconcile rejected, retrying at resync");
                queue.forget(key);
                queue.add_after(key.clone(), resync_interval);
                "permanent"
            }
            ErrorClass::Invariant => {
                error!(error = %e, "Invariant violated, dropping key");
                queue.forget(key);
                "invariant"
            }
        },
    };

    metrics::record_reconcile(name, result, started.elapsed());
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
