//! Controller manager: per-controller work queues fed by store changes and a
//! periodic resync, drained by a fixed pool of workers.
//!
//! A key is never processed by two workers at once. A key that changes while
//! it is being reconciled is marked dirty and queued again once the running
//! pass finishes.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

use havoc_core::types::{ObjectKey, ObjectKind};

use crate::client::{Client, ObjectChange, StoreError};
use crate::error::ReconcileError;

const DEFAULT_WORKERS: usize = 4;
const DEFAULT_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// What a reconcile pass asks the manager to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Action {
    pub requeue_after: Option<Duration>,
}

impl Action {
    pub fn done() -> Self {
        Self::default()
    }

    pub fn requeue_after(delay: Duration) -> Self {
        Self {
            requeue_after: Some(delay),
        }
    }

    /// The sooner of two requeue requests.
    pub fn merge(self, other: Action) -> Action {
        let requeue_after = match (self.requeue_after, other.requeue_after) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Action { requeue_after }
    }
}

#[async_trait]
pub trait Reconciler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Kind whose keys this controller reconciles.
    fn kind(&self) -> ObjectKind;

    /// Keys to enqueue for a store change. Defaults to the changed object
    /// itself when it is of this controller's kind.
    fn map_change(&self, change: &ObjectChange) -> Vec<ObjectKey> {
        if change.kind == self.kind() {
            vec![change.key.clone()]
        } else {
            Vec::new()
        }
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError>;
}

/// Key of the object named by `label` on a changed object, in its namespace.
pub fn labeled_owner(change: &ObjectChange, label: &str) -> Option<ObjectKey> {
    change
        .labels
        .get(label)
        .map(|owner| ObjectKey::new(change.key.namespace.clone(), owner.clone()))
}

#[derive(Debug, Default)]
struct QueueState {
    queue: VecDeque<ObjectKey>,
    queued: HashSet<ObjectKey>,
    processing: HashSet<ObjectKey>,
    dirty: HashSet<ObjectKey>,
    shut_down: bool,
}

/// De-duplicating FIFO of object keys.
#[derive(Debug, Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, key: ObjectKey) {
        let mut state = self.state.lock().await;
        if state.shut_down {
            return;
        }
        if state.processing.contains(&key) {
            state.dirty.insert(key);
            return;
        }
        if state.queued.insert(key.clone()) {
            state.queue.push_back(key);
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Next key to process, or `None` once the queue is shut down.
    pub async fn pop(&self) -> Option<ObjectKey> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().await;
                if state.shut_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.queued.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Mark `key` finished; re-queues it if it changed in the meantime.
    pub async fn done(&self, key: &ObjectKey) {
        let mut state = self.state.lock().await;
        state.processing.remove(key);
        if state.dirty.remove(key) && !state.shut_down && state.queued.insert(key.clone()) {
            state.queue.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn shutdown(&self) {
        self.state.lock().await.shut_down = true;
        self.notify.notify_waiters();
    }
}

/// Outcome of [`ControllerManager::run_once`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SweepReport {
    pub reconciled: usize,
    pub failed: usize,
}

struct Controller {
    reconciler: Arc<dyn Reconciler>,
    queue: Arc<WorkQueue>,
}

pub struct ControllerManager {
    client: Arc<dyn Client>,
    controllers: Vec<Controller>,
    resync: Duration,
    workers: usize,
    error_backoff: Duration,
}

impl ControllerManager {
    pub fn new(client: Arc<dyn Client>, resync: Duration) -> Self {
        Self {
            client,
            controllers: Vec::new(),
            resync,
            workers: DEFAULT_WORKERS,
            error_backoff: DEFAULT_ERROR_BACKOFF,
        }
    }

    /// Workers per controller.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    pub fn register(&mut self, reconciler: Arc<dyn Reconciler>) {
        self.controllers.push(Controller {
            reconciler,
            queue: Arc::new(WorkQueue::new()),
        });
    }

    pub fn controller_names(&self) -> Vec<&'static str> {
        self.controllers
            .iter()
            .map(|controller| controller.reconciler.name())
            .collect()
    }

    /// Reconcile every existing object once per controller, in registration
    /// order. Requeue requests are ignored.
    pub async fn run_once(&self) -> Result<SweepReport, StoreError> {
        let mut report = SweepReport::default();
        for controller in &self.controllers {
            let reconciler = &controller.reconciler;
            for key in self.client.list_keys(reconciler.kind())? {
                let span = info_span!("reconcile", controller = reconciler.name(), key = %key);
                match reconciler.reconcile(&key).instrument(span).await {
                    Ok(_) => report.reconciled += 1,
                    Err(err) => {
                        error!(controller = reconciler.name(), key = %key, error = %err, "reconcile failed");
                        report.failed += 1;
                    }
                }
            }
        }
        Ok(report)
    }

    /// Run until `shutdown` flips to true (or its sender is dropped).
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), StoreError> {
        let mut tasks = JoinSet::new();
        let mut changes = self.client.watch();

        self.resync_all().await?;

        for controller in &self.controllers {
            for _ in 0..self.workers {
                tasks.spawn(worker(
                    controller.reconciler.clone(),
                    controller.queue.clone(),
                    self.error_backoff,
                ));
            }
        }
        info!(
            controllers = ?self.controller_names(),
            workers = self.workers,
            resync_secs = self.resync.as_secs(),
            "controller manager started"
        );

        let mut resync = tokio::time::interval(self.resync.max(Duration::from_millis(1)));
        resync.tick().await;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = resync.tick() => {
                    if let Err(err) = self.resync_all().await {
                        warn!(error = %err, "periodic resync failed");
                    }
                }
                change = changes.recv() => match change {
                    Ok(change) => self.dispatch(&change).await,
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "change stream lagged, resyncing");
                        if let Err(err) = self.resync_all().await {
                            warn!(error = %err, "resync after lag failed");
                        }
                    }
                    Err(RecvError::Closed) => {
                        warn!("change stream closed");
                        break;
                    }
                },
            }
        }

        info!("controller manager shutting down");
        for controller in &self.controllers {
            controller.queue.shutdown().await;
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "controller worker panicked");
            }
        }
        Ok(())
    }

    async fn dispatch(&self, change: &ObjectChange) {
        for controller in &self.controllers {
            for key in controller.reconciler.map_change(change) {
                controller.queue.add(key).await;
            }
        }
    }

    async fn resync_all(&self) -> Result<(), StoreError> {
        for controller in &self.controllers {
            for key in self.client.list_keys(controller.reconciler.kind())? {
                controller.queue.add(key).await;
            }
        }
        Ok(())
    }
}

async fn worker(reconciler: Arc<dyn Reconciler>, queue: Arc<WorkQueue>, error_backoff: Duration) {
    while let Some(key) = queue.pop().await {
        let span = info_span!("reconcile", controller = reconciler.name(), key = %key);
        let result = reconciler.reconcile(&key).instrument(span).await;
        queue.done(&key).await;

        let requeue = match result {
            Ok(action) => action.requeue_after,
            Err(err) => {
                error!(controller = reconciler.name(), key = %key, error = %err, "reconcile failed");
                Some(error_backoff)
            }
        };
        if let Some(delay) = requeue {
            debug!(controller = reconciler.name(), key = %key, delay_ms = delay.as_millis() as u64, "requeue scheduled");
            let queue = queue.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                queue.add(key).await;
            });
        }
    }
}
