//! Fixtures shared by the reconciler tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

use havoc_core::chaos::{ChaosSpec, DelaySpec, NetworkAction, NetworkChaosSpec};
use havoc_core::config::ControllerConfig;
use havoc_core::events::Event;
use havoc_core::experiment::{Experiment, ExperimentSpec};
use havoc_core::selector::SelectorSpec;
use havoc_core::types::{Container, Object, ObjectKey, ObjectKind, Pod};
use havoc_executor::RecordingExecutor;

use crate::chaos::ChaosRegistry;
use crate::client::{Client, ClientExt, ObjectChange, RawObject, StoreError};
use crate::experiment::ExperimentReconciler;
use crate::recorder::EventRecorder;
use crate::retry::Backoff;
use crate::selector::TargetSelector;
use crate::store::SqliteStore;

/// Store wrapper that can fail the next N updates with a version conflict,
/// or make an object vanish underneath its next writer.
pub struct FlakyClient {
    inner: SqliteStore,
    pending_conflicts: AtomicUsize,
    vanish_on_update: Mutex<Option<(ObjectKind, ObjectKey)>>,
}

impl FlakyClient {
    pub fn new() -> Self {
        let inner = SqliteStore::open_in_memory().expect("open in-memory store");
        inner.migrate().expect("migrate");
        Self {
            inner,
            pending_conflicts: AtomicUsize::new(0),
            vanish_on_update: Mutex::new(None),
        }
    }

    /// The next update of `key` deletes the object and reports a conflict,
    /// as if another writer removed it first.
    pub fn vanish_on_next_update(&self, kind: ObjectKind, key: ObjectKey) {
        *self.vanish_on_update.lock().expect("vanish lock") = Some((kind, key));
    }

    fn take_vanish(&self, kind: ObjectKind, key: &ObjectKey) -> bool {
        let mut pending = self.vanish_on_update.lock().expect("vanish lock");
        if pending.as_ref() == Some(&(kind, key.clone())) {
            *pending = None;
            true
        } else {
            false
        }
    }

    pub fn fail_next_updates(&self, count: usize) {
        self.pending_conflicts.store(count, Ordering::SeqCst);
    }

    fn take_conflict(&self) -> bool {
        self.pending_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

impl Client for FlakyClient {
    fn get_raw(&self, kind: ObjectKind, key: &ObjectKey) -> Result<Option<RawObject>, StoreError> {
        self.inner.get_raw(kind, key)
    }

    fn list_raw(
        &self,
        kind: ObjectKind,
        namespace: Option<&str>,
    ) -> Result<Vec<RawObject>, StoreError> {
        self.inner.list_raw(kind, namespace)
    }

    fn list_keys(&self, kind: ObjectKind) -> Result<Vec<ObjectKey>, StoreError> {
        self.inner.list_keys(kind)
    }

    fn create_raw(
        &self,
        kind: ObjectKind,
        key: &ObjectKey,
        labels: &BTreeMap<String, String>,
        payload: &str,
    ) -> Result<u64, StoreError> {
        self.inner.create_raw(kind, key, labels, payload)
    }

    fn update_raw(
        &self,
        kind: ObjectKind,
        key: &ObjectKey,
        labels: &BTreeMap<String, String>,
        payload: &str,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        if self.take_vanish(kind, key) {
            self.inner.delete_raw(kind, key)?;
            return Err(StoreError::Conflict {
                kind,
                key: key.clone(),
                expected: expected_version,
                actual: expected_version + 1,
            });
        }
        if self.take_conflict() {
            return Err(StoreError::Conflict {
                kind,
                key: key.clone(),
                expected: expected_version,
                actual: expected_version + 1,
            });
        }
        self.inner
            .update_raw(kind, key, labels, payload, expected_version)
    }

    fn delete_raw(&self, kind: ObjectKind, key: &ObjectKey) -> Result<bool, StoreError> {
        self.inner.delete_raw(kind, key)
    }

    fn record_event(&self, event: &Event) -> Result<(), StoreError> {
        self.inner.record_event(event)
    }

    fn list_events(&self, involved: Option<&ObjectKey>) -> Result<Vec<Event>, StoreError> {
        self.inner.list_events(involved)
    }

    fn watch(&self) -> broadcast::Receiver<ObjectChange> {
        self.inner.watch()
    }
}

pub fn fast_backoff() -> Backoff {
    Backoff {
        steps: 5,
        initial: std::time::Duration::from_millis(1),
        factor: 1.0,
        max: std::time::Duration::from_millis(1),
    }
}

pub fn network_delay() -> ChaosSpec {
    ChaosSpec::NetworkChaos(NetworkChaosSpec {
        action: NetworkAction::Delay,
        delay: Some(DelaySpec {
            latency: "100ms".to_string(),
            correlation: None,
            jitter: None,
            reorder: None,
        }),
        ..NetworkChaosSpec::default()
    })
}

/// Network delay experiment targeting the named pods in `default`.
pub fn experiment_with_pods(name: &str, pods: &[&str]) -> Experiment {
    let selector = SelectorSpec {
        pods: BTreeMap::from([(
            "default".to_string(),
            pods.iter().map(|pod| pod.to_string()).collect(),
        )]),
        ..SelectorSpec::default()
    };
    Experiment::new(
        "default",
        name,
        ExperimentSpec::new(network_delay()).with_selector(".", selector),
    )
}

pub struct Harness {
    pub client: Arc<FlakyClient>,
    pub executor: Arc<RecordingExecutor>,
    pub recorder: EventRecorder,
    pub experiments: ExperimentReconciler,
}

impl Harness {
    pub fn with_pods(pods: &[&str]) -> Self {
        let client = Arc::new(FlakyClient::new());
        let executor = Arc::new(RecordingExecutor::new());
        let recorder = EventRecorder::new(client.clone());
        let selector = Arc::new(TargetSelector::new(
            client.clone(),
            ControllerConfig::default(),
        ));
        let registry = ChaosRegistry::with_builtin(client.clone(), executor.clone(), selector.clone());
        let experiments =
            ExperimentReconciler::new(client.clone(), registry, selector, recorder.clone())
                .with_backoff(fast_backoff());

        let harness = Self {
            client,
            executor,
            recorder,
            experiments,
        };
        for pod in pods {
            harness.add_pod(pod);
        }
        harness
    }

    pub fn dyn_client(&self) -> Arc<dyn Client> {
        self.client.clone()
    }

    pub fn add_pod(&self, name: &str) {
        let mut pod = Pod::new("default", name);
        pod.pod_ip = Some(format!("10.0.0.{}", self.pod_count() + 1));
        pod.containers = vec![Container {
            ports: vec![8080],
            ..Container::new("main")
        }];
        self.client.create(&mut pod).expect("create pod");
    }

    fn pod_count(&self) -> usize {
        self.client.list::<Pod>(None).expect("list pods").len()
    }

    pub fn create<T: Object>(&self, mut object: T) -> T {
        self.client.create(&mut object).expect("create object");
        object
    }

    pub fn fetch<T: Object>(&self, namespace: &str, name: &str) -> Option<T> {
        self.client
            .get(&ObjectKey::new(namespace, name))
            .expect("get object")
    }

    pub fn experiment(&self, name: &str) -> Experiment {
        self.fetch("default", name).expect("experiment exists")
    }
}
