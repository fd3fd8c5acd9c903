//! Per-kind chaos actions and the registry the experiment reconciler
//! dispatches through.

pub mod http;
pub mod network;
pub mod stress;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use havoc_core::chaos::{ChaosKind, SpecError};
use havoc_core::experiment::{Experiment, Record};
use havoc_core::state::RecordPhase;
use havoc_core::types::{ObjectKey, Pod, Target};
use havoc_executor::{ApplyOutcome, ExecutorError, Fault, FaultExecutor, FaultTag, RecoverOutcome};

use crate::client::{Client, ClientExt, StoreError};
use crate::selector::{Selector, SelectorError};

pub use http::HttpChaos;
pub use network::NetworkChaos;
pub use stress::StressChaos;

#[derive(Debug, thiserror::Error)]
pub enum ChaosError {
    #[error("record index {index} out of range ({len} records)")]
    RecordIndex { index: usize, len: usize },
    #[error("record id '{id}' is not a valid target")]
    InvalidTarget { id: String },
    #[error("target pod {key} not found")]
    TargetNotFound { key: ObjectKey },
    #[error("experiment chaos is {actual}, expected {expected}")]
    WrongKind {
        expected: ChaosKind,
        actual: ChaosKind,
    },
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error(transparent)]
    Spec(#[from] SpecError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Selector(#[from] SelectorError),
}

/// One chaos kind's apply/recover pair.
///
/// Both act on `records[index]` and return the phase that record should be
/// stored with. Implementations must tolerate being called again for a
/// target that is already in the requested state.
#[async_trait]
pub trait ChaosImpl: Send + Sync {
    fn kind(&self) -> ChaosKind;

    async fn apply(
        &self,
        index: usize,
        records: &[Record],
        experiment: &Experiment,
    ) -> Result<RecordPhase, ChaosError>;

    async fn recover(
        &self,
        index: usize,
        records: &[Record],
        experiment: &Experiment,
    ) -> Result<RecordPhase, ChaosError>;
}

/// Chaos implementations keyed by kind. Built once at startup and shared.
#[derive(Clone, Default)]
pub struct ChaosRegistry {
    impls: HashMap<ChaosKind, Arc<dyn ChaosImpl>>,
}

impl ChaosRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every built-in kind, sharing one executor.
    pub fn with_builtin(
        client: Arc<dyn Client>,
        executor: Arc<dyn FaultExecutor>,
        selector: Arc<dyn Selector>,
    ) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(NetworkChaos::new(
            client.clone(),
            executor.clone(),
            selector,
        )));
        registry.register(Arc::new(HttpChaos::new(client.clone(), executor.clone())));
        registry.register(Arc::new(StressChaos::new(client, executor)));
        registry
    }

    /// Later registrations for the same kind replace earlier ones.
    pub fn register(&mut self, chaos: Arc<dyn ChaosImpl>) {
        self.impls.insert(chaos.kind(), chaos);
    }

    pub fn get(&self, kind: ChaosKind) -> Option<Arc<dyn ChaosImpl>> {
        self.impls.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<ChaosKind> {
        let mut kinds: Vec<ChaosKind> = self.impls.keys().copied().collect();
        kinds.sort_by_key(|kind| kind.as_str());
        kinds
    }
}

impl std::fmt::Debug for ChaosRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChaosRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

pub(crate) fn record_target(records: &[Record], index: usize) -> Result<Target, ChaosError> {
    let record = records.get(index).ok_or(ChaosError::RecordIndex {
        index,
        len: records.len(),
    })?;
    Target::parse_id(&record.id).ok_or_else(|| ChaosError::InvalidTarget {
        id: record.id.clone(),
    })
}

pub(crate) fn target_pod(client: &dyn Client, target: &Target) -> Result<Option<Pod>, ChaosError> {
    Ok(client
        .get::<Pod>(target.pod())?
        .filter(|pod| !pod.metadata.is_deleted()))
}

pub(crate) fn require_pod(client: &dyn Client, target: &Target) -> Result<Pod, ChaosError> {
    target_pod(client, target)?.ok_or_else(|| ChaosError::TargetNotFound {
        key: target.pod().clone(),
    })
}

pub(crate) async fn apply_faults(
    executor: &dyn FaultExecutor,
    target: &Target,
    faults: &[Fault],
) -> Result<RecordPhase, ChaosError> {
    for fault in faults {
        match executor.apply(target, fault).await? {
            ApplyOutcome::Applied => {}
            ApplyOutcome::AlreadyApplied => {
                debug!(target_id = %target, fault = fault.tag().as_str(), "already applied");
            }
        }
    }
    Ok(RecordPhase::Injected)
}

pub(crate) async fn recover_faults(
    executor: &dyn FaultExecutor,
    target: &Target,
    tags: &[FaultTag],
) -> Result<RecordPhase, ChaosError> {
    for tag in tags {
        match executor.recover(target, *tag).await? {
            RecoverOutcome::Recovered => {}
            RecoverOutcome::NothingToRecover => {
                debug!(target_id = %target, fault = tag.as_str(), "nothing to recover");
            }
        }
    }
    Ok(RecordPhase::NotInjected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::TargetSelector;
    use crate::store::SqliteStore;
    use havoc_core::config::ControllerConfig;
    use havoc_executor::RecordingExecutor;

    #[test]
    fn builtin_registry_covers_every_kind() {
        let store: Arc<dyn Client> = {
            let store = SqliteStore::open_in_memory().expect("open store");
            store.migrate().expect("migrate");
            Arc::new(store)
        };
        let selector = Arc::new(TargetSelector::new(store.clone(), ControllerConfig::default()));
        let registry =
            ChaosRegistry::with_builtin(store, Arc::new(RecordingExecutor::new()), selector);

        for kind in ChaosKind::ALL {
            let chaos = registry.get(kind).expect("registered kind");
            assert_eq!(chaos.kind(), kind);
        }
        assert_eq!(registry.kinds().len(), ChaosKind::ALL.len());
    }

    #[test]
    fn record_target_rejects_bad_ids_and_indexes() {
        let records = vec![Record::new("not-a-target", ".")];
        assert!(matches!(
            record_target(&records, 0),
            Err(ChaosError::InvalidTarget { .. })
        ));
        assert!(matches!(
            record_target(&records, 3),
            Err(ChaosError::RecordIndex { index: 3, len: 1 })
        ));
    }
}
