//! In-process executor that tracks fault state instead of touching hosts.
//!
//! Used for dry runs of the daemon and as the executor in tests.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::Mutex;
use tracing::{debug, info};

use havoc_core::types::Target;

use crate::adapter::FaultExecutor;
use crate::error::ExecutorError;
use crate::types::{ApplyOutcome, Fault, FaultTag, RecoverOutcome};

#[derive(Debug, Default)]
struct RecordingState {
    active: BTreeMap<(String, FaultTag), Fault>,
    apply_calls: usize,
    recover_calls: usize,
    fail_apply: BTreeSet<String>,
    fail_recover: BTreeSet<String>,
}

#[derive(Debug, Default)]
pub struct RecordingExecutor {
    state: Mutex<RecordingState>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every apply against `target_id` fail until cleared.
    pub async fn fail_apply_for(&self, target_id: impl Into<String>) {
        self.state.lock().await.fail_apply.insert(target_id.into());
    }

    pub async fn fail_recover_for(&self, target_id: impl Into<String>) {
        self.state.lock().await.fail_recover.insert(target_id.into());
    }

    pub async fn clear_failures(&self) {
        let mut state = self.state.lock().await;
        state.fail_apply.clear();
        state.fail_recover.clear();
    }

    pub async fn apply_calls(&self) -> usize {
        self.state.lock().await.apply_calls
    }

    pub async fn recover_calls(&self) -> usize {
        self.state.lock().await.recover_calls
    }

    pub async fn is_active(&self, target_id: &str, tag: FaultTag) -> bool {
        self.state
            .lock()
            .await
            .active
            .contains_key(&(target_id.to_string(), tag))
    }

    pub async fn active_fault(&self, target_id: &str, tag: FaultTag) -> Option<Fault> {
        self.state
            .lock()
            .await
            .active
            .get(&(target_id.to_string(), tag))
            .cloned()
    }

    pub async fn active_count(&self) -> usize {
        self.state.lock().await.active.len()
    }
}

#[async_trait]
impl FaultExecutor for RecordingExecutor {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn apply(&self, target: &Target, fault: &Fault) -> Result<ApplyOutcome, ExecutorError> {
        let mut state = self.state.lock().await;
        state.apply_calls += 1;
        let id = target.id();
        if state.fail_apply.contains(&id) {
            return Err(ExecutorError::Rejected {
                op: "apply",
                target: id,
                message: "injected failure".to_string(),
            });
        }

        let key = (id, fault.tag());
        if state.active.contains_key(&key) {
            debug!(target_id = %key.0, fault = key.1.as_str(), "fault already applied");
            return Ok(ApplyOutcome::AlreadyApplied);
        }
        info!(target_id = %key.0, fault = key.1.as_str(), "fault applied");
        state.active.insert(key, fault.clone());
        Ok(ApplyOutcome::Applied)
    }

    async fn recover(
        &self,
        target: &Target,
        tag: FaultTag,
    ) -> Result<RecoverOutcome, ExecutorError> {
        let mut state = self.state.lock().await;
        state.recover_calls += 1;
        let id = target.id();
        if state.fail_recover.contains(&id) {
            return Err(ExecutorError::Rejected {
                op: "recover",
                target: id,
                message: "injected failure".to_string(),
            });
        }

        match state.active.remove(&(id.clone(), tag)) {
            Some(_) => {
                info!(target_id = %id, fault = tag.as_str(), "fault recovered");
                Ok(RecoverOutcome::Recovered)
            }
            None => Ok(RecoverOutcome::NothingToRecover),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{StressRequest, Tbf};
    use havoc_core::types::ObjectKey;

    fn target() -> Target {
        Target::Pod(ObjectKey::new("default", "web-0"))
    }

    fn stress() -> Fault {
        Fault::Stress {
            request: StressRequest {
                stressors: "--cpu 1".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn apply_is_idempotent() {
        let executor = RecordingExecutor::new();
        assert_eq!(
            executor.apply(&target(), &stress()).await.expect("apply"),
            ApplyOutcome::Applied
        );
        assert_eq!(
            executor.apply(&target(), &stress()).await.expect("apply"),
            ApplyOutcome::AlreadyApplied
        );
        assert_eq!(executor.apply_calls().await, 2);
        assert_eq!(executor.active_count().await, 1);
    }

    #[tokio::test]
    async fn recover_clears_only_the_requested_family() {
        let executor = RecordingExecutor::new();
        let tbf = Fault::Tbf {
            tbf: Tbf {
                rate: 1024,
                limit: 1,
                buffer: 1,
                peak_rate: 0,
                min_burst: 0,
            },
        };
        executor.apply(&target(), &stress()).await.expect("apply stress");
        executor.apply(&target(), &tbf).await.expect("apply tbf");

        assert_eq!(
            executor
                .recover(&target(), FaultTag::Tbf)
                .await
                .expect("recover"),
            RecoverOutcome::Recovered
        );
        assert!(executor.is_active("default/web-0", FaultTag::Stress).await);
        assert!(!executor.is_active("default/web-0", FaultTag::Tbf).await);
        assert_eq!(
            executor
                .recover(&target(), FaultTag::Tbf)
                .await
                .expect("recover"),
            RecoverOutcome::NothingToRecover
        );
    }

    #[tokio::test]
    async fn injected_failures_surface_as_rejections() {
        let executor = RecordingExecutor::new();
        executor.fail_apply_for("default/web-0").await;
        let err = executor.apply(&target(), &stress()).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Rejected { op: "apply", .. }));
        assert_eq!(executor.active_count().await, 0);

        executor.clear_failures().await;
        executor.apply(&target(), &stress()).await.expect("apply");
        assert!(executor.is_active("default/web-0", FaultTag::Stress).await);
    }
}
