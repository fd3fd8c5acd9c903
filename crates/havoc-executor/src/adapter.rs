use async_trait::async_trait;
use havoc_core::types::Target;

use crate::error::ExecutorError;
use crate::types::{ApplyOutcome, Fault, FaultTag, RecoverOutcome};

/// The boundary to whatever physically injects faults.
///
/// Both calls must be idempotent: applying an already-present fault reports
/// `AlreadyApplied`, and recovering a clean target reports
/// `NothingToRecover`. Callers treat both as success.
#[async_trait]
pub trait FaultExecutor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn apply(&self, target: &Target, fault: &Fault) -> Result<ApplyOutcome, ExecutorError>;

    async fn recover(&self, target: &Target, tag: FaultTag)
        -> Result<RecoverOutcome, ExecutorError>;
}
