use havoc_core::chaos::{ChaosKind, SpecError};
use havoc_core::duration::DurationParseError;
use havoc_core::workflow::WorkflowError;

use crate::chaos::ChaosError;
use crate::client::StoreError;

/// Anything that ends a reconcile pass early. The manager logs it and
/// requeues the key.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Spec(#[from] SpecError),
    #[error("malformed duration: {0}")]
    Duration(#[from] DurationParseError),
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
    #[error(transparent)]
    Chaos(#[from] ChaosError),
    #[error("no chaos implementation registered for {kind}")]
    UnknownChaosKind { kind: ChaosKind },
}
