use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use havoc_core::chaos::{ChaosKind, ChaosSpec, StressChaosSpec};
use havoc_core::experiment::{Experiment, Record};
use havoc_core::state::RecordPhase;
use havoc_executor::{Fault, FaultExecutor, FaultTag, StressRequest};

use super::{apply_faults, record_target, recover_faults, require_pod, target_pod, ChaosError, ChaosImpl};
use crate::client::Client;

/// CPU/memory stressors started inside the target.
pub struct StressChaos {
    client: Arc<dyn Client>,
    executor: Arc<dyn FaultExecutor>,
}

impl StressChaos {
    pub fn new(client: Arc<dyn Client>, executor: Arc<dyn FaultExecutor>) -> Self {
        Self { client, executor }
    }
}

fn stress_spec(experiment: &Experiment) -> Result<&StressChaosSpec, ChaosError> {
    match &experiment.spec.chaos {
        ChaosSpec::StressChaos(spec) => Ok(spec),
        other => Err(ChaosError::WrongKind {
            expected: ChaosKind::StressChaos,
            actual: other.kind(),
        }),
    }
}

#[async_trait]
impl ChaosImpl for StressChaos {
    fn kind(&self) -> ChaosKind {
        ChaosKind::StressChaos
    }

    async fn apply(
        &self,
        index: usize,
        records: &[Record],
        experiment: &Experiment,
    ) -> Result<RecordPhase, ChaosError> {
        let spec = stress_spec(experiment)?;
        let target = record_target(records, index)?;
        require_pod(self.client.as_ref(), &target)?;
        info!(target_id = %target, stressors = %spec.stressors, "starting stressors");
        let fault = Fault::Stress {
            request: StressRequest {
                stressors: spec.stressors.clone(),
            },
        };
        apply_faults(self.executor.as_ref(), &target, &[fault]).await
    }

    async fn recover(
        &self,
        index: usize,
        records: &[Record],
        experiment: &Experiment,
    ) -> Result<RecordPhase, ChaosError> {
        stress_spec(experiment)?;
        let target = record_target(records, index)?;
        if target_pod(self.client.as_ref(), &target)?.is_none() {
            return Ok(RecordPhase::NotInjected);
        }
        recover_faults(self.executor.as_ref(), &target, &[FaultTag::Stress]).await
    }
}
