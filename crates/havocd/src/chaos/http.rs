use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use havoc_core::chaos::{ChaosKind, ChaosSpec, HttpAction, HttpChaosSpec, SpecError};
use havoc_core::duration::parse_duration;
use havoc_core::experiment::{Experiment, Record};
use havoc_core::state::RecordPhase;
use havoc_executor::{Chain, Fault, FaultExecutor, FaultTag, Netem};

use super::{apply_faults, record_target, recover_faults, require_pod, target_pod, ChaosError, ChaosImpl};
use crate::client::Client;

pub const INPUT_CHAIN: &str = "HTTP-CHAOS-INPUT";
pub const OUTPUT_CHAIN: &str = "HTTP-CHAOS-OUTPUT";

/// Packet-level HTTP faults on a pod's container ports.
pub struct HttpChaos {
    client: Arc<dyn Client>,
    executor: Arc<dyn FaultExecutor>,
}

impl HttpChaos {
    pub fn new(client: Arc<dyn Client>, executor: Arc<dyn FaultExecutor>) -> Self {
        Self { client, executor }
    }
}

/// Filter chains for one pod, in the order the executor must apply them:
/// create both chains, divert the container ports into them, then drop a
/// share of packets for abort and mixed actions.
pub fn http_chains(spec: &HttpChaosSpec, ports: &[u16]) -> Vec<Chain> {
    let ports = ports
        .iter()
        .map(u16::to_string)
        .collect::<Vec<_>>()
        .join(",");

    let mut chains = vec![
        Chain::new_chain(INPUT_CHAIN),
        Chain::new_chain(OUTPUT_CHAIN),
        Chain::add("INPUT", INPUT_CHAIN).with_dport(&ports),
        Chain::add("OUTPUT", OUTPUT_CHAIN).with_sport(&ports),
    ];
    if spec.action.drops_packets() {
        chains.push(Chain::add(INPUT_CHAIN, "DROP").with_probability(spec.percent.clone()));
        chains.push(Chain::add(OUTPUT_CHAIN, "DROP").with_probability(spec.percent.clone()));
    }
    chains
}

fn delays_traffic(spec: &HttpChaosSpec) -> bool {
    matches!(spec.action, HttpAction::Delay | HttpAction::Mixed) && spec.delay.is_some()
}

fn http_faults(spec: &HttpChaosSpec, ports: &[u16]) -> Result<Vec<Fault>, ChaosError> {
    let mut faults = vec![Fault::Chains {
        chains: http_chains(spec, ports),
    }];
    if let Some(delay) = spec.delay.as_deref().filter(|_| delays_traffic(spec)) {
        let latency = parse_duration(delay).map_err(SpecError::from)?;
        faults.push(Fault::Netem {
            netem: Netem {
                time: u32::try_from(latency.as_micros()).unwrap_or(u32::MAX),
                ..Netem::default()
            },
        });
    }
    Ok(faults)
}

fn http_spec(experiment: &Experiment) -> Result<&HttpChaosSpec, ChaosError> {
    match &experiment.spec.chaos {
        ChaosSpec::HttpChaos(spec) => Ok(spec),
        other => Err(ChaosError::WrongKind {
            expected: ChaosKind::HttpChaos,
            actual: other.kind(),
        }),
    }
}

#[async_trait]
impl ChaosImpl for HttpChaos {
    fn kind(&self) -> ChaosKind {
        ChaosKind::HttpChaos
    }

    async fn apply(
        &self,
        index: usize,
        records: &[Record],
        experiment: &Experiment,
    ) -> Result<RecordPhase, ChaosError> {
        let spec = http_spec(experiment)?;
        let target = record_target(records, index)?;
        let pod = require_pod(self.client.as_ref(), &target)?;
        info!(
            target_id = %target,
            action = spec.action.as_str(),
            "injecting http chaos"
        );
        let faults = http_faults(spec, &pod.container_ports())?;
        apply_faults(self.executor.as_ref(), &target, &faults).await
    }

    async fn recover(
        &self,
        index: usize,
        records: &[Record],
        experiment: &Experiment,
    ) -> Result<RecordPhase, ChaosError> {
        let spec = http_spec(experiment)?;
        let target = record_target(records, index)?;
        if target_pod(self.client.as_ref(), &target)?.is_none() {
            return Ok(RecordPhase::NotInjected);
        }
        let mut tags = vec![FaultTag::Chains];
        if delays_traffic(spec) {
            tags.push(FaultTag::Netem);
        }
        recover_faults(self.executor.as_ref(), &target, &tags).await
    }
}
