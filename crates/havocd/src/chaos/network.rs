use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use havoc_core::chaos::{
    ChaosKind, ChaosSpec, NetworkAction, NetworkChaosSpec, PartitionDirection, SpecError,
};
use havoc_core::experiment::{Experiment, Record};
use havoc_core::state::RecordPhase;
use havoc_core::types::Pod;
use havoc_executor::{netem_for, Chain, Fault, FaultExecutor, FaultTag, Tbf};

use super::{apply_faults, record_target, recover_faults, require_pod, target_pod, ChaosError, ChaosImpl};
use crate::client::{Client, ClientExt};
use crate::selector::Selector;

pub const PARTITION_INPUT_CHAIN: &str = "HAVOC-PARTITION-INPUT";
pub const PARTITION_OUTPUT_CHAIN: &str = "HAVOC-PARTITION-OUTPUT";

pub struct NetworkChaos {
    client: Arc<dyn Client>,
    executor: Arc<dyn FaultExecutor>,
    selector: Arc<dyn Selector>,
}

impl NetworkChaos {
    pub fn new(
        client: Arc<dyn Client>,
        executor: Arc<dyn FaultExecutor>,
        selector: Arc<dyn Selector>,
    ) -> Self {
        Self {
            client,
            executor,
            selector,
        }
    }

    /// Addresses of every pod matched by the partition's `target` selector.
    fn partition_peers(&self, spec: &NetworkChaosSpec) -> Result<Vec<String>, ChaosError> {
        let selector = spec.target.as_ref().ok_or_else(|| SpecError::MissingSection {
            action: spec.action.as_str().to_string(),
            field: "target",
        })?;
        let mut peers = Vec::new();
        for target in self.selector.select(selector)? {
            let Some(pod) = self.client.get::<Pod>(target.pod())? else {
                continue;
            };
            if let Some(ip) = pod.pod_ip {
                if !peers.contains(&ip) {
                    peers.push(ip);
                }
            }
        }
        Ok(peers)
    }

    fn faults(&self, spec: &NetworkChaosSpec) -> Result<Vec<Fault>, ChaosError> {
        let fault = match spec.action {
            NetworkAction::Partition => Fault::Chains {
                chains: partition_chains(spec.direction, self.partition_peers(spec)?),
            },
            NetworkAction::Bandwidth => {
                let bandwidth = spec.bandwidth.as_ref().ok_or_else(|| SpecError::MissingSection {
                    action: spec.action.as_str().to_string(),
                    field: "bandwidth",
                })?;
                Fault::Tbf {
                    tbf: Tbf::try_from(bandwidth)?,
                }
            }
            _ => Fault::Netem {
                netem: netem_for(spec)?,
            },
        };
        Ok(vec![fault])
    }
}

/// Fault tag a network action leaves behind on the target.
pub fn network_fault_tag(action: NetworkAction) -> FaultTag {
    match action {
        NetworkAction::Partition => FaultTag::Chains,
        NetworkAction::Bandwidth => FaultTag::Tbf,
        _ => FaultTag::Netem,
    }
}

/// Chains dropping traffic exchanged with `peers`. `To` cuts outgoing
/// packets, `From` cuts incoming ones.
pub fn partition_chains(direction: PartitionDirection, peers: Vec<String>) -> Vec<Chain> {
    let mut hooks = Vec::new();
    if matches!(direction, PartitionDirection::From | PartitionDirection::Both) {
        hooks.push(("INPUT", PARTITION_INPUT_CHAIN));
    }
    if matches!(direction, PartitionDirection::To | PartitionDirection::Both) {
        hooks.push(("OUTPUT", PARTITION_OUTPUT_CHAIN));
    }

    let mut chains: Vec<Chain> = hooks
        .iter()
        .map(|(_, chain)| Chain::new_chain(*chain))
        .collect();
    for (hook, chain) in &hooks {
        chains.push(Chain::add(*hook, *chain));
    }
    for (_, chain) in &hooks {
        chains.push(Chain::add(*chain, "DROP").with_ipset(peers.clone()));
    }
    chains
}

fn network_spec(experiment: &Experiment) -> Result<&NetworkChaosSpec, ChaosError> {
    match &experiment.spec.chaos {
        ChaosSpec::NetworkChaos(spec) => Ok(spec),
        other => Err(ChaosError::WrongKind {
            expected: ChaosKind::NetworkChaos,
            actual: other.kind(),
        }),
    }
}

#[async_trait]
impl ChaosImpl for NetworkChaos {
    fn kind(&self) -> ChaosKind {
        ChaosKind::NetworkChaos
    }

    async fn apply(
        &self,
        index: usize,
        records: &[Record],
        experiment: &Experiment,
    ) -> Result<RecordPhase, ChaosError> {
        let spec = network_spec(experiment)?;
        let target = record_target(records, index)?;
        require_pod(self.client.as_ref(), &target)?;
        let faults = self.faults(spec)?;
        info!(
            target_id = %target,
            action = spec.action.as_str(),
            "injecting network chaos"
        );
        apply_faults(self.executor.as_ref(), &target, &faults).await
    }

    async fn recover(
        &self,
        index: usize,
        records: &[Record],
        experiment: &Experiment,
    ) -> Result<RecordPhase, ChaosError> {
        let spec = network_spec(experiment)?;
        let target = record_target(records, index)?;
        if target_pod(self.client.as_ref(), &target)?.is_none() {
            debug!(target_id = %target, "target gone, nothing to recover");
            return Ok(RecordPhase::NotInjected);
        }
        recover_faults(
            self.executor.as_ref(),
            &target,
            &[network_fault_tag(spec.action)],
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use havoc_core::chaos::{BandwidthSpec, DelaySpec};
    use havoc_core::config::ControllerConfig;
    use havoc_core::experiment::ExperimentSpec;
    use havoc_core::selector::SelectorSpec;
    use havoc_core::types::Target;
    use havoc_executor::{ChainCommand, RecordingExecutor};
    use std::collections::BTreeMap;

    use crate::selector::TargetSelector;
    use crate::store::SqliteStore;

    struct Fixture {
        executor: Arc<RecordingExecutor>,
        chaos: NetworkChaos,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(SqliteStore::open_in_memory().expect("open store"));
        store.migrate().expect("migrate");
        for (name, app, ip) in [
            ("web-0", "web", "10.0.0.1"),
            ("db-0", "db", "10.0.0.2"),
            ("db-1", "db", "10.0.0.3"),
        ] {
            let mut pod = Pod::new("default", name);
            pod.metadata.labels.insert("app".to_string(), app.to_string());
            pod.pod_ip = Some(ip.to_string());
            store.create(&mut pod).expect("create pod");
        }
        let executor = Arc::new(RecordingExecutor::new());
        let selector = Arc::new(TargetSelector::new(store.clone(), ControllerConfig::default()));
        let chaos = NetworkChaos::new(store.clone(), executor.clone(), selector);
        Fixture { executor, chaos }
    }

    fn experiment(spec: NetworkChaosSpec) -> Experiment {
        Experiment::new(
            "default",
            "net",
            ExperimentSpec::new(ChaosSpec::NetworkChaos(spec)),
        )
    }

    #[test]
    fn partition_chains_follow_direction() {
        let peers = vec!["10.0.0.2".to_string()];
        let to = partition_chains(PartitionDirection::To, peers.clone());
        assert_eq!(to.len(), 3);
        assert_eq!(to[0].command, ChainCommand::New);
        assert_eq!(to[0].chain_name, PARTITION_OUTPUT_CHAIN);
        assert_eq!(to[1].chain_name, "OUTPUT");
        assert_eq!(to[1].action, PARTITION_OUTPUT_CHAIN);
        assert_eq!(to[2].action, "DROP");
        assert_eq!(to[2].ipset, peers);

        let both = partition_chains(PartitionDirection::Both, peers);
        assert_eq!(both.len(), 6);
        assert_eq!(both[0].chain_name, PARTITION_INPUT_CHAIN);
        assert_eq!(both[1].chain_name, PARTITION_OUTPUT_CHAIN);
    }

    #[tokio::test]
    async fn delay_applies_netem_and_is_idempotent() {
        let fixture = fixture();
        let experiment = experiment(NetworkChaosSpec {
            action: NetworkAction::Delay,
            delay: Some(DelaySpec {
                latency: "100ms".to_string(),
                correlation: None,
                jitter: None,
                reorder: None,
            }),
            ..NetworkChaosSpec::default()
        });
        let records = vec![Record::new("default/web-0", ".")];

        for _ in 0..2 {
            let phase = fixture
                .chaos
                .apply(0, &records, &experiment)
                .await
                .expect("apply");
            assert_eq!(phase, RecordPhase::Injected);
        }
        assert_eq!(fixture.executor.active_count().await, 1);
        match fixture
            .executor
            .active_fault("default/web-0", FaultTag::Netem)
            .await
        {
            Some(Fault::Netem { netem }) => assert_eq!(netem.time, 100_000),
            other => panic!("unexpected fault: {other:?}"),
        }

        let phase = fixture
            .chaos
            .recover(0, &records, &experiment)
            .await
            .expect("recover");
        assert_eq!(phase, RecordPhase::NotInjected);
        assert_eq!(fixture.executor.active_count().await, 0);
    }

    #[tokio::test]
    async fn bandwidth_applies_tbf() {
        let fixture = fixture();
        let experiment = experiment(NetworkChaosSpec {
            action: NetworkAction::Bandwidth,
            bandwidth: Some(BandwidthSpec {
                rate: "1mbps".to_string(),
                limit: 100,
                buffer: 10_000,
                peakrate: None,
                minburst: None,
            }),
            ..NetworkChaosSpec::default()
        });
        let records = vec![Record::new("default/web-0", ".")];
        fixture
            .chaos
            .apply(0, &records, &experiment)
            .await
            .expect("apply");
        match fixture
            .executor
            .active_fault("default/web-0", FaultTag::Tbf)
            .await
        {
            Some(Fault::Tbf { tbf }) => assert_eq!(tbf.rate, 1024 * 1024),
            other => panic!("unexpected fault: {other:?}"),
        }
    }

    #[tokio::test]
    async fn partition_drops_traffic_to_selected_peers() {
        let fixture = fixture();
        let experiment = experiment(NetworkChaosSpec {
            action: NetworkAction::Partition,
            direction: PartitionDirection::To,
            target: Some(SelectorSpec {
                label_selectors: BTreeMap::from([("app".to_string(), "db".to_string())]),
                ..SelectorSpec::default()
            }),
            ..NetworkChaosSpec::default()
        });
        let records = vec![Record::new("default/web-0", ".")];
        fixture
            .chaos
            .apply(0, &records, &experiment)
            .await
            .expect("apply");

        let target_id = Target::Pod(havoc_core::types::ObjectKey::new("default", "web-0")).id();
        match fixture
            .executor
            .active_fault(&target_id, FaultTag::Chains)
            .await
        {
            Some(Fault::Chains { chains }) => {
                let drop = chains.last().expect("drop rule");
                assert_eq!(drop.ipset, vec!["10.0.0.2", "10.0.0.3"]);
            }
            other => panic!("unexpected fault: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_section_is_a_spec_error() {
        let fixture = fixture();
        let experiment = experiment(NetworkChaosSpec {
            action: NetworkAction::Loss,
            ..NetworkChaosSpec::default()
        });
        let records = vec![Record::new("default/web-0", ".")];
        let err = fixture
            .chaos
            .apply(0, &records, &experiment)
            .await
            .expect_err("loss section missing");
        assert!(matches!(err, ChaosError::Spec(SpecError::MissingSection { .. })));
        assert_eq!(fixture.executor.apply_calls().await, 0);
    }
}
