//! Drives every record of an experiment toward its desired phase.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use havoc_core::config::ControllerConfig;
use havoc_core::events::EventReason;
use havoc_core::experiment::{Experiment, Record};
use havoc_core::state::{DesiredPhase, RecordPhase};
use havoc_core::types::{ObjectKey, ObjectKind};

use crate::chaos::{ChaosError, ChaosImpl, ChaosRegistry};
use crate::client::{Client, ClientExt};
use crate::error::ReconcileError;
use crate::manager::{Action, Reconciler};
use crate::recorder::EventRecorder;
use crate::retry::{retry_on_conflict, Backoff};
use crate::selector::Selector;

/// Delay before retrying records whose apply or recover failed.
pub const FAILED_RECORD_REQUEUE: Duration = Duration::from_secs(5);

pub struct ExperimentReconciler {
    client: Arc<dyn Client>,
    registry: ChaosRegistry,
    selector: Arc<dyn Selector>,
    recorder: EventRecorder,
    backoff: Backoff,
    permits: Arc<Semaphore>,
}

impl ExperimentReconciler {
    pub fn new(
        client: Arc<dyn Client>,
        registry: ChaosRegistry,
        selector: Arc<dyn Selector>,
        recorder: EventRecorder,
    ) -> Self {
        Self {
            client,
            registry,
            selector,
            recorder,
            backoff: Backoff::default(),
            permits: Arc::new(Semaphore::new(
                ControllerConfig::default().max_concurrent_actions.max(1),
            )),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Cap on apply/recover calls in flight during one pass.
    pub fn with_max_concurrent_actions(mut self, limit: usize) -> Self {
        self.permits = Arc::new(Semaphore::new(limit.max(1)));
        self
    }

    /// One record per target per selector, selectors in name order. A
    /// selector that fails contributes nothing this pass.
    fn resolve_records(&self, experiment: &Experiment) -> Vec<Record> {
        let mut records = Vec::new();
        for (selector_key, spec) in &experiment.spec.selectors {
            match self.selector.select(spec) {
                Ok(targets) => {
                    records.extend(
                        targets
                            .iter()
                            .map(|target| Record::new(target.id(), selector_key.clone())),
                    );
                }
                Err(err) => {
                    warn!(selector = %selector_key, error = %err, "failed to select targets");
                    self.recorder.warning(
                        experiment,
                        EventReason::SelectorFailed,
                        format!("selector {selector_key}: {err}"),
                    );
                }
            }
        }
        records
    }

    async fn drive_records(
        &self,
        chaos: Arc<dyn ChaosImpl>,
        experiment: &Experiment,
        records: &mut [Record],
    ) -> (bool, usize) {
        let desired = experiment.status.desired_phase;
        let wanted = desired.target_record_phase();
        let pending: Vec<usize> = records
            .iter()
            .enumerate()
            .filter(|(_, record)| record.phase != wanted)
            .map(|(index, _)| index)
            .collect();
        if pending.is_empty() {
            return (false, 0);
        }

        let snapshot: &[Record] = &*records;
        let outcomes = join_all(pending.iter().map(|&index| {
            let chaos = chaos.clone();
            let permits = self.permits.clone();
            async move {
                let _permit = permits.acquire().await.ok();
                let result = match desired {
                    DesiredPhase::Running => chaos.apply(index, snapshot, experiment).await,
                    DesiredPhase::Stopped => chaos.recover(index, snapshot, experiment).await,
                };
                (index, result)
            }
        }))
        .await;

        let mut changed = false;
        let mut failed = 0;
        for (index, result) in outcomes {
            let record_id = records[index].id.clone();
            match result {
                Ok(phase) => {
                    if records[index].phase != phase {
                        records[index].phase = phase;
                        changed = true;
                    }
                    let reason = match phase {
                        RecordPhase::Injected => EventReason::Applied,
                        RecordPhase::NotInjected => EventReason::Recovered,
                    };
                    debug!(record = %record_id, phase = phase.as_str(), "record updated");
                    self.recorder
                        .normal(experiment, reason, format!("{record_id} is {}", phase.as_str()));
                }
                Err(err) => {
                    failed += 1;
                    self.report_failure(experiment, desired, &record_id, &err);
                }
            }
        }
        (changed, failed)
    }

    fn report_failure(
        &self,
        experiment: &Experiment,
        desired: DesiredPhase,
        record_id: &str,
        err: &ChaosError,
    ) {
        let (reason, verb) = match desired {
            DesiredPhase::Running => (EventReason::ApplyFailed, "apply"),
            DesiredPhase::Stopped => (EventReason::RecoverFailed, "recover"),
        };
        warn!(record = %record_id, error = %err, "failed to {verb} chaos");
        self.recorder
            .warning(experiment, reason, format!("failed to {verb} {record_id}: {err}"));
    }

    async fn persist_records(&self, key: &ObjectKey, records: &[Record]) -> Result<(), ReconcileError> {
        let result = retry_on_conflict(self.backoff, || {
            let Some(mut latest) = self.client.get::<Experiment>(key)? else {
                return Ok(false);
            };
            latest.status.records = Some(records.to_vec());
            self.client.update(&mut latest)?;
            Ok(true)
        })
        .await;

        match result {
            Ok(true) => Ok(()),
            Ok(false) => {
                info!(experiment = %key, "experiment removed before records were saved");
                Ok(())
            }
            Err(err) if err.is_conflict() => {
                error!(experiment = %key, error = %err, "giving up on record update after repeated conflicts");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl Reconciler for ExperimentReconciler {
    fn name(&self) -> &'static str {
        "experiment"
    }

    fn kind(&self) -> ObjectKind {
        ObjectKind::Experiment
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        let Some(mut experiment) = self.client.get::<Experiment>(key)? else {
            debug!(experiment = %key, "experiment not found");
            return Ok(Action::done());
        };
        let kind = experiment.kind();
        let chaos = self
            .registry
            .get(kind)
            .ok_or(ReconcileError::UnknownChaosKind { kind })?;

        let mut dirty = false;
        if experiment.status.records.is_none() {
            let resolved = self.resolve_records(&experiment);
            if !resolved.is_empty() {
                info!(experiment = %key, records = resolved.len(), "records populated");
                self.recorder.normal(
                    &experiment,
                    EventReason::RecordsPopulated,
                    format!("{} targets selected", resolved.len()),
                );
                experiment.status.records = Some(resolved);
                dirty = true;
            }
        }

        let mut records = experiment.status.records.clone().unwrap_or_default();
        let (changed, failed) = self
            .drive_records(chaos, &experiment, &mut records)
            .await;
        dirty |= changed;

        if dirty {
            self.persist_records(key, &records).await?;
        }

        if failed > 0 {
            Ok(Action::requeue_after(FAILED_RECORD_REQUEUE))
        } else {
            Ok(Action::done())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::TargetSelector;
    use crate::testing::{experiment_with_pods, network_delay, Harness};
    use havoc_core::experiment::ExperimentSpec;
    use havoc_core::selector::SelectorSpec;
    use havoc_executor::FaultTag;

    #[tokio::test]
    async fn populates_records_and_injects_every_target() {
        let harness = Harness::with_pods(&["web-0", "web-1"]);
        harness.create(experiment_with_pods("delay", &["web-0", "web-1"]));

        let action = harness
            .experiments
            .reconcile(&ObjectKey::new("default", "delay"))
            .await
            .expect("reconcile");
        assert_eq!(action, Action::done());

        let experiment = harness.experiment("delay");
        let records = experiment.status.records.expect("records populated");
        assert_eq!(records.len(), 2);
        assert!(records
            .iter()
            .all(|record| record.phase == RecordPhase::Injected));
        assert!(harness
            .executor
            .is_active("default/web-0", FaultTag::Netem)
            .await);
    }

    #[tokio::test]
    async fn converged_experiment_makes_no_further_calls() {
        let harness = Harness::with_pods(&["web-0"]);
        harness.create(experiment_with_pods("delay", &["web-0"]));
        let key = ObjectKey::new("default", "delay");

        harness.experiments.reconcile(&key).await.expect("first pass");
        let version = harness.experiment("delay").metadata.resource_version;
        harness.experiments.reconcile(&key).await.expect("second pass");

        assert_eq!(harness.executor.apply_calls().await, 1);
        assert_eq!(
            harness.experiment("delay").metadata.resource_version,
            version,
            "no status write when nothing changed"
        );
    }

    #[tokio::test]
    async fn stopped_experiment_recovers_every_record() {
        let harness = Harness::with_pods(&["web-0", "web-1"]);
        harness.create(experiment_with_pods("delay", &["web-0", "web-1"]));
        let key = ObjectKey::new("default", "delay");
        harness.experiments.reconcile(&key).await.expect("inject");

        let mut experiment = harness.experiment("delay");
        experiment.status.desired_phase = DesiredPhase::Stopped;
        harness.client.update(&mut experiment).expect("stop");
        harness.experiments.reconcile(&key).await.expect("recover");

        let experiment = harness.experiment("delay");
        assert!(experiment.all_recovered());
        assert!(experiment.is_finished());
        assert_eq!(harness.executor.active_count().await, 0);
    }

    #[tokio::test]
    async fn failed_record_keeps_phase_and_requeues() {
        let harness = Harness::with_pods(&["web-0", "web-1"]);
        harness.executor.fail_apply_for("default/web-1").await;
        harness.create(experiment_with_pods("delay", &["web-0", "web-1"]));
        let key = ObjectKey::new("default", "delay");

        let action = harness.experiments.reconcile(&key).await.expect("reconcile");
        assert_eq!(action, Action::requeue_after(FAILED_RECORD_REQUEUE));

        let records = harness.experiment("delay").status.records.expect("records");
        let phases: Vec<RecordPhase> = records.iter().map(|record| record.phase).collect();
        assert_eq!(phases, vec![RecordPhase::Injected, RecordPhase::NotInjected]);

        let warnings = harness
            .client
            .list_events(Some(&key))
            .expect("events")
            .into_iter()
            .filter(|event| event.reason == EventReason::ApplyFailed)
            .count();
        assert_eq!(warnings, 1);

        harness.executor.clear_failures().await;
        let action = harness.experiments.reconcile(&key).await.expect("retry");
        assert_eq!(action, Action::done());
        assert!(harness.experiment("delay").all_injected());
    }

    #[tokio::test]
    async fn empty_selection_leaves_records_unset() {
        let harness = Harness::with_pods(&[]);
        let spec = ExperimentSpec::new(network_delay()).with_selector(
            ".",
            SelectorSpec {
                namespaces: vec!["default".to_string()],
                ..SelectorSpec::default()
            },
        );
        harness.create(Experiment::new("default", "delay", spec));
        let key = ObjectKey::new("default", "delay");

        harness.experiments.reconcile(&key).await.expect("reconcile");
        assert_eq!(harness.experiment("delay").status.records, None);

        harness.add_pod("web-0");
        harness.experiments.reconcile(&key).await.expect("reconcile again");
        let records = harness.experiment("delay").status.records.expect("records");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].phase, RecordPhase::Injected);
    }

    #[tokio::test]
    async fn records_are_frozen_after_first_resolution() {
        let harness = Harness::with_pods(&["web-0"]);
        let spec = ExperimentSpec::new(network_delay()).with_selector(
            ".",
            SelectorSpec {
                namespaces: vec!["default".to_string()],
                ..SelectorSpec::default()
            },
        );
        harness.create(Experiment::new("default", "delay", spec));
        let key = ObjectKey::new("default", "delay");
        harness.experiments.reconcile(&key).await.expect("reconcile");

        harness.add_pod("web-1");
        harness.experiments.reconcile(&key).await.expect("reconcile again");
        let records = harness.experiment("delay").status.records.expect("records");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "default/web-0");
    }

    #[tokio::test]
    async fn missing_experiment_is_a_no_op() {
        let harness = Harness::with_pods(&[]);
        let action = harness
            .experiments
            .reconcile(&ObjectKey::new("default", "ghost"))
            .await
            .expect("reconcile");
        assert_eq!(action, Action::done());
    }

    #[tokio::test]
    async fn conflicting_writer_is_retried() {
        let harness = Harness::with_pods(&["web-0"]);
        harness.create(experiment_with_pods("delay", &["web-0"]));
        harness.client.fail_next_updates(2);

        harness
            .experiments
            .reconcile(&ObjectKey::new("default", "delay"))
            .await
            .expect("reconcile");
        assert!(harness.experiment("delay").all_injected());
    }

    #[tokio::test]
    async fn exhausted_conflict_retries_leave_status_alone() {
        let harness = Harness::with_pods(&["web-0"]);
        harness.create(experiment_with_pods("delay", &["web-0"]));
        let key = ObjectKey::new("default", "delay");
        harness.client.fail_next_updates(100);

        let action = harness.experiments.reconcile(&key).await.expect("reconcile");
        assert_eq!(action, Action::done());
        assert_eq!(harness.experiment("delay").status.records, None);

        harness.client.fail_next_updates(0);
        harness.experiments.reconcile(&key).await.expect("reconcile again");
        assert!(harness.experiment("delay").all_injected());
    }

    #[tokio::test]
    async fn experiment_removed_before_save_is_not_an_error() {
        let harness = Harness::with_pods(&["web-0"]);
        harness.create(experiment_with_pods("delay", &["web-0"]));
        let key = ObjectKey::new("default", "delay");
        harness
            .client
            .vanish_on_next_update(ObjectKind::Experiment, key.clone());

        let action = harness.experiments.reconcile(&key).await.expect("reconcile");
        assert_eq!(action, Action::done());
        assert!(harness.fetch::<Experiment>("default", "delay").is_none());
    }

    #[test]
    fn action_limit_defaults_to_controller_config() {
        let harness = Harness::with_pods(&[]);
        let reconciler = ExperimentReconciler::new(
            harness.dyn_client(),
            ChaosRegistry::new(),
            Arc::new(TargetSelector::new(harness.dyn_client(), ControllerConfig::default())),
            harness.recorder.clone(),
        );
        assert_eq!(
            reconciler.permits.available_permits(),
            ControllerConfig::default().max_concurrent_actions
        );
        let limited = reconciler.with_max_concurrent_actions(0);
        assert_eq!(limited.permits.available_permits(), 1);
    }
}
