use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use havoc_core::events::EventReason;
use havoc_core::experiment::{DurationState, Experiment};
use havoc_core::state::DesiredPhase;
use havoc_core::types::{ObjectKey, ObjectKind};

use crate::client::{Client, ClientExt};
use crate::error::ReconcileError;
use crate::manager::{Action, Reconciler};
use crate::recorder::EventRecorder;
use crate::retry::{retry_on_conflict, Backoff};

/// Derives `status.desired_phase` from the pause annotation, the deletion
/// mark and the experiment duration, and removes deleted experiments once
/// every record is recovered.
pub struct DesiredPhaseReconciler {
    client: Arc<dyn Client>,
    recorder: EventRecorder,
    backoff: Backoff,
}

impl DesiredPhaseReconciler {
    pub fn new(client: Arc<dyn Client>, recorder: EventRecorder) -> Self {
        Self {
            client,
            recorder,
            backoff: Backoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub async fn reconcile_at(
        &self,
        key: &ObjectKey,
        now: DateTime<Utc>,
    ) -> Result<Action, ReconcileError> {
        let Some(experiment) = self.client.get::<Experiment>(key)? else {
            return Ok(Action::done());
        };

        let (desired, action) = desired_phase(&experiment, now)?;
        if experiment.status.desired_phase != desired {
            let changed = retry_on_conflict(self.backoff, || {
                let Some(mut latest) = self.client.get::<Experiment>(key)? else {
                    return Ok(false);
                };
                if latest.status.desired_phase == desired {
                    return Ok(false);
                }
                latest.status.desired_phase = desired;
                self.client.update(&mut latest)?;
                Ok(true)
            })
            .await?;
            if changed {
                info!(experiment = %key, desired = desired.as_str(), "desired phase changed");
                self.recorder.normal(
                    &experiment,
                    EventReason::DesiredPhaseChanged,
                    format!(
                        "desired phase {} -> {}",
                        experiment.status.desired_phase.as_str(),
                        desired.as_str()
                    ),
                );
            }
            return Ok(action);
        }

        if experiment.metadata.is_deleted() && experiment.is_finished() {
            debug!(experiment = %key, "all records recovered, removing deleted experiment");
            self.client.delete::<Experiment>(key)?;
            return Ok(Action::done());
        }
        Ok(action)
    }
}

/// The phase an experiment should be in at `now`, plus when to look again.
pub fn desired_phase(
    experiment: &Experiment,
    now: DateTime<Utc>,
) -> Result<(DesiredPhase, Action), ReconcileError> {
    if experiment.metadata.is_deleted() || experiment.is_paused() {
        return Ok((DesiredPhase::Stopped, Action::done()));
    }
    Ok(match experiment.duration_state(now)? {
        DurationState::Unbounded => (DesiredPhase::Running, Action::done()),
        DurationState::Remaining(left) => (DesiredPhase::Running, Action::requeue_after(left)),
        DurationState::Exceeded => (DesiredPhase::Stopped, Action::done()),
    })
}

#[async_trait]
impl Reconciler for DesiredPhaseReconciler {
    fn name(&self) -> &'static str {
        "desired-phase"
    }

    fn kind(&self) -> ObjectKind {
        ObjectKind::Experiment
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        self.reconcile_at(key, Utc::now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{experiment_with_pods, fast_backoff, Harness};
    use chrono::Duration as ChronoDuration;
    use std::time::Duration;

    fn reconciler(harness: &Harness) -> DesiredPhaseReconciler {
        DesiredPhaseReconciler::new(harness.dyn_client(), harness.recorder.clone())
            .with_backoff(fast_backoff())
    }

    fn with_duration(mut experiment: Experiment, duration: &str) -> Experiment {
        experiment.spec.duration = Some(duration.to_string());
        experiment
    }

    fn key() -> ObjectKey {
        ObjectKey::new("default", "delay")
    }

    #[tokio::test]
    async fn running_until_duration_elapses() {
        let harness = Harness::with_pods(&["web-0"]);
        let experiment = harness.create(with_duration(experiment_with_pods("delay", &["web-0"]), "10s"));
        let created = experiment.metadata.creation_timestamp;
        let reconciler = reconciler(&harness);

        let action = reconciler
            .reconcile_at(&key(), created + ChronoDuration::seconds(4))
            .await
            .expect("reconcile");
        assert_eq!(action, Action::requeue_after(Duration::from_secs(6)));
        assert_eq!(
            harness.experiment("delay").status.desired_phase,
            DesiredPhase::Running
        );

        reconciler
            .reconcile_at(&key(), created + ChronoDuration::seconds(10))
            .await
            .expect("reconcile after expiry");
        assert_eq!(
            harness.experiment("delay").status.desired_phase,
            DesiredPhase::Stopped
        );
    }

    #[tokio::test]
    async fn paused_experiment_is_stopped() {
        let harness = Harness::with_pods(&["web-0"]);
        let mut experiment = experiment_with_pods("delay", &["web-0"]);
        experiment.set_paused(true);
        harness.create(experiment);

        reconciler(&harness)
            .reconcile(&key())
            .await
            .expect("reconcile");
        let stored = harness.experiment("delay");
        assert_eq!(stored.status.desired_phase, DesiredPhase::Stopped);

        let events = harness.client.list_events(Some(&key())).expect("events");
        assert!(events
            .iter()
            .any(|event| event.reason == EventReason::DesiredPhaseChanged));
    }

    #[tokio::test]
    async fn malformed_duration_is_an_error() {
        let harness = Harness::with_pods(&[]);
        harness.create(with_duration(
            experiment_with_pods("delay", &["web-0"]),
            "ten minutes",
        ));
        let err = reconciler(&harness)
            .reconcile(&key())
            .await
            .expect_err("bad duration");
        assert!(matches!(err, ReconcileError::Duration(_)));
    }

    #[tokio::test]
    async fn deleted_experiment_is_removed_once_recovered() {
        let harness = Harness::with_pods(&["web-0"]);
        harness.create(experiment_with_pods("delay", &["web-0"]));
        harness
            .experiments
            .reconcile(&key())
            .await
            .expect("inject");

        let mut experiment = harness.experiment("delay");
        experiment.metadata.deletion_timestamp = Some(Utc::now());
        harness.client.update(&mut experiment).expect("mark deleted");

        let desired = reconciler(&harness);
        desired.reconcile(&key()).await.expect("stop");
        assert!(harness.fetch::<Experiment>("default", "delay").is_some());

        harness
            .experiments
            .reconcile(&key())
            .await
            .expect("recover");
        desired.reconcile(&key()).await.expect("finalize");
        assert!(harness.fetch::<Experiment>("default", "delay").is_none());
        assert_eq!(harness.executor.active_count().await, 0);
    }
}
