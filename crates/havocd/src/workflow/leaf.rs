//! Suspend, chaos and task nodes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use havoc_core::duration::parse_duration;
use havoc_core::events::EventReason;
use havoc_core::experiment::Experiment;
use havoc_core::state::ConditionStatus;
use havoc_core::types::{ObjectKey, ObjectKind, Pod, PodPhase};
use havoc_core::workflow::{
    set_condition, Condition, ConditionType, NodeType, WorkflowError, WorkflowNode,
    WORKFLOW_LABEL, WORKFLOW_NODE_LABEL,
};

use crate::client::{Client, ClientExt, ObjectChange, StoreError};
use crate::error::ReconcileError;
use crate::manager::{labeled_owner, Action, Reconciler};
use crate::recorder::EventRecorder;
use crate::retry::{retry_on_conflict, Backoff};
use crate::workflow::{deadline_remaining, exceed_deadline, fail_node, update_node};

/// Drives leaf nodes to completion:
///
/// - a suspend node is accomplished once its duration has elapsed;
/// - a chaos node creates its experiment and is accomplished once every
///   record is injected and the node's duration has elapsed, after which
///   the experiment is marked deleted so its faults are recovered;
/// - a task node creates a pod and follows its phase.
pub struct LeafNodeReconciler {
    client: Arc<dyn Client>,
    recorder: EventRecorder,
    backoff: Backoff,
}

impl LeafNodeReconciler {
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
        let Some(node) = self.client.get::<WorkflowNode>(key)? else {
            return Ok(Action::done());
        };
        if node.node_type().is_composite()
            || node.metadata.is_deleted()
            || node.status.error.is_some()
        {
            return Ok(Action::done());
        }

        if node.is_finished() {
            self.retire_experiment(&node, now).await?;
            return Ok(Action::done());
        }
        if node.deadline_passed(now) {
            info!(node = %key, "node deadline exceeded");
            exceed_deadline(
                self.client.as_ref(),
                &self.recorder,
                self.backoff,
                key,
                "deadline exceeded",
            )
            .await?;
            self.retire_experiment(&node, now).await?;
            return Ok(Action::done());
        }

        let action = match node.node_type() {
            NodeType::Suspend => self.suspend(&node, now).await?,
            NodeType::Chaos => self.chaos(&node, now).await?,
            NodeType::Task => self.task(&node).await?,
            NodeType::Serial | NodeType::Parallel => Action::done(),
        };
        Ok(match deadline_remaining(&node, now) {
            Some(left) => action.merge(Action::requeue_after(left)),
            None => action,
        })
    }

    async fn suspend(&self, node: &WorkflowNode, now: DateTime<Utc>) -> Result<Action, ReconcileError> {
        match hold_remaining(node, now)? {
            Some(left) => {
                self.set_accomplished(node, false).await?;
                Ok(Action::requeue_after(left))
            }
            None => {
                self.set_accomplished(node, true).await?;
                Ok(Action::done())
            }
        }
    }

    async fn chaos(&self, node: &WorkflowNode, now: DateTime<Utc>) -> Result<Action, ReconcileError> {
        let Some(experiment_key) = node.status.chaos_ref.clone() else {
            self.create_experiment(node).await?;
            return Ok(Action::done());
        };

        let Some(experiment) = self.client.get::<Experiment>(&experiment_key)? else {
            self.fail(node, format!("experiment {experiment_key} disappeared"))
                .await?;
            return Ok(Action::done());
        };
        if !experiment.all_injected() {
            debug!(node = %node.metadata.key(), experiment = %experiment_key, "waiting for injection");
            return Ok(Action::done());
        }

        match hold_remaining(node, now)? {
            Some(left) => Ok(Action::requeue_after(left)),
            None => {
                self.set_accomplished(node, true).await?;
                self.retire_experiment(node, now).await?;
                Ok(Action::done())
            }
        }
    }

    async fn create_experiment(&self, node: &WorkflowNode) -> Result<(), ReconcileError> {
        let mut spec = node
            .spec
            .chaos
            .clone()
            .ok_or_else(|| missing_section(node, "chaos"))?;
        // The node's own duration decides when the faults end.
        spec.duration = None;

        let mut experiment = Experiment::new(
            node.metadata.namespace.clone(),
            node.metadata.name.clone(),
            spec,
        );
        experiment.metadata = experiment
            .metadata
            .with_label(WORKFLOW_LABEL, node.spec.workflow_name.clone())
            .with_label(WORKFLOW_NODE_LABEL, node.metadata.name.clone());
        let experiment_key = experiment.metadata.key();

        match self.client.create(&mut experiment) {
            Ok(()) => {
                info!(node = %node.metadata.key(), experiment = %experiment_key, "created experiment");
                self.recorder.normal(
                    node,
                    EventReason::NodesCreated,
                    format!("created experiment {experiment_key}"),
                );
            }
            Err(StoreError::AlreadyExists { .. }) => {
                debug!(node = %node.metadata.key(), experiment = %experiment_key, "adopting existing experiment");
            }
            Err(err) => return Err(err.into()),
        }

        update_node(self.client.as_ref(), self.backoff, &node.metadata.key(), |latest| {
            let mut changed = latest.status.chaos_ref.is_none();
            latest.status.chaos_ref = Some(experiment_key.clone());
            changed |= set_condition(
                &mut latest.status.conditions,
                Condition::new(ConditionType::Accomplished, ConditionStatus::False, ""),
            );
            Ok(changed)
        })
        .await?;
        Ok(())
    }

    /// Mark the node's experiment deleted so it recovers and goes away.
    async fn retire_experiment(&self, node: &WorkflowNode, now: DateTime<Utc>) -> Result<(), StoreError> {
        let Some(experiment_key) = &node.status.chaos_ref else {
            return Ok(());
        };
        let retired = retry_on_conflict(self.backoff, || {
            let Some(mut experiment) = self.client.get::<Experiment>(experiment_key)? else {
                return Ok(false);
            };
            if experiment.metadata.is_deleted() {
                return Ok(false);
            }
            experiment.metadata.deletion_timestamp = Some(now);
            self.client.update(&mut experiment)?;
            Ok(true)
        })
        .await?;
        if retired {
            info!(node = %node.metadata.key(), experiment = %experiment_key, "experiment retired");
        }
        Ok(())
    }

    async fn task(&self, node: &WorkflowNode) -> Result<Action, ReconcileError> {
        let Some(pod_name) = node.status.task_pod.clone() else {
            self.create_task_pod(node).await?;
            return Ok(Action::done());
        };

        let pod_key = ObjectKey::new(node.metadata.namespace.clone(), pod_name);
        let Some(pod) = self.client.get::<Pod>(&pod_key)? else {
            self.fail(node, format!("task pod {pod_key} is missing")).await?;
            return Ok(Action::done());
        };
        match pod.phase {
            PodPhase::Succeeded => self.set_accomplished(node, true).await?,
            PodPhase::Failed => {
                self.fail(node, format!("task pod {pod_key} failed")).await?;
            }
            phase => debug!(node = %node.metadata.key(), pod = %pod_key, phase = phase.as_str(), "task still running"),
        }
        Ok(Action::done())
    }

    async fn create_task_pod(&self, node: &WorkflowNode) -> Result<(), ReconcileError> {
        let task = node
            .spec
            .task
            .clone()
            .ok_or_else(|| missing_section(node, "task"))?;

        let mut pod = Pod::new(node.metadata.namespace.clone(), node.metadata.name.clone());
        pod.phase = PodPhase::Pending;
        pod.containers = vec![task.container];
        pod.metadata = pod
            .metadata
            .with_label(WORKFLOW_LABEL, node.spec.workflow_name.clone())
            .with_label(WORKFLOW_NODE_LABEL, node.metadata.name.clone());
        let pod_name = pod.metadata.name.clone();

        match self.client.create(&mut pod) {
            Ok(()) => {
                info!(node = %node.metadata.key(), pod = %pod_name, "created task pod");
                self.recorder.normal(
                    node,
                    EventReason::NodesCreated,
                    format!("created task pod {pod_name}"),
                );
            }
            Err(StoreError::AlreadyExists { .. }) => {
                debug!(node = %node.metadata.key(), pod = %pod_name, "adopting existing task pod");
            }
            Err(err) => return Err(err.into()),
        }

        update_node(self.client.as_ref(), self.backoff, &node.metadata.key(), |latest| {
            let mut changed = latest.status.task_pod.is_none();
            latest.status.task_pod = Some(pod_name.clone());
            changed |= set_condition(
                &mut latest.status.conditions,
                Condition::new(ConditionType::Accomplished, ConditionStatus::False, ""),
            );
            Ok(changed)
        })
        .await?;
        Ok(())
    }

    async fn set_accomplished(&self, node: &WorkflowNode, done: bool) -> Result<(), StoreError> {
        let mut became_done = false;
        let updated = update_node(self.client.as_ref(), self.backoff, &node.metadata.key(), |latest| {
            let was_done = latest.is_accomplished();
            let changed = set_condition(
                &mut latest.status.conditions,
                Condition::new(ConditionType::Accomplished, ConditionStatus::from(done), ""),
            );
            became_done = done && !was_done;
            Ok(changed)
        })
        .await?;
        if let (true, Some(updated)) = (became_done, updated) {
            info!(node = %updated.metadata.key(), node_type = %updated.node_type(), "node accomplished");
            self.recorder.normal(
                &updated,
                EventReason::NodeAccomplished,
                format!("{} node finished", updated.node_type()),
            );
        }
        Ok(())
    }

    async fn fail(&self, node: &WorkflowNode, message: String) -> Result<(), StoreError> {
        if fail_node(self.client.as_ref(), self.backoff, &node.metadata.key(), message.clone()).await? {
            warn!(node = %node.metadata.key(), error = %message, "node failed");
            self.recorder.warning(node, EventReason::NodeFailed, message);
        }
        Ok(())
    }
}

/// How long the node still has to hold, measured from its creation. `None`
/// once the duration has elapsed; nodes without a duration never hold.
fn hold_remaining(node: &WorkflowNode, now: DateTime<Utc>) -> Result<Option<Duration>, ReconcileError> {
    let Some(raw) = &node.spec.duration else {
        return Ok(None);
    };
    let duration = parse_duration(raw)?;
    let elapsed = (now - node.metadata.creation_timestamp)
        .to_std()
        .unwrap_or(Duration::ZERO);
    Ok((elapsed < duration).then(|| duration - elapsed))
}

fn missing_section(node: &WorkflowNode, field: &'static str) -> WorkflowError {
    WorkflowError::MissingSection {
        template: node.spec.template_name.clone(),
        node_type: node.node_type().as_str(),
        field,
    }
}

#[async_trait]
impl Reconciler for LeafNodeReconciler {
    fn name(&self) -> &'static str {
        "leaf-node"
    }

    fn kind(&self) -> ObjectKind {
        ObjectKind::WorkflowNode
    }

    fn map_change(&self, change: &ObjectChange) -> Vec<ObjectKey> {
        match change.kind {
            ObjectKind::WorkflowNode => vec![change.key.clone()],
            ObjectKind::Experiment | ObjectKind::Pod => {
                labeled_owner(change, WORKFLOW_NODE_LABEL).into_iter().collect()
            }
            _ => Vec::new(),
        }
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        self.reconcile_at(key, Utc::now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{experiment_with_pods, fast_backoff, Harness};
    use crate::workflow::render::render_node;
    use chrono::Duration as ChronoDuration;
    use havoc_core::state::{DesiredPhase, NodePhase};
    use havoc_core::types::Container;
    use havoc_core::workflow::{Template, TaskSpec, Workflow, WorkflowSpec};

    fn workflow() -> Workflow {
        let mut chaos = Template::new("delay", NodeType::Chaos).with_duration("10s");
        chaos.chaos = Some(experiment_with_pods("template", &["web-0"]).spec);
        let mut task = Template::new("check", NodeType::Task);
        task.task = Some(TaskSpec {
            container: Container {
                image: Some("busybox".to_string()),
                command: vec!["true".to_string()],
                ..Container::new("check")
            },
        });
        let mut bounded = Template::new("bounded", NodeType::Suspend).with_duration("1h");
        bounded.deadline = Some("5s".to_string());
        Workflow::new(
            "default",
            "wf",
            WorkflowSpec {
                entry: "wait".to_string(),
                templates: vec![
                    Template::new("wait", NodeType::Suspend).with_duration("2s"),
                    chaos,
                    task,
                    bounded,
                ],
            },
        )
    }

    fn setup(template: &str) -> (Harness, LeafNodeReconciler, WorkflowNode) {
        let harness = Harness::with_pods(&["web-0"]);
        let workflow = harness.create(workflow());
        let node = harness.create(render_node(&workflow, None, template, Utc::now()).expect("render node"));
        let reconciler =
            LeafNodeReconciler::new(harness.dyn_client(), harness.recorder.clone()).with_backoff(fast_backoff());
        (harness, reconciler, node)
    }

    fn reload(harness: &Harness, node: &WorkflowNode) -> WorkflowNode {
        harness
            .fetch::<WorkflowNode>("default", &node.metadata.name)
            .expect("node exists")
    }

    #[tokio::test]
    async fn suspend_holds_until_duration_elapses() {
        let (harness, reconciler, node) = setup("wait");
        let created = node.metadata.creation_timestamp;

        let action = reconciler
            .reconcile_at(&node.metadata.key(), created + ChronoDuration::milliseconds(500))
            .await
            .expect("reconcile");
        assert_eq!(action, Action::requeue_after(Duration::from_millis(1500)));
        assert_eq!(reload(&harness, &node).status.phase, NodePhase::Holding);

        reconciler
            .reconcile_at(&node.metadata.key(), created + ChronoDuration::seconds(2))
            .await
            .expect("reconcile after duration");
        let node = reload(&harness, &node);
        assert!(node.is_accomplished());
        assert_eq!(node.status.phase, NodePhase::Succeed);
    }

    #[tokio::test]
    async fn chaos_node_injects_then_retires_experiment() {
        let (harness, reconciler, node) = setup("delay");
        let key = node.metadata.key();
        let created = node.metadata.creation_timestamp;

        reconciler.reconcile_at(&key, created).await.expect("create experiment");
        let experiment = harness.experiment(&node.metadata.name);
        assert_eq!(
            experiment.metadata.labels.get(WORKFLOW_NODE_LABEL),
            Some(&node.metadata.name)
        );
        assert_eq!(experiment.spec.duration, None);
        assert_eq!(
            reload(&harness, &node).status.chaos_ref,
            Some(experiment.metadata.key())
        );

        reconciler
            .reconcile_at(&key, created + ChronoDuration::seconds(1))
            .await
            .expect("waiting for injection");
        assert!(!reload(&harness, &node).is_accomplished());

        harness
            .experiments
            .reconcile(&experiment.metadata.key())
            .await
            .expect("inject");
        assert!(harness.experiment(&node.metadata.name).all_injected());

        let action = reconciler
            .reconcile_at(&key, created + ChronoDuration::seconds(4))
            .await
            .expect("holding");
        assert_eq!(action, Action::requeue_after(Duration::from_secs(6)));

        reconciler
            .reconcile_at(&key, created + ChronoDuration::seconds(10))
            .await
            .expect("accomplish");
        assert!(reload(&harness, &node).is_accomplished());
        let experiment = harness.experiment(&node.metadata.name);
        assert!(experiment.metadata.is_deleted());
        assert_eq!(experiment.status.desired_phase, DesiredPhase::Running);
    }

    #[tokio::test]
    async fn task_node_follows_pod_phase() {
        let (harness, reconciler, node) = setup("check");
        let key = node.metadata.key();
        reconciler.reconcile(&key).await.expect("create pod");

        let mut pod: Pod = harness
            .fetch("default", &node.metadata.name)
            .expect("task pod");
        assert_eq!(pod.phase, PodPhase::Pending);
        assert_eq!(pod.containers[0].name, "check");
        assert_eq!(reload(&harness, &node).status.phase, NodePhase::WaitingForChild);

        reconciler.reconcile(&key).await.expect("pod pending");
        assert!(!reload(&harness, &node).is_accomplished());

        pod.phase = PodPhase::Succeeded;
        harness.client.update(&mut pod).expect("pod succeeded");
        reconciler.reconcile(&key).await.expect("pod done");
        assert!(reload(&harness, &node).is_accomplished());
    }

    #[tokio::test]
    async fn failed_task_pod_fails_the_node() {
        let (harness, reconciler, node) = setup("check");
        let key = node.metadata.key();
        reconciler.reconcile(&key).await.expect("create pod");

        let mut pod: Pod = harness
            .fetch("default", &node.metadata.name)
            .expect("task pod");
        pod.phase = PodPhase::Failed;
        harness.client.update(&mut pod).expect("pod failed");
        reconciler.reconcile(&key).await.expect("observe failure");

        let node = reload(&harness, &node);
        assert_eq!(node.status.phase, NodePhase::Failed);
        assert!(node
            .status
            .error
            .as_deref()
            .is_some_and(|error| error.ends_with("failed")));
    }

    #[tokio::test]
    async fn deadline_ends_a_long_suspend() {
        let (harness, reconciler, node) = setup("bounded");
        let key = node.metadata.key();
        let created = node.metadata.creation_timestamp;

        let action = reconciler.reconcile_at(&key, created).await.expect("reconcile");
        assert_eq!(action, Action::requeue_after(Duration::from_secs(5)));

        reconciler
            .reconcile_at(&key, created + ChronoDuration::seconds(6))
            .await
            .expect("past deadline");
        let node = reload(&harness, &node);
        assert!(node.is_deadline_exceeded());
        assert!(!node.is_accomplished());
        assert_eq!(node.status.phase, NodePhase::Succeed);
    }

    #[test]
    fn owned_objects_map_to_their_node() {
        let harness = Harness::with_pods(&[]);
        let reconciler = LeafNodeReconciler::new(harness.dyn_client(), harness.recorder.clone());
        let change = ObjectChange {
            kind: ObjectKind::Pod,
            key: ObjectKey::new("default", "check-01"),
            labels: std::collections::BTreeMap::from([(
                WORKFLOW_NODE_LABEL.to_string(),
                "check-01".to_string(),
            )]),
            change: crate::client::ChangeType::Updated,
        };
        assert_eq!(
            reconciler.map_change(&change),
            vec![ObjectKey::new("default", "check-01")]
        );
    }
}
