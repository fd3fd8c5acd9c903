use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, error, info};

use havoc_core::events::EventReason;
use havoc_core::state::ConditionStatus;
use havoc_core::types::{ObjectKey, ObjectKind};
use havoc_core::workflow::{
    set_condition, Condition, ConditionType, NodeType, Workflow, WorkflowNode,
};

use crate::client::{Client, ClientExt, ObjectChange, StoreError};
use crate::error::ReconcileError;
use crate::manager::{labeled_owner, Action, Reconciler};
use crate::recorder::EventRecorder;
use crate::retry::Backoff;
use crate::workflow::children::{parallel_diff, serial_diff, Children, ChildrenDiff, ChildrenFetcher};
use crate::workflow::render::{render_nodes, PARENT_NODE_LABEL};
use crate::workflow::{
    deadline_remaining, delete_node_tree, exceed_deadline, fail_node, update_node,
};

/// Reconciles serial or parallel nodes: spawns and retires children to match
/// the declared task list and marks the node accomplished once every task
/// has a finished child.
pub struct CompositeNodeReconciler {
    client: Arc<dyn Client>,
    fetcher: ChildrenFetcher,
    recorder: EventRecorder,
    backoff: Backoff,
    node_type: NodeType,
}

impl CompositeNodeReconciler {
    pub fn serial(client: Arc<dyn Client>, recorder: EventRecorder) -> Self {
        Self::new(client, recorder, NodeType::Serial)
    }

    pub fn parallel(client: Arc<dyn Client>, recorder: EventRecorder) -> Self {
        Self::new(client, recorder, NodeType::Parallel)
    }

    fn new(client: Arc<dyn Client>, recorder: EventRecorder, node_type: NodeType) -> Self {
        Self {
            fetcher: ChildrenFetcher::new(client.clone()),
            client,
            recorder,
            backoff: Backoff::default(),
            node_type,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    fn diff(&self, node: &WorkflowNode, children: &Children) -> ChildrenDiff {
        match self.node_type {
            NodeType::Serial => serial_diff(
                &node.spec.tasks,
                &children.active_tasks(),
                &children.finished_tasks(),
            ),
            _ => parallel_diff(&node.spec.tasks, &children.existing_tasks()),
        }
    }

    pub async fn reconcile_at(
        &self,
        key: &ObjectKey,
        now: DateTime<Utc>,
    ) -> Result<Action, ReconcileError> {
        let Some(node) = self.client.get::<WorkflowNode>(key)? else {
            return Ok(Action::done());
        };
        if node.node_type() != self.node_type || node.metadata.is_deleted() {
            return Ok(Action::done());
        }

        if node.is_deadline_exceeded() {
            self.propagate_deadline(&node).await?;
            return Ok(Action::done());
        }
        if !node.is_accomplished() && node.deadline_passed(now) {
            info!(node = %key, "node deadline exceeded");
            exceed_deadline(
                self.client.as_ref(),
                &self.recorder,
                self.backoff,
                key,
                "deadline exceeded",
            )
            .await?;
            if let Some(node) = self.client.get::<WorkflowNode>(key)? {
                self.propagate_deadline(&node).await?;
            }
            return Ok(Action::done());
        }

        let children = self.fetcher.fetch(&node)?;
        if let Some(failed) = children.failed() {
            let message = format!(
                "child {} failed: {}",
                failed.metadata.name,
                failed.status.error.as_deref().unwrap_or_default()
            );
            if fail_node(self.client.as_ref(), self.backoff, key, message.clone()).await? {
                error!(node = %key, child = %failed.metadata.name, "child node failed");
                self.recorder.warning(&node, EventReason::NodeFailed, message);
            }
            return Ok(Action::done());
        }

        self.sync_children(&node, &children, now)?;
        self.sync_status(key).await?;

        Ok(match deadline_remaining(&node, now) {
            Some(left) if !node.is_accomplished() => Action::requeue_after(left),
            _ => Action::done(),
        })
    }

    fn sync_children(
        &self,
        node: &WorkflowNode,
        children: &Children,
        now: DateTime<Utc>,
    ) -> Result<(), ReconcileError> {
        if node.spec.tasks.is_empty() {
            debug!(node = %node.metadata.key(), "node declares no tasks");
            return Ok(());
        }

        let diff = self.diff(node, children);
        if diff.delete_all {
            let mut deleted = Vec::new();
            for child in children.all() {
                deleted.extend(delete_node_tree(self.client.as_ref(), child, now)?);
            }
            if !deleted.is_empty() {
                info!(node = %node.metadata.key(), children = ?deleted, "task list redefined, children removed");
                self.recorder.normal(
                    node,
                    EventReason::NodesDeleted,
                    format!("deleted children: {}", deleted.join(", ")),
                );
            }
        }

        if diff.to_start.is_empty() {
            debug!(node = %node.metadata.key(), "no child node to spawn");
            return Ok(());
        }

        let workflow_key = ObjectKey::new(
            node.metadata.namespace.clone(),
            node.spec.workflow_name.clone(),
        );
        let workflow = self
            .client
            .get::<Workflow>(&workflow_key)?
            .ok_or_else(|| StoreError::NotFound {
                kind: ObjectKind::Workflow,
                key: workflow_key.clone(),
            })?;

        let mut created = Vec::new();
        for mut child in render_nodes(&workflow, Some(node), &diff.to_start, now)? {
            if let Err(err) = self.client.create(&mut child) {
                error!(node = %node.metadata.key(), child = %child.metadata.name, error = %err, "failed to create child node");
                return Err(err.into());
            }
            created.push(child.metadata.name);
        }
        info!(node = %node.metadata.key(), children = ?created, "spawned child nodes");
        self.recorder.normal(
            node,
            EventReason::NodesCreated,
            format!("created children: {}", created.join(", ")),
        );
        Ok(())
    }

    async fn sync_status(&self, key: &ObjectKey) -> Result<(), ReconcileError> {
        let mut accomplished_now = false;
        let updated = update_node(self.client.as_ref(), self.backoff, key, |node| {
            let children = self.fetcher.fetch(node)?;
            let was_accomplished = node.is_accomplished();
            let before = node.status.clone();

            node.status.active_children = children.active_names();
            node.status.finished_children = children.finished_names();
            let done = children.finished.len() == node.spec.tasks.len();
            set_condition(
                &mut node.status.conditions,
                Condition::new(ConditionType::Accomplished, ConditionStatus::from(done), ""),
            );
            accomplished_now = done && !was_accomplished;
            Ok(node.status != before)
        })
        .await?;

        if let (true, Some(node)) = (accomplished_now, updated) {
            info!(node = %key, "node accomplished");
            self.recorder.normal(
                &node,
                EventReason::NodeAccomplished,
                format!("all {} tasks finished", node.spec.tasks.len()),
            );
        }
        Ok(())
    }

    /// Cut every running child short once this node ran out of time.
    async fn propagate_deadline(&self, node: &WorkflowNode) -> Result<(), ReconcileError> {
        let children = self.fetcher.fetch(node)?;
        for child in &children.active {
            exceed_deadline(
                self.client.as_ref(),
                &self.recorder,
                self.backoff,
                &child.metadata.key(),
                "parent deadline exceeded",
            )
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Reconciler for CompositeNodeReconciler {
    fn name(&self) -> &'static str {
        match self.node_type {
            NodeType::Serial => "serial-node",
            _ => "parallel-node",
        }
    }

    fn kind(&self) -> ObjectKind {
        ObjectKind::WorkflowNode
    }

    fn map_change(&self, change: &ObjectChange) -> Vec<ObjectKey> {
        if change.kind != ObjectKind::WorkflowNode {
            return Vec::new();
        }
        let mut keys = vec![change.key.clone()];
        keys.extend(labeled_owner(change, PARENT_NODE_LABEL));
        keys
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        self.reconcile_at(key, Utc::now()).await
    }
}
