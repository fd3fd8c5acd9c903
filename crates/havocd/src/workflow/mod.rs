//! Workflow engine: the entry reconciler expands a workflow into its root
//! node, composite reconcilers grow the tree one level at a time, and leaf
//! reconcilers drive suspend, chaos and task nodes to completion.

pub mod children;
pub mod composite;
pub mod entry;
pub mod leaf;
pub mod render;
pub mod repository;

pub use children::{parallel_diff, serial_diff, Children, ChildrenDiff, ChildrenFetcher};
pub use composite::CompositeNodeReconciler;
pub use entry::WorkflowEntryReconciler;
pub use leaf::LeafNodeReconciler;
pub use render::{render_node, render_nodes, PARENT_NODE_LABEL};
pub use repository::{
    NodeState, RepositoryError, Topology, TopologyNode, WorkflowDetail, WorkflowRepository,
    WorkflowState, WorkflowSummary,
};

use std::time::Duration;

use chrono::{DateTime, Utc};

use havoc_core::events::EventReason;
use havoc_core::experiment::Experiment;
use havoc_core::state::ConditionStatus;
use havoc_core::types::{ObjectKey, Pod};
use havoc_core::workflow::{
    set_condition, Condition, ConditionType, WorkflowNode, WORKFLOW_NODE_LABEL,
};

use crate::client::{Client, ClientExt, StoreError};
use crate::recorder::EventRecorder;
use crate::retry::{retry_on_conflict, Backoff};

/// Read-modify-write one node under conflict retry. `mutate` reports whether
/// it changed anything; the stored phase is re-inferred on every write and
/// unchanged nodes are not written. Returns the latest node, or `None` once
/// it is gone.
pub(crate) async fn update_node<F>(
    client: &dyn Client,
    backoff: Backoff,
    key: &ObjectKey,
    mut mutate: F,
) -> Result<Option<WorkflowNode>, StoreError>
where
    F: FnMut(&mut WorkflowNode) -> Result<bool, StoreError>,
{
    retry_on_conflict(backoff, || {
        let Some(mut node) = client.get::<WorkflowNode>(key)? else {
            return Ok(None);
        };
        let changed = mutate(&mut node)?;
        let phase = node.infer_phase();
        if changed || node.status.phase != phase {
            node.status.phase = phase;
            client.update(&mut node)?;
        }
        Ok(Some(node))
    })
    .await
}

/// Time left before the node's deadline; zero once it has passed.
pub(crate) fn deadline_remaining(node: &WorkflowNode, now: DateTime<Utc>) -> Option<Duration> {
    node.spec
        .deadline
        .map(|deadline| (deadline - now).to_std().unwrap_or(Duration::ZERO))
}

/// Set `DeadlineExceeded=True` on a node that has not finished yet.
pub(crate) async fn exceed_deadline(
    client: &dyn Client,
    recorder: &EventRecorder,
    backoff: Backoff,
    key: &ObjectKey,
    reason: &str,
) -> Result<(), StoreError> {
    let mut changed = false;
    let node = update_node(client, backoff, key, |node| {
        changed = !node.is_finished()
            && set_condition(
                &mut node.status.conditions,
                Condition::new(ConditionType::DeadlineExceeded, ConditionStatus::True, reason),
            );
        Ok(changed)
    })
    .await?;
    if let (true, Some(node)) = (changed, node) {
        recorder.normal(&node, EventReason::DeadlineExceeded, reason.to_string());
    }
    Ok(())
}

/// Record a terminal error on a node. Returns whether it was newly set.
pub(crate) async fn fail_node(
    client: &dyn Client,
    backoff: Backoff,
    key: &ObjectKey,
    message: String,
) -> Result<bool, StoreError> {
    let mut changed = false;
    update_node(client, backoff, key, |node| {
        changed = node.status.error.as_deref() != Some(message.as_str());
        if changed {
            node.status.error = Some(message.clone());
        }
        Ok(changed)
    })
    .await?;
    Ok(changed)
}

/// Delete `node` and every node below it, children first. Experiments the
/// removed nodes own are only marked deleted so their faults get recovered;
/// task pods are deleted outright. Returns the names of the deleted nodes.
pub(crate) fn delete_node_tree(
    client: &dyn Client,
    node: &WorkflowNode,
    now: DateTime<Utc>,
) -> Result<Vec<String>, StoreError> {
    let namespace = &node.metadata.namespace;
    let name = &node.metadata.name;
    let mut deleted = Vec::new();

    for child in client.list_labeled::<WorkflowNode>(namespace, PARENT_NODE_LABEL, name)? {
        deleted.extend(delete_node_tree(client, &child, now)?);
    }

    for mut experiment in client.list_labeled::<Experiment>(namespace, WORKFLOW_NODE_LABEL, name)? {
        if experiment.metadata.is_deleted() {
            continue;
        }
        experiment.metadata.deletion_timestamp = Some(now);
        client.update(&mut experiment)?;
    }
    for pod in client.list_labeled::<Pod>(namespace, WORKFLOW_NODE_LABEL, name)? {
        client.delete::<Pod>(&pod.metadata.key())?;
    }

    if client.delete::<WorkflowNode>(&node.metadata.key())? {
        deleted.push(name.clone());
    }
    Ok(deleted)
}
