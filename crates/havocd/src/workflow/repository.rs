//! Read-optimized view of workflows and their node trees, plus the CRUD
//! calls the CLI uses.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use havoc_core::state::ConditionStatus;
use havoc_core::types::ObjectKey;
use havoc_core::validation::{has_errors, Validate, ValidationIssue};
use havoc_core::workflow::{
    ConditionType, NodeType, Workflow, WorkflowNode, WORKFLOW_LABEL,
};

use crate::client::{Client, ClientExt, StoreError};
use crate::workflow::delete_node_tree;

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("workflow {key} not found")]
    NotFound { key: ObjectKey },
    #[error("workflow {key} is invalid: {}", summarize(.issues))]
    Invalid {
        key: ObjectKey,
        issues: Vec<ValidationIssue>,
    },
}

fn summarize(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(|issue| format!("{} ({})", issue.message, issue.code))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkflowState {
    Running,
    Succeed,
    Failed,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NodeState {
    Running,
    Succeed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowSummary {
    pub namespace: String,
    pub name: String,
    pub entry: String,
    pub created: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: WorkflowState,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopologyNode {
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub state: NodeState,
    pub template: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Declared tasks of serial and parallel nodes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tasks: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct Topology {
    pub nodes: Vec<TopologyNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowDetail {
    #[serde(flatten)]
    pub summary: WorkflowSummary,
    pub topology: Topology,
}

#[derive(Clone)]
pub struct WorkflowRepository {
    client: Arc<dyn Client>,
}

impl WorkflowRepository {
    pub fn new(client: Arc<dyn Client>) -> Self {
        Self { client }
    }

    /// Every workflow, or those in one namespace.
    pub fn list(&self, namespace: Option<&str>) -> Result<Vec<WorkflowSummary>, RepositoryError> {
        self.client
            .list::<Workflow>(namespace)?
            .iter()
            .map(|workflow| -> Result<WorkflowSummary, RepositoryError> {
                let nodes = self.nodes(workflow)?;
                Ok(summarize_workflow(workflow, &nodes))
            })
            .collect()
    }

    pub fn get(&self, key: &ObjectKey) -> Result<WorkflowDetail, RepositoryError> {
        let workflow = self.fetch(key)?;
        let nodes = self.nodes(&workflow)?;
        Ok(WorkflowDetail {
            summary: summarize_workflow(&workflow, &nodes),
            topology: Topology {
                nodes: nodes.iter().map(topology_node).collect(),
            },
        })
    }

    pub fn create(&self, mut workflow: Workflow) -> Result<WorkflowDetail, RepositoryError> {
        check(&workflow)?;
        self.client.create(&mut workflow)?;
        info!(workflow = %workflow.metadata.key(), "workflow created");
        self.get(&workflow.metadata.key())
    }

    /// Replace the spec and metadata of an existing workflow. The stored
    /// status and version are kept.
    pub fn update(
        &self,
        key: &ObjectKey,
        mut workflow: Workflow,
    ) -> Result<WorkflowDetail, RepositoryError> {
        check(&workflow)?;
        let current = self.fetch(key)?;
        workflow.metadata.namespace = key.namespace.clone();
        workflow.metadata.name = key.name.clone();
        workflow.metadata.resource_version = current.metadata.resource_version;
        workflow.metadata.creation_timestamp = current.metadata.creation_timestamp;
        workflow.status = current.status;
        self.client.update(&mut workflow)?;
        info!(workflow = %key, "workflow updated");
        self.get(key)
    }

    /// Remove a workflow and everything it spawned. Experiments are only
    /// marked deleted so their faults are recovered before they go away.
    pub fn delete(&self, key: &ObjectKey) -> Result<(), RepositoryError> {
        let workflow = self.fetch(key)?;
        let now = Utc::now();

        // Roots first; the rest catches nodes whose parent is already gone.
        let mut nodes = self.nodes(&workflow)?;
        nodes.sort_by_key(|node| node.spec.parent.is_some());
        for node in nodes {
            delete_node_tree(self.client.as_ref(), &node, now)?;
        }

        self.client.delete::<Workflow>(key)?;
        info!(workflow = %key, "workflow deleted");
        Ok(())
    }

    fn fetch(&self, key: &ObjectKey) -> Result<Workflow, RepositoryError> {
        self.client
            .get::<Workflow>(key)?
            .ok_or_else(|| RepositoryError::NotFound { key: key.clone() })
    }

    fn nodes(&self, workflow: &Workflow) -> Result<Vec<WorkflowNode>, StoreError> {
        let mut nodes = self.client.list_labeled::<WorkflowNode>(
            &workflow.metadata.namespace,
            WORKFLOW_LABEL,
            &workflow.metadata.name,
        )?;
        nodes.sort_by(|a, b| {
            a.metadata
                .creation_timestamp
                .cmp(&b.metadata.creation_timestamp)
                .then_with(|| a.metadata.name.cmp(&b.metadata.name))
        });
        Ok(nodes)
    }
}

fn check(workflow: &Workflow) -> Result<(), RepositoryError> {
    let issues = workflow.validate();
    if has_errors(&issues) {
        return Err(RepositoryError::Invalid {
            key: workflow.metadata.key(),
            issues,
        });
    }
    Ok(())
}

fn summarize_workflow(workflow: &Workflow, nodes: &[WorkflowNode]) -> WorkflowSummary {
    let entry_failed = workflow.status.entry_node.as_ref().is_some_and(|entry| {
        nodes
            .iter()
            .any(|node| &node.metadata.name == entry && node.status.error.is_some())
    });
    let status = if workflow.condition_equals(ConditionType::Accomplished, ConditionStatus::True) {
        WorkflowState::Succeed
    } else if entry_failed {
        WorkflowState::Failed
    } else if workflow.condition_equals(ConditionType::Scheduled, ConditionStatus::True) {
        WorkflowState::Running
    } else {
        WorkflowState::Unknown
    };

    WorkflowSummary {
        namespace: workflow.metadata.namespace.clone(),
        name: workflow.metadata.name.clone(),
        entry: workflow.spec.entry.clone(),
        created: workflow.status.start_time,
        end_time: workflow.status.end_time,
        status,
    }
}

fn topology_node(node: &WorkflowNode) -> TopologyNode {
    let state = if node.status.error.is_some() {
        NodeState::Failed
    } else if node.is_finished() {
        NodeState::Succeed
    } else {
        NodeState::Running
    };
    TopologyNode {
        name: node.metadata.name.clone(),
        node_type: node.node_type(),
        state,
        template: node.spec.template_name.clone(),
        parent: node.spec.parent.clone(),
        tasks: node
            .node_type()
            .is_composite()
            .then(|| node.spec.tasks.clone()),
    }
}
