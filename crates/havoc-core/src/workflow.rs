//! Workflow specs, the node objects they expand into, and node conditions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::duration::DurationParseError;
use crate::experiment::ExperimentSpec;
use crate::state::{ConditionStatus, NodePhase};
use crate::types::{Container, Object, ObjectKey, ObjectKind, ObjectMeta};

/// Label carrying the owning workflow's name on every node.
pub const WORKFLOW_LABEL: &str = "havoc.dev/workflow";
/// Label carrying the owning node's name on experiments and pods it creates.
pub const WORKFLOW_NODE_LABEL: &str = "havoc.dev/workflow-node";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkflowError {
    #[error("no such template '{template}' in workflow {workflow}")]
    NoSuchTemplate { workflow: String, template: String },
    #[error("missing required templates in workflow {workflow}")]
    TemplatesRequired { workflow: String },
    #[error("node {node} has type {actual}, expected {expected}")]
    UnsupportedNodeType {
        node: String,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("template '{template}' of type {node_type} is missing its {field} section")]
    MissingSection {
        template: String,
        node_type: &'static str,
        field: &'static str,
    },
    #[error("template '{template}' has an invalid deadline: {source}")]
    InvalidDeadline {
        template: String,
        #[source]
        source: DurationParseError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    Chaos,
    Serial,
    Parallel,
    Suspend,
    Task,
}

impl NodeType {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeType::Chaos => "Chaos",
            NodeType::Serial => "Serial",
            NodeType::Parallel => "Parallel",
            NodeType::Suspend => "Suspend",
            NodeType::Task => "Task",
        }
    }

    pub fn is_composite(self) -> bool {
        matches!(self, NodeType::Serial | NodeType::Parallel)
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user-defined step: one container run to completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub container: Container,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub name: String,
    #[serde(rename = "type")]
    pub template_type: NodeType,
    /// Wall-clock bound for the node, same grammar as durations.
    #[serde(default)]
    pub deadline: Option<String>,
    /// Child template names, in order. Serial and parallel only.
    #[serde(default)]
    pub tasks: Vec<String>,
    /// How long a suspend node waits, or how long a chaos node holds.
    #[serde(default)]
    pub duration: Option<String>,
    #[serde(default)]
    pub chaos: Option<ExperimentSpec>,
    #[serde(default)]
    pub task: Option<TaskSpec>,
}

impl Template {
    pub fn new(name: impl Into<String>, template_type: NodeType) -> Self {
        Self {
            name: name.into(),
            template_type,
            deadline: None,
            tasks: Vec::new(),
            duration: None,
            chaos: None,
            task: None,
        }
    }

    pub fn with_tasks<I, S>(mut self, tasks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tasks = tasks.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_duration(mut self, duration: impl Into<String>) -> Self {
        self.duration = Some(duration.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub entry: String,
    #[serde(default)]
    pub templates: Vec<Template>,
}

impl WorkflowSpec {
    pub fn template(&self, name: &str) -> Option<&Template> {
        self.templates.iter().find(|template| template.name == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionType {
    Accomplished,
    DeadlineExceeded,
    Scheduled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    pub status: ConditionStatus,
    #[serde(default)]
    pub reason: String,
}

impl Condition {
    pub fn new(condition_type: ConditionType, status: ConditionStatus, reason: impl Into<String>) -> Self {
        Self {
            condition_type,
            status,
            reason: reason.into(),
        }
    }
}

/// Set-or-replace by type. Returns true when anything changed.
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) -> bool {
    match conditions
        .iter_mut()
        .find(|existing| existing.condition_type == condition.condition_type)
    {
        Some(existing) if *existing == condition => false,
        Some(existing) => {
            *existing = condition;
            true
        }
        None => {
            conditions.push(condition);
            true
        }
    }
}

pub fn condition_status(conditions: &[Condition], condition_type: ConditionType) -> ConditionStatus {
    conditions
        .iter()
        .find(|condition| condition.condition_type == condition_type)
        .map_or(ConditionStatus::Unknown, |condition| condition.status)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct WorkflowStatus {
    #[serde(default)]
    pub entry_node: Option<String>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub metadata: ObjectMeta,
    pub spec: WorkflowSpec,
    #[serde(default)]
    pub status: WorkflowStatus,
}

impl Workflow {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, spec: WorkflowSpec) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            spec,
            status: WorkflowStatus::default(),
        }
    }

    pub fn template(&self, name: &str) -> Result<&Template, WorkflowError> {
        if self.spec.templates.is_empty() {
            return Err(WorkflowError::TemplatesRequired {
                workflow: self.metadata.name.clone(),
            });
        }
        self.spec
            .template(name)
            .ok_or_else(|| WorkflowError::NoSuchTemplate {
                workflow: self.metadata.name.clone(),
                template: name.to_string(),
            })
    }

    pub fn condition_equals(&self, condition_type: ConditionType, status: ConditionStatus) -> bool {
        condition_status(&self.status.conditions, condition_type) == status
    }
}

impl Object for Workflow {
    const KIND: ObjectKind = ObjectKind::Workflow;

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowNodeSpec {
    pub workflow_name: String,
    pub template_name: String,
    pub node_type: NodeType,
    /// Task name in the parent's declared list this node was started for.
    #[serde(default)]
    pub originating_task: Option<String>,
    /// Parent node name; `None` for the entry node.
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub tasks: Vec<String>,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration: Option<String>,
    #[serde(default)]
    pub chaos: Option<ExperimentSpec>,
    #[serde(default)]
    pub task: Option<TaskSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct WorkflowNodeStatus {
    #[serde(default)]
    pub phase: NodePhase,
    #[serde(default)]
    pub active_children: Vec<String>,
    #[serde(default)]
    pub finished_children: Vec<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Experiment created by a chaos node.
    #[serde(default)]
    pub chaos_ref: Option<ObjectKey>,
    /// Pod created by a task node.
    #[serde(default)]
    pub task_pod: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub metadata: ObjectMeta,
    pub spec: WorkflowNodeSpec,
    #[serde(default)]
    pub status: WorkflowNodeStatus,
}

impl WorkflowNode {
    pub fn node_type(&self) -> NodeType {
        self.spec.node_type
    }

    pub fn condition_equals(&self, condition_type: ConditionType, status: ConditionStatus) -> bool {
        condition_status(&self.status.conditions, condition_type) == status
    }

    pub fn is_accomplished(&self) -> bool {
        self.condition_equals(ConditionType::Accomplished, ConditionStatus::True)
    }

    pub fn is_deadline_exceeded(&self) -> bool {
        self.condition_equals(ConditionType::DeadlineExceeded, ConditionStatus::True)
    }

    /// Accomplished, or cut short by its deadline.
    pub fn is_finished(&self) -> bool {
        self.is_accomplished() || self.is_deadline_exceeded()
    }

    pub fn deadline_passed(&self, now: DateTime<Utc>) -> bool {
        self.spec.deadline.is_some_and(|deadline| now >= deadline)
    }

    /// Derive the phase from conditions and progress markers.
    pub fn infer_phase(&self) -> NodePhase {
        if self.status.error.is_some() {
            return NodePhase::Failed;
        }
        if self.is_finished() {
            return NodePhase::Succeed;
        }
        let started = !self.status.conditions.is_empty()
            || !self.status.active_children.is_empty()
            || !self.status.finished_children.is_empty()
            || self.status.chaos_ref.is_some()
            || self.status.task_pod.is_some();
        if !started {
            return NodePhase::Init;
        }
        match self.spec.node_type {
            NodeType::Serial | NodeType::Parallel if !self.status.active_children.is_empty() => {
                NodePhase::WaitingForChild
            }
            NodeType::Task if self.status.task_pod.is_some() => NodePhase::WaitingForChild,
            NodeType::Suspend => NodePhase::Holding,
            NodeType::Chaos if self.status.chaos_ref.is_some() => NodePhase::Holding,
            _ => NodePhase::Running,
        }
    }
}

impl Object for WorkflowNode {
    const KIND: ObjectKind = ObjectKind::WorkflowNode;

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}
