//! Turns workflow templates into concrete node objects.

use chrono::{DateTime, Utc};
use ulid::Ulid;

use havoc_core::duration::parse_duration;
use havoc_core::types::ObjectMeta;
use havoc_core::workflow::{
    NodeType, Template, Workflow, WorkflowError, WorkflowNode, WorkflowNodeSpec,
    WorkflowNodeStatus, WORKFLOW_LABEL,
};

/// Label carrying the parent node's name on every non-entry node.
pub const PARENT_NODE_LABEL: &str = "havoc.dev/parent-node";

/// `<template>-<ulid>`, lowercased so names stay DNS-friendly.
pub fn node_name(template: &str) -> String {
    format!("{template}-{}", Ulid::new().to_string().to_lowercase())
}

/// One node per task, in the given order.
pub fn render_nodes(
    workflow: &Workflow,
    parent: Option<&WorkflowNode>,
    tasks: &[String],
    now: DateTime<Utc>,
) -> Result<Vec<WorkflowNode>, WorkflowError> {
    tasks
        .iter()
        .map(|task| render_node(workflow, parent, task, now))
        .collect()
}

pub fn render_node(
    workflow: &Workflow,
    parent: Option<&WorkflowNode>,
    task: &str,
    now: DateTime<Utc>,
) -> Result<WorkflowNode, WorkflowError> {
    let template = workflow.template(task)?;
    check_sections(template)?;

    let deadline = match &template.deadline {
        None => None,
        Some(raw) => {
            let bound = parse_duration(raw).map_err(|source| WorkflowError::InvalidDeadline {
                template: template.name.clone(),
                source,
            })?;
            chrono::Duration::from_std(bound)
                .ok()
                .and_then(|bound| now.checked_add_signed(bound))
        }
    };

    let mut metadata = ObjectMeta::new(
        workflow.metadata.namespace.clone(),
        node_name(&template.name),
    )
    .with_label(WORKFLOW_LABEL, workflow.metadata.name.clone());
    if let Some(parent) = parent {
        metadata = metadata.with_label(PARENT_NODE_LABEL, parent.metadata.name.clone());
    }
    metadata.creation_timestamp = now;

    Ok(WorkflowNode {
        metadata,
        spec: WorkflowNodeSpec {
            workflow_name: workflow.metadata.name.clone(),
            template_name: template.name.clone(),
            node_type: template.template_type,
            originating_task: Some(task.to_string()),
            parent: parent.map(|parent| parent.metadata.name.clone()),
            tasks: template.tasks.clone(),
            deadline,
            duration: template.duration.clone(),
            chaos: template.chaos.clone(),
            task: template.task.clone(),
        },
        status: WorkflowNodeStatus::default(),
    })
}

fn check_sections(template: &Template) -> Result<(), WorkflowError> {
    let missing = match template.template_type {
        NodeType::Chaos if template.chaos.is_none() => Some("chaos"),
        NodeType::Task if template.task.is_none() => Some("task"),
        NodeType::Suspend if template.duration.is_none() => Some("duration"),
        _ => None,
    };
    match missing {
        Some(field) => Err(WorkflowError::MissingSection {
            template: template.name.clone(),
            node_type: template.template_type.as_str(),
            field,
        }),
        None => Ok(()),
    }
}
