//! Children of a composite node, and the task delta between what a node
//! declares and what already exists.

use std::collections::HashSet;
use std::sync::Arc;

use havoc_core::workflow::WorkflowNode;

use crate::client::{Client, ClientExt, StoreError};
use crate::workflow::render::PARENT_NODE_LABEL;

/// Children of one node, split by whether they have finished.
#[derive(Debug, Clone, Default)]
pub struct Children {
    pub active: Vec<WorkflowNode>,
    pub finished: Vec<WorkflowNode>,
}

impl Children {
    pub fn all(&self) -> impl Iterator<Item = &WorkflowNode> {
        self.active.iter().chain(self.finished.iter())
    }

    /// Declared task each existing child was started for.
    pub fn existing_tasks(&self) -> Vec<String> {
        self.all().map(originating_task).collect()
    }

    pub fn active_tasks(&self) -> Vec<String> {
        self.active.iter().map(originating_task).collect()
    }

    pub fn finished_tasks(&self) -> Vec<String> {
        self.finished.iter().map(originating_task).collect()
    }

    pub fn active_names(&self) -> Vec<String> {
        self.active
            .iter()
            .map(|child| child.metadata.name.clone())
            .collect()
    }

    pub fn finished_names(&self) -> Vec<String> {
        self.finished
            .iter()
            .map(|child| child.metadata.name.clone())
            .collect()
    }

    /// First child that reported an error.
    pub fn failed(&self) -> Option<&WorkflowNode> {
        self.all().find(|child| child.status.error.is_some())
    }
}

fn originating_task(child: &WorkflowNode) -> String {
    child
        .spec
        .originating_task
        .clone()
        .unwrap_or_else(|| child.spec.template_name.clone())
}

/// Lists a node's children by the parent-node label.
#[derive(Clone)]
pub struct ChildrenFetcher {
    client: Arc<dyn Client>,
}

impl ChildrenFetcher {
    pub fn new(client: Arc<dyn Client>) -> Self {
        Self { client }
    }

    pub fn fetch(&self, node: &WorkflowNode) -> Result<Children, StoreError> {
        let mut nodes = self.client.list_labeled::<WorkflowNode>(
            &node.metadata.namespace,
            PARENT_NODE_LABEL,
            &node.metadata.name,
        )?;
        nodes.retain(|child| !child.metadata.is_deleted());
        nodes.sort_by(|a, b| {
            a.metadata
                .creation_timestamp
                .cmp(&b.metadata.creation_timestamp)
                .then_with(|| a.metadata.name.cmp(&b.metadata.name))
        });

        let (finished, active): (Vec<_>, Vec<_>) = nodes.into_iter().partition(WorkflowNode::is_finished);
        Ok(Children { active, finished })
    }
}

/// What a composite node must do to its children this pass.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChildrenDiff {
    /// Existing children no longer match the declared tasks; remove them all.
    pub delete_all: bool,
    pub to_start: Vec<String>,
}

fn has_undeclared(declared: &[String], existing: &[String]) -> bool {
    let declared: HashSet<&str> = declared.iter().map(String::as_str).collect();
    existing.iter().any(|task| !declared.contains(task.as_str()))
}

/// Parallel nodes start every declared task that has no child yet.
pub fn parallel_diff(declared: &[String], existing: &[String]) -> ChildrenDiff {
    if has_undeclared(declared, existing) {
        return ChildrenDiff {
            delete_all: true,
            to_start: dedup(declared.iter()),
        };
    }
    let existing: HashSet<&str> = existing.iter().map(String::as_str).collect();
    ChildrenDiff {
        delete_all: false,
        to_start: dedup(
            declared
                .iter()
                .filter(|task| !existing.contains(task.as_str())),
        ),
    }
}

/// Serial nodes start the first declared task without a finished child, and
/// only while no child is running.
pub fn serial_diff(declared: &[String], active: &[String], finished: &[String]) -> ChildrenDiff {
    let existing: Vec<String> = active.iter().chain(finished.iter()).cloned().collect();
    if has_undeclared(declared, &existing) {
        return ChildrenDiff {
            delete_all: true,
            to_start: declared.first().cloned().into_iter().collect(),
        };
    }
    if !active.is_empty() {
        return ChildrenDiff::default();
    }
    let finished: HashSet<&str> = finished.iter().map(String::as_str).collect();
    ChildrenDiff {
        delete_all: false,
        to_start: declared
            .iter()
            .find(|task| !finished.contains(task.as_str()))
            .cloned()
            .into_iter()
            .collect(),
    }
}

fn dedup<'a>(tasks: impl Iterator<Item = &'a String>) -> Vec<String> {
    let mut seen = HashSet::new();
    tasks
        .filter(|task| seen.insert(task.as_str()))
        .cloned()
        .collect()
}
