use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use havoc_core::events::EventReason;
use havoc_core::state::ConditionStatus;
use havoc_core::types::{ObjectKey, ObjectKind};
use havoc_core::workflow::{
    set_condition, Condition, ConditionType, Workflow, WorkflowNode, WORKFLOW_LABEL,
};

use crate::client::{Client, ClientExt, ObjectChange};
use crate::error::ReconcileError;
use crate::manager::{labeled_owner, Action, Reconciler};
use crate::recorder::EventRecorder;
use crate::retry::{retry_on_conflict, Backoff};
use crate::workflow::render::{render_node, PARENT_NODE_LABEL};

/// Creates a workflow's entry node once and mirrors the entry node's
/// outcome onto the workflow status.
pub struct WorkflowEntryReconciler {
    client: Arc<dyn Client>,
    recorder: EventRecorder,
    backoff: Backoff,
}

impl WorkflowEntryReconciler {
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
        let Some(workflow) = self.client.get::<Workflow>(key)? else {
            return Ok(Action::done());
        };
        if workflow.metadata.is_deleted() {
            return Ok(Action::done());
        }

        let entry = match &workflow.status.entry_node {
            Some(name) => self
                .client
                .get::<WorkflowNode>(&ObjectKey::new(key.namespace.clone(), name.clone()))?,
            None => Some(self.ensure_entry_node(&workflow, now)?),
        };

        let mut accomplished_now = false;
        retry_on_conflict(self.backoff, || {
            let Some(mut latest) = self.client.get::<Workflow>(key)? else {
                return Ok(());
            };
            let before = latest.status.clone();
            if let Some(entry) = &entry {
                latest.status.entry_node = Some(entry.metadata.name.clone());
            }
            if latest.status.start_time.is_none() {
                latest.status.start_time = Some(now);
            }
            set_condition(
                &mut latest.status.conditions,
                Condition::new(ConditionType::Scheduled, ConditionStatus::True, ""),
            );

            let (accomplished, reason) = match &entry {
                Some(entry) if entry.is_finished() => (ConditionStatus::True, String::new()),
                Some(entry) => match &entry.status.error {
                    Some(error) => (ConditionStatus::False, error.clone()),
                    None => (ConditionStatus::False, String::new()),
                },
                None => (ConditionStatus::False, "entry node missing".to_string()),
            };
            let was_accomplished =
                latest.condition_equals(ConditionType::Accomplished, ConditionStatus::True);
            set_condition(
                &mut latest.status.conditions,
                Condition::new(ConditionType::Accomplished, accomplished, reason),
            );
            accomplished_now = accomplished == ConditionStatus::True && !was_accomplished;
            if accomplished_now && latest.status.end_time.is_none() {
                latest.status.end_time = Some(now);
            }

            if latest.status != before {
                self.client.update(&mut latest)?;
            }
            Ok(())
        })
        .await?;

        if accomplished_now {
            info!(workflow = %key, "workflow accomplished");
            self.recorder.normal(
                &workflow,
                EventReason::WorkflowAccomplished,
                "entry node finished",
            );
        }
        Ok(Action::done())
    }

    /// The workflow's entry node, adopting one left by an earlier pass whose
    /// status write was lost.
    fn ensure_entry_node(
        &self,
        workflow: &Workflow,
        now: DateTime<Utc>,
    ) -> Result<WorkflowNode, ReconcileError> {
        let existing = self
            .client
            .list_labeled::<WorkflowNode>(
                &workflow.metadata.namespace,
                WORKFLOW_LABEL,
                &workflow.metadata.name,
            )?
            .into_iter()
            .find(|node| node.spec.parent.is_none() && !node.metadata.is_deleted());
        if let Some(node) = existing {
            debug!(workflow = %workflow.metadata.key(), node = %node.metadata.name, "adopting entry node");
            return Ok(node);
        }

        let mut node = render_node(workflow, None, &workflow.spec.entry, now)?;
        self.client.create(&mut node)?;
        info!(workflow = %workflow.metadata.key(), node = %node.metadata.name, "created entry node");
        self.recorder.normal(
            workflow,
            EventReason::NodesCreated,
            format!("created entry node {}", node.metadata.name),
        );
        Ok(node)
    }
}

#[async_trait]
impl Reconciler for WorkflowEntryReconciler {
    fn name(&self) -> &'static str {
        "workflow-entry"
    }

    fn kind(&self) -> ObjectKind {
        ObjectKind::Workflow
    }

    /// Workflows wake on their own changes and on changes to their entry
    /// node, the only node without a parent.
    fn map_change(&self, change: &ObjectChange) -> Vec<ObjectKey> {
        match change.kind {
            ObjectKind::Workflow => vec![change.key.clone()],
            ObjectKind::WorkflowNode if !change.labels.contains_key(PARENT_NODE_LABEL) => {
                labeled_owner(change, WORKFLOW_LABEL).into_iter().collect()
            }
            _ => Vec::new(),
        }
    }

    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        self.reconcile_at(key, Utc::now()).await
    }
}
