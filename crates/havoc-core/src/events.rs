use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ObjectKey, ObjectKind};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub String);

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for EventId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Normal,
    Warning,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Normal => "normal",
            EventType::Warning => "warning",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventReason {
    RecordsPopulated,
    Applied,
    Recovered,
    ApplyFailed,
    RecoverFailed,
    SelectorFailed,
    DesiredPhaseChanged,
    PauseUpdated,
    PauseUpdateFailed,
    NodesCreated,
    NodesDeleted,
    NodeAccomplished,
    NodeFailed,
    DeadlineExceeded,
    WorkflowAccomplished,
}

impl EventReason {
    pub fn as_str(self) -> &'static str {
        match self {
            EventReason::RecordsPopulated => "records_populated",
            EventReason::Applied => "applied",
            EventReason::Recovered => "recovered",
            EventReason::ApplyFailed => "apply_failed",
            EventReason::RecoverFailed => "recover_failed",
            EventReason::SelectorFailed => "selector_failed",
            EventReason::DesiredPhaseChanged => "desired_phase_changed",
            EventReason::PauseUpdated => "pause_updated",
            EventReason::PauseUpdateFailed => "pause_update_failed",
            EventReason::NodesCreated => "nodes_created",
            EventReason::NodesDeleted => "nodes_deleted",
            EventReason::NodeAccomplished => "node_accomplished",
            EventReason::NodeFailed => "node_failed",
            EventReason::DeadlineExceeded => "deadline_exceeded",
            EventReason::WorkflowAccomplished => "workflow_accomplished",
        }
    }
}

impl std::fmt::Display for EventReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something a controller wants an operator to see, attached to an object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub at: DateTime<Utc>,
    pub involved_kind: ObjectKind,
    pub involved: ObjectKey,
    pub event_type: EventType,
    pub reason: EventReason,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn event_serializes_reason_and_type_in_snake_case() {
        let event = Event {
            id: EventId("E1".to_string()),
            at: Utc
                .with_ymd_and_hms(2026, 2, 8, 12, 30, 45)
                .single()
                .expect("valid timestamp"),
            involved_kind: ObjectKind::Schedule,
            involved: ObjectKey::new("default", "nightly"),
            event_type: EventType::Warning,
            reason: EventReason::PauseUpdateFailed,
            message: "conflict".to_string(),
        };

        let encoded = serde_json::to_string(&event).expect("serialize event");
        assert!(encoded.contains("\"event_type\":\"warning\""));
        assert!(encoded.contains("\"reason\":\"pause_update_failed\""));

        let decoded: Event = serde_json::from_str(&encoded).expect("deserialize event");
        assert_eq!(decoded, event);
    }

    #[test]
    fn reason_display_matches_serde_tag() {
        let tag = serde_json::to_string(&EventReason::NodesCreated).expect("serialize");
        assert_eq!(tag, format!("\"{}\"", EventReason::NodesCreated));
    }
}
