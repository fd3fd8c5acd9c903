//! Phase enums shared by experiments and workflow nodes.

use serde::{Deserialize, Serialize};

/// What the user wants an experiment to be doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DesiredPhase {
    #[default]
    Running,
    Stopped,
}

impl DesiredPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            DesiredPhase::Running => "Running",
            DesiredPhase::Stopped => "Stopped",
        }
    }

    /// The record phase every record converges to under this desired phase.
    pub fn target_record_phase(self) -> RecordPhase {
        match self {
            DesiredPhase::Running => RecordPhase::Injected,
            DesiredPhase::Stopped => RecordPhase::NotInjected,
        }
    }
}

impl std::fmt::Display for DesiredPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Injection state of a single record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum RecordPhase {
    #[default]
    NotInjected,
    Injected,
}

impl RecordPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordPhase::NotInjected => "Not Injected",
            RecordPhase::Injected => "Injected",
        }
    }
}

impl std::fmt::Display for RecordPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Workflow node phase.
///
/// ```text
/// Init → WaitingForSchedule → Running → Holding → Succeed | Failed
///                  WaitingForChild (serial, parallel, task)
///                  Evaluating      (branch evaluation)
/// ```
///
/// The phase is always inferred from node status on each reconcile; it is
/// never the source of truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum NodePhase {
    #[default]
    Init,
    WaitingForSchedule,
    Running,
    /// Alive but idle, waiting for a duration or deadline to pass.
    Holding,
    Succeed,
    Failed,
    WaitingForChild,
    Evaluating,
}

impl NodePhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodePhase::Succeed | NodePhase::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodePhase::Init => "Init",
            NodePhase::WaitingForSchedule => "WaitingForSchedule",
            NodePhase::Running => "Running",
            NodePhase::Holding => "Holding",
            NodePhase::Succeed => "Succeed",
            NodePhase::Failed => "Failed",
            NodePhase::WaitingForChild => "WaitingForChild",
            NodePhase::Evaluating => "Evaluating",
        }
    }
}

impl std::fmt::Display for NodePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        }
    }
}
