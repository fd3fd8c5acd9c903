//! Experiment objects: desired state plus the per-target record list.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::chaos::{ChaosKind, ChaosSpec};
use crate::duration::{parse_duration, DurationParseError};
use crate::selector::SelectorSpec;
use crate::state::{DesiredPhase, RecordPhase};
use crate::types::{Object, ObjectKind, ObjectMeta};

/// Annotation that pauses an experiment when set to exactly `"true"`.
pub const PAUSE_ANNOTATION: &str = "experiment.havoc.dev/pause";
/// Label linking a job experiment to the schedule that owns it.
pub const CONTROLLED_BY_LABEL: &str = "havoc.dev/controlled-by";
/// Selector key used when a spec declares a single anonymous selector.
pub const DEFAULT_SELECTOR_KEY: &str = ".";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentSpec {
    /// Selector name → selector. Resolved in name order.
    #[serde(default)]
    pub selectors: BTreeMap<String, SelectorSpec>,
    /// How long the fault stays injected. `None` means until stopped.
    #[serde(default)]
    pub duration: Option<String>,
    pub chaos: ChaosSpec,
}

impl ExperimentSpec {
    pub fn new(chaos: ChaosSpec) -> Self {
        Self {
            selectors: BTreeMap::new(),
            duration: None,
            chaos,
        }
    }

    pub fn with_selector(mut self, key: impl Into<String>, selector: SelectorSpec) -> Self {
        self.selectors.insert(key.into(), selector);
        self
    }

    pub fn with_duration(mut self, duration: impl Into<String>) -> Self {
        self.duration = Some(duration.into());
        self
    }

    pub fn duration(&self) -> Result<Option<Duration>, DurationParseError> {
        self.duration.as_deref().map(parse_duration).transpose()
    }
}

/// One selected target under one selector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub selector_key: String,
    pub phase: RecordPhase,
}

impl Record {
    pub fn new(id: impl Into<String>, selector_key: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            selector_key: selector_key.into(),
            phase: RecordPhase::NotInjected,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ExperimentStatus {
    #[serde(default)]
    pub desired_phase: DesiredPhase,
    /// `None` until the selectors are first resolved; afterwards frozen.
    #[serde(default)]
    pub records: Option<Vec<Record>>,
}

/// How an experiment stands against its configured duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurationState {
    Unbounded,
    Remaining(Duration),
    Exceeded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub metadata: ObjectMeta,
    pub spec: ExperimentSpec,
    #[serde(default)]
    pub status: ExperimentStatus,
}

impl Experiment {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, spec: ExperimentSpec) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            spec,
            status: ExperimentStatus::default(),
        }
    }

    pub fn kind(&self) -> ChaosKind {
        self.spec.chaos.kind()
    }

    pub fn is_paused(&self) -> bool {
        self.metadata
            .annotations
            .get(PAUSE_ANNOTATION)
            .is_some_and(|value| value == "true")
    }

    pub fn set_paused(&mut self, paused: bool) {
        self.metadata
            .annotations
            .insert(PAUSE_ANNOTATION.to_string(), paused.to_string());
    }

    pub fn duration_state(&self, now: DateTime<Utc>) -> Result<DurationState, DurationParseError> {
        let Some(duration) = self.spec.duration()? else {
            return Ok(DurationState::Unbounded);
        };
        let elapsed = (now - self.metadata.creation_timestamp)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if elapsed >= duration {
            Ok(DurationState::Exceeded)
        } else {
            Ok(DurationState::Remaining(duration - elapsed))
        }
    }

    /// True when no record is left injected.
    pub fn all_recovered(&self) -> bool {
        self.status
            .records
            .as_ref()
            .map_or(true, |records| {
                records
                    .iter()
                    .all(|record| record.phase == RecordPhase::NotInjected)
            })
    }

    /// True once records exist and every one of them is injected.
    pub fn all_injected(&self) -> bool {
        self.status.records.as_ref().is_some_and(|records| {
            records
                .iter()
                .all(|record| record.phase == RecordPhase::Injected)
        })
    }

    /// Stopped and fully recovered.
    pub fn is_finished(&self) -> bool {
        self.status.desired_phase == DesiredPhase::Stopped && self.all_recovered()
    }

    pub fn controller(&self) -> Option<&str> {
        self.metadata
            .labels
            .get(CONTROLLED_BY_LABEL)
            .map(String::as_str)
    }
}

impl Object for Experiment {
    const KIND: ObjectKind = ObjectKind::Experiment;

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}
