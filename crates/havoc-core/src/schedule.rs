//! Schedules own job experiments and carry the pause intent for them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::experiment::{ExperimentSpec, PAUSE_ANNOTATION};
use crate::types::{Object, ObjectKind, ObjectMeta};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleSpec {
    /// Cron expression, stored for display. Jobs are created externally.
    pub schedule: String,
    pub job: ExperimentSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ScheduleStatus {
    #[serde(default)]
    pub last_pause_sync: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub metadata: ObjectMeta,
    pub spec: ScheduleSpec,
    #[serde(default)]
    pub status: ScheduleStatus,
}

impl Schedule {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, spec: ScheduleSpec) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            spec,
            status: ScheduleStatus::default(),
        }
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
}

impl Object for Schedule {
    const KIND: ObjectKind = ObjectKind::Schedule;

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chaos::{ChaosSpec, HttpChaosSpec};

    #[test]
    fn schedule_pause_uses_the_experiment_annotation() {
        let mut schedule = Schedule::new(
            "default",
            "nightly",
            ScheduleSpec {
                schedule: "@every 1h".to_string(),
                job: ExperimentSpec::new(ChaosSpec::HttpChaos(HttpChaosSpec::default())),
            },
        );
        assert!(!schedule.is_paused());
        schedule.set_paused(true);
        assert!(schedule.is_paused());
        assert_eq!(
            schedule.metadata.annotations.get(PAUSE_ANNOTATION).map(String::as_str),
            Some("true")
        );
    }
}
