use chrono::Utc;
use std::sync::Arc;
use tracing::warn;
use ulid::Ulid;

use havoc_core::events::{Event, EventId, EventReason, EventType};
use havoc_core::types::{Object, ObjectKey, ObjectKind};

use crate::client::Client;
use crate::event_log::JsonlEventLog;

/// Writes controller events to the store and, when configured, the JSONL log.
///
/// Recording never fails the caller; write errors are logged and dropped.
#[derive(Clone)]
pub struct EventRecorder {
    client: Arc<dyn Client>,
    log: Option<JsonlEventLog>,
}

impl EventRecorder {
    pub fn new(client: Arc<dyn Client>) -> Self {
        Self { client, log: None }
    }

    pub fn with_log(mut self, log: JsonlEventLog) -> Self {
        self.log = Some(log);
        self
    }

    pub fn normal<T: Object>(&self, object: &T, reason: EventReason, message: impl Into<String>) {
        self.record(T::KIND, object.key(), EventType::Normal, reason, message.into());
    }

    pub fn warning<T: Object>(&self, object: &T, reason: EventReason, message: impl Into<String>) {
        self.record(T::KIND, object.key(), EventType::Warning, reason, message.into());
    }

    pub fn record(
        &self,
        involved_kind: ObjectKind,
        involved: ObjectKey,
        event_type: EventType,
        reason: EventReason,
        message: String,
    ) {
        let event = Event {
            id: EventId(Ulid::new().to_string()),
            at: Utc::now(),
            involved_kind,
            involved,
            event_type,
            reason,
            message,
        };

        if let Err(err) = self.client.record_event(&event) {
            warn!(event_id = %event.id, reason = %event.reason, error = %err, "failed to store event");
        }
        if let Some(log) = &self.log {
            if let Err(err) = log.append_both(&event) {
                warn!(event_id = %event.id, reason = %event.reason, error = %err, "failed to append event log");
            }
        }
    }
}

impl std::fmt::Debug for EventRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRecorder")
            .field("log", &self.log)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use havoc_core::types::Pod;

    #[test]
    fn events_land_in_store_and_log() {
        let store = Arc::new(SqliteStore::open_in_memory().expect("open store"));
        store.migrate().expect("migrate");
        let dir = tempfile::tempdir().expect("tempdir");
        let log = JsonlEventLog::new(dir.path());
        let recorder = EventRecorder::new(store.clone()).with_log(log.clone());

        let pod = Pod::new("default", "web-0");
        recorder.warning(&pod, EventReason::ApplyFailed, "boom");
        recorder.normal(&pod, EventReason::Applied, "ok");

        let events = store
            .list_events(Some(&ObjectKey::new("default", "web-0")))
            .expect("list events");
        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .any(|event| event.event_type == EventType::Warning && event.message == "boom"));

        let global = std::fs::read_to_string(log.global_log_path()).expect("read log");
        assert_eq!(global.lines().count(), 2);
    }
}
