use havoc_core::events::Event;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum EventLogError {
    #[error("failed to create log directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize event: {source}")]
    Serialize {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to append to log file {path}: {source}")]
    Append {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Append-only JSONL mirror of recorded events.
///
/// Layout: `<root>/global.jsonl` plus one file per involved object under
/// `<root>/objects/<namespace>/<name>.jsonl`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonlEventLog {
    pub root: PathBuf,
    pub global_file: PathBuf,
    pub object_dir: PathBuf,
}

impl JsonlEventLog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let global_file = root.join("global.jsonl");
        let object_dir = root.join("objects");
        Self {
            root,
            global_file,
            object_dir,
        }
    }

    pub fn ensure_layout(&self) -> Result<(), EventLogError> {
        create_dir(&self.root)?;
        create_dir(&self.object_dir)
    }

    pub fn append_global(&self, event: &Event) -> Result<(), EventLogError> {
        append_json_line(&self.global_file, event)
    }

    pub fn append_object(&self, event: &Event) -> Result<(), EventLogError> {
        let dir = self.object_dir.join(&event.involved.namespace);
        create_dir(&dir)?;
        append_json_line(
            &self.object_log_path(&event.involved.namespace, &event.involved.name),
            event,
        )
    }

    pub fn append_both(&self, event: &Event) -> Result<(), EventLogError> {
        self.ensure_layout()?;
        self.append_global(event)?;
        self.append_object(event)
    }

    pub fn object_log_path(&self, namespace: &str, name: &str) -> PathBuf {
        self.object_dir.join(namespace).join(format!("{name}.jsonl"))
    }

    pub fn global_log_path(&self) -> &Path {
        self.global_file.as_path()
    }
}

fn create_dir(path: &Path) -> Result<(), EventLogError> {
    fs::create_dir_all(path).map_err(|source| EventLogError::CreateDir {
        path: path.to_path_buf(),
        source,
    })
}

fn append_json_line(path: &Path, event: &Event) -> Result<(), EventLogError> {
    let mut line =
        serde_json::to_string(event).map_err(|source| EventLogError::Serialize { source })?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| EventLogError::Append {
            path: path.to_path_buf(),
            source,
        })?;

    file.write_all(line.as_bytes())
        .map_err(|source| EventLogError::Append {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use havoc_core::events::{EventId, EventReason, EventType};
    use havoc_core::types::{ObjectKey, ObjectKind};

    fn event(id: &str, name: &str) -> Event {
        Event {
            id: EventId(id.to_string()),
            at: Utc::now(),
            involved_kind: ObjectKind::Experiment,
            involved: ObjectKey::new("default", name),
            event_type: EventType::Warning,
            reason: EventReason::ApplyFailed,
            message: "executor rejected apply".to_string(),
        }
    }

    #[test]
    fn append_both_writes_global_and_object_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = JsonlEventLog::new(dir.path().join("events"));

        log.append_both(&event("E1", "delay")).expect("append first");
        log.append_both(&event("E2", "loss")).expect("append second");

        let global = fs::read_to_string(log.global_log_path()).expect("read global");
        assert_eq!(global.lines().count(), 2);

        let delay = fs::read_to_string(log.object_log_path("default", "delay"))
            .expect("read object log");
        let parsed: Event =
            serde_json::from_str(delay.lines().next().expect("one line")).expect("parse line");
        assert_eq!(parsed.id, EventId("E1".to_string()));
        assert_eq!(parsed.reason, EventReason::ApplyFailed);
    }
}
