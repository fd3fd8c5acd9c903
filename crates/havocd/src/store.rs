use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;

use havoc_core::events::Event;
use havoc_core::types::{ObjectKey, ObjectKind};

use crate::client::{ChangeType, Client, ObjectChange, RawObject, StoreError};

const WATCH_CAPACITY: usize = 1024;

/// SQLite-backed object store.
///
/// Every object row carries its `resource_version`; updates are a single
/// conditional `UPDATE ... WHERE resource_version = ?` so two writers that
/// read the same version cannot both succeed.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
    changes: broadcast::Sender<ObjectChange>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Ok(Self::from_connection(conn))
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        let (changes, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            conn: Mutex::new(conn),
            changes,
        }
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    pub fn migrate(&self) -> Result<(), StoreError> {
        self.conn()?.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS objects (
    kind TEXT NOT NULL,
    namespace TEXT NOT NULL,
    name TEXT NOT NULL,
    resource_version INTEGER NOT NULL,
    labels_json TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (kind, namespace, name)
);

CREATE INDEX IF NOT EXISTS idx_objects_kind_ns ON objects(kind, namespace);

CREATE TABLE IF NOT EXISTS events (
    event_id TEXT PRIMARY KEY,
    involved_kind TEXT NOT NULL,
    namespace TEXT NOT NULL,
    name TEXT NOT NULL,
    at TEXT NOT NULL,
    event_type TEXT NOT NULL,
    reason TEXT NOT NULL,
    payload_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_involved_at ON events(namespace, name, at);
"#,
        )?;
        Ok(())
    }

    fn notify(
        &self,
        kind: ObjectKind,
        key: &ObjectKey,
        labels: BTreeMap<String, String>,
        change: ChangeType,
    ) {
        // No receivers is fine; nothing is watching yet.
        let _ = self.changes.send(ObjectChange {
            kind,
            key: key.clone(),
            labels,
            change,
        });
    }
}

fn current_version(
    conn: &Connection,
    kind: ObjectKind,
    key: &ObjectKey,
) -> Result<Option<u64>, StoreError> {
    let version: Option<i64> = conn
        .query_row(
            "SELECT resource_version FROM objects WHERE kind = ?1 AND namespace = ?2 AND name = ?3",
            params![kind.as_str(), key.namespace, key.name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(version.map(|value| value as u64))
}

impl Client for SqliteStore {
    fn get_raw(&self, kind: ObjectKind, key: &ObjectKey) -> Result<Option<RawObject>, StoreError> {
        let conn = self.conn()?;
        let row: Option<(String, i64)> = conn
            .query_row(
                "SELECT payload_json, resource_version FROM objects WHERE kind = ?1 AND namespace = ?2 AND name = ?3",
                params![kind.as_str(), key.namespace, key.name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(row.map(|(payload, version)| RawObject {
            payload,
            resource_version: version as u64,
        }))
    }

    fn list_raw(
        &self,
        kind: ObjectKind,
        namespace: Option<&str>,
    ) -> Result<Vec<RawObject>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
SELECT payload_json, resource_version FROM objects
WHERE kind = ?1 AND (?2 IS NULL OR namespace = ?2)
ORDER BY namespace ASC, name ASC
"#,
        )?;
        let rows = stmt.query_map(params![kind.as_str(), namespace], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut objects = Vec::new();
        for row in rows {
            let (payload, version) = row?;
            objects.push(RawObject {
                payload,
                resource_version: version as u64,
            });
        }
        Ok(objects)
    }

    fn list_keys(&self, kind: ObjectKind) -> Result<Vec<ObjectKey>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT namespace, name FROM objects WHERE kind = ?1 ORDER BY namespace ASC, name ASC",
        )?;
        let rows = stmt.query_map(params![kind.as_str()], |row| {
            Ok(ObjectKey::new(
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
            ))
        })?;
        let mut keys = Vec::new();
        for row in rows {
            keys.push(row?);
        }
        Ok(keys)
    }

    fn create_raw(
        &self,
        kind: ObjectKind,
        key: &ObjectKey,
        labels: &BTreeMap<String, String>,
        payload: &str,
    ) -> Result<u64, StoreError> {
        let labels_json = serde_json::to_string(labels)?;
        {
            let conn = self.conn()?;
            let inserted = conn.execute(
                r#"
INSERT INTO objects (kind, namespace, name, resource_version, labels_json, payload_json, updated_at)
VALUES (?1, ?2, ?3, 1, ?4, ?5, ?6)
ON CONFLICT(kind, namespace, name) DO NOTHING
"#,
                params![
                    kind.as_str(),
                    key.namespace,
                    key.name,
                    labels_json,
                    payload,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            if inserted == 0 {
                return Err(StoreError::AlreadyExists {
                    kind,
                    key: key.clone(),
                });
            }
        }
        self.notify(kind, key, labels.clone(), ChangeType::Created);
        Ok(1)
    }

    fn update_raw(
        &self,
        kind: ObjectKind,
        key: &ObjectKey,
        labels: &BTreeMap<String, String>,
        payload: &str,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        let labels_json = serde_json::to_string(labels)?;
        let next_version = expected_version + 1;
        {
            let conn = self.conn()?;
            let updated = conn.execute(
                r#"
UPDATE objects
SET resource_version = ?1, labels_json = ?2, payload_json = ?3, updated_at = ?4
WHERE kind = ?5 AND namespace = ?6 AND name = ?7 AND resource_version = ?8
"#,
                params![
                    next_version as i64,
                    labels_json,
                    payload,
                    Utc::now().to_rfc3339(),
                    kind.as_str(),
                    key.namespace,
                    key.name,
                    expected_version as i64,
                ],
            )?;
            if updated == 0 {
                return match current_version(&conn, kind, key)? {
                    Some(actual) => Err(StoreError::Conflict {
                        kind,
                        key: key.clone(),
                        expected: expected_version,
                        actual,
                    }),
                    None => Err(StoreError::NotFound {
                        kind,
                        key: key.clone(),
                    }),
                };
            }
        }
        self.notify(kind, key, labels.clone(), ChangeType::Updated);
        Ok(next_version)
    }

    fn delete_raw(&self, kind: ObjectKind, key: &ObjectKey) -> Result<bool, StoreError> {
        let labels: Option<String> = {
            let conn = self.conn()?;
            let labels: Option<String> = conn
                .query_row(
                    "SELECT labels_json FROM objects WHERE kind = ?1 AND namespace = ?2 AND name = ?3",
                    params![kind.as_str(), key.namespace, key.name],
                    |row| row.get(0),
                )
                .optional()?;
            conn.execute(
                "DELETE FROM objects WHERE kind = ?1 AND namespace = ?2 AND name = ?3",
                params![kind.as_str(), key.namespace, key.name],
            )?;
            labels
        };
        match labels {
            Some(labels_json) => {
                let labels = serde_json::from_str(&labels_json)?;
                self.notify(kind, key, labels, ChangeType::Deleted);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn record_event(&self, event: &Event) -> Result<(), StoreError> {
        let payload = serde_json::to_string(event)?;
        self.conn()?.execute(
            r#"
INSERT INTO events (event_id, involved_kind, namespace, name, at, event_type, reason, payload_json)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
"#,
            params![
                event.id.0,
                event.involved_kind.as_str(),
                event.involved.namespace,
                event.involved.name,
                event.at.to_rfc3339(),
                event.event_type.as_str(),
                event.reason.as_str(),
                payload,
            ],
        )?;
        Ok(())
    }

    fn list_events(&self, involved: Option<&ObjectKey>) -> Result<Vec<Event>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
SELECT payload_json FROM events
WHERE (?1 IS NULL OR (namespace = ?1 AND name = ?2))
ORDER BY at ASC, event_id ASC
"#,
        )?;
        let rows = stmt.query_map(
            params![
                involved.map(|key| key.namespace.as_str()),
                involved.map(|key| key.name.as_str())
            ],
            |row| row.get::<_, String>(0),
        )?;
        let mut events = Vec::new();
        for row in rows {
            events.push(serde_json::from_str::<Event>(&row?)?);
        }
        Ok(events)
    }

    fn watch(&self) -> broadcast::Receiver<ObjectChange> {
        self.changes.subscribe()
    }
}
