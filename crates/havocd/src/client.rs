//! The object-store boundary every controller talks through.
//!
//! [`Client`] is object-safe and deals in JSON payloads; [`ClientExt`] adds
//! the typed helpers controllers actually call.

use std::collections::BTreeMap;

use havoc_core::events::Event;
use havoc_core::types::{Object, ObjectKey, ObjectKind};
use tokio::sync::broadcast;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} {key} not found")]
    NotFound { kind: ObjectKind, key: ObjectKey },
    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: ObjectKind, key: ObjectKey },
    #[error("conflict updating {kind} {key}: expected version {expected}, found {actual}")]
    Conflict {
        kind: ObjectKind,
        key: ObjectKey,
        expected: u64,
        actual: u64,
    },
    #[error("sqlite error: {source}")]
    Sql {
        #[from]
        source: rusqlite::Error,
    },
    #[error("json serialization error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
    #[error("store lock poisoned")]
    LockPoisoned,
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// A stored payload with its concurrency token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawObject {
    pub payload: String,
    pub resource_version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    Created,
    Updated,
    Deleted,
}

/// Notification sent after every successful write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectChange {
    pub kind: ObjectKind,
    pub key: ObjectKey,
    pub labels: BTreeMap<String, String>,
    pub change: ChangeType,
}

pub trait Client: Send + Sync {
    fn get_raw(&self, kind: ObjectKind, key: &ObjectKey) -> Result<Option<RawObject>, StoreError>;

    /// Every object of `kind`, optionally restricted to one namespace, in key order.
    fn list_raw(
        &self,
        kind: ObjectKind,
        namespace: Option<&str>,
    ) -> Result<Vec<RawObject>, StoreError>;

    fn list_keys(&self, kind: ObjectKind) -> Result<Vec<ObjectKey>, StoreError>;

    /// Insert a new object, returning its first resource version.
    fn create_raw(
        &self,
        kind: ObjectKind,
        key: &ObjectKey,
        labels: &BTreeMap<String, String>,
        payload: &str,
    ) -> Result<u64, StoreError>;

    /// Replace an object if its stored version still equals `expected_version`.
    fn update_raw(
        &self,
        kind: ObjectKind,
        key: &ObjectKey,
        labels: &BTreeMap<String, String>,
        payload: &str,
        expected_version: u64,
    ) -> Result<u64, StoreError>;

    /// Returns whether anything was deleted.
    fn delete_raw(&self, kind: ObjectKind, key: &ObjectKey) -> Result<bool, StoreError>;

    fn record_event(&self, event: &Event) -> Result<(), StoreError>;

    fn list_events(&self, involved: Option<&ObjectKey>) -> Result<Vec<Event>, StoreError>;

    fn watch(&self) -> broadcast::Receiver<ObjectChange>;
}

fn decode<T: Object>(raw: RawObject) -> Result<T, StoreError> {
    let mut object: T = serde_json::from_str(&raw.payload)?;
    object.meta_mut().resource_version = raw.resource_version;
    Ok(object)
}

pub trait ClientExt: Client {
    fn get<T: Object>(&self, key: &ObjectKey) -> Result<Option<T>, StoreError> {
        self.get_raw(T::KIND, key)?.map(decode).transpose()
    }

    fn list<T: Object>(&self, namespace: Option<&str>) -> Result<Vec<T>, StoreError> {
        self.list_raw(T::KIND, namespace)?
            .into_iter()
            .map(decode)
            .collect()
    }

    fn list_labeled<T: Object>(
        &self,
        namespace: &str,
        label: &str,
        value: &str,
    ) -> Result<Vec<T>, StoreError> {
        Ok(self
            .list::<T>(Some(namespace))?
            .into_iter()
            .filter(|object| {
                object
                    .meta()
                    .labels
                    .get(label)
                    .is_some_and(|found| found == value)
            })
            .collect())
    }

    fn create<T: Object>(&self, object: &mut T) -> Result<(), StoreError> {
        let key = object.key();
        let payload = serde_json::to_string(object)?;
        let version = self.create_raw(T::KIND, &key, &object.meta().labels, &payload)?;
        object.meta_mut().resource_version = version;
        Ok(())
    }

    /// Optimistic update using the version carried in the object's metadata.
    fn update<T: Object>(&self, object: &mut T) -> Result<(), StoreError> {
        let key = object.key();
        let expected = object.meta().resource_version;
        let payload = serde_json::to_string(object)?;
        let version = self.update_raw(T::KIND, &key, &object.meta().labels, &payload, expected)?;
        object.meta_mut().resource_version = version;
        Ok(())
    }

    fn delete<T: Object>(&self, key: &ObjectKey) -> Result<bool, StoreError> {
        self.delete_raw(T::KIND, key)
    }
}

impl<C: Client + ?Sized> ClientExt for C {}
