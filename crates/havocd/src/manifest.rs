//! JSON manifests: lists of objects tagged by `kind`, created or updated in
//! the store in order.

use serde::{Deserialize, Serialize};
use tracing::info;

use havoc_core::experiment::Experiment;
use havoc_core::schedule::Schedule;
use havoc_core::types::{Object, ObjectKey, ObjectKind, Pod};
use havoc_core::validation::{has_errors, Validate, ValidationIssue};
use havoc_core::workflow::Workflow;

use crate::client::{Client, ClientExt, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("failed to parse manifest: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("{kind} {key} is invalid: {}", .issues.iter().map(|issue| issue.code).collect::<Vec<_>>().join(", "))]
    Invalid {
        kind: ObjectKind,
        key: ObjectKey,
        issues: Vec<ValidationIssue>,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ManifestObject {
    Pod(Pod),
    Experiment(Experiment),
    Schedule(Schedule),
    Workflow(Workflow),
}

impl ManifestObject {
    pub fn kind(&self) -> ObjectKind {
        match self {
            ManifestObject::Pod(_) => ObjectKind::Pod,
            ManifestObject::Experiment(_) => ObjectKind::Experiment,
            ManifestObject::Schedule(_) => ObjectKind::Schedule,
            ManifestObject::Workflow(_) => ObjectKind::Workflow,
        }
    }

    pub fn key(&self) -> ObjectKey {
        match self {
            ManifestObject::Pod(pod) => pod.key(),
            ManifestObject::Experiment(experiment) => experiment.key(),
            ManifestObject::Schedule(schedule) => schedule.key(),
            ManifestObject::Workflow(workflow) => workflow.key(),
        }
    }

    fn issues(&self) -> Vec<ValidationIssue> {
        match self {
            ManifestObject::Pod(_) => Vec::new(),
            ManifestObject::Experiment(experiment) => experiment.validate(),
            ManifestObject::Schedule(schedule) => schedule.validate(),
            ManifestObject::Workflow(workflow) => workflow.validate(),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ManifestDocument {
    Many(Vec<ManifestObject>),
    One(Box<ManifestObject>),
}

/// Accepts a single object or a JSON array of objects.
pub fn parse_manifest(text: &str) -> Result<Vec<ManifestObject>, ManifestError> {
    Ok(match serde_json::from_str(text)? {
        ManifestDocument::Many(objects) => objects,
        ManifestDocument::One(object) => vec![*object],
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyOutcome {
    Created,
    Updated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedObject {
    pub kind: ObjectKind,
    pub key: ObjectKey,
    pub outcome: ApplyOutcome,
}

/// Validate every object first, then write them in order. Existing objects
/// keep their status; pods are replaced wholesale since their status is
/// what the manifest describes.
pub fn apply_manifest(
    client: &dyn Client,
    objects: Vec<ManifestObject>,
) -> Result<Vec<AppliedObject>, ManifestError> {
    for object in &objects {
        let issues = object.issues();
        if has_errors(&issues) {
            return Err(ManifestError::Invalid {
                kind: object.kind(),
                key: object.key(),
                issues,
            });
        }
    }

    let mut applied = Vec::with_capacity(objects.len());
    for object in objects {
        let kind = object.kind();
        let key = object.key();
        let outcome = match object {
            ManifestObject::Pod(pod) => apply_one(client, pod, |_, _| {})?,
            ManifestObject::Experiment(experiment) => {
                apply_one(client, experiment, |next, current| next.status = current.status)?
            }
            ManifestObject::Schedule(schedule) => {
                apply_one(client, schedule, |next, current| next.status = current.status)?
            }
            ManifestObject::Workflow(workflow) => {
                apply_one(client, workflow, |next, current| next.status = current.status)?
            }
        };
        info!(kind = %kind, key = %key, outcome = ?outcome, "manifest object applied");
        applied.push(AppliedObject { kind, key, outcome });
    }
    Ok(applied)
}

fn apply_one<T, F>(client: &dyn Client, mut object: T, carry: F) -> Result<ApplyOutcome, StoreError>
where
    T: Object,
    F: FnOnce(&mut T, T),
{
    let key = object.key();
    match client.get::<T>(&key)? {
        Some(current) => {
            let meta = object.meta_mut();
            meta.resource_version = current.meta().resource_version;
            meta.creation_timestamp = current.meta().creation_timestamp;
            carry(&mut object, current);
            client.update(&mut object)?;
            Ok(ApplyOutcome::Updated)
        }
        None => {
            client.create(&mut object)?;
            Ok(ApplyOutcome::Created)
        }
    }
}
