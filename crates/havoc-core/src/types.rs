//! Object metadata, keys and the pod model the selectors resolve against.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// `namespace/name` address of an object in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl std::str::FromStr for ObjectKey {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().split_once('/') {
            Some((namespace, name)) if !namespace.is_empty() && !name.is_empty() => {
                Ok(ObjectKey::new(namespace, name))
            }
            _ => Err(format!(
                "invalid object key '{value}'. expected <namespace>/<name>"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ObjectKind {
    Pod,
    Experiment,
    Schedule,
    Workflow,
    WorkflowNode,
}

impl ObjectKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ObjectKind::Pod => "Pod",
            ObjectKind::Experiment => "Experiment",
            ObjectKind::Schedule => "Schedule",
            ObjectKind::Workflow => "Workflow",
            ObjectKind::WorkflowNode => "WorkflowNode",
        }
    }
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ObjectKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "pod" => Ok(ObjectKind::Pod),
            "experiment" => Ok(ObjectKind::Experiment),
            "schedule" => Ok(ObjectKind::Schedule),
            "workflow" => Ok(ObjectKind::Workflow),
            "workflownode" | "workflow_node" => Ok(ObjectKind::WorkflowNode),
            other => Err(format!(
                "invalid object kind '{other}'. valid values: pod, experiment, schedule, workflow, workflownode"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Optimistic-concurrency token. Owned by the store; zero before the
    /// object is first persisted.
    #[serde(default)]
    pub resource_version: u64,
    #[serde(default = "Utc::now")]
    pub creation_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            resource_version: 0,
            creation_timestamp: Utc::now(),
            deletion_timestamp: None,
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace.clone(), self.name.clone())
    }

    pub fn is_deleted(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }
}

/// Anything that can live in the object store.
pub trait Object: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: ObjectKind;

    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;

    fn key(&self) -> ObjectKey {
        self.meta().key()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum PodPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            PodPhase::Pending => "Pending",
            PodPhase::Running => "Running",
            PodPhase::Succeeded => "Succeeded",
            PodPhase::Failed => "Failed",
            PodPhase::Unknown => "Unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub name: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub ports: Vec<u16>,
}

impl Container {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: None,
            command: Vec::new(),
            ports: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pod {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub node_name: Option<String>,
    #[serde(default)]
    pub pod_ip: Option<String>,
    #[serde(default)]
    pub phase: PodPhase,
    #[serde(default)]
    pub containers: Vec<Container>,
}

impl Pod {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            node_name: None,
            pod_ip: None,
            phase: PodPhase::Running,
            containers: Vec::new(),
        }
    }

    /// Every declared container port, in container order.
    pub fn container_ports(&self) -> Vec<u16> {
        self.containers
            .iter()
            .flat_map(|container| container.ports.iter().copied())
            .collect()
    }
}

impl Object for Pod {
    const KIND: ObjectKind = ObjectKind::Pod;

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

/// A resolved chaos target: a whole pod, or one container inside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Target {
    Pod(ObjectKey),
    Container { pod: ObjectKey, container: String },
}

impl Target {
    /// Stable identifier stored in experiment records.
    pub fn id(&self) -> String {
        match self {
            Target::Pod(key) => key.to_string(),
            Target::Container { pod, container } => format!("{pod}/{container}"),
        }
    }

    pub fn pod(&self) -> &ObjectKey {
        match self {
            Target::Pod(key) => key,
            Target::Container { pod, .. } => pod,
        }
    }

    /// Inverse of [`Target::id`].
    pub fn parse_id(id: &str) -> Option<Self> {
        let mut parts = id.split('/');
        let namespace = parts.next().filter(|part| !part.is_empty())?;
        let name = parts.next().filter(|part| !part.is_empty())?;
        let container = parts.next();
        if parts.next().is_some() {
            return None;
        }
        let pod = ObjectKey::new(namespace, name);
        match container {
            None => Some(Target::Pod(pod)),
            Some(container) if !container.is_empty() => Some(Target::Container {
                pod,
                container: container.to_string(),
            }),
            Some(_) => None,
        }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_key_parses_namespace_and_name() {
        let key: ObjectKey = "default/web-0".parse().expect("parse key");
        assert_eq!(key, ObjectKey::new("default", "web-0"));
        assert_eq!(key.to_string(), "default/web-0");
    }

    #[test]
    fn object_key_rejects_missing_parts() {
        assert!("default".parse::<ObjectKey>().is_err());
        assert!("/web".parse::<ObjectKey>().is_err());
        assert!("default/".parse::<ObjectKey>().is_err());
    }

    #[test]
    fn object_kind_parses_case_insensitively() {
        assert_eq!(
            "WorkflowNode".parse::<ObjectKind>().unwrap(),
            ObjectKind::WorkflowNode
        );
        assert_eq!("pod".parse::<ObjectKind>().unwrap(), ObjectKind::Pod);
        let err = "deployment".parse::<ObjectKind>().unwrap_err();
        assert!(err.contains("invalid object kind 'deployment'"));
    }

    #[test]
    fn target_ids_round_trip_through_parse() {
        let pod = Target::Pod(ObjectKey::new("default", "web-0"));
        assert_eq!(pod.id(), "default/web-0");
        assert_eq!(Target::parse_id(&pod.id()), Some(pod));

        let container = Target::Container {
            pod: ObjectKey::new("default", "web-0"),
            container: "nginx".to_string(),
        };
        assert_eq!(container.id(), "default/web-0/nginx");
        assert_eq!(Target::parse_id(&container.id()), Some(container));
    }

    #[test]
    fn target_parse_rejects_malformed_ids() {
        assert_eq!(Target::parse_id("web-0"), None);
        assert_eq!(Target::parse_id("a/b/c/d"), None);
        assert_eq!(Target::parse_id("a/b/"), None);
    }

    #[test]
    fn pod_container_ports_flatten_in_order() {
        let mut pod = Pod::new("default", "web-0");
        let mut nginx = Container::new("nginx");
        nginx.ports = vec![80, 443];
        let mut sidecar = Container::new("sidecar");
        sidecar.ports = vec![9090];
        pod.containers = vec![nginx, sidecar];
        assert_eq!(pod.container_ports(), vec![80, 443, 9090]);
    }

    #[test]
    fn meta_builders_set_labels_and_annotations() {
        let meta = ObjectMeta::new("default", "web-0")
            .with_label("app", "web")
            .with_annotation("owner", "team-a");
        assert_eq!(meta.labels.get("app").map(String::as_str), Some("web"));
        assert_eq!(
            meta.annotations.get("owner").map(String::as_str),
            Some("team-a")
        );
        assert!(!meta.is_deleted());
    }
}
