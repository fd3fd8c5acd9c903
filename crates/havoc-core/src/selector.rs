//! Declarative target selectors and the per-pod matching rules.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::{Pod, PodPhase};

/// Which pods (or containers) an experiment targets.
///
/// Every non-empty criterion must match; empty criteria match everything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SelectorSpec {
    /// Namespaces to search. Empty means every namespace the controller may
    /// target.
    #[serde(default)]
    pub namespaces: Vec<String>,
    /// Only pods scheduled onto one of these nodes.
    #[serde(default)]
    pub nodes: Vec<String>,
    /// Explicit pods, namespace → pod names. When set, label/field matching
    /// still applies but no listing happens.
    #[serde(default)]
    pub pods: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub label_selectors: BTreeMap<String, String>,
    /// Supported fields: `metadata.name`, `metadata.namespace`,
    /// `spec.nodeName`, `status.phase`.
    #[serde(default)]
    pub field_selectors: BTreeMap<String, String>,
    #[serde(default)]
    pub annotation_selectors: BTreeMap<String, String>,
    #[serde(default)]
    pub pod_phase_selectors: Vec<PodPhase>,
    /// When non-empty, targets are the named containers of each selected
    /// pod instead of the pod itself.
    #[serde(default)]
    pub container_names: Vec<String>,
}

impl SelectorSpec {
    pub fn is_container_level(&self) -> bool {
        !self.container_names.is_empty()
    }

    /// Check every pod-local criterion. Namespace scoping is the caller's job.
    pub fn matches_pod(&self, pod: &Pod) -> bool {
        if !self.nodes.is_empty() {
            let on_node = pod
                .node_name
                .as_ref()
                .is_some_and(|node| self.nodes.iter().any(|wanted| wanted == node));
            if !on_node {
                return false;
            }
        }

        if !map_subset(&self.label_selectors, &pod.metadata.labels) {
            return false;
        }
        if !map_subset(&self.annotation_selectors, &pod.metadata.annotations) {
            return false;
        }

        for (field, wanted) in &self.field_selectors {
            match field_value(pod, field) {
                Some(actual) if actual == *wanted => {}
                _ => return false,
            }
        }

        if !self.pod_phase_selectors.is_empty() && !self.pod_phase_selectors.contains(&pod.phase)
        {
            return false;
        }

        true
    }
}

fn map_subset(wanted: &BTreeMap<String, String>, actual: &BTreeMap<String, String>) -> bool {
    wanted
        .iter()
        .all(|(key, value)| actual.get(key).is_some_and(|found| found == value))
}

fn field_value(pod: &Pod, field: &str) -> Option<String> {
    match field {
        "metadata.name" => Some(pod.metadata.name.clone()),
        "metadata.namespace" => Some(pod.metadata.namespace.clone()),
        "spec.nodeName" => pod.node_name.clone(),
        "status.phase" => Some(pod.phase.as_str().to_string()),
        _ => None,
    }
}

/// Field names [`SelectorSpec::matches_pod`] understands.
pub const SUPPORTED_FIELD_SELECTORS: [&str; 4] = [
    "metadata.name",
    "metadata.namespace",
    "spec.nodeName",
    "status.phase",
];
