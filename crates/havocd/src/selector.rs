//! Resolve a [`SelectorSpec`] against the pods currently in the store.

use std::collections::BTreeSet;
use std::sync::Arc;

use havoc_core::config::ControllerConfig;
use havoc_core::selector::SelectorSpec;
use havoc_core::types::{ObjectKey, Pod, Target};

use crate::client::{Client, ClientExt, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum SelectorError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("pod {key} not found")]
    PodNotFound { key: ObjectKey },
    #[error("namespace '{namespace}' is not allowed for chaos targets")]
    NamespaceNotAllowed { namespace: String },
}

pub trait Selector: Send + Sync {
    /// Live targets for `spec`, sorted and de-duplicated.
    fn select(&self, spec: &SelectorSpec) -> Result<Vec<Target>, SelectorError>;
}

pub struct TargetSelector {
    client: Arc<dyn Client>,
    scope: ControllerConfig,
}

impl TargetSelector {
    pub fn new(client: Arc<dyn Client>, scope: ControllerConfig) -> Self {
        Self { client, scope }
    }

    fn ensure_allowed(&self, namespace: &str) -> Result<(), SelectorError> {
        if self.scope.namespace_allowed(namespace) {
            Ok(())
        } else {
            Err(SelectorError::NamespaceNotAllowed {
                namespace: namespace.to_string(),
            })
        }
    }

    fn candidate_pods(&self, spec: &SelectorSpec) -> Result<Vec<Pod>, SelectorError> {
        if !spec.pods.is_empty() {
            let mut pods = Vec::new();
            for (namespace, names) in &spec.pods {
                self.ensure_allowed(namespace)?;
                for name in names {
                    let key = ObjectKey::new(namespace.clone(), name.clone());
                    match self.client.get::<Pod>(&key)? {
                        Some(pod) => pods.push(pod),
                        None => return Err(SelectorError::PodNotFound { key }),
                    }
                }
            }
            return Ok(pods);
        }

        if spec.namespaces.is_empty() {
            return Ok(self
                .client
                .list::<Pod>(None)?
                .into_iter()
                .filter(|pod| self.scope.namespace_allowed(&pod.metadata.namespace))
                .collect());
        }

        let mut pods = Vec::new();
        for namespace in &spec.namespaces {
            self.ensure_allowed(namespace)?;
            pods.extend(self.client.list::<Pod>(Some(namespace))?);
        }
        Ok(pods)
    }
}

impl Selector for TargetSelector {
    fn select(&self, spec: &SelectorSpec) -> Result<Vec<Target>, SelectorError> {
        let mut targets = BTreeSet::new();
        for pod in self.candidate_pods(spec)? {
            if pod.metadata.is_deleted() || !spec.matches_pod(&pod) {
                continue;
            }
            let key = pod.metadata.key();
            if spec.is_container_level() {
                // Containers the pod does not run are skipped.
                for wanted in &spec.container_names {
                    if pod.containers.iter().any(|container| &container.name == wanted) {
                        targets.insert(Target::Container {
                            pod: key.clone(),
                            container: wanted.clone(),
                        });
                    }
                }
            } else {
                targets.insert(Target::Pod(key));
            }
        }
        Ok(targets.into_iter().collect())
    }
}
