//! Havoc daemon crate: object store, controller manager and the chaos and
//! workflow reconcilers.

pub mod chaos;
pub mod client;
pub mod daemon;
pub mod desired_phase;
pub mod error;
pub mod event_log;
pub mod experiment;
pub mod manager;
pub mod manifest;
pub mod pause;
pub mod recorder;
pub mod retry;
pub mod selector;
pub mod store;
pub mod workflow;

#[cfg(test)]
mod testing;

pub use client::{ChangeType, Client, ClientExt, ObjectChange, StoreError};
pub use daemon::{Daemon, DaemonError};
pub use error::ReconcileError;
pub use manager::{Action, ControllerManager, Reconciler, SweepReport};
pub use manifest::{apply_manifest, parse_manifest, ApplyOutcome, ManifestError, ManifestObject};
pub use store::SqliteStore;
pub use workflow::{WorkflowDetail, WorkflowRepository, WorkflowSummary};
