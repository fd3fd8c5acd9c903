//! Wires the store, recorder, executor and every reconciler from a loaded
//! [`HavocConfig`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use havoc_core::config::{ExecutorMode, HavocConfig};
use havoc_core::validation::{has_errors, Validate, ValidationIssue};
use havoc_executor::{CommandExecutor, FaultExecutor, RecordingExecutor};

use crate::chaos::ChaosRegistry;
use crate::client::{Client, StoreError};
use crate::desired_phase::DesiredPhaseReconciler;
use crate::event_log::{EventLogError, JsonlEventLog};
use crate::experiment::ExperimentReconciler;
use crate::manager::ControllerManager;
use crate::pause::PauseReconciler;
use crate::recorder::EventRecorder;
use crate::retry::Backoff;
use crate::selector::TargetSelector;
use crate::store::SqliteStore;
use crate::workflow::{CompositeNodeReconciler, LeafNodeReconciler, WorkflowEntryReconciler};

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("invalid config: {}", .0.iter().map(|issue| issue.message.as_str()).collect::<Vec<_>>().join("; "))]
    InvalidConfig(Vec<ValidationIssue>),
    #[error("failed to create state directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    EventLog(#[from] EventLogError),
}

pub struct Daemon {
    pub store: Arc<SqliteStore>,
    pub recorder: EventRecorder,
    pub manager: ControllerManager,
}

impl Daemon {
    /// Opens the on-disk store and event log named by `config`.
    pub fn open(config: &HavocConfig) -> Result<Self, DaemonError> {
        let issues = config.validate();
        if has_errors(&issues) {
            return Err(DaemonError::InvalidConfig(issues));
        }

        let sqlite_path = &config.storage.sqlite_path;
        if let Some(parent) = sqlite_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| DaemonError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let store = Arc::new(SqliteStore::open(sqlite_path)?);
        store.migrate()?;

        let log = JsonlEventLog::new(&config.storage.event_log_root);
        log.ensure_layout()?;

        let executor = build_executor(config);
        info!(
            sqlite = %sqlite_path.display(),
            events = %config.storage.event_log_root.display(),
            executor = ?config.executor.mode,
            "daemon storage ready"
        );
        Ok(Self::with_store(config, store, executor, Some(log)))
    }

    /// Assembles the controllers over an already migrated store.
    pub fn with_store(
        config: &HavocConfig,
        store: Arc<SqliteStore>,
        executor: Arc<dyn FaultExecutor>,
        log: Option<JsonlEventLog>,
    ) -> Self {
        let client: Arc<dyn Client> = store.clone();
        let mut recorder = EventRecorder::new(client.clone());
        if let Some(log) = log {
            recorder = recorder.with_log(log);
        }
        let backoff = Backoff::from_config(&config.retry);

        let selector = Arc::new(TargetSelector::new(client.clone(), config.controller.clone()));
        let registry = ChaosRegistry::with_builtin(client.clone(), executor, selector.clone());

        let mut manager = ControllerManager::new(client.clone(), config.controller.resync_interval());
        manager.register(Arc::new(
            ExperimentReconciler::new(client.clone(), registry, selector, recorder.clone())
                .with_backoff(backoff)
                .with_max_concurrent_actions(config.controller.max_concurrent_actions),
        ));
        manager.register(Arc::new(
            DesiredPhaseReconciler::new(client.clone(), recorder.clone()).with_backoff(backoff),
        ));
        manager.register(Arc::new(
            PauseReconciler::new(client.clone(), recorder.clone()).with_backoff(backoff),
        ));
        manager.register(Arc::new(
            WorkflowEntryReconciler::new(client.clone(), recorder.clone()).with_backoff(backoff),
        ));
        manager.register(Arc::new(
            CompositeNodeReconciler::serial(client.clone(), recorder.clone()).with_backoff(backoff),
        ));
        manager.register(Arc::new(
            CompositeNodeReconciler::parallel(client.clone(), recorder.clone())
                .with_backoff(backoff),
        ));
        manager.register(Arc::new(
            LeafNodeReconciler::new(client, recorder.clone()).with_backoff(backoff),
        ));

        Self {
            store,
            recorder,
            manager,
        }
    }
}

fn build_executor(config: &HavocConfig) -> Arc<dyn FaultExecutor> {
    match config.executor.mode {
        ExecutorMode::Recording => Arc::new(RecordingExecutor::new()),
        ExecutorMode::Command => {
            let mut command = config.executor.command.iter().cloned();
            // Validation rejects an empty command in this mode.
            let program = command.next().unwrap_or_default();
            Arc::new(CommandExecutor::new(
                program,
                command.collect(),
                Duration::from_secs(config.executor.timeout_secs),
            ))
        }
    }
}
