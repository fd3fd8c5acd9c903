use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use havoc_core::config::{load_config, ConfigError, HavocConfig};
use havoc_core::types::ObjectKey;
use havoc_core::validation::{has_errors, Validate, ValidationLevel};
use havocd::client::{Client, StoreError};
use havocd::daemon::{Daemon, DaemonError};
use havocd::manifest::{apply_manifest, parse_manifest, ManifestError};
use havocd::workflow::{RepositoryError, WorkflowRepository};

const DEFAULT_CONFIG_PATH: &str = ".havoc/config.toml";

#[derive(Debug, Parser)]
#[command(name = "havocd", version, about = "Chaos experiment and workflow controller")]
struct Cli {
    /// TOML config; defaults apply when the file does not exist.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the controllers until interrupted.
    Run {
        /// Reconcile every object once and exit.
        #[arg(long)]
        once: bool,
    },
    /// Create or update the objects in a JSON manifest.
    Apply { manifest: PathBuf },
    /// Print workflows as JSON.
    Get {
        #[command(subcommand)]
        target: GetTarget,
    },
    /// Delete a workflow together with its nodes and their children.
    Delete { workflow: ObjectKey },
    /// Print events, optionally only those about one object.
    Events { object: Option<ObjectKey> },
    /// Check the config file and report every issue.
    Validate,
}

#[derive(Debug, Subcommand)]
enum GetTarget {
    Workflows {
        #[arg(long)]
        namespace: Option<String>,
    },
    Workflow { key: ObjectKey },
}

#[derive(Debug, thiserror::Error)]
enum MainError {
    #[error("failed to load config at {path}: {source}")]
    LoadConfig {
        path: PathBuf,
        #[source]
        source: ConfigError,
    },
    #[error("config at {path} has errors")]
    InvalidConfig { path: PathBuf },
    #[error("failed to read manifest at {path}: {source}")]
    ReadManifest {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize output as json: {source}")]
    SerializeOutput {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to install ctrl-c handler: {source}")]
    Signal {
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Daemon(#[from] DaemonError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("havocd failed: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), MainError> {
    let cli = Cli::parse();
    let config = read_config(&cli.config)?;
    init_tracing(&config);

    match cli.command {
        Command::Validate => validate(&cli.config, &config),
        Command::Run { once } => run_daemon(&config, once).await,
        Command::Apply { manifest } => {
            let text = fs::read_to_string(&manifest).map_err(|source| MainError::ReadManifest {
                path: manifest.clone(),
                source,
            })?;
            let objects = parse_manifest(&text)?;
            let daemon = Daemon::open(&config)?;
            let applied = apply_manifest(daemon.store.as_ref(), objects)?;
            print_json(&applied)
        }
        Command::Get { target } => {
            let repository = WorkflowRepository::new(open_client(&config)?);
            match target {
                GetTarget::Workflows { namespace } => {
                    print_json(&repository.list(namespace.as_deref())?)
                }
                GetTarget::Workflow { key } => print_json(&repository.get(&key)?),
            }
        }
        Command::Delete { workflow } => {
            WorkflowRepository::new(open_client(&config)?).delete(&workflow)?;
            info!(workflow = %workflow, "workflow deleted");
            Ok(())
        }
        Command::Events { object } => {
            let client = open_client(&config)?;
            print_json(&client.list_events(object.as_ref())?)
        }
    }
}

fn read_config(path: &Path) -> Result<HavocConfig, MainError> {
    if !path.exists() {
        return Ok(HavocConfig::default());
    }
    load_config(path).map_err(|source| MainError::LoadConfig {
        path: path.to_path_buf(),
        source,
    })
}

/// `RUST_LOG` wins over the configured level.
fn init_tracing(config: &HavocConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn validate(path: &Path, config: &HavocConfig) -> Result<(), MainError> {
    let issues = config.validate();
    for issue in &issues {
        let level = match issue.level {
            ValidationLevel::Error => "error",
            ValidationLevel::Warning => "warning",
        };
        println!("{level}: {} ({})", issue.message, issue.code);
    }
    if has_errors(&issues) {
        return Err(MainError::InvalidConfig {
            path: path.to_path_buf(),
        });
    }
    println!("config ok");
    Ok(())
}

async fn run_daemon(config: &HavocConfig, once: bool) -> Result<(), MainError> {
    let daemon = Daemon::open(config)?;
    info!(
        controllers = ?daemon.manager.controller_names(),
        resync_secs = config.controller.resync_interval_secs,
        "havocd starting"
    );

    if once {
        let report = daemon.manager.run_once().await?;
        info!(reconciled = report.reconciled, failed = report.failed, "sweep finished");
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let manager = tokio::spawn(daemon.manager.run(shutdown_rx));
    tokio::signal::ctrl_c()
        .await
        .map_err(|source| MainError::Signal { source })?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);

    match manager.await {
        Ok(result) => result?,
        Err(err) => warn!(error = %err, "controller manager task aborted"),
    }
    Ok(())
}

fn open_client(config: &HavocConfig) -> Result<Arc<dyn Client>, MainError> {
    let store: Arc<dyn Client> = Daemon::open(config)?.store;
    Ok(store)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), MainError> {
    let text =
        serde_json::to_string_pretty(value).map_err(|source| MainError::SerializeOutput { source })?;
    println!("{text}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_workflow_keys() {
        let cli = Cli::try_parse_from(["havocd", "get", "workflow", "default/wf"]).expect("parse");
        match cli.command {
            Command::Get {
                target: GetTarget::Workflow { key },
            } => assert_eq!(key, ObjectKey::new("default", "wf")),
            other => panic!("unexpected command {other:?}"),
        }
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_PATH));
    }

    #[test]
    fn rejects_keys_without_namespace() {
        assert!(Cli::try_parse_from(["havocd", "delete", "wf"]).is_err());
    }

    #[test]
    fn missing_config_file_uses_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = read_config(&dir.path().join("absent.toml")).expect("defaults");
        assert_eq!(config, HavocConfig::default());
    }
}
