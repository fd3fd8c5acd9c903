//! Controller configuration loaded from TOML.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("failed to serialize config at {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: toml::ser::Error,
    },
    #[error("failed to create config parent directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write config file at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct HavocConfig {
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub resync_interval_secs: u64,
    /// Upper bound on concurrent apply/recover calls in one pass.
    pub max_concurrent_actions: usize,
    /// When false only `target_namespace` may be targeted.
    pub cluster_scoped: bool,
    pub target_namespace: String,
    /// Empty means every namespace not ignored.
    pub allowed_namespaces: Vec<String>,
    pub ignored_namespaces: Vec<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            resync_interval_secs: 30,
            max_concurrent_actions: 8,
            cluster_scoped: true,
            target_namespace: "havoc-testing".to_string(),
            allowed_namespaces: Vec::new(),
            ignored_namespaces: vec!["kube-system".to_string()],
        }
    }
}

impl ControllerConfig {
    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    /// Whether targets may be selected from `namespace`.
    pub fn namespace_allowed(&self, namespace: &str) -> bool {
        if !self.cluster_scoped {
            return namespace == self.target_namespace;
        }
        if self.ignored_namespaces.iter().any(|ns| ns == namespace) {
            return false;
        }
        self.allowed_namespaces.is_empty() || self.allowed_namespaces.iter().any(|ns| ns == namespace)
    }
}

/// Backoff for optimistic-concurrency retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub steps: u32,
    pub initial_backoff_ms: u64,
    pub factor: f64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            steps: 5,
            initial_backoff_ms: 10,
            factor: 1.0,
            max_backoff_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub sqlite_path: PathBuf,
    pub event_log_root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sqlite_path: PathBuf::from(".havoc/state.sqlite"),
            event_log_root: PathBuf::from(".havoc/events"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorMode {
    /// Track faults in memory only.
    #[default]
    Recording,
    /// Hand every call to an external program.
    Command,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub mode: ExecutorMode,
    /// Program and arguments, used in `command` mode.
    pub command: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            mode: ExecutorMode::Recording,
            command: Vec::new(),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

pub fn parse_config(contents: &str) -> Result<HavocConfig, toml::de::Error> {
    toml::from_str(contents)
}

pub fn load_config(path: impl AsRef<Path>) -> Result<HavocConfig, ConfigError> {
    let path_ref = path.as_ref();
    let body = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
        path: path_ref.to_path_buf(),
        source,
    })?;
    parse_config(&body).map_err(|source| ConfigError::Parse {
        path: path_ref.to_path_buf(),
        source,
    })
}

pub fn save_config(path: impl AsRef<Path>, config: &HavocConfig) -> Result<(), ConfigError> {
    let path_ref = path.as_ref();
    if let Some(parent_dir) = path_ref.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent_dir).map_err(|source| ConfigError::CreateDir {
            path: parent_dir.to_path_buf(),
            source,
        })?;
    }

    let body = toml::to_string_pretty(config).map_err(|source| ConfigError::Serialize {
        path: path_ref.to_path_buf(),
        source,
    })?;
    fs::write(path_ref, body).map_err(|source| ConfigError::Write {
        path: path_ref.to_path_buf(),
        source,
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_temp_path(file_name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "{file_name}-{}.toml",
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ))
    }

    #[test]
    fn parse_config_reads_every_section() {
        let config = parse_config(
            r#"
[controller]
resync_interval_secs = 15
max_concurrent_actions = 4
cluster_scoped = false
target_namespace = "chaos"

[retry]
steps = 3
initial_backoff_ms = 5
factor = 2.0
max_backoff_ms = 50

[storage]
sqlite_path = "/var/lib/havoc/state.sqlite"
event_log_root = "/var/lib/havoc/events"

[executor]
mode = "command"
command = ["havoc-agent", "--json"]
timeout_secs = 10

[log]
level = "debug"
"#,
        )
        .expect("parse config");

        assert_eq!(config.controller.resync_interval(), Duration::from_secs(15));
        assert_eq!(config.controller.max_concurrent_actions, 4);
        assert!(!config.controller.cluster_scoped);
        assert_eq!(config.retry.steps, 3);
        assert_eq!(config.retry.factor, 2.0);
        assert_eq!(
            config.storage.sqlite_path,
            PathBuf::from("/var/lib/havoc/state.sqlite")
        );
        assert_eq!(config.executor.mode, ExecutorMode::Command);
        assert_eq!(config.executor.command, vec!["havoc-agent", "--json"]);
        assert_eq!(config.log.level, "debug");
        // Unset fields keep their defaults.
        assert_eq!(config.controller.ignored_namespaces, vec!["kube-system"]);
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config = parse_config("").expect("parse empty config");
        assert_eq!(config, HavocConfig::default());
    }

    #[test]
    fn namespace_scoping_rules() {
        let mut controller = ControllerConfig::default();
        assert!(controller.namespace_allowed("default"));
        assert!(!controller.namespace_allowed("kube-system"));

        controller.allowed_namespaces = vec!["apps".to_string()];
        assert!(controller.namespace_allowed("apps"));
        assert!(!controller.namespace_allowed("default"));

        controller.cluster_scoped = false;
        assert!(controller.namespace_allowed("havoc-testing"));
        assert!(!controller.namespace_allowed("apps"));
    }

    #[test]
    fn save_and_load_config_roundtrip() {
        let mut config = HavocConfig::default();
        config.controller.max_concurrent_actions = 2;
        config.log.level = "warn".to_string();

        let path = unique_temp_path("havoc-config-test");
        save_config(&path, &config).expect("save config");
        let loaded = load_config(&path).expect("load config");
        assert_eq!(loaded, config);

        let _ = fs::remove_file(path);
    }

    #[test]
    fn load_config_classifies_read_and_parse_errors() {
        let missing_path = unique_temp_path("havoc-missing-config");
        let err = load_config(&missing_path).expect_err("missing file should fail");
        assert!(matches!(err, ConfigError::Read { path, .. } if path == missing_path));

        let invalid_path = unique_temp_path("havoc-invalid-config");
        fs::write(&invalid_path, "[controller\n").expect("write invalid config fixture");
        let err = load_config(&invalid_path).expect_err("invalid config should fail");
        assert!(matches!(err, ConfigError::Parse { path, .. } if path == invalid_path));
        let _ = fs::remove_file(invalid_path);
    }
}
