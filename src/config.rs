//! Configuration management for the orchestrator.
//!
//! Loads configuration from a TOML file with CLI/environment overrides.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::state::StateKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub repository: RepositoryConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub hooks: HooksConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Repository location (local path or `user@host:path`).
    pub url: String,

    /// Encryption passphrase. Usually left unset and supplied via the
    /// BORG_PASSPHRASE environment variable or an interactive prompt.
    #[serde(default)]
    pub passphrase: Option<String>,

    /// SSH identity file for remote repositories.
    #[serde(default)]
    pub ssh_key: Option<PathBuf>,

    /// Archive engine binary.
    #[serde(default = "default_engine_binary")]
    pub engine_binary: String,

    /// Initialize the repository on first use if it does not exist yet.
    #[serde(default = "default_true")]
    pub auto_init: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Paths archived by default when none are given on the command line.
    #[serde(default = "default_target_paths")]
    pub target_paths: Vec<PathBuf>,

    /// Always excluded from archives (pseudo-filesystems, caches, swap).
    #[serde(default = "default_base_excludes")]
    pub base_excludes: Vec<String>,

    /// Additionally excluded in full mode: machine identity and volatile
    /// files that must not follow the archive to another host.
    #[serde(default = "default_identity_excludes")]
    pub identity_excludes: Vec<String>,

    /// Never overwritten on restore.
    #[serde(default = "default_restore_excludes")]
    pub restore_excludes: Vec<String>,

    /// Compression passed to the engine.
    #[serde(default = "default_compression")]
    pub compression: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HooksConfig {
    /// Container runtime units stopped around the capture window, in order.
    #[serde(default = "default_container_units")]
    pub container_units: Vec<String>,

    /// Seconds to let a unit settle after stop / after start.
    #[serde(default = "default_stop_settle_secs")]
    pub stop_settle_secs: u64,
    #[serde(default = "default_start_settle_secs")]
    pub start_settle_secs: u64,

    /// Dump and restore live database contents (MySQL/PostgreSQL clients
    /// are probed at runtime; absent clients are skipped).
    #[serde(default = "default_true")]
    pub database: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// Directory inside the backup source tree holding state snapshots and
    /// staged database dumps.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// State kinds captured and reapplied.
    #[serde(default = "default_state_kinds")]
    pub kinds: Vec<StateKind>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts for transport-class archive errors (list/extract/probe).
    /// Archive creation is never retried.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay for exponential backoff.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Optional log file, appended to in addition to stderr.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

// Default values
fn default_engine_binary() -> String {
    "borg".to_string()
}

fn default_true() -> bool {
    true
}

fn default_target_paths() -> Vec<PathBuf> {
    vec![PathBuf::from("/")]
}

fn default_base_excludes() -> Vec<String> {
    [
        "/dev/**",
        "/proc/**",
        "/sys/**",
        "/run/**",
        "/tmp/**",
        "/mnt/**",
        "/media/**",
        "/lost+found",
        "/var/cache/apt/archives/**",
        "/swapfile",
        "/swap.img",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_identity_excludes() -> Vec<String> {
    [
        "/etc/machine-id",
        "/var/lib/dbus/machine-id",
        "/etc/hostname",
        "/etc/hosts",
        "/etc/fstab",
        "/etc/ssh/ssh_host_*",
        "/etc/netplan/**",
        "/etc/network/interfaces*",
        "/etc/udev/rules.d/70-persistent-net.rules",
        "/var/tmp/systemd-private-*/**",
        "/tmp/systemd-private-*/**",
        "**/*.log",
        "/var/log/**",
        "/var/log/journal/**",
        "/run/log/**",
        "/var/cache/**",
        "**/__pycache__/**",
        "**/.cache/**",
        "**/*.pid",
        "**/*.sock",
        "/var/lib/dpkg/lock*",
        "/var/lib/apt/lists/lock",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_restore_excludes() -> Vec<String> {
    [
        "etc/machine-id",
        "var/lib/dbus/machine-id",
        "etc/fstab",
        "etc/ssh/ssh_host_*",
        "etc/hostname",
        "etc/netplan",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_compression() -> String {
    "zstd,6".to_string()
}

fn default_container_units() -> Vec<String> {
    vec!["docker".to_string()]
}

fn default_stop_settle_secs() -> u64 {
    2
}

fn default_start_settle_secs() -> u64 {
    3
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/host-backup/state")
}

fn default_state_kinds() -> Vec<StateKind> {
    vec![StateKind::Packages, StateKind::Services, StateKind::Cron]
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            target_paths: default_target_paths(),
            base_excludes: default_base_excludes(),
            identity_excludes: default_identity_excludes(),
            restore_excludes: default_restore_excludes(),
            compression: default_compression(),
        }
    }
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            container_units: default_container_units(),
            stop_settle_secs: default_stop_settle_secs(),
            start_settle_secs: default_start_settle_secs(),
            database: true,
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            kinds: default_state_kinds(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Configuration for a repository URL with everything else defaulted.
    pub fn with_repository(url: String) -> Self {
        Config {
            repository: RepositoryConfig {
                url,
                passphrase: None,
                ssh_key: None,
                engine_binary: default_engine_binary(),
                auto_init: true,
            },
            backup: BackupConfig::default(),
            hooks: HooksConfig::default(),
            state: StateConfig::default(),
            retry: RetryConfig::default(),
            log: LogConfig::default(),
        }
    }

    /// Resolve the passphrase: CLI flag, config file, environment, then an
    /// interactive prompt as the last resort.
    pub fn resolve_passphrase(&self, flag: Option<String>) -> anyhow::Result<String> {
        if let Some(p) = flag {
            return Ok(p);
        }
        if let Some(p) = &self.repository.passphrase {
            return Ok(p.clone());
        }
        if let Ok(p) = std::env::var("BORG_PASSPHRASE") {
            return Ok(p);
        }
        let p = rpassword::prompt_password("Repository passphrase: ")?;
        Ok(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config_with_defaults() {
        let toml_str = r#"
            [repository]
            url = "ssh://backup@vault/./host"
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.repository.url, "ssh://backup@vault/./host");
        assert_eq!(config.repository.engine_binary, "borg");
        assert!(config.repository.auto_init);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.state.kinds.len(), 3);
        assert!(config
            .backup
            .base_excludes
            .iter()
            .any(|e| e == "/proc/**"));
    }

    #[test]
    fn sections_can_be_overridden() {
        let toml_str = r#"
            [repository]
            url = "/srv/backup"
            auto_init = false

            [retry]
            max_attempts = 5
            base_delay_ms = 100

            [hooks]
            container_units = ["docker", "containerd"]

            [state]
            kinds = ["packages"]
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert!(!config.repository.auto_init);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.hooks.container_units.len(), 2);
        assert_eq!(config.state.kinds, vec![StateKind::Packages]);
    }
}
