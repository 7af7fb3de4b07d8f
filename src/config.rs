//! Global settings for dbfleet.
//!
//! # Resolution
//!
//! The settings file is looked up in this order:
//! 1. `--config <path>`
//! 2. `DBFLEET_CONFIG` environment variable
//! 3. `~/.config/dbfleet/config.toml`
//!
//! An explicitly named file must exist. The default location is optional;
//! every field has a default.

use crate::transport::SshOptions;
use anyhow::{Context, Result};
use fleetkit::{CallPolicy, RetryConfig, Settings};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the settings file
pub const ENV_CONFIG: &str = "DBFLEET_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding `<environment>.toml` inventory files
    pub inventory_dir: String,
    /// Root of the backup store
    pub backup_root: String,
    pub max_concurrency: usize,
    /// Node-side staging directory for dumps and restores
    pub remote_staging_dir: String,
    pub command_timeout_secs: u64,
    pub barrier_timeout_secs: u64,
    pub health_poll_interval_ms: u64,
    pub disk_warn_percent: u8,
    pub retry: RetrySettings,
    pub ssh: SshSettings,
}

impl Default for Config {
    fn default() -> Self {
        let settings = Settings::default();
        Self {
            inventory_dir: "~/.config/dbfleet/inventory".to_string(),
            backup_root: "~/.local/share/dbfleet/backups".to_string(),
            max_concurrency: settings.max_concurrency,
            remote_staging_dir: settings.remote_staging_dir,
            command_timeout_secs: settings.call_policy.timeout.as_secs(),
            barrier_timeout_secs: settings.barrier_timeout.as_secs(),
            health_poll_interval_ms: settings.health_poll_interval.as_millis() as u64,
            disk_warn_percent: settings.disk_warn_percent,
            retry: RetrySettings::default(),
            ssh: SshSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let retry = RetryConfig::default();
        Self {
            max_attempts: retry.max_attempts,
            base_delay_ms: retry.base_delay.as_millis() as u64,
            backoff_factor: retry.backoff_factor,
            max_delay_ms: retry.max_delay.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshSettings {
    pub binary: String,
    pub scp_binary: String,
    /// Extra `-o` options
    pub options: Vec<String>,
}

impl Default for SshSettings {
    fn default() -> Self {
        let ssh = SshOptions::default();
        Self {
            binary: ssh.binary,
            scp_binary: ssh.scp_binary,
            options: vec!["ConnectTimeout=10".to_string()],
        }
    }
}

impl Config {
    /// Load settings following the resolution order above.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load_from(path);
        }
        if let Ok(path) = std::env::var(ENV_CONFIG) {
            return Self::load_from(&expand_path(&path));
        }

        match default_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => {
                log::debug!("No settings file; using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Could not read {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Invalid settings in {}", path.display()))?;
        log::debug!("Loaded settings from {}", path.display());
        config.validate().with_context(|| format!("Invalid settings in {}", path.display()))?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            anyhow::bail!("max_concurrency must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be at least 1");
        }
        if self.disk_warn_percent > 100 {
            anyhow::bail!("disk_warn_percent must be between 0 and 100");
        }
        Ok(())
    }

    pub fn inventory_path(&self) -> PathBuf {
        expand_path(&self.inventory_dir)
    }

    pub fn backup_root_path(&self) -> PathBuf {
        expand_path(&self.backup_root)
    }

    /// Engine settings derived from this file.
    pub fn settings(&self) -> Settings {
        Settings {
            max_concurrency: self.max_concurrency,
            call_policy: CallPolicy {
                timeout: Duration::from_secs(self.command_timeout_secs),
                retry: RetryConfig {
                    max_attempts: self.retry.max_attempts,
                    base_delay: Duration::from_millis(self.retry.base_delay_ms),
                    backoff_factor: self.retry.backoff_factor,
                    max_delay: Duration::from_millis(self.retry.max_delay_ms),
                },
            },
            barrier_timeout: Duration::from_secs(self.barrier_timeout_secs),
            health_poll_interval: Duration::from_millis(self.health_poll_interval_ms),
            remote_staging_dir: self.remote_staging_dir.clone(),
            disk_warn_percent: self.disk_warn_percent,
        }
    }

    pub fn ssh_options(&self) -> SshOptions {
        SshOptions {
            binary: self.ssh.binary.clone(),
            scp_binary: self.ssh.scp_binary.clone(),
            options: self.ssh.options.clone(),
        }
    }
}

/// `~/.config/dbfleet/config.toml`
pub fn default_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".config").join("dbfleet").join("config.toml"))
}

/// Expand `~` and environment variables in a path.
pub fn expand_path(path: &str) -> PathBuf {
    let expanded = shellexpand::full(path).unwrap_or(std::borrow::Cow::Borrowed(path));
    PathBuf::from(expanded.as_ref())
}
