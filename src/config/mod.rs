//! # Configuration Management Module
//!
//! TOML configuration for the chainvault daemon and CLI, with validation and defaults.
//!
//! ## Configuration Structure
//!
//! - [`OrchestratorConfig`] - metadata location, lease timing, worker concurrency, retries
//! - [`TransferConfig`] - where volumes are read from and where payloads are kept
//! - [`LoggingConfig`] - log level and optional log file
//! - [`EnvironmentConfig`] / [`JobConfig`] - declared backup targets, reconciled into the
//!   metadata store at startup
//!
//! ## Usage
//!
//! ```rust,no_run
//! use chainvault::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("chainvault.toml").await?;
//!     config.validate()?;
//!     println!("metadata at {}", config.orchestrator.data_dir);
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration File Format
//!
//! ```toml
//! [orchestrator]
//! data_dir = "./data/metadata"
//! node_id = "node-1"
//! lease_ttl_secs = 30
//!
//! [transfer]
//! source_root = "./volumes"
//! repository = "./data/repository"
//!
//! [logging]
//! level = "info"
//!
//! [[environments]]
//! name = "web-1"
//! config = { root = "/srv/web-1" }
//!
//! [[environments.jobs]]
//! name = "web-1-www"
//! volume = "www"
//! schedule = "daily@02:30"
//! full_every = 7
//! retention = { keep_last = 14, max_age_hours = 720 }
//! ```

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tokio::fs;

use crate::model::RetentionPolicy;
use crate::schedule::Schedule;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Sled database holding environments, jobs, chain entries, runs and leases.
    pub data_dir: String,
    /// Owner label written into leases taken by this process.
    pub node_id: String,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,
    /// 0 disables the periodic sweep; `chainvault sweep` still works.
    #[serde(default = "default_retention_sweep_interval_secs")]
    pub retention_sweep_interval_secs: u64,
    #[serde(default = "default_transfer_attempts")]
    pub transfer_attempts: u32,
    #[serde(default = "default_transfer_retry_backoff_ms")]
    pub transfer_retry_backoff_ms: u64,
}

fn default_poll_interval_secs() -> u64 {
    15
}

fn default_lease_ttl_secs() -> u64 {
    30
}

fn default_max_concurrent_runs() -> usize {
    4
}

fn default_retention_sweep_interval_secs() -> u64 {
    3600
}

fn default_transfer_attempts() -> u32 {
    3
}

fn default_transfer_retry_backoff_ms() -> u64 {
    2000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Volumes of an environment without a `root` key live in `<source_root>/<env name>/`.
    pub source_root: String,
    pub repository: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    pub name: String,
    /// Free-form configuration blob stored with the environment.
    #[serde(default)]
    pub config: toml::Table,
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub name: String,
    pub volume: String,
    pub schedule: String,
    #[serde(default)]
    pub full_every: Option<u32>,
    #[serde(default)]
    pub retention: RetentionConfig,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default)]
    pub keep_last: Option<u32>,
    #[serde(default)]
    pub max_age_hours: Option<u64>,
}

impl From<RetentionConfig> for RetentionPolicy {
    fn from(cfg: RetentionConfig) -> Self {
        RetentionPolicy {
            keep_last: cfg.keep_last,
            max_age_hours: cfg.max_age_hours,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub orchestrator: OrchestratorConfig,
    pub transfer: TransferConfig,
    pub logging: LoggingConfig,
    #[serde(default)]
    pub environments: Vec<EnvironmentConfig>,
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let o = &self.orchestrator;
        if o.data_dir.trim().is_empty() {
            bail!("orchestrator.data_dir must not be empty");
        }
        if o.node_id.trim().is_empty() {
            bail!("orchestrator.node_id must not be empty");
        }
        if o.lease_ttl_secs == 0 {
            bail!("orchestrator.lease_ttl_secs must be greater than zero");
        }
        if o.poll_interval_secs == 0 {
            bail!("orchestrator.poll_interval_secs must be greater than zero");
        }
        if o.max_concurrent_runs == 0 {
            bail!("orchestrator.max_concurrent_runs must be at least 1");
        }

        let mut env_names = HashSet::new();
        let mut job_names = HashSet::new();
        for env in &self.environments {
            if env.name.trim().is_empty() {
                bail!("environment with empty name");
            }
            if !env_names.insert(env.name.as_str()) {
                bail!("duplicate environment name '{}'", env.name);
            }
            for job in &env.jobs {
                if !job_names.insert(job.name.as_str()) {
                    bail!("duplicate job name '{}'", job.name);
                }
                if job.volume.is_empty() || job.volume.contains('\0') {
                    bail!("job '{}' has an invalid volume", job.name);
                }
                Schedule::parse(&job.schedule)
                    .map_err(|e| anyhow!("job '{}': {}", job.name, e))?;
                if job.full_every == Some(0) {
                    bail!("job '{}': full_every must be at least 1", job.name);
                }
                if job.retention.keep_last == Some(0) {
                    bail!("job '{}': retention.keep_last must be at least 1", job.name);
                }
            }
        }
        Ok(())
    }

    pub fn lease_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.orchestrator.lease_ttl_secs.min(i64::MAX as u64) as i64)
    }
}

impl Default for Config {
    fn default() -> Self {
        let mut web_config = toml::Table::new();
        web_config.insert(
            "root".to_string(),
            toml::Value::String("./volumes/web-1".to_string()),
        );

        Config {
            orchestrator: OrchestratorConfig {
                data_dir: "./data/metadata".to_string(),
                node_id: "node-1".to_string(),
                poll_interval_secs: default_poll_interval_secs(),
                lease_ttl_secs: default_lease_ttl_secs(),
                max_concurrent_runs: default_max_concurrent_runs(),
                retention_sweep_interval_secs: default_retention_sweep_interval_secs(),
                transfer_attempts: default_transfer_attempts(),
                transfer_retry_backoff_ms: default_transfer_retry_backoff_ms(),
            },
            transfer: TransferConfig {
                source_root: "./volumes".to_string(),
                repository: "./data/repository".to_string(),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                file: Some("chainvault.log".to_string()),
            },
            environments: vec![EnvironmentConfig {
                name: "web-1".to_string(),
                config: web_config,
                jobs: vec![JobConfig {
                    name: "web-1-www".to_string(),
                    volume: "www".to_string(),
                    schedule: "daily@02:30".to_string(),
                    full_every: Some(7),
                    retention: RetentionConfig {
                        keep_last: Some(14),
                        max_age_hours: Some(720),
                    },
                }],
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn default_config_round_trips_through_toml() {
        let text = toml::to_string_pretty(&Config::default()).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.environments.len(), 1);
        assert_eq!(parsed.environments[0].jobs[0].full_every, Some(7));
        assert_eq!(
            serde_json::to_value(&parsed.environments[0].config).unwrap()["root"],
            "./volumes/web-1"
        );
    }

    #[test]
    fn optional_orchestrator_fields_default() {
        let text = r#"
            [orchestrator]
            data_dir = "/var/lib/chainvault"
            node_id = "n1"

            [transfer]
            source_root = "/srv"
            repository = "/backup"

            [logging]
            level = "debug"
        "#;
        let cfg: Config = toml::from_str(text).unwrap();
        assert_eq!(cfg.orchestrator.lease_ttl_secs, 30);
        assert_eq!(cfg.orchestrator.max_concurrent_runs, 4);
        assert!(cfg.environments.is_empty());
        assert_eq!(cfg.lease_ttl(), chrono::Duration::seconds(30));
    }

    #[test]
    fn shipped_example_is_valid() {
        let cfg: Config = toml::from_str(include_str!("../../chainvault.example.toml")).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.environments.len(), 2);
        assert!(cfg.environments[1].config.is_empty());
    }

    #[test]
    fn rejects_zero_ttl_bad_schedule_and_duplicates() {
        let mut cfg = Config::default();
        cfg.orchestrator.lease_ttl_secs = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.environments[0].jobs[0].schedule = "every tuesday".into();
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        let dup = cfg.environments[0].clone();
        cfg.environments.push(dup);
        assert!(cfg.validate().is_err());
    }

    #[tokio::test]
    async fn create_default_writes_loadable_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("chainvault.toml");
        let path = path.to_str().unwrap();
        Config::create_default(path).await.unwrap();
        let loaded = Config::load(path).await.unwrap();
        assert_eq!(loaded.orchestrator.node_id, "node-1");
    }
}
