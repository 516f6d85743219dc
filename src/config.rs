//! Configuration loader and validator for the batch-analysis pipeline.
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub queue: Queue,
    pub tunnel: Tunnel,
    pub source: Source,
    pub analysis: Analysis,
    pub tenants: Vec<Tenant>,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub poll_interval_ms: u64,
    pub sync_interval_minutes: u64,
}

/// Work-queue tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Queue {
    pub concurrency: usize,
    pub max_attempts: u32,
    pub stale_after_hours: u32,
    pub retain_hours: u32,
    pub max_backoff_seconds: u64,
}

/// SSH forwarding endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tunnel {
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub key_file: Option<String>,
    /// 0 picks an ephemeral port.
    #[serde(default)]
    pub local_port: u16,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_seconds: u64,
}

fn default_handshake_timeout() -> u64 {
    15
}

/// Source database endpoint as seen from the tunnel exit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Source {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

/// Analysis service endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Analysis {
    pub endpoint: String,
    pub token: String,
    #[serde(default = "default_analysis_timeout")]
    pub timeout_seconds: u64,
}

fn default_analysis_timeout() -> u64 {
    120
}

/// One isolated classroom instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tenant {
    pub name: String,
    pub schema: String,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }
    if cfg.app.sync_interval_minutes == 0 {
        return Err(ConfigError::Invalid("app.sync_interval_minutes must be > 0"));
    }

    if cfg.queue.concurrency == 0 {
        return Err(ConfigError::Invalid("queue.concurrency must be > 0"));
    }
    if cfg.queue.max_attempts == 0 {
        return Err(ConfigError::Invalid("queue.max_attempts must be > 0"));
    }
    if cfg.queue.stale_after_hours == 0 {
        return Err(ConfigError::Invalid("queue.stale_after_hours must be > 0"));
    }
    if cfg.queue.retain_hours == 0 {
        return Err(ConfigError::Invalid("queue.retain_hours must be > 0"));
    }

    if cfg.tunnel.host.trim().is_empty() {
        return Err(ConfigError::Invalid("tunnel.host must be non-empty"));
    }
    if cfg.tunnel.username.trim().is_empty() {
        return Err(ConfigError::Invalid("tunnel.username must be non-empty"));
    }
    let has_password = cfg
        .tunnel
        .password
        .as_deref()
        .is_some_and(|p| !p.trim().is_empty());
    let has_key = cfg
        .tunnel
        .key_file
        .as_deref()
        .is_some_and(|k| !k.trim().is_empty());
    if !has_password && !has_key {
        return Err(ConfigError::Invalid(
            "tunnel requires either password or key_file",
        ));
    }

    if cfg.source.host.trim().is_empty() {
        return Err(ConfigError::Invalid("source.host must be non-empty"));
    }
    if cfg.source.username.trim().is_empty() {
        return Err(ConfigError::Invalid("source.username must be non-empty"));
    }

    if cfg.analysis.endpoint.trim().is_empty() {
        return Err(ConfigError::Invalid("analysis.endpoint must be non-empty"));
    }
    if cfg.analysis.token.trim().is_empty() {
        return Err(ConfigError::Invalid("analysis.token must be non-empty"));
    }

    if cfg.tenants.is_empty() {
        return Err(ConfigError::Invalid("tenants must list at least one tenant"));
    }
    let mut seen = HashSet::new();
    for tenant in &cfg.tenants {
        if tenant.name.trim().is_empty() {
            return Err(ConfigError::Invalid("tenants[].name must be non-empty"));
        }
        if !seen.insert(tenant.name.as_str()) {
            return Err(ConfigError::Invalid("tenants[].name must be unique"));
        }
        // Schema names are spliced into source-side SQL, so keep them to a
        // safe identifier alphabet.
        if tenant.schema.is_empty()
            || !tenant
                .schema
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(ConfigError::Invalid(
                "tenants[].schema must be a plain identifier",
            ));
        }
    }

    Ok(())
}

/// Canonical example configuration used by tests.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  poll_interval_ms: 500
  sync_interval_minutes: 360

queue:
  concurrency: 2
  max_attempts: 3
  stale_after_hours: 4
  retain_hours: 24
  max_backoff_seconds: 3600

tunnel:
  host: "bastion.example.edu"
  port: 22
  username: "pulse"
  password: "YOUR_SSH_PASSWORD"
  local_port: 0

source:
  host: "lms-db.internal"
  port: 3306
  username: "pulse_ro"
  password: "YOUR_DB_PASSWORD"

analysis:
  endpoint: "https://analysis.example.edu/v1/analyze"
  token: "YOUR_ANALYSIS_TOKEN"

tenants:
  - name: "campus-a"
    schema: "lms_campus_a"
  - name: "campus-b"
    schema: "lms_campus_b"
"#
}
