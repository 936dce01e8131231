//! Configuration loading (spec §6). Layered the way `farmctl` loads TOML and
//! `node-forwarder/src/config.rs` loads env vars: a `--config <file>` TOML document
//! deserialized with serde, then individual scalar fields overridable by env vars so a
//! single field can be bumped from a Kubernetes Deployment without a new ConfigMap.

use crate::error::{AgentError, Result};
use regex::Regex;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RawConfig {
    pub organization_id: Option<String>,
    pub cloud_account_id: Option<String>,
    pub region: Option<String>,
    pub cluster_name: Option<String>,
    pub storage_path: Option<String>,
    pub max_records: Option<u64>,
    pub compression_level: Option<u8>,
    pub cost_max_interval: Option<u64>,
    pub observability_max_interval: Option<u64>,
    pub available_storage: Option<u64>,
    pub purge_rules: RawPurgeRules,
    pub cloudzero: RawCloudzero,
    pub server: RawServer,
    pub logging: RawLogging,
    pub filters: RawFilters,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RawPurgeRules {
    pub metrics_older_than: Option<u64>,
    pub lazy: Option<bool>,
    pub percent: Option<u8>,
    pub tracker_grace: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RawCloudzero {
    pub host: Option<String>,
    pub use_http: Option<bool>,
    pub send_interval: Option<u64>,
    pub send_timeout: Option<u64>,
    pub rotate_interval: Option<u64>,
    pub http_max_retries: Option<u32>,
    pub http_max_wait: Option<u64>,
    pub api_key_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RawServer {
    pub port: Option<u16>,
    pub mode: Option<String>,
    pub reconnect_frequency: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RawLogging {
    pub level: Option<String>,
    pub capture: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RawFilters {
    pub cost: Vec<String>,
    pub observability: Vec<String>,
    pub cost_labels: Vec<String>,
    pub observability_labels: Vec<String>,
}

/// Fully resolved configuration, defaults applied, patterns compiled. Missing/invalid
/// values are a `ConfigError`, fatal at startup (spec §7).
#[derive(Debug, Clone)]
pub struct Config {
    pub organization_id: String,
    pub cloud_account_id: String,
    pub region: String,
    pub cluster_name: String,
    pub storage_path: PathBuf,
    pub max_records: u64,
    pub compression_level: u8,
    pub cost_max_interval: Duration,
    pub observability_max_interval: Duration,
    pub available_storage: u64,
    pub purge_rules: PurgeRules,
    pub cloudzero: CloudzeroConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub filters: FilterConfig,
}

#[derive(Debug, Clone)]
pub struct PurgeRules {
    pub metrics_older_than: Duration,
    pub lazy: bool,
    pub percent: u8,
    pub tracker_grace: Duration,
}

#[derive(Debug, Clone)]
pub struct CloudzeroConfig {
    pub host: String,
    pub use_http: bool,
    pub send_interval: Duration,
    pub send_timeout: Duration,
    pub rotate_interval: Duration,
    pub http_max_retries: u32,
    pub http_max_wait: Duration,
    pub api_key_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub mode: ServerMode,
    /// 0 means "never close" (spec §9 open question, resolved per its inline comment).
    pub reconnect_frequency: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerMode {
    Http,
    Https,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub capture: bool,
}

/// Compiled classifier patterns (spec §4.2). Insertion order preserved; evaluated
/// linearly, matching spec §9's design note ("N is small in practice").
#[derive(Clone)]
pub struct FilterConfig {
    pub cost: Vec<Regex>,
    pub observability: Vec<Regex>,
    pub cost_labels: Vec<Regex>,
    pub observability_labels: Vec<Regex>,
}

impl std::fmt::Debug for FilterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterConfig")
            .field("cost", &self.cost.len())
            .field("observability", &self.observability.len())
            .field("cost_labels", &self.cost_labels.len())
            .field("observability_labels", &self.observability_labels.len())
            .finish()
    }
}

impl Config {
    /// Load and merge zero or more TOML files (later files override earlier ones at
    /// the field level), then apply env var overrides, then defaults.
    pub fn load(config_paths: &[PathBuf]) -> Result<Self> {
        let mut raw = RawConfig::default();
        for path in config_paths {
            let merged = load_one(path)?;
            raw = merge(raw, merged);
        }
        apply_env_overrides(&mut raw);
        resolve(raw)
    }
}

fn load_one(path: &Path) -> Result<RawConfig> {
    let data = std::fs::read_to_string(path)
        .map_err(|err| AgentError::Config(format!("reading {}: {err}", path.display())))?;
    toml::from_str(&data)
        .map_err(|err| AgentError::Config(format!("parsing {}: {err}", path.display())))
}

fn merge(base: RawConfig, over: RawConfig) -> RawConfig {
    RawConfig {
        organization_id: over.organization_id.or(base.organization_id),
        cloud_account_id: over.cloud_account_id.or(base.cloud_account_id),
        region: over.region.or(base.region),
        cluster_name: over.cluster_name.or(base.cluster_name),
        storage_path: over.storage_path.or(base.storage_path),
        max_records: over.max_records.or(base.max_records),
        compression_level: over.compression_level.or(base.compression_level),
        cost_max_interval: over.cost_max_interval.or(base.cost_max_interval),
        observability_max_interval: over.observability_max_interval.or(base.observability_max_interval),
        available_storage: over.available_storage.or(base.available_storage),
        purge_rules: RawPurgeRules {
            metrics_older_than: over.purge_rules.metrics_older_than.or(base.purge_rules.metrics_older_than),
            lazy: over.purge_rules.lazy.or(base.purge_rules.lazy),
            percent: over.purge_rules.percent.or(base.purge_rules.percent),
            tracker_grace: over.purge_rules.tracker_grace.or(base.purge_rules.tracker_grace),
        },
        cloudzero: RawCloudzero {
            host: over.cloudzero.host.or(base.cloudzero.host),
            use_http: over.cloudzero.use_http.or(base.cloudzero.use_http),
            send_interval: over.cloudzero.send_interval.or(base.cloudzero.send_interval),
            send_timeout: over.cloudzero.send_timeout.or(base.cloudzero.send_timeout),
            rotate_interval: over.cloudzero.rotate_interval.or(base.cloudzero.rotate_interval),
            http_max_retries: over.cloudzero.http_max_retries.or(base.cloudzero.http_max_retries),
            http_max_wait: over.cloudzero.http_max_wait.or(base.cloudzero.http_max_wait),
            api_key_path: over.cloudzero.api_key_path.or(base.cloudzero.api_key_path),
        },
        server: RawServer {
            port: over.server.port.or(base.server.port),
            mode: over.server.mode.or(base.server.mode),
            reconnect_frequency: over.server.reconnect_frequency.or(base.server.reconnect_frequency),
        },
        logging: RawLogging {
            level: over.logging.level.or(base.logging.level),
            capture: over.logging.capture.or(base.logging.capture),
        },
        filters: if over.filters.cost.is_empty()
            && over.filters.observability.is_empty()
            && over.filters.cost_labels.is_empty()
            && over.filters.observability_labels.is_empty()
        {
            base.filters
        } else {
            over.filters
        },
    }
}

fn apply_env_overrides(raw: &mut RawConfig) {
    if let Some(v) = env_string("CZ_CLOUD_ACCOUNT_ID") {
        raw.cloud_account_id = Some(v);
    }
    if let Some(v) = env_string("CZ_REGION") {
        raw.region = Some(v);
    }
    if let Some(v) = env_string("CZ_CLUSTER_NAME") {
        raw.cluster_name = Some(v);
    }
    if let Some(v) = env_string("CZ_STORAGE_PATH") {
        raw.storage_path = Some(v);
    }
    if let Some(v) = env_u64("CZ_MAX_RECORDS") {
        raw.max_records = Some(v);
    }
    if let Some(v) = env_string("CZ_CLOUDZERO_HOST") {
        raw.cloudzero.host = Some(v);
    }
    if let Some(v) = env_string("CZ_CLOUDZERO_API_KEY_PATH") {
        raw.cloudzero.api_key_path = Some(v);
    }
    if let Some(v) = env_string("CZ_LOGGING_LEVEL") {
        raw.logging.level = Some(v);
    }
}

fn env_string(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn env_u64(key: &str) -> Option<u64> {
    env_string(key).and_then(|v| v.parse().ok())
}

fn resolve(raw: RawConfig) -> Result<Config> {
    let storage_path = PathBuf::from(raw.storage_path.unwrap_or_else(|| "/var/lib/cost-agent".to_string()));

    let compression_level = raw.compression_level.unwrap_or(8);
    if compression_level > 11 {
        return Err(AgentError::Config(format!(
            "compression_level must be 0-11, got {compression_level}"
        )));
    }

    let percent = raw.purge_rules.percent.unwrap_or(20);
    if percent > 100 {
        return Err(AgentError::Config(format!("purge_rules.percent must be 0-100, got {percent}")));
    }

    let mode = match raw.server.mode.as_deref().unwrap_or("http") {
        "http" => ServerMode::Http,
        "https" => ServerMode::Https,
        other => return Err(AgentError::Config(format!("server.mode must be http or https, got {other}"))),
    };

    let cost = compile_patterns(&raw.filters.cost)?;
    let observability = compile_patterns(&raw.filters.observability)?;
    let cost_labels = compile_patterns(&raw.filters.cost_labels)?;
    let observability_labels = compile_patterns(&raw.filters.observability_labels)?;

    Ok(Config {
        organization_id: raw.organization_id.unwrap_or_default(),
        cloud_account_id: raw.cloud_account_id.unwrap_or_default(),
        region: raw.region.unwrap_or_default(),
        cluster_name: raw.cluster_name.unwrap_or_default(),
        storage_path,
        max_records: raw.max_records.unwrap_or(1_500_000),
        compression_level,
        cost_max_interval: Duration::from_secs(raw.cost_max_interval.unwrap_or(600)),
        observability_max_interval: Duration::from_secs(raw.observability_max_interval.unwrap_or(1800)),
        available_storage: raw.available_storage.unwrap_or(0),
        purge_rules: PurgeRules {
            metrics_older_than: Duration::from_secs(raw.purge_rules.metrics_older_than.unwrap_or(168 * 3600)),
            lazy: raw.purge_rules.lazy.unwrap_or(true),
            percent,
            tracker_grace: Duration::from_secs(raw.purge_rules.tracker_grace.unwrap_or(3600)),
        },
        cloudzero: CloudzeroConfig {
            host: raw.cloudzero.host.unwrap_or_default(),
            use_http: raw.cloudzero.use_http.unwrap_or(false),
            send_interval: Duration::from_secs(raw.cloudzero.send_interval.unwrap_or(600)),
            send_timeout: Duration::from_secs(raw.cloudzero.send_timeout.unwrap_or(120)),
            rotate_interval: Duration::from_secs(raw.cloudzero.rotate_interval.unwrap_or(1800)),
            http_max_retries: raw.cloudzero.http_max_retries.unwrap_or(10),
            http_max_wait: Duration::from_secs(raw.cloudzero.http_max_wait.unwrap_or(30)),
            api_key_path: PathBuf::from(raw.cloudzero.api_key_path.unwrap_or_default()),
        },
        server: ServerConfig {
            port: raw.server.port.unwrap_or(8080),
            mode,
            reconnect_frequency: raw.server.reconnect_frequency.unwrap_or(16),
        },
        logging: LoggingConfig {
            level: raw.logging.level.unwrap_or_else(|| "info".to_string()),
            capture: raw.logging.capture.unwrap_or(false),
        },
        filters: FilterConfig {
            cost,
            observability,
            cost_labels,
            observability_labels,
        },
    })
}

fn compile_patterns(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| Regex::new(p).map_err(|err| AgentError::Config(format!("invalid pattern {p:?}: {err}"))))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_compression_level() {
        let raw = RawConfig {
            compression_level: Some(12),
            ..Default::default()
        };
        assert!(resolve(raw).is_err());
    }

    #[test]
    fn rejects_invalid_regex() {
        let raw = RawConfig {
            filters: RawFilters {
                cost: vec!["(unclosed".to_string()],
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(resolve(raw).is_err());
    }

    #[test]
    fn defaults_match_spec() {
        let cfg = resolve(RawConfig::default()).unwrap();
        assert_eq!(cfg.max_records, 1_500_000);
        assert_eq!(cfg.compression_level, 8);
        assert_eq!(cfg.purge_rules.percent, 20);
        assert_eq!(cfg.server.reconnect_frequency, 16);
    }
}
