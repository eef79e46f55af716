//! Configuration file management for mnemo.
//!
//! Provides a TOML-based config file at `~/.config/mnemo/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use mnemo_core::dispatcher::DispatcherConfig;
use mnemo_core::federation::FederationConfig;
use mnemo_core::hub::HubConfig;
use mnemo_core::retry::{BackoffParams, RetryPolicy};
use mnemo_core::session::SessionConfig;
use mnemo_db::config::DbConfig;
use mnemo_db::models::TaskKind;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub broker: BrokerSection,
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub federation: Option<FederationSection>,
    /// Per-kind retry overrides, keyed by kind name (`retry.embedding`).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub retry: HashMap<String, RetrySection>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSection {
    pub bind_host: String,
    pub bind_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_auth_token: Option<String>,
    pub max_workers: usize,
    pub per_worker_concurrency: usize,
    pub heartbeat_interval_secs: u64,
    pub heartbeat_miss: u32,
    pub drain_timeout_secs: u64,
    pub reaper_interval_secs: u64,
    pub stale_assigned_ms: u64,
    pub retention_days: u64,
    pub event_bus_inbox: usize,
    pub stream_write_timeout_secs: u64,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            bind_host: "127.0.0.1".into(),
            bind_port: 8750,
            worker_auth_token: None,
            max_workers: 256,
            per_worker_concurrency: 4,
            heartbeat_interval_secs: 15,
            heartbeat_miss: 3,
            drain_timeout_secs: 30,
            reaper_interval_secs: 10,
            stale_assigned_ms: 30_000,
            retention_days: 7,
            event_bus_inbox: 1024,
            stream_write_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct DatabaseSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederationSection {
    /// Upstream hub worker endpoint, e.g. `ws://broker.example:8750/ws/worker`.
    pub upstream_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize)]
pub struct RetrySection {
    pub base_ms: Option<u64>,
    pub max_ms: Option<u64>,
    pub multiplier: Option<f64>,
    pub jitter: Option<f64>,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the mnemo config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/mnemo` or `~/.config/mnemo`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("mnemo");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("mnemo")
}

/// Return the path to the mnemo config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix (it may hold the worker token).
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready to wire the broker.
#[derive(Debug, Clone)]
pub struct MnemoConfig {
    pub db_config: DbConfig,
    pub bind_addr: SocketAddr,
    pub hub: HubConfig,
    pub dispatcher: DispatcherConfig,
    pub retry: RetryPolicy,
    pub event_bus_inbox: usize,
    pub stream_write_timeout: Duration,
    pub federation: Option<FederationConfig>,
}

impl MnemoConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config
    /// file > default.
    ///
    /// - DB URL: `cli_db_url` > `MNEMO_DATABASE_URL` > `database.url` >
    ///   `DbConfig::DEFAULT_URL`.
    /// - Worker auth token: `MNEMO_WORKER_AUTH_TOKEN` >
    ///   `broker.worker_auth_token` > none.
    pub fn resolve(cli_db_url: Option<&str>) -> Result<Self> {
        let file = load_config().unwrap_or_default();
        Self::from_parts(cli_db_url, file)
    }

    fn from_parts(cli_db_url: Option<&str>, file: ConfigFile) -> Result<Self> {
        let db_url = if let Some(url) = cli_db_url {
            url.to_owned()
        } else if let Ok(url) = std::env::var("MNEMO_DATABASE_URL") {
            url
        } else if let Some(url) = file.database.url {
            url
        } else {
            DbConfig::DEFAULT_URL.to_owned()
        };

        let broker = file.broker;

        let host: IpAddr = broker
            .bind_host
            .parse()
            .with_context(|| format!("invalid bind_host {:?}", broker.bind_host))?;
        let bind_addr = SocketAddr::new(host, broker.bind_port);

        let auth_token = std::env::var("MNEMO_WORKER_AUTH_TOKEN")
            .ok()
            .or(broker.worker_auth_token);

        let session = SessionConfig {
            heartbeat_interval: Duration::from_secs(broker.heartbeat_interval_secs),
            heartbeat_miss: broker.heartbeat_miss,
            drain_timeout: Duration::from_secs(broker.drain_timeout_secs),
            ..SessionConfig::default()
        };

        let hub = HubConfig {
            max_workers: broker.max_workers,
            per_worker_concurrency: broker.per_worker_concurrency,
            auth_token,
            session,
        };

        let dispatcher = DispatcherConfig {
            reaper_interval: Duration::from_secs(broker.reaper_interval_secs),
            stale_assigned: Duration::from_millis(broker.stale_assigned_ms),
            retention: Duration::from_secs(broker.retention_days * 24 * 3600),
            ..DispatcherConfig::default()
        };

        let mut retry = RetryPolicy::default();
        for (kind_name, section) in &file.retry {
            let kind: TaskKind = kind_name
                .parse()
                .with_context(|| format!("unknown task kind in retry config: {kind_name:?}"))?;
            let defaults = retry.params(kind);
            retry = retry.with_override(kind, BackoffParams {
                base_ms: section.base_ms.unwrap_or(defaults.base_ms),
                max_ms: section.max_ms.unwrap_or(defaults.max_ms),
                multiplier: section.multiplier.unwrap_or(defaults.multiplier),
                jitter: section.jitter.unwrap_or(defaults.jitter),
            });
        }

        let federation = file.federation.map(|f| {
            let mut config = FederationConfig::new(f.upstream_url);
            config.auth_token = f.auth_token;
            config
        });

        Ok(Self {
            db_config: DbConfig::new(db_url),
            bind_addr,
            hub,
            dispatcher,
            retry,
            event_bus_inbox: broker.event_bus_inbox,
            stream_write_timeout: Duration::from_secs(broker.stream_write_timeout_secs),
            federation,
        })
    }
}
