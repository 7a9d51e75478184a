//! Client configuration.
//!
//! Stored as JSON at `~/.config/jupyter-remote/config.json` (platform config
//! dir). Every field has a default, so a partial file or no file at all is
//! valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::backoff::ReconnectPolicy;
use crate::server_connection::ServerSettings;

/// Environment variable overriding [`ClientConfig::base_url`].
pub const SERVER_URL_ENV: &str = "JUPYTER_SERVER_URL";
/// Environment variable overriding [`ClientConfig::token`].
pub const TOKEN_ENV: &str = "JUPYTER_TOKEN";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL of the Jupyter server, e.g. `http://localhost:8888/`.
    pub base_url: String,
    /// WebSocket base URL. Derived from `base_url` when unset.
    pub ws_url: Option<String>,
    pub token: Option<String>,
    /// Header that carries `token <token>` on every request.
    pub auth_header: String,
    pub http_timeout_ms: u64,
    pub reconnect: ReconnectConfig,
    pub heartbeat: HeartbeatConfig,
    /// Default deadline for shell requests. Unset means no deadline.
    pub request_timeout_ms: Option<u64>,
    pub handshake_timeout_ms: u64,
    /// How long a request dispatched before a disconnect may stay pending.
    pub lost_request_grace_ms: u64,
    pub kernel_poll_interval_ms: u64,
    pub kernel_poll_max_ms: u64,
    pub kernelspec_ttl_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8888/".to_string(),
            ws_url: None,
            token: None,
            auth_header: "Authorization".to_string(),
            http_timeout_ms: 30_000,
            reconnect: ReconnectConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            request_timeout_ms: None,
            handshake_timeout_ms: 30_000,
            lost_request_grace_ms: 30_000,
            kernel_poll_interval_ms: 10_000,
            kernel_poll_max_ms: 300_000,
            kernelspec_ttl_ms: 600_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        let policy = ReconnectPolicy::default();
        Self {
            base_delay_ms: policy.base_delay.as_millis() as u64,
            multiplier: policy.multiplier,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            max_attempts: policy.max_attempts,
            jitter: policy.jitter,
        }
    }
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(config: &ReconnectConfig) -> Self {
        ReconnectPolicy {
            base_delay: Duration::from_millis(config.base_delay_ms),
            multiplier: config.multiplier,
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter,
            max_attempts: config.max_attempts,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Ping period. Zero disables the heartbeat.
    pub interval_ms: u64,
    pub max_missed: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: 10_000,
            max_missed: 3,
        }
    }
}

/// WebSocket ping schedule for detecting half-open sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatPolicy {
    pub interval: Duration,
    /// Unanswered pings tolerated before the socket is declared dead.
    pub max_missed: u32,
}

/// Runtime settings for one [`KernelConnection`](crate::KernelConnection).
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub reconnect: ReconnectPolicy,
    pub heartbeat: Option<HeartbeatPolicy>,
    pub request_timeout: Option<Duration>,
    pub handshake_timeout: Duration,
    pub lost_request_grace: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ClientConfig::default().connection_config()
    }
}

impl ClientConfig {
    pub fn server_settings(&self) -> crate::Result<ServerSettings> {
        let base_url = Url::parse(&self.base_url)?;
        let ws_url = self.ws_url.as_deref().map(Url::parse).transpose()?;
        let mut settings = ServerSettings::new(base_url)?;
        if let Some(ws_url) = ws_url {
            settings = settings.with_ws_url(ws_url)?;
        }
        settings.token = self.token.clone();
        settings.auth_header = self.auth_header.clone();
        settings.timeout = Duration::from_millis(self.http_timeout_ms);
        Ok(settings)
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        let heartbeat = (self.heartbeat.interval_ms > 0).then(|| HeartbeatPolicy {
            interval: Duration::from_millis(self.heartbeat.interval_ms),
            max_missed: self.heartbeat.max_missed.max(1),
        });
        ConnectionConfig {
            reconnect: ReconnectPolicy::from(&self.reconnect),
            heartbeat,
            request_timeout: self.request_timeout_ms.map(Duration::from_millis),
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            lost_request_grace: Duration::from_millis(self.lost_request_grace_ms),
        }
    }

    pub fn kernel_poll_interval(&self) -> Duration {
        Duration::from_millis(self.kernel_poll_interval_ms)
    }

    pub fn kernel_poll_max(&self) -> Duration {
        Duration::from_millis(self.kernel_poll_max_ms)
    }

    pub fn kernelspec_ttl(&self) -> Duration {
        Duration::from_millis(self.kernelspec_ttl_ms)
    }

    /// Apply `JUPYTER_SERVER_URL` and `JUPYTER_TOKEN` when they are set.
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var(SERVER_URL_ENV) {
            if !url.is_empty() {
                self.base_url = url;
            }
        }
        if let Ok(token) = std::env::var(TOKEN_ENV) {
            if !token.is_empty() {
                self.token = Some(token);
            }
        }
    }
}

/// Default location of the config file.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("jupyter-remote")
        .join("config.json")
}

/// Load a config file, returning defaults if it is missing or unreadable.
pub fn load_config(path: &Path) -> ClientConfig {
    if !path.exists() {
        return ClientConfig::default();
    }
    match std::fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
            log::warn!(
                "[config] Ignoring unparseable config {}: {}",
                path.display(),
                e
            );
            ClientConfig::default()
        }),
        Err(e) => {
            log::warn!("[config] Failed to read {}: {}", path.display(), e);
            ClientConfig::default()
        }
    }
}

pub fn save_config(path: &Path, config: &ClientConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(config)?)?;
    Ok(())
}
