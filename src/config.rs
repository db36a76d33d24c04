use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::gateway::GatewayKind;

/// Top-level configuration for the traffic agent.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Collector API base URL (e.g., "http://localhost:3000/api").
    #[serde(default)]
    pub server_api_base: String,

    /// Backend identifier this agent reports under.
    #[serde(default)]
    pub backend_id: i64,

    /// Pre-issued bearer token for the collector API.
    #[serde(default)]
    pub backend_token: String,

    /// Identifies this agent instance in reports and heartbeats.
    #[serde(default)]
    pub agent_id: String,

    /// Gateway connection configuration.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// How often to push pending updates to the collector. Default: 10s.
    #[serde(default = "default_report_interval", with = "humantime_serde")]
    pub report_interval: Duration,

    /// How often to send a liveness heartbeat. Default: 30s.
    #[serde(default = "default_heartbeat_interval", with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// How often to poll the gateway for connection counters. Default: 2s.
    #[serde(default = "default_gateway_poll_interval", with = "humantime_serde")]
    pub gateway_poll_interval: Duration,

    /// Per-call timeout for gateway and collector requests. Default: 5s.
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Maximum updates per report transmission. Default: 100.
    #[serde(default = "default_report_batch_size")]
    pub report_batch_size: usize,

    /// Pending queue bound; oldest updates are dropped beyond it. Default: 1000.
    #[serde(default = "default_max_pending_updates")]
    pub max_pending_updates: usize,

    /// Flows unseen for longer than this are evicted. Default: 60s.
    #[serde(default = "default_stale_flow_timeout", with = "humantime_serde")]
    pub stale_flow_timeout: Duration,

    /// Emit diagnostic logging. Default: true.
    #[serde(default = "default_true")]
    pub log_enabled: bool,
}

/// Gateway connection configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayConfig {
    /// Gateway API dialect.
    #[serde(default)]
    pub kind: GatewayKind,

    /// Gateway introspection endpoint
    /// (e.g., "http://127.0.0.1:9091/v1/requests/recent").
    #[serde(default)]
    pub endpoint: String,

    /// Gateway API key, if the gateway requires one.
    #[serde(default)]
    pub token: String,
}

fn default_report_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_gateway_poll_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_report_batch_size() -> usize {
    100
}

fn default_max_pending_updates() -> usize {
    1000
}

fn default_stale_flow_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.server_api_base.is_empty() {
            bail!("server_api_base is required");
        }

        if self.backend_token.is_empty() {
            bail!("backend_token is required");
        }

        if self.agent_id.is_empty() {
            bail!("agent_id is required");
        }

        if self.gateway.endpoint.is_empty() {
            bail!("gateway.endpoint is required");
        }

        if self.report_interval.is_zero() {
            bail!("report_interval must be positive");
        }

        if self.heartbeat_interval.is_zero() {
            bail!("heartbeat_interval must be positive");
        }

        if self.gateway_poll_interval.is_zero() {
            bail!("gateway_poll_interval must be positive");
        }

        if self.request_timeout.is_zero() {
            bail!("request_timeout must be positive");
        }

        if self.report_batch_size == 0 {
            bail!("report_batch_size must be positive");
        }

        if self.max_pending_updates == 0 {
            bail!("max_pending_updates must be positive");
        }

        if self.stale_flow_timeout.is_zero() {
            bail!("stale_flow_timeout must be positive");
        }

        Ok(())
    }
}
