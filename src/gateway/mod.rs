pub mod decode;

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::debug;

use crate::config::GatewayConfig;
use crate::domain::FlowSnapshot;

/// Gateway API dialect. A closed set; adding a dialect means adding a
/// variant here and a decoder in [`decode`], callers are untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayKind {
    #[default]
    Surge,
    Clash,
}

impl GatewayKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayKind::Surge => "surge",
            GatewayKind::Clash => "clash",
        }
    }
}

impl fmt::Display for GatewayKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP client for a gateway's connection-listing endpoint.
///
/// Stateless between calls; safe to invoke on every poll tick.
pub struct Client {
    http: reqwest::Client,
    kind: GatewayKind,
    endpoint: String,
    token: String,
}

impl Client {
    /// Create a new gateway client with the given per-request timeout.
    pub fn new(cfg: &GatewayConfig, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building gateway HTTP client")?;

        Ok(Self {
            http,
            kind: cfg.kind,
            endpoint: cfg.endpoint.clone(),
            token: cfg.token.clone(),
        })
    }

    /// Fetch the current connection list and decode it into snapshots.
    pub async fn collect(&self) -> Result<Vec<FlowSnapshot>> {
        debug!(kind = %self.kind, "polling gateway");

        let mut request = self
            .http
            .get(&self.endpoint)
            .header("Accept", "application/json");

        // Surge expects its API key in an x-key header; Clash uses a
        // standard bearer token.
        if !self.token.is_empty() {
            request = match self.kind {
                GatewayKind::Surge => request.header("x-key", &self.token),
                GatewayKind::Clash => request.bearer_auth(&self.token),
            };
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("requesting {}", self.endpoint))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!(
                "unexpected status {} from {} gateway: {}",
                status,
                self.kind,
                body
            );
        }

        let body = response
            .bytes()
            .await
            .with_context(|| format!("reading {} response body", self.kind))?;

        decode::decode_snapshots(self.kind, &body, unix_ms())
    }
}

/// Current wall-clock time in epoch milliseconds.
pub fn unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
