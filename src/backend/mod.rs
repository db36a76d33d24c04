use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tracing::debug;

use crate::domain::TrafficUpdate;
use crate::gateway::unix_ms;

/// Collector API client. Pushes traffic update batches and heartbeats,
/// authenticated with the pre-issued backend token.
#[derive(Clone)]
pub struct Client {
    http: reqwest::Client,
    api_base: String,
    token: String,
    backend_id: i64,
    agent_id: String,
}

#[derive(Serialize)]
struct ReportRequest<'a> {
    #[serde(rename = "backendId")]
    backend_id: i64,
    #[serde(rename = "agentId")]
    agent_id: &'a str,
    updates: &'a [TrafficUpdate],
}

#[derive(Serialize)]
struct HeartbeatRequest<'a> {
    #[serde(rename = "backendId")]
    backend_id: i64,
    #[serde(rename = "agentId")]
    agent_id: &'a str,
    #[serde(rename = "timestampMs")]
    timestamp_ms: i64,
}

impl Client {
    /// Create a new collector client with the given per-request timeout.
    pub fn new(
        api_base: &str,
        token: &str,
        backend_id: i64,
        agent_id: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building collector HTTP client")?;

        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            token: token.to_string(),
            backend_id,
            agent_id: agent_id.to_string(),
        })
    }

    /// Push one batch of traffic updates. The batch must be non-empty.
    pub async fn report(&self, updates: &[TrafficUpdate]) -> Result<()> {
        self.post_json(
            "/agent/traffic",
            &ReportRequest {
                backend_id: self.backend_id,
                agent_id: &self.agent_id,
                updates,
            },
        )
        .await
        .context("reporting traffic batch")?;

        debug!(updates = updates.len(), "traffic batch reported");

        Ok(())
    }

    /// Send a liveness heartbeat identifying this agent.
    pub async fn heartbeat(&self) -> Result<()> {
        self.post_json(
            "/agent/heartbeat",
            &HeartbeatRequest {
                backend_id: self.backend_id,
                agent_id: &self.agent_id,
                timestamp_ms: unix_ms(),
            },
        )
        .await
        .context("sending heartbeat")
    }

    async fn post_json<T: Serialize>(&self, path: &str, body: &T) -> Result<()> {
        let url = format!("{}{}", self.api_base, path);

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await
            .with_context(|| format!("requesting {path}"))?;

        let status = response.status();
        // Drain body for connection reuse.
        let text = response.text().await.unwrap_or_default();

        if !status.is_success() {
            bail!("unexpected status {} from {}: {}", status, path, text);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_request_wire_shape() {
        let updates = vec![TrafficUpdate {
            domain: "example.com".to_string(),
            ip: String::new(),
            chain: "Proxy".to_string(),
            chains: vec!["Proxy".to_string()],
            rule: "MATCH".to_string(),
            rule_payload: String::new(),
            upload: 10,
            download: 20,
            source_ip: String::new(),
            timestamp_ms: 1000,
        }];

        let body = ReportRequest {
            backend_id: 3,
            agent_id: "agent-1",
            updates: &updates,
        };

        let json = serde_json::to_string(&body).expect("serialize");
        assert!(json.contains("\"backendId\":3"));
        assert!(json.contains("\"agentId\":\"agent-1\""));
        assert!(json.contains("\"updates\":[{"));
    }

    #[test]
    fn test_api_base_trailing_slash_trimmed() {
        let client = Client::new(
            "http://localhost:3000/api/",
            "t",
            1,
            "a",
            Duration::from_secs(1),
        )
        .expect("build client");
        assert_eq!(client.api_base, "http://localhost:3000/api");
    }
}
