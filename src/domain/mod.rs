use serde::Serialize;

/// One connection as observed by the gateway at a single poll.
///
/// `upload`/`download` are cumulative byte counters since the connection was
/// established, exactly as the gateway reports them. They are never negative;
/// decoders clamp on the way in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowSnapshot {
    /// Gateway-assigned connection identifier. Numeric wire IDs are coerced
    /// to their string form.
    pub id: String,
    pub domain: String,
    pub ip: String,
    pub source_ip: String,
    /// Proxy hops the connection traversed, landing proxy first.
    pub chains: Vec<String>,
    /// Name of the rule that matched this connection.
    pub rule: String,
    /// Optional human-readable rule payload or comment.
    pub rule_payload: String,
    pub upload: i64,
    pub download: i64,
    /// Sample time in epoch milliseconds.
    pub timestamp_ms: i64,
}

/// Transmission unit sent to the collector.
///
/// `upload`/`download` here are deltas since the previous observation of the
/// same flow, never cumulative totals, and always non-negative.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TrafficUpdate {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub domain: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub ip: String,
    pub chain: String,
    pub chains: Vec<String>,
    pub rule: String,
    #[serde(rename = "rulePayload", skip_serializing_if = "String::is_empty")]
    pub rule_payload: String,
    pub upload: i64,
    pub download: i64,
    #[serde(rename = "sourceIP", skip_serializing_if = "String::is_empty")]
    pub source_ip: String,
    #[serde(rename = "timestampMs")]
    pub timestamp_ms: i64,
}

impl TrafficUpdate {
    /// Builds an update from a snapshot and the computed deltas. The single
    /// representative `chain` is the landing proxy, `chains[0]`.
    pub fn from_snapshot(snapshot: &FlowSnapshot, upload: i64, download: i64) -> Self {
        Self {
            domain: snapshot.domain.clone(),
            ip: snapshot.ip.clone(),
            chain: snapshot.chains.first().cloned().unwrap_or_default(),
            chains: snapshot.chains.clone(),
            rule: snapshot.rule.clone(),
            rule_payload: snapshot.rule_payload.clone(),
            upload,
            download,
            source_ip: snapshot.source_ip.clone(),
            timestamp_ms: snapshot.timestamp_ms,
        }
    }
}
