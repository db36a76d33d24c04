//! Decoders for gateway connection-listing payloads.
//!
//! Gateway APIs are loosely typed: the same field may arrive as a JSON
//! number or a string, byte counters may carry fractional parts, and
//! endpoint identity is spread across combined `host:port` fields. All of
//! that is normalized here, once, at the decode boundary. A field whose
//! observed JSON type cannot be coerced is a hard decode failure carrying
//! the field name and the observed type, so malformed upstream payloads are
//! diagnosable without a wire capture.

use anyhow::{anyhow, Result};
use serde_json::Value;

use super::GatewayKind;
use crate::domain::FlowSnapshot;

/// Decode one gateway response body into snapshots. `now_ms` is the sample
/// timestamp used by dialects that do not report one themselves.
pub fn decode_snapshots(kind: GatewayKind, body: &[u8], now_ms: i64) -> Result<Vec<FlowSnapshot>> {
    match kind {
        GatewayKind::Surge => decode_surge(body, now_ms),
        GatewayKind::Clash => decode_clash(body, now_ms),
    }
}

/// Surge `/v1/requests/recent`: `{"requests": [...]}`.
fn decode_surge(body: &[u8], now_ms: i64) -> Result<Vec<FlowSnapshot>> {
    let root: Value = serde_json::from_slice(body)
        .map_err(|e| anyhow!("decode surge response: invalid JSON: {e}"))?;

    let requests = match root.get("requests") {
        Some(Value::Array(items)) => items,
        Some(Value::Null) | None => return Ok(Vec::new()),
        Some(other) => {
            return Err(anyhow!(
                "decode surge response: requests type={}",
                json_type(other)
            ))
        }
    };

    let mut snapshots = Vec::with_capacity(requests.len());
    for (idx, item) in requests.iter().enumerate() {
        let snapshot = decode_surge_request(item, now_ms).map_err(|e| {
            anyhow!("decode surge response: {} request {e}", ordinal(idx))
        })?;
        snapshots.push(snapshot);
    }

    Ok(snapshots)
}

fn decode_surge_request(item: &Value, now_ms: i64) -> Result<FlowSnapshot> {
    let obj = item
        .as_object()
        .ok_or_else(|| anyhow!("type={}", json_type(item)))?;

    // Ids key the flow state store; an absent one would alias unrelated
    // connections onto a single counter baseline.
    let id = match field_string(obj, "id")? {
        Some(id) if !id.is_empty() => id,
        _ => return Err(anyhow!("id missing")),
    };

    let mut domain = String::new();
    let mut ip = String::new();

    // A combined "host:port" field; the host lands in domain, or in ip when
    // it is a literal address.
    if let Some(remote_host) = field_string(obj, "remoteHost")? {
        let host = strip_port(&remote_host);
        if host.parse::<std::net::IpAddr>().is_ok() {
            ip = host.to_string();
        } else {
            domain = host.to_string();
        }
    }

    if ip.is_empty() {
        if let Some(remote_address) = field_string(obj, "remoteAddress")? {
            ip = strip_port(&remote_address).to_string();
        }
    }

    let source_ip = field_string(obj, "localAddress")?
        .map(|s| strip_port(&s).to_string())
        .unwrap_or_default();

    let policy = field_string(obj, "policyName")?.unwrap_or_default();
    let rule = field_string(obj, "originalPolicyName")?.unwrap_or_default();
    let rule_payload = field_string(obj, "rule")?
        .map(|raw| surge_rule_payload(&raw))
        .unwrap_or_default();

    let upload = field_i64(obj, "outBytes")?.unwrap_or(0).max(0);
    let download = field_i64(obj, "inBytes")?.unwrap_or(0).max(0);
    let timestamp_ms = field_i64(obj, "time")?.unwrap_or(now_ms);

    Ok(FlowSnapshot {
        id,
        domain,
        ip,
        source_ip,
        chains: if policy.is_empty() {
            Vec::new()
        } else {
            vec![policy]
        },
        rule,
        rule_payload,
        upload,
        download,
        timestamp_ms,
    })
}

/// Clash `/connections`: `{"connections": [...]}`. Clash does not report a
/// per-sample timestamp, so every snapshot is stamped with `now_ms`.
fn decode_clash(body: &[u8], now_ms: i64) -> Result<Vec<FlowSnapshot>> {
    let root: Value = serde_json::from_slice(body)
        .map_err(|e| anyhow!("decode clash response: invalid JSON: {e}"))?;

    let connections = match root.get("connections") {
        Some(Value::Array(items)) => items,
        Some(Value::Null) | None => return Ok(Vec::new()),
        Some(other) => {
            return Err(anyhow!(
                "decode clash response: connections type={}",
                json_type(other)
            ))
        }
    };

    let mut snapshots = Vec::with_capacity(connections.len());
    for (idx, item) in connections.iter().enumerate() {
        let snapshot = decode_clash_connection(item, now_ms).map_err(|e| {
            anyhow!("decode clash response: {} connection {e}", ordinal(idx))
        })?;
        snapshots.push(snapshot);
    }

    Ok(snapshots)
}

fn decode_clash_connection(item: &Value, now_ms: i64) -> Result<FlowSnapshot> {
    let obj = item
        .as_object()
        .ok_or_else(|| anyhow!("type={}", json_type(item)))?;

    let id = match field_string(obj, "id")? {
        Some(id) if !id.is_empty() => id,
        _ => return Err(anyhow!("id missing")),
    };

    let mut domain = String::new();
    let mut ip = String::new();
    let mut source_ip = String::new();

    match obj.get("metadata") {
        Some(Value::Object(meta)) => {
            domain = field_string(meta, "host")?.unwrap_or_default();
            ip = field_string(meta, "destinationIP")?.unwrap_or_default();
            source_ip = field_string(meta, "sourceIP")?.unwrap_or_default();
        }
        Some(Value::Null) | None => {}
        Some(other) => return Err(anyhow!("metadata type={}", json_type(other))),
    }

    let chains = match obj.get("chains") {
        Some(Value::Array(items)) => {
            let mut chains = Vec::with_capacity(items.len());
            for chain in items {
                match chain.as_str() {
                    Some(s) => chains.push(s.to_string()),
                    None => return Err(anyhow!("chains element type={}", json_type(chain))),
                }
            }
            chains
        }
        Some(Value::Null) | None => Vec::new(),
        Some(other) => return Err(anyhow!("chains type={}", json_type(other))),
    };

    let rule = field_string(obj, "rule")?.unwrap_or_default();
    let rule_payload = field_string(obj, "rulePayload")?.unwrap_or_default();
    let upload = field_i64(obj, "upload")?.unwrap_or(0).max(0);
    let download = field_i64(obj, "download")?.unwrap_or(0).max(0);

    Ok(FlowSnapshot {
        id,
        domain,
        ip,
        source_ip,
        chains,
        rule,
        rule_payload,
        upload,
        download,
        timestamp_ms: now_ms,
    })
}

// --- Scalar coercion ---

/// Coerce an optional number-or-string field to a string.
fn field_string(obj: &serde_json::Map<String, Value>, key: &str) -> Result<Option<String>> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(Value::Number(n)) => {
            if let Some(i) = n.as_i64() {
                Ok(Some(i.to_string()))
            } else {
                Ok(Some(n.to_string()))
            }
        }
        Some(other) => Err(anyhow!("{key} type={}", json_type(other))),
    }
}

/// Coerce an optional number-or-string field to an integer, truncating
/// fractional values toward zero (a counter of "100.9" reads as 100).
fn field_i64(obj: &serde_json::Map<String, Value>, key: &str) -> Result<Option<i64>> {
    let value = match obj.get(key) {
        None | Some(Value::Null) => return Ok(None),
        Some(value) => value,
    };

    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Some(i))
            } else if let Some(f) = n.as_f64() {
                Ok(Some(f.trunc() as i64))
            } else {
                Err(anyhow!("{key} type=number"))
            }
        }
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            if let Ok(i) = trimmed.parse::<i64>() {
                return Ok(Some(i));
            }
            match trimmed.parse::<f64>() {
                Ok(f) => Ok(Some(f.trunc() as i64)),
                Err(_) => Err(anyhow!("{key} type=string value={s:?}")),
            }
        }
        other => Err(anyhow!("{key} type={}", json_type(other))),
    }
}

/// Observed JSON type name, used in decode error hints.
fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn ordinal(idx: usize) -> String {
    match idx {
        0 => "first".to_string(),
        1 => "second".to_string(),
        2 => "third".to_string(),
        n => format!("{}th", n + 1),
    }
}

/// Drop a trailing `:port` from a combined host:port field. Bracketed and
/// bare IPv6 forms keep the full address.
fn strip_port(s: &str) -> &str {
    if let Some(rest) = s.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return &rest[..end];
        }
    }

    match s.rsplit_once(':') {
        // More than one colon without brackets means a bare IPv6 address.
        Some((host, _port)) if !host.contains(':') => host,
        _ => s,
    }
}

/// Extract the payload component from a Surge rule string of the form
/// `TYPE,PAYLOAD,POLICY` or `TYPE,POLICY`.
fn surge_rule_payload(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return String::new();
    }

    let mut parts = trimmed.split(',').map(str::trim);
    let rule_type = parts.next().unwrap_or_default();
    if rule_type == "FINAL" {
        return "*".to_string();
    }

    let second = parts.next().unwrap_or_default();
    if parts.next().is_some() {
        second.to_string()
    } else {
        // TYPE,POLICY form carries no payload.
        String::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_surge_flexible_field_types() {
        let body = br#"{
            "requests": [
                {
                    "id": 123,
                    "remoteHost": "example.com:443",
                    "remoteAddress": "93.184.216.34:443",
                    "localAddress": "192.168.1.2:56123",
                    "policyName": "Proxy",
                    "originalPolicyName": "MATCH",
                    "rule": "DOMAIN-SUFFIX,example.com,Proxy",
                    "outBytes": "100.9",
                    "inBytes": 200,
                    "time": "1700000000123"
                }
            ]
        }"#;

        let snapshots =
            decode_snapshots(GatewayKind::Surge, body, 1).expect("decode surge payload");
        assert_eq!(snapshots.len(), 1);

        let s = &snapshots[0];
        assert_eq!(s.id, "123");
        assert_eq!(s.domain, "example.com");
        assert_eq!(s.ip, "93.184.216.34");
        assert_eq!(s.source_ip, "192.168.1.2");
        assert_eq!(s.chains, vec!["Proxy".to_string()]);
        assert_eq!(s.rule, "MATCH");
        assert_eq!(s.rule_payload, "example.com");
        assert_eq!(s.upload, 100);
        assert_eq!(s.download, 200);
        assert_eq!(s.timestamp_ms, 1_700_000_000_123);
    }

    #[test]
    fn test_surge_decode_error_includes_debug_hint() {
        let body = br#"{"requests":[{"id":{"bad":1}}]}"#;

        let err = decode_snapshots(GatewayKind::Surge, body, 0).expect_err("should fail");
        let msg = err.to_string();
        assert!(msg.contains("decode surge response"), "got: {msg}");
        assert!(msg.contains("first request id type=object"), "got: {msg}");
    }

    #[test]
    fn test_surge_second_request_hint_names_position() {
        let body = br#"{"requests":[{"id":1},{"id":2,"outBytes":[1]}]}"#;

        let err = decode_snapshots(GatewayKind::Surge, body, 0).expect_err("should fail");
        assert!(
            err.to_string().contains("second request outBytes type=array"),
            "got: {err}"
        );
    }

    #[test]
    fn test_surge_missing_requests_is_empty() {
        let snapshots =
            decode_snapshots(GatewayKind::Surge, b"{}", 0).expect("decode empty payload");
        assert!(snapshots.is_empty());
    }

    #[test]
    fn test_surge_missing_or_empty_id_is_an_error() {
        let body = br#"{"requests":[{"outBytes":10},{"outBytes":90}]}"#;
        let err = decode_snapshots(GatewayKind::Surge, body, 0).expect_err("should fail");
        assert!(
            err.to_string().contains("first request id missing"),
            "got: {err}"
        );

        let body = br#"{"requests":[{"id":"a"},{"id":""}]}"#;
        let err = decode_snapshots(GatewayKind::Surge, body, 0).expect_err("should fail");
        assert!(
            err.to_string().contains("second request id missing"),
            "got: {err}"
        );
    }

    #[test]
    fn test_clash_missing_id_is_an_error() {
        let body = br#"{"connections":[{"upload":1,"download":2}]}"#;
        let err = decode_snapshots(GatewayKind::Clash, body, 0).expect_err("should fail");
        assert!(
            err.to_string().contains("first connection id missing"),
            "got: {err}"
        );
    }

    #[test]
    fn test_surge_ip_literal_remote_host_fills_ip() {
        let body = br#"{"requests":[{"id":"a","remoteHost":"10.0.0.8:8080"}]}"#;

        let snapshots = decode_snapshots(GatewayKind::Surge, body, 5).expect("decode");
        assert_eq!(snapshots[0].domain, "");
        assert_eq!(snapshots[0].ip, "10.0.0.8");
        assert_eq!(snapshots[0].timestamp_ms, 5);
    }

    #[test]
    fn test_surge_negative_counter_clamps_to_zero() {
        let body = br#"{"requests":[{"id":"a","outBytes":-5,"inBytes":"-1"}]}"#;

        let snapshots = decode_snapshots(GatewayKind::Surge, body, 0).expect("decode");
        assert_eq!(snapshots[0].upload, 0);
        assert_eq!(snapshots[0].download, 0);
    }

    #[test]
    fn test_clash_connections() {
        let body = br#"{
            "downloadTotal": 1000,
            "uploadTotal": 500,
            "connections": [
                {
                    "id": "7c4902a9",
                    "metadata": {
                        "host": "example.org",
                        "destinationIP": "203.0.113.9",
                        "sourceIP": "192.168.1.10"
                    },
                    "chains": ["HK-01", "Auto", "Proxies"],
                    "rule": "RuleSet",
                    "rulePayload": "streaming",
                    "upload": 42,
                    "download": "314"
                }
            ]
        }"#;

        let snapshots =
            decode_snapshots(GatewayKind::Clash, body, 777).expect("decode clash payload");
        assert_eq!(snapshots.len(), 1);

        let s = &snapshots[0];
        assert_eq!(s.id, "7c4902a9");
        assert_eq!(s.domain, "example.org");
        assert_eq!(s.ip, "203.0.113.9");
        assert_eq!(s.source_ip, "192.168.1.10");
        assert_eq!(s.chains.len(), 3);
        assert_eq!(s.chains[0], "HK-01");
        assert_eq!(s.rule, "RuleSet");
        assert_eq!(s.rule_payload, "streaming");
        assert_eq!(s.upload, 42);
        assert_eq!(s.download, 314);
        assert_eq!(s.timestamp_ms, 777);
    }

    #[test]
    fn test_clash_decode_error_includes_debug_hint() {
        let body = br#"{"connections":[{"id":"x","chains":"Proxy"}]}"#;

        let err = decode_snapshots(GatewayKind::Clash, body, 0).expect_err("should fail");
        let msg = err.to_string();
        assert!(msg.contains("decode clash response"), "got: {msg}");
        assert!(msg.contains("first connection chains type=string"), "got: {msg}");
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("example.com:443"), "example.com");
        assert_eq!(strip_port("example.com"), "example.com");
        assert_eq!(strip_port("10.0.0.1:80"), "10.0.0.1");
        assert_eq!(strip_port("[2001:db8::1]:443"), "2001:db8::1");
        assert_eq!(strip_port("2001:db8::1"), "2001:db8::1");
    }

    #[test]
    fn test_surge_rule_payload() {
        assert_eq!(surge_rule_payload("DOMAIN-SUFFIX,example.com,Proxy"), "example.com");
        assert_eq!(surge_rule_payload("FINAL,DIRECT"), "*");
        assert_eq!(surge_rule_payload("MATCH,Proxy"), "");
        assert_eq!(surge_rule_payload(""), "");
        assert_eq!(surge_rule_payload("# comment"), "");
    }
}
