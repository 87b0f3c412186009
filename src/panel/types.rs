use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;

use crate::panel::error::PanelError;

/// Platform plans are sold in GB; everything crosses the panel wire in bytes.
pub const fn gb_to_bytes(gb: i64) -> i64 {
    gb * 1024 * 1024 * 1024
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficTotals {
    pub up: i64,
    pub down: i64,
}

impl TrafficTotals {
    pub fn total(&self) -> i64 {
        self.up + self.down
    }
}

/// A per-user credential set as the panel reports it.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteClient {
    pub uuid: String,
    pub email: String,
    pub up: i64,
    pub down: i64,
    /// 0 = unlimited.
    pub total_bytes: i64,
    /// Epoch milliseconds; 0 = never expires.
    pub expiry_time_ms: i64,
    pub limit_ip: i32,
    pub flow: Option<String>,
    pub enable: bool,
}

/// A listening endpoint as the panel reports it, with its parsed clients.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteInbound {
    pub id: i64,
    pub remark: String,
    pub protocol: String,
    pub port: i32,
    pub enable: bool,
    pub up: i64,
    pub down: i64,
    pub total: i64,
    pub expiry_time_ms: i64,
    pub clients: Vec<RemoteClient>,
}

/// What we send to create a client on an inbound.
#[derive(Debug, Clone)]
pub struct ClientSpec {
    pub uuid: String,
    pub email: String,
    /// Bytes; 0 = unlimited.
    pub traffic_limit_bytes: i64,
    /// Epoch milliseconds; 0 = never expires.
    pub expiry_time_ms: i64,
    pub limit_ip: i32,
    pub flow: Option<String>,
}

impl ClientSpec {
    /// Spec for a brand-new credential set: fresh uuid, plan limit in GB.
    pub fn for_new_account(email: String, limit_gb: i64, expiry_time_ms: i64) -> Self {
        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            email,
            traffic_limit_bytes: gb_to_bytes(limit_gb),
            expiry_time_ms,
            limit_ip: 0,
            flow: None,
        }
    }
}

/// What we send to create a listening endpoint.
#[derive(Debug, Clone)]
pub struct InboundSpec {
    pub remark: String,
    pub port: i32,
    pub protocol: String,
    pub expiry_time_ms: i64,
    /// Product-specific JSON template, validated at call time.
    pub settings: Value,
    /// Product-specific transport template, validated at call time.
    pub stream_settings: Value,
}

/// Everything one sync pass pulls from a panel.
#[derive(Debug, Clone, Default)]
pub struct PanelSnapshot {
    pub inbounds: Vec<RemoteInbound>,
    pub traffic: HashMap<i64, TrafficTotals>,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    obj: Option<Value>,
}

/// Unwraps the panel's `{success, msg, obj}` envelope. `success=false` in a
/// well-formed response is a panel logic error carrying the panel's message.
pub fn unwrap_envelope(value: Value) -> Result<Option<Value>, PanelError> {
    let envelope: Envelope = serde_json::from_value(value)
        .map_err(|e| PanelError::Malformed(format!("bad response envelope: {e}")))?;
    if !envelope.success {
        return Err(PanelError::Logic(envelope.msg));
    }
    Ok(envelope.obj)
}

/// Builds the `settings` template for an addClient call. `limit_field` names
/// the brand's traffic-limit key (`totalGB` or `total`), always in bytes.
pub fn build_client_settings(spec: &ClientSpec, limit_field: &str) -> Value {
    let mut client = json!({
        "id": spec.uuid,
        "email": spec.email,
        "expiryTime": spec.expiry_time_ms,
        "limitIp": spec.limit_ip,
        "enable": true,
    });
    client[limit_field] = json!(spec.traffic_limit_bytes);
    if let Some(flow) = &spec.flow {
        client["flow"] = json!(flow);
    }
    json!({ "clients": [client] })
}

/// Minimal required-field contract for an inbound `settings` template. Panel
/// schemas are product-specific and only partially documented, so templates
/// are checked at call time instead of trusted from static structs. A fresh
/// inbound may carry zero clients.
pub fn validate_inbound_settings(settings: &Value) -> Result<(), PanelError> {
    let clients = settings
        .get("clients")
        .and_then(Value::as_array)
        .ok_or_else(|| PanelError::InvalidTemplate("clients array".to_string()))?;
    for client in clients {
        for field in ["id", "email"] {
            let present = client
                .get(field)
                .and_then(Value::as_str)
                .is_some_and(|s| !s.is_empty());
            if !present {
                return Err(PanelError::InvalidTemplate(format!("clients[].{field}")));
            }
        }
    }
    Ok(())
}

/// As `validate_inbound_settings`, but an addClient call must carry at least
/// one client.
pub fn validate_client_settings(settings: &Value) -> Result<(), PanelError> {
    validate_inbound_settings(settings)?;
    let empty = settings
        .get("clients")
        .and_then(Value::as_array)
        .is_some_and(|c| c.is_empty());
    if empty {
        return Err(PanelError::InvalidTemplate("clients array is empty".to_string()));
    }
    Ok(())
}

/// Minimal required-field contract for a `streamSettings` template.
pub fn validate_stream_settings(stream_settings: &Value) -> Result<(), PanelError> {
    let present = stream_settings
        .get("network")
        .and_then(Value::as_str)
        .is_some_and(|s| !s.is_empty());
    if !present {
        return Err(PanelError::InvalidTemplate("streamSettings.network".to_string()));
    }
    Ok(())
}

/// Parses the inbound-list `obj` payload into `RemoteInbound`s. Clients live
/// inside the inbound's `settings` JSON-string; per-client counters come from
/// the `clientStats` array when the brand provides one.
pub fn parse_inbound_list(obj: &Value, limit_field: &str) -> Result<Vec<RemoteInbound>, PanelError> {
    let rows = obj
        .as_array()
        .ok_or_else(|| PanelError::Malformed("inbound list is not an array".to_string()))?;

    let mut inbounds = Vec::with_capacity(rows.len());
    for row in rows {
        let id = row
            .get("id")
            .and_then(Value::as_i64)
            .ok_or_else(|| PanelError::Malformed("inbound without id".to_string()))?;

        let mut stats: HashMap<String, (i64, i64)> = HashMap::new();
        if let Some(client_stats) = row.get("clientStats").and_then(Value::as_array) {
            for stat in client_stats {
                if let Some(email) = stat.get("email").and_then(Value::as_str) {
                    stats.insert(
                        email.to_string(),
                        (
                            stat.get("up").and_then(Value::as_i64).unwrap_or(0),
                            stat.get("down").and_then(Value::as_i64).unwrap_or(0),
                        ),
                    );
                }
            }
        }

        let mut clients = Vec::new();
        if let Some(settings_raw) = row.get("settings").and_then(Value::as_str) {
            let settings: Value = serde_json::from_str(settings_raw).map_err(|e| {
                PanelError::Malformed(format!("inbound {id} settings is not JSON: {e}"))
            })?;
            if let Some(entries) = settings.get("clients").and_then(Value::as_array) {
                for entry in entries {
                    let email = entry
                        .get("email")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    let (up, down) = stats.get(&email).copied().unwrap_or((0, 0));
                    clients.push(RemoteClient {
                        uuid: entry
                            .get("id")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        email,
                        up,
                        down,
                        total_bytes: entry.get(limit_field).and_then(Value::as_i64).unwrap_or(0),
                        expiry_time_ms: entry
                            .get("expiryTime")
                            .and_then(Value::as_i64)
                            .unwrap_or(0),
                        limit_ip: entry.get("limitIp").and_then(Value::as_i64).unwrap_or(0)
                            as i32,
                        flow: entry
                            .get("flow")
                            .and_then(Value::as_str)
                            .filter(|f| !f.is_empty())
                            .map(str::to_string),
                        enable: entry.get("enable").and_then(Value::as_bool).unwrap_or(true),
                    });
                }
            }
        }

        inbounds.push(RemoteInbound {
            id,
            remark: row
                .get("remark")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            protocol: row
                .get("protocol")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            port: row.get("port").and_then(Value::as_i64).unwrap_or(0) as i32,
            enable: row.get("enable").and_then(Value::as_bool).unwrap_or(false),
            up: row.get("up").and_then(Value::as_i64).unwrap_or(0),
            down: row.get("down").and_then(Value::as_i64).unwrap_or(0),
            total: row.get("total").and_then(Value::as_i64).unwrap_or(0),
            expiry_time_ms: row.get("expiryTime").and_then(Value::as_i64).unwrap_or(0),
            clients,
        });
    }
    Ok(inbounds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gb_conversion_uses_binary_units() {
        assert_eq!(gb_to_bytes(5), 5 * 1024_i64.pow(3));
        assert_eq!(gb_to_bytes(0), 0);
    }

    #[test]
    fn envelope_failure_surfaces_panel_message() {
        let err = unwrap_envelope(json!({"success": false, "msg": "port in use", "obj": null}))
            .unwrap_err();
        match err {
            PanelError::Logic(msg) => assert_eq!(msg, "port in use"),
            other => panic!("expected Logic, got {other:?}"),
        }
    }

    #[test]
    fn envelope_success_yields_obj() {
        let obj = unwrap_envelope(json!({"success": true, "msg": "", "obj": [1, 2]}))
            .unwrap()
            .unwrap();
        assert_eq!(obj, json!([1, 2]));
    }

    #[test]
    fn client_settings_template_round_trip() {
        let spec = ClientSpec {
            uuid: "abc-123".to_string(),
            email: "user@plan".to_string(),
            traffic_limit_bytes: gb_to_bytes(10),
            expiry_time_ms: 1_700_000_000_000,
            limit_ip: 2,
            flow: Some("xtls-rprx-vision".to_string()),
        };
        let settings = build_client_settings(&spec, "totalGB");
        validate_client_settings(&settings).unwrap();

        let client = &settings["clients"][0];
        assert_eq!(client["id"], "abc-123");
        assert_eq!(client["totalGB"], gb_to_bytes(10));
        assert_eq!(client["flow"], "xtls-rprx-vision");
    }

    #[test]
    fn template_validation_rejects_missing_required_fields() {
        let missing_email = json!({"clients": [{"id": "abc"}]});
        assert!(matches!(
            validate_client_settings(&missing_email),
            Err(PanelError::InvalidTemplate(field)) if field == "clients[].email"
        ));
        let empty = json!({"clients": []});
        assert!(validate_client_settings(&empty).is_err());
        // An inbound template may start with zero clients.
        assert!(validate_inbound_settings(&empty).is_ok());
        assert!(validate_inbound_settings(&json!({"decryption": "none"})).is_err());
        assert!(validate_stream_settings(&json!({"security": "tls"})).is_err());
        assert!(validate_stream_settings(&json!({"network": "tcp"})).is_ok());
    }

    #[test]
    fn inbound_list_merges_settings_clients_with_stats() {
        let obj = json!([{
            "id": 4,
            "remark": "eu-1",
            "protocol": "vless",
            "port": 443,
            "enable": true,
            "up": 100,
            "down": 200,
            "total": 0,
            "expiryTime": 0,
            "settings": "{\"clients\":[{\"id\":\"u-1\",\"email\":\"a@x\",\"totalGB\":1073741824,\"expiryTime\":0,\"limitIp\":1,\"flow\":\"\"}]}",
            "clientStats": [{"email": "a@x", "up": 11, "down": 22}]
        }]);
        let inbounds = parse_inbound_list(&obj, "totalGB").unwrap();
        assert_eq!(inbounds.len(), 1);
        assert_eq!(inbounds[0].id, 4);
        let client = &inbounds[0].clients[0];
        assert_eq!(client.uuid, "u-1");
        assert_eq!(client.up, 11);
        assert_eq!(client.down, 22);
        assert_eq!(client.total_bytes, 1073741824);
        assert_eq!(client.flow, None);
    }
}
