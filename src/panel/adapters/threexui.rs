use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::{json, Value};

use crate::db::enums::PanelKind;
use crate::panel::adapter::ProtocolAdapter;
use crate::panel::error::PanelError;
use crate::panel::session::PanelSession;
use crate::panel::types::{
    build_client_settings, parse_inbound_list, unwrap_envelope, validate_client_settings,
    validate_inbound_settings, validate_stream_settings, ClientSpec, InboundSpec, RemoteInbound,
    TrafficTotals,
};

/// 3x-ui wire format: `/panel/api/inbounds` paths, `totalGB` limit field
/// (in bytes, despite the name), a dedicated stats endpoint.
pub struct ThreeXuiAdapter;

impl ThreeXuiAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ThreeXuiAdapter {
    fn default() -> Self {
        Self::new()
    }
}

const LIMIT_FIELD: &str = "totalGB";

#[async_trait]
impl ProtocolAdapter for ThreeXuiAdapter {
    fn kind(&self) -> PanelKind {
        PanelKind::ThreeXui
    }

    async fn list_inbounds(
        &self,
        session: &PanelSession,
    ) -> Result<Vec<RemoteInbound>, PanelError> {
        let response = session
            .request(Method::GET, "/panel/api/inbounds/list", None)
            .await?;
        let obj = unwrap_envelope(response)?
            .ok_or_else(|| PanelError::Malformed("inbound list without obj".to_string()))?;
        parse_inbound_list(&obj, LIMIT_FIELD)
    }

    async fn add_inbound(
        &self,
        session: &PanelSession,
        spec: &InboundSpec,
    ) -> Result<i64, PanelError> {
        validate_inbound_settings(&spec.settings)?;
        validate_stream_settings(&spec.stream_settings)?;
        let body = json!({
            "remark": spec.remark,
            "port": spec.port,
            "protocol": spec.protocol,
            "expiryTime": spec.expiry_time_ms,
            "enable": true,
            "settings": spec.settings.to_string(),
            "streamSettings": spec.stream_settings.to_string(),
        });
        let response = session
            .request(Method::POST, "/panel/api/inbounds/add", Some(&body))
            .await?;
        let obj = unwrap_envelope(response)?
            .ok_or_else(|| PanelError::Malformed("addInbound without obj".to_string()))?;
        obj.get("id")
            .and_then(Value::as_i64)
            .ok_or_else(|| PanelError::Malformed("addInbound obj without id".to_string()))
    }

    async fn add_client(
        &self,
        session: &PanelSession,
        inbound_id: i64,
        spec: &ClientSpec,
    ) -> Result<(), PanelError> {
        let settings = build_client_settings(spec, LIMIT_FIELD);
        validate_client_settings(&settings)?;
        let body = json!({
            "id": inbound_id,
            "settings": settings.to_string(),
        });
        let path = format!("/panel/api/inbounds/{inbound_id}/addClient");
        let response = session.request(Method::POST, &path, Some(&body)).await?;
        unwrap_envelope(response)?;
        Ok(())
    }

    async fn delete_client(
        &self,
        session: &PanelSession,
        inbound_id: i64,
        remote_uuid: &str,
    ) -> Result<(), PanelError> {
        let path = format!("/panel/api/inbounds/{inbound_id}/delClient/{remote_uuid}");
        let response = session.request(Method::POST, &path, None).await?;
        unwrap_envelope(response)?;
        Ok(())
    }

    async fn traffic_stats(
        &self,
        session: &PanelSession,
    ) -> Result<HashMap<i64, TrafficTotals>, PanelError> {
        let response = session
            .request(Method::GET, "/panel/api/inbounds/stats", None)
            .await?;
        let obj = unwrap_envelope(response)?
            .ok_or_else(|| PanelError::Malformed("stats without obj".to_string()))?;
        parse_stats_obj(&obj)
    }
}

fn parse_stats_obj(obj: &Value) -> Result<HashMap<i64, TrafficTotals>, PanelError> {
    let map = obj
        .as_object()
        .ok_or_else(|| PanelError::Malformed("stats obj is not a map".to_string()))?;
    let mut stats = HashMap::with_capacity(map.len());
    for (key, entry) in map {
        let inbound_id: i64 = key
            .parse()
            .map_err(|_| PanelError::Malformed(format!("non-numeric inbound id {key}")))?;
        stats.insert(
            inbound_id,
            TrafficTotals {
                up: entry.get("up").and_then(Value::as_i64).unwrap_or(0),
                down: entry.get("down").and_then(Value::as_i64).unwrap_or(0),
            },
        );
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_obj_parses_keyed_map() {
        let obj = json!({"1": {"up": 10, "down": 20}, "9": {"up": 0, "down": 5}});
        let stats = parse_stats_obj(&obj).unwrap();
        assert_eq!(stats[&1], TrafficTotals { up: 10, down: 20 });
        assert_eq!(stats[&9].total(), 5);
    }

    #[test]
    fn stats_obj_rejects_non_numeric_keys() {
        let obj = json!({"not-a-number": {"up": 1, "down": 1}});
        assert!(matches!(parse_stats_obj(&obj), Err(PanelError::Malformed(_))));
    }
}
