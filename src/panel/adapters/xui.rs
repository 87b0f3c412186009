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

/// Legacy x-ui wire format: `/xui/inbound` paths, `total` limit field, no
/// stats endpoint — traffic comes from the inbound list itself.
pub struct XuiAdapter;

impl XuiAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for XuiAdapter {
    fn default() -> Self {
        Self::new()
    }
}

const LIMIT_FIELD: &str = "total";

#[async_trait]
impl ProtocolAdapter for XuiAdapter {
    fn kind(&self) -> PanelKind {
        PanelKind::Xui
    }

    async fn list_inbounds(
        &self,
        session: &PanelSession,
    ) -> Result<Vec<RemoteInbound>, PanelError> {
        let response = session.request(Method::GET, "/xui/inbound/list", None).await?;
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
            .request(Method::POST, "/xui/inbound/add", Some(&body))
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
        let response = session
            .request(Method::POST, "/xui/inbound/addClient", Some(&body))
            .await?;
        unwrap_envelope(response)?;
        Ok(())
    }

    async fn delete_client(
        &self,
        session: &PanelSession,
        inbound_id: i64,
        remote_uuid: &str,
    ) -> Result<(), PanelError> {
        let body = json!({ "id": inbound_id, "clientId": remote_uuid });
        let response = session
            .request(Method::POST, "/xui/inbound/delClient", Some(&body))
            .await?;
        unwrap_envelope(response)?;
        Ok(())
    }

    /// The legacy brand has no stats endpoint; per-inbound counters from the
    /// list call stand in for it.
    async fn traffic_stats(
        &self,
        session: &PanelSession,
    ) -> Result<HashMap<i64, TrafficTotals>, PanelError> {
        let inbounds = self.list_inbounds(session).await?;
        Ok(inbounds
            .into_iter()
            .map(|inbound| {
                (
                    inbound.id,
                    TrafficTotals {
                        up: inbound.up,
                        down: inbound.down,
                    },
                )
            })
            .collect())
    }
}
