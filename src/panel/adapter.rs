use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::db::enums::PanelKind;
use crate::panel::adapters::threexui::ThreeXuiAdapter;
use crate::panel::adapters::xui::XuiAdapter;
use crate::panel::error::PanelError;
use crate::panel::session::PanelSession;
use crate::panel::types::{ClientSpec, InboundSpec, RemoteInbound, TrafficTotals};

/// Translates abstract panel operations into one brand's wire format.
/// Implementations are stateless; all I/O goes through the given session.
#[async_trait]
pub trait ProtocolAdapter: Send + Sync {
    fn kind(&self) -> PanelKind;

    async fn list_inbounds(&self, session: &PanelSession)
        -> Result<Vec<RemoteInbound>, PanelError>;

    /// Creates a listening endpoint; returns the panel-assigned inbound id.
    async fn add_inbound(
        &self,
        session: &PanelSession,
        spec: &InboundSpec,
    ) -> Result<i64, PanelError>;

    async fn add_client(
        &self,
        session: &PanelSession,
        inbound_id: i64,
        spec: &ClientSpec,
    ) -> Result<(), PanelError>;

    async fn delete_client(
        &self,
        session: &PanelSession,
        inbound_id: i64,
        remote_uuid: &str,
    ) -> Result<(), PanelError>;

    async fn traffic_stats(
        &self,
        session: &PanelSession,
    ) -> Result<HashMap<i64, TrafficTotals>, PanelError>;
}

/// Maps the panel-kind enum recorded on a server to a concrete adapter.
/// Built at startup and injected; an unregistered kind is a typed error,
/// never a silent no-op.
pub struct AdapterRegistry {
    adapters: HashMap<PanelKind, Arc<dyn ProtocolAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    /// Registry with every shipped adapter.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ThreeXuiAdapter::new()));
        registry.register(Arc::new(XuiAdapter::new()));
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn ProtocolAdapter>) {
        self.adapters.insert(adapter.kind(), adapter);
    }

    pub fn get(&self, kind: PanelKind) -> Result<Arc<dyn ProtocolAdapter>, PanelError> {
        self.adapters
            .get(&kind)
            .cloned()
            .ok_or_else(|| PanelError::UnsupportedPanelType(kind.to_string()))
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_covers_both_brands() {
        let registry = AdapterRegistry::with_builtin();
        assert_eq!(registry.get(PanelKind::ThreeXui).unwrap().kind(), PanelKind::ThreeXui);
        assert_eq!(registry.get(PanelKind::Xui).unwrap().kind(), PanelKind::Xui);
    }

    #[test]
    fn unregistered_kind_fails_fast() {
        let registry = AdapterRegistry::new();
        let err = match registry.get(PanelKind::ThreeXui) {
            Ok(_) => panic!("expected unregistered kind to fail"),
            Err(e) => e,
        };
        assert!(matches!(err, PanelError::UnsupportedPanelType(kind) if kind == "3x-ui"));
    }
}
