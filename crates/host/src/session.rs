use {
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
};

use qiao_common::{ChannelKind, InboundEnvelope};

use crate::{error::HostResult, router::AgentRoute};

/// The last outbound routing record for an `(account, peer)` pair.
///
/// Persisted through the host's session store so host-initiated messages
/// route back to the most recent peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionAnchor {
    pub session_key: String,
    pub channel: ChannelKind,
    pub to: String,
    pub account_id: String,
}

/// Host-side session bookkeeping consumed by the dispatch coordinator.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Filesystem location of a session's transcript, for host tooling.
    async fn resolve_store_path(&self, session_key: &str) -> HostResult<String>;

    /// Unix-ms timestamp of the session's last update, if it exists.
    async fn read_session_updated_at(&self, session_key: &str) -> HostResult<Option<i64>>;

    /// Record an inbound message against its resolved route.
    async fn record_inbound_session(
        &self,
        envelope: &InboundEnvelope,
        route: &AgentRoute,
    ) -> HostResult<()>;

    /// Record where replies for this account should go next.
    async fn record_outbound_route(&self, anchor: SessionAnchor) -> HostResult<()>;

    /// The most recent outbound route for the account, if any.
    async fn last_outbound_route(
        &self,
        channel: ChannelKind,
        account_id: &str,
    ) -> HostResult<Option<SessionAnchor>>;
}

/// Session store that remembers nothing.
pub struct NoopSessionStore;

#[async_trait]
impl SessionStore for NoopSessionStore {
    async fn resolve_store_path(&self, session_key: &str) -> HostResult<String> {
        Ok(format!("sessions/{session_key}.jsonl"))
    }

    async fn read_session_updated_at(&self, _session_key: &str) -> HostResult<Option<i64>> {
        Ok(None)
    }

    async fn record_inbound_session(
        &self,
        _envelope: &InboundEnvelope,
        _route: &AgentRoute,
    ) -> HostResult<()> {
        Ok(())
    }

    async fn record_outbound_route(&self, _anchor: SessionAnchor) -> HostResult<()> {
        Ok(())
    }

    async fn last_outbound_route(
        &self,
        _channel: ChannelKind,
        _account_id: &str,
    ) -> HostResult<Option<SessionAnchor>> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_store_remembers_nothing() {
        let ports = crate::HostPorts::default();
        assert_eq!(
            ports
                .sessions
                .resolve_store_path("dingtalk:default:u1")
                .await
                .unwrap(),
            "sessions/dingtalk:default:u1.jsonl"
        );
        assert!(
            ports
                .sessions
                .read_session_updated_at("any")
                .await
                .unwrap()
                .is_none()
        );
        let anchor = SessionAnchor {
            session_key: "k".into(),
            channel: ChannelKind::Qqbot,
            to: "u1".into(),
            account_id: "default".into(),
        };
        ports.sessions.record_outbound_route(anchor).await.unwrap();
        assert!(
            ports
                .sessions
                .last_outbound_route(ChannelKind::Qqbot, "default")
                .await
                .unwrap()
                .is_none()
        );
    }
}
