use {async_trait::async_trait, serde::Serialize};

use qiao_common::{ChannelKind, ChatType};

use crate::error::HostResult;

/// What the gateway knows about an inbound peer when asking for a route.
#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub channel: ChannelKind,
    pub account_id: String,
    pub peer_id: String,
    pub chat_type: ChatType,
}

/// Resolved route: which agent handles the message and under which session.
#[derive(Debug, Clone, Serialize)]
pub struct AgentRoute {
    pub session_key: String,
    pub account_id: String,
    pub agent_id: String,
    /// The account's main session, when the peer session is subordinate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub main_session_key: Option<String>,
}

/// Host-side agent routing.
#[async_trait]
pub trait AgentRouter: Send + Sync {
    async fn resolve_agent_route(&self, request: RouteRequest) -> HostResult<AgentRoute>;
}

/// Fallback router: one agent, session keyed by channel/account/peer.
pub struct NoopAgentRouter;

#[async_trait]
impl AgentRouter for NoopAgentRouter {
    async fn resolve_agent_route(&self, request: RouteRequest) -> HostResult<AgentRoute> {
        Ok(AgentRoute {
            session_key: format!(
                "{}:{}:{}",
                request.channel, request.account_id, request.peer_id
            ),
            account_id: request.account_id,
            agent_id: "default".to_string(),
            main_session_key: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_router_keys_sessions_by_channel_account_peer() {
        let route = NoopAgentRouter
            .resolve_agent_route(RouteRequest {
                channel: ChannelKind::Wecom,
                account_id: "default".into(),
                peer_id: "u1".into(),
                chat_type: ChatType::Direct,
            })
            .await
            .unwrap();
        assert_eq!(route.session_key, "wecom:default:u1");
        assert_eq!(route.agent_id, "default");
    }
}
