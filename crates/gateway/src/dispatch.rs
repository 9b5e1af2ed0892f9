//! Dispatch coordinator: the one place where an inbound envelope meets
//! the host runtime.
//!
//! Order per message: resolve the agent route, read the session's
//! last-updated stamp, record the inbound session (DMs also refresh the
//! outbound anchor), wrap the body with the envelope formatter, then run
//! the host reply port against a buffered dispatcher whose deliverer the
//! originating channel provided.

use std::sync::Arc;

use {async_trait::async_trait, serde_json::Value, tracing::{debug, warn}};

use {
    qiao_channels::InboundSink,
    qiao_common::{ChatType, InboundEnvelope},
    qiao_config::resolve_account,
    qiao_host::{
        AgentRouter, ReplyDeliverer, ReplyDispatchPort, ReplyDispatcherOptions, RouteRequest,
        SessionAnchor, SessionStore, create_reply_dispatcher, format_agent_envelope,
        resolve_envelope_format_options, resolve_human_delay_config,
    },
};

/// Channel-facing inbound sink wired to the host runtime ports.
pub struct DispatchCoordinator {
    router: Arc<dyn AgentRouter>,
    sessions: Arc<dyn SessionStore>,
    reply: Arc<dyn ReplyDispatchPort>,
    /// Root config value, for per-account reply options.
    config: std::sync::RwLock<Value>,
}

impl DispatchCoordinator {
    pub fn new(
        router: Arc<dyn AgentRouter>,
        sessions: Arc<dyn SessionStore>,
        reply: Arc<dyn ReplyDispatchPort>,
    ) -> Self {
        Self {
            router,
            sessions,
            reply,
            config: std::sync::RwLock::new(Value::Null),
        }
    }

    pub fn set_config(&self, root: Value) {
        let mut config = self.config.write().unwrap_or_else(|e| e.into_inner());
        *config = root;
    }

    fn reply_options(&self, envelope: &InboundEnvelope) -> ReplyDispatcherOptions {
        let config = self.config.read().unwrap_or_else(|e| e.into_inner());
        let account = resolve_account(&config, envelope.channel, &envelope.account_id);
        let human_delay = account
            .raw
            .get("humanDelay")
            .or_else(|| account.raw.get("human_delay"))
            .map(|value| resolve_human_delay_config(Some(value)));
        ReplyDispatcherOptions {
            reply_final_only: account.reply_final_only,
            human_delay,
        }
    }
}

#[async_trait]
impl InboundSink for DispatchCoordinator {
    async fn dispatch_envelope(
        &self,
        envelope: InboundEnvelope,
        deliverer: Arc<dyn ReplyDeliverer>,
    ) {
        let route = match self
            .router
            .resolve_agent_route(RouteRequest {
                channel: envelope.channel,
                account_id: envelope.account_id.clone(),
                peer_id: envelope.peer_id.clone(),
                chat_type: envelope.chat_type,
            })
            .await
        {
            Ok(route) => route,
            Err(error) => {
                warn!(error = %error, "agent route resolution failed, message dropped");
                return;
            },
        };

        let previous_updated_at = self
            .sessions
            .read_session_updated_at(&route.session_key)
            .await
            .unwrap_or_default();

        if let Err(error) = self.sessions.record_inbound_session(&envelope, &route).await {
            warn!(error = %error, "inbound session record failed");
        }
        if envelope.chat_type == ChatType::Direct {
            // later host-initiated messages follow this anchor back
            let anchor = SessionAnchor {
                session_key: route.session_key.clone(),
                channel: envelope.channel,
                to: envelope.peer_id.clone(),
                account_id: envelope.account_id.clone(),
            };
            if let Err(error) = self.sessions.record_outbound_route(anchor).await {
                warn!(error = %error, "outbound route anchor record failed");
            }
        }

        let format_options = resolve_envelope_format_options(envelope.channel);
        let agent_body =
            format_agent_envelope(&envelope, previous_updated_at, now_ms(), &format_options);

        let handle = create_reply_dispatcher(self.reply_options(&envelope), deliverer);
        debug!(
            channel = %envelope.channel,
            session_key = %route.session_key,
            message_id = %envelope.message_id,
            "dispatching inbound message"
        );
        if let Err(error) = self
            .reply
            .dispatch_reply_with_buffered_dispatcher(
                &route,
                &agent_body,
                Arc::clone(&handle.dispatcher),
            )
            .await
        {
            warn!(error = %error, "host reply dispatch failed");
        }
        handle.dispatcher.mark_dispatch_idle();
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use {
        qiao_common::ChannelKind,
        qiao_host::{AgentRoute, BlockKind, BufferedReplyDispatcher, HostResult, NoopAgentRouter},
    };

    use super::*;

    #[derive(Default)]
    struct RecordingSessions {
        inbound: Mutex<Vec<String>>,
        anchors: Mutex<Vec<SessionAnchor>>,
    }

    #[async_trait]
    impl SessionStore for RecordingSessions {
        async fn resolve_store_path(&self, session_key: &str) -> HostResult<String> {
            Ok(format!("sessions/{session_key}"))
        }

        async fn read_session_updated_at(&self, _session_key: &str) -> HostResult<Option<i64>> {
            Ok(Some(0))
        }

        async fn record_inbound_session(
            &self,
            envelope: &InboundEnvelope,
            _route: &AgentRoute,
        ) -> HostResult<()> {
            self.inbound.lock().unwrap().push(envelope.message_id.clone());
            Ok(())
        }

        async fn record_outbound_route(&self, anchor: SessionAnchor) -> HostResult<()> {
            self.anchors.lock().unwrap().push(anchor);
            Ok(())
        }

        async fn last_outbound_route(
            &self,
            _channel: ChannelKind,
            _account_id: &str,
        ) -> HostResult<Option<SessionAnchor>> {
            Ok(self.anchors.lock().unwrap().last().cloned())
        }
    }

    /// Host port that streams three cumulative blocks then finishes.
    struct StreamingPort;

    #[async_trait]
    impl ReplyDispatchPort for StreamingPort {
        async fn dispatch_reply_with_buffered_dispatcher(
            &self,
            _route: &AgentRoute,
            _agent_body: &str,
            dispatcher: Arc<BufferedReplyDispatcher>,
        ) -> HostResult<()> {
            dispatcher.dispatch(BlockKind::Interim, "Hi").await;
            dispatcher.dispatch(BlockKind::Interim, "Hi, there").await;
            dispatcher.dispatch(BlockKind::Final, "Hi, there!").await;
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingDeliverer {
        blocks: Mutex<Vec<(BlockKind, String)>>,
    }

    #[async_trait]
    impl ReplyDeliverer for RecordingDeliverer {
        async fn deliver(&self, kind: BlockKind, text: &str) -> anyhow::Result<()> {
            self.blocks.lock().unwrap().push((kind, text.to_string()));
            Ok(())
        }
    }

    fn envelope(chat_type: ChatType) -> InboundEnvelope {
        InboundEnvelope {
            channel: ChannelKind::Dingtalk,
            account_id: "default".into(),
            message_id: "m1".into(),
            message_sid: None,
            timestamp_ms: 0,
            chat_type,
            sender_id: "u1".into(),
            sender_name: Some("Alice".into()),
            peer_id: "cv1".into(),
            body: "hello".into(),
            raw_body: "hello".into(),
            attachments: Vec::new(),
            was_mentioned: true,
        }
    }

    #[tokio::test]
    async fn full_dispatch_records_sessions_and_streams_blocks() {
        let sessions = Arc::new(RecordingSessions::default());
        let coordinator = DispatchCoordinator::new(
            Arc::new(NoopAgentRouter),
            sessions.clone(),
            Arc::new(StreamingPort),
        );
        let deliverer = Arc::new(RecordingDeliverer::default());

        coordinator
            .dispatch_envelope(envelope(ChatType::Group), deliverer.clone())
            .await;

        assert_eq!(sessions.inbound.lock().unwrap().as_slice(), ["m1"]);
        // group messages do not move the outbound anchor
        assert!(sessions.anchors.lock().unwrap().is_empty());

        let blocks = deliverer.blocks.lock().unwrap();
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0], (BlockKind::Interim, "Hi".to_string()));
        assert_eq!(blocks[2], (BlockKind::Final, "Hi, there!".to_string()));
    }

    #[tokio::test]
    async fn dm_dispatch_updates_the_outbound_anchor() {
        let sessions = Arc::new(RecordingSessions::default());
        let coordinator = DispatchCoordinator::new(
            Arc::new(NoopAgentRouter),
            sessions.clone(),
            Arc::new(StreamingPort),
        );

        coordinator
            .dispatch_envelope(
                envelope(ChatType::Direct),
                Arc::new(RecordingDeliverer::default()),
            )
            .await;

        {
            let anchors = sessions.anchors.lock().unwrap();
            assert_eq!(anchors.len(), 1);
            assert_eq!(anchors[0].to, "cv1");
            assert_eq!(anchors[0].channel, ChannelKind::Dingtalk);
        }
        let route = sessions
            .last_outbound_route(ChannelKind::Dingtalk, "default")
            .await;
        assert!(route.unwrap().is_some());
    }

    #[tokio::test]
    async fn reply_final_only_config_reaches_the_dispatcher() {
        let coordinator = DispatchCoordinator::new(
            Arc::new(NoopAgentRouter),
            Arc::new(RecordingSessions::default()),
            Arc::new(StreamingPort),
        );
        coordinator.set_config(serde_json::json!({
            "channels": { "dingtalk": {
                "clientId": "k", "clientSecret": "s", "replyFinalOnly": true
            } }
        }));
        let deliverer = Arc::new(RecordingDeliverer::default());
        coordinator
            .dispatch_envelope(envelope(ChatType::Group), deliverer.clone())
            .await;

        let blocks = deliverer.blocks.lock().unwrap();
        // interim blocks suppressed, only the final arrived
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].0, BlockKind::Final);
    }
}
