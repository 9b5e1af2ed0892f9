//! Buffered reply dispatch: the host streams reply blocks, the gateway
//! forwards them to a per-message deliverer that owns chunking and the
//! actual platform sends.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use {
    async_trait::async_trait,
    serde_json::Value,
    tokio::sync::Mutex,
    tracing::{debug, warn},
};

use qiao_common::{ChannelKind, ChatType, InboundEnvelope};

/// Kind of a streamed reply block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Typing,
    Interim,
    Final,
}

impl BlockKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Typing => "typing",
            Self::Interim => "interim",
            Self::Final => "final",
        }
    }
}

/// Per-message delivery callback. Implementations capture the send context
/// (channel outbound, peer, limits) and perform table conversion, chunking,
/// and the platform sends.
#[async_trait]
pub trait ReplyDeliverer: Send + Sync {
    async fn deliver(&self, kind: BlockKind, text: &str) -> anyhow::Result<()>;
}

/// Artificial pacing between interim deliveries, to read less bursty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HumanDelayConfig {
    pub min_ms: u64,
    pub max_ms: u64,
}

/// Read a human-delay block from opaque host config.
#[must_use]
pub fn resolve_human_delay_config(config: Option<&Value>) -> HumanDelayConfig {
    let Some(value) = config else {
        return HumanDelayConfig::default();
    };
    let min_ms = value.get("minMs").and_then(Value::as_u64).unwrap_or(0);
    let max_ms = value
        .get("maxMs")
        .and_then(Value::as_u64)
        .unwrap_or(min_ms)
        .max(min_ms);
    HumanDelayConfig { min_ms, max_ms }
}

#[derive(Debug, Clone, Default)]
pub struct ReplyDispatcherOptions {
    /// Suppress interim blocks; only the final text is sent.
    pub reply_final_only: bool,
    pub human_delay: Option<HumanDelayConfig>,
}

/// What `create_reply_dispatcher` hands back to the caller.
pub struct ReplyDispatcherHandle {
    pub dispatcher: Arc<BufferedReplyDispatcher>,
    pub reply_options: ReplyDispatcherOptions,
}

/// Accumulates streamed blocks and forwards them to the deliverer.
///
/// Delivery errors are logged per block kind and never interrupt the
/// stream; the host keeps feeding blocks regardless.
pub struct BufferedReplyDispatcher {
    deliverer: Arc<dyn ReplyDeliverer>,
    options: ReplyDispatcherOptions,
    accumulated: Mutex<String>,
    idle: AtomicBool,
}

impl BufferedReplyDispatcher {
    /// Feed one block from the host reply stream.
    pub async fn dispatch(&self, kind: BlockKind, text: &str) {
        match kind {
            BlockKind::Typing => {
                self.forward(BlockKind::Typing, text).await;
            },
            BlockKind::Interim => {
                {
                    let mut acc = self.accumulated.lock().await;
                    *acc = text.to_string();
                }
                if !self.options.reply_final_only {
                    if let Some(delay) = self.options.human_delay
                        && delay.min_ms > 0
                    {
                        tokio::time::sleep(std::time::Duration::from_millis(delay.min_ms)).await;
                    }
                    self.forward(BlockKind::Interim, text).await;
                }
            },
            BlockKind::Final => {
                {
                    let mut acc = self.accumulated.lock().await;
                    *acc = text.to_string();
                }
                self.forward(BlockKind::Final, text).await;
            },
        }
    }

    /// The latest text seen, for fallback paths after a failure.
    pub async fn accumulated(&self) -> String {
        self.accumulated.lock().await.clone()
    }

    pub fn mark_dispatch_idle(&self) {
        self.idle.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.idle.load(Ordering::Acquire)
    }

    async fn forward(&self, kind: BlockKind, text: &str) {
        if let Err(error) = self.deliverer.deliver(kind, text).await {
            warn!(kind = kind.as_str(), error = %error, "reply block delivery failed");
        } else {
            debug!(kind = kind.as_str(), chars = text.chars().count(), "reply block delivered");
        }
    }
}

/// Host-side reply production: the host runs the agent for the routed
/// session and feeds reply blocks into the buffered dispatcher.
#[async_trait]
pub trait ReplyDispatchPort: Send + Sync {
    async fn dispatch_reply_with_buffered_dispatcher(
        &self,
        route: &crate::router::AgentRoute,
        agent_body: &str,
        dispatcher: Arc<BufferedReplyDispatcher>,
    ) -> crate::error::HostResult<()>;
}

/// Port that produces no reply (standalone channel testing).
pub struct NoopReplyDispatchPort;

#[async_trait]
impl ReplyDispatchPort for NoopReplyDispatchPort {
    async fn dispatch_reply_with_buffered_dispatcher(
        &self,
        _route: &crate::router::AgentRoute,
        _agent_body: &str,
        _dispatcher: Arc<BufferedReplyDispatcher>,
    ) -> crate::error::HostResult<()> {
        Ok(())
    }
}

/// Build a buffered dispatcher around a per-message deliverer.
#[must_use]
pub fn create_reply_dispatcher(
    options: ReplyDispatcherOptions,
    deliverer: Arc<dyn ReplyDeliverer>,
) -> ReplyDispatcherHandle {
    ReplyDispatcherHandle {
        reply_options: options.clone(),
        dispatcher: Arc::new(BufferedReplyDispatcher {
            deliverer,
            options,
            accumulated: Mutex::new(String::new()),
            idle: AtomicBool::new(false),
        }),
    }
}

// ── envelope formatting ─────────────────────────────────────────────────────

/// How the agent-facing envelope header is rendered for a channel.
#[derive(Debug, Clone)]
pub struct EnvelopeFormatOptions {
    pub channel_label: String,
    pub include_sender: bool,
    pub include_elapsed: bool,
}

#[must_use]
pub fn resolve_envelope_format_options(channel: ChannelKind) -> EnvelopeFormatOptions {
    let channel_label = match channel {
        ChannelKind::Dingtalk => "DingTalk",
        ChannelKind::Feishu => "Feishu",
        ChannelKind::Wecom => "WeCom",
        ChannelKind::WecomApp => "WeCom App",
        ChannelKind::Qqbot => "QQ",
    };
    EnvelopeFormatOptions {
        channel_label: channel_label.to_string(),
        include_sender: true,
        include_elapsed: true,
    }
}

/// Wrap `raw_body` with the channel label, sender, and time since the
/// session was last active.
#[must_use]
pub fn format_agent_envelope(
    envelope: &InboundEnvelope,
    previous_updated_at_ms: Option<i64>,
    now_ms: i64,
    options: &EnvelopeFormatOptions,
) -> String {
    let mut header = format!("[{}]", options.channel_label);
    if options.include_sender {
        let name = envelope
            .sender_name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or(&envelope.sender_id);
        header.push_str(&format!(" {name}"));
        if name != envelope.sender_id {
            header.push_str(&format!(" ({})", envelope.sender_id));
        }
    }
    if options.include_elapsed
        && let Some(previous) = previous_updated_at_ms
    {
        let elapsed_min = (now_ms.saturating_sub(previous)) / 60_000;
        if elapsed_min > 0 {
            header.push_str(&format!(" · last active {elapsed_min}m ago"));
        }
    }
    format!("{header}\n{}", envelope.body)
}

/// Final admission check before dispatch: an empty message without
/// attachments is only worth the agent's time when it was a DM or an
/// explicit mention.
#[must_use]
pub fn finalize_inbound_context(envelope: &mut InboundEnvelope) -> bool {
    envelope.body = envelope.body.trim().to_string();
    envelope.raw_body = envelope.raw_body.trim().to_string();
    if envelope.body.is_empty() && envelope.attachments.is_empty() {
        return envelope.was_mentioned || envelope.chat_type == ChatType::Direct;
    }
    true
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    struct RecordingDeliverer {
        delivered: Mutex<Vec<(BlockKind, String)>>,
        failures: AtomicUsize,
        fail_interim: bool,
    }

    impl RecordingDeliverer {
        fn new(fail_interim: bool) -> Arc<Self> {
            Arc::new(Self {
                delivered: Mutex::new(Vec::new()),
                failures: AtomicUsize::new(0),
                fail_interim,
            })
        }
    }

    #[async_trait]
    impl ReplyDeliverer for RecordingDeliverer {
        async fn deliver(&self, kind: BlockKind, text: &str) -> anyhow::Result<()> {
            if self.fail_interim && kind == BlockKind::Interim {
                self.failures.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("interim send failed");
            }
            self.delivered.lock().await.push((kind, text.to_string()));
            Ok(())
        }
    }

    fn envelope(body: &str, chat_type: ChatType, mentioned: bool) -> InboundEnvelope {
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
            body: body.into(),
            raw_body: body.into(),
            attachments: Vec::new(),
            was_mentioned: mentioned,
        }
    }

    #[tokio::test]
    async fn final_only_suppresses_interim_blocks() {
        let deliverer = RecordingDeliverer::new(false);
        let handle = create_reply_dispatcher(
            ReplyDispatcherOptions {
                reply_final_only: true,
                human_delay: None,
            },
            deliverer.clone(),
        );
        handle.dispatcher.dispatch(BlockKind::Interim, "partial").await;
        handle.dispatcher.dispatch(BlockKind::Final, "done").await;

        let delivered = deliverer.delivered.lock().await;
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0], (BlockKind::Final, "done".to_string()));
    }

    #[tokio::test]
    async fn delivery_errors_do_not_interrupt_the_stream() {
        let deliverer = RecordingDeliverer::new(true);
        let handle = create_reply_dispatcher(ReplyDispatcherOptions::default(), deliverer.clone());
        handle.dispatcher.dispatch(BlockKind::Interim, "a").await;
        handle.dispatcher.dispatch(BlockKind::Interim, "ab").await;
        handle.dispatcher.dispatch(BlockKind::Final, "abc").await;

        assert_eq!(deliverer.failures.load(Ordering::SeqCst), 2);
        let delivered = deliverer.delivered.lock().await;
        assert_eq!(delivered.len(), 1, "final still goes out");
        assert_eq!(handle.dispatcher.accumulated().await, "abc");
    }

    #[tokio::test]
    async fn idle_flag_flips_once_marked() {
        let handle =
            create_reply_dispatcher(ReplyDispatcherOptions::default(), RecordingDeliverer::new(false));
        assert!(!handle.dispatcher.is_idle());
        handle.dispatcher.mark_dispatch_idle();
        assert!(handle.dispatcher.is_idle());
    }

    #[test]
    fn empty_group_message_without_mention_is_not_dispatched() {
        let mut env = envelope("   ", ChatType::Group, false);
        assert!(!finalize_inbound_context(&mut env));

        let mut env = envelope("", ChatType::Group, true);
        assert!(finalize_inbound_context(&mut env));

        let mut env = envelope("", ChatType::Direct, false);
        assert!(finalize_inbound_context(&mut env));
    }

    #[test]
    fn envelope_header_carries_label_sender_and_elapsed() {
        let env = envelope("hello", ChatType::Direct, false);
        let options = resolve_envelope_format_options(ChannelKind::Dingtalk);
        let text = format_agent_envelope(&env, Some(0), 5 * 60_000, &options);
        assert_eq!(text, "[DingTalk] Alice (u1) · last active 5m ago\nhello");
    }

    #[test]
    fn human_delay_resolution_clamps_max_to_min() {
        let value = serde_json::json!({ "minMs": 400, "maxMs": 100 });
        let delay = resolve_human_delay_config(Some(&value));
        assert_eq!(delay.min_ms, 400);
        assert_eq!(delay.max_ms, 400);
    }
}
