use std::sync::Arc;

use {anyhow::Result, async_trait::async_trait, serde::Serialize, serde_json::Value};

use {
    qiao_common::{ChannelKind, ChatType, InboundEnvelope, ReplyPayload},
    qiao_host::ReplyDeliverer,
};

use crate::directory::{self, TargetRef};

/// Static description of a channel plug-in.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelMeta {
    pub label: &'static str,
    pub description: &'static str,
}

/// What a channel can do, surfaced to the host.
#[derive(Debug, Clone, Serialize)]
pub struct Capabilities {
    pub chat_types: &'static [ChatType],
    /// Inbound/outbound media supported.
    pub media: bool,
    /// Streamed replies supported (cards or interim edits).
    pub reply: bool,
    /// Host-initiated sends supported with sufficient credentials.
    pub active_send: bool,
}

/// How an outbound media send concluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Sent in the requested form.
    Delivered,
    /// The platform refused the form; a substitute (usually a text with a
    /// link) was sent instead.
    FellBack { note: String },
}

/// Send messages to a channel.
#[async_trait]
pub trait ChannelOutbound: Send + Sync {
    async fn send_text(&self, account_id: &str, to: &str, text: &str) -> Result<()>;

    async fn send_media(
        &self,
        account_id: &str,
        to: &str,
        payload: &ReplyPayload,
    ) -> Result<SendOutcome>;

    /// Send a "typing" indicator. No-op by default.
    async fn send_typing(&self, _account_id: &str, _to: &str) -> Result<()> {
        Ok(())
    }
}

/// Where channels hand normalized inbound envelopes. The gateway's
/// dispatch coordinator implements this; channels never talk to the host
/// directly.
#[async_trait]
pub trait InboundSink: Send + Sync {
    /// Dispatch one envelope together with the per-message deliverer that
    /// owns chunking and platform sends for the reply stream.
    async fn dispatch_envelope(&self, envelope: InboundEnvelope, deliverer: Arc<dyn ReplyDeliverer>);
}

/// Point-in-time account health, published on lifecycle transitions.
#[derive(Debug, Clone, Serialize)]
pub struct AccountStatus {
    pub channel: ChannelKind,
    pub account_id: String,
    pub running: bool,
    pub configured: bool,
    pub can_send_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_inbound_at_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Sink for account status changes — the host provides the implementation.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn publish(&self, status: AccountStatus);
}

/// Status sink that discards everything.
pub struct NoopStatusSink;

#[async_trait]
impl StatusSink for NoopStatusSink {
    async fn publish(&self, _status: AccountStatus) {}
}

/// Core channel plugin trait. Each messaging platform implements this.
#[async_trait]
pub trait ChannelPlugin: Send + Sync {
    fn id(&self) -> ChannelKind;

    fn meta(&self) -> ChannelMeta;

    fn capabilities(&self) -> Capabilities;

    /// JSON schema fragment for this channel's account config.
    fn config_schema(&self) -> Value;

    /// Start an account: establish ingress and register webhook routes.
    async fn start_account(&mut self, account_id: &str, config: Value) -> Result<()>;

    /// Stop an account: cancel its task and unregister routes.
    async fn stop_account(&mut self, account_id: &str) -> Result<()>;

    /// Outbound adapter, when the plugin can send.
    fn outbound(&self) -> Option<&dyn ChannelOutbound>;

    /// Whether a host-supplied target string belongs to this channel.
    fn can_resolve(&self, target: &str) -> bool {
        directory::can_resolve(self.id(), target)
    }

    /// Resolve a target string to `{channel, account, peer}`.
    fn resolve_target(&self, target: &str) -> Option<TargetRef> {
        directory::parse_target(self.id(), target)
    }

    /// Resolve a batch of targets, keeping positions for unresolvable ones.
    fn resolve_targets(&self, targets: &[String]) -> Vec<Option<TargetRef>> {
        targets.iter().map(|t| self.resolve_target(t)).collect()
    }

    /// Example target formats, for host tooling.
    fn target_formats(&self) -> &'static [&'static str] {
        &["<peerId>", "user:<userId>", "group:<groupId>", "<peerId>@<accountId>"]
    }
}
