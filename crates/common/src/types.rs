use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// The messaging platforms this gateway bridges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelKind {
    Dingtalk,
    Feishu,
    Wecom,
    WecomApp,
    Qqbot,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 5] = [
        Self::Dingtalk,
        Self::Feishu,
        Self::Wecom,
        Self::WecomApp,
        Self::Qqbot,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dingtalk => "dingtalk",
            Self::Feishu => "feishu",
            Self::Wecom => "wecom",
            Self::WecomApp => "wecom-app",
            Self::Qqbot => "qqbot",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "dingtalk" => Some(Self::Dingtalk),
            "feishu" => Some(Self::Feishu),
            "wecom" => Some(Self::Wecom),
            "wecom-app" => Some(Self::WecomApp),
            "qqbot" => Some(Self::Qqbot),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether an inbound message arrived in a direct chat or a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatType {
    Direct,
    Group,
}

/// Coarse media classification shared by the media service and senders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Voice,
    Video,
    File,
}

impl MediaKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Voice => "voice",
            Self::Video => "video",
            Self::File => "file",
        }
    }
}

/// One inbound attachment, after the media service has had a chance to
/// archive it locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub kind: MediaKind,
    /// Platform-side origin: a download URL or a `media_id`.
    pub source: String,
    /// Absolute path of the archived copy, when the download succeeded.
    #[serde(default)]
    pub saved_path: Option<PathBuf>,
    /// Voice transcript (platform-provided or ASR), when available.
    #[serde(default)]
    pub transcript: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
}

/// The channel-neutral inbound message handed to the host runtime.
///
/// `message_id` is the host's de-duplication key and must be stable per
/// platform message. `body` carries `saved:<abs-path>` reference tokens for
/// archived media; `raw_body` is the canonical text before envelope
/// decoration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEnvelope {
    pub channel: ChannelKind,
    pub account_id: String,
    pub message_id: String,
    /// Platform stream/session id, when distinct from `message_id`.
    #[serde(default)]
    pub message_sid: Option<String>,
    pub timestamp_ms: i64,
    pub chat_type: ChatType,
    pub sender_id: String,
    #[serde(default)]
    pub sender_name: Option<String>,
    /// User id for DMs, group/conversation id for groups.
    pub peer_id: String,
    pub body: String,
    pub raw_body: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub was_mentioned: bool,
}

impl InboundEnvelope {
    /// Fallback message id when the platform supplies none.
    #[must_use]
    pub fn synthesize_message_id(conversation_id: &str, now_ms: i64) -> String {
        format!("{conversation_id}_{now_ms}")
    }
}

/// Outbound media descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaPayload {
    /// HTTP(S) URL or absolute local path.
    pub url: String,
    pub mime_type: String,
    #[serde(default)]
    pub file_name: Option<String>,
}

/// One outbound reply unit: text, optionally with media attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyPayload {
    pub text: String,
    #[serde(default)]
    pub media: Option<MediaPayload>,
}

impl ReplyPayload {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            media: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_kind_round_trips_through_serde_names() {
        for kind in ChannelKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
            assert_eq!(ChannelKind::parse(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn channel_kind_rejects_unknown_tags() {
        assert_eq!(ChannelKind::parse("wechat"), None);
        assert_eq!(ChannelKind::parse("WECOM"), None);
    }

    #[test]
    fn synthesized_message_id_embeds_conversation() {
        let id = InboundEnvelope::synthesize_message_id("cv1", 1700000000000);
        assert_eq!(id, "cv1_1700000000000");
    }
}
