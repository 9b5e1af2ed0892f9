//! Event payload normalization for C2C and group messages, with the
//! voice-ASR fallback contract: when transcription fails the user gets a
//! notice and the agent never sees the message.

use std::sync::Arc;

use {serde_json::Value, tracing::warn};

use {
    qiao_common::{Attachment, ChannelKind, ChatType, InboundEnvelope, MediaKind},
    qiao_media::DownloadRequest,
};

use crate::state::AccountState;

/// Event types that carry chat messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageEvent {
    C2c,
    GroupAt,
    ChannelAt,
}

impl MessageEvent {
    #[must_use]
    pub fn parse(event_type: &str) -> Option<Self> {
        match event_type {
            "C2C_MESSAGE_CREATE" => Some(Self::C2c),
            "GROUP_AT_MESSAGE_CREATE" => Some(Self::GroupAt),
            "AT_MESSAGE_CREATE" => Some(Self::ChannelAt),
            _ => None,
        }
    }

    #[must_use]
    pub fn chat_type(&self) -> ChatType {
        match self {
            Self::C2c => ChatType::Direct,
            Self::GroupAt | Self::ChannelAt => ChatType::Group,
        }
    }
}

/// Outcome of normalization.
pub enum Normalized {
    /// Dispatch to the host.
    Ready(InboundEnvelope),
    /// Send this text back to the user and stop (ASR failure path).
    ReplyDirect { message_id: String, text: String },
    /// Nothing to do.
    Skip,
}

/// Normalize one `op:0` dispatch payload.
pub async fn normalize(
    state: &Arc<AccountState>,
    event: MessageEvent,
    data: &Value,
) -> Normalized {
    let Some(message_id) = data.get("id").and_then(Value::as_str) else {
        return Normalized::Skip;
    };

    let (sender_id, peer_id) = match event {
        MessageEvent::C2c => {
            let user = author_id(data, &["user_openid", "union_openid", "id"]);
            (user.clone(), user)
        },
        MessageEvent::GroupAt => (
            author_id(data, &["member_openid", "union_openid", "id"]),
            data.get("group_openid")
                .and_then(Value::as_str)
                .unwrap_or("unknown-group")
                .to_string(),
        ),
        MessageEvent::ChannelAt => (
            author_id(data, &["id", "union_openid"]),
            data.get("channel_id")
                .and_then(Value::as_str)
                .unwrap_or("unknown-channel")
                .to_string(),
        ),
    };

    let mut body_parts: Vec<String> = Vec::new();
    let content = data
        .get("content")
        .and_then(Value::as_str)
        .map(strip_leading_mention)
        .unwrap_or_default();
    if !content.is_empty() {
        body_parts.push(content);
    }

    let mut attachments: Vec<Attachment> = Vec::new();
    if let Some(items) = data.get("attachments").and_then(Value::as_array) {
        for item in items {
            match handle_attachment(state, item).await {
                AttachmentOutcome::Body { token, attachment } => {
                    body_parts.push(token);
                    attachments.push(attachment);
                },
                AttachmentOutcome::AsrFailed => {
                    return Normalized::ReplyDirect {
                        message_id: message_id.to_string(),
                        text: "语音识别暂时不可用，请用文字再说一次。".to_string(),
                    };
                },
                AttachmentOutcome::Skip => {},
            }
        }
    }

    if body_parts.is_empty() && attachments.is_empty() {
        return Normalized::Skip;
    }

    let timestamp_ms = data
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(parse_rfc3339_ms)
        .unwrap_or_else(now_ms);

    let body = body_parts.join("\n");
    Normalized::Ready(InboundEnvelope {
        channel: ChannelKind::Qqbot,
        account_id: state.account_id.clone(),
        message_id: message_id.to_string(),
        message_sid: None,
        timestamp_ms,
        chat_type: event.chat_type(),
        sender_id,
        sender_name: data
            .pointer("/author/username")
            .and_then(Value::as_str)
            .map(str::to_string),
        peer_id,
        raw_body: body.clone(),
        body,
        attachments,
        // group events only fire on @-mention
        was_mentioned: event.chat_type() == ChatType::Group,
    })
}

enum AttachmentOutcome {
    Body {
        token: String,
        attachment: Attachment,
    },
    AsrFailed,
    Skip,
}

async fn handle_attachment(state: &Arc<AccountState>, item: &Value) -> AttachmentOutcome {
    let Some(url) = item
        .get("url")
        .and_then(Value::as_str)
        .map(normalize_attachment_url)
    else {
        return AttachmentOutcome::Skip;
    };
    let content_type = item
        .get("content_type")
        .and_then(Value::as_str)
        .unwrap_or("");
    let file_name = item.get("filename").and_then(Value::as_str);

    let kind = if content_type.starts_with("image") {
        MediaKind::Image
    } else if content_type.starts_with("audio") || content_type.contains("voice") {
        MediaKind::Voice
    } else {
        MediaKind::File
    };
    let prefix = match kind {
        MediaKind::Image => "img",
        MediaKind::Voice => "voice",
        _ => "file",
    };

    let request = DownloadRequest {
        url: url.clone(),
        file_name: file_name.map(str::to_string),
        prefix: prefix.to_string(),
        max_bytes: state.config.common.max_file_size_bytes(),
        bearer: None,
        decryptor: None,
    };
    let saved = match state.downloader.download(&request).await {
        Ok(path) => {
            let archived = state.archive.archive(&path).await;
            state.archive.prune().await;
            Some(archived)
        },
        Err(error) => {
            warn!(error = %error, "qqbot attachment download failed");
            None
        },
    };

    let label = kind.as_str();
    let mut token = match &saved {
        Some(path) => format!("[{label}] saved:{}", path.display()),
        None => format!("[{label}] {url}"),
    };

    let mut transcript = None;
    if kind == MediaKind::Voice {
        match transcribe_voice(state, saved.as_deref()).await {
            VoiceText::Transcript(text) => {
                token.push_str(&format!("\n[recognition] {text}"));
                transcript = Some(text);
            },
            VoiceText::Unavailable => {},
            VoiceText::Failed => return AttachmentOutcome::AsrFailed,
        }
    }

    AttachmentOutcome::Body {
        token,
        attachment: Attachment {
            kind,
            source: url,
            saved_path: saved,
            transcript,
            file_name: file_name.map(str::to_string),
        },
    }
}

enum VoiceText {
    Transcript(String),
    /// ASR disabled or unconfigured; the voice goes through untranscribed.
    Unavailable,
    Failed,
}

async fn transcribe_voice(
    state: &Arc<AccountState>,
    saved: Option<&std::path::Path>,
) -> VoiceText {
    let Some(transcriber) = &state.transcriber else {
        return VoiceText::Unavailable;
    };
    let Some(path) = saved else {
        return VoiceText::Failed;
    };
    let format = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("amr")
        .to_ascii_lowercase();
    let audio = match tokio::fs::read(path).await {
        Ok(audio) => audio,
        Err(error) => {
            warn!(error = %error, "qqbot voice read failed");
            return VoiceText::Failed;
        },
    };
    match transcriber.transcribe(&audio, &format).await {
        Ok(text) => VoiceText::Transcript(text),
        Err(error) => {
            warn!(error = %error, "qqbot voice transcription failed");
            VoiceText::Failed
        },
    }
}

fn author_id(data: &Value, keys: &[&str]) -> String {
    let author = data.get("author");
    for key in keys {
        if let Some(id) = author
            .and_then(|a| a.get(*key))
            .and_then(Value::as_str)
            .filter(|v| !v.is_empty())
        {
            return id.to_string();
        }
    }
    "unknown".to_string()
}

/// Group contents arrive as `" /cmd rest"` or with a leading mention tag.
fn strip_leading_mention(content: &str) -> String {
    let mut text = content.trim();
    while let Some(rest) = text.strip_prefix("<@!").or_else(|| text.strip_prefix("<@")) {
        match rest.find('>') {
            Some(end) => text = rest[end + 1..].trim_start(),
            None => break,
        }
    }
    text.trim().to_string()
}

/// Attachment URLs sometimes arrive scheme-less.
fn normalize_attachment_url(url: &str) -> String {
    let url = url.trim();
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("https://{url}")
    }
}

/// Timestamps arrive either as RFC3339 or as unix seconds.
fn parse_rfc3339_ms(value: &str) -> Option<i64> {
    let trimmed = value.trim();
    if let Ok(secs) = trimmed.parse::<i64>() {
        return Some(secs * 1000);
    }
    chrono::DateTime::parse_from_rfc3339(trimmed)
        .ok()
        .map(|dt| dt.timestamp_millis())
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn message_event_mapping() {
        assert_eq!(
            MessageEvent::parse("C2C_MESSAGE_CREATE"),
            Some(MessageEvent::C2c)
        );
        assert_eq!(
            MessageEvent::parse("GROUP_AT_MESSAGE_CREATE"),
            Some(MessageEvent::GroupAt)
        );
        assert_eq!(MessageEvent::parse("GROUP_MSG_REJECT"), None);
        assert_eq!(MessageEvent::GroupAt.chat_type(), ChatType::Group);
    }

    #[test]
    fn mention_tags_are_stripped() {
        assert_eq!(strip_leading_mention("<@!123> hello"), "hello");
        assert_eq!(strip_leading_mention("<@123><@456> hi"), "hi");
        assert_eq!(strip_leading_mention("  plain  "), "plain");
        assert_eq!(strip_leading_mention("<@unclosed"), "<@unclosed");
    }

    #[test]
    fn scheme_less_urls_get_https() {
        assert_eq!(
            normalize_attachment_url("gchat.qpic.cn/img/1"),
            "https://gchat.qpic.cn/img/1"
        );
        assert_eq!(
            normalize_attachment_url("https://a.example/x"),
            "https://a.example/x"
        );
    }

    #[test]
    fn author_id_preference_order() {
        let data = json!({ "author": { "union_openid": "u2", "id": "u3" } });
        assert_eq!(author_id(&data, &["user_openid", "union_openid", "id"]), "u2");
        let empty = json!({});
        assert_eq!(author_id(&empty, &["user_openid"]), "unknown");
    }
}
