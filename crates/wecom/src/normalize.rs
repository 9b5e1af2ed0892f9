//! AI-robot JSON payload normalization: text, voice, image, file, mixed,
//! and stream-refresh kinds, with encrypted media archival.

use std::sync::Arc;

use {serde_json::Value, tracing::{debug, warn}};

use {
    qiao_common::{Attachment, ChannelKind, ChatType, InboundEnvelope, MediaKind},
    qiao_media::{DownloadRequest, error::Error as MediaError},
};

use crate::state::AccountState;

/// Structured view of one decrypted callback payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedInbound {
    pub msg_id: String,
    pub msg_type: String,
    pub chat_type: ChatType,
    /// Group chat id when `chat_type` is group.
    pub chat_id: Option<String>,
    pub sender_id: String,
    pub response_url: Option<String>,
}

/// Pull the routing envelope out of a decrypted payload. `None` when the
/// payload is not a message (stream refreshes, unknown events).
#[must_use]
pub fn parse_inbound(payload: &Value) -> Option<ParsedInbound> {
    let msg_type = payload
        .get("msgtype")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    if msg_type.is_empty() || msg_type == "stream" || msg_type == "event" {
        return None;
    }

    let chat_type = match payload.get("chattype").and_then(Value::as_str) {
        Some("group") => ChatType::Group,
        _ => ChatType::Direct,
    };

    Some(ParsedInbound {
        msg_id: payload
            .get("msgid")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
        msg_type,
        chat_type,
        chat_id: payload
            .get("chatid")
            .and_then(Value::as_str)
            .map(str::to_string),
        sender_id: payload
            .get("from")
            .and_then(|v| v.get("userid"))
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string(),
        response_url: payload
            .get("response_url")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(str::to_string),
    })
}

/// Build the channel-neutral envelope, downloading and decrypting any
/// attached media.
pub async fn normalize(
    state: &Arc<AccountState>,
    parsed: &ParsedInbound,
    payload: &Value,
) -> Option<InboundEnvelope> {
    let mut attachments: Vec<Attachment> = Vec::new();

    let body = match parsed.msg_type.as_str() {
        "text" => payload
            .get("text")
            .and_then(|v| v.get("content"))
            .and_then(Value::as_str)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())?,
        "voice" => {
            // the platform transcribes robot voice messages server-side
            let transcript = payload
                .get("voice")
                .and_then(|v| v.get("content"))
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty());
            match transcript {
                Some(text) => format!("[voice]\n[recognition] {text}"),
                None => {
                    debug!("wecom voice without transcript dropped");
                    return None;
                },
            }
        },
        "image" => {
            let url = media_url(payload, "image")?;
            fetch_encrypted_media(state, &url, "img", MediaKind::Image, &mut attachments).await
        },
        "file" => {
            let url = media_url(payload, "file")?;
            fetch_encrypted_media(state, &url, "file", MediaKind::File, &mut attachments).await
        },
        "mixed" => {
            let items = payload
                .get("mixed")
                .and_then(|v| v.get("msg_item"))
                .and_then(Value::as_array)?;
            let mut parts: Vec<String> = Vec::new();
            for item in items {
                match item.get("msgtype").and_then(Value::as_str) {
                    Some("text") => {
                        if let Some(text) = item
                            .get("text")
                            .and_then(|v| v.get("content"))
                            .and_then(Value::as_str)
                            .map(str::trim)
                            .filter(|s| !s.is_empty())
                        {
                            parts.push(text.to_string());
                        }
                    },
                    Some("image") => {
                        if let Some(url) = media_url(item, "image") {
                            parts.push(
                                fetch_encrypted_media(
                                    state,
                                    &url,
                                    "img",
                                    MediaKind::Image,
                                    &mut attachments,
                                )
                                .await,
                            );
                        }
                    },
                    _ => {},
                }
            }
            if parts.is_empty() {
                return None;
            }
            parts.join("\n")
        },
        other => {
            debug!(msg_type = other, "wecom payload kind ignored");
            return None;
        },
    };

    let peer_id = match parsed.chat_type {
        ChatType::Group => parsed
            .chat_id
            .clone()
            .unwrap_or_else(|| parsed.sender_id.clone()),
        ChatType::Direct => parsed.sender_id.clone(),
    };
    let now_ms = now_ms();
    let message_id = if parsed.msg_id.is_empty() {
        InboundEnvelope::synthesize_message_id(&peer_id, now_ms)
    } else {
        parsed.msg_id.clone()
    };

    Some(InboundEnvelope {
        channel: ChannelKind::Wecom,
        account_id: state.account_id.clone(),
        message_id,
        message_sid: None,
        timestamp_ms: now_ms,
        chat_type: parsed.chat_type,
        sender_id: parsed.sender_id.clone(),
        sender_name: None,
        peer_id,
        raw_body: body.clone(),
        body,
        attachments,
        // group messages only reach the robot when it was @-mentioned
        was_mentioned: parsed.chat_type == ChatType::Group,
    })
}

fn media_url(payload: &Value, key: &str) -> Option<String> {
    payload
        .get(key)
        .and_then(|v| v.get("url"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .map(str::to_string)
}

/// Robot media URLs serve AES-encrypted bodies; decrypt before archiving.
async fn fetch_encrypted_media(
    state: &Arc<AccountState>,
    url: &str,
    prefix: &str,
    kind: MediaKind,
    attachments: &mut Vec<Attachment>,
) -> String {
    let label = kind.as_str();
    let crypto = state.crypto.clone();
    let request = DownloadRequest {
        url: url.to_string(),
        file_name: None,
        prefix: prefix.to_string(),
        max_bytes: state.config.common.max_file_size_bytes(),
        bearer: None,
        decryptor: Some(Arc::new(move |bytes| {
            crypto
                .decrypt_media(&bytes)
                .map_err(|e| qiao_media::Error::external("wecom media decrypt", e))
        })),
    };

    match state.downloader.download(&request).await {
        Ok(path) => {
            let archived = state.archive.archive(&path).await;
            state.archive.prune().await;
            attachments.push(Attachment {
                kind,
                source: url.to_string(),
                saved_path: Some(archived.clone()),
                transcript: None,
                file_name: None,
            });
            format!("[{label}] saved:{}", archived.display())
        },
        Err(MediaError::SizeLimit { max_bytes }) => {
            format!(
                "[{label}] exceeds the {} MB inbound limit and was not saved",
                max_bytes / (1024 * 1024)
            )
        },
        Err(error) => {
            warn!(error = %error, "wecom media download failed");
            format!("[{label}]")
        },
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
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_direct_text_payload() {
        let payload = json!({
            "msgtype": "text",
            "msgid": "m1",
            "chattype": "single",
            "from": { "userid": "alice" },
            "response_url": "https://qyapi.weixin.qq.com/resp/1",
            "text": { "content": "hi" }
        });
        let parsed = parse_inbound(&payload).unwrap();
        assert_eq!(parsed.msg_id, "m1");
        assert_eq!(parsed.chat_type, ChatType::Direct);
        assert_eq!(parsed.sender_id, "alice");
        assert_eq!(
            parsed.response_url.as_deref(),
            Some("https://qyapi.weixin.qq.com/resp/1")
        );
    }

    #[test]
    fn group_payload_maps_chat_id() {
        let payload = json!({
            "msgtype": "text",
            "chattype": "group",
            "chatid": "wr123",
            "from": { "userid": "bob" },
            "text": { "content": "question" }
        });
        let parsed = parse_inbound(&payload).unwrap();
        assert_eq!(parsed.chat_type, ChatType::Group);
        assert_eq!(parsed.chat_id.as_deref(), Some("wr123"));
    }

    #[test]
    fn stream_refresh_and_events_are_ignored() {
        assert!(parse_inbound(&json!({ "msgtype": "stream", "stream": { "id": "s1" } })).is_none());
        assert!(parse_inbound(&json!({ "msgtype": "event", "event": {} })).is_none());
        assert!(parse_inbound(&json!({ "other": true })).is_none());
    }
}
