//! `im.message.receive_v1` normalization: text with mention markers,
//! rich-text posts, images, files, and audio.

use std::sync::Arc;

use {serde_json::Value, tracing::{debug, warn}};

use {
    qiao_common::{Attachment, ChannelKind, ChatType, InboundEnvelope, MediaKind},
    qiao_media::DownloadRequest,
};

use crate::state::AccountState;

/// The message-receive event type this channel consumes.
pub const EVENT_MESSAGE_RECEIVE: &str = "im.message.receive_v1";

/// Normalize one message-receive event.
pub async fn normalize(state: &Arc<AccountState>, event: &Value) -> Option<InboundEnvelope> {
    let message = event.get("message")?;
    let message_id = message.get("message_id").and_then(Value::as_str)?;
    let chat_id = message.get("chat_id").and_then(Value::as_str)?;
    let chat_type = match message.get("chat_type").and_then(Value::as_str) {
        Some("p2p") => ChatType::Direct,
        _ => ChatType::Group,
    };
    let sender_id = event
        .pointer("/sender/sender_id/open_id")
        .or_else(|| event.pointer("/sender/sender_id/user_id"))
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();

    let message_type = message
        .get("message_type")
        .and_then(Value::as_str)
        .unwrap_or("");
    let content: Value = message
        .get("content")
        .and_then(Value::as_str)
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or(Value::Null);
    let mentions = message.get("mentions").and_then(Value::as_array);

    let mut attachments: Vec<Attachment> = Vec::new();
    let body = match message_type {
        "text" => {
            let text = content.get("text").and_then(Value::as_str)?;
            let replaced = replace_mentions(text, mentions);
            if replaced.is_empty() {
                return None;
            }
            replaced
        },
        "post" => {
            let mut parts: Vec<String> = Vec::new();
            if let Some(title) = content
                .get("title")
                .and_then(Value::as_str)
                .filter(|t| !t.trim().is_empty())
            {
                parts.push(title.trim().to_string());
            }
            if let Some(lines) = content.get("content").and_then(Value::as_array) {
                for line in lines.iter().filter_map(Value::as_array) {
                    let mut rendered = String::new();
                    for node in line {
                        match node.get("tag").and_then(Value::as_str) {
                            Some("text") => {
                                if let Some(text) = node.get("text").and_then(Value::as_str) {
                                    rendered.push_str(text);
                                }
                            },
                            Some("a") => {
                                let text = node.get("text").and_then(Value::as_str).unwrap_or("");
                                let href = node.get("href").and_then(Value::as_str).unwrap_or("");
                                rendered.push_str(&format!("{text} ({href})"));
                            },
                            Some("at") => rendered.push_str("@"),
                            Some("img") => {
                                if let Some(key) =
                                    node.get("image_key").and_then(Value::as_str)
                                {
                                    rendered.push_str(
                                        &fetch_resource(
                                            state,
                                            message_id,
                                            key,
                                            MediaKind::Image,
                                            None,
                                            &mut attachments,
                                        )
                                        .await,
                                    );
                                }
                            },
                            _ => {},
                        }
                    }
                    if !rendered.trim().is_empty() {
                        parts.push(rendered.trim().to_string());
                    }
                }
            }
            if parts.is_empty() {
                return None;
            }
            parts.join("\n")
        },
        "image" => {
            let key = content.get("image_key").and_then(Value::as_str)?;
            fetch_resource(state, message_id, key, MediaKind::Image, None, &mut attachments).await
        },
        "file" => {
            let key = content.get("file_key").and_then(Value::as_str)?;
            let name = content
                .get("file_name")
                .and_then(Value::as_str)
                .map(str::to_string);
            fetch_resource(state, message_id, key, MediaKind::File, name, &mut attachments).await
        },
        "audio" => {
            let key = content.get("file_key").and_then(Value::as_str)?;
            fetch_resource(state, message_id, key, MediaKind::Voice, None, &mut attachments).await
        },
        other => {
            debug!(message_type = other, "feishu message kind ignored");
            return None;
        },
    };

    let was_mentioned = mentions.is_some_and(|m| !m.is_empty());
    let timestamp_ms = message
        .get("create_time")
        .and_then(Value::as_str)
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or_else(now_ms);

    let peer_id = match chat_type {
        ChatType::Group => chat_id.to_string(),
        ChatType::Direct => sender_id.clone(),
    };
    Some(InboundEnvelope {
        channel: ChannelKind::Feishu,
        account_id: state.account_id.clone(),
        message_id: message_id.to_string(),
        message_sid: Some(chat_id.to_string()),
        timestamp_ms,
        chat_type,
        sender_id,
        sender_name: None,
        peer_id,
        raw_body: body.clone(),
        body,
        attachments,
        was_mentioned,
    })
}

/// Replace `@_user_N` markers with the mention display names.
fn replace_mentions(text: &str, mentions: Option<&Vec<Value>>) -> String {
    let mut output = text.to_string();
    if let Some(mentions) = mentions {
        for mention in mentions {
            let (Some(key), Some(name)) = (
                mention.get("key").and_then(Value::as_str),
                mention.get("name").and_then(Value::as_str),
            ) else {
                continue;
            };
            output = output.replace(key, &format!("@{name}"));
        }
    }
    output.trim().to_string()
}

async fn fetch_resource(
    state: &Arc<AccountState>,
    message_id: &str,
    file_key: &str,
    kind: MediaKind,
    file_name: Option<String>,
    attachments: &mut Vec<Attachment>,
) -> String {
    let label = kind.as_str();
    let (prefix, resource_type) = match kind {
        MediaKind::Image => ("img", "image"),
        MediaKind::Voice => ("voice", "file"),
        MediaKind::Video => ("video", "file"),
        MediaKind::File => ("file", "file"),
    };

    let bearer = match state.api.tenant_access_token().await {
        Ok(token) => token,
        Err(error) => {
            warn!(error = %error, "feishu token for media download failed");
            return format!("[{label}]");
        },
    };
    let request = DownloadRequest {
        url: state.api.message_resource_url(message_id, file_key, resource_type),
        file_name: file_name.clone(),
        prefix: prefix.to_string(),
        max_bytes: state.config.common.max_file_size_bytes(),
        bearer: Some(bearer),
        decryptor: None,
    };
    match state.downloader.download(&request).await {
        Ok(path) => {
            let archived = state.archive.archive(&path).await;
            state.archive.prune().await;
            attachments.push(Attachment {
                kind,
                source: file_key.to_string(),
                saved_path: Some(archived.clone()),
                transcript: None,
                file_name,
            });
            format!("[{label}] saved:{}", archived.display())
        },
        Err(error) => {
            warn!(error = %error, "feishu media download failed");
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
    fn mention_markers_become_names() {
        let mentions = vec![json!({ "key": "@_user_1", "name": "qiao-bot" })];
        assert_eq!(
            replace_mentions("@_user_1 hello", Some(&mentions)),
            "@qiao-bot hello"
        );
        assert_eq!(replace_mentions("plain", None), "plain");
    }
}
