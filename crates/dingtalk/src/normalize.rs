//! Stream callback normalization: text, rich text, picture, audio (with
//! trusted platform recognition), video, and file message kinds.

use std::sync::Arc;

use {serde_json::Value, tracing::warn};

use {
    qiao_common::{Attachment, ChannelKind, ChatType, InboundEnvelope, MediaKind},
    qiao_media::DownloadRequest,
};

use crate::state::AccountState;

/// Where replies to one inbound message go.
#[derive(Debug, Clone)]
pub struct ReplyTarget {
    /// Short-lived webhook scoped to the conversation.
    pub session_webhook: Option<String>,
    pub conversation_id: String,
    pub sender_staff_id: String,
    pub chat_type: ChatType,
    /// Robot code, needed for card spaces and media downloads.
    pub robot_code: Option<String>,
}

/// Normalize one robot callback message.
pub async fn normalize(
    state: &Arc<AccountState>,
    data: &Value,
) -> Option<(InboundEnvelope, ReplyTarget)> {
    let conversation_id = data
        .get("conversationId")
        .and_then(Value::as_str)?
        .to_string();
    let chat_type = match data.get("conversationType").and_then(Value::as_str) {
        Some("2") => ChatType::Group,
        _ => ChatType::Direct,
    };
    let sender_id = data
        .get("senderStaffId")
        .or_else(|| data.get("senderId"))
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let robot_code = data
        .get("robotCode")
        .or_else(|| data.get("chatbotUserId"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let msg_type = data.get("msgtype").and_then(Value::as_str).unwrap_or("");
    let mut attachments: Vec<Attachment> = Vec::new();
    let body = match msg_type {
        "text" => data
            .pointer("/text/content")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())?
            .to_string(),
        "richText" => {
            let items = data.pointer("/content/richText").and_then(Value::as_array)?;
            let mut parts: Vec<String> = Vec::new();
            for item in items {
                if let Some(text) = item.get("text").and_then(Value::as_str) {
                    let trimmed = text.trim();
                    if !trimmed.is_empty() {
                        parts.push(trimmed.to_string());
                    }
                } else if let Some(code) = item.get("downloadCode").and_then(Value::as_str) {
                    parts.push(
                        fetch_media(
                            state,
                            code,
                            robot_code.as_deref(),
                            MediaKind::Image,
                            None,
                            &mut attachments,
                        )
                        .await,
                    );
                }
            }
            if parts.is_empty() {
                return None;
            }
            parts.join("\n")
        },
        "picture" => {
            let code = data
                .pointer("/content/downloadCode")
                .and_then(Value::as_str)?;
            fetch_media(
                state,
                code,
                robot_code.as_deref(),
                MediaKind::Image,
                None,
                &mut attachments,
            )
            .await
        },
        "audio" => {
            // the platform transcript is trusted as final; no local ASR
            let recognition = data
                .pointer("/content/recognition")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty());
            let code = data.pointer("/content/downloadCode").and_then(Value::as_str);
            let mut body = match code {
                Some(code) => {
                    fetch_media(
                        state,
                        code,
                        robot_code.as_deref(),
                        MediaKind::Voice,
                        None,
                        &mut attachments,
                    )
                    .await
                },
                None => "[voice]".to_string(),
            };
            match recognition {
                Some(text) => {
                    body.push_str(&format!("\n[recognition] {text}"));
                    if let Some(last) = attachments.last_mut() {
                        last.transcript = Some(text.to_string());
                    }
                    body
                },
                None => body,
            }
        },
        "video" => {
            let code = data
                .pointer("/content/downloadCode")
                .and_then(Value::as_str)?;
            fetch_media(
                state,
                code,
                robot_code.as_deref(),
                MediaKind::Video,
                None,
                &mut attachments,
            )
            .await
        },
        "file" => {
            let code = data
                .pointer("/content/downloadCode")
                .and_then(Value::as_str)?;
            let file_name = data
                .pointer("/content/fileName")
                .and_then(Value::as_str)
                .map(str::to_string);
            fetch_media(
                state,
                code,
                robot_code.as_deref(),
                MediaKind::File,
                file_name,
                &mut attachments,
            )
            .await
        },
        other => {
            tracing::debug!(msg_type = other, "dingtalk message kind ignored");
            return None;
        },
    };

    let was_mentioned = data
        .get("isInAtList")
        .and_then(Value::as_bool)
        .unwrap_or_else(|| {
            data.get("atUsers")
                .and_then(Value::as_array)
                .is_some_and(|users| !users.is_empty())
        });

    let now_ms = now_ms();
    let message_id = data
        .get("msgId")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| InboundEnvelope::synthesize_message_id(&conversation_id, now_ms));
    let timestamp_ms = data
        .get("createAt")
        .and_then(Value::as_i64)
        .unwrap_or(now_ms);

    let peer_id = match chat_type {
        ChatType::Group => conversation_id.clone(),
        ChatType::Direct => sender_id.clone(),
    };

    let envelope = InboundEnvelope {
        channel: ChannelKind::Dingtalk,
        account_id: state.account_id.clone(),
        message_id,
        message_sid: data
            .get("sessionWebhook")
            .and_then(Value::as_str)
            .map(str::to_string),
        timestamp_ms,
        chat_type,
        sender_id: sender_id.clone(),
        sender_name: data
            .get("senderNick")
            .and_then(Value::as_str)
            .map(str::to_string),
        peer_id,
        raw_body: body.clone(),
        body,
        attachments,
        was_mentioned,
    };
    let target = ReplyTarget {
        session_webhook: data
            .get("sessionWebhook")
            .and_then(Value::as_str)
            .map(str::to_string),
        conversation_id,
        sender_staff_id: sender_id,
        chat_type,
        robot_code,
    };
    Some((envelope, target))
}

async fn fetch_media(
    state: &Arc<AccountState>,
    download_code: &str,
    robot_code: Option<&str>,
    kind: MediaKind,
    file_name: Option<String>,
    attachments: &mut Vec<Attachment>,
) -> String {
    let label = kind.as_str();
    let prefix = match kind {
        MediaKind::Image => "img",
        MediaKind::Voice => "voice",
        MediaKind::Video => "video",
        MediaKind::File => "file",
    };

    let robot_code = robot_code.unwrap_or_default();
    let url = match state.api.message_file_url(download_code, robot_code).await {
        Ok(url) => url,
        Err(error) => {
            warn!(error = %error, "dingtalk download code resolution failed");
            return format!("[{label}]");
        },
    };

    let request = DownloadRequest {
        url,
        file_name: file_name.clone(),
        prefix: prefix.to_string(),
        max_bytes: state.config.common.max_file_size_bytes(),
        bearer: None,
        decryptor: None,
    };
    match state.downloader.download(&request).await {
        Ok(path) => {
            let archived = state.archive.archive(&path).await;
            state.archive.prune().await;
            attachments.push(Attachment {
                kind,
                source: download_code.to_string(),
                saved_path: Some(archived.clone()),
                transcript: None,
                file_name,
            });
            format!("[{label}] saved:{}", archived.display())
        },
        Err(error) => {
            warn!(error = %error, "dingtalk media download failed");
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
    use std::sync::Arc;

    use {
        async_trait::async_trait,
        qiao_channels::{InboundSink, gating::Policy},
        qiao_host::ReplyDeliverer,
        qiao_media::{Downloader, MediaArchive},
        secrecy::Secret,
        serde_json::json,
        tokio_util::sync::CancellationToken,
    };

    use {
        super::*,
        crate::{config::DingTalkConfig, token::DingTalkApi},
    };

    struct NullSink;

    #[async_trait]
    impl InboundSink for NullSink {
        async fn dispatch_envelope(
            &self,
            _envelope: InboundEnvelope,
            _deliverer: Arc<dyn ReplyDeliverer>,
        ) {
        }
    }

    fn state(dir: &std::path::Path) -> Arc<AccountState> {
        Arc::new(AccountState {
            account_id: "default".into(),
            config: DingTalkConfig::default(),
            policy: Policy::standard(),
            api: Arc::new(
                DingTalkApi::new("key", Secret::new("secret".into()))
                    .unwrap()
                    .with_base_url("http://127.0.0.1:1"),
            ),
            downloader: Arc::new(Downloader::new(dir.join("tmp")).unwrap()),
            archive: Arc::new(MediaArchive::new(dir.join("tmp"), dir.join("media"), 7).unwrap()),
            sink: Arc::new(NullSink),
            cancel: CancellationToken::new(),
            queue: qiao_channels::SerialQueue::new(CancellationToken::new()),
        })
    }

    #[tokio::test]
    async fn group_text_with_mention_normalizes_per_contract() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());
        let data = json!({
            "conversationType": "2",
            "conversationId": "cv1",
            "senderStaffId": "u1",
            "senderNick": "Alice",
            "msgId": "msg-1",
            "msgtype": "text",
            "atUsers": [{ "dingtalkId": "bot" }],
            "isInAtList": true,
            "sessionWebhook": "https://oapi.dingtalk.com/robot/sendBySession?session=s1",
            "text": { "content": "hello" }
        });

        let (envelope, target) = normalize(&state, &data).await.unwrap();
        assert_eq!(envelope.peer_id, "cv1");
        assert!(envelope.was_mentioned);
        assert_eq!(envelope.body, "hello");
        assert_eq!(envelope.chat_type, ChatType::Group);
        assert_eq!(envelope.sender_id, "u1");
        assert_eq!(envelope.message_id, "msg-1");
        assert_eq!(target.conversation_id, "cv1");
        assert!(target.session_webhook.is_some());
    }

    #[tokio::test]
    async fn dm_peer_is_the_sender() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());
        let data = json!({
            "conversationType": "1",
            "conversationId": "cid-dm",
            "senderStaffId": "u9",
            "msgtype": "text",
            "text": { "content": "hi" }
        });
        let (envelope, _) = normalize(&state, &data).await.unwrap();
        assert_eq!(envelope.chat_type, ChatType::Direct);
        assert_eq!(envelope.peer_id, "u9");
        assert!(!envelope.was_mentioned);
        // no msgId in payload: synthesized from the conversation
        assert!(envelope.message_id.starts_with("cid-dm_"));
    }

    #[tokio::test]
    async fn audio_recognition_is_trusted_as_transcript() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());
        let data = json!({
            "conversationType": "1",
            "conversationId": "c1",
            "senderStaffId": "u1",
            "msgId": "m2",
            "msgtype": "audio",
            "content": { "recognition": "明天开会" }
        });
        let (envelope, _) = normalize(&state, &data).await.unwrap();
        assert_eq!(envelope.body, "[voice]\n[recognition] 明天开会");
    }

    #[tokio::test]
    async fn unsupported_kinds_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());
        let data = json!({
            "conversationType": "1",
            "conversationId": "c1",
            "senderStaffId": "u1",
            "msgtype": "geo"
        });
        assert!(normalize(&state, &data).await.is_none());
    }
}
