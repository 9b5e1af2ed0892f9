//! im/v1 message sends: chunked text or interactive markdown cards, plus
//! image and file uploads.

use std::sync::Arc;

use {
    anyhow::Result,
    async_trait::async_trait,
    serde_json::json,
    tracing::warn,
};

use {
    qiao_channels::{ChannelOutbound, SendOutcome},
    qiao_common::{ChannelKind, ChatType, InboundEnvelope, MediaKind, ReplyPayload},
    qiao_host::{
        BlockKind, ReplyDeliverer,
        text::{chunk_markdown_text, convert_markdown_tables, resolve_markdown_table_mode, resolve_text_chunk_limit},
    },
    qiao_media::{classify, upload::{UploadRequest, upload_multipart}},
};

use crate::state::{AccountState, AccountStateMap};

fn chunks_for(state: &AccountState, text: &str) -> Vec<String> {
    let table_mode = resolve_markdown_table_mode(ChannelKind::Feishu);
    let converted = convert_markdown_tables(text, table_mode);
    let limit = resolve_text_chunk_limit(ChannelKind::Feishu, state.config.common.text_chunk_limit);
    chunk_markdown_text(&converted, limit)
}

/// Send one message via `im/v1/messages`.
async fn post_message(
    state: &AccountState,
    receive_id_type: &str,
    receive_id: &str,
    msg_type: &str,
    content: &str,
) -> Result<()> {
    state
        .api
        .post_json(
            &format!("/open-apis/im/v1/messages?receive_id_type={receive_id_type}"),
            &json!({
                "receive_id": receive_id,
                "msg_type": msg_type,
                "content": content,
            }),
        )
        .await?;
    Ok(())
}

/// Text or markdown-card chunks to one receiver.
pub(crate) async fn send_text_chunks(
    state: &AccountState,
    receive_id_type: &str,
    receive_id: &str,
    text: &str,
) -> Result<()> {
    if text.trim().is_empty() {
        return Ok(());
    }
    for chunk in chunks_for(state, text) {
        if state.config.send_markdown_as_card {
            let card = json!({
                "config": { "wide_screen_mode": true },
                "elements": [ { "tag": "markdown", "content": chunk } ],
            });
            post_message(state, receive_id_type, receive_id, "interactive", &card.to_string())
                .await?;
        } else {
            let content = json!({ "text": chunk }).to_string();
            post_message(state, receive_id_type, receive_id, "text", &content).await?;
        }
    }
    Ok(())
}

/// Infer the receive-id type from a target string.
fn receive_target(to: &str) -> (&'static str, &str) {
    if let Some(id) = to.strip_prefix("group:") {
        ("chat_id", id)
    } else if let Some(id) = to.strip_prefix("user:") {
        ("open_id", id)
    } else if to.starts_with("oc_") {
        ("chat_id", to)
    } else {
        ("open_id", to)
    }
}

/// Per-message reply deliverer.
pub(crate) struct FeishuDeliverer {
    state: Arc<AccountState>,
    receive_id_type: &'static str,
    receive_id: String,
}

impl FeishuDeliverer {
    #[must_use]
    pub fn for_envelope(state: Arc<AccountState>, envelope: &InboundEnvelope) -> Self {
        let (receive_id_type, receive_id) = match envelope.chat_type {
            ChatType::Group => ("chat_id", envelope.peer_id.clone()),
            ChatType::Direct => ("open_id", envelope.peer_id.clone()),
        };
        Self {
            state,
            receive_id_type,
            receive_id,
        }
    }
}

#[async_trait]
impl ReplyDeliverer for FeishuDeliverer {
    async fn deliver(&self, kind: BlockKind, text: &str) -> Result<()> {
        match kind {
            BlockKind::Typing | BlockKind::Interim => Ok(()),
            BlockKind::Final => {
                send_text_chunks(&self.state, self.receive_id_type, &self.receive_id, text).await
            },
        }
    }
}

/// Host-initiated sends.
pub struct FeishuOutbound {
    pub(crate) accounts: AccountStateMap,
}

impl FeishuOutbound {
    fn account(&self, account_id: &str) -> Result<Arc<AccountState>> {
        let accounts = self.accounts.read().unwrap_or_else(|e| e.into_inner());
        accounts
            .get(account_id)
            .cloned()
            .ok_or_else(|| anyhow::Error::from(qiao_channels::Error::unknown_account(account_id)))
    }
}

#[async_trait]
impl ChannelOutbound for FeishuOutbound {
    async fn send_text(&self, account_id: &str, to: &str, text: &str) -> Result<()> {
        let state = self.account(account_id)?;
        let (receive_id_type, receive_id) = receive_target(to);
        send_text_chunks(&state, receive_id_type, receive_id, text).await
    }

    async fn send_media(
        &self,
        account_id: &str,
        to: &str,
        payload: &ReplyPayload,
    ) -> Result<SendOutcome> {
        let state = self.account(account_id)?;
        let (receive_id_type, receive_id) = receive_target(to);
        let Some(media) = &payload.media else {
            send_text_chunks(&state, receive_id_type, receive_id, &payload.text).await?;
            return Ok(SendOutcome::Delivered);
        };

        match upload_and_send(&state, receive_id_type, receive_id, media).await {
            Ok(()) => {
                if !payload.text.trim().is_empty() {
                    send_text_chunks(&state, receive_id_type, receive_id, &payload.text).await?;
                }
                Ok(SendOutcome::Delivered)
            },
            Err(error) => {
                warn!(error = %error, "feishu media send failed, falling back to link");
                send_text_chunks(
                    &state,
                    receive_id_type,
                    receive_id,
                    &format!("📎 {}", media.url),
                )
                .await?;
                Ok(SendOutcome::FellBack {
                    note: error.to_string(),
                })
            },
        }
    }
}

async fn upload_and_send(
    state: &AccountState,
    receive_id_type: &str,
    receive_id: &str,
    media: &qiao_common::MediaPayload,
) -> Result<()> {
    let name = media
        .file_name
        .clone()
        .or_else(|| media.url.rsplit('/').next().map(str::to_string))
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "attachment.bin".to_string());
    let bytes = state
        .downloader
        .fetch_bytes(&media.url, state.config.common.max_file_size_bytes())
        .await?;
    let bearer = state.api.tenant_access_token().await?;

    match classify(&name, Some(&media.mime_type), false) {
        MediaKind::Image => {
            let response = upload_multipart(state.api.http(), UploadRequest {
                url: format!("{}/open-apis/im/v1/images", state.api.base_url()),
                field_name: "image".into(),
                file_name: name,
                bytes,
                mime: Some(media.mime_type.clone()),
                extra_fields: vec![("image_type".into(), "message".into())],
                bearer: Some(bearer),
            })
            .await?;
            let image_key = response
                .pointer("/data/image_key")
                .and_then(serde_json::Value::as_str)
                .ok_or_else(|| anyhow::anyhow!("image upload returned no image_key"))?;
            let content = json!({ "image_key": image_key }).to_string();
            post_message(state, receive_id_type, receive_id, "image", &content).await
        },
        _ => {
            let response = upload_multipart(state.api.http(), UploadRequest {
                url: format!("{}/open-apis/im/v1/files", state.api.base_url()),
                field_name: "file".into(),
                file_name: name.clone(),
                bytes,
                mime: Some(media.mime_type.clone()),
                extra_fields: vec![
                    ("file_type".into(), "stream".into()),
                    ("file_name".into(), name),
                ],
                bearer: Some(bearer),
            })
            .await?;
            let file_key = response
                .pointer("/data/file_key")
                .and_then(serde_json::Value::as_str)
                .ok_or_else(|| anyhow::anyhow!("file upload returned no file_key"))?;
            let content = json!({ "file_key": file_key }).to_string();
            post_message(state, receive_id_type, receive_id, "file", &content).await
        },
    }
}
