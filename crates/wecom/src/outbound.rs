//! Reply delivery through `response_url`s and the group-robot webhook.

use std::sync::Arc;

use {
    anyhow::Result,
    async_trait::async_trait,
    serde_json::json,
    tracing::{debug, warn},
};

use {
    qiao_channels::{ChannelOutbound, SendOutcome},
    qiao_common::{ChannelKind, MediaKind, ReplyPayload, markdown},
    qiao_host::{
        BlockKind, ReplyDeliverer,
        text::{ChunkMode, chunk_text_with_mode, convert_markdown_tables, resolve_markdown_table_mode, resolve_text_chunk_limit},
    },
    qiao_media::{classify, upload::{UploadRequest, upload_multipart}},
    qiao_weapi::{check_errcode, send_robot_webhook},
};

use crate::state::{AccountState, AccountStateMap};

/// Degrade markdown to plain text and split to the platform byte limit.
fn plain_chunks(state: &AccountState, text: &str) -> Vec<String> {
    let table_mode = resolve_markdown_table_mode(ChannelKind::Wecom);
    let converted = convert_markdown_tables(text, table_mode);
    let plain = markdown::strip_to_plain_text(&converted);
    let limit = resolve_text_chunk_limit(ChannelKind::Wecom, state.config.common.text_chunk_limit);
    chunk_text_with_mode(&plain, limit, ChunkMode::Bytes)
}

async fn post_text(state: &AccountState, url: &str, content: &str) -> Result<()> {
    let body = json!({ "msgtype": "text", "text": { "content": content } });
    send_robot_webhook(&state.http, url, &body).await?;
    Ok(())
}

/// Send a reply to `peer`: a cached `response_url` wins, the configured
/// group-robot webhook is the fallback.
pub(crate) async fn send_reply_chunks(state: &AccountState, peer: &str, text: &str) -> Result<()> {
    if text.trim().is_empty() {
        return Ok(());
    }
    let target = state
        .take_response_url(peer)
        .map(|entry| entry.url)
        .or_else(|| state.config.robot_webhook_url.clone());
    let Some(url) = target else {
        anyhow::bail!("no response_url cached and no robot webhook configured");
    };

    for chunk in plain_chunks(state, text) {
        post_text(state, &url, &chunk).await?;
    }
    Ok(())
}

/// Per-message deliverer: only the final block becomes messages.
pub(crate) struct WecomDeliverer {
    pub state: Arc<AccountState>,
    pub to: String,
}

#[async_trait]
impl ReplyDeliverer for WecomDeliverer {
    async fn deliver(&self, kind: BlockKind, text: &str) -> Result<()> {
        match kind {
            BlockKind::Typing | BlockKind::Interim => Ok(()),
            BlockKind::Final => send_reply_chunks(&self.state, &self.to, text).await,
        }
    }
}

/// Host-initiated sends via the group-robot webhook.
pub struct WecomOutbound {
    pub(crate) accounts: AccountStateMap,
}

impl WecomOutbound {
    fn account(&self, account_id: &str) -> Result<Arc<AccountState>> {
        let accounts = self.accounts.read().unwrap_or_else(|e| e.into_inner());
        accounts
            .get(account_id)
            .cloned()
            .ok_or_else(|| anyhow::Error::from(qiao_channels::Error::unknown_account(account_id)))
    }

    fn webhook_url(state: &AccountState) -> Result<String> {
        state
            .config
            .robot_webhook_url
            .clone()
            .ok_or_else(|| anyhow::anyhow!("wecom active send needs robotWebhookUrl"))
    }

    /// The robot upload endpoint shares the webhook's `key`.
    fn upload_url(webhook_url: &str, media_type: &str) -> Result<String> {
        let parsed = url::Url::parse(webhook_url)?;
        let key = parsed
            .query_pairs()
            .find(|(name, _)| name == "key")
            .map(|(_, value)| value.into_owned())
            .ok_or_else(|| anyhow::anyhow!("robot webhook url has no key parameter"))?;
        let origin = format!(
            "{}://{}",
            parsed.scheme(),
            parsed.host_str().unwrap_or("qyapi.weixin.qq.com")
        );
        Ok(format!(
            "{origin}/cgi-bin/webhook/upload_media?key={key}&type={media_type}"
        ))
    }
}

#[async_trait]
impl ChannelOutbound for WecomOutbound {
    async fn send_text(&self, account_id: &str, to: &str, text: &str) -> Result<()> {
        let state = self.account(account_id)?;
        let url = Self::webhook_url(&state)?;
        let _ = to; // group robots broadcast to their fixed chat
        for chunk in plain_chunks(&state, text) {
            post_text(&state, &url, &chunk).await?;
        }
        Ok(())
    }

    async fn send_media(
        &self,
        account_id: &str,
        to: &str,
        payload: &ReplyPayload,
    ) -> Result<SendOutcome> {
        let state = self.account(account_id)?;
        let Some(media) = &payload.media else {
            self.send_text(account_id, to, &payload.text).await?;
            return Ok(SendOutcome::Delivered);
        };

        match self.upload_and_send(&state, media).await {
            Ok(()) => {
                if !payload.text.trim().is_empty() {
                    self.send_text(account_id, to, &payload.text).await?;
                }
                Ok(SendOutcome::Delivered)
            },
            Err(error) => {
                warn!(error = %error, "wecom media send failed, falling back to link");
                self.send_text(account_id, to, &format!("📎 {}", media.url))
                    .await?;
                Ok(SendOutcome::FellBack {
                    note: error.to_string(),
                })
            },
        }
    }
}

impl WecomOutbound {
    async fn upload_and_send(
        &self,
        state: &AccountState,
        media: &qiao_common::MediaPayload,
    ) -> Result<()> {
        let webhook_url = Self::webhook_url(state)?;
        let name = media
            .file_name
            .clone()
            .or_else(|| media.url.rsplit('/').next().map(str::to_string))
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| "attachment.bin".to_string());

        // the robot webhook accepts only `file` and `voice` uploads
        let media_type = match classify(&name, Some(&media.mime_type), false) {
            MediaKind::Voice => "voice",
            _ => "file",
        };
        let bytes = state
            .downloader
            .fetch_bytes(&media.url, state.config.common.max_file_size_bytes())
            .await?;

        let upload_url = Self::upload_url(&webhook_url, media_type)?;
        let response = upload_multipart(&state.http, UploadRequest {
            url: upload_url,
            field_name: "media".into(),
            file_name: name,
            bytes,
            mime: Some(media.mime_type.clone()),
            extra_fields: Vec::new(),
            bearer: None,
        })
        .await?;
        check_errcode(&response)?;
        let media_id = response
            .get("media_id")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("upload_media returned no media_id"))?;

        debug!(media_type, "wecom robot media uploaded");
        let mut body = json!({ "msgtype": media_type });
        body[media_type] = json!({ "media_id": media_id });
        send_robot_webhook(&state.http, &webhook_url, &body).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_url_reuses_webhook_key() {
        let url = WecomOutbound::upload_url(
            "https://qyapi.weixin.qq.com/cgi-bin/webhook/send?key=abc-123",
            "file",
        )
        .unwrap();
        assert_eq!(
            url,
            "https://qyapi.weixin.qq.com/cgi-bin/webhook/upload_media?key=abc-123&type=file"
        );
    }

    #[test]
    fn upload_url_requires_key() {
        assert!(
            WecomOutbound::upload_url("https://qyapi.weixin.qq.com/cgi-bin/webhook/send", "file")
                .is_err()
        );
    }
}
