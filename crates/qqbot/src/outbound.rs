//! v2 message sends: passive replies with `msg_id`/`msg_seq`, active
//! sends without, media through the files API with the documented
//! fallback for unsupported file sends.

use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use {
    anyhow::Result,
    async_trait::async_trait,
    serde_json::{Value, json},
    tracing::{debug, warn},
};

use {
    qiao_channels::{ChannelOutbound, SendOutcome},
    qiao_common::{ChannelKind, MediaKind, ReplyPayload, markdown},
    qiao_host::{
        BlockKind, ReplyDeliverer,
        text::{chunk_markdown_text, convert_markdown_tables, resolve_markdown_table_mode, resolve_text_chunk_limit},
    },
    qiao_media::classify,
};

use crate::state::{AccountState, AccountStateMap};

/// Where a message is addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerKind {
    User,
    Group,
    GuildChannel,
}

/// `to` strings may carry an explicit `user:`/`group:` prefix.
#[must_use]
pub fn split_peer(to: &str) -> (PeerKind, &str) {
    if let Some(id) = to.strip_prefix("group:") {
        (PeerKind::Group, id)
    } else if let Some(id) = to.strip_prefix("channel:") {
        (PeerKind::GuildChannel, id)
    } else {
        (PeerKind::User, to.strip_prefix("user:").unwrap_or(to))
    }
}

fn message_url(state: &AccountState, kind: PeerKind, id: &str) -> String {
    match kind {
        PeerKind::User => format!("{}/v2/users/{id}/messages", state.api_base),
        PeerKind::Group => format!("{}/v2/groups/{id}/messages", state.api_base),
        PeerKind::GuildChannel => format!("{}/channels/{id}/messages", state.api_base),
    }
}

fn files_url(state: &AccountState, kind: PeerKind, id: &str) -> Option<String> {
    match kind {
        PeerKind::User => Some(format!("{}/v2/users/{id}/files", state.api_base)),
        PeerKind::Group => Some(format!("{}/v2/groups/{id}/files", state.api_base)),
        PeerKind::GuildChannel => None,
    }
}

/// Passive-reply context: one inbound message, monotonically increasing
/// `msg_seq` for its reply messages.
pub struct ReplyContext {
    pub msg_id: String,
    seq: AtomicU32,
}

impl ReplyContext {
    #[must_use]
    pub fn new(msg_id: impl Into<String>) -> Self {
        Self {
            msg_id: msg_id.into(),
            seq: AtomicU32::new(1),
        }
    }

    fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }
}

async fn post_message(
    state: &AccountState,
    url: &str,
    mut payload: Value,
    reply: Option<&ReplyContext>,
) -> Result<Value> {
    if let Some(reply) = reply {
        payload["msg_id"] = json!(reply.msg_id);
        payload["msg_seq"] = json!(reply.next_seq());
    }
    let token = state.access_token().await?;
    let response = state
        .http
        .post(url)
        .header("Authorization", format!("QQBot {token}"))
        .json(&payload)
        .send()
        .await?;
    let status = response.status();
    let body: Value = response.json().await.unwrap_or(Value::Null);
    if !status.is_success() {
        // surface the platform error payload; fallbacks key off its code
        let code = body.get("code").and_then(Value::as_i64).unwrap_or(0);
        anyhow::bail!("qqbot send failed ({status}, code {code}): {body}");
    }
    Ok(body)
}

/// Render text for the account: markdown template when approved,
/// degraded plain text otherwise.
fn text_payload(state: &AccountState, chunk: &str) -> Value {
    if state.config.markdown_support {
        json!({ "msg_type": 2, "markdown": { "content": chunk } })
    } else {
        json!({ "msg_type": 0, "content": chunk })
    }
}

fn render_chunks(state: &AccountState, text: &str) -> Vec<String> {
    let table_mode = resolve_markdown_table_mode(ChannelKind::Qqbot);
    let converted = convert_markdown_tables(text, table_mode);
    let rendered = if state.config.markdown_support {
        converted
    } else {
        markdown::strip_to_plain_text(&converted)
    };
    let limit = resolve_text_chunk_limit(ChannelKind::Qqbot, state.config.common.text_chunk_limit);
    chunk_markdown_text(&rendered, limit)
}

/// Send text chunks to a peer, passively when a reply context exists.
pub(crate) async fn send_text_units(
    state: &AccountState,
    kind: PeerKind,
    peer_id: &str,
    text: &str,
    reply: Option<&ReplyContext>,
) -> Result<()> {
    if text.trim().is_empty() {
        return Ok(());
    }
    let url = message_url(state, kind, peer_id);
    for chunk in render_chunks(state, text) {
        let payload = if kind == PeerKind::GuildChannel {
            json!({ "content": chunk })
        } else {
            text_payload(state, &chunk)
        };
        post_message(state, &url, payload, reply).await?;
    }
    Ok(())
}

/// Media via the files API, then a `msg_type:7` rich-media message.
async fn send_media_message(
    state: &AccountState,
    kind: PeerKind,
    peer_id: &str,
    file_type: u8,
    media_url: &str,
    reply: Option<&ReplyContext>,
) -> Result<()> {
    let Some(url) = files_url(state, kind, peer_id) else {
        anyhow::bail!("guild channels take no rich media uploads");
    };
    let token = state.access_token().await?;
    let response = state
        .http
        .post(&url)
        .header("Authorization", format!("QQBot {token}"))
        .json(&json!({
            "file_type": file_type,
            "url": media_url,
            "srv_send_msg": false,
        }))
        .send()
        .await?;
    let status = response.status();
    let body: Value = response.json().await.unwrap_or(Value::Null);
    if !status.is_success() {
        let code = body.get("code").and_then(Value::as_i64).unwrap_or(0);
        if file_type == 4 {
            return Err(qiao_channels::Error::PlatformFormatUnsupported {
                code,
                message: format!("file sends rejected ({status})"),
            }
            .into());
        }
        anyhow::bail!("qqbot file upload failed ({status}, code {code}, file_type {file_type})");
    }
    let file_info = body
        .get("file_info")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("files api returned no file_info"))?;

    let payload = json!({
        "msg_type": 7,
        "content": " ",
        "media": { "file_info": file_info },
    });
    post_message(state, &message_url(state, kind, peer_id), payload, reply).await?;
    Ok(())
}

/// QQ file-type codes for the files API.
#[must_use]
pub fn file_type_for(kind: MediaKind) -> u8 {
    match kind {
        MediaKind::Image => 1,
        MediaKind::Video => 2,
        MediaKind::Voice => 3,
        MediaKind::File => 4,
    }
}

/// The platform has not opened bot file sends; this is the user-facing
/// explanation sent instead.
#[must_use]
pub fn file_fallback_text(url: &str) -> String {
    format!("说明：QQ 官方暂未开放机器人发送文件的能力，已为你附上文件链接：{url}")
}

pub(crate) async fn deliver_media(
    state: &AccountState,
    kind: PeerKind,
    peer_id: &str,
    payload: &ReplyPayload,
    reply: Option<&ReplyContext>,
) -> Result<SendOutcome> {
    let Some(media) = &payload.media else {
        send_text_units(state, kind, peer_id, &payload.text, reply).await?;
        return Ok(SendOutcome::Delivered);
    };

    let name = media
        .file_name
        .clone()
        .or_else(|| media.url.rsplit('/').next().map(str::to_string))
        .unwrap_or_default();
    let media_kind = classify(&name, Some(&media.mime_type), false);
    let file_type = file_type_for(media_kind);

    match send_media_message(state, kind, peer_id, file_type, &media.url, reply).await {
        Ok(()) => {
            if !payload.text.trim().is_empty() {
                send_text_units(state, kind, peer_id, &payload.text, reply).await?;
            }
            Ok(SendOutcome::Delivered)
        },
        Err(error) if file_type == 4 => {
            debug!(error = %error, "qqbot file send unsupported, replying with link");
            send_text_units(state, kind, peer_id, &file_fallback_text(&media.url), reply).await?;
            Ok(SendOutcome::FellBack {
                note: "file_type=4 unsupported".into(),
            })
        },
        Err(error) => {
            warn!(error = %error, "qqbot media send failed, falling back to link");
            send_text_units(state, kind, peer_id, &format!("📎 {}", media.url), reply).await?;
            Ok(SendOutcome::FellBack {
                note: error.to_string(),
            })
        },
    }
}

/// Per-message reply deliverer.
pub(crate) struct QqBotDeliverer {
    pub state: Arc<AccountState>,
    pub kind: PeerKind,
    pub peer_id: String,
    pub reply: ReplyContext,
}

#[async_trait]
impl ReplyDeliverer for QqBotDeliverer {
    async fn deliver(&self, block: BlockKind, text: &str) -> Result<()> {
        match block {
            BlockKind::Typing | BlockKind::Interim => Ok(()),
            BlockKind::Final => {
                send_text_units(&self.state, self.kind, &self.peer_id, text, Some(&self.reply))
                    .await
            },
        }
    }
}

/// Host-initiated sends.
pub struct QqBotOutbound {
    pub(crate) accounts: AccountStateMap,
}

impl QqBotOutbound {
    fn account(&self, account_id: &str) -> Result<Arc<AccountState>> {
        let accounts = self.accounts.read().unwrap_or_else(|e| e.into_inner());
        accounts
            .get(account_id)
            .cloned()
            .ok_or_else(|| anyhow::Error::from(qiao_channels::Error::unknown_account(account_id)))
    }
}

#[async_trait]
impl ChannelOutbound for QqBotOutbound {
    async fn send_text(&self, account_id: &str, to: &str, text: &str) -> Result<()> {
        let state = self.account(account_id)?;
        let (kind, peer_id) = split_peer(to);
        send_text_units(&state, kind, peer_id, text, None).await
    }

    async fn send_media(
        &self,
        account_id: &str,
        to: &str,
        payload: &ReplyPayload,
    ) -> Result<SendOutcome> {
        let state = self.account(account_id)?;
        let (kind, peer_id) = split_peer(to);
        deliver_media(&state, kind, peer_id, payload, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_prefixes_select_endpoints() {
        assert_eq!(split_peer("user:openid1"), (PeerKind::User, "openid1"));
        assert_eq!(split_peer("group:g1"), (PeerKind::Group, "g1"));
        assert_eq!(split_peer("channel:c1"), (PeerKind::GuildChannel, "c1"));
        assert_eq!(split_peer("bare"), (PeerKind::User, "bare"));
    }

    #[test]
    fn file_type_mapping_matches_platform_codes() {
        assert_eq!(file_type_for(MediaKind::Image), 1);
        assert_eq!(file_type_for(MediaKind::Video), 2);
        assert_eq!(file_type_for(MediaKind::Voice), 3);
        assert_eq!(file_type_for(MediaKind::File), 4);
    }

    #[test]
    fn file_fallback_carries_link_and_explanation() {
        let text = file_fallback_text("https://e.com/doc.pdf");
        assert!(text.starts_with("说明："));
        assert!(text.contains("已为你附上文件链接：https://e.com/doc.pdf"));
    }

    #[test]
    fn reply_seq_increments_per_message() {
        let reply = ReplyContext::new("m1");
        assert_eq!(reply.next_seq(), 1);
        assert_eq!(reply.next_seq(), 2);
        assert_eq!(reply.next_seq(), 3);
    }
}
