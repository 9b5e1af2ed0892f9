//! Replies through the session webhook, active robot sends, and the two
//! reply deliverers (plain messages vs streaming AI cards).

use std::sync::Arc;

use {
    anyhow::Result,
    async_trait::async_trait,
    serde_json::json,
    tokio::sync::Mutex,
    tracing::{debug, warn},
};

use {
    qiao_channels::{ChannelOutbound, SendOutcome},
    qiao_common::{ChannelKind, ChatType, MediaKind, ReplyPayload},
    qiao_host::{
        BlockKind, ReplyDeliverer,
        text::{chunk_markdown_text, convert_markdown_tables, resolve_markdown_table_mode, resolve_text_chunk_limit},
    },
    qiao_media::classify,
};

use crate::{
    card::CardStream,
    normalize::ReplyTarget,
    state::{AccountState, AccountStateMap},
};

fn chunks_for(state: &AccountState, text: &str) -> Vec<String> {
    let table_mode = resolve_markdown_table_mode(ChannelKind::Dingtalk);
    let converted = convert_markdown_tables(text, table_mode);
    let limit =
        resolve_text_chunk_limit(ChannelKind::Dingtalk, state.config.common.text_chunk_limit);
    chunk_markdown_text(&converted, limit)
}

/// POST one markdown message to a session webhook.
async fn post_session_webhook(state: &AccountState, webhook: &str, text: &str) -> Result<()> {
    let body = json!({
        "msgtype": "markdown",
        "markdown": { "title": "reply", "text": text },
    });
    let response = state.api.http().post(webhook).json(&body).send().await?;
    let status = response.status();
    let value: serde_json::Value = response.json().await.unwrap_or(serde_json::Value::Null);
    let errcode = value.get("errcode").and_then(serde_json::Value::as_i64).unwrap_or(0);
    if !status.is_success() || errcode != 0 {
        anyhow::bail!("session webhook send failed ({status}): {value}");
    }
    Ok(())
}

/// Reply into a conversation: session webhook first, robot APIs second.
pub(crate) async fn send_reply_text(
    state: &AccountState,
    target: &ReplyTarget,
    text: &str,
) -> Result<()> {
    if text.trim().is_empty() {
        return Ok(());
    }
    for chunk in chunks_for(state, text) {
        match &target.session_webhook {
            Some(webhook) => post_session_webhook(state, webhook, &chunk).await?,
            None => {
                send_active_chunk(
                    state,
                    target.chat_type,
                    match target.chat_type {
                        ChatType::Group => &target.conversation_id,
                        ChatType::Direct => &target.sender_staff_id,
                    },
                    &chunk,
                )
                .await?;
            },
        }
    }
    Ok(())
}

/// One active-send chunk via the robot v1.0 APIs.
async fn send_active_chunk(
    state: &AccountState,
    chat_type: ChatType,
    to: &str,
    chunk: &str,
) -> Result<()> {
    let robot_code = state.api.client_id();
    let msg_param = json!({ "title": "reply", "text": chunk }).to_string();
    match chat_type {
        ChatType::Direct => {
            state
                .api
                .post_json("/v1.0/robot/oToMessages/batchSend", &json!({
                    "robotCode": robot_code,
                    "userIds": [to],
                    "msgKey": "sampleMarkdown",
                    "msgParam": msg_param,
                }))
                .await?;
        },
        ChatType::Group => {
            state
                .api
                .post_json("/v1.0/robot/groupMessages/send", &json!({
                    "robotCode": robot_code,
                    "openConversationId": to,
                    "msgKey": "sampleMarkdown",
                    "msgParam": msg_param,
                }))
                .await?;
        },
    }
    Ok(())
}

/// `user:`/`group:` prefixes choose the active-send API.
fn split_peer(to: &str) -> (ChatType, &str) {
    if let Some(id) = to.strip_prefix("group:") {
        (ChatType::Group, id)
    } else {
        (ChatType::Direct, to.strip_prefix("user:").unwrap_or(to))
    }
}

/// Host-initiated sends.
pub struct DingTalkOutbound {
    pub(crate) accounts: AccountStateMap,
}

impl DingTalkOutbound {
    fn account(&self, account_id: &str) -> Result<Arc<AccountState>> {
        let accounts = self.accounts.read().unwrap_or_else(|e| e.into_inner());
        accounts
            .get(account_id)
            .cloned()
            .ok_or_else(|| anyhow::Error::from(qiao_channels::Error::unknown_account(account_id)))
    }
}

#[async_trait]
impl ChannelOutbound for DingTalkOutbound {
    async fn send_text(&self, account_id: &str, to: &str, text: &str) -> Result<()> {
        let state = self.account(account_id)?;
        let (chat_type, peer) = split_peer(to);
        for chunk in chunks_for(&state, text) {
            send_active_chunk(&state, chat_type, peer, &chunk).await?;
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

        let name = media
            .file_name
            .clone()
            .or_else(|| media.url.rsplit('/').next().map(str::to_string))
            .unwrap_or_default();
        // images embed into markdown; everything else degrades to a link
        let result = match classify(&name, Some(&media.mime_type), false) {
            MediaKind::Image => {
                let mut text = format!("![image]({})", media.url);
                if !payload.text.trim().is_empty() {
                    text = format!("{}\n\n{text}", payload.text);
                }
                self.send_text(account_id, to, &text).await
            },
            _ => {
                let text = format!("📎 {}", media.url);
                self.send_text(account_id, to, &text).await?;
                if !payload.text.trim().is_empty() {
                    self.send_text(account_id, to, &payload.text).await?;
                }
                return Ok(SendOutcome::FellBack {
                    note: "non-image media sent as link".into(),
                });
            },
        };
        match result {
            Ok(()) => Ok(SendOutcome::Delivered),
            Err(error) => {
                warn!(error = %error, "dingtalk media send failed, falling back to link");
                self.send_text(account_id, to, &format!("📎 {}", media.url))
                    .await?;
                Ok(SendOutcome::FellBack {
                    note: error.to_string(),
                })
            },
        }
    }
}

// ── reply deliverers ────────────────────────────────────────────────────────

/// Plain-message deliverer: final block only, chunked markdown.
pub(crate) struct DingTalkTextDeliverer {
    pub state: Arc<AccountState>,
    pub target: ReplyTarget,
}

#[async_trait]
impl ReplyDeliverer for DingTalkTextDeliverer {
    async fn deliver(&self, kind: BlockKind, text: &str) -> Result<()> {
        match kind {
            BlockKind::Typing | BlockKind::Interim => Ok(()),
            BlockKind::Final => send_reply_text(&self.state, &self.target, text).await,
        }
    }
}

/// Card deliverer: interim blocks stream into one AI card, the final
/// block finalizes it. Card failures finish the card with a banner and
/// fall back to a plain message with the accumulated text.
pub(crate) struct DingTalkCardDeliverer {
    pub state: Arc<AccountState>,
    pub target: ReplyTarget,
    card: Mutex<Option<Arc<CardStream>>>,
    accumulated: Mutex<String>,
    broken: Mutex<bool>,
}

impl DingTalkCardDeliverer {
    #[must_use]
    pub fn new(state: Arc<AccountState>, target: ReplyTarget) -> Self {
        Self {
            state,
            target,
            card: Mutex::new(None),
            accumulated: Mutex::new(String::new()),
            broken: Mutex::new(false),
        }
    }

    async fn card(&self) -> Result<Arc<CardStream>> {
        let mut slot = self.card.lock().await;
        if let Some(card) = slot.as_ref() {
            return Ok(Arc::clone(card));
        }
        let card = CardStream::create(
            Arc::clone(&self.state.api),
            self.state.config.card_template_id.as_deref(),
            &self.target.conversation_id,
            self.target.robot_code.as_deref().unwrap_or_default(),
        )
        .await?;
        let card = Arc::new(card);
        *slot = Some(Arc::clone(&card));
        Ok(card)
    }

    /// Tear the card down and deliver the text the plain way.
    async fn fall_back(&self, error: &anyhow::Error) -> Result<()> {
        warn!(error = %error, "ai card failed, falling back to plain message");
        {
            let mut broken = self.broken.lock().await;
            *broken = true;
        }
        if let Some(card) = self.card.lock().await.as_ref() {
            card.fail("流式卡片更新失败，已改用普通消息回复").await;
        }
        let accumulated = self.accumulated.lock().await.clone();
        if accumulated.trim().is_empty() {
            return Ok(());
        }
        send_reply_text(&self.state, &self.target, &accumulated).await
    }
}

#[async_trait]
impl ReplyDeliverer for DingTalkCardDeliverer {
    async fn deliver(&self, kind: BlockKind, text: &str) -> Result<()> {
        if kind == BlockKind::Typing {
            return Ok(());
        }
        {
            let mut accumulated = self.accumulated.lock().await;
            *accumulated = text.to_string();
        }
        if *self.broken.lock().await {
            // card is gone; only the final block still goes out as text
            if kind == BlockKind::Final {
                return send_reply_text(&self.state, &self.target, text).await;
            }
            return Ok(());
        }

        let finalize = kind == BlockKind::Final;
        let result = match self.card().await {
            Ok(card) => card.stream(text, finalize).await,
            Err(error) => Err(error),
        };
        match result {
            Ok(()) => {
                debug!(finalize, chars = text.chars().count(), "card stream update");
                Ok(())
            },
            Err(error) => self.fall_back(&error).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_prefix_selects_send_api() {
        assert_eq!(split_peer("user:u1"), (ChatType::Direct, "u1"));
        assert_eq!(split_peer("group:cid1"), (ChatType::Group, "cid1"));
        assert_eq!(split_peer("bare"), (ChatType::Direct, "bare"));
    }
}
