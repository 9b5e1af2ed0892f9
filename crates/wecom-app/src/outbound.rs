//! Active sends through `message/send`: chunked text, media with
//! upload/transcode, and link fallbacks when a media path fails.

use std::sync::Arc;

use {anyhow::Result, async_trait::async_trait, tracing::{debug, warn}};

use {
    qiao_channels::{ChannelOutbound, SendOutcome},
    qiao_common::{ChannelKind, MediaKind, ReplyPayload, markdown},
    qiao_host::text::{ChunkMode, chunk_text_with_mode, convert_markdown_tables, resolve_markdown_table_mode, resolve_text_chunk_limit},
    qiao_media::{classify, ffmpeg_available, transcode_to_amr},
};

use crate::state::{AccountState, AccountStateMap};

/// Outbound sender backed by the shared account map.
pub struct WecomAppOutbound {
    pub(crate) accounts: AccountStateMap,
}

impl WecomAppOutbound {
    fn account(&self, account_id: &str) -> Result<Arc<AccountState>> {
        let accounts = self.accounts.read().unwrap_or_else(|e| e.into_inner());
        accounts
            .get(account_id)
            .cloned()
            .ok_or_else(|| anyhow::Error::from(qiao_channels::Error::unknown_account(account_id)))
    }
}

#[async_trait]
impl ChannelOutbound for WecomAppOutbound {
    async fn send_text(&self, account_id: &str, to: &str, text: &str) -> Result<()> {
        let state = self.account(account_id)?;
        send_text_chunks(&state, to, text).await
    }

    async fn send_media(
        &self,
        account_id: &str,
        to: &str,
        payload: &ReplyPayload,
    ) -> Result<SendOutcome> {
        let state = self.account(account_id)?;
        let Some(media) = &payload.media else {
            send_text_chunks(&state, to, &payload.text).await?;
            return Ok(SendOutcome::Delivered);
        };

        match deliver_media(&state, to, &payload.text, &media.url, &media.mime_type, media.file_name.as_deref()).await {
            Ok(()) => Ok(SendOutcome::Delivered),
            Err(error) => {
                warn!(error = %error, "wecom-app media send failed, falling back to link");
                let fallback = format!("📎 {}", media.url);
                send_text_chunks(&state, to, &fallback).await?;
                Ok(SendOutcome::FellBack {
                    note: error.to_string(),
                })
            },
        }
    }
}

/// Degrade markdown, convert tables, and send byte-limited text chunks.
pub(crate) async fn send_text_chunks(state: &AccountState, to: &str, text: &str) -> Result<()> {
    if text.trim().is_empty() {
        return Ok(());
    }
    let table_mode = resolve_markdown_table_mode(ChannelKind::WecomApp);
    let converted = convert_markdown_tables(text, table_mode);
    let plain = markdown::strip_to_plain_text(&converted);
    let limit = resolve_text_chunk_limit(ChannelKind::WecomApp, state.config.common.text_chunk_limit);

    for chunk in chunk_text_with_mode(&plain, limit, ChunkMode::Bytes) {
        let body = state.client.text_message(to, &chunk);
        state.client.send_message(&body).await?;
    }
    Ok(())
}

/// Upload and send one media item; the error path is the caller's
/// fallback trigger.
async fn deliver_media(
    state: &AccountState,
    to: &str,
    caption: &str,
    url: &str,
    mime: &str,
    file_name: Option<&str>,
) -> Result<()> {
    let name = file_name
        .map(str::to_string)
        .or_else(|| url.rsplit('/').next().map(str::to_string))
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "attachment.bin".to_string());

    let transcode_enabled = state.config.voice_transcode.enabled && ffmpeg_available();
    let kind = classify(&name, Some(mime), transcode_enabled);

    match kind {
        MediaKind::Image => {
            let bytes = state
                .downloader
                .fetch_bytes(url, state.config.common.max_file_size_bytes())
                .await?;
            let media_id = state.client.upload_media("image", &name, bytes).await?;
            state
                .client
                .send_message(&state.client.media_message(to, "image", &media_id))
                .await?;
            if !caption.trim().is_empty() {
                send_text_chunks(state, to, caption).await?;
            }
        },
        MediaKind::Voice => {
            send_voice(state, to, url, &name).await?;
            if !caption.trim().is_empty() {
                send_text_chunks(state, to, caption).await?;
            }
        },
        MediaKind::Video | MediaKind::File => {
            // caption first: the platform rarely shows the real filename
            if !caption.trim().is_empty() {
                send_text_chunks(state, to, caption).await?;
            }
            let bytes = state
                .downloader
                .fetch_bytes(url, state.config.common.max_file_size_bytes())
                .await?;
            let media_id = state.client.upload_media("file", &name, bytes).await?;
            state
                .client
                .send_message(&state.client.media_message(to, "file", &media_id))
                .await?;
        },
    }
    Ok(())
}

/// Voice delivery: `.amr`/`.speex` go straight out; `.wav`/`.mp3` are
/// transcoded first when enabled. Remote URLs that would need a
/// download-then-transcode hop fall back to file sends.
async fn send_voice(state: &AccountState, to: &str, url: &str, name: &str) -> Result<()> {
    let ext = name.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    let max_bytes = state.config.common.max_file_size_bytes();

    if ext == "amr" || ext == "speex" {
        let bytes = state.downloader.fetch_bytes(url, max_bytes).await?;
        let media_id = state.client.upload_media("voice", name, bytes).await?;
        return state
            .client
            .send_message(&state.client.media_message(to, "voice", &media_id))
            .await
            .map_err(Into::into);
    }

    let local = url.strip_prefix("file://").unwrap_or(url);
    let local_path = std::path::Path::new(local);
    if !local_path.exists() {
        // remote transcode is out of scope; ship it as a file instead
        debug!(url, "remote voice source, sending as file");
        let bytes = state.downloader.fetch_bytes(url, max_bytes).await?;
        let media_id = state.client.upload_media("file", name, bytes).await?;
        return state
            .client
            .send_message(&state.client.media_message(to, "file", &media_id))
            .await
            .map_err(Into::into);
    }

    let amr_path = transcode_to_amr(local_path).await?;
    let result = async {
        let bytes = tokio::fs::read(&amr_path).await?;
        if bytes.len() as u64 > max_bytes {
            anyhow::bail!("transcoded voice exceeds size limit");
        }
        let amr_name = amr_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "voice.amr".to_string());
        let media_id = state.client.upload_media("voice", &amr_name, bytes).await?;
        state
            .client
            .send_message(&state.client.media_message(to, "voice", &media_id))
            .await?;
        Ok::<_, anyhow::Error>(())
    }
    .await;

    // the transcoded artifact is ours to clean up either way
    let _ = tokio::fs::remove_file(&amr_path).await;
    result
}
