use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use tokio_util::sync::CancellationToken;

use {
    qiao_channels::{InboundSink, SerialQueue, gating::Policy},
    qiao_media::{Downloader, MediaArchive},
};

use crate::{asr::Transcriber, config::QqBotConfig, token::AppTokenCache};

/// Shared account state map.
pub type AccountStateMap = Arc<RwLock<HashMap<String, Arc<AccountState>>>>;

/// Per-account runtime state.
pub struct AccountState {
    pub account_id: String,
    pub config: QqBotConfig,
    pub policy: Policy,
    pub http: reqwest::Client,
    pub tokens: AppTokenCache,
    pub downloader: Arc<Downloader>,
    pub archive: Arc<MediaArchive>,
    pub transcriber: Option<Arc<dyn Transcriber>>,
    pub sink: Arc<dyn InboundSink>,
    pub cancel: CancellationToken,
    pub webhook_path: String,
    /// API origin, swappable for tests.
    pub api_base: String,
    /// Serializes inbound processing so one peer's messages stay ordered.
    pub queue: SerialQueue,
}

impl AccountState {
    pub async fn access_token(&self) -> anyhow::Result<String> {
        let app_id = self
            .config
            .app_id
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("qqbot appId missing"))?;
        let secret = self
            .config
            .client_secret
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("qqbot clientSecret missing"))?;
        self.tokens
            .access_token(&self.http, None, app_id, secret)
            .await
    }
}
