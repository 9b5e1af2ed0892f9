use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use tokio_util::sync::CancellationToken;

use {
    qiao_channels::{InboundSink, SerialQueue, gating::Policy},
    qiao_media::{MediaArchive, Downloader},
    qiao_weapi::{WecomClient, WecomCrypto},
};

use crate::config::WecomAppConfig;

/// Shared account state map.
pub type AccountStateMap = Arc<RwLock<HashMap<String, Arc<AccountState>>>>;

/// Per-account runtime state.
pub struct AccountState {
    pub account_id: String,
    pub config: WecomAppConfig,
    pub policy: Policy,
    pub crypto: WecomCrypto,
    pub client: Arc<WecomClient>,
    pub downloader: Arc<Downloader>,
    pub archive: Arc<MediaArchive>,
    pub sink: Arc<dyn InboundSink>,
    pub cancel: CancellationToken,
    pub webhook_path: String,
    /// Serializes inbound processing so one peer's messages stay ordered.
    pub queue: SerialQueue,
}

impl AccountState {
    /// The configured receive id; decrypt checks the trailer against it.
    #[must_use]
    pub fn receive_id(&self) -> Option<&str> {
        self.config.corp_id.as_deref()
    }
}
