use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use tokio_util::sync::CancellationToken;

use {
    qiao_channels::{InboundSink, SerialQueue, gating::Policy},
    qiao_media::{Downloader, MediaArchive},
};

use crate::{config::DingTalkConfig, token::DingTalkApi};

/// Shared account state map.
pub type AccountStateMap = Arc<RwLock<HashMap<String, Arc<AccountState>>>>;

/// Per-account runtime state.
pub struct AccountState {
    pub account_id: String,
    pub config: DingTalkConfig,
    pub policy: Policy,
    pub api: Arc<DingTalkApi>,
    pub downloader: Arc<Downloader>,
    pub archive: Arc<MediaArchive>,
    pub sink: Arc<dyn InboundSink>,
    pub cancel: CancellationToken,
    /// Serializes inbound processing so one conversation stays ordered.
    pub queue: SerialQueue,
}
