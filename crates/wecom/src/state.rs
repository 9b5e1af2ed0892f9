use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, RwLock},
    time::{Duration, Instant},
};

use tokio_util::sync::CancellationToken;

use {
    qiao_channels::{InboundSink, SerialQueue, gating::Policy},
    qiao_media::{Downloader, MediaArchive},
    qiao_weapi::WecomCrypto,
};

use crate::config::WecomConfig;

/// `response_url`s are single-use and die after an hour.
pub const RESPONSE_URL_TTL: Duration = Duration::from_secs(3600);

/// Shared account state map.
pub type AccountStateMap = Arc<RwLock<HashMap<String, Arc<AccountState>>>>;

#[derive(Debug, Clone)]
pub struct ResponseUrlEntry {
    pub url: String,
    pub expires_at: Instant,
    pub msg_id: String,
}

/// Per-account runtime state.
pub struct AccountState {
    pub account_id: String,
    pub config: WecomConfig,
    pub policy: Policy,
    pub crypto: WecomCrypto,
    pub http: reqwest::Client,
    pub downloader: Arc<Downloader>,
    pub archive: Arc<MediaArchive>,
    pub sink: Arc<dyn InboundSink>,
    pub cancel: CancellationToken,
    pub webhook_path: String,
    /// Out-of-band reply URLs, newest last, keyed by peer.
    pub response_urls: Mutex<HashMap<String, VecDeque<ResponseUrlEntry>>>,
    /// Serializes inbound processing so one peer's messages stay ordered.
    pub queue: SerialQueue,
}

impl AccountState {
    /// Remember a fresh `response_url` for this peer, dropping expired
    /// entries and keeping the queue bounded.
    pub fn cache_response_url(&self, peer: &str, msg_id: &str, url: &str) {
        let url = url.trim();
        if url.is_empty() {
            return;
        }
        let now = Instant::now();
        let mut cache = self.response_urls.lock().unwrap_or_else(|e| e.into_inner());
        let queue = cache.entry(peer.to_string()).or_default();
        queue.retain(|entry| entry.expires_at > now);
        queue.push_back(ResponseUrlEntry {
            url: url.to_string(),
            expires_at: now + RESPONSE_URL_TTL,
            msg_id: msg_id.to_string(),
        });
        while queue.len() > self.config.response_url_cache_per_peer() {
            queue.pop_front();
        }
    }

    /// Take the oldest live `response_url` for this peer.
    pub fn take_response_url(&self, peer: &str) -> Option<ResponseUrlEntry> {
        let now = Instant::now();
        let mut cache = self.response_urls.lock().unwrap_or_else(|e| e.into_inner());
        let queue = cache.get_mut(peer)?;
        queue.retain(|entry| entry.expires_at > now);
        queue.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;

    use {
        qiao_channels::InboundSink,
        qiao_common::InboundEnvelope,
        qiao_host::ReplyDeliverer,
    };

    use super::*;

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

    fn state() -> AccountState {
        let dir = std::env::temp_dir().join(format!(
            "qiao-wecom-test-{}",
            std::process::id()
        ));
        AccountState {
            account_id: "default".into(),
            config: WecomConfig::default(),
            policy: Policy::standard(),
            crypto: WecomCrypto::new("t", &"A".repeat(43)).unwrap(),
            http: reqwest::Client::new(),
            downloader: Arc::new(Downloader::new(dir.join("tmp")).unwrap()),
            archive: Arc::new(MediaArchive::new(dir.join("tmp"), dir.join("media"), 7).unwrap()),
            sink: Arc::new(NullSink),
            cancel: CancellationToken::new(),
            queue: SerialQueue::new(CancellationToken::new()),
            webhook_path: "/webhooks/wecom/default".into(),
            response_urls: Mutex::new(HashMap::new()),
        }
    }

    #[tokio::test]
    async fn response_urls_are_single_use_fifo() {
        let state = state();
        state.cache_response_url("u1", "m1", "https://a");
        state.cache_response_url("u1", "m2", "https://b");

        let first = state.take_response_url("u1").unwrap();
        assert_eq!(first.url, "https://a");
        assert_eq!(first.msg_id, "m1");
        let second = state.take_response_url("u1").unwrap();
        assert_eq!(second.url, "https://b");
        assert!(state.take_response_url("u1").is_none());
    }

    #[tokio::test]
    async fn response_url_queue_is_bounded_per_peer() {
        let state = state();
        for i in 0..10 {
            state.cache_response_url("u1", &format!("m{i}"), &format!("https://{i}"));
        }
        let cache = state.response_urls.lock().unwrap();
        assert_eq!(cache["u1"].len(), state.config.response_url_cache_per_peer());
        // oldest entries were evicted first
        assert_eq!(cache["u1"].front().unwrap().url, "https://7");
    }

    #[tokio::test]
    async fn blank_urls_are_not_cached() {
        let state = state();
        state.cache_response_url("u1", "m1", "   ");
        assert!(state.take_response_url("u1").is_none());
    }
}
