use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, RwLock},
};

use {
    anyhow::Result,
    async_trait::async_trait,
    serde_json::{Value, json},
    tokio_util::sync::CancellationToken,
    tracing::{info, warn},
};

use {
    qiao_channels::{
        AccountStatus, Capabilities, ChannelMeta, ChannelOutbound, ChannelPlugin, InboundSink,
        NoopStatusSink, StatusSink,
        webhook::RouteRegistrar,
    },
    qiao_common::{ChannelKind, ChatType},
    qiao_media::{Downloader, MediaArchive},
    qiao_weapi::{TokenCache, WecomClient, WecomCrypto},
};

use crate::{
    config::WecomAppConfig,
    outbound::WecomAppOutbound,
    state::{AccountState, AccountStateMap},
    webhook::WecomAppWebhook,
};

/// WeCom self-built application channel plugin.
pub struct WecomAppPlugin {
    accounts: AccountStateMap,
    outbound: WecomAppOutbound,
    sink: Arc<dyn InboundSink>,
    routes: Arc<dyn RouteRegistrar>,
    status: Arc<dyn StatusSink>,
    tokens: Arc<TokenCache>,
    data_dir: PathBuf,
}

impl WecomAppPlugin {
    pub fn new(sink: Arc<dyn InboundSink>, routes: Arc<dyn RouteRegistrar>) -> Self {
        let accounts: AccountStateMap = Arc::new(RwLock::new(HashMap::new()));
        let outbound = WecomAppOutbound {
            accounts: Arc::clone(&accounts),
        };
        Self {
            accounts,
            outbound,
            sink,
            routes,
            status: Arc::new(NoopStatusSink),
            tokens: Arc::new(TokenCache::new()),
            data_dir: PathBuf::from(".qiao"),
        }
    }

    pub fn with_status_sink(mut self, status: Arc<dyn StatusSink>) -> Self {
        self.status = status;
        self
    }

    pub fn with_token_cache(mut self, tokens: Arc<TokenCache>) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    pub fn account_ids(&self) -> Vec<String> {
        let accounts = self.accounts.read().unwrap_or_else(|e| e.into_inner());
        accounts.keys().cloned().collect()
    }

    async fn publish_status(&self, account_id: &str, running: bool, error: Option<String>) {
        self.status
            .publish(AccountStatus {
                channel: ChannelKind::WecomApp,
                account_id: account_id.to_string(),
                running,
                configured: running,
                can_send_active: running,
                started_at_ms: running.then(now_ms),
                last_inbound_at_ms: None,
                last_error: error,
            })
            .await;
    }
}

#[async_trait]
impl ChannelPlugin for WecomAppPlugin {
    fn id(&self) -> ChannelKind {
        ChannelKind::WecomApp
    }

    fn meta(&self) -> ChannelMeta {
        ChannelMeta {
            label: "WeCom App",
            description: "WeCom self-built application (XML callback + message/send)",
        }
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            chat_types: &[ChatType::Direct],
            media: true,
            reply: true,
            active_send: true,
        }
    }

    fn config_schema(&self) -> Value {
        json!({
            "corpId": { "type": "string", "required": true },
            "corpSecret": { "type": "string", "required": true, "secret": true },
            "agentId": { "type": "integer", "required": true },
            "token": { "type": "string", "required": true },
            "encodingAESKey": { "type": "string", "required": true, "secret": true },
            "webhookPath": { "type": "string" },
            "inboundMedia": {
                "enabled": { "type": "boolean", "default": true },
                "dir": { "type": "string" },
                "maxBytes": { "type": "integer", "default": qiao_media::DEFAULT_MAX_BYTES },
                "keepDays": { "type": "integer", "default": qiao_media::DEFAULT_KEEP_DAYS }
            },
            "voiceTranscode": {
                "enabled": { "type": "boolean", "default": false },
                "prefer": { "type": "string", "enum": ["amr"] }
            }
        })
    }

    async fn start_account(&mut self, account_id: &str, config: Value) -> Result<()> {
        let config: WecomAppConfig = serde_json::from_value(config)?;

        let corp_id = config
            .corp_id
            .clone()
            .ok_or_else(|| anyhow::anyhow!("wecom-app corpId is required"))?;
        let corp_secret = config
            .corp_secret
            .clone()
            .ok_or_else(|| anyhow::anyhow!("wecom-app corpSecret is required"))?;
        let agent_id = config
            .agent_id
            .ok_or_else(|| anyhow::anyhow!("wecom-app agentId is required"))?;
        let token = config
            .token
            .clone()
            .ok_or_else(|| anyhow::anyhow!("wecom-app callback token is required"))?;
        let aes_key = config
            .encoding_aes_key
            .clone()
            .ok_or_else(|| anyhow::anyhow!("wecom-app encodingAESKey is required"))?;

        let crypto = WecomCrypto::new(&token, secrecy::ExposeSecret::expose_secret(&aes_key))?;
        let client = Arc::new(WecomClient::new(
            corp_id,
            corp_secret,
            agent_id,
            Arc::clone(&self.tokens),
        )?);

        let media_root = config
            .inbound_media
            .dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("media"));
        let temp_root = self.data_dir.join("tmp").join(account_id);
        let downloader = Arc::new(Downloader::new(&temp_root)?);
        let archive = Arc::new(MediaArchive::new(
            &temp_root,
            media_root,
            config.inbound_media.keep_days,
        )?);

        let webhook_path = config.webhook_path_for(account_id);
        let cancel = CancellationToken::new();
        let state = Arc::new(AccountState {
            account_id: account_id.to_string(),
            policy: config.common.policy(),
            config,
            crypto,
            client,
            downloader,
            archive,
            sink: Arc::clone(&self.sink),
            queue: qiao_channels::SerialQueue::new(cancel.clone()),
            cancel,
            webhook_path: webhook_path.clone(),
        });

        self.routes
            .register(&webhook_path, Arc::new(WecomAppWebhook {
                state: Arc::clone(&state),
            }))?;

        {
            let mut accounts = self.accounts.write().unwrap_or_else(|e| e.into_inner());
            accounts.insert(account_id.to_string(), state);
        }
        info!(account_id, path = %webhook_path, "wecom-app account started");
        self.publish_status(account_id, true, None).await;
        Ok(())
    }

    async fn stop_account(&mut self, account_id: &str) -> Result<()> {
        let removed = {
            let mut accounts = self.accounts.write().unwrap_or_else(|e| e.into_inner());
            accounts.remove(account_id)
        };
        match removed {
            Some(state) => {
                state.cancel.cancel();
                self.routes.unregister(&state.webhook_path);
                info!(account_id, "wecom-app account stopped");
                self.publish_status(account_id, false, None).await;
            },
            None => warn!(account_id, "wecom-app account not found"),
        }
        Ok(())
    }

    fn outbound(&self) -> Option<&dyn ChannelOutbound> {
        Some(&self.outbound)
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
