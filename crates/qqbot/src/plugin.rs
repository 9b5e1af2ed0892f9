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
    secrecy::ExposeSecret,
};

use crate::{
    API_BASE,
    asr::{TencentFlashAsr, Transcriber},
    config::QqBotConfig,
    outbound::QqBotOutbound,
    state::{AccountState, AccountStateMap},
    token::AppTokenCache,
    webhook::QqBotWebhook,
};

/// QQ open-platform channel plugin.
pub struct QqBotPlugin {
    accounts: AccountStateMap,
    outbound: QqBotOutbound,
    sink: Arc<dyn InboundSink>,
    routes: Arc<dyn RouteRegistrar>,
    status: Arc<dyn StatusSink>,
    data_dir: PathBuf,
}

impl QqBotPlugin {
    pub fn new(sink: Arc<dyn InboundSink>, routes: Arc<dyn RouteRegistrar>) -> Self {
        let accounts: AccountStateMap = Arc::new(RwLock::new(HashMap::new()));
        let outbound = QqBotOutbound {
            accounts: Arc::clone(&accounts),
        };
        Self {
            accounts,
            outbound,
            sink,
            routes,
            status: Arc::new(NoopStatusSink),
            data_dir: PathBuf::from(".qiao"),
        }
    }

    pub fn with_status_sink(mut self, status: Arc<dyn StatusSink>) -> Self {
        self.status = status;
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

    async fn publish_status(&self, account_id: &str, running: bool) {
        self.status
            .publish(AccountStatus {
                channel: ChannelKind::Qqbot,
                account_id: account_id.to_string(),
                running,
                configured: running,
                can_send_active: running,
                started_at_ms: running.then(now_ms),
                last_inbound_at_ms: None,
                last_error: None,
            })
            .await;
    }
}

#[async_trait]
impl ChannelPlugin for QqBotPlugin {
    fn id(&self) -> ChannelKind {
        ChannelKind::Qqbot
    }

    fn meta(&self) -> ChannelMeta {
        ChannelMeta {
            label: "QQ Bot",
            description: "QQ open platform (ed25519 webhook + v2 message APIs)",
        }
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            chat_types: &[ChatType::Direct, ChatType::Group],
            media: true,
            reply: true,
            active_send: true,
        }
    }

    fn config_schema(&self) -> Value {
        json!({
            "appId": { "type": "string", "required": true },
            "clientSecret": { "type": "string", "required": true, "secret": true },
            "markdownSupport": { "type": "boolean", "default": false },
            "webhookPath": { "type": "string" },
            "asr": {
                "enabled": { "type": "boolean", "default": false },
                "appId": { "type": "string" },
                "secretId": { "type": "string" },
                "secretKey": { "type": "string", "secret": true }
            }
        })
    }

    async fn start_account(&mut self, account_id: &str, config: Value) -> Result<()> {
        let config: QqBotConfig = serde_json::from_value(config)?;
        if config.app_id.as_deref().is_none_or(str::is_empty) {
            anyhow::bail!("qqbot appId is required");
        }
        if config.client_secret.is_none() {
            anyhow::bail!("qqbot clientSecret is required");
        }

        let transcriber: Option<Arc<dyn Transcriber>> = if config.asr.is_usable() {
            let asr = TencentFlashAsr::new(
                config.asr.app_id.clone().unwrap_or_default(),
                config.asr.secret_id.clone().unwrap_or_default(),
                secrecy::Secret::new(
                    config
                        .asr
                        .secret_key
                        .as_ref()
                        .map(|s| s.expose_secret().clone())
                        .unwrap_or_default(),
                ),
            )?;
            Some(Arc::new(asr))
        } else {
            None
        };

        let temp_root = self.data_dir.join("tmp").join(account_id);
        let downloader = Arc::new(Downloader::new(&temp_root)?);
        let archive = Arc::new(MediaArchive::new(
            &temp_root,
            self.data_dir.join("media"),
            qiao_media::DEFAULT_KEEP_DAYS,
        )?);

        let webhook_path = config.webhook_path_for(account_id);
        let cancel = CancellationToken::new();
        let state = Arc::new(AccountState {
            account_id: account_id.to_string(),
            policy: config.common.policy(),
            config,
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(qiao_media::METADATA_TIMEOUT_SECS))
                .build()?,
            tokens: AppTokenCache::new(),
            downloader,
            archive,
            transcriber,
            sink: Arc::clone(&self.sink),
            queue: qiao_channels::SerialQueue::new(cancel.clone()),
            cancel,
            webhook_path: webhook_path.clone(),
            api_base: API_BASE.to_string(),
        });

        self.routes.register(&webhook_path, Arc::new(QqBotWebhook {
            state: Arc::clone(&state),
        }))?;
        {
            let mut accounts = self.accounts.write().unwrap_or_else(|e| e.into_inner());
            accounts.insert(account_id.to_string(), state);
        }
        info!(account_id, path = %webhook_path, "qqbot account started");
        self.publish_status(account_id, true).await;
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
                info!(account_id, "qqbot account stopped");
                self.publish_status(account_id, false).await;
            },
            None => warn!(account_id, "qqbot account not found"),
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

#[cfg(test)]
mod tests {
    use {
        qiao_channels::webhook::NoopRouteRegistrar,
        qiao_host::ReplyDeliverer,
    };

    use {super::*, qiao_common::InboundEnvelope};

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

    #[tokio::test]
    async fn start_requires_app_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let mut plugin = QqBotPlugin::new(Arc::new(NullSink), Arc::new(NoopRouteRegistrar))
            .with_data_dir(dir.path());
        assert!(plugin.start_account("a", json!({})).await.is_err());
        assert!(
            plugin
                .start_account("a", json!({ "appId": "102001" }))
                .await
                .is_err()
        );
        plugin
            .start_account(
                "a",
                json!({ "appId": "102001", "clientSecret": "cs" }),
            )
            .await
            .unwrap();
        assert_eq!(plugin.account_ids(), vec!["a"]);
        plugin.stop_account("a").await.unwrap();
    }
}
