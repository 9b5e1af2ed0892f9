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
    },
    qiao_common::{ChannelKind, ChatType},
    qiao_media::{Downloader, MediaArchive},
};

use crate::{
    config::FeishuConfig,
    outbound::FeishuOutbound,
    state::{AccountState, AccountStateMap},
    token::FeishuApi,
    ws::run_long_connection,
};

/// Feishu channel plugin.
pub struct FeishuPlugin {
    accounts: AccountStateMap,
    outbound: FeishuOutbound,
    sink: Arc<dyn InboundSink>,
    status: Arc<dyn StatusSink>,
    data_dir: PathBuf,
}

impl FeishuPlugin {
    pub fn new(sink: Arc<dyn InboundSink>) -> Self {
        let accounts: AccountStateMap = Arc::new(RwLock::new(HashMap::new()));
        let outbound = FeishuOutbound {
            accounts: Arc::clone(&accounts),
        };
        Self {
            accounts,
            outbound,
            sink,
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
                channel: ChannelKind::Feishu,
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
impl ChannelPlugin for FeishuPlugin {
    fn id(&self) -> ChannelKind {
        ChannelKind::Feishu
    }

    fn meta(&self) -> ChannelMeta {
        ChannelMeta {
            label: "Feishu",
            description: "Feishu app (long-connection ingress + im/v1 sends)",
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
            "appSecret": { "type": "string", "required": true, "secret": true },
            "encryptKey": { "type": "string", "secret": true },
            "sendMarkdownAsCard": { "type": "boolean", "default": false },
            "domain": { "type": "string" }
        })
    }

    async fn start_account(&mut self, account_id: &str, config: Value) -> Result<()> {
        let config: FeishuConfig = serde_json::from_value(config)?;
        let app_id = config
            .app_id
            .clone()
            .ok_or_else(|| anyhow::anyhow!("feishu appId is required"))?;
        let app_secret = config
            .app_secret
            .clone()
            .ok_or_else(|| anyhow::anyhow!("feishu appSecret is required"))?;

        let api = Arc::new(FeishuApi::new(config.api_base(), app_id, app_secret)?);
        let temp_root = self.data_dir.join("tmp").join(account_id);
        let downloader = Arc::new(Downloader::new(&temp_root)?);
        let archive = Arc::new(MediaArchive::new(
            &temp_root,
            self.data_dir.join("media"),
            qiao_media::DEFAULT_KEEP_DAYS,
        )?);

        let cancel = CancellationToken::new();
        let state = Arc::new(AccountState {
            account_id: account_id.to_string(),
            policy: config.common.policy(),
            config,
            api,
            downloader,
            archive,
            sink: Arc::clone(&self.sink),
            queue: qiao_channels::SerialQueue::new(cancel.clone()),
            cancel,
        });

        {
            let mut accounts = self.accounts.write().unwrap_or_else(|e| e.into_inner());
            accounts.insert(account_id.to_string(), Arc::clone(&state));
        }
        tokio::spawn(run_long_connection(Arc::clone(&state)));
        info!(account_id, "feishu account started");
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
                info!(account_id, "feishu account stopped");
                self.publish_status(account_id, false).await;
            },
            None => warn!(account_id, "feishu account not found"),
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
    use qiao_host::ReplyDeliverer;

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
    async fn lifecycle_requires_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let mut plugin = FeishuPlugin::new(Arc::new(NullSink)).with_data_dir(dir.path());
        assert!(plugin.start_account("a", json!({})).await.is_err());
        plugin
            .start_account("a", json!({ "appId": "cli_x", "appSecret": "s" }))
            .await
            .unwrap();
        assert_eq!(plugin.account_ids(), vec!["a"]);
        plugin.stop_account("a").await.unwrap();
        assert!(plugin.account_ids().is_empty());
    }
}
