//! Per-account lifecycle: start everything the config declares, stop and
//! restart affected accounts when config keys change, and route
//! host-initiated sends to the owning plugin.

use std::sync::Arc;

use {
    anyhow::Result,
    serde_json::Value,
    tokio::sync::Mutex,
    tracing::{info, warn},
};

use {
    qiao_channels::{
        ChannelRegistry, InboundSink, SendOutcome, StatusSink,
        webhook::RouteRegistrar,
    },
    qiao_common::{ChannelKind, ReplyPayload},
    qiao_config::{list_account_ids, reload_prefix_matches, resolve_account},
    qiao_dingtalk::DingTalkPlugin,
    qiao_feishu::FeishuPlugin,
    qiao_qqbot::QqBotPlugin,
    qiao_wecom::WecomPlugin,
    qiao_wecom_app::WecomAppPlugin,
};

/// Owns the plugin registry and the current config snapshot.
pub struct GatewayManager {
    registry: Mutex<ChannelRegistry>,
    config: Mutex<Value>,
}

impl GatewayManager {
    /// Build a manager with all five channel plugins wired to the given
    /// sink and webhook registrar.
    pub fn new(
        sink: Arc<dyn InboundSink>,
        routes: Arc<dyn RouteRegistrar>,
        status: Arc<dyn StatusSink>,
        data_dir: impl Into<std::path::PathBuf>,
    ) -> Self {
        let data_dir = data_dir.into();
        let mut registry = ChannelRegistry::new();
        registry.register(Box::new(
            DingTalkPlugin::new(Arc::clone(&sink))
                .with_status_sink(Arc::clone(&status))
                .with_data_dir(&data_dir),
        ));
        registry.register(Box::new(
            FeishuPlugin::new(Arc::clone(&sink))
                .with_status_sink(Arc::clone(&status))
                .with_data_dir(&data_dir),
        ));
        registry.register(Box::new(
            WecomPlugin::new(Arc::clone(&sink), Arc::clone(&routes))
                .with_status_sink(Arc::clone(&status))
                .with_data_dir(&data_dir),
        ));
        registry.register(Box::new(
            WecomAppPlugin::new(Arc::clone(&sink), Arc::clone(&routes))
                .with_status_sink(Arc::clone(&status))
                .with_data_dir(&data_dir),
        ));
        registry.register(Box::new(
            QqBotPlugin::new(sink, routes)
                .with_status_sink(status)
                .with_data_dir(&data_dir),
        ));

        Self {
            registry: Mutex::new(registry),
            config: Mutex::new(Value::Null),
        }
    }

    /// Start every enabled, configured account the config declares.
    pub async fn start_all(&self, root: Value) {
        {
            let mut config = self.config.lock().await;
            *config = root.clone();
        }
        for channel in ChannelKind::ALL {
            self.start_channel_accounts(&root, channel).await;
        }
    }

    /// Stop every running account.
    pub async fn stop_all(&self) {
        let root = self.config.lock().await.clone();
        let mut registry = self.registry.lock().await;
        for channel in ChannelKind::ALL {
            let Some(plugin) = registry.get_mut(channel) else {
                continue;
            };
            for account_id in list_account_ids(&root, channel) {
                if let Err(error) = plugin.stop_account(&account_id).await {
                    warn!(channel = %channel, account_id, error = %error, "stop failed");
                }
            }
        }
    }

    /// Apply a config change: channels whose reload prefixes match any
    /// changed key are stopped and restarted from the new snapshot.
    pub async fn apply_config_change(&self, new_root: Value, changed_keys: &[String]) {
        let old_root = {
            let mut config = self.config.lock().await;
            let old = config.clone();
            *config = new_root.clone();
            old
        };

        for channel in ChannelKind::ALL {
            let affected = changed_keys
                .iter()
                .any(|key| reload_prefix_matches(key, channel));
            if !affected {
                continue;
            }
            info!(channel = %channel, "config change affects channel, restarting accounts");

            {
                let mut registry = self.registry.lock().await;
                if let Some(plugin) = registry.get_mut(channel) {
                    for account_id in list_account_ids(&old_root, channel) {
                        if let Err(error) = plugin.stop_account(&account_id).await {
                            warn!(channel = %channel, account_id, error = %error, "stop failed");
                        }
                    }
                }
            }
            self.start_channel_accounts(&new_root, channel).await;
        }
    }

    async fn start_channel_accounts(&self, root: &Value, channel: ChannelKind) {
        let account_ids = list_account_ids(root, channel);
        if account_ids.is_empty() {
            return;
        }
        let mut registry = self.registry.lock().await;
        let Some(plugin) = registry.get_mut(channel) else {
            return;
        };
        for account_id in account_ids {
            let resolved = resolve_account(root, channel, &account_id);
            if !resolved.enabled {
                info!(channel = %channel, account_id, "account disabled, skipping");
                continue;
            }
            if !resolved.configured {
                warn!(
                    channel = %channel,
                    account_id,
                    error = resolved.config_error.as_deref().unwrap_or("missing credentials"),
                    "account not configured, skipping"
                );
                continue;
            }
            if let Err(error) = plugin.start_account(&account_id, resolved.raw.clone()).await {
                warn!(channel = %channel, account_id, error = %error, "account start failed");
            }
        }
    }

    /// Host-initiated text send to a directory target string.
    pub async fn send_text(&self, target: &str, text: &str) -> Result<()> {
        let registry = self.registry.lock().await;
        let plugin = registry
            .resolve_target_owner(target)
            .ok_or_else(|| anyhow::anyhow!("no channel resolves target: {target}"))?;
        let target_ref = plugin
            .resolve_target(target)
            .ok_or_else(|| anyhow::anyhow!("unresolvable target: {target}"))?;
        let outbound = plugin
            .outbound()
            .ok_or_else(|| anyhow::anyhow!("channel {} cannot send", plugin.id()))?;
        outbound
            .send_text(&target_ref.account_id, &target_ref.send_to(), text)
            .await
    }

    /// Host-initiated media send to a directory target string.
    pub async fn send_media(&self, target: &str, payload: &ReplyPayload) -> Result<SendOutcome> {
        let registry = self.registry.lock().await;
        let plugin = registry
            .resolve_target_owner(target)
            .ok_or_else(|| anyhow::anyhow!("no channel resolves target: {target}"))?;
        let target_ref = plugin
            .resolve_target(target)
            .ok_or_else(|| anyhow::anyhow!("unresolvable target: {target}"))?;
        let outbound = plugin
            .outbound()
            .ok_or_else(|| anyhow::anyhow!("channel {} cannot send", plugin.id()))?;
        outbound
            .send_media(&target_ref.account_id, &target_ref.send_to(), payload)
            .await
    }

    /// Run `f` with the registry locked (status queries, tests).
    pub async fn with_registry<T>(&self, f: impl FnOnce(&ChannelRegistry) -> T) -> T {
        let registry = self.registry.lock().await;
        f(&registry)
    }
}
