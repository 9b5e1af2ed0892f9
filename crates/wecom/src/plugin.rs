use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex, RwLock},
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
    qiao_weapi::WecomCrypto,
};

use crate::{
    config::WecomConfig,
    outbound::WecomOutbound,
    state::{AccountState, AccountStateMap},
    webhook::WecomWebhook,
};

/// WeCom AI-robot channel plugin.
pub struct WecomPlugin {
    accounts: AccountStateMap,
    outbound: WecomOutbound,
    sink: Arc<dyn InboundSink>,
    routes: Arc<dyn RouteRegistrar>,
    status: Arc<dyn StatusSink>,
    data_dir: PathBuf,
}

impl WecomPlugin {
    pub fn new(sink: Arc<dyn InboundSink>, routes: Arc<dyn RouteRegistrar>) -> Self {
        let accounts: AccountStateMap = Arc::new(RwLock::new(HashMap::new()));
        let outbound = WecomOutbound {
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

    async fn publish_status(&self, account_id: &str, running: bool, can_send: bool) {
        self.status
            .publish(AccountStatus {
                channel: ChannelKind::Wecom,
                account_id: account_id.to_string(),
                running,
                configured: running,
                can_send_active: can_send,
                started_at_ms: running.then(now_ms),
                last_inbound_at_ms: None,
                last_error: None,
            })
            .await;
    }
}

#[async_trait]
impl ChannelPlugin for WecomPlugin {
    fn id(&self) -> ChannelKind {
        ChannelKind::Wecom
    }

    fn meta(&self) -> ChannelMeta {
        ChannelMeta {
            label: "WeCom",
            description: "WeCom AI robot (encrypted JSON callback + response_url replies)",
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
            "token": { "type": "string", "required": true },
            "encodingAESKey": { "type": "string", "required": true, "secret": true },
            "receiveId": { "type": "string" },
            "webhookPath": { "type": "string" },
            "robotWebhookUrl": { "type": "string", "secret": true }
        })
    }

    async fn start_account(&mut self, account_id: &str, config: Value) -> Result<()> {
        let config: WecomConfig = serde_json::from_value(config)?;
        let token = config
            .token
            .clone()
            .ok_or_else(|| anyhow::anyhow!("wecom callback token is required"))?;
        let aes_key = config
            .encoding_aes_key
            .clone()
            .ok_or_else(|| anyhow::anyhow!("wecom encodingAESKey is required"))?;

        let crypto = WecomCrypto::new(&token, secrecy::ExposeSecret::expose_secret(&aes_key))?;
        let temp_root = self.data_dir.join("tmp").join(account_id);
        let media_root = self.data_dir.join("media");
        let downloader = Arc::new(Downloader::new(&temp_root)?);
        let archive = Arc::new(MediaArchive::new(
            &temp_root,
            media_root,
            qiao_media::DEFAULT_KEEP_DAYS,
        )?);

        let can_send = config.robot_webhook_url.is_some();
        let webhook_path = config.webhook_path_for(account_id);
        let cancel = CancellationToken::new();
        let state = Arc::new(AccountState {
            account_id: account_id.to_string(),
            policy: config.common.policy(),
            config,
            crypto,
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(qiao_media::METADATA_TIMEOUT_SECS))
                .build()?,
            downloader,
            archive,
            sink: Arc::clone(&self.sink),
            queue: qiao_channels::SerialQueue::new(cancel.clone()),
            cancel,
            webhook_path: webhook_path.clone(),
            response_urls: Mutex::new(HashMap::new()),
        });

        self.routes.register(&webhook_path, Arc::new(WecomWebhook {
            state: Arc::clone(&state),
        }))?;
        {
            let mut accounts = self.accounts.write().unwrap_or_else(|e| e.into_inner());
            accounts.insert(account_id.to_string(), state);
        }
        info!(account_id, path = %webhook_path, "wecom account started");
        self.publish_status(account_id, true, can_send).await;
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
                info!(account_id, "wecom account stopped");
                self.publish_status(account_id, false, false).await;
            },
            None => warn!(account_id, "wecom account not found"),
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
        qiao_channels::webhook::{
            NoopRouteRegistrar, WebhookHandler, WebhookRequest,
        },
        qiao_host::ReplyDeliverer,
    };

    use {
        super::*,
        crate::webhook::WecomWebhook,
        qiao_common::InboundEnvelope,
        std::collections::HashMap as StdHashMap,
    };

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

    fn start_config() -> Value {
        json!({ "token": "tok", "encodingAESKey": "B".repeat(43) })
    }

    async fn started_plugin(dir: &std::path::Path) -> WecomPlugin {
        let mut plugin = WecomPlugin::new(Arc::new(NullSink), Arc::new(NoopRouteRegistrar))
            .with_data_dir(dir);
        plugin.start_account("default", start_config()).await.unwrap();
        plugin
    }

    fn webhook_for(plugin: &WecomPlugin) -> WecomWebhook {
        let accounts = plugin.accounts.read().unwrap();
        WecomWebhook {
            state: Arc::clone(accounts.get("default").unwrap()),
        }
    }

    fn request(
        method: &str,
        query: &[(&str, &str)],
        body: &str,
    ) -> WebhookRequest {
        WebhookRequest {
            method: method.into(),
            path: "/webhooks/wecom/default".into(),
            query: query
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            headers: StdHashMap::new(),
            body: body.as_bytes().to_vec(),
        }
    }

    #[tokio::test]
    async fn echo_verification_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = started_plugin(dir.path()).await;
        let webhook = webhook_for(&plugin);
        let crypto = &webhook.state.crypto;

        let echostr = crypto.encrypt("echo-plain-7", "").unwrap();
        let signature = crypto.sign("1700", "n1", &echostr);
        let response = webhook
            .handle(request(
                "GET",
                &[
                    ("msg_signature", signature.as_str()),
                    ("timestamp", "1700"),
                    ("nonce", "n1"),
                    ("echostr", echostr.as_str()),
                ],
                "",
            ))
            .await;
        assert_eq!(response.status, 200);
        assert_eq!(response.body, "echo-plain-7");
    }

    #[tokio::test]
    async fn wrong_signature_is_rejected_with_400() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = started_plugin(dir.path()).await;
        let webhook = webhook_for(&plugin);
        let crypto = &webhook.state.crypto;

        let payload = json!({
            "msgtype": "text",
            "msgid": "m1",
            "from": { "userid": "u1" },
            "text": { "content": "hi" }
        })
        .to_string();
        let encrypt = crypto.encrypt(&payload, "").unwrap();
        let body = json!({ "encrypt": encrypt }).to_string();

        let response = webhook
            .handle(request(
                "POST",
                &[
                    ("msg_signature", "deadbeef"),
                    ("timestamp", "1700"),
                    ("nonce", "n1"),
                ],
                &body,
            ))
            .await;
        assert_eq!(response.status, 400);
    }

    #[tokio::test]
    async fn valid_message_gets_encrypted_stream_ack() {
        let dir = tempfile::tempdir().unwrap();
        let plugin = started_plugin(dir.path()).await;
        let webhook = webhook_for(&plugin);
        let crypto = webhook.state.crypto.clone();

        let payload = json!({
            "msgtype": "text",
            "msgid": "m42",
            "chattype": "single",
            "from": { "userid": "u1" },
            "response_url": "https://qyapi.weixin.qq.com/resp/m42",
            "text": { "content": "hello" }
        })
        .to_string();
        let encrypt = crypto.encrypt(&payload, "").unwrap();
        let signature = crypto.sign("1700", "n2", &encrypt);
        let body = json!({ "encrypt": encrypt }).to_string();

        let response = webhook
            .handle(request(
                "POST",
                &[
                    ("msg_signature", signature.as_str()),
                    ("timestamp", "1700"),
                    ("nonce", "n2"),
                ],
                &body,
            ))
            .await;
        assert_eq!(response.status, 200);

        let ack: Value = serde_json::from_str(&response.body).unwrap();
        let ack_encrypt = ack["encrypt"].as_str().unwrap();
        // the ack signature must verify and decrypt to a stream message
        assert!(crypto.verify_signature(
            ack["msgsignature"].as_str().unwrap(),
            ack["timestamp"].as_str().unwrap(),
            ack["nonce"].as_str().unwrap(),
            ack_encrypt,
        ));
        let plain = crypto.decrypt(ack_encrypt, None).unwrap();
        let ack_payload: Value = serde_json::from_str(&plain).unwrap();
        assert_eq!(ack_payload["msgtype"], "stream");
        assert_eq!(ack_payload["stream"]["id"], "m42");

        // the response_url was captured for the out-of-band reply
        let entry = webhook.state.take_response_url("u1").unwrap();
        assert_eq!(entry.url, "https://qyapi.weixin.qq.com/resp/m42");
        assert_eq!(entry.msg_id, "m42");
    }

    #[tokio::test]
    async fn stop_account_unregisters_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut plugin = started_plugin(dir.path()).await;
        assert_eq!(plugin.account_ids(), vec!["default"]);
        plugin.stop_account("default").await.unwrap();
        assert!(plugin.account_ids().is_empty());
    }
}
