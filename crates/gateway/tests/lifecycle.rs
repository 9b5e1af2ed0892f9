//! End-to-end lifecycle: an encrypted WeCom-App callback flows through
//! the shared webhook router into the inbound sink, and a config reload
//! that disables the account tears its route down.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use {
    async_trait::async_trait,
    serde_json::json,
};

use {
    qiao_channels::{
        InboundSink, NoopStatusSink,
        webhook::{RouteRegistrar, WebhookRequest},
    },
    qiao_common::{ChatType, InboundEnvelope},
    qiao_gateway::{GatewayManager, WebhookRouter},
    qiao_host::ReplyDeliverer,
    qiao_weapi::WecomCrypto,
};

#[derive(Default)]
struct RecordingSink {
    envelopes: Mutex<Vec<InboundEnvelope>>,
}

#[async_trait]
impl InboundSink for RecordingSink {
    async fn dispatch_envelope(
        &self,
        envelope: InboundEnvelope,
        _deliverer: Arc<dyn ReplyDeliverer>,
    ) {
        self.envelopes.lock().unwrap().push(envelope);
    }
}

fn wecom_app_root(enabled: bool) -> serde_json::Value {
    json!({
        "channels": {
            "wecom-app": {
                "enabled": enabled,
                "corpId": "corp1",
                "corpSecret": "cs",
                "agentId": 1000002,
                "token": "cb-token",
                "encodingAESKey": "A".repeat(43),
                "dmPolicy": "open",
                "inboundMedia": { "enabled": false }
            }
        }
    })
}

fn callback_request(crypto: &WecomCrypto, inner_xml: &str) -> WebhookRequest {
    let encrypt = crypto.encrypt(inner_xml, "corp1").unwrap();
    let signature = crypto.sign("1700000000", "nonce1", &encrypt);
    let body = format!("<xml><Encrypt><![CDATA[{encrypt}]]></Encrypt></xml>");

    let mut query = HashMap::new();
    query.insert("msg_signature".to_string(), signature);
    query.insert("timestamp".to_string(), "1700000000".to_string());
    query.insert("nonce".to_string(), "nonce1".to_string());

    WebhookRequest {
        method: "POST".into(),
        path: "/webhooks/wecom-app/default".into(),
        query,
        headers: HashMap::new(),
        body: body.into_bytes(),
    }
}

async fn wait_for_envelope(sink: &RecordingSink) -> InboundEnvelope {
    for _ in 0..100 {
        {
            let envelopes = sink.envelopes.lock().unwrap();
            if let Some(envelope) = envelopes.first() {
                return envelope.clone();
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("no envelope dispatched within the deadline");
}

#[tokio::test]
async fn callback_flows_to_sink_and_reload_disables_the_route() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(RecordingSink::default());
    let router = Arc::new(WebhookRouter::new());
    let manager = GatewayManager::new(
        sink.clone(),
        router.clone() as Arc<dyn RouteRegistrar>,
        Arc::new(NoopStatusSink),
        dir.path(),
    );

    manager.start_all(wecom_app_root(true)).await;
    assert_eq!(router.paths(), vec!["/webhooks/wecom-app/default"]);

    let crypto = WecomCrypto::new("cb-token", &"A".repeat(43)).unwrap();
    let inner = "<xml>\
        <ToUserName><![CDATA[corp1]]></ToUserName>\
        <FromUserName><![CDATA[alice]]></FromUserName>\
        <CreateTime>1700000000</CreateTime>\
        <MsgType><![CDATA[text]]></MsgType>\
        <Content><![CDATA[hello gateway]]></Content>\
        <MsgId>5001</MsgId>\
        </xml>";

    let response = router.dispatch(callback_request(&crypto, inner)).await;
    assert_eq!(response.status, 200, "callback acked inside the window");

    let envelope = wait_for_envelope(&sink).await;
    assert_eq!(envelope.message_id, "5001");
    assert_eq!(envelope.sender_id, "alice");
    assert_eq!(envelope.body, "hello gateway");
    assert_eq!(envelope.chat_type, ChatType::Direct);
    assert_eq!(envelope.timestamp_ms, 1_700_000_000_000);

    // reload with the account disabled: the route must answer 404 next
    manager
        .apply_config_change(
            wecom_app_root(false),
            &["channels.wecom-app.enabled".to_string()],
        )
        .await;
    assert!(router.paths().is_empty());

    let response = router.dispatch(callback_request(&crypto, inner)).await;
    assert_eq!(response.status, 404);
}

#[tokio::test]
async fn tampered_callback_is_rejected_not_dispatched() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(RecordingSink::default());
    let router = Arc::new(WebhookRouter::new());
    let manager = GatewayManager::new(
        sink.clone(),
        router.clone() as Arc<dyn RouteRegistrar>,
        Arc::new(NoopStatusSink),
        dir.path(),
    );
    manager.start_all(wecom_app_root(true)).await;

    let crypto = WecomCrypto::new("cb-token", &"A".repeat(43)).unwrap();
    let mut request = callback_request(&crypto, "<xml><MsgType>text</MsgType></xml>");
    request
        .query
        .insert("msg_signature".to_string(), "badsignature".to_string());

    let response = router.dispatch(request).await;
    assert_eq!(response.status, 400);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(sink.envelopes.lock().unwrap().is_empty());
}

#[tokio::test]
async fn unknown_targets_cannot_be_sent_to() {
    let dir = tempfile::tempdir().unwrap();
    let manager = GatewayManager::new(
        Arc::new(RecordingSink::default()),
        Arc::new(WebhookRouter::new()) as Arc<dyn RouteRegistrar>,
        Arc::new(NoopStatusSink),
        dir.path(),
    );
    // five plugins registered: an unprefixed target is ambiguous
    let err = manager.send_text("user:alice", "hi").await.unwrap_err();
    assert!(err.to_string().contains("no channel resolves"));
}
