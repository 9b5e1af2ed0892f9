//! Webhook endpoint: ed25519 verification, the opcode-13 validation
//! handshake, and opcode-0 event dispatch.

use std::sync::Arc;

use {
    secrecy::ExposeSecret,
    serde_json::{Value, json},
    tracing::{debug, warn},
};

use {
    async_trait::async_trait,
    qiao_channels::{
        gating,
        webhook::{WebhookHandler, WebhookRequest, WebhookResponse},
    },
};

use crate::{
    normalize::{MessageEvent, Normalized, normalize},
    outbound::{PeerKind, QqBotDeliverer, ReplyContext, send_text_units},
    sign,
    state::AccountState,
};

const OP_DISPATCH: i64 = 0;
const OP_HTTP_ACK: i64 = 12;
const OP_VALIDATION: i64 = 13;

/// One account's webhook endpoint.
pub struct QqBotWebhook {
    pub state: Arc<AccountState>,
}

#[async_trait]
impl WebhookHandler for QqBotWebhook {
    async fn handle(&self, request: WebhookRequest) -> WebhookResponse {
        if request.method != "POST" {
            return WebhookResponse::bad_request("unsupported method");
        }

        let Some(secret) = self.state.config.client_secret.as_ref() else {
            return WebhookResponse::bad_request("account not configured");
        };
        let secret = secret.expose_secret();

        let (Some(signature), Some(timestamp)) = (
            request.header("x-signature-ed25519"),
            request.header("x-signature-timestamp"),
        ) else {
            return WebhookResponse::bad_request("missing signature headers");
        };
        if !sign::verify(secret, signature, timestamp, &request.body) {
            debug!(account_id = %self.state.account_id, "qqbot signature mismatch");
            return WebhookResponse::bad_request("signature mismatch");
        }

        let payload: Value = match serde_json::from_slice(&request.body) {
            Ok(value) => value,
            Err(error) => {
                warn!(error = %error, "qqbot payload is not json");
                return WebhookResponse::bad_request("bad json");
            },
        };

        match payload.get("op").and_then(Value::as_i64) {
            Some(OP_VALIDATION) => self.validation_response(secret, &payload),
            Some(OP_DISPATCH) => {
                self.dispatch(&payload);
                WebhookResponse::json(json!({ "op": OP_HTTP_ACK }).to_string())
            },
            other => {
                debug!(op = ?other, "qqbot opcode ignored");
                WebhookResponse::json(json!({ "op": OP_HTTP_ACK }).to_string())
            },
        }
    }
}

impl QqBotWebhook {
    /// Opcode 13: prove we hold the secret by signing the challenge.
    fn validation_response(&self, secret: &str, payload: &Value) -> WebhookResponse {
        let plain_token = payload
            .pointer("/d/plain_token")
            .and_then(Value::as_str)
            .unwrap_or("");
        let event_ts = payload
            .pointer("/d/event_ts")
            .and_then(Value::as_str)
            .unwrap_or("");
        if plain_token.is_empty() || event_ts.is_empty() {
            return WebhookResponse::bad_request("missing validation challenge");
        }
        let signature = sign::sign_validation(secret, event_ts, plain_token);
        WebhookResponse::json(
            json!({ "plain_token": plain_token, "signature": signature }).to_string(),
        )
    }

    /// Opcode 0: hand the event to the async pipeline and ack at once.
    fn dispatch(&self, payload: &Value) {
        let event_type = payload.get("t").and_then(Value::as_str).unwrap_or("");
        let Some(event) = MessageEvent::parse(event_type) else {
            debug!(event_type, "qqbot event ignored");
            return;
        };
        let Some(data) = payload.get("d").cloned() else {
            return;
        };
        let state = Arc::clone(&self.state);
        let accepted = self.state.queue.push(Box::pin(async move {
            process_event(state, event, data).await;
        }));
        if !accepted {
            debug!("qqbot account stopping, message dropped");
        }
    }
}

async fn process_event(state: Arc<AccountState>, event: MessageEvent, data: Value) {
    let peer_kind = match event {
        MessageEvent::C2c => PeerKind::User,
        MessageEvent::GroupAt => PeerKind::Group,
        MessageEvent::ChannelAt => PeerKind::GuildChannel,
    };

    match normalize(&state, event, &data).await {
        Normalized::Skip => {},
        Normalized::ReplyDirect { message_id, text } => {
            // voice we could not transcribe: tell the user, skip the agent
            let peer_id = match normalize_peer(&data, event) {
                Some(peer) => peer,
                None => return,
            };
            let reply = ReplyContext::new(message_id);
            if let Err(error) =
                send_text_units(&state, peer_kind, &peer_id, &text, Some(&reply)).await
            {
                warn!(error = %error, "qqbot asr fallback reply failed");
            }
        },
        Normalized::Ready(mut envelope) => {
            let decision = gating::evaluate(
                envelope.chat_type,
                &envelope.sender_id,
                &envelope.peer_id,
                envelope.was_mentioned,
                &state.policy,
            );
            if !decision.allowed {
                debug!(
                    account_id = %state.account_id,
                    sender_id = %envelope.sender_id,
                    reason = decision.reason,
                    "qqbot message dropped by policy"
                );
                return;
            }
            if !qiao_host::finalize_inbound_context(&mut envelope) {
                return;
            }
            let deliverer = Arc::new(QqBotDeliverer {
                state: Arc::clone(&state),
                kind: peer_kind,
                peer_id: envelope.peer_id.clone(),
                reply: ReplyContext::new(envelope.message_id.clone()),
            });
            state.sink.dispatch_envelope(envelope, deliverer).await;
        },
    }
}

fn normalize_peer(data: &Value, event: MessageEvent) -> Option<String> {
    let key = match event {
        MessageEvent::C2c => "/author/user_openid",
        MessageEvent::GroupAt => "/group_openid",
        MessageEvent::ChannelAt => "/channel_id",
    };
    data.pointer(key)
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use {
        ed25519_dalek::Signer,
        qiao_channels::{InboundSink, gating::Policy},
        qiao_host::ReplyDeliverer,
        qiao_media::{Downloader, MediaArchive},
        tokio_util::sync::CancellationToken,
    };

    use {
        super::*,
        crate::{config::QqBotConfig, token::AppTokenCache},
        qiao_common::InboundEnvelope,
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

    fn webhook(dir: &std::path::Path) -> QqBotWebhook {
        let config: QqBotConfig = serde_json::from_value(json!({
            "appId": "102001",
            "clientSecret": "botsecret123",
        }))
        .unwrap();
        QqBotWebhook {
            state: Arc::new(AccountState {
                account_id: "default".into(),
                policy: Policy::standard(),
                config,
                http: reqwest::Client::new(),
                tokens: AppTokenCache::new(),
                downloader: Arc::new(Downloader::new(dir.join("tmp")).unwrap()),
                archive: Arc::new(
                    MediaArchive::new(dir.join("tmp"), dir.join("media"), 7).unwrap(),
                ),
                transcriber: None,
                sink: Arc::new(NullSink),
                cancel: CancellationToken::new(),
                queue: qiao_channels::SerialQueue::new(CancellationToken::new()),
                webhook_path: "/webhooks/qqbot/default".into(),
                api_base: "http://127.0.0.1:1".into(),
            }),
        }
    }

    fn signed_request(secret: &str, body: &str) -> WebhookRequest {
        let timestamp = "1700000000";
        let key = sign::signing_key(secret);
        let mut message = timestamp.as_bytes().to_vec();
        message.extend_from_slice(body.as_bytes());
        let signature = hex::encode(key.sign(&message).to_bytes());

        let mut headers = HashMap::new();
        headers.insert("x-signature-ed25519".to_string(), signature);
        headers.insert("x-signature-timestamp".to_string(), timestamp.to_string());
        WebhookRequest {
            method: "POST".into(),
            path: "/webhooks/qqbot/default".into(),
            query: HashMap::new(),
            headers,
            body: body.as_bytes().to_vec(),
        }
    }

    #[tokio::test]
    async fn validation_handshake_signs_the_challenge() {
        let dir = tempfile::tempdir().unwrap();
        let webhook = webhook(dir.path());
        let body = json!({
            "op": 13,
            "d": { "plain_token": "Arq0AqA", "event_ts": "1700000000" }
        })
        .to_string();

        let response = webhook.handle(signed_request("botsecret123", &body)).await;
        assert_eq!(response.status, 200);
        let value: Value = serde_json::from_str(&response.body).unwrap();
        assert_eq!(value["plain_token"], "Arq0AqA");

        // signature verifies against the derived key
        let key = sign::signing_key("botsecret123");
        let signature = ed25519_dalek::Signature::from_slice(
            &hex::decode(value["signature"].as_str().unwrap()).unwrap(),
        )
        .unwrap();
        use ed25519_dalek::Verifier;
        key.verifying_key()
            .verify(b"1700000000Arq0AqA", &signature)
            .unwrap();
    }

    #[tokio::test]
    async fn bad_signature_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let webhook = webhook(dir.path());
        let body = json!({ "op": 13, "d": {} }).to_string();
        let mut request = signed_request("botsecret123", &body);
        request
            .headers
            .insert("x-signature-ed25519".into(), "00".repeat(64));
        let response = webhook.handle(request).await;
        assert_eq!(response.status, 400);
    }

    #[tokio::test]
    async fn dispatch_events_are_acked_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let webhook = webhook(dir.path());
        let body = json!({
            "op": 0,
            "t": "C2C_MESSAGE_CREATE",
            "d": {
                "id": "m1",
                "content": "hello",
                "author": { "user_openid": "u1" }
            }
        })
        .to_string();
        let response = webhook.handle(signed_request("botsecret123", &body)).await;
        assert_eq!(response.status, 200);
        let value: Value = serde_json::from_str(&response.body).unwrap();
        assert_eq!(value["op"], 12);
    }
}
