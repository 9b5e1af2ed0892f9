//! AI-robot callback endpoint: echo verification, encrypted JSON
//! messages, and the immediate `stream` acknowledgement.

use std::sync::Arc;

use {
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
    normalize::{normalize, parse_inbound},
    outbound::WecomDeliverer,
    state::AccountState,
};

/// One account's webhook endpoint.
pub struct WecomWebhook {
    pub state: Arc<AccountState>,
}

#[async_trait]
impl WebhookHandler for WecomWebhook {
    async fn handle(&self, request: WebhookRequest) -> WebhookResponse {
        match request.method.as_str() {
            "GET" => self.verify_url(&request),
            "POST" => self.receive(&request),
            _ => WebhookResponse::bad_request("unsupported method"),
        }
    }
}

impl WecomWebhook {
    fn verify_url(&self, request: &WebhookRequest) -> WebhookResponse {
        let (Some(signature), Some(timestamp), Some(nonce), Some(echostr)) = (
            request.query_param("msg_signature"),
            request.query_param("timestamp"),
            request.query_param("nonce"),
            request.query_param("echostr"),
        ) else {
            return WebhookResponse::bad_request("missing verification params");
        };
        if !self
            .state
            .crypto
            .verify_signature(signature, timestamp, nonce, echostr)
        {
            return WebhookResponse::bad_request("signature mismatch");
        }
        match self
            .state
            .crypto
            .decrypt(echostr, self.state.config.receive_id.as_deref())
        {
            Ok(plain) => WebhookResponse::ok(plain),
            Err(error) => {
                warn!(error = %error, "wecom echo decrypt failed");
                WebhookResponse::bad_request("decrypt failed")
            },
        }
    }

    fn receive(&self, request: &WebhookRequest) -> WebhookResponse {
        let (Some(signature), Some(timestamp), Some(nonce)) = (
            request.query_param("msg_signature"),
            request.query_param("timestamp"),
            request.query_param("nonce"),
        ) else {
            return WebhookResponse::bad_request("missing signature params");
        };

        let envelope: Value = match serde_json::from_slice(&request.body) {
            Ok(value) => value,
            Err(error) => {
                warn!(error = %error, "wecom callback body is not json");
                return WebhookResponse::bad_request("bad json");
            },
        };
        let Some(encrypt) = envelope.get("encrypt").and_then(Value::as_str) else {
            return WebhookResponse::bad_request("missing encrypt");
        };

        if !self
            .state
            .crypto
            .verify_signature(signature, timestamp, nonce, encrypt)
        {
            debug!(account_id = %self.state.account_id, "wecom signature mismatch");
            return WebhookResponse::bad_request("signature mismatch");
        }
        let plain = match self
            .state
            .crypto
            .decrypt(encrypt, self.state.config.receive_id.as_deref())
        {
            Ok(plain) => plain,
            Err(error) => {
                warn!(error = %error, "wecom payload decrypt failed");
                return WebhookResponse::bad_request("decrypt failed");
            },
        };
        let payload: Value = match serde_json::from_str(&plain) {
            Ok(value) => value,
            Err(error) => {
                warn!(error = %error, "wecom decrypted payload is not json");
                return WebhookResponse::bad_request("bad payload");
            },
        };

        let Some(parsed) = parse_inbound(&payload) else {
            // stream refreshes and events are acked and dropped
            return WebhookResponse::json("{}".to_string());
        };

        // a host reply will rarely make the 5s window: remember where to
        // answer, ack with an empty stream, reply out-of-band
        if let Some(response_url) = &parsed.response_url {
            let peer = parsed
                .chat_id
                .clone()
                .unwrap_or_else(|| parsed.sender_id.clone());
            self.state
                .cache_response_url(&peer, &parsed.msg_id, response_url);
        }

        let state = Arc::clone(&self.state);
        let parsed_for_task = parsed.clone();
        let accepted = self.state.queue.push(Box::pin(async move {
            process_payload(state, parsed_for_task, payload).await;
        }));
        if !accepted {
            debug!("wecom account stopping, message dropped");
        }

        self.stream_ack(&parsed.msg_id)
    }

    /// Encrypted `{"msgtype":"stream"}` acknowledgement.
    fn stream_ack(&self, msg_id: &str) -> WebhookResponse {
        let plain = json!({ "msgtype": "stream", "stream": { "id": msg_id } }).to_string();
        let receive_id = self.state.config.receive_id.as_deref().unwrap_or("");
        let reply = match self.state.crypto.encrypted_reply(&plain, receive_id) {
            Ok(reply) => reply,
            Err(error) => {
                warn!(error = %error, "wecom stream ack encrypt failed");
                return WebhookResponse::json("{}".to_string());
            },
        };
        WebhookResponse::json(
            json!({
                "encrypt": reply.encrypt,
                "msgsignature": reply.signature,
                "timestamp": reply.timestamp,
                "nonce": reply.nonce,
            })
            .to_string(),
        )
    }
}

async fn process_payload(
    state: Arc<AccountState>,
    parsed: crate::normalize::ParsedInbound,
    payload: Value,
) {
    let Some(mut envelope) = normalize(&state, &parsed, &payload).await else {
        return;
    };
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
            "wecom message dropped by policy"
        );
        return;
    }
    if !qiao_host::finalize_inbound_context(&mut envelope) {
        return;
    }

    let deliverer = Arc::new(WecomDeliverer {
        state: Arc::clone(&state),
        to: envelope.peer_id.clone(),
    });
    state.sink.dispatch_envelope(envelope, deliverer).await;
}
