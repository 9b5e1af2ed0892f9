//! Callback endpoint: URL verification (GET) and encrypted XML messages
//! (POST), answered inside the platform's 5-second window.

use std::sync::Arc;

use {anyhow::Result, async_trait::async_trait, tracing::{debug, warn}};

use {
    qiao_channels::{
        Error, gating,
        webhook::{WebhookHandler, WebhookRequest, WebhookResponse},
    },
    qiao_host::{BlockKind, ReplyDeliverer},
    qiao_weapi::parse_xml_fields,
};

use crate::{normalize::normalize, outbound::send_text_chunks, state::AccountState};

/// One account's webhook endpoint.
pub struct WecomAppWebhook {
    pub state: Arc<AccountState>,
}

#[async_trait]
impl WebhookHandler for WecomAppWebhook {
    async fn handle(&self, request: WebhookRequest) -> WebhookResponse {
        match request.method.as_str() {
            "GET" => self.verify_url(&request),
            "POST" => self.receive(&request),
            _ => WebhookResponse::bad_request("unsupported method"),
        }
    }
}

impl WecomAppWebhook {
    /// Echo handshake: prove we own the callback URL by decrypting
    /// `echostr` after checking its signature.
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
        match self.state.crypto.decrypt(echostr, self.state.receive_id()) {
            Ok(plain) => WebhookResponse::ok(plain),
            Err(error) => {
                warn!(error = %error, "wecom-app echo decrypt failed");
                WebhookResponse::bad_request("decrypt failed")
            },
        }
    }

    /// Inbound message: verify, decrypt, ack immediately, process async.
    fn receive(&self, request: &WebhookRequest) -> WebhookResponse {
        let (Some(signature), Some(timestamp), Some(nonce)) = (
            request.query_param("msg_signature"),
            request.query_param("timestamp"),
            request.query_param("nonce"),
        ) else {
            return WebhookResponse::bad_request("missing signature params");
        };

        let envelope_fields = match parse_xml_fields(&request.body_text()) {
            Ok(fields) => fields,
            Err(error) => {
                warn!(error = %error, "wecom-app callback xml invalid");
                return WebhookResponse::bad_request("bad xml");
            },
        };
        let Some(encrypt) = envelope_fields.get("Encrypt") else {
            return WebhookResponse::bad_request("missing Encrypt");
        };

        if !self
            .state
            .crypto
            .verify_signature(signature, timestamp, nonce, encrypt)
        {
            debug!(account_id = %self.state.account_id, "wecom-app signature mismatch");
            return WebhookResponse::bad_request(Error::SignatureMismatch.to_string());
        }

        let plain = match self.state.crypto.decrypt(encrypt, self.state.receive_id()) {
            Ok(plain) => plain,
            Err(error) => {
                // do not ack tampered payloads as success
                warn!(error = %error, "wecom-app payload decrypt failed");
                return WebhookResponse::bad_request("decrypt failed");
            },
        };
        let fields = match parse_xml_fields(&plain) {
            Ok(fields) => fields,
            Err(error) => {
                warn!(error = %error, "wecom-app inner xml invalid");
                return WebhookResponse::bad_request("bad payload");
            },
        };

        // the real work happens after the 5s ack, in receive order
        let state = Arc::clone(&self.state);
        let accepted = self.state.queue.push(Box::pin(async move {
            process_callback(state, fields).await;
        }));
        if !accepted {
            debug!("wecom-app account stopping, message dropped");
        }
        WebhookResponse::ok("")
    }
}

/// Normalize, run the policy gate, and dispatch to the host.
pub(crate) async fn process_callback(
    state: Arc<AccountState>,
    fields: std::collections::HashMap<String, String>,
) {
    let Some(mut envelope) = normalize(&state, &fields).await else {
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
            "wecom-app message dropped by policy"
        );
        return;
    }
    if !qiao_host::finalize_inbound_context(&mut envelope) {
        return;
    }

    let deliverer = Arc::new(WecomAppDeliverer {
        state: Arc::clone(&state),
        to: envelope.peer_id.clone(),
    });
    state.sink.dispatch_envelope(envelope, deliverer).await;
}

/// Per-message reply deliverer. Without an edit-in-place surface only the
/// final block is worth a message; interim snapshots would duplicate it.
pub(crate) struct WecomAppDeliverer {
    pub state: Arc<AccountState>,
    pub to: String,
}

#[async_trait]
impl ReplyDeliverer for WecomAppDeliverer {
    async fn deliver(&self, kind: BlockKind, text: &str) -> Result<()> {
        match kind {
            BlockKind::Typing | BlockKind::Interim => Ok(()),
            BlockKind::Final => send_text_chunks(&self.state, &self.to, text).await,
        }
    }
}
