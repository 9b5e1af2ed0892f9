//! Stream SDK client: open a gateway connection, pump callback frames,
//! ack each message, reconnect with backoff until cancelled.

use std::{sync::Arc, time::Duration};

use {
    futures::{SinkExt, StreamExt},
    serde::Deserialize,
    serde_json::{Value, json},
    tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage},
    tracing::{debug, error, info, warn},
};

use qiao_channels::{Error as ChannelError, gating};

use crate::{
    normalize::normalize,
    outbound::{DingTalkCardDeliverer, DingTalkTextDeliverer},
    state::AccountState,
};

/// Robot message callback topic.
const TOPIC_BOT_MESSAGE: &str = "/v1.0/im/bot/messages/get";

#[derive(Debug, Deserialize)]
struct StreamFrame {
    #[serde(rename = "type")]
    frame_type: String,
    #[serde(default)]
    headers: Option<FrameHeaders>,
    #[serde(default)]
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FrameHeaders {
    #[serde(rename = "messageId")]
    #[serde(default)]
    message_id: Option<String>,
    #[serde(default)]
    topic: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConnectionEndpoint {
    endpoint: String,
    ticket: String,
}

/// Run the stream until the account is stopped. Reconnects with
/// exponential backoff on transport loss; the SDK contract owns retry.
pub async fn run_stream(state: Arc<AccountState>) {
    let mut backoff = Duration::from_secs(2);
    loop {
        tokio::select! {
            () = state.cancel.cancelled() => {
                info!(account_id = %state.account_id, "dingtalk stream cancelled");
                return;
            }
            result = run_session(&state) => {
                match result {
                    Ok(()) => {
                        info!(account_id = %state.account_id, "dingtalk stream closed");
                        backoff = Duration::from_secs(2);
                    },
                    Err(e) => {
                        error!(
                            account_id = %state.account_id,
                            error = %e,
                            backoff_secs = backoff.as_secs(),
                            "dingtalk stream error, reconnecting"
                        );
                        tokio::select! {
                            () = state.cancel.cancelled() => return,
                            () = tokio::time::sleep(backoff) => {}
                        }
                        backoff = (backoff * 2).min(Duration::from_secs(60));
                    },
                }
            }
        }
    }
}

/// Ask the gateway for a WebSocket endpoint for this app.
async fn open_connection(state: &AccountState) -> anyhow::Result<ConnectionEndpoint> {
    let request = json!({
        "clientId": state.api.client_id(),
        "clientSecret": secrecy::ExposeSecret::expose_secret(state.api.client_secret()),
        "subscriptions": [
            { "type": "CALLBACK", "topic": TOPIC_BOT_MESSAGE }
        ],
        "ua": "qiao/0.4",
    });
    let response = state
        .api
        .http()
        .post(format!("{}/v1.0/gateway/connections/open", state.api.base_url()))
        .json(&request)
        .send()
        .await?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("dingtalk connections/open failed: {status} {body}");
    }
    Ok(response.json().await?)
}

async fn run_session(state: &Arc<AccountState>) -> anyhow::Result<()> {
    let endpoint = open_connection(state).await?;
    let ws_url = format!("{}?ticket={}", endpoint.endpoint, endpoint.ticket);
    let (ws_stream, _) = connect_async(ws_url.as_str()).await?;
    info!(account_id = %state.account_id, "dingtalk stream connected");
    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            () = state.cancel.cancelled() => {
                let _ = write.send(WsMessage::Close(None)).await;
                return Ok(());
            }
            message = read.next() => {
                let Some(message) = message else {
                    return Err(ChannelError::transport_lost("dingtalk stream ended").into());
                };
                match message? {
                    WsMessage::Text(text) => {
                        handle_frame(state, &mut write, &text).await;
                    },
                    WsMessage::Ping(data) => {
                        let _ = write.send(WsMessage::Pong(data)).await;
                    },
                    WsMessage::Close(frame) => {
                        return Err(ChannelError::transport_lost(format!(
                            "dingtalk stream closed by server: {frame:?}"
                        ))
                        .into());
                    },
                    _ => {},
                }
            }
        }
    }
}

async fn handle_frame<S>(state: &Arc<AccountState>, write: &mut S, text: &str)
where
    S: SinkExt<WsMessage> + Unpin,
    <S as futures::Sink<WsMessage>>::Error: std::fmt::Display,
{
    let frame: StreamFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(error = %e, "dingtalk stream frame unparseable");
            return;
        },
    };
    let message_id = frame
        .headers
        .as_ref()
        .and_then(|h| h.message_id.clone())
        .unwrap_or_default();

    // every frame is acked, processed or not
    let ack = json!({
        "code": 200,
        "headers": { "messageId": message_id, "contentType": "application/json" },
        "message": "OK",
        "data": frame.data.clone().unwrap_or_default(),
    });
    if let Err(e) = write.send(WsMessage::Text(ack.to_string().into())).await {
        warn!(error = %e, "dingtalk stream ack failed");
    }

    match frame.frame_type.as_str() {
        "SYSTEM" => {
            debug!(account_id = %state.account_id, "dingtalk stream system frame");
        },
        "CALLBACK" => {
            let topic = frame.headers.as_ref().and_then(|h| h.topic.as_deref());
            if topic != Some(TOPIC_BOT_MESSAGE) {
                debug!(?topic, "dingtalk callback topic ignored");
                return;
            }
            let Some(data) = frame.data else { return };
            let payload: Value = match serde_json::from_str(&data) {
                Ok(value) => value,
                Err(e) => {
                    warn!(error = %e, "dingtalk callback data is not json");
                    return;
                },
            };
            let state = Arc::clone(state);
            let accepted = state.queue.push(Box::pin({
                let state = Arc::clone(&state);
                async move {
                    process_message(state, payload).await;
                }
            }));
            if !accepted {
                debug!("dingtalk account stopping, message dropped");
            }
        },
        other => {
            debug!(frame_type = other, "dingtalk frame type ignored");
        },
    }
}

/// Normalize, gate, and dispatch one robot message.
pub(crate) async fn process_message(state: Arc<AccountState>, payload: Value) {
    let Some((mut envelope, target)) = normalize(&state, &payload).await else {
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
            "dingtalk message dropped by policy"
        );
        return;
    }
    if !qiao_host::finalize_inbound_context(&mut envelope) {
        return;
    }

    let deliverer: Arc<dyn qiao_host::ReplyDeliverer> = if state.config.enable_ai_card {
        Arc::new(DingTalkCardDeliverer::new(Arc::clone(&state), target))
    } else {
        Arc::new(DingTalkTextDeliverer {
            state: Arc::clone(&state),
            target,
        })
    };
    state.sink.dispatch_envelope(envelope, deliverer).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_frame_parses_callback_shape() {
        let raw = r#"{
            "specVersion": "1.0",
            "type": "CALLBACK",
            "headers": { "messageId": "mid-1", "topic": "/v1.0/im/bot/messages/get" },
            "data": "{\"msgtype\":\"text\",\"text\":{\"content\":\"hi\"}}"
        }"#;
        let frame: StreamFrame = serde_json::from_str(raw).unwrap();
        assert_eq!(frame.frame_type, "CALLBACK");
        let headers = frame.headers.unwrap();
        assert_eq!(headers.message_id.as_deref(), Some("mid-1"));
        assert_eq!(headers.topic.as_deref(), Some(TOPIC_BOT_MESSAGE));
        let inner: Value = serde_json::from_str(&frame.data.unwrap()).unwrap();
        assert_eq!(inner["msgtype"], "text");
    }

    #[test]
    fn system_frames_parse_without_data() {
        let raw = r#"{ "type": "SYSTEM", "headers": { "topic": "ping" } }"#;
        let frame: StreamFrame = serde_json::from_str(raw).unwrap();
        assert_eq!(frame.frame_type, "SYSTEM");
        assert!(frame.data.is_none());
    }
}
