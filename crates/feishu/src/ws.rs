//! Long-connection client: endpoint negotiation, protobuf frame pump,
//! server-tuned ping interval, fragment reassembly, event ACKs, and the
//! url-verification handshake.

use std::{sync::Arc, time::Duration};

use {
    futures::{SinkExt, StreamExt},
    secrecy::ExposeSecret,
    serde::Deserialize,
    serde_json::{Value, json},
    tokio::time::{Instant, MissedTickBehavior, interval},
    tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage},
    tracing::{debug, error, info, warn},
};

use qiao_channels::{Error as ChannelError, gating};

use crate::{
    crypto::decrypt_event,
    frame::{
        self, HEADER_BIZ_RT, HEADER_MESSAGE_ID, HEADER_SEQ, HEADER_SUM, HEADER_TYPE,
        METHOD_CONTROL, METHOD_DATA, PayloadAssembler, TYPE_EVENT, TYPE_PING, TYPE_PONG, WsFrame,
    },
    normalize::{EVENT_MESSAGE_RECEIVE, normalize},
    outbound::FeishuDeliverer,
    state::AccountState,
};

const DEFAULT_PING_INTERVAL_SECS: u64 = 120;

#[derive(Debug, Deserialize, Default)]
struct ClientConfigPayload {
    #[serde(default, rename = "PingInterval")]
    ping_interval: Option<i64>,
}

#[derive(Debug, Deserialize, Default)]
struct EndpointPayload {
    #[serde(default, rename = "URL")]
    url: Option<String>,
    #[serde(default, rename = "ClientConfig")]
    client_config: Option<ClientConfigPayload>,
}

#[derive(Debug, Deserialize)]
struct EndpointResponse {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    data: Option<EndpointPayload>,
}

struct Endpoint {
    url: String,
    service_id: i32,
    ping_interval: Duration,
}

/// Run the long connection until the account is stopped.
pub async fn run_long_connection(state: Arc<AccountState>) {
    let mut backoff = Duration::from_secs(2);
    loop {
        tokio::select! {
            () = state.cancel.cancelled() => {
                info!(account_id = %state.account_id, "feishu long connection cancelled");
                return;
            }
            result = run_session(&state) => {
                match result {
                    Ok(()) => backoff = Duration::from_secs(2),
                    Err(e) => {
                        error!(
                            account_id = %state.account_id,
                            error = %e,
                            backoff_secs = backoff.as_secs(),
                            "feishu long connection error, reconnecting"
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

async fn fetch_endpoint(state: &AccountState) -> anyhow::Result<Endpoint> {
    let response = state
        .api
        .http()
        .post(format!("{}/callback/ws/endpoint", state.api.base_url()))
        .header("locale", "zh")
        .json(&json!({
            "AppID": state.api.app_id(),
            "AppSecret": state.api.app_secret().expose_secret(),
        }))
        .send()
        .await?;
    if !response.status().is_success() {
        let status = response.status();
        anyhow::bail!("feishu ws endpoint failed: {status}");
    }
    let payload: EndpointResponse = response.json().await?;
    if payload.code != 0 {
        anyhow::bail!(
            "feishu ws endpoint failed: {}",
            payload.msg.as_deref().unwrap_or("unknown")
        );
    }

    let data = payload
        .data
        .ok_or_else(|| anyhow::anyhow!("feishu ws endpoint missing data"))?;
    let url = data
        .url
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .ok_or_else(|| anyhow::anyhow!("feishu ws endpoint missing url"))?
        .to_string();
    let service_id = parse_service_id(&url)?;
    let ping_secs = data
        .client_config
        .unwrap_or_default()
        .ping_interval
        .filter(|v| *v > 0)
        .map(|v| v as u64)
        .unwrap_or(DEFAULT_PING_INTERVAL_SECS);

    Ok(Endpoint {
        url,
        service_id,
        ping_interval: Duration::from_secs(ping_secs),
    })
}

fn parse_service_id(url: &str) -> anyhow::Result<i32> {
    let query = url.split_once('?').map(|(_, q)| q).unwrap_or("");
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix("service_id="))
        .and_then(|v| v.parse::<i32>().ok())
        .ok_or_else(|| anyhow::anyhow!("feishu ws url carries no service_id"))
}

async fn run_session(state: &Arc<AccountState>) -> anyhow::Result<()> {
    let endpoint = fetch_endpoint(state).await?;
    let (ws_stream, _) = connect_async(endpoint.url.as_str()).await?;
    info!(account_id = %state.account_id, "feishu long connection established");
    let (mut write, mut read) = ws_stream.split();

    let mut assembler = PayloadAssembler::default();
    let mut ping_interval = endpoint.ping_interval;
    let mut ticker = interval(ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = state.cancel.cancelled() => {
                let _ = write.send(WsMessage::Close(None)).await;
                return Ok(());
            }
            _ = ticker.tick() => {
                let ping = frame::ping_frame(endpoint.service_id);
                write
                    .send(WsMessage::Binary(ping.encode_to_bytes()))
                    .await
                    .map_err(|e| anyhow::anyhow!("feishu ping failed: {e}"))?;
            }
            incoming = read.next() => {
                let Some(incoming) = incoming else {
                    return Err(ChannelError::transport_lost("feishu long connection closed").into());
                };
                match incoming? {
                    WsMessage::Binary(buffer) => {
                        if let Some(new_interval) = handle_binary_frame(
                            state,
                            &mut write,
                            &mut assembler,
                            &buffer,
                        )
                        .await?
                            && new_interval != ping_interval
                        {
                            ping_interval = new_interval;
                            ticker = interval(ping_interval);
                            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                        }
                    },
                    WsMessage::Ping(payload) => {
                        let _ = write.send(WsMessage::Pong(payload)).await;
                    },
                    WsMessage::Close(reason) => {
                        return Err(ChannelError::transport_lost(format!(
                            "feishu long connection closed by server: {reason:?}"
                        ))
                        .into());
                    },
                    _ => {},
                }
            }
        }
    }
}

/// Handle one protobuf frame. Returns a new ping interval when the pong
/// carried one.
async fn handle_binary_frame<S>(
    state: &Arc<AccountState>,
    write: &mut S,
    assembler: &mut PayloadAssembler,
    buffer: &[u8],
) -> anyhow::Result<Option<Duration>>
where
    S: SinkExt<WsMessage> + Unpin,
    <S as futures::Sink<WsMessage>>::Error: std::fmt::Display,
{
    let mut frame = match WsFrame::decode_from(buffer) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(error = %e, "feishu frame undecodable");
            return Ok(None);
        },
    };

    if frame.method == METHOD_CONTROL {
        let control_type = frame
            .header(HEADER_TYPE)
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        if control_type == TYPE_PONG {
            let interval = serde_json::from_slice::<ClientConfigPayload>(&frame.payload)
                .ok()
                .and_then(|c| c.ping_interval)
                .filter(|v| *v > 0)
                .map(|v| Duration::from_secs(v as u64));
            return Ok(interval);
        }
        return Ok(None);
    }
    if frame.method != METHOD_DATA {
        return Ok(None);
    }

    let message_type = frame
        .header(HEADER_TYPE)
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    if message_type == TYPE_PING || message_type != TYPE_EVENT {
        return Ok(None);
    }

    let sum = frame.header_usize(HEADER_SUM).unwrap_or(1);
    let seq = frame.header_usize(HEADER_SEQ).unwrap_or(0);
    let message_id = frame.header(HEADER_MESSAGE_ID).unwrap_or("").to_string();
    let Some(payload) = assembler.merge(&message_id, sum, seq, std::mem::take(&mut frame.payload))
    else {
        return Ok(None);
    };

    let started = Instant::now();
    let (status, reply) = match serde_json::from_slice::<Value>(&payload) {
        Ok(event) => handle_event(state, event).await,
        Err(e) => {
            warn!(error = %e, message_id, "feishu event payload invalid json");
            (400, None)
        },
    };

    frame.set_header(HEADER_BIZ_RT, started.elapsed().as_millis().to_string());
    frame.payload = match reply {
        Some(body) => serde_json::to_vec(&body)?,
        None => serde_json::to_vec(&json!({ "code": status }))?,
    };
    write
        .send(WsMessage::Binary(frame.encode_to_bytes()))
        .await
        .map_err(|e| anyhow::anyhow!("feishu event ack failed: {e}"))?;
    Ok(None)
}

/// Decrypt, recognize handshakes, and dispatch message events.
/// Returns `(status, optional ack body)`.
async fn handle_event(state: &Arc<AccountState>, event: Value) -> (u16, Option<Value>) {
    let event = match event.get("encrypt").and_then(Value::as_str) {
        Some(encrypt) => {
            let Some(key) = state.config.encrypt_key.as_ref() else {
                warn!("feishu encrypted event without encryptKey configured");
                return (400, None);
            };
            match decrypt_event(encrypt, key.expose_secret())
                .ok()
                .and_then(|plain| serde_json::from_str::<Value>(&plain).ok())
            {
                Some(decrypted) => decrypted,
                None => {
                    warn!("feishu event decrypt failed");
                    return (400, None);
                },
            }
        },
        None => event,
    };

    // url_verification handshake echoes the challenge
    if let Some(challenge) = event.get("challenge").and_then(Value::as_str) {
        debug!("feishu url_verification challenge answered");
        return (200, Some(json!({ "challenge": challenge })));
    }

    let event_type = event
        .pointer("/header/event_type")
        .and_then(Value::as_str)
        .unwrap_or("");
    if event_type != EVENT_MESSAGE_RECEIVE {
        debug!(event_type, "feishu event ignored");
        return (200, None);
    }
    let Some(inner) = event.get("event").cloned() else {
        return (200, None);
    };

    let state = Arc::clone(state);
    let accepted = state.queue.push(Box::pin({
        let state = Arc::clone(&state);
        async move {
            process_event(state, inner).await;
        }
    }));
    if !accepted {
        debug!("feishu account stopping, event dropped");
    }
    (200, None)
}

pub(crate) async fn process_event(state: Arc<AccountState>, event: Value) {
    let Some(mut envelope) = normalize(&state, &event).await else {
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
            "feishu message dropped by policy"
        );
        return;
    }
    if !qiao_host::finalize_inbound_context(&mut envelope) {
        return;
    }

    let deliverer = Arc::new(FeishuDeliverer::for_envelope(Arc::clone(&state), &envelope));
    state.sink.dispatch_envelope(envelope, deliverer).await;
}

#[cfg(test)]
mod tests {
    use {
        async_trait::async_trait,
        qiao_channels::{InboundSink, gating::Policy},
        qiao_common::InboundEnvelope,
        qiao_host::ReplyDeliverer,
        qiao_media::{Downloader, MediaArchive},
        secrecy::Secret,
        tokio_util::sync::CancellationToken,
    };

    use {
        super::*,
        crate::{config::FeishuConfig, token::FeishuApi},
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

    fn state(dir: &std::path::Path, config: FeishuConfig) -> Arc<AccountState> {
        Arc::new(AccountState {
            account_id: "default".into(),
            policy: Policy::standard(),
            config,
            api: Arc::new(
                FeishuApi::new("http://127.0.0.1:1", "app", Secret::new("s".into())).unwrap(),
            ),
            downloader: Arc::new(Downloader::new(dir.join("tmp")).unwrap()),
            archive: Arc::new(MediaArchive::new(dir.join("tmp"), dir.join("media"), 7).unwrap()),
            sink: Arc::new(NullSink),
            cancel: CancellationToken::new(),
            queue: qiao_channels::SerialQueue::new(CancellationToken::new()),
        })
    }

    #[test]
    fn service_id_comes_from_the_url_query() {
        assert_eq!(
            parse_service_id("wss://msg.feishu.cn/ws?service_id=42&x=1").unwrap(),
            42
        );
        assert!(parse_service_id("wss://msg.feishu.cn/ws").is_err());
    }

    #[tokio::test]
    async fn url_verification_challenge_is_echoed() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path(), FeishuConfig::default());
        let (status, reply) = handle_event(
            &state,
            json!({ "challenge": "c-17", "type": "url_verification" }),
        )
        .await;
        assert_eq!(status, 200);
        assert_eq!(reply.unwrap()["challenge"], "c-17");
    }

    #[tokio::test]
    async fn encrypted_events_without_a_key_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path(), FeishuConfig::default());
        let (status, reply) = handle_event(&state, json!({ "encrypt": "AAAA" })).await;
        assert_eq!(status, 400);
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn unrelated_events_are_acked_and_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path(), FeishuConfig::default());
        let (status, reply) = handle_event(
            &state,
            json!({ "header": { "event_type": "im.chat.updated_v1" }, "event": {} }),
        )
        .await;
        assert_eq!(status, 200);
        assert!(reply.is_none());
    }
}
