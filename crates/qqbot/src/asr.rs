//! Narrow transcription port backed by Tencent Flash ASR.

use std::time::Duration;

use {
    async_trait::async_trait,
    base64::Engine,
    hmac::{Hmac, Mac},
    secrecy::{ExposeSecret, Secret},
    serde_json::Value,
    sha1::Sha1,
    tracing::debug,
};

/// Hard budget for one transcription call.
pub const ASR_TIMEOUT_SECS: u64 = 30;

const ASR_HOST: &str = "asr.cloud.tencent.com";

/// Speech-to-text port. One method, because the gateway needs exactly one
/// thing: text for a voice body.
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe raw audio; `format` is a short name like `amr`, `mp3`.
    async fn transcribe(&self, audio: &[u8], format: &str) -> anyhow::Result<String>;
}

/// Tencent Flash recognition (`asr/flash/v1`).
pub struct TencentFlashAsr {
    http: reqwest::Client,
    app_id: String,
    secret_id: String,
    secret_key: Secret<String>,
    base_host: String,
}

impl TencentFlashAsr {
    pub fn new(
        app_id: impl Into<String>,
        secret_id: impl Into<String>,
        secret_key: Secret<String>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(ASR_TIMEOUT_SECS))
                .build()?,
            app_id: app_id.into(),
            secret_id: secret_id.into(),
            secret_key,
            base_host: ASR_HOST.to_string(),
        })
    }

    /// Point at a different host (tests).
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.base_host = host.into();
        self
    }

    /// Sorted query string, signed below.
    fn query_string(&self, format: &str, timestamp: u64, nonce: u32) -> String {
        let expired = timestamp + 600;
        let mut params = vec![
            ("engine_type".to_string(), "16k_zh".to_string()),
            ("expired".to_string(), expired.to_string()),
            ("nonce".to_string(), nonce.to_string()),
            ("secretid".to_string(), self.secret_id.clone()),
            ("timestamp".to_string(), timestamp.to_string()),
            ("voice_format".to_string(), format.to_string()),
        ];
        params.sort();
        params
            .into_iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// `Authorization: base64(hmac_sha1("POST" + host + path + "?" + query))`.
    fn authorization(&self, query: &str) -> String {
        let sign_str = format!(
            "POST{}/asr/flash/v1/{}?{query}",
            self.base_host, self.app_id
        );
        let mut mac = Hmac::<Sha1>::new_from_slice(self.secret_key.expose_secret().as_bytes())
            .expect("hmac accepts any key length");
        mac.update(sign_str.as_bytes());
        base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
    }
}

#[async_trait]
impl Transcriber for TencentFlashAsr {
    async fn transcribe(&self, audio: &[u8], format: &str) -> anyhow::Result<String> {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let nonce: u32 = rand::random();
        let query = self.query_string(format, timestamp, nonce);
        let authorization = self.authorization(&query);
        let url = format!("https://{}/asr/flash/v1/{}?{query}", self.base_host, self.app_id);

        let response = self
            .http
            .post(url)
            .header("Authorization", authorization)
            .header("Content-Type", "application/octet-stream")
            .body(audio.to_vec())
            .send()
            .await?;
        if !response.status().is_success() {
            anyhow::bail!("flash asr http status {}", response.status());
        }
        let body: Value = response.json().await?;
        let code = body.get("code").and_then(Value::as_i64).unwrap_or(-1);
        if code != 0 {
            let message = body
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            anyhow::bail!("flash asr code {code}: {message}");
        }

        let text = body
            .get("flash_result")
            .and_then(Value::as_array)
            .map(|results| {
                results
                    .iter()
                    .filter_map(|r| r.get("text").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default();
        debug!(chars = text.chars().count(), "flash asr transcription done");
        if text.trim().is_empty() {
            anyhow::bail!("flash asr returned no text");
        }
        Ok(text)
    }
}
