//! v1.0 API client: access-token cache plus the small set of REST calls
//! the channel needs (stream gateway, media download, robot sends, cards).

use std::time::{Duration, Instant};

use {
    secrecy::{ExposeSecret, Secret},
    serde_json::{Value, json},
    tokio::sync::Mutex,
    tracing::info,
};

use crate::API_BASE;

const SAFETY_MARGIN_SECS: u64 = 300;
const FALLBACK_TTL_SECS: u64 = 7200;

struct CachedToken {
    token: Secret<String>,
    expires_at: Instant,
}

/// One robot app's authenticated API access.
pub struct DingTalkApi {
    http: reqwest::Client,
    base_url: String,
    client_id: String,
    client_secret: Secret<String>,
    token: Mutex<Option<CachedToken>>,
}

impl DingTalkApi {
    pub fn new(client_id: impl Into<String>, client_secret: Secret<String>) -> anyhow::Result<Self> {
        Ok(Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(qiao_media::METADATA_TIMEOUT_SECS))
                .build()?,
            base_url: API_BASE.to_string(),
            client_id: client_id.into(),
            client_secret,
            token: Mutex::new(None),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    #[must_use]
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    #[must_use]
    pub fn client_secret(&self) -> &Secret<String> {
        &self.client_secret
    }

    /// Cached `oauth2/accessToken`, refreshed 5 minutes before expiry.
    pub async fn access_token(&self) -> anyhow::Result<String> {
        {
            let token = self.token.lock().await;
            if let Some(cached) = token.as_ref()
                && cached.expires_at > Instant::now()
            {
                return Ok(cached.token.expose_secret().clone());
            }
        }

        let response = self
            .http
            .post(format!("{}/v1.0/oauth2/accessToken", self.base_url))
            .json(&json!({
                "appKey": self.client_id,
                "appSecret": self.client_secret.expose_secret(),
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("dingtalk accessToken failed: {status} {body}");
        }
        let body: Value = response.json().await?;
        let token = body
            .get("accessToken")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| anyhow::anyhow!("accessToken response missing token"))?
            .to_string();
        let ttl = body
            .get("expireIn")
            .and_then(Value::as_u64)
            .unwrap_or(FALLBACK_TTL_SECS)
            .saturating_sub(SAFETY_MARGIN_SECS)
            .max(60);

        info!(ttl_secs = ttl, "dingtalk access token refreshed");
        let mut slot = self.token.lock().await;
        *slot = Some(CachedToken {
            token: Secret::new(token.clone()),
            expires_at: Instant::now() + Duration::from_secs(ttl),
        });
        Ok(token)
    }

    pub async fn invalidate_token(&self) {
        let mut slot = self.token.lock().await;
        *slot = None;
    }

    /// Authenticated POST to a v1.0 path, returning the JSON body.
    pub async fn post_json(&self, path: &str, body: &Value) -> anyhow::Result<Value> {
        let token = self.access_token().await?;
        let response = self
            .http
            .post(format!("{}{path}", self.base_url))
            .header("x-acs-dingtalk-access-token", token)
            .json(body)
            .send()
            .await?;
        let status = response.status();
        let value: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            anyhow::bail!("dingtalk {path} failed ({status}): {value}");
        }
        Ok(value)
    }

    /// Authenticated PUT to a v1.0 path.
    pub async fn put_json(&self, path: &str, body: &Value) -> anyhow::Result<Value> {
        let token = self.access_token().await?;
        let response = self
            .http
            .put(format!("{}{path}", self.base_url))
            .header("x-acs-dingtalk-access-token", token)
            .json(body)
            .send()
            .await?;
        let status = response.status();
        let value: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            anyhow::bail!("dingtalk {path} failed ({status}): {value}");
        }
        Ok(value)
    }

    /// Resolve a robot message `downloadCode` to a temporary URL.
    pub async fn message_file_url(
        &self,
        download_code: &str,
        robot_code: &str,
    ) -> anyhow::Result<String> {
        let body = json!({ "downloadCode": download_code, "robotCode": robot_code });
        let value = self
            .post_json("/v1.0/robot/messageFiles/download", &body)
            .await?;
        value
            .get("downloadUrl")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("messageFiles/download returned no downloadUrl"))
    }

    #[cfg(test)]
    pub(crate) async fn insert_token_for_test(&self, token: &str) {
        let mut slot = self.token.lock().await;
        *slot = Some(CachedToken {
            token: Secret::new(token.to_string()),
            expires_at: Instant::now() + Duration::from_secs(60),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cached_token_is_reused() {
        let api = DingTalkApi::new("key", Secret::new("secret".into()))
            .unwrap()
            .with_base_url("http://127.0.0.1:1");
        api.insert_token_for_test("cached").await;
        assert_eq!(api.access_token().await.unwrap(), "cached");

        api.invalidate_token().await;
        assert!(api.access_token().await.is_err());
    }
}
