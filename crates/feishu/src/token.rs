//! Tenant access-token cache and the small authenticated REST surface.

use std::time::{Duration, Instant};

use {
    secrecy::{ExposeSecret, Secret},
    serde_json::{Value, json},
    tokio::sync::Mutex,
    tracing::info,
};

const SAFETY_MARGIN_SECS: u64 = 300;
const FALLBACK_TTL_SECS: u64 = 7200;

struct CachedToken {
    token: Secret<String>,
    expires_at: Instant,
}

/// One app's authenticated API access.
pub struct FeishuApi {
    http: reqwest::Client,
    base_url: String,
    app_id: String,
    app_secret: Secret<String>,
    token: Mutex<Option<CachedToken>>,
}

impl FeishuApi {
    pub fn new(
        base_url: impl Into<String>,
        app_id: impl Into<String>,
        app_secret: Secret<String>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(qiao_media::METADATA_TIMEOUT_SECS))
                .build()?,
            base_url: base_url.into(),
            app_id: app_id.into(),
            app_secret,
            token: Mutex::new(None),
        })
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
    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    #[must_use]
    pub fn app_secret(&self) -> &Secret<String> {
        &self.app_secret
    }

    /// Cached tenant access token, refreshed 5 minutes before expiry.
    pub async fn tenant_access_token(&self) -> anyhow::Result<String> {
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
            .post(format!(
                "{}/open-apis/auth/v3/tenant_access_token/internal",
                self.base_url
            ))
            .json(&json!({
                "app_id": self.app_id,
                "app_secret": self.app_secret.expose_secret(),
            }))
            .send()
            .await?;
        let body: Value = response.json().await?;
        let code = body.get("code").and_then(Value::as_i64).unwrap_or(-1);
        if code != 0 {
            let msg = body.get("msg").and_then(Value::as_str).unwrap_or("unknown");
            anyhow::bail!("feishu tenant_access_token failed (code {code}): {msg}");
        }
        let token = body
            .get("tenant_access_token")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| anyhow::anyhow!("tenant_access_token missing from response"))?
            .to_string();
        let ttl = body
            .get("expire")
            .and_then(Value::as_u64)
            .unwrap_or(FALLBACK_TTL_SECS)
            .saturating_sub(SAFETY_MARGIN_SECS)
            .max(60);

        info!(ttl_secs = ttl, "feishu tenant token refreshed");
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

    /// Authenticated POST returning the checked JSON body.
    pub async fn post_json(&self, path_and_query: &str, body: &Value) -> anyhow::Result<Value> {
        let token = self.tenant_access_token().await?;
        let response = self
            .http
            .post(format!("{}{path_and_query}", self.base_url))
            .bearer_auth(token)
            .json(body)
            .send()
            .await?;
        let value: Value = response.json().await?;
        let code = value.get("code").and_then(Value::as_i64).unwrap_or(-1);
        if code != 0 {
            let msg = value.get("msg").and_then(Value::as_str).unwrap_or("unknown");
            anyhow::bail!("feishu {path_and_query} failed (code {code}): {msg}");
        }
        Ok(value)
    }

    /// Message resource download URL (images, files, audio).
    pub fn message_resource_url(&self, message_id: &str, file_key: &str, kind: &str) -> String {
        format!(
            "{}/open-apis/im/v1/messages/{message_id}/resources/{file_key}?type={kind}",
            self.base_url
        )
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
    async fn cached_token_short_circuits_the_network() {
        let api = FeishuApi::new("http://127.0.0.1:1", "app", Secret::new("s".into())).unwrap();
        api.insert_token_for_test("tok").await;
        assert_eq!(api.tenant_access_token().await.unwrap(), "tok");
        api.invalidate_token().await;
        assert!(api.tenant_access_token().await.is_err());
    }

    #[test]
    fn resource_urls_carry_type() {
        let api = FeishuApi::new("https://open.feishu.cn", "app", Secret::new("s".into())).unwrap();
        assert_eq!(
            api.message_resource_url("om_1", "fk_2", "image"),
            "https://open.feishu.cn/open-apis/im/v1/messages/om_1/resources/fk_2?type=image"
        );
    }
}
