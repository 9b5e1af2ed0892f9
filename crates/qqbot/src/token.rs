//! App access-token cache for `bots.qq.com`.

use std::time::{Duration, Instant};

use {
    secrecy::{ExposeSecret, Secret},
    serde_json::{Value, json},
    tokio::sync::Mutex,
    tracing::info,
};

use crate::TOKEN_URL;

const SAFETY_MARGIN_SECS: u64 = 300;
const FALLBACK_TTL_SECS: u64 = 7200;

struct CachedToken {
    token: Secret<String>,
    expires_at: Instant,
}

/// Single-app token cache; one per account.
#[derive(Default)]
pub struct AppTokenCache {
    entry: Mutex<Option<CachedToken>>,
}

impl AppTokenCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn access_token(
        &self,
        http: &reqwest::Client,
        token_url: Option<&str>,
        app_id: &str,
        client_secret: &Secret<String>,
    ) -> anyhow::Result<String> {
        {
            let entry = self.entry.lock().await;
            if let Some(cached) = entry.as_ref()
                && cached.expires_at > Instant::now()
            {
                return Ok(cached.token.expose_secret().clone());
            }
        }

        let response = http
            .post(token_url.unwrap_or(TOKEN_URL))
            .json(&json!({
                "appId": app_id,
                "clientSecret": client_secret.expose_secret(),
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("qqbot token request failed: {status} {body}");
        }
        let body: Value = response.json().await?;
        let token = body
            .get("access_token")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| anyhow::anyhow!("qqbot token response missing access_token"))?
            .to_string();
        // expires_in arrives as a string
        let ttl = body
            .get("expires_in")
            .and_then(|v| {
                v.as_u64()
                    .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
            })
            .unwrap_or(FALLBACK_TTL_SECS)
            .saturating_sub(SAFETY_MARGIN_SECS)
            .max(60);

        info!(ttl_secs = ttl, "qqbot access token refreshed");
        let mut entry = self.entry.lock().await;
        *entry = Some(CachedToken {
            token: Secret::new(token.clone()),
            expires_at: Instant::now() + Duration::from_secs(ttl),
        });
        Ok(token)
    }

    /// Evict after the platform rejected the token.
    pub async fn invalidate(&self) {
        let mut entry = self.entry.lock().await;
        *entry = None;
    }

    #[cfg(test)]
    pub(crate) async fn insert_for_test(&self, token: &str, ttl: Duration) {
        let mut entry = self.entry.lock().await;
        *entry = Some(CachedToken {
            token: Secret::new(token.to_string()),
            expires_at: Instant::now() + ttl,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cached_token_is_served_until_expiry() {
        let cache = AppTokenCache::new();
        cache.insert_for_test("tok", Duration::from_secs(60)).await;
        let http = reqwest::Client::new();
        let secret = Secret::new("s".to_string());
        let token = cache
            .access_token(&http, Some("http://127.0.0.1:1"), "app", &secret)
            .await
            .unwrap();
        assert_eq!(token, "tok");

        cache.invalidate().await;
        assert!(
            cache
                .access_token(&http, Some("http://127.0.0.1:1"), "app", &secret)
                .await
                .is_err()
        );
    }
}
