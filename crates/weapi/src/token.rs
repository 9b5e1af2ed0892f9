//! Corp access-token cache with expiry margin and forced invalidation.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use {
    secrecy::{ExposeSecret, Secret},
    serde::Deserialize,
    tokio::sync::Mutex,
    tracing::{debug, info},
};

use qiao_channels::{Error, Result};

use crate::API_BASE;

/// Refresh this long before the platform expiry.
pub const TOKEN_SAFETY_MARGIN_SECS: u64 = 300;

const FALLBACK_TTL_SECS: u64 = 7200;

/// Platform error codes that mean the cached token is dead.
#[must_use]
pub fn is_token_errcode(code: i64) -> bool {
    matches!(code, 40001 | 40014 | 42001)
}

#[derive(Clone)]
struct CachedToken {
    token: Secret<String>,
    expires_at: Instant,
}

impl CachedToken {
    fn is_valid(&self) -> bool {
        self.expires_at > Instant::now()
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    errcode: i64,
    errmsg: String,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Process-wide access-token cache, keyed by `(corp_id, agent_id)`.
///
/// Concurrent fetches for the same key may race; last-writer-wins is fine
/// because the platform returns equivalent tokens within a short window.
#[derive(Default)]
pub struct TokenCache {
    entries: Mutex<HashMap<String, CachedToken>>,
}

impl TokenCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache key for one credentialed app.
    #[must_use]
    pub fn key(corp_id: &str, agent_id: Option<i64>) -> String {
        match agent_id {
            Some(agent_id) => format!("{corp_id}:{agent_id}"),
            None => format!("{corp_id}:default"),
        }
    }

    /// The cached token, or a fresh one from `gettoken`.
    ///
    /// The stored expiry is `expires_in − safety margin`; an entry past
    /// that point is never returned.
    pub async fn access_token(
        &self,
        http: &reqwest::Client,
        base_url: &str,
        key: &str,
        corp_id: &str,
        corp_secret: &Secret<String>,
    ) -> Result<String> {
        {
            let entries = self.entries.lock().await;
            if let Some(cached) = entries.get(key)
                && cached.is_valid()
            {
                return Ok(cached.token.expose_secret().clone());
            }
        }

        let base = if base_url.is_empty() { API_BASE } else { base_url };
        let response = http
            .get(format!("{base}/cgi-bin/gettoken"))
            .query(&[
                ("corpid", corp_id),
                ("corpsecret", corp_secret.expose_secret().as_str()),
            ])
            .send()
            .await
            .map_err(|e| Error::external("wecom gettoken", e))?;
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::external("wecom gettoken response", e))?;

        if body.errcode != 0 {
            return Err(Error::External {
                context: "wecom gettoken".into(),
                source: format!("errcode {}: {}", body.errcode, body.errmsg).into(),
            });
        }
        let token = body
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::config_invalid("gettoken returned no access_token"))?;
        let ttl = body
            .expires_in
            .unwrap_or(FALLBACK_TTL_SECS)
            .saturating_sub(TOKEN_SAFETY_MARGIN_SECS)
            .max(60);

        info!(key, ttl_secs = ttl, "wecom access token refreshed");
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            CachedToken {
                token: Secret::new(token.clone()),
                expires_at: Instant::now() + Duration::from_secs(ttl),
            },
        );
        Ok(token)
    }

    /// Drop a cached entry after the platform reported it invalid.
    pub async fn invalidate(&self, key: &str) {
        let mut entries = self.entries.lock().await;
        if entries.remove(key).is_some() {
            debug!(key, "wecom access token invalidated");
        }
    }

    #[cfg(test)]
    pub(crate) async fn insert_for_test(&self, key: &str, token: &str, ttl: Duration) {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            CachedToken {
                token: Secret::new(token.to_string()),
                expires_at: Instant::now() + ttl,
            },
        );
    }
}
