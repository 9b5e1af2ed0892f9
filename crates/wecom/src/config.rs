use {
    secrecy::Secret,
    serde::{Deserialize, Serialize},
};

use qiao_config::schema::CommonChannelConfig;

/// Configuration for one WeCom AI-robot account.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WecomConfig {
    #[serde(flatten)]
    pub common: CommonChannelConfig,

    /// Callback verification token.
    pub token: Option<String>,

    #[serde(
        rename = "encodingAESKey",
        alias = "encoding_aes_key",
        serialize_with = "crate::config::serialize_opt_secret",
        deserialize_with = "crate::config::deserialize_opt_secret"
    )]
    pub encoding_aes_key: Option<Secret<String>>,

    /// Expected receive id in decrypted payload trailers. AI robots leave
    /// this empty; self-hosted proxies may pin it.
    #[serde(rename = "receiveId", alias = "receive_id")]
    pub receive_id: Option<String>,

    /// Webhook mount path; defaults to `/webhooks/wecom/<accountId>`.
    #[serde(rename = "webhookPath", alias = "webhook_path")]
    pub webhook_path: Option<String>,

    /// Group-robot webhook URL for host-initiated sends and as the
    /// fallback when no `response_url` is cached.
    #[serde(rename = "robotWebhookUrl", alias = "robot_webhook_url")]
    pub robot_webhook_url: Option<String>,

    /// Cached `response_url`s kept per peer.
    #[serde(rename = "responseUrlCachePerPeer", alias = "response_url_cache_per_peer")]
    pub response_url_cache_per_peer: Option<usize>,
}

impl std::fmt::Debug for WecomConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WecomConfig")
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("webhook_path", &self.webhook_path)
            .field("robot_webhook_url", &self.robot_webhook_url)
            .finish_non_exhaustive()
    }
}

impl WecomConfig {
    #[must_use]
    pub fn webhook_path_for(&self, account_id: &str) -> String {
        self.webhook_path
            .clone()
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| format!("/webhooks/wecom/{account_id}"))
    }

    #[must_use]
    pub fn response_url_cache_per_peer(&self) -> usize {
        self.response_url_cache_per_peer.unwrap_or(3).max(1)
    }
}

pub(crate) fn serialize_opt_secret<S: serde::Serializer>(
    secret: &Option<Secret<String>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    use secrecy::ExposeSecret;
    match secret {
        Some(secret) => serializer.serialize_some(secret.expose_secret()),
        None => serializer.serialize_none(),
    }
}

pub(crate) fn deserialize_opt_secret<'de, D: serde::Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Secret<String>>, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?
        .filter(|s| !s.trim().is_empty())
        .map(Secret::new))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_and_paths() {
        let cfg = WecomConfig::default();
        assert_eq!(cfg.webhook_path_for("default"), "/webhooks/wecom/default");
        assert_eq!(cfg.response_url_cache_per_peer(), 3);
        assert!(cfg.receive_id.is_none());
    }

    #[test]
    fn deserializes_channel_section() {
        let cfg: WecomConfig = serde_json::from_str(
            r#"{
                "token": "t",
                "encodingAESKey": "k",
                "webhookPath": "/hooks/wecom",
                "robotWebhookUrl": "https://qyapi.weixin.qq.com/cgi-bin/webhook/send?key=abc",
                "requireMention": false
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.webhook_path_for("x"), "/hooks/wecom");
        assert!(cfg.robot_webhook_url.is_some());
        assert!(!cfg.common.require_mention);
        let debug = format!("{cfg:?}");
        assert!(!debug.contains("\"t\""));
    }
}
