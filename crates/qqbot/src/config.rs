use {
    secrecy::Secret,
    serde::{Deserialize, Serialize},
};

use qiao_config::schema::CommonChannelConfig;

/// Tencent Flash ASR credentials (`asr` block).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AsrConfig {
    pub enabled: bool,
    #[serde(rename = "appId", alias = "app_id")]
    pub app_id: Option<String>,
    #[serde(rename = "secretId", alias = "secret_id")]
    pub secret_id: Option<String>,
    #[serde(
        rename = "secretKey",
        alias = "secret_key",
        serialize_with = "crate::config::serialize_opt_secret",
        deserialize_with = "crate::config::deserialize_opt_secret"
    )]
    pub secret_key: Option<Secret<String>>,
}

impl AsrConfig {
    /// Credentials complete enough to attempt a transcription.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        self.enabled
            && self.app_id.as_deref().is_some_and(|v| !v.trim().is_empty())
            && self
                .secret_id
                .as_deref()
                .is_some_and(|v| !v.trim().is_empty())
            && self.secret_key.is_some()
    }
}

/// Configuration for one QQ bot account.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QqBotConfig {
    #[serde(flatten)]
    pub common: CommonChannelConfig,

    #[serde(rename = "appId", alias = "app_id")]
    pub app_id: Option<String>,

    #[serde(
        rename = "clientSecret",
        alias = "client_secret",
        serialize_with = "crate::config::serialize_opt_secret",
        deserialize_with = "crate::config::deserialize_opt_secret"
    )]
    pub client_secret: Option<Secret<String>>,

    /// Markdown message templates require platform approval; plain text
    /// with degradation is the safe default.
    #[serde(rename = "markdownSupport", alias = "markdown_support")]
    pub markdown_support: bool,

    /// Webhook mount path; defaults to `/webhooks/qqbot/<accountId>`.
    #[serde(rename = "webhookPath", alias = "webhook_path")]
    pub webhook_path: Option<String>,

    pub asr: AsrConfig,
}

impl std::fmt::Debug for QqBotConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QqBotConfig")
            .field("app_id", &self.app_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "[REDACTED]"))
            .field("markdown_support", &self.markdown_support)
            .finish_non_exhaustive()
    }
}

impl QqBotConfig {
    #[must_use]
    pub fn webhook_path_for(&self, account_id: &str) -> String {
        self.webhook_path
            .clone()
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| format!("/webhooks/qqbot/{account_id}"))
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
    fn markdown_defaults_off() {
        let cfg = QqBotConfig::default();
        assert!(!cfg.markdown_support);
        assert!(!cfg.asr.enabled);
    }

    #[test]
    fn asr_usability_requires_all_credentials() {
        let mut asr: AsrConfig = serde_json::from_str(
            r#"{"enabled":true,"appId":"125","secretId":"sid","secretKey":"sk"}"#,
        )
        .unwrap();
        assert!(asr.is_usable());
        asr.secret_id = None;
        assert!(!asr.is_usable());
        asr.enabled = false;
        assert!(!asr.is_usable());
    }

    #[test]
    fn deserializes_channel_section() {
        let cfg: QqBotConfig = serde_json::from_str(
            r#"{
                "appId": "102001",
                "clientSecret": "cs",
                "markdownSupport": true,
                "asr": { "enabled": true, "appId": "125", "secretId": "sid", "secretKey": "sk" }
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.app_id.as_deref(), Some("102001"));
        assert!(cfg.markdown_support);
        assert!(cfg.asr.is_usable());
    }
}
