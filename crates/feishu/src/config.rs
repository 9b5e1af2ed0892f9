use {
    secrecy::Secret,
    serde::{Deserialize, Serialize},
};

use qiao_config::schema::CommonChannelConfig;

/// Configuration for one Feishu app account.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FeishuConfig {
    #[serde(flatten)]
    pub common: CommonChannelConfig,

    #[serde(rename = "appId", alias = "app_id")]
    pub app_id: Option<String>,

    #[serde(
        rename = "appSecret",
        alias = "app_secret",
        serialize_with = "crate::config::serialize_opt_secret",
        deserialize_with = "crate::config::deserialize_opt_secret"
    )]
    pub app_secret: Option<Secret<String>>,

    /// Event encryption key, when configured in the developer console.
    #[serde(
        rename = "encryptKey",
        alias = "encrypt_key",
        serialize_with = "crate::config::serialize_opt_secret",
        deserialize_with = "crate::config::deserialize_opt_secret"
    )]
    pub encrypt_key: Option<Secret<String>>,

    /// Render markdown replies as interactive cards instead of raw text.
    #[serde(rename = "sendMarkdownAsCard", alias = "send_markdown_as_card")]
    pub send_markdown_as_card: bool,

    /// Alternate API origin (private deployments).
    pub domain: Option<String>,
}

impl std::fmt::Debug for FeishuConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeishuConfig")
            .field("app_id", &self.app_id)
            .field("app_secret", &self.app_secret.as_ref().map(|_| "[REDACTED]"))
            .field("send_markdown_as_card", &self.send_markdown_as_card)
            .finish_non_exhaustive()
    }
}

impl FeishuConfig {
    #[must_use]
    pub fn api_base(&self) -> String {
        match self.domain.as_deref().map(str::trim).filter(|d| !d.is_empty()) {
            Some(domain) if domain.starts_with("http") => domain.trim_end_matches('/').to_string(),
            Some(domain) => format!("https://{}", domain.trim_end_matches('/')),
            None => crate::API_BASE.to_string(),
        }
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
    fn api_base_handles_custom_domains() {
        let cfg = FeishuConfig::default();
        assert_eq!(cfg.api_base(), "https://open.feishu.cn");

        let with_domain: FeishuConfig =
            serde_json::from_str(r#"{"domain": "open.larksuite.com"}"#).unwrap();
        assert_eq!(with_domain.api_base(), "https://open.larksuite.com");

        let with_scheme: FeishuConfig =
            serde_json::from_str(r#"{"domain": "https://lark.example.cn/"}"#).unwrap();
        assert_eq!(with_scheme.api_base(), "https://lark.example.cn");
    }

    #[test]
    fn markdown_card_defaults_off() {
        assert!(!FeishuConfig::default().send_markdown_as_card);
    }
}
