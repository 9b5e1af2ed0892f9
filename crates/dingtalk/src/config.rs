use {
    secrecy::Secret,
    serde::{Deserialize, Serialize},
};

use qiao_config::schema::CommonChannelConfig;

/// Configuration for one DingTalk robot account.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DingTalkConfig {
    #[serde(flatten)]
    pub common: CommonChannelConfig,

    /// App key / client id of the robot application.
    #[serde(rename = "clientId", alias = "client_id", alias = "appKey")]
    pub client_id: Option<String>,

    #[serde(
        rename = "clientSecret",
        alias = "client_secret",
        alias = "appSecret",
        serialize_with = "crate::config::serialize_opt_secret",
        deserialize_with = "crate::config::deserialize_opt_secret"
    )]
    pub client_secret: Option<Secret<String>>,

    /// Stream replies as AI cards instead of plain messages.
    #[serde(rename = "enableAICard", alias = "enable_ai_card")]
    pub enable_ai_card: bool,

    /// Card template to instantiate when AI cards are enabled.
    #[serde(rename = "cardTemplateId", alias = "card_template_id")]
    pub card_template_id: Option<String>,
}

impl std::fmt::Debug for DingTalkConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DingTalkConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "[REDACTED]"))
            .field("enable_ai_card", &self.enable_ai_card)
            .finish_non_exhaustive()
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
    fn accepts_app_key_aliases() {
        let cfg: DingTalkConfig = serde_json::from_str(
            r#"{"appKey": "ding-key", "appSecret": "ding-secret", "enableAICard": true}"#,
        )
        .unwrap();
        assert_eq!(cfg.client_id.as_deref(), Some("ding-key"));
        assert!(cfg.client_secret.is_some());
        assert!(cfg.enable_ai_card);
    }

    #[test]
    fn card_streaming_defaults_off() {
        let cfg = DingTalkConfig::default();
        assert!(!cfg.enable_ai_card);
        assert!(cfg.card_template_id.is_none());
    }
}
