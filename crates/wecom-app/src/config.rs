use std::path::PathBuf;

use {
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Deserializer, Serialize, Serializer},
};

use qiao_config::schema::CommonChannelConfig;

/// Inbound media archival knobs (`inboundMedia` block).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InboundMediaConfig {
    pub enabled: bool,
    /// Media root; `<dir>/inbound/YYYY-MM-DD/` receives archived files.
    pub dir: Option<PathBuf>,
    #[serde(rename = "maxBytes", alias = "max_bytes")]
    pub max_bytes: u64,
    #[serde(rename = "keepDays", alias = "keep_days")]
    pub keep_days: u32,
}

impl Default for InboundMediaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
            max_bytes: qiao_media::DEFAULT_MAX_BYTES,
            keep_days: qiao_media::DEFAULT_KEEP_DAYS,
        }
    }
}

/// Outbound voice transcoding knobs (`voiceTranscode` block).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceTranscodeConfig {
    pub enabled: bool,
    /// Preferred target container; only `amr` is implemented.
    pub prefer: Option<String>,
}

/// Configuration for one WeCom self-built application account.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WecomAppConfig {
    #[serde(flatten)]
    pub common: CommonChannelConfig,

    #[serde(rename = "corpId", alias = "corp_id")]
    pub corp_id: Option<String>,

    #[serde(
        rename = "corpSecret",
        alias = "corp_secret",
        serialize_with = "serialize_opt_secret",
        deserialize_with = "deserialize_opt_secret"
    )]
    pub corp_secret: Option<Secret<String>>,

    #[serde(
        rename = "agentId",
        alias = "agent_id",
        deserialize_with = "deserialize_opt_agent_id"
    )]
    pub agent_id: Option<i64>,

    /// Callback verification token.
    pub token: Option<String>,

    #[serde(
        rename = "encodingAESKey",
        alias = "encoding_aes_key",
        serialize_with = "serialize_opt_secret",
        deserialize_with = "deserialize_opt_secret"
    )]
    pub encoding_aes_key: Option<Secret<String>>,

    /// Webhook mount path; defaults to `/webhooks/wecom-app/<accountId>`.
    #[serde(rename = "webhookPath", alias = "webhook_path")]
    pub webhook_path: Option<String>,

    #[serde(rename = "inboundMedia", alias = "inbound_media")]
    pub inbound_media: InboundMediaConfig,

    #[serde(rename = "voiceTranscode", alias = "voice_transcode")]
    pub voice_transcode: VoiceTranscodeConfig,
}

impl Default for WecomAppConfig {
    fn default() -> Self {
        Self {
            common: CommonChannelConfig::default(),
            corp_id: None,
            corp_secret: None,
            agent_id: None,
            token: None,
            encoding_aes_key: None,
            webhook_path: None,
            inbound_media: InboundMediaConfig::default(),
            voice_transcode: VoiceTranscodeConfig::default(),
        }
    }
}

impl std::fmt::Debug for WecomAppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WecomAppConfig")
            .field("corp_id", &self.corp_id)
            .field("corp_secret", &self.corp_secret.as_ref().map(|_| "[REDACTED]"))
            .field("agent_id", &self.agent_id)
            .field("webhook_path", &self.webhook_path)
            .finish_non_exhaustive()
    }
}

impl WecomAppConfig {
    #[must_use]
    pub fn webhook_path_for(&self, account_id: &str) -> String {
        self.webhook_path
            .clone()
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| format!("/webhooks/wecom-app/{account_id}"))
    }
}

pub(crate) fn serialize_opt_secret<S: Serializer>(
    secret: &Option<Secret<String>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match secret {
        Some(secret) => serializer.serialize_some(secret.expose_secret()),
        None => serializer.serialize_none(),
    }
}

pub(crate) fn deserialize_opt_secret<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Secret<String>>, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?
        .filter(|s| !s.trim().is_empty())
        .map(Secret::new))
}

/// `agentId` arrives as an integer from config files and as a string from
/// env overrides.
pub(crate) fn deserialize_opt_agent_id<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<i64>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(i64),
        Text(String),
    }
    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Int(id)) => Ok(Some(id)),
        Some(Raw::Text(text)) => text
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_camel_case_with_secrets() {
        let json = r#"{
            "corpId": "corp1",
            "corpSecret": "cs",
            "agentId": 1000002,
            "token": "tok",
            "encodingAESKey": "key",
            "dmPolicy": "open",
            "voiceTranscode": { "enabled": true, "prefer": "amr" }
        }"#;
        let cfg: WecomAppConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.corp_id.as_deref(), Some("corp1"));
        assert_eq!(cfg.corp_secret.as_ref().unwrap().expose_secret(), "cs");
        assert_eq!(cfg.agent_id, Some(1000002));
        assert!(cfg.voice_transcode.enabled);
        assert!(cfg.common.enabled);
    }

    #[test]
    fn agent_id_accepts_string_form() {
        let cfg: WecomAppConfig =
            serde_json::from_str(r#"{"agent_id": "1000007"}"#).unwrap();
        assert_eq!(cfg.agent_id, Some(1000007));
        assert!(serde_json::from_str::<WecomAppConfig>(r#"{"agentId": "x"}"#).is_err());
    }

    #[test]
    fn debug_redacts_secrets() {
        let cfg: WecomAppConfig =
            serde_json::from_str(r#"{"corpSecret": "very-secret"}"#).unwrap();
        let debug = format!("{cfg:?}");
        assert!(!debug.contains("very-secret"));
        assert!(debug.contains("REDACTED"));
    }

    #[test]
    fn webhook_path_defaults_per_account() {
        let cfg = WecomAppConfig::default();
        assert_eq!(cfg.webhook_path_for("alice"), "/webhooks/wecom-app/alice");
        let with_path: WecomAppConfig =
            serde_json::from_str(r#"{"webhookPath": "/hooks/w"}"#).unwrap();
        assert_eq!(with_path.webhook_path_for("alice"), "/hooks/w");
    }

    #[test]
    fn inbound_media_defaults() {
        let cfg = WecomAppConfig::default();
        assert!(cfg.inbound_media.enabled);
        assert_eq!(cfg.inbound_media.max_bytes, 10 * 1024 * 1024);
        assert_eq!(cfg.inbound_media.keep_days, 7);
    }
}
