//! Channel-neutral configuration fields recognized under `channels.<id>`.

use serde::{Deserialize, Serialize};

use qiao_channels::gating::{DmPolicy, GroupPolicy, Policy};

/// How DM sessions are scoped on the host side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DmScope {
    #[default]
    #[serde(rename = "main")]
    Main,
    #[serde(rename = "per-peer")]
    PerPeer,
    #[serde(rename = "per-channel-peer")]
    PerChannelPeer,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    #[serde(rename = "dmScope", alias = "dm_scope")]
    pub dm_scope: DmScope,
}

/// The channel-neutral portion of a `channels.<id>` section. Channel
/// crates flatten this into their own config types.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommonChannelConfig {
    pub enabled: bool,
    #[serde(rename = "name")]
    pub name: Option<String>,
    #[serde(rename = "dmPolicy", alias = "dm_policy")]
    pub dm_policy: DmPolicy,
    #[serde(rename = "groupPolicy", alias = "group_policy")]
    pub group_policy: GroupPolicy,
    #[serde(rename = "requireMention", alias = "require_mention")]
    pub require_mention: bool,
    #[serde(rename = "allowFrom", alias = "allow_from")]
    pub allow_from: Vec<String>,
    #[serde(rename = "groupAllowFrom", alias = "group_allow_from")]
    pub group_allow_from: Vec<String>,
    #[serde(rename = "maxFileSizeMB", alias = "max_file_size_mb")]
    pub max_file_size_mb: u64,
    #[serde(rename = "textChunkLimit", alias = "text_chunk_limit")]
    pub text_chunk_limit: Option<usize>,
    #[serde(rename = "replyFinalOnly", alias = "reply_final_only")]
    pub reply_final_only: bool,
    pub session: SessionConfig,
    #[serde(rename = "defaultAccount", alias = "default_account")]
    pub default_account: Option<String>,
}

impl Default for CommonChannelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            name: None,
            dm_policy: DmPolicy::default(),
            group_policy: GroupPolicy::default(),
            require_mention: true,
            allow_from: Vec::new(),
            group_allow_from: Vec::new(),
            max_file_size_mb: 100,
            text_chunk_limit: None,
            reply_final_only: false,
            session: SessionConfig::default(),
            default_account: None,
        }
    }
}

impl CommonChannelConfig {
    #[must_use]
    pub fn policy(&self) -> Policy {
        Policy {
            dm_policy: self.dm_policy,
            group_policy: self.group_policy,
            require_mention: self.require_mention,
            allow_from: self.allow_from.clone(),
            group_allow_from: self.group_allow_from.clone(),
        }
    }

    #[must_use]
    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb.saturating_mul(1024 * 1024)
    }
}
