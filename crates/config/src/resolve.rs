//! Merge env overrides, channel defaults, and per-account overrides into
//! a `ResolvedAccount` view.

use {
    base64::Engine,
    serde_json::{Map, Value},
    tracing::warn,
};

use {
    qiao_channels::gating::Policy,
    qiao_common::ChannelKind,
};

use crate::{
    env::apply_env_overrides,
    schema::{CommonChannelConfig, DmScope},
};

/// A per-account view of the merged configuration.
#[derive(Debug, Clone)]
pub struct ResolvedAccount {
    pub channel: ChannelKind,
    pub account_id: String,
    pub name: Option<String>,
    pub enabled: bool,
    /// Credentials sufficient for ingress.
    pub configured: bool,
    /// Credentials sufficient for host-initiated sending.
    pub can_send_active: bool,
    pub policy: Policy,
    pub reply_final_only: bool,
    pub text_chunk_limit: Option<usize>,
    pub max_file_size_mb: u64,
    pub dm_scope: DmScope,
    /// First validation failure, when the account is misconfigured.
    pub config_error: Option<String>,
    /// The fully merged channel-specific config for the plugin to parse.
    pub raw: Value,
}

impl ResolvedAccount {
    fn disabled_stub(channel: ChannelKind, account_id: &str) -> Self {
        Self {
            channel,
            account_id: account_id.to_string(),
            name: None,
            enabled: false,
            configured: false,
            can_send_active: false,
            policy: Policy::standard(),
            reply_final_only: false,
            text_chunk_limit: None,
            max_file_size_mb: 100,
            dm_scope: DmScope::Main,
            config_error: None,
            raw: Value::Object(Map::new()),
        }
    }

    #[must_use]
    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb.saturating_mul(1024 * 1024)
    }
}

/// Resolve one account of one channel from the root config value.
///
/// Unknown account ids resolve to a disabled stub rather than an error.
#[must_use]
pub fn resolve_account(root: &Value, channel: ChannelKind, account_id: &str) -> ResolvedAccount {
    let Some(channel_value) = root
        .get("channels")
        .and_then(|c| c.get(channel.as_str()))
        .and_then(Value::as_object)
    else {
        return ResolvedAccount::disabled_stub(channel, account_id);
    };

    let default_account = channel_value
        .get("defaultAccount")
        .or_else(|| channel_value.get("default_account"))
        .and_then(Value::as_str)
        .unwrap_or("default");

    let account_override = channel_value
        .get("accounts")
        .and_then(|a| a.get(account_id));
    if account_id != default_account && account_override.is_none() {
        return ResolvedAccount::disabled_stub(channel, account_id);
    }

    // top-level channel config minus the account table
    let mut merged = Value::Object(
        channel_value
            .iter()
            .filter(|(k, _)| k.as_str() != "accounts")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    );
    if let Some(overlay) = account_override {
        deep_merge(&mut merged, overlay);
    }
    if account_id == default_account {
        apply_env_overrides(channel, &mut merged);
    }

    let common: CommonChannelConfig =
        serde_json::from_value(merged.clone()).unwrap_or_else(|e| {
            warn!(channel = %channel, account_id, error = %e, "invalid channel config section");
            CommonChannelConfig {
                enabled: false,
                ..CommonChannelConfig::default()
            }
        });

    let config_error = validate(channel, &merged).err();
    let (mut configured, can_send_active) = credential_flags(channel, &merged);
    if let Some(error) = &config_error {
        configured = false;
        warn!(channel = %channel, account_id, error, "account disabled by invalid config");
    }

    ResolvedAccount {
        channel,
        account_id: account_id.to_string(),
        name: common.name.clone(),
        enabled: common.enabled,
        configured,
        can_send_active: can_send_active && configured,
        policy: common.policy(),
        reply_final_only: common.reply_final_only,
        text_chunk_limit: common.text_chunk_limit,
        max_file_size_mb: common.max_file_size_mb,
        dm_scope: common.session.dm_scope,
        config_error,
        raw: merged,
    }
}

/// All account ids a channel section declares, default first.
#[must_use]
pub fn list_account_ids(root: &Value, channel: ChannelKind) -> Vec<String> {
    let Some(channel_value) = root
        .get("channels")
        .and_then(|c| c.get(channel.as_str()))
        .and_then(Value::as_object)
    else {
        return Vec::new();
    };
    let default_account = channel_value
        .get("defaultAccount")
        .or_else(|| channel_value.get("default_account"))
        .and_then(Value::as_str)
        .unwrap_or("default");

    let mut ids = vec![default_account.to_string()];
    if let Some(accounts) = channel_value.get("accounts").and_then(Value::as_object) {
        for id in accounts.keys() {
            if id != default_account {
                ids.push(id.clone());
            }
        }
    }
    ids
}

/// Flip `enabled` for an account, creating the override entry if needed.
pub fn set_account_enabled(
    root: &mut Value,
    channel: ChannelKind,
    account_id: &str,
    enabled: bool,
) {
    let channels = ensure_object(root, "channels");
    let channel_value = ensure_object(channels, channel.as_str());
    let default_account = channel_value
        .get("defaultAccount")
        .or_else(|| channel_value.get("default_account"))
        .and_then(Value::as_str)
        .unwrap_or("default")
        .to_string();

    if account_id == default_account {
        if let Some(map) = channel_value.as_object_mut() {
            map.insert("enabled".to_string(), Value::Bool(enabled));
        }
        return;
    }
    let accounts = ensure_object(channel_value, "accounts");
    let entry = ensure_object(accounts, account_id);
    if let Some(map) = entry.as_object_mut() {
        map.insert("enabled".to_string(), Value::Bool(enabled));
    }
}

/// Remove a per-account override entirely.
pub fn delete_account(root: &mut Value, channel: ChannelKind, account_id: &str) {
    if let Some(accounts) = root
        .get_mut("channels")
        .and_then(|c| c.get_mut(channel.as_str()))
        .and_then(|v| v.get_mut("accounts"))
        .and_then(Value::as_object_mut)
    {
        accounts.remove(account_id);
    }
}

/// Whether a changed config key affects a channel's accounts.
#[must_use]
pub fn reload_prefix_matches(changed_key: &str, channel: ChannelKind) -> bool {
    let prefix = format!("channels.{}", channel.as_str());
    changed_key == prefix || changed_key.starts_with(&format!("{prefix}."))
}

// ── validation ──────────────────────────────────────────────────────────────

fn validate(channel: ChannelKind, merged: &Value) -> Result<(), String> {
    match channel {
        ChannelKind::Wecom | ChannelKind::WecomApp => {
            if let Some(key) = get_str(merged, &["encodingAESKey", "encoding_aes_key"]) {
                validate_encoding_aes_key(key)?;
            }
            if channel == ChannelKind::WecomApp
                && let Some(agent_id) = merged.get("agentId").or_else(|| merged.get("agent_id"))
            {
                parse_agent_id(agent_id)?;
            }
            Ok(())
        },
        _ => Ok(()),
    }
}

/// A WeCom `EncodingAESKey` is 43 base64 chars; padded with one `=` it
/// must decode to exactly 32 bytes.
pub fn validate_encoding_aes_key(key: &str) -> Result<(), String> {
    let key = key.trim();
    let padded = if key.ends_with('=') {
        key.to_string()
    } else {
        format!("{key}=")
    };
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(&padded)
        .map_err(|_| "encodingAESKey is not valid base64".to_string())?;
    if decoded.len() != 32 {
        return Err(format!(
            "encodingAESKey must decode to 32 bytes, got {}",
            decoded.len()
        ));
    }
    Ok(())
}

/// `agentId` must be a positive integer; strings are accepted for env
/// overrides.
pub fn parse_agent_id(value: &Value) -> Result<i64, String> {
    let parsed = match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    match parsed {
        Some(id) if id > 0 => Ok(id),
        _ => Err("agentId must be a positive integer".to_string()),
    }
}

// ── credential checks ───────────────────────────────────────────────────────

fn credential_flags(channel: ChannelKind, merged: &Value) -> (bool, bool) {
    match channel {
        ChannelKind::Dingtalk => {
            let creds = has(merged, &["clientId", "client_id"])
                && has(merged, &["clientSecret", "client_secret"]);
            (creds, creds)
        },
        ChannelKind::Feishu => {
            let creds =
                has(merged, &["appId", "app_id"]) && has(merged, &["appSecret", "app_secret"]);
            (creds, creds)
        },
        ChannelKind::Wecom => {
            let ingress = has(merged, &["token"])
                && has(merged, &["encodingAESKey", "encoding_aes_key"]);
            let active = has(merged, &["robotWebhookUrl", "robot_webhook_url"]);
            (ingress, active)
        },
        ChannelKind::WecomApp => {
            let callback = has(merged, &["token"])
                && has(merged, &["encodingAESKey", "encoding_aes_key"]);
            let app = has(merged, &["corpId", "corp_id"])
                && has(merged, &["corpSecret", "corp_secret"])
                && merged
                    .get("agentId")
                    .or_else(|| merged.get("agent_id"))
                    .is_some_and(|v| parse_agent_id(v).is_ok());
            (callback && app, app)
        },
        ChannelKind::Qqbot => {
            let creds = has(merged, &["appId", "app_id"])
                && has(merged, &["clientSecret", "client_secret"]);
            (creds, creds)
        },
    }
}

fn get_str<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|k| value.get(*k))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn has(value: &Value, keys: &[&str]) -> bool {
    get_str(value, keys).is_some()
}

// ── value plumbing ──────────────────────────────────────────────────────────

fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    },
                }
            }
        },
        (base, overlay) => *base = overlay.clone(),
    }
}

/// Navigate to `value[key]`, coercing both levels into objects.
fn ensure_object<'a>(value: &'a mut Value, key: &str) -> &'a mut Value {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    let map = value.as_object_mut().expect("just ensured object");
    let slot = map
        .entry(key.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !slot.is_object() {
        *slot = Value::Object(Map::new());
    }
    slot
}
