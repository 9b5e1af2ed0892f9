//! `${ENV_VAR}` substitution in raw config text and `QIAO_*` overrides
//! for the default account.

use serde_json::Value;

use qiao_common::ChannelKind;

/// Replace `${VAR}` occurrences with the environment value, leaving
/// unknown variables untouched.
#[must_use]
pub fn substitute_env(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let tail = &rest[start + 2..];
        let Some(end) = tail.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let name = &tail[..end];
        match std::env::var(name) {
            Ok(value) if is_valid_var_name(name) => out.push_str(&value),
            _ => out.push_str(&rest[start..start + 2 + end + 1]),
        }
        rest = &tail[end + 1..];
    }
    out.push_str(rest);
    out
}

fn is_valid_var_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Environment variable prefix for a channel's override keys, e.g.
/// `QIAO_WECOM_APP_CORP_SECRET`.
#[must_use]
pub fn env_prefix(channel: ChannelKind) -> String {
    format!("QIAO_{}_", channel.as_str().replace('-', "_").to_ascii_uppercase())
}

/// Apply `QIAO_<CHANNEL>_<KEY>` environment overrides onto a merged
/// account config value. Only the default account receives these.
pub fn apply_env_overrides(channel: ChannelKind, value: &mut Value) {
    let Value::Object(map) = value else {
        return;
    };
    let prefix = env_prefix(channel);
    for (name, env_value) in std::env::vars() {
        if let Some(key) = name.strip_prefix(&prefix) {
            if key.is_empty() || env_value.is_empty() {
                continue;
            }
            let key = key.to_ascii_lowercase();
            map.insert(key, coerce(&env_value));
        }
    }
}

/// Booleans arrive as strings from the environment; everything else stays
/// a string (numeric credential fields accept both forms on deserialize).
fn coerce(value: &str) -> Value {
    match value {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::String(value.to_string()),
    }
}
