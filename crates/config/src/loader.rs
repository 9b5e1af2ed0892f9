use std::path::{Path, PathBuf};

use {serde_json::Value, tracing::{debug, warn}};

use crate::env::substitute_env;

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &["qiao.toml", "qiao.yaml", "qiao.yml", "qiao.json"];

/// Load and parse a config file with env substitution.
pub fn load_config_value(path: &Path) -> anyhow::Result<Value> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let raw = substitute_env(&raw);
    parse_config_value(&raw, path)
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./qiao.{toml,yaml,yml,json}` (project-local)
/// 2. `~/.config/qiao/qiao.{toml,yaml,yml,json}` (user-global)
///
/// Returns an empty object if no config file is found or parsing fails.
#[must_use]
pub fn discover_and_load() -> Value {
    if let Some(path) = find_config_file() {
        debug!(path = %path.display(), "loading config");
        match load_config_value(&path) {
            Ok(value) => return value,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
            },
        }
    } else {
        debug!("no config file found, using defaults");
    }
    Value::Object(serde_json::Map::new())
}

fn find_config_file() -> Option<PathBuf> {
    for name in CONFIG_FILENAMES {
        let p = PathBuf::from(name);
        if p.exists() {
            return Some(p);
        }
    }

    if let Some(dirs) = directories::ProjectDirs::from("", "", "qiao") {
        let config_dir = dirs.config_dir();
        for name in CONFIG_FILENAMES {
            let p = config_dir.join(name);
            if p.exists() {
                return Some(p);
            }
        }
    }

    None
}

fn parse_config_value(raw: &str, path: &Path) -> anyhow::Result<Value> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => {
            let v: toml::Value = toml::from_str(raw)?;
            Ok(serde_json::to_value(v)?)
        },
        "yaml" | "yml" => {
            let v: serde_yaml::Value = serde_yaml::from_str(raw)?;
            Ok(serde_json::to_value(v)?)
        },
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn parses_toml_channels_section() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[channels.dingtalk]\nclient_id = \"ding-1\"\nenabled = true"
        )
        .unwrap();
        let value = load_config_value(file.path()).unwrap();
        assert_eq!(value["channels"]["dingtalk"]["client_id"], "ding-1");
        assert_eq!(value["channels"]["dingtalk"]["enabled"], true);
    }

    #[test]
    fn parses_json_with_env_substitution() {
        // SAFETY: test-local env mutation
        unsafe { std::env::set_var("QIAO_LOADER_SECRET", "s3") };
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            "{{\"channels\":{{\"qqbot\":{{\"client_secret\":\"${{QIAO_LOADER_SECRET}}\"}}}}}}"
        )
        .unwrap();
        let value = load_config_value(file.path()).unwrap();
        assert_eq!(value["channels"]["qqbot"]["client_secret"], "s3");
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let mut file = tempfile::Builder::new().suffix(".ini").tempfile().unwrap();
        writeln!(file, "a=1").unwrap();
        assert!(load_config_value(file.path()).is_err());
    }
}
