//! Configuration loading, validation, env substitution, and per-account
//! resolution.
//!
//! Config files: `qiao.toml`, `qiao.yaml`, or `qiao.json`, searched in
//! `./` then `~/.config/qiao/`. All string values support `${ENV_VAR}`
//! substitution. Channel sections live under `channels.<id>`, with
//! per-account overrides under `channels.<id>.accounts.<accountId>`.

pub mod env;
pub mod loader;
pub mod resolve;
pub mod schema;

pub use {
    loader::{discover_and_load, load_config_value},
    resolve::{
        ResolvedAccount, delete_account, list_account_ids, reload_prefix_matches, resolve_account,
        set_account_enabled,
    },
    schema::DmScope,
};
