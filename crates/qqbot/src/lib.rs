//! QQ open-platform channel: ed25519-verified webhook ingress, C2C and
//! group message normalization with optional Flash ASR for voice, and v2
//! message sends with the documented file-send fallback.

pub mod asr;
pub mod config;
pub mod normalize;
pub mod outbound;
pub mod plugin;
pub mod sign;
pub mod state;
pub mod token;
pub mod webhook;

pub use {config::QqBotConfig, plugin::QqBotPlugin};

/// QQ bot API origin.
pub const API_BASE: &str = "https://api.sgroup.qq.com";
/// App access-token endpoint.
pub const TOKEN_URL: &str = "https://bots.qq.com/app/getAppAccessToken";
