//! DingTalk channel: Stream SDK ingress over WebSocket, session-webhook
//! replies, robot batch sends, and the streaming AI-card lifecycle.

pub mod card;
pub mod config;
pub mod normalize;
pub mod outbound;
pub mod plugin;
pub mod state;
pub mod stream;
pub mod token;

pub use {config::DingTalkConfig, plugin::DingTalkPlugin};

/// New-style API origin (token, stream gateway, cards).
pub const API_BASE: &str = "https://api.dingtalk.com";
