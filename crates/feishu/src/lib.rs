//! Feishu channel: vendor long-connection WebSocket ingress with protobuf
//! frames, encrypted-event support, and im/v1 message sends.

pub mod config;
pub mod crypto;
pub mod frame;
pub mod normalize;
pub mod outbound;
pub mod plugin;
pub mod state;
pub mod token;
pub mod ws;

pub use {config::FeishuConfig, plugin::FeishuPlugin};

/// Open-platform API origin.
pub const API_BASE: &str = "https://open.feishu.cn";
