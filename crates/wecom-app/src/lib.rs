//! WeCom self-built application channel: XML webhook ingress with
//! signature verification and AES payload decryption, inbound media
//! archival, and active sends through `message/send`.

pub mod config;
pub mod normalize;
pub mod outbound;
pub mod plugin;
pub mod state;
pub mod webhook;

pub use {config::WecomAppConfig, plugin::WecomAppPlugin};
