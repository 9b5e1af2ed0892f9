//! WeCom AI-robot channel: encrypted JSON webhook ingress, the 5-second
//! `stream` acknowledgement, and out-of-band replies through per-message
//! `response_url`s with a group-robot webhook as the active-send path.

pub mod config;
pub mod normalize;
pub mod outbound;
pub mod plugin;
pub mod state;
pub mod webhook;

pub use {config::WecomConfig, plugin::WecomPlugin};
