//! Shared types and text utilities used across all qiao crates.

pub mod markdown;
pub mod types;

pub use types::{
    Attachment, ChannelKind, ChatType, InboundEnvelope, MediaKind, MediaPayload, ReplyPayload,
};
