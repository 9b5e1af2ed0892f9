//! Shared WeCom API plumbing used by both the AI-robot and self-built
//! application channels: callback crypto, the corp access-token cache,
//! callback XML handling, and the REST endpoints.

pub mod api;
pub mod crypto;
pub mod token;
pub mod xml;

pub use {
    api::{WecomClient, check_errcode, send_robot_webhook},
    crypto::{EncryptedReply, WecomCrypto},
    token::{TOKEN_SAFETY_MARGIN_SECS, TokenCache, is_token_errcode},
    xml::parse_xml_fields,
};

/// Default WeCom API origin.
pub const API_BASE: &str = "https://qyapi.weixin.qq.com";
