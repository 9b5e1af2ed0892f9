//! Channel plugin system.
//!
//! Each platform (DingTalk, Feishu, WeCom, WeCom self-built app, QQ)
//! implements the `ChannelPlugin` trait: per-account lifecycle, outbound
//! senders, and a directory for resolving host-supplied target strings.
//! Inbound messages flow through an `InboundSink` the gateway provides.

pub mod directory;
pub mod error;
pub mod gating;
pub mod plugin;
pub mod queue;
pub mod registry;
pub mod webhook;

pub use {
    directory::{TargetKind, TargetRef, can_resolve, parse_target},
    error::{Error, Result},
    gating::{DmPolicy, GroupPolicy, Policy, PolicyDecision},
    plugin::{
        AccountStatus, Capabilities, ChannelMeta, ChannelOutbound, ChannelPlugin, InboundSink,
        NoopStatusSink, SendOutcome, StatusSink,
    },
    queue::SerialQueue,
    registry::ChannelRegistry,
    webhook::{
        NoopRouteRegistrar, RouteRegistrar, WebhookHandler, WebhookRequest, WebhookResponse,
    },
};
