//! Statically-typed port onto the host agent runtime.
//!
//! The gateway core never reaches into the host through dynamic lookups;
//! everything it consumes is declared here as a trait (routing, session
//! storage, reply dispatch) or as pure functions (envelope formatting, text
//! chunking). Each trait has a `Noop` implementation so channel crates can
//! be exercised standalone before a real host is wired in.

pub mod error;
pub mod reply;
pub mod router;
pub mod session;
pub mod text;

use std::sync::Arc;

/// Bundle of the host port trait objects the gateway consumes.
///
/// Defaults to the `Noop` implementations so channel crates and tests can
/// run before a real host runtime is wired in.
pub struct HostPorts {
    pub router: Arc<dyn router::AgentRouter>,
    pub sessions: Arc<dyn session::SessionStore>,
    pub reply: Arc<dyn reply::ReplyDispatchPort>,
}

impl Default for HostPorts {
    fn default() -> Self {
        Self {
            router: Arc::new(router::NoopAgentRouter),
            sessions: Arc::new(session::NoopSessionStore),
            reply: Arc::new(reply::NoopReplyDispatchPort),
        }
    }
}

pub use {
    error::{HostError, HostResult},
    reply::{
        BlockKind, BufferedReplyDispatcher, EnvelopeFormatOptions, HumanDelayConfig,
        NoopReplyDispatchPort, ReplyDeliverer, ReplyDispatchPort, ReplyDispatcherHandle,
        ReplyDispatcherOptions, create_reply_dispatcher, finalize_inbound_context,
        format_agent_envelope, resolve_envelope_format_options, resolve_human_delay_config,
    },
    router::{AgentRoute, AgentRouter, NoopAgentRouter, RouteRequest},
    session::{NoopSessionStore, SessionAnchor, SessionStore},
};
