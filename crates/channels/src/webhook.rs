//! Webhook route registration facility.
//!
//! Webhook-driven channels (WeCom family, QQ) receive `(path, handler)`
//! registrations from the gateway's shared HTTP listener. Handlers are
//! re-entrant: the platform may invoke the same path concurrently.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;

/// One inbound webhook invocation, transport-agnostic.
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    /// Uppercase HTTP method.
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
    /// Lowercase header names.
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl WebhookRequest {
    #[must_use]
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    #[must_use]
    pub fn body_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// The platform-facing reply.
#[derive(Debug, Clone)]
pub struct WebhookResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: String,
}

impl WebhookResponse {
    #[must_use]
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            content_type: "text/plain; charset=utf-8",
            body: body.into(),
        }
    }

    #[must_use]
    pub fn json(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            content_type: "application/json",
            body: body.into(),
        }
    }

    #[must_use]
    pub fn bad_request(body: impl Into<String>) -> Self {
        Self {
            status: 400,
            content_type: "text/plain; charset=utf-8",
            body: body.into(),
        }
    }

    #[must_use]
    pub fn not_found() -> Self {
        Self {
            status: 404,
            content_type: "text/plain; charset=utf-8",
            body: "not found".into(),
        }
    }
}

/// Per-path webhook handler implemented by webhook channels.
#[async_trait]
pub trait WebhookHandler: Send + Sync {
    async fn handle(&self, request: WebhookRequest) -> WebhookResponse;
}

/// Registration surface the gateway hands to webhook channels. A path is
/// live from `register` until `unregister`; callbacks on an unregistered
/// path answer 404.
pub trait RouteRegistrar: Send + Sync {
    fn register(&self, path: &str, handler: Arc<dyn WebhookHandler>) -> anyhow::Result<()>;
    fn unregister(&self, path: &str);
}

/// Registrar that accepts and drops everything (tests, WS-only setups).
#[derive(Default)]
pub struct NoopRouteRegistrar;

impl RouteRegistrar for NoopRouteRegistrar {
    fn register(&self, _path: &str, _handler: Arc<dyn WebhookHandler>) -> anyhow::Result<()> {
        Ok(())
    }

    fn unregister(&self, _path: &str) {}
}
