//! Shared webhook listener with runtime route (de)registration.
//!
//! Channels register `(path, handler)` pairs when an account starts and
//! unregister on stop. One axum fallback handler serves the whole table,
//! so a freshly unregistered path answers 404 on the next callback.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use {
    axum::{
        Router,
        body::Bytes,
        extract::State,
        http::{HeaderMap, Method, StatusCode, Uri},
        response::{IntoResponse, Response},
    },
    tracing::{debug, info},
};

use qiao_channels::webhook::{RouteRegistrar, WebhookHandler, WebhookRequest, WebhookResponse};

/// Dynamic webhook route table.
#[derive(Default)]
pub struct WebhookRouter {
    routes: RwLock<HashMap<String, Arc<dyn WebhookHandler>>>,
}

impl WebhookRouter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Paths currently registered, sorted.
    #[must_use]
    pub fn paths(&self) -> Vec<String> {
        let routes = self.routes.read().unwrap_or_else(|e| e.into_inner());
        let mut paths: Vec<String> = routes.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Dispatch one request against the table.
    pub async fn dispatch(&self, request: WebhookRequest) -> WebhookResponse {
        let handler = {
            let routes = self.routes.read().unwrap_or_else(|e| e.into_inner());
            routes.get(&request.path).cloned()
        };
        match handler {
            Some(handler) => handler.handle(request).await,
            None => {
                debug!(path = %request.path, "webhook path not registered");
                WebhookResponse::not_found()
            },
        }
    }

    /// Build the axum router serving this table.
    pub fn into_axum_router(self: Arc<Self>) -> Router {
        Router::new()
            .fallback(handle_any)
            .with_state(self)
    }
}

impl RouteRegistrar for WebhookRouter {
    fn register(&self, path: &str, handler: Arc<dyn WebhookHandler>) -> anyhow::Result<()> {
        let path = normalize_path(path);
        let mut routes = self.routes.write().unwrap_or_else(|e| e.into_inner());
        if routes.contains_key(&path) {
            anyhow::bail!("webhook path already registered: {path}");
        }
        info!(path, "webhook route registered");
        routes.insert(path, handler);
        Ok(())
    }

    fn unregister(&self, path: &str) {
        let path = normalize_path(path);
        let mut routes = self.routes.write().unwrap_or_else(|e| e.into_inner());
        if routes.remove(&path).is_some() {
            info!(path, "webhook route unregistered");
        }
    }
}

fn normalize_path(path: &str) -> String {
    let trimmed = path.trim();
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

async fn handle_any(
    State(router): State<Arc<WebhookRouter>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let query = uri
        .query()
        .map(parse_query)
        .unwrap_or_default();
    let header_map = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect();

    let request = WebhookRequest {
        method: method.as_str().to_ascii_uppercase(),
        path: uri.path().to_string(),
        query,
        headers: header_map,
        body: body.to_vec(),
    };
    let response = router.dispatch(request).await;

    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        [("content-type", response.content_type)],
        response.body,
    )
        .into_response()
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            Some((key.to_string(), percent_decode(value)))
        })
        .collect()
}

/// Query values arrive percent-encoded; signatures and echo strings must
/// be compared decoded.
fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                if let (Some(hi), Some(lo)) = (
                    bytes.get(i + 1).and_then(|b| (*b as char).to_digit(16)),
                    bytes.get(i + 2).and_then(|b| (*b as char).to_digit(16)),
                ) {
                    out.push((hi * 16 + lo) as u8);
                    i += 3;
                    continue;
                }
                out.push(b'%');
                i += 1;
            },
            b'+' => {
                out.push(b' ');
                i += 1;
            },
            other => {
                out.push(other);
                i += 1;
            },
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;

    struct EchoHandler;

    #[async_trait]
    impl WebhookHandler for EchoHandler {
        async fn handle(&self, request: WebhookRequest) -> WebhookResponse {
            WebhookResponse::ok(format!(
                "{} {} {}",
                request.method,
                request.path,
                request.query_param("x").unwrap_or("-")
            ))
        }
    }

    #[tokio::test]
    async fn registered_paths_dispatch_and_unregistered_404() {
        let router = Arc::new(WebhookRouter::new());
        router.register("/hooks/a", Arc::new(EchoHandler)).unwrap();

        let request = WebhookRequest {
            method: "POST".into(),
            path: "/hooks/a".into(),
            query: [("x".to_string(), "1".to_string())].into(),
            headers: HashMap::new(),
            body: Vec::new(),
        };
        let response = router.dispatch(request.clone()).await;
        assert_eq!(response.status, 200);
        assert_eq!(response.body, "POST /hooks/a 1");

        router.unregister("/hooks/a");
        let response = router.dispatch(request).await;
        assert_eq!(response.status, 404);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let router = WebhookRouter::new();
        router.register("/p", Arc::new(EchoHandler)).unwrap();
        assert!(router.register("p", Arc::new(EchoHandler)).is_err());
        assert_eq!(router.paths(), vec!["/p"]);
    }

    #[test]
    fn query_values_are_percent_decoded() {
        let query = parse_query("msg_signature=ab%2Bcd&nonce=n+1&raw=ok");
        assert_eq!(query["msg_signature"], "ab+cd");
        assert_eq!(query["nonce"], "n 1");
        assert_eq!(query["raw"], "ok");
    }

    #[tokio::test]
    async fn axum_layer_translates_requests_and_statuses() {
        use {
            axum::{body::Body, http::Request},
            tower::util::ServiceExt,
        };

        let router = Arc::new(WebhookRouter::new());
        router.register("/hooks/echo", Arc::new(EchoHandler)).unwrap();
        let app = Arc::clone(&router).into_axum_router();

        let response = app
            .clone()
            .oneshot(
                Request::post("/hooks/echo?x=a%2Bb")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(body.as_ref(), b"POST /hooks/echo a+b");

        let response = app
            .oneshot(Request::get("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
