//! Gateway glue: the shared webhook listener, the dispatch coordinator
//! between channels and the host runtime, and per-account lifecycle
//! management with config reload.

pub mod dispatch;
pub mod manager;
pub mod routes;

pub use {
    dispatch::DispatchCoordinator,
    manager::GatewayManager,
    routes::WebhookRouter,
};
