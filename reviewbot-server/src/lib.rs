pub mod config;
pub mod dispatcher;
pub mod event;
pub mod github;
pub mod locks;
pub mod processor;
pub mod record_store;
pub mod status;
pub mod webhook;

#[cfg(test)]
mod test_utils;

use std::sync::Arc;

use axum::{routing::get, Router};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

pub use dispatcher::{Ack, Dispatcher, DispatcherConfig, ReviewOutcome};
pub use github::GitHubClient;
pub use locks::LockRegistry;
pub use processor::{CodeHost, PrProcessor};
pub use record_store::{RecordStore, SqliteRecordStore};

pub fn get_bot_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub record_store: Arc<dyn RecordStore>,
    /// Secret for `X-Hub-Signature-256`. Signatures are not checked when unset.
    pub webhook_secret: Option<String>,
    /// Bearer token required by `/status`. The endpoint is open when unset.
    pub status_auth_token: Option<String>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(status::health_check))
        .route("/status", get(status::status_handler))
        .merge(webhook::webhook_router(state.clone()))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}
