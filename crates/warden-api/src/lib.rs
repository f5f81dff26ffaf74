//! # warden-api
//!
//! REST layer for warden: the ceremony engine, attestation service, and the
//! HTTP routes that expose them to relying-party clients.

pub mod attestation;
pub mod engine;
pub mod middleware;
pub mod routes;

use std::sync::Arc;

use axum::Router;

use crate::engine::Engine;

/// Shared application state available to all route handlers.
pub struct AppState {
    pub engine: Engine,
}

/// Build the complete API router with all routes and middleware.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(routes::users::router())
        .merge(routes::register::router())
        .merge(routes::sign::router())
        .merge(routes::devices::router())
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::client_middleware,
        ))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::limit::RequestBodyLimitLayer::new(1024 * 1024))
        .with_state(state)
}
