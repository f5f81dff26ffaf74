//! Middleware — relying-party client identification.
//!
//! The service never authenticates clients itself; a reverse proxy in front
//! of it does (mTLS, basic auth, whatever) and forwards the authenticated
//! principal in a trusted header. Requests without one are rejected before
//! any route runs.

use std::sync::Arc;

use axum::{extract::Request, extract::State, middleware::Next, response::Response};
use warden_common::error::WardenError;
use warden_common::models::client::Client;
use warden_db::repository::clients;

use crate::AppState;

/// Header carrying the authenticated client name (the `REMOTE_USER`
/// equivalent behind a reverse proxy).
pub const CLIENT_HEADER: &str = "x-authenticated-client";

/// Relying-party context resolved from the request principal.
#[derive(Debug, Clone)]
pub struct ClientContext(pub Client);

/// Resolve the authenticated principal to a client row and stash it in the
/// request extensions for handlers.
pub async fn client_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, WardenError> {
    let name = request
        .headers()
        .get(CLIENT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .ok_or_else(|| WardenError::BadInput("Client not specified".into()))?;

    let mut conn = state.engine.db().pool.acquire().await?;
    let client = clients::find_by_name(&mut conn, &name)
        .await?
        .ok_or_else(|| WardenError::BadInput(format!("Client not found: {name}")))?;

    request.extensions_mut().insert(ClientContext(client));

    Ok(next.run(request).await)
}
