//! Registration ceremony endpoints.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Extension, Path, RawQuery, State},
    routing::get,
    Json, Router,
};
use warden_common::models::device::DeviceDescriptor;
use warden_common::models::wire::{RegisterRequestData, RegisterResponseData};
use warden_common::WardenResult;

use crate::{middleware::ClientContext, AppState};

use super::{parse_body, parse_ceremony_params};

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/{user}/register", get(register_start).post(register_complete))
}

/// GET /{user}/register — Mint a challenge and start a registration
/// ceremony. Query: `challenge` (websafe base64), `properties`
/// (URL-encoded JSON).
async fn register_start(
    Extension(ClientContext(client)): Extension<ClientContext>,
    State(state): State<Arc<AppState>>,
    Path(user): Path<String>,
    RawQuery(query): RawQuery,
) -> WardenResult<Json<RegisterRequestData>> {
    let params = parse_ceremony_params(query.as_deref())?;
    let data = state
        .engine
        .register_start(&client, &user, params.challenge, params.properties)
        .await?;
    Ok(Json(data))
}

/// POST /{user}/register — Verify the client's registration response and
/// enroll the device. Body: `{registerResponse, properties?}`.
async fn register_complete(
    Extension(ClientContext(client)): Extension<ClientContext>,
    State(state): State<Arc<AppState>>,
    Path(user): Path<String>,
    body: Bytes,
) -> WardenResult<Json<DeviceDescriptor>> {
    let body: RegisterResponseData = parse_body(&body)?;
    let descriptor = state.engine.register_complete(&client, &user, body).await?;
    Ok(Json(descriptor))
}
