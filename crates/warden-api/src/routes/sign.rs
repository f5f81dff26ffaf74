//! Sign ceremony endpoints.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Extension, Path, RawQuery, State},
    routing::get,
    Json, Router,
};
use warden_common::models::device::DeviceDescriptor;
use warden_common::models::wire::{SignRequestData, SignResponseData};
use warden_common::WardenResult;

use crate::{middleware::ClientContext, AppState};

use super::{parse_body, parse_ceremony_params};

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/{user}/sign", get(sign_start).post(sign_complete))
}

/// GET /{user}/sign — Mint a challenge over the user's eligible devices.
/// Query: `challenge`, repeatable `handle`, `properties`.
async fn sign_start(
    Extension(ClientContext(client)): Extension<ClientContext>,
    State(state): State<Arc<AppState>>,
    Path(user): Path<String>,
    RawQuery(query): RawQuery,
) -> WardenResult<Json<SignRequestData>> {
    let params = parse_ceremony_params(query.as_deref())?;
    let data = state
        .engine
        .sign_start(
            &client,
            &user,
            params.challenge,
            params.handles,
            params.properties,
        )
        .await?;
    Ok(Json(data))
}

/// POST /{user}/sign — Verify the signature, advance the counter, return
/// the device descriptor. Body: `{signResponse, properties?}`.
async fn sign_complete(
    Extension(ClientContext(client)): Extension<ClientContext>,
    State(state): State<Arc<AppState>>,
    Path(user): Path<String>,
    body: Bytes,
) -> WardenResult<Json<DeviceDescriptor>> {
    let body: SignResponseData = parse_body(&body)?;
    let descriptor = state.engine.sign_complete(&client, &user, body).await?;
    Ok(Json(descriptor))
}
