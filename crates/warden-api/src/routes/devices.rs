//! Per-device administration: descriptor lookup, property updates,
//! deregistration, and the attestation certificate download.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Extension, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use warden_common::models::device::DeviceDescriptor;
use warden_common::models::wire::PropertyUpdate;
use warden_common::validation::validate_handle;
use warden_common::WardenResult;

use crate::{middleware::ClientContext, AppState};

use super::parse_body;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/{user}/{handle}",
            get(get_descriptor).post(set_properties).delete(delete_device),
        )
        .route("/{user}/{handle}/certificate", get(certificate))
}

/// GET /{user}/{handle} — One device's descriptor.
async fn get_descriptor(
    Extension(ClientContext(client)): Extension<ClientContext>,
    State(state): State<Arc<AppState>>,
    Path((user, handle)): Path<(String, String)>,
) -> WardenResult<Json<DeviceDescriptor>> {
    validate_handle(&handle)?;
    Ok(Json(state.engine.get_descriptor(&client, &user, &handle).await?))
}

/// POST /{user}/{handle} — Merge properties (`null` deletes); returns the
/// updated descriptor.
async fn set_properties(
    Extension(ClientContext(client)): Extension<ClientContext>,
    State(state): State<Arc<AppState>>,
    Path((user, handle)): Path<(String, String)>,
    body: Bytes,
) -> WardenResult<Json<DeviceDescriptor>> {
    validate_handle(&handle)?;
    let properties: PropertyUpdate = parse_body(&body)?;
    let descriptor = state
        .engine
        .set_properties(&client, &user, &handle, properties)
        .await?;
    Ok(Json(descriptor))
}

/// DELETE /{user}/{handle} — Deregister a device. Idempotent.
async fn delete_device(
    Extension(ClientContext(client)): Extension<ClientContext>,
    State(state): State<Arc<AppState>>,
    Path((user, handle)): Path<(String, String)>,
) -> WardenResult<StatusCode> {
    validate_handle(&handle)?;
    state.engine.delete_device(&client, &user, &handle).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /{user}/{handle}/certificate — The attestation certificate as PEM.
async fn certificate(
    Extension(ClientContext(client)): Extension<ClientContext>,
    State(state): State<Arc<AppState>>,
    Path((user, handle)): Path<(String, String)>,
) -> WardenResult<Response> {
    validate_handle(&handle)?;
    let pem = state.engine.certificate_pem(&client, &user, &handle).await?;
    Ok((
        [(header::CONTENT_TYPE, "application/x-pem-file")],
        pem,
    )
        .into_response())
}
