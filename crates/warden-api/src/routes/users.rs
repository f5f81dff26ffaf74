//! Trusted facets and per-user device enumeration.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use warden_common::models::device::DeviceDescriptor;
use warden_common::models::wire::TrustedFacetsResponse;
use warden_common::WardenResult;

use crate::{middleware::ClientContext, AppState};

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(trusted_facets))
        .route("/{user}", get(list_descriptors).delete(delete_user))
}

/// GET / — The trusted facet list the U2F client checks origins against.
async fn trusted_facets(
    Extension(ClientContext(client)): Extension<ClientContext>,
    State(state): State<Arc<AppState>>,
) -> Json<TrustedFacetsResponse> {
    Json(state.engine.trusted_facets(&client))
}

/// GET /{user} — All device descriptors; `[]` for users that don't exist yet.
async fn list_descriptors(
    Extension(ClientContext(client)): Extension<ClientContext>,
    State(state): State<Arc<AppState>>,
    Path(user): Path<String>,
) -> WardenResult<Json<Vec<DeviceDescriptor>>> {
    Ok(Json(state.engine.descriptors(&client, &user).await?))
}

/// DELETE /{user} — Remove the user and every device. Idempotent.
async fn delete_user(
    Extension(ClientContext(client)): Extension<ClientContext>,
    State(state): State<Arc<AppState>>,
    Path(user): Path<String>,
) -> WardenResult<StatusCode> {
    state.engine.delete_user(&client, &user).await?;
    Ok(StatusCode::NO_CONTENT)
}
