//! Wire DTOs — the JSON objects exchanged with relying-party clients.
//!
//! Field names follow the U2F JS API conventions (`camelCase`, websafe
//! base64 for binary values).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use warden_u2f::{RegisterRequest, RegisterResponse, SignResponse};

use crate::models::device::DeviceDescriptor;

/// Property update map: `null` deletes the key, any other value sets it.
pub type PropertyUpdate = HashMap<String, Option<String>>;

// ============================================================
// Trusted facets
// ============================================================

/// Response to `GET /` — consumed by the U2F client's origin check.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustedFacetsResponse {
    pub trusted_facets: Vec<TrustedFacets>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TrustedFacets {
    pub version: FacetsVersion,
    pub ids: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FacetsVersion {
    pub major: u32,
    pub minor: u32,
}

impl TrustedFacetsResponse {
    pub fn new(ids: Vec<String>) -> Self {
        Self {
            trusted_facets: vec![TrustedFacets {
                version: FacetsVersion { major: 1, minor: 0 },
                ids,
            }],
        }
    }
}

// ============================================================
// Registered keys
// ============================================================

/// Client-facing view of an already-enrolled key, as passed to `u2f.sign`
/// and `u2f.register` (duplicate-enrollment refusal).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredKey {
    pub version: String,
    pub key_handle: String,
    pub transports: Vec<String>,
    /// Omitted when it equals the client's primary AppID.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
}

// ============================================================
// Ceremony DTOs
// ============================================================

/// Server→client payload starting a registration ceremony.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequestData {
    pub app_id: String,
    pub register_requests: Vec<RegisterRequest>,
    pub registered_keys: Vec<RegisteredKey>,
    pub descriptors: Vec<DeviceDescriptor>,
}

/// Client→server body completing a registration ceremony.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponseData {
    pub register_response: RegisterResponse,
    #[serde(default)]
    pub properties: PropertyUpdate,
}

/// Server→client payload starting a sign ceremony.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignRequestData {
    pub app_id: String,
    pub challenge: String,
    pub registered_keys: Vec<RegisteredKey>,
    pub descriptors: Vec<DeviceDescriptor>,
}

/// Client→server body completing a sign ceremony.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignResponseData {
    pub sign_response: SignResponse,
    #[serde(default)]
    pub properties: PropertyUpdate,
}
