//! Attestation certificate model.
//!
//! One row per distinct vendor attestation certificate. Devices from the
//! same hardware batch share a row; deduplication is by SHA-256 fingerprint
//! of the DER encoding.

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// An X.509 attestation certificate as shipped by a device at registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Certificate {
    /// Surrogate id, assigned by the store.
    pub id: i64,

    /// `hex(SHA-256(der))` — the dedup key and the externally exposed value.
    pub fingerprint: String,

    /// DER encoding, stored as standard base64 text.
    pub der: String,
}

impl Certificate {
    /// Decode the stored DER bytes.
    pub fn der_bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        B64.decode(&self.der)
    }

    /// Encode DER bytes for storage.
    pub fn encode_der(der: &[u8]) -> String {
        B64.encode(der)
    }
}

/// Fingerprint of a DER-encoded certificate: `hex(SHA-256(der))`.
pub fn fingerprint(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}
