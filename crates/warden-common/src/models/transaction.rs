//! Pending-ceremony model.
//!
//! A transaction records an in-flight register or sign ceremony between the
//! start and complete calls. Keyed by `hex(SHA-256(challenge))` so the
//! column width is fixed regardless of caller-supplied challenge length.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// An in-flight ceremony.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    /// Surrogate id, assigned by the store.
    pub id: i64,

    pub user_id: i64,

    /// `hex(SHA-256(challenge))`. Unique.
    pub transaction_id: String,

    /// Opaque JSON payload: the original request object plus per-ceremony
    /// metadata (`handleMap`, `properties`).
    pub data: String,

    pub created_at: DateTime<Utc>,
}

/// Derive the transaction key for a challenge.
pub fn transaction_id(challenge: &[u8]) -> String {
    hex::encode(Sha256::digest(challenge))
}
