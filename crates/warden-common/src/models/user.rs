//! User model.
//!
//! A user is an opaque identifier scoped to one client. The relying party
//! owns the real identity; this service only keys device state by it. Rows
//! are created lazily the first time a ceremony is started for the name.

use serde::{Deserialize, Serialize};

/// Longest accepted user name, in bytes. Longer names are rejected.
pub const MAX_USER_NAME_LEN: usize = 40;

/// An end-user of one relying-party client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// Surrogate id, assigned by the store.
    pub id: i64,

    /// Owning client.
    pub client_id: i64,

    /// Opaque identifier supplied by the relying party. Unique per client.
    pub name: String,
}
