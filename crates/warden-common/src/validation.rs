//! Input validation for the identifiers this service mints or accepts:
//! device handles, user names, and property keys. Derived `validator`
//! failures convert into the error envelope through
//! `WardenError::from(ValidationErrors)`.

use std::sync::LazyLock;

use crate::error::WardenError;
use crate::models::user::MAX_USER_NAME_LEN;

static HANDLE_REGEX: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"^[a-f0-9]{32}$").unwrap());

/// Longest accepted property key, in bytes.
pub const MAX_PROPERTY_KEY_LEN: usize = 40;

/// Device handles are exactly 32 lowercase hex chars.
pub fn validate_handle(handle: &str) -> Result<(), WardenError> {
    if HANDLE_REGEX.is_match(handle) {
        Ok(())
    } else {
        Err(WardenError::BadInput(format!(
            "Invalid device handle: {handle}"
        )))
    }
}

/// User names are opaque but bounded; longer names are rejected rather than
/// hashed so that distinct principals can never alias.
pub fn validate_user_name(name: &str) -> Result<(), WardenError> {
    if name.is_empty() {
        return Err(WardenError::BadInput("User name must not be empty".into()));
    }
    if name.len() > MAX_USER_NAME_LEN {
        return Err(WardenError::BadInput(format!(
            "User name exceeds {MAX_USER_NAME_LEN} bytes"
        )));
    }
    Ok(())
}

/// Property keys are bounded to keep the child table sane.
pub fn validate_property_key(key: &str) -> Result<(), WardenError> {
    if key.is_empty() || key.len() > MAX_PROPERTY_KEY_LEN {
        return Err(WardenError::BadInput(format!(
            "Invalid property key: {key}"
        )));
    }
    Ok(())
}
