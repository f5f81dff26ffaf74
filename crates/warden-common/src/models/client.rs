//! Client model — the relying-party layer.
//!
//! A client is an application with its own user base that delegates U2F
//! ceremonies to this service. Clients are created out-of-band (CLI); the
//! REST surface only ever acts *as* a client, never on one.

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

/// A relying party registered with this service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    /// Surrogate id, assigned by the store.
    pub id: i64,

    /// Stable external identifier, unique (3–40 chars, `[a-zA-Z0-9._-]`).
    pub name: String,

    /// The U2F AppID — an absolute URL bound into every signature.
    pub app_id: String,

    /// Origins a U2F client may legitimately report. Never empty.
    pub valid_facets: Vec<String>,
}

/// Parameters for creating or updating a client (CLI/admin surface).
#[derive(Debug, Deserialize, Validate)]
pub struct NewClient {
    #[validate(length(min = 3, max = 40, message = "Client names must be 3-40 characters"))]
    #[validate(regex(
        path = *CLIENT_NAME_REGEX,
        message = "Client names may only contain the characters a-z, A-Z, 0-9, \".\", \"_\", and \"-\""
    ))]
    pub name: String,

    #[validate(url(message = "AppID must be an absolute URL"))]
    pub app_id: String,

    #[validate(custom(function = validate_facets))]
    pub facets: Vec<String>,
}

fn validate_facets(facets: &Vec<String>) -> Result<(), ValidationError> {
    if facets.is_empty() {
        let mut err = ValidationError::new("facets");
        err.message = Some("At least one facet is required".into());
        return Err(err);
    }
    for facet in facets {
        if url::Url::parse(facet).is_err() {
            let mut err = ValidationError::new("facets");
            err.message = Some(format!("Facet is not a valid URL: {facet}").into());
            return Err(err);
        }
    }
    Ok(())
}

use std::sync::LazyLock;
static CLIENT_NAME_REGEX: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"^[a-zA-Z0-9._-]{3,}$").unwrap());

#[cfg(test)]
mod tests {
    use super::*;

    fn new_client(name: &str) -> NewClient {
        NewClient {
            name: name.into(),
            app_id: "https://example.com".into(),
            facets: vec!["https://example.com".into()],
        }
    }

    #[test]
    fn accepts_well_formed_names() {
        for name in ["abc", "foo.bar", "a_b-c.9", "fooclient"] {
            assert!(new_client(name).validate().is_ok(), "{name} should be valid");
        }
    }

    #[test]
    fn rejects_bad_names() {
        for name in ["ab", "has space", "naughty/../path", &"x".repeat(41)] {
            assert!(new_client(name).validate().is_err(), "{name} should be rejected");
        }
    }

    #[test]
    fn rejects_empty_or_malformed_facets() {
        let mut c = new_client("fooclient");
        c.facets = vec![];
        assert!(c.validate().is_err());
        c.facets = vec!["not a url".into()];
        assert!(c.validate().is_err());
    }
}
