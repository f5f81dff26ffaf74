//! Route handlers, organized by resource.

pub mod devices;
pub mod register;
pub mod sign;
pub mod users;

use warden_common::models::wire::PropertyUpdate;
use warden_common::{WardenError, WardenResult};
use warden_u2f::websafe_decode;

/// Query parameters of the ceremony-start endpoints.
///
/// Parsed by hand because `handle` repeats and `properties` is URL-encoded
/// JSON — neither fits the derived form decoders.
#[derive(Debug, Default)]
pub(crate) struct CeremonyParams {
    /// Caller-supplied challenge bytes (websafe base64 on the wire).
    pub challenge: Option<Vec<u8>>,
    /// Device handles to restrict a sign ceremony to.
    pub handles: Vec<String>,
    /// Initial properties, applied below completion-body properties.
    pub properties: PropertyUpdate,
}

pub(crate) fn parse_ceremony_params(query: Option<&str>) -> WardenResult<CeremonyParams> {
    let mut params = CeremonyParams::default();
    let Some(query) = query else {
        return Ok(params);
    };
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        match key.as_ref() {
            "challenge" => {
                let bytes = websafe_decode(&value)
                    .map_err(|e| WardenError::BadInput(format!("Invalid challenge: {e}")))?;
                params.challenge = Some(bytes);
            }
            "handle" => params.handles.push(value.into_owned()),
            "properties" => {
                params.properties = serde_json::from_str(&value)
                    .map_err(|e| WardenError::BadInput(format!("Invalid properties: {e}")))?;
            }
            _ => {}
        }
    }
    Ok(params)
}

/// Decode a JSON request body into `T`, reporting failures in the protocol
/// error envelope rather than the framework's.
pub(crate) fn parse_body<T: serde::de::DeserializeOwned>(body: &[u8]) -> WardenResult<T> {
    serde_json::from_slice(body)
        .map_err(|e| WardenError::BadInput(format!("Malformed request: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_repeated_handles_and_json_properties() {
        let params = parse_ceremony_params(Some(
            "handle=aa&handle=bb&properties=%7B%22foo%22%3A%22bar%22%2C%22gone%22%3Anull%7D",
        ))
        .unwrap();
        assert_eq!(params.handles, vec!["aa", "bb"]);
        assert_eq!(params.properties["foo"], Some("bar".to_owned()));
        assert_eq!(params.properties["gone"], None);
        assert!(params.challenge.is_none());
    }

    #[test]
    fn challenge_round_trips_verbatim() {
        let params = parse_ceremony_params(Some("challenge=ThisIsAChallenge")).unwrap();
        let bytes = params.challenge.unwrap();
        assert_eq!(warden_u2f::websafe_encode(&bytes), "ThisIsAChallenge");
    }

    #[test]
    fn rejects_malformed_values() {
        assert!(parse_ceremony_params(Some("challenge=%21%40%23")).is_err());
        assert!(parse_ceremony_params(Some("properties=notjson")).is_err());
    }
}
