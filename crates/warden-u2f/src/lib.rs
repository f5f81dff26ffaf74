//! # warden-u2f
//!
//! U2F (FIDO 1.2) raw message primitives: challenge minting, registration
//! verification, and authentication verification per the FIDO U2F v1.2
//! raw-message-format specification.
//!
//! The crate is transport-agnostic. It deals in the JSON objects the
//! `u2f.register` / `u2f.sign` browser APIs produce and consume, plus the
//! server-side request state needed to verify them. Persistence, policy and
//! HTTP live elsewhere.

pub mod soft;

use openssl::bn::BigNumContext;
use openssl::ec::{EcGroup, EcKey, EcPoint, PointConversionForm};
use openssl::ecdsa::EcdsaSig;
use openssl::nid::Nid;
use openssl::pkey::Public;
use openssl::sha;
use openssl::x509::X509;
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// The only U2F protocol version this crate speaks.
pub const U2F_VERSION: &str = "U2F_V2";

/// `typ` value a client data blob must carry for registration.
const TYP_REGISTER: &str = "navigator.id.finishEnrollment";
/// `typ` value a client data blob must carry for authentication.
const TYP_SIGN: &str = "navigator.id.getAssertion";

/// Errors produced while parsing or verifying U2F messages.
#[derive(Debug, thiserror::Error)]
pub enum U2fError {
    #[error("malformed message: {0}")]
    Parse(String),

    #[error("challenge mismatch")]
    ChallengeMismatch,

    #[error("facet not recognized: {0}")]
    UnknownFacet(String),

    #[error("unexpected client data type: {0}")]
    WrongType(String),

    #[error("signature verification failed")]
    BadSignature,

    #[error("unknown key handle")]
    UnknownKeyHandle,

    #[error("crypto error: {0}")]
    Crypto(#[from] openssl::error::ErrorStack),
}

// ============================================================
// Encoding helpers
// ============================================================

/// Encode bytes as websafe base64 (URL-safe alphabet, no padding) as used
/// throughout the U2F JS API.
pub fn websafe_encode(data: &[u8]) -> String {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
    URL_SAFE_NO_PAD.encode(data)
}

/// Decode websafe base64.
pub fn websafe_decode(data: &str) -> Result<Vec<u8>, U2fError> {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
    URL_SAFE_NO_PAD
        .decode(data.trim_end_matches('='))
        .map_err(|e| U2fError::Parse(format!("invalid websafe base64: {e}")))
}

/// Mint `n` random bytes from the OS entropy source.
pub fn rand_bytes(n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    rand::rng().fill_bytes(&mut buf);
    buf
}

mod websafe_bytes {
    //! Serde adapter for byte fields carried as websafe base64 strings.

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&super::websafe_encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        super::websafe_decode(&s).map_err(serde::de::Error::custom)
    }
}

// ============================================================
// Message types
// ============================================================

/// Challenge issued to `u2f.register` for one protocol version.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub version: String,
    pub challenge: String,
}

/// A completed registration: everything the server must remember to verify
/// future signatures from this key.
///
/// Serialized as JSON this is the opaque `bind_data` blob stored per device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registration {
    pub version: String,
    #[serde(with = "websafe_bytes")]
    pub key_handle: Vec<u8>,
    #[serde(with = "websafe_bytes")]
    pub public_key: Vec<u8>,
    pub app_id: String,
}

/// Server-side state for an in-flight registration ceremony.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct U2fRegisterRequest {
    pub app_id: String,
    pub register_requests: Vec<RegisterRequest>,
    pub registered_keys: Vec<Registration>,
}

/// What `u2f.register` hands back on success.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub registration_data: String,
    pub client_data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Server-side state for an in-flight authentication ceremony.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct U2fSignRequest {
    pub app_id: String,
    pub challenge: String,
    pub registered_keys: Vec<Registration>,
}

/// What `u2f.sign` hands back on success.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignResponse {
    pub key_handle: String,
    pub signature_data: String,
    pub client_data: String,
}

/// The subset of the client data JSON the server verifies.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientData {
    pub typ: String,
    pub challenge: String,
    pub origin: String,
}

impl ClientData {
    /// Decode a websafe-base64 client data blob into its parsed form plus
    /// the raw bytes (needed for the signature base).
    pub fn decode(encoded: &str) -> Result<(ClientData, Vec<u8>), U2fError> {
        let raw = websafe_decode(encoded)?;
        let parsed = serde_json::from_slice(&raw)
            .map_err(|e| U2fError::Parse(format!("invalid client data: {e}")))?;
        Ok((parsed, raw))
    }
}

impl RegisterResponse {
    /// Parse the embedded client data without verifying anything.
    pub fn client_data(&self) -> Result<ClientData, U2fError> {
        Ok(ClientData::decode(&self.client_data)?.0)
    }
}

impl SignResponse {
    /// Parse the embedded client data without verifying anything.
    pub fn client_data(&self) -> Result<ClientData, U2fError> {
        Ok(ClientData::decode(&self.client_data)?.0)
    }
}

// ============================================================
// Ceremony begin/complete
// ============================================================

/// Build the server state for a registration ceremony.
pub fn begin_registration(
    app_id: &str,
    registered_keys: Vec<Registration>,
    challenge: &[u8],
) -> U2fRegisterRequest {
    U2fRegisterRequest {
        app_id: app_id.to_owned(),
        register_requests: vec![RegisterRequest {
            version: U2F_VERSION.to_owned(),
            challenge: websafe_encode(challenge),
        }],
        registered_keys,
    }
}

/// Verify a registration response against the stored request.
///
/// Returns the new [`Registration`] and the attestation certificate (DER).
pub fn complete_registration(
    request: &U2fRegisterRequest,
    response: &RegisterResponse,
    valid_facets: &[String],
) -> Result<(Registration, Vec<u8>), U2fError> {
    let (client_data, client_data_raw) = ClientData::decode(&response.client_data)?;
    if client_data.typ != TYP_REGISTER {
        return Err(U2fError::WrongType(client_data.typ));
    }
    let matched = request
        .register_requests
        .iter()
        .find(|r| r.challenge == client_data.challenge)
        .ok_or(U2fError::ChallengeMismatch)?;
    check_facet(&client_data.origin, valid_facets)?;

    let raw = websafe_decode(&response.registration_data)?;
    let parsed = RawRegistration::parse(&raw)?;

    // Signature base per FIDO U2F raw message formats §4.3:
    // 0x00 | sha256(appId) | sha256(clientData) | keyHandle | publicKey
    let mut digest = sha::Sha256::new();
    digest.update(&[0u8]);
    digest.update(&sha::sha256(request.app_id.as_bytes()));
    digest.update(&sha::sha256(&client_data_raw));
    digest.update(parsed.key_handle);
    digest.update(parsed.public_key);
    let digest = digest.finish();

    let signature = EcdsaSig::from_der(parsed.signature)
        .map_err(|e| U2fError::Parse(format!("invalid signature encoding: {e}")))?;
    let cert = X509::from_der(parsed.certificate)
        .map_err(|e| U2fError::Parse(format!("invalid attestation certificate: {e}")))?;
    let cert_key = cert
        .public_key()?
        .ec_key()
        .map_err(|e| U2fError::Parse(format!("attestation key is not EC: {e}")))?;

    if !signature.verify(&digest, &cert_key)? {
        return Err(U2fError::BadSignature);
    }

    // The device key must be a decodable P-256 point.
    decode_public_key(parsed.public_key)?;

    let version = matched.version.clone();
    Ok((
        Registration {
            version,
            key_handle: parsed.key_handle.to_vec(),
            public_key: parsed.public_key.to_vec(),
            app_id: request.app_id.clone(),
        },
        parsed.certificate.to_vec(),
    ))
}

/// Build the server state for an authentication ceremony.
pub fn begin_authentication(
    app_id: &str,
    registered_keys: Vec<Registration>,
    challenge: &[u8],
) -> U2fSignRequest {
    U2fSignRequest {
        app_id: app_id.to_owned(),
        challenge: websafe_encode(challenge),
        registered_keys,
    }
}

/// Verify an authentication response against the stored request.
///
/// Returns the matched registration, the device's signature counter, and the
/// raw user-presence byte.
pub fn complete_authentication(
    request: &U2fSignRequest,
    response: &SignResponse,
    valid_facets: &[String],
) -> Result<(Registration, u32, u8), U2fError> {
    let (client_data, client_data_raw) = ClientData::decode(&response.client_data)?;
    if client_data.typ != TYP_SIGN {
        return Err(U2fError::WrongType(client_data.typ));
    }
    if client_data.challenge != request.challenge {
        return Err(U2fError::ChallengeMismatch);
    }
    check_facet(&client_data.origin, valid_facets)?;

    let key_handle = websafe_decode(&response.key_handle)?;
    let registration = request
        .registered_keys
        .iter()
        .find(|k| k.key_handle == key_handle)
        .ok_or(U2fError::UnknownKeyHandle)?;

    let signature_data = websafe_decode(&response.signature_data)?;
    // presence(1) | counter(u32 BE) | ECDSA signature (DER)
    if signature_data.len() < 5 {
        return Err(U2fError::Parse("signature data too short".into()));
    }
    let presence = signature_data[0];
    let counter = u32::from_be_bytes(
        signature_data[1..5]
            .try_into()
            .map_err(|_| U2fError::Parse("signature data too short".into()))?,
    );

    let signature = EcdsaSig::from_der(&signature_data[5..])
        .map_err(|e| U2fError::Parse(format!("invalid signature encoding: {e}")))?;

    // Signature base per FIDO U2F raw message formats §5.4:
    // sha256(appId) | presence | counter | sha256(clientData)
    let mut digest = sha::Sha256::new();
    digest.update(&sha::sha256(request.app_id.as_bytes()));
    digest.update(&signature_data[0..5]);
    digest.update(&sha::sha256(&client_data_raw));
    let digest = digest.finish();

    let public_key = decode_public_key(&registration.public_key)?;
    if !signature.verify(&digest, &public_key)? {
        return Err(U2fError::BadSignature);
    }

    Ok((registration.clone(), counter, presence))
}

fn check_facet(origin: &str, valid_facets: &[String]) -> Result<(), U2fError> {
    if valid_facets.iter().any(|f| f == origin) {
        Ok(())
    } else {
        Err(U2fError::UnknownFacet(origin.to_owned()))
    }
}

// ============================================================
// Raw registration payload
// ============================================================

/// Borrowed view into the binary registration payload:
/// `0x05 | pubkey(65) | kh_len(1) | key_handle | X.509 DER | signature`.
struct RawRegistration<'a> {
    public_key: &'a [u8],
    key_handle: &'a [u8],
    certificate: &'a [u8],
    signature: &'a [u8],
}

impl<'a> RawRegistration<'a> {
    fn parse(data: &'a [u8]) -> Result<Self, U2fError> {
        if data.len() <= 1 + 65 + 1 + 71 {
            return Err(U2fError::Parse("registration data too short".into()));
        }
        if data[0] != 0x05 {
            return Err(U2fError::Parse(format!(
                "reserved byte is 0x{:02x}, expected 0x05",
                data[0]
            )));
        }
        let public_key = &data[1..66];
        let key_handle_len = usize::from(data[66]);
        let rest = &data[67..];
        if rest.len() <= key_handle_len + 71 {
            return Err(U2fError::Parse("registration data truncated".into()));
        }
        let key_handle = &rest[..key_handle_len];
        let rest = &rest[key_handle_len..];
        if rest[0] != 0x30 {
            return Err(U2fError::Parse(
                "certificate is not a DER SEQUENCE".into(),
            ));
        }
        let cert_len = der_object_len(rest)?;
        if rest.len() < cert_len {
            return Err(U2fError::Parse("certificate truncated".into()));
        }
        let certificate = &rest[..cert_len];
        let signature = &rest[cert_len..];
        Ok(Self {
            public_key,
            key_handle,
            certificate,
            signature,
        })
    }
}

/// Total encoded length (tag + length bytes + content) of the DER object
/// starting at `data[0]`.
fn der_object_len(data: &[u8]) -> Result<usize, U2fError> {
    let err = || U2fError::Parse("invalid DER length".into());
    let first = *data.get(1).ok_or_else(err)?;
    if first < 0x80 {
        return Ok(2 + usize::from(first));
    }
    match first {
        0x81 => {
            let len = usize::from(*data.get(2).ok_or_else(err)?);
            Ok(3 + len)
        }
        0x82 => {
            let hi = usize::from(*data.get(2).ok_or_else(err)?);
            let lo = usize::from(*data.get(3).ok_or_else(err)?);
            Ok(4 + (hi << 8 | lo))
        }
        _ => Err(err()),
    }
}

/// Decode a raw 65-byte uncompressed P-256 point into an EC public key.
fn decode_public_key(data: &[u8]) -> Result<EcKey<Public>, U2fError> {
    if data.len() != 65 {
        return Err(U2fError::Parse(format!(
            "public key length {}, expected 65",
            data.len()
        )));
    }
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
    let mut ctx = BigNumContext::new()?;
    let point = EcPoint::from_bytes(&group, data, &mut ctx)
        .map_err(|e| U2fError::Parse(format!("invalid public key point: {e}")))?;
    let key = EcKey::from_public_key(&group, &point)?;
    key.check_key()?;
    Ok(key)
}

/// Encode an EC public key as a raw 65-byte uncompressed point.
pub(crate) fn encode_public_key(
    key: &EcKey<openssl::pkey::Private>,
) -> Result<Vec<u8>, openssl::error::ErrorStack> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
    let mut ctx = BigNumContext::new()?;
    key.public_key()
        .to_bytes(&group, PointConversionForm::UNCOMPRESSED, &mut ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::soft::SoftToken;

    const APP_ID: &str = "https://example.com";
    const FACET: &str = "https://example.com";

    fn facets() -> Vec<String> {
        vec![FACET.to_owned()]
    }

    #[test]
    fn websafe_round_trip() {
        let data = rand_bytes(57);
        assert_eq!(websafe_decode(&websafe_encode(&data)).unwrap(), data);
        // Padded input is tolerated
        assert_eq!(websafe_decode("YWJjZA==").unwrap(), b"abcd");
    }

    #[test]
    fn register_and_sign_round_trip() {
        let mut token = SoftToken::new().unwrap();
        let challenge = rand_bytes(32);
        let request = begin_registration(APP_ID, vec![], &challenge);
        let response = token
            .register(APP_ID, &request.register_requests[0].challenge, FACET)
            .unwrap();
        let (registration, cert_der) =
            complete_registration(&request, &response, &facets()).unwrap();
        assert_eq!(registration.version, U2F_VERSION);
        assert_eq!(registration.public_key.len(), 65);
        assert!(!cert_der.is_empty());

        let challenge = rand_bytes(32);
        let request = begin_authentication(APP_ID, vec![registration.clone()], &challenge);
        let response = token
            .sign(
                APP_ID,
                &request.challenge,
                FACET,
                &registration.key_handle,
            )
            .unwrap();
        let (matched, counter, presence) =
            complete_authentication(&request, &response, &facets()).unwrap();
        assert_eq!(matched.key_handle, registration.key_handle);
        assert_eq!(counter, 1);
        assert_eq!(presence, 1);
    }

    #[test]
    fn register_rejects_wrong_origin() {
        let mut token = SoftToken::new().unwrap();
        let request = begin_registration(APP_ID, vec![], &rand_bytes(32));
        let response = token
            .register(APP_ID, &request.register_requests[0].challenge, "https://evil.example")
            .unwrap();
        assert!(matches!(
            complete_registration(&request, &response, &facets()),
            Err(U2fError::UnknownFacet(_))
        ));
    }

    #[test]
    fn register_rejects_wrong_challenge() {
        let mut token = SoftToken::new().unwrap();
        let request = begin_registration(APP_ID, vec![], &rand_bytes(32));
        let response = token
            .register(APP_ID, &websafe_encode(&rand_bytes(32)), FACET)
            .unwrap();
        assert!(matches!(
            complete_registration(&request, &response, &facets()),
            Err(U2fError::ChallengeMismatch)
        ));
    }

    #[test]
    fn register_rejects_tampered_payload() {
        let mut token = SoftToken::new().unwrap();
        let request = begin_registration(APP_ID, vec![], &rand_bytes(32));
        let mut response = token
            .register(APP_ID, &request.register_requests[0].challenge, FACET)
            .unwrap();
        let mut raw = websafe_decode(&response.registration_data).unwrap();
        raw[10] ^= 0xff; // flip a public key byte
        response.registration_data = websafe_encode(&raw);
        assert!(complete_registration(&request, &response, &facets()).is_err());
    }

    #[test]
    fn sign_rejects_unknown_key_handle() {
        let mut token = SoftToken::new().unwrap();
        let request = begin_registration(APP_ID, vec![], &rand_bytes(32));
        let response = token
            .register(APP_ID, &request.register_requests[0].challenge, FACET)
            .unwrap();
        let (registration, _) = complete_registration(&request, &response, &facets()).unwrap();

        let request = begin_authentication(APP_ID, vec![registration.clone()], &rand_bytes(32));
        let response = token
            .sign(APP_ID, &request.challenge, FACET, &registration.key_handle)
            .unwrap();
        let mut bogus = request.clone();
        bogus.registered_keys[0].key_handle = rand_bytes(32);
        assert!(matches!(
            complete_authentication(&bogus, &response, &facets()),
            Err(U2fError::UnknownKeyHandle)
        ));
    }

    #[test]
    fn sign_rejects_foreign_key_signature() {
        // A response signed by one key but claiming another's handle fails.
        let mut token = SoftToken::new().unwrap();
        let request = begin_registration(APP_ID, vec![], &rand_bytes(32));
        let response = token
            .register(APP_ID, &request.register_requests[0].challenge, FACET)
            .unwrap();
        let (reg_a, _) = complete_registration(&request, &response, &facets()).unwrap();

        let request = begin_registration(APP_ID, vec![reg_a.clone()], &rand_bytes(32));
        let response = token
            .register(APP_ID, &request.register_requests[0].challenge, FACET)
            .unwrap();
        let (reg_b, _) = complete_registration(&request, &response, &facets()).unwrap();

        let request = begin_authentication(APP_ID, vec![reg_a.clone(), reg_b], &rand_bytes(32));
        let mut response = token
            .sign(APP_ID, &request.challenge, FACET, &reg_a.key_handle)
            .unwrap();
        // Swap in a different registered handle without re-signing.
        response.key_handle = websafe_encode(&request.registered_keys[1].key_handle);
        assert!(matches!(
            complete_authentication(&request, &response, &facets()),
            Err(U2fError::BadSignature)
        ));
    }

    #[test]
    fn bind_data_json_shape_is_stable() {
        let mut token = SoftToken::new().unwrap();
        let request = begin_registration(APP_ID, vec![], &rand_bytes(32));
        let response = token
            .register(APP_ID, &request.register_requests[0].challenge, FACET)
            .unwrap();
        let (registration, _) = complete_registration(&request, &response, &facets()).unwrap();

        let json = serde_json::to_value(&registration).unwrap();
        assert_eq!(json["version"], U2F_VERSION);
        assert_eq!(json["appId"], APP_ID);
        assert!(json["keyHandle"].is_string());
        assert!(json["publicKey"].is_string());

        let back: Registration = serde_json::from_value(json).unwrap();
        assert_eq!(back.key_handle, registration.key_handle);
        assert_eq!(back.public_key, registration.public_key);
    }
}
