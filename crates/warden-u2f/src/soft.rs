//! A software U2F token.
//!
//! Behaves like a hardware key far enough to drive full registration and
//! authentication ceremonies: fresh P-256 key pair per key handle, a
//! self-signed attestation certificate shared by every key the token mints,
//! and a signature counter that can be reset to simulate a cloned device.
//!
//! Intended for tests and development; nothing here stores key material
//! securely.

use std::collections::HashMap;

use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::ec::{EcGroup, EcKey};
use openssl::ecdsa::EcdsaSig;
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::sha;
use openssl::x509::{X509, X509NameBuilder};

use crate::{
    encode_public_key, rand_bytes, websafe_decode, websafe_encode, RegisterResponse,
    SignResponse, U2fError, U2F_VERSION,
};

/// Length of the key handles this token emits.
const KEY_HANDLE_LEN: usize = 64;

/// A simulated U2F device.
pub struct SoftToken {
    attestation_cert: X509,
    attestation_key: EcKey<Private>,
    keys: HashMap<Vec<u8>, EcKey<Private>>,
    counter: u32,
}

impl SoftToken {
    /// Create a token with a fresh self-signed attestation certificate.
    pub fn new() -> Result<Self, ErrorStack> {
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
        let attestation_key = EcKey::generate(&group)?;
        let attestation_cert = self_signed_cert(&attestation_key)?;
        Ok(Self {
            attestation_cert,
            attestation_key,
            keys: HashMap::new(),
            counter: 0,
        })
    }

    /// The attestation certificate in DER form, as it appears inside
    /// registration payloads.
    pub fn attestation_cert_der(&self) -> Result<Vec<u8>, ErrorStack> {
        self.attestation_cert.to_der()
    }

    /// The attestation certificate in PEM form, for metadata files.
    pub fn attestation_cert_pem(&self) -> Result<Vec<u8>, ErrorStack> {
        self.attestation_cert.to_pem()
    }

    /// Force the signature counter, e.g. back to a lower value to simulate a
    /// cloned device.
    pub fn set_counter(&mut self, counter: u32) {
        self.counter = counter;
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }

    /// Answer a registration challenge: mint a key pair, remember it under a
    /// fresh key handle, and produce the signed registration payload.
    pub fn register(
        &mut self,
        app_id: &str,
        challenge: &str,
        origin: &str,
    ) -> Result<RegisterResponse, U2fError> {
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
        let key = EcKey::generate(&group)?;
        let public_key = encode_public_key(&key)?;
        let key_handle = rand_bytes(KEY_HANDLE_LEN);

        let client_data = client_data_json("navigator.id.finishEnrollment", challenge, origin);

        let mut digest = sha::Sha256::new();
        digest.update(&[0u8]);
        digest.update(&sha::sha256(app_id.as_bytes()));
        digest.update(&sha::sha256(client_data.as_bytes()));
        digest.update(&key_handle);
        digest.update(&public_key);
        let signature = EcdsaSig::sign(&digest.finish(), &self.attestation_key)?.to_der()?;

        let cert_der = self.attestation_cert.to_der()?;
        let mut payload = Vec::with_capacity(67 + key_handle.len() + cert_der.len() + signature.len());
        payload.push(0x05);
        payload.extend_from_slice(&public_key);
        payload.push(key_handle.len() as u8);
        payload.extend_from_slice(&key_handle);
        payload.extend_from_slice(&cert_der);
        payload.extend_from_slice(&signature);

        self.keys.insert(key_handle, key);

        Ok(RegisterResponse {
            registration_data: websafe_encode(&payload),
            client_data: websafe_encode(client_data.as_bytes()),
            version: Some(U2F_VERSION.to_owned()),
        })
    }

    /// Answer an authentication challenge with the key behind `key_handle`,
    /// incrementing the signature counter.
    pub fn sign(
        &mut self,
        app_id: &str,
        challenge: &str,
        origin: &str,
        key_handle: &[u8],
    ) -> Result<SignResponse, U2fError> {
        let key = self.keys.get(key_handle).ok_or(U2fError::UnknownKeyHandle)?;
        self.counter += 1;

        let client_data = client_data_json("navigator.id.getAssertion", challenge, origin);

        let mut head = Vec::with_capacity(5);
        head.push(0x01); // user presence
        head.extend_from_slice(&self.counter.to_be_bytes());

        let mut digest = sha::Sha256::new();
        digest.update(&sha::sha256(app_id.as_bytes()));
        digest.update(&head);
        digest.update(&sha::sha256(client_data.as_bytes()));
        let signature = EcdsaSig::sign(&digest.finish(), key)?.to_der()?;

        let mut payload = head;
        payload.extend_from_slice(&signature);

        Ok(SignResponse {
            key_handle: websafe_encode(key_handle),
            signature_data: websafe_encode(&payload),
            client_data: websafe_encode(client_data.as_bytes()),
        })
    }

    /// Like [`sign`](Self::sign), but taking the websafe-encoded handle as it
    /// appears in sign request DTOs.
    pub fn sign_websafe(
        &mut self,
        app_id: &str,
        challenge: &str,
        origin: &str,
        key_handle: &str,
    ) -> Result<SignResponse, U2fError> {
        let handle = websafe_decode(key_handle)?;
        self.sign(app_id, challenge, origin, &handle)
    }
}

fn client_data_json(typ: &str, challenge: &str, origin: &str) -> String {
    serde_json::json!({
        "typ": typ,
        "challenge": challenge,
        "origin": origin,
    })
    .to_string()
}

fn self_signed_cert(key: &EcKey<Private>) -> Result<X509, ErrorStack> {
    let pkey = PKey::from_ec_key(key.clone())?;

    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_text("CN", "Warden Soft Token")?;
    let name = name.build();

    let mut builder = X509::builder()?;
    builder.set_version(2)?;
    let serial = BigNum::from_u32(1)?.to_asn1_integer()?;
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    builder.set_pubkey(&pkey)?;
    let not_before = Asn1Time::days_from_now(0)?;
    builder.set_not_before(&not_before)?;
    let not_after = Asn1Time::days_from_now(3650)?;
    builder.set_not_after(&not_after)?;
    builder.sign(&pkey, MessageDigest::sha256())?;
    Ok(builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_increments_and_resets() {
        let mut token = SoftToken::new().unwrap();
        let request = crate::begin_registration("https://example.com", vec![], &rand_bytes(32));
        let response = token
            .register(
                "https://example.com",
                &request.register_requests[0].challenge,
                "https://example.com",
            )
            .unwrap();
        let (registration, _) = crate::complete_registration(
            &request,
            &response,
            &["https://example.com".to_owned()],
        )
        .unwrap();

        for expected in 1..=3u32 {
            let sign = crate::begin_authentication(
                "https://example.com",
                vec![registration.clone()],
                &rand_bytes(32),
            );
            let response = token
                .sign(
                    "https://example.com",
                    &sign.challenge,
                    "https://example.com",
                    &registration.key_handle,
                )
                .unwrap();
            let (_, counter, _) = crate::complete_authentication(
                &sign,
                &response,
                &["https://example.com".to_owned()],
            )
            .unwrap();
            assert_eq!(counter, expected);
        }

        token.set_counter(0);
        assert_eq!(token.counter(), 0);
    }

    #[test]
    fn same_token_reuses_attestation_cert() {
        let mut token = SoftToken::new().unwrap();
        let der = token.attestation_cert_der().unwrap();

        let request = crate::begin_registration("https://example.com", vec![], &rand_bytes(32));
        let response = token
            .register(
                "https://example.com",
                &request.register_requests[0].challenge,
                "https://example.com",
            )
            .unwrap();
        let (_, cert_der) = crate::complete_registration(
            &request,
            &response,
            &["https://example.com".to_owned()],
        )
        .unwrap();
        assert_eq!(cert_der, der);
    }
}
