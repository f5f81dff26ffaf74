//! Attestation service.
//!
//! Resolves a device's attestation certificate against a set of trusted
//! metadata files and answers two questions: is this device model trusted,
//! and what vendor/device information should descriptors carry.
//!
//! A metadata file is JSON of the shape:
//!
//! ```json
//! {
//!   "identifier": "yubico",
//!   "vendorInfo": { "name": "Yubico" },
//!   "trustedCertificates": ["-----BEGIN CERTIFICATE-----…"],
//!   "devices": [
//!     { "deviceInfo": { "displayName": "YubiKey 4" },
//!       "transports": 5,
//!       "fingerprints": ["ab12…"] }
//!   ]
//! }
//! ```
//!
//! A certificate is trusted when it is byte-identical to, or its signature
//! verifies against, any `trustedCertificates` entry. Resolution results —
//! including "no match" — are cached in a bounded LRU keyed by the
//! certificate fingerprint, since the same hardware batch ships the same
//! certificate to every device.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use openssl::x509::X509;
use serde::Deserialize;
use warden_common::models::certificate::fingerprint;

/// How many distinct certificates the resolution cache holds.
const CACHE_SIZE: usize = 64;

/// What the metadata says about one attestation certificate.
#[derive(Debug, Clone)]
pub struct AttestationRecord {
    pub trusted: bool,
    pub vendor_info: Option<serde_json::Value>,
    pub device_info: Option<serde_json::Value>,
    /// Transport bitfield declared for the device model, if any.
    pub transports: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetadataFile {
    #[serde(default)]
    #[allow(dead_code)]
    identifier: Option<String>,
    #[serde(default)]
    vendor_info: Option<serde_json::Value>,
    #[serde(default)]
    trusted_certificates: Vec<String>,
    #[serde(default)]
    devices: Vec<MetadataDevice>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetadataDevice {
    #[serde(default)]
    device_info: Option<serde_json::Value>,
    #[serde(default)]
    transports: Option<i64>,
    /// Hex SHA-256 fingerprints of exact certificates this entry covers.
    #[serde(default)]
    fingerprints: Vec<String>,
}

struct MetadataEntry {
    vendor_info: Option<serde_json::Value>,
    trusted_certs: Vec<X509>,
    devices: Vec<MetadataDevice>,
}

/// Resolver + cache over the loaded metadata set.
pub struct AttestationService {
    entries: Vec<MetadataEntry>,
    cache: Mutex<LruCache>,
}

impl AttestationService {
    /// Load metadata from a file or directory of files. `None`, a missing
    /// path, or an empty directory yield a service that trusts nothing.
    pub fn load(location: Option<&str>) -> Result<Self> {
        let mut entries = Vec::new();
        if let Some(location) = location {
            let path = Path::new(location);
            if path.is_file() {
                entries.push(load_entry(path)?);
            } else if path.is_dir() {
                for entry in std::fs::read_dir(path)
                    .with_context(|| format!("reading metadata directory {location}"))?
                {
                    let file = entry?.path();
                    if file.is_file() {
                        entries.push(load_entry(&file)?);
                    }
                }
            }
        }
        if entries.is_empty() {
            tracing::info!("No attestation metadata loaded; all devices are untrusted");
        } else {
            tracing::info!("Loaded {} attestation metadata file(s)", entries.len());
        }
        Ok(Self {
            entries,
            cache: Mutex::new(LruCache::new(CACHE_SIZE)),
        })
    }

    /// Resolve a certificate to its attestation record, if the metadata
    /// knows the device model. Cached by certificate fingerprint, misses
    /// included.
    pub fn get_attestation(&self, cert_der: &[u8]) -> Option<Arc<AttestationRecord>> {
        let key = fingerprint(cert_der);
        if let Ok(mut cache) = self.cache.lock() {
            if let Some(cached) = cache.get(&key) {
                return cached;
            }
        }
        let resolved = self.resolve(cert_der, &key).map(Arc::new);
        if let Ok(mut cache) = self.cache.lock() {
            cache.put(key, resolved.clone());
        }
        resolved
    }

    /// Descriptor metadata projection: `{"vendor": …, "device": …}` with
    /// absent halves omitted, or `None` when the certificate resolves to
    /// nothing useful.
    pub fn get_metadata(&self, cert_der: &[u8]) -> Option<serde_json::Value> {
        let record = self.get_attestation(cert_der)?;
        let mut data = serde_json::Map::new();
        if let Some(vendor) = &record.vendor_info {
            data.insert("vendor".to_owned(), vendor.clone());
        }
        if let Some(device) = &record.device_info {
            data.insert("device".to_owned(), device.clone());
        }
        if data.is_empty() {
            None
        } else {
            Some(serde_json::Value::Object(data))
        }
    }

    fn resolve(&self, cert_der: &[u8], cert_fingerprint: &str) -> Option<AttestationRecord> {
        let cert = X509::from_der(cert_der).ok()?;
        for entry in &self.entries {
            let trusted = entry.trusted_certs.iter().any(|trusted| {
                if trusted.to_der().map(|der| der == cert_der).unwrap_or(false) {
                    return true;
                }
                trusted
                    .public_key()
                    .and_then(|key| cert.verify(&key))
                    .unwrap_or(false)
            });
            if !trusted {
                continue;
            }
            let device = entry
                .devices
                .iter()
                .find(|d| d.fingerprints.iter().any(|fp| fp == cert_fingerprint))
                .or_else(|| match entry.devices.as_slice() {
                    [only] => Some(only),
                    _ => None,
                });
            return Some(AttestationRecord {
                trusted: true,
                vendor_info: entry.vendor_info.clone(),
                device_info: device.and_then(|d| d.device_info.clone()),
                transports: device.and_then(|d| d.transports),
            });
        }
        None
    }
}

fn load_entry(path: &Path) -> Result<MetadataEntry> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading metadata file {}", path.display()))?;
    let file: MetadataFile = serde_json::from_str(&raw)
        .with_context(|| format!("parsing metadata file {}", path.display()))?;
    let mut trusted_certs = Vec::new();
    for pem in &file.trusted_certificates {
        trusted_certs.push(
            X509::from_pem(pem.as_bytes())
                .with_context(|| format!("invalid certificate in {}", path.display()))?,
        );
    }
    Ok(MetadataEntry {
        vendor_info: file.vendor_info,
        trusted_certs,
        devices: file.devices,
    })
}

// ============================================================
// Bounded LRU
// ============================================================

/// Small LRU: recently touched keys migrate to the back of the order queue,
/// the front is evicted at capacity.
struct LruCache {
    capacity: usize,
    map: HashMap<String, Option<Arc<AttestationRecord>>>,
    order: VecDeque<String>,
}

impl LruCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            map: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Outer `None` = not cached; inner `None` = cached "no record" sentinel.
    fn get(&mut self, key: &str) -> Option<Option<Arc<AttestationRecord>>> {
        let value = self.map.get(key)?.clone();
        self.touch(key);
        Some(value)
    }

    fn put(&mut self, key: String, value: Option<Arc<AttestationRecord>>) {
        if self.map.insert(key.clone(), value).is_none() {
            self.order.push_back(key);
            if self.order.len() > self.capacity {
                if let Some(evicted) = self.order.pop_front() {
                    self.map.remove(&evicted);
                }
            }
        } else {
            self.touch(&key);
        }
    }

    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            if let Some(k) = self.order.remove(pos) {
                self.order.push_back(k);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_u2f::soft::SoftToken;

    fn service_for(token: &SoftToken) -> AttestationService {
        let pem = String::from_utf8(token.attestation_cert_pem().unwrap()).unwrap();
        let file: MetadataFile = serde_json::from_value(serde_json::json!({
            "identifier": "soft",
            "vendorInfo": { "name": "Soft Vendor" },
            "trustedCertificates": [pem],
            "devices": [
                { "deviceInfo": { "displayName": "Soft Token" }, "transports": 3 }
            ]
        }))
        .unwrap();
        let trusted_certs = file
            .trusted_certificates
            .iter()
            .map(|p| X509::from_pem(p.as_bytes()).unwrap())
            .collect();
        AttestationService {
            entries: vec![MetadataEntry {
                vendor_info: file.vendor_info,
                trusted_certs,
                devices: file.devices,
            }],
            cache: Mutex::new(LruCache::new(4)),
        }
    }

    #[test]
    fn known_certificate_resolves_trusted() {
        let token = SoftToken::new().unwrap();
        let service = service_for(&token);
        let der = token.attestation_cert_der().unwrap();

        let record = service.get_attestation(&der).expect("record");
        assert!(record.trusted);
        assert_eq!(record.transports, Some(3));

        let metadata = service.get_metadata(&der).expect("metadata");
        assert_eq!(metadata["vendor"]["name"], "Soft Vendor");
        assert_eq!(metadata["device"]["displayName"], "Soft Token");
    }

    #[test]
    fn unknown_certificate_resolves_none_and_is_cached() {
        let trusted = SoftToken::new().unwrap();
        let service = service_for(&trusted);
        let stranger = SoftToken::new().unwrap();
        let der = stranger.attestation_cert_der().unwrap();

        assert!(service.get_attestation(&der).is_none());
        // The miss sentinel is now cached.
        let cache = service.cache.lock().unwrap();
        assert!(cache.map.contains_key(&fingerprint(&der)));
    }

    #[test]
    fn empty_service_trusts_nothing() {
        let service = AttestationService::load(None).unwrap();
        let token = SoftToken::new().unwrap();
        assert!(service
            .get_attestation(&token.attestation_cert_der().unwrap())
            .is_none());
    }

    #[test]
    fn lru_evicts_oldest_and_touch_refreshes() {
        let mut cache = LruCache::new(2);
        cache.put("a".into(), None);
        cache.put("b".into(), None);
        assert!(cache.get("a").is_some()); // refresh "a"
        cache.put("c".into(), None); // evicts "b"
        assert!(cache.get("b").is_none());
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_some());
    }
}
