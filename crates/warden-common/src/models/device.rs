//! Device model — a registered security key and its descriptor projection.

use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Transport channels a device declares in its attestation metadata.
///
/// Stored as a bitfield; serialized as the lowercase names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transport(i64);

bitflags::bitflags! {
    impl Transport: i64 {
        const USB = 1 << 0;
        const NFC = 1 << 1;
        const BLE = 1 << 2;
        const INTERNAL = 1 << 3;
    }
}

impl Transport {
    /// All transports, in canonical serialization order.
    const NAMED: [(Transport, &'static str); 4] = [
        (Transport::USB, "usb"),
        (Transport::NFC, "nfc"),
        (Transport::BLE, "ble"),
        (Transport::INTERNAL, "internal"),
    ];

    /// The lowercase names of every set bit.
    pub fn names(self) -> Vec<String> {
        Self::NAMED
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| (*name).to_owned())
            .collect()
    }
}

/// A registered security key belonging to one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    /// Surrogate id, assigned by the store.
    pub id: i64,

    /// Externally visible opaque id: 32 hex chars (128-bit random). Unique.
    pub handle: String,

    pub user_id: i64,

    /// Opaque JSON blob from the U2F primitive layer: key handle, public
    /// key, and AppID — everything needed to verify future signatures.
    pub bind_data: String,

    /// The (shared) attestation certificate row.
    pub certificate_id: i64,

    /// Latched to true on counter violation; never cleared.
    pub compromised: bool,

    /// Device signature counter after the last accepted sign; None before
    /// the first one. Unsigned 32-bit value held in 64 bits.
    pub counter: Option<i64>,

    /// Transport bitfield ([`Transport`]).
    pub transports: i64,

    pub created_at: DateTime<Utc>,

    /// Set on each successful sign completion; None until the first.
    pub authenticated_at: Option<DateTime<Utc>>,
}

impl Device {
    pub fn transport_names(&self) -> Vec<String> {
        Transport::from_bits_truncate(self.transports).names()
    }

    /// Build the wire-facing descriptor for this device.
    pub fn descriptor(
        &self,
        properties: HashMap<String, String>,
        metadata: Option<serde_json::Value>,
    ) -> DeviceDescriptor {
        DeviceDescriptor {
            handle: self.handle.clone(),
            transports: self.transport_names(),
            compromised: self.compromised,
            created: format_timestamp(self.created_at),
            last_used: self.authenticated_at.map(format_timestamp),
            properties,
            metadata,
        }
    }
}

/// ISO-8601 with millisecond precision and a literal `Z`, e.g.
/// `2024-01-02T03:04:05.678Z`.
fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// The server's external view of a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDescriptor {
    pub handle: String,
    pub transports: Vec<String>,
    pub compromised: bool,
    pub created: String,
    /// `null` until the first successful sign.
    pub last_used: Option<String>,
    pub properties: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}
