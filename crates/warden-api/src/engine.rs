//! The ceremony engine.
//!
//! Owns the persistent store, the in-flight transaction store, and the
//! attestation service, and implements the register/sign state machines,
//! trust policy, counter monotonicity with compromise latching, property
//! precedence, and device administration.
//!
//! Every mutating operation runs inside one database transaction: committed
//! exactly once on success, rolled back when an error propagates out. A
//! ceremony orphaned by a rollback stays in the transaction store until its
//! TTL reclaims it.

use std::collections::HashMap;

use sqlx::AnyConnection;
use warden_common::models::client::Client;
use warden_common::models::device::{Device, DeviceDescriptor};
use warden_common::models::wire::{
    PropertyUpdate, RegisterRequestData, RegisterResponseData, RegisteredKey, SignRequestData,
    SignResponseData, TrustedFacetsResponse,
};
use warden_common::validation::{validate_property_key, validate_user_name};
use warden_common::{WardenError, WardenResult};
use warden_db::repository::{certificates, devices, users};
use warden_db::transaction_store::TransactionStore;
use warden_db::Database;
use warden_u2f as u2f;

use crate::attestation::AttestationService;

/// Default length of server-minted challenges.
const CHALLENGE_LEN: usize = 32;

pub struct Engine {
    db: Database,
    store: TransactionStore,
    attestation: AttestationService,
    allow_untrusted: bool,
}

/// Payload persisted in the transaction store between start and complete.
#[derive(serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterTransaction {
    request: u2f::U2fRegisterRequest,
    properties: PropertyUpdate,
}

#[derive(serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignTransaction {
    request: u2f::U2fSignRequest,
    /// websafe key handle → device handle
    handle_map: HashMap<String, String>,
    properties: PropertyUpdate,
}

impl Engine {
    pub fn new(
        db: Database,
        store: TransactionStore,
        attestation: AttestationService,
        allow_untrusted: bool,
    ) -> Self {
        Self {
            db,
            store,
            attestation,
            allow_untrusted,
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    // ============================================================
    // Facets & enumeration
    // ============================================================

    pub fn trusted_facets(&self, client: &Client) -> TrustedFacetsResponse {
        TrustedFacetsResponse::new(client.valid_facets.clone())
    }

    /// Descriptors of every device the user has. Unknown users simply have
    /// none yet.
    pub async fn descriptors(
        &self,
        client: &Client,
        user_name: &str,
    ) -> WardenResult<Vec<DeviceDescriptor>> {
        validate_user_name(user_name)?;
        let mut conn = self.db.pool.acquire().await?;
        let Some(user) = users::find(&mut conn, client.id, user_name).await? else {
            return Ok(vec![]);
        };
        let mut descriptors = Vec::new();
        for device in devices::list_for_user(&mut conn, user.id).await? {
            descriptors.push(self.descriptor_for(&mut conn, &device).await?);
        }
        Ok(descriptors)
    }

    /// Delete a user and everything attached. Idempotent.
    pub async fn delete_user(&self, client: &Client, user_name: &str) -> WardenResult<()> {
        validate_user_name(user_name)?;
        let mut tx = self.db.pool.begin().await?;
        if let Some(user) = users::find(&mut tx, client.id, user_name).await? {
            users::delete(&mut tx, user.id).await?;
            tx.commit().await?;
            tracing::info!("User deleted: {}/{}", client.name, user_name);
        }
        Ok(())
    }

    // ============================================================
    // Registration
    // ============================================================

    pub async fn register_start(
        &self,
        client: &Client,
        user_name: &str,
        challenge: Option<Vec<u8>>,
        properties: PropertyUpdate,
    ) -> WardenResult<RegisterRequestData> {
        validate_user_name(user_name)?;
        validate_property_keys(&properties)?;
        let challenge = challenge.unwrap_or_else(|| u2f::rand_bytes(CHALLENGE_LEN));

        let mut tx = self.db.pool.begin().await?;

        // Existing keys are echoed so the client can refuse duplicate
        // enrollment; compromised devices stay in this list on purpose.
        let mut registrations = Vec::new();
        let mut registered_keys = Vec::new();
        let mut descriptors = Vec::new();
        if let Some(user) = users::find(&mut tx, client.id, user_name).await? {
            for device in devices::list_for_user(&mut tx, user.id).await? {
                let descriptor = self.descriptor_for(&mut tx, &device).await?;
                let registration = parse_bind_data(&device)?;
                registered_keys.push(registered_key(
                    &registration,
                    &client.app_id,
                    descriptor.transports.clone(),
                ));
                registrations.push(registration);
                descriptors.push(descriptor);
            }
        }

        let request = u2f::begin_registration(&client.app_id, registrations, &challenge);
        let register_requests = request.register_requests.clone();
        let payload = serde_json::to_value(RegisterTransaction {
            request,
            properties,
        })
        .map_err(|e| WardenError::Internal(anyhow::anyhow!(e)))?;
        self.store
            .store(&mut tx, client.id, user_name, &challenge, &payload)
            .await?;
        tx.commit().await?;

        Ok(RegisterRequestData {
            app_id: client.app_id.clone(),
            register_requests,
            registered_keys,
            descriptors,
        })
    }

    pub async fn register_complete(
        &self,
        client: &Client,
        user_name: &str,
        body: RegisterResponseData,
    ) -> WardenResult<DeviceDescriptor> {
        validate_user_name(user_name)?;
        validate_property_keys(&body.properties)?;
        let client_data = body.register_response.client_data().map_err(bad_input)?;
        let challenge = u2f::websafe_decode(&client_data.challenge).map_err(bad_input)?;

        let mut tx = self.db.pool.begin().await?;
        let payload = self
            .store
            .retrieve(&mut tx, client.id, user_name, &challenge)
            .await
            .map_err(|e| match e {
                WardenError::BadInput(_) => WardenError::NotFound {
                    resource: "Transaction".into(),
                },
                other => other,
            })?;
        let stored: RegisterTransaction = serde_json::from_value(payload)
            .map_err(|e| WardenError::Internal(anyhow::anyhow!("corrupt transaction: {e}")))?;

        let (registration, cert_der) = u2f::complete_registration(
            &stored.request,
            &body.register_response,
            &client.valid_facets,
        )
        .map_err(bad_input)?;

        let attestation = self.attestation.get_attestation(&cert_der);
        let trusted = attestation.as_ref().map(|a| a.trusted).unwrap_or(false);
        if !self.allow_untrusted && !trusted {
            return Err(WardenError::BadInput(
                "Device attestation not trusted".into(),
            ));
        }
        let transports = attestation.as_ref().and_then(|a| a.transports).unwrap_or(0);

        let user = users::get_or_create(&mut tx, client.id, user_name).await?;
        let certificate = certificates::get_or_insert(&mut tx, &cert_der).await?;
        let bind_data = serde_json::to_string(&registration)
            .map_err(|e| WardenError::Internal(anyhow::anyhow!(e)))?;
        let device =
            devices::create(&mut tx, user.id, &bind_data, certificate.id, transports).await?;

        // Properties from the start call have lower precedence than the
        // completion body.
        devices::apply_properties(&mut tx, device.id, &stored.properties).await?;
        devices::apply_properties(&mut tx, device.id, &body.properties).await?;

        let descriptor = self.descriptor_for(&mut tx, &device).await?;
        tx.commit().await?;
        tracing::info!(
            "Registered device: {}/{}/{}",
            client.name,
            user_name,
            device.handle
        );
        Ok(descriptor)
    }

    // ============================================================
    // Signing
    // ============================================================

    pub async fn sign_start(
        &self,
        client: &Client,
        user_name: &str,
        challenge: Option<Vec<u8>>,
        handles: Vec<String>,
        properties: PropertyUpdate,
    ) -> WardenResult<SignRequestData> {
        validate_user_name(user_name)?;
        validate_property_keys(&properties)?;

        let mut tx = self.db.pool.begin().await?;
        let user = users::find(&mut tx, client.id, user_name).await?;
        let all_devices = match &user {
            Some(user) => devices::list_for_user(&mut tx, user.id).await?,
            None => vec![],
        };
        if all_devices.is_empty() {
            tracing::info!("User {}/{} has no devices registered", client.name, user_name);
            return Err(WardenError::NoEligibleDevices {
                message: "No devices registered".into(),
                descriptors: vec![],
            });
        }

        let candidates: Vec<&Device> = if handles.is_empty() {
            all_devices.iter().collect()
        } else {
            let by_handle: HashMap<&str, &Device> =
                all_devices.iter().map(|d| (d.handle.as_str(), d)).collect();
            let mut picked = Vec::with_capacity(handles.len());
            for handle in &handles {
                let device = by_handle.get(handle.as_str()).copied().ok_or_else(|| {
                    WardenError::BadInput(format!("Invalid device handle: {handle}"))
                })?;
                picked.push(device);
            }
            picked
        };

        let eligible: Vec<&Device> = candidates
            .iter()
            .copied()
            .filter(|d| !d.compromised)
            .collect();
        if eligible.is_empty() {
            let mut descriptors = Vec::new();
            for device in all_devices.iter().filter(|d| d.compromised) {
                descriptors.push(self.descriptor_for(&mut tx, device).await?);
            }
            return Err(WardenError::NoEligibleDevices {
                message: "All devices compromised".into(),
                descriptors,
            });
        }

        let challenge = challenge.unwrap_or_else(|| u2f::rand_bytes(CHALLENGE_LEN));
        let mut registrations = Vec::new();
        let mut registered_keys = Vec::new();
        let mut descriptors = Vec::new();
        let mut handle_map = HashMap::new();
        for device in eligible {
            let descriptor = self.descriptor_for(&mut tx, device).await?;
            let registration = parse_bind_data(device)?;
            handle_map.insert(
                u2f::websafe_encode(&registration.key_handle),
                device.handle.clone(),
            );
            registered_keys.push(registered_key(
                &registration,
                &client.app_id,
                descriptor.transports.clone(),
            ));
            registrations.push(registration);
            descriptors.push(descriptor);
        }

        let request = u2f::begin_authentication(&client.app_id, registrations, &challenge);
        let challenge_websafe = request.challenge.clone();
        let payload = serde_json::to_value(SignTransaction {
            request,
            handle_map,
            properties,
        })
        .map_err(|e| WardenError::Internal(anyhow::anyhow!(e)))?;
        self.store
            .store(&mut tx, client.id, user_name, &challenge, &payload)
            .await?;
        tx.commit().await?;

        Ok(SignRequestData {
            app_id: client.app_id.clone(),
            challenge: challenge_websafe,
            registered_keys,
            descriptors,
        })
    }

    pub async fn sign_complete(
        &self,
        client: &Client,
        user_name: &str,
        body: SignResponseData,
    ) -> WardenResult<DeviceDescriptor> {
        validate_user_name(user_name)?;
        validate_property_keys(&body.properties)?;
        let client_data = body.sign_response.client_data().map_err(bad_input)?;
        let challenge = u2f::websafe_decode(&client_data.challenge).map_err(bad_input)?;

        let mut tx = self.db.pool.begin().await?;
        let payload = self
            .store
            .retrieve(&mut tx, client.id, user_name, &challenge)
            .await?;
        let stored: SignTransaction = serde_json::from_value(payload)
            .map_err(|e| WardenError::Internal(anyhow::anyhow!("corrupt transaction: {e}")))?;

        let (matched, counter, presence) = u2f::complete_authentication(
            &stored.request,
            &body.sign_response,
            &client.valid_facets,
        )
        .map_err(bad_input)?;

        let device_handle = stored
            .handle_map
            .get(&u2f::websafe_encode(&matched.key_handle))
            .ok_or_else(|| {
                WardenError::BadInput("No device found for key handle".into())
            })?;
        let user = users::find(&mut tx, client.id, user_name)
            .await?
            .ok_or_else(|| WardenError::BadInput("Invalid transaction".into()))?;
        let device = devices::find_by_handle(&mut tx, user.id, device_handle)
            .await?
            .ok_or_else(|| {
                WardenError::BadInput(format!("Invalid device handle: {device_handle}"))
            })?;

        if device.compromised {
            let descriptor = self.descriptor_for(&mut tx, &device).await?;
            return Err(WardenError::DeviceCompromised {
                message: "Device is compromised".into(),
                descriptor: Box::new(descriptor),
            });
        }
        if presence == 0 {
            return Err(WardenError::BadInput("User presence byte not set".into()));
        }

        // Strict advance or nothing: the guarded update is also what makes
        // two concurrent signs with the same counter impossible to both win.
        if devices::accept_counter(&mut tx, device.id, i64::from(counter)).await? {
            devices::apply_properties(&mut tx, device.id, &stored.properties).await?;
            devices::apply_properties(&mut tx, device.id, &body.properties).await?;
            let device = devices::find_by_id(&mut tx, device.id)
                .await?
                .ok_or_else(|| WardenError::Internal(anyhow::anyhow!("device vanished")))?;
            let descriptor = self.descriptor_for(&mut tx, &device).await?;
            tx.commit().await?;
            tracing::info!(
                "Authenticated device: {}/{}/{}",
                client.name,
                user_name,
                device.handle
            );
            Ok(descriptor)
        } else {
            // Counter regression latches the device; the latch itself must
            // survive this failing request.
            devices::latch_compromised(&mut tx, device.id).await?;
            let mut device = device;
            device.compromised = true;
            let descriptor = self.descriptor_for(&mut tx, &device).await?;
            tx.commit().await?;
            tracing::warn!(
                "Device counter mismatch, latching compromise: {}/{}/{}",
                client.name,
                user_name,
                device.handle
            );
            Err(WardenError::DeviceCompromised {
                message: "Device counter mismatch".into(),
                descriptor: Box::new(descriptor),
            })
        }
    }

    // ============================================================
    // Device administration
    // ============================================================

    pub async fn get_descriptor(
        &self,
        client: &Client,
        user_name: &str,
        handle: &str,
    ) -> WardenResult<DeviceDescriptor> {
        validate_user_name(user_name)?;
        let mut conn = self.db.pool.acquire().await?;
        let device = self.find_device(&mut conn, client, user_name, handle).await?;
        self.descriptor_for(&mut conn, &device).await
    }

    /// Merge properties into a device's bag; `null` values delete keys.
    pub async fn set_properties(
        &self,
        client: &Client,
        user_name: &str,
        handle: &str,
        properties: PropertyUpdate,
    ) -> WardenResult<DeviceDescriptor> {
        validate_user_name(user_name)?;
        validate_property_keys(&properties)?;
        let mut tx = self.db.pool.begin().await?;
        let device = self.find_device(&mut tx, client, user_name, handle).await?;
        devices::apply_properties(&mut tx, device.id, &properties).await?;
        let descriptor = self.descriptor_for(&mut tx, &device).await?;
        tx.commit().await?;
        Ok(descriptor)
    }

    /// Delete a device. Idempotent: deleting an unknown handle is a no-op.
    pub async fn delete_device(
        &self,
        client: &Client,
        user_name: &str,
        handle: &str,
    ) -> WardenResult<()> {
        validate_user_name(user_name)?;
        let mut tx = self.db.pool.begin().await?;
        let Some(user) = users::find(&mut tx, client.id, user_name).await? else {
            return Ok(());
        };
        if let Some(device) = devices::find_by_handle(&mut tx, user.id, handle).await? {
            devices::delete(&mut tx, device.id).await?;
            tx.commit().await?;
            tracing::info!("Device deleted: {}/{}/{}", client.name, user_name, handle);
        }
        Ok(())
    }

    /// The device's attestation certificate, PEM-encoded.
    pub async fn certificate_pem(
        &self,
        client: &Client,
        user_name: &str,
        handle: &str,
    ) -> WardenResult<Vec<u8>> {
        validate_user_name(user_name)?;
        let mut conn = self.db.pool.acquire().await?;
        let device = self.find_device(&mut conn, client, user_name, handle).await?;
        let certificate = certificates::find_by_id(&mut conn, device.certificate_id)
            .await?
            .ok_or_else(|| WardenError::Internal(anyhow::anyhow!("certificate row missing")))?;
        let der = certificate
            .der_bytes()
            .map_err(|e| WardenError::Internal(anyhow::anyhow!("corrupt certificate: {e}")))?;
        let pem = openssl::x509::X509::from_der(&der)
            .and_then(|cert| cert.to_pem())
            .map_err(|e| WardenError::Internal(anyhow::anyhow!("corrupt certificate: {e}")))?;
        Ok(pem)
    }

    // ============================================================
    // Internals
    // ============================================================

    async fn find_device(
        &self,
        conn: &mut AnyConnection,
        client: &Client,
        user_name: &str,
        handle: &str,
    ) -> WardenResult<Device> {
        let user = users::find(&mut *conn, client.id, user_name)
            .await?
            .ok_or_else(|| WardenError::NotFound {
                resource: "Device".into(),
            })?;
        devices::find_by_handle(conn, user.id, handle)
            .await?
            .ok_or_else(|| WardenError::NotFound {
                resource: "Device".into(),
            })
    }

    /// Build the wire descriptor: property bag plus attestation metadata.
    async fn descriptor_for(
        &self,
        conn: &mut AnyConnection,
        device: &Device,
    ) -> WardenResult<DeviceDescriptor> {
        let properties = devices::properties(&mut *conn, device.id).await?;
        let metadata = match certificates::find_by_id(conn, device.certificate_id).await? {
            Some(cert) => cert
                .der_bytes()
                .ok()
                .and_then(|der| self.attestation.get_metadata(&der)),
            None => None,
        };
        Ok(device.descriptor(properties, metadata))
    }
}

/// Client-facing registered key, derived from stored bind data. The AppID is
/// only carried when it differs from the client's primary one.
fn registered_key(
    registration: &u2f::Registration,
    client_app_id: &str,
    transports: Vec<String>,
) -> RegisteredKey {
    RegisteredKey {
        version: registration.version.clone(),
        key_handle: u2f::websafe_encode(&registration.key_handle),
        transports,
        app_id: (registration.app_id != client_app_id).then(|| registration.app_id.clone()),
    }
}

fn parse_bind_data(device: &Device) -> WardenResult<u2f::Registration> {
    serde_json::from_str(&device.bind_data).map_err(|e| {
        WardenError::Internal(anyhow::anyhow!(
            "corrupt bind data for device {}: {e}",
            device.handle
        ))
    })
}

fn validate_property_keys(properties: &PropertyUpdate) -> WardenResult<()> {
    for key in properties.keys() {
        validate_property_key(key)?;
    }
    Ok(())
}

fn bad_input(e: impl std::fmt::Display) -> WardenError {
    WardenError::BadInput(e.to_string())
}
