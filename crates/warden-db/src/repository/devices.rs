//! Device repository — registered security keys, their counters, and the
//! per-device property bag.

use std::collections::HashMap;

use rand::RngCore;
use sqlx::{AnyConnection, Row};
use warden_common::models::device::Device;
use warden_common::models::wire::PropertyUpdate;

/// Mint a fresh 128-bit random device handle (32 lowercase hex chars).
fn mint_handle() -> String {
    let mut buf = [0u8; 16];
    rand::rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

/// Register a device for a user.
pub async fn create(
    conn: &mut AnyConnection,
    user_id: i64,
    bind_data: &str,
    certificate_id: i64,
    transports: i64,
) -> Result<Device, sqlx::Error> {
    sqlx::query_as::<_, Device>(
        r#"
        INSERT INTO devices (handle, user_id, bind_data, certificate_id, compromised, transports, created_at)
        VALUES (?, ?, ?, ?, 0, ?, CURRENT_TIMESTAMP)
        RETURNING *
        "#,
    )
    .bind(mint_handle())
    .bind(user_id)
    .bind(bind_data)
    .bind(certificate_id)
    .bind(transports)
    .fetch_one(conn)
    .await
}

/// List all devices of a user, ordered by handle.
pub async fn list_for_user(
    conn: &mut AnyConnection,
    user_id: i64,
) -> Result<Vec<Device>, sqlx::Error> {
    sqlx::query_as::<_, Device>(
        "SELECT * FROM devices WHERE user_id = ? ORDER BY handle ASC",
    )
    .bind(user_id)
    .fetch_all(conn)
    .await
}

/// Find a device owned by the given user.
pub async fn find_by_handle(
    conn: &mut AnyConnection,
    user_id: i64,
    handle: &str,
) -> Result<Option<Device>, sqlx::Error> {
    sqlx::query_as::<_, Device>("SELECT * FROM devices WHERE user_id = ? AND handle = ?")
        .bind(user_id)
        .bind(handle)
        .fetch_optional(conn)
        .await
}

/// Find a device by id.
pub async fn find_by_id(
    conn: &mut AnyConnection,
    device_id: i64,
) -> Result<Option<Device>, sqlx::Error> {
    sqlx::query_as::<_, Device>("SELECT * FROM devices WHERE id = ?")
        .bind(device_id)
        .fetch_optional(conn)
        .await
}

/// Accept a signature counter if it is a strict advance.
///
/// The guard doubles as the lost-update defence: two concurrent signs with
/// the same counter cannot both match the predicate, whatever the pool's
/// interleaving. Returns false when the device is latched or the counter did
/// not advance.
pub async fn accept_counter(
    conn: &mut AnyConnection,
    device_id: i64,
    counter: i64,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE devices
        SET counter = ?, authenticated_at = CURRENT_TIMESTAMP
        WHERE id = ? AND compromised = 0 AND (counter IS NULL OR counter < ?)
        "#,
    )
    .bind(counter)
    .bind(device_id)
    .bind(counter)
    .execute(conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Latch a device as compromised. Never cleared.
pub async fn latch_compromised(
    conn: &mut AnyConnection,
    device_id: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE devices SET compromised = 1 WHERE id = ?")
        .bind(device_id)
        .execute(conn)
        .await?;
    Ok(())
}

/// Delete a device and its properties.
pub async fn delete(conn: &mut AnyConnection, device_id: i64) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM properties WHERE device_id = ?")
        .bind(device_id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM devices WHERE id = ?")
        .bind(device_id)
        .execute(conn)
        .await?;
    Ok(())
}

// ============================================================
// Properties
// ============================================================

/// Load the property bag of a device.
pub async fn properties(
    conn: &mut AnyConnection,
    device_id: i64,
) -> Result<HashMap<String, String>, sqlx::Error> {
    let rows = sqlx::query("SELECT key, value FROM properties WHERE device_id = ?")
        .bind(device_id)
        .fetch_all(conn)
        .await?;
    rows.iter()
        .map(|row| Ok((row.try_get("key")?, row.try_get("value")?)))
        .collect()
}

/// Merge a property update into a device's bag: `None` deletes the key, any
/// other value upserts it.
pub async fn apply_properties(
    conn: &mut AnyConnection,
    device_id: i64,
    update: &PropertyUpdate,
) -> Result<(), sqlx::Error> {
    for (key, value) in update {
        match value {
            None => {
                sqlx::query("DELETE FROM properties WHERE device_id = ? AND key = ?")
                    .bind(device_id)
                    .bind(key)
                    .execute(&mut *conn)
                    .await?;
            }
            Some(value) => {
                sqlx::query(
                    r#"
                    INSERT INTO properties (device_id, key, value)
                    VALUES (?, ?, ?)
                    ON CONFLICT (device_id, key) DO UPDATE SET value = EXCLUDED.value
                    "#,
                )
                .bind(device_id)
                .bind(key)
                .bind(value)
                .execute(&mut *conn)
                .await?;
            }
        }
    }
    Ok(())
}
