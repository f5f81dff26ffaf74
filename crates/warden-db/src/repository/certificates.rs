//! Certificate repository — attestation certificates, deduplicated by
//! SHA-256 fingerprint of the DER encoding.

use sqlx::AnyConnection;
use warden_common::models::certificate::{self, Certificate};

/// Find a certificate row by fingerprint.
pub async fn find_by_fingerprint(
    conn: &mut AnyConnection,
    fingerprint: &str,
) -> Result<Option<Certificate>, sqlx::Error> {
    sqlx::query_as::<_, Certificate>("SELECT * FROM certificates WHERE fingerprint = ?")
        .bind(fingerprint)
        .fetch_optional(conn)
        .await
}

/// Find a certificate row by id.
pub async fn find_by_id(
    conn: &mut AnyConnection,
    id: i64,
) -> Result<Option<Certificate>, sqlx::Error> {
    sqlx::query_as::<_, Certificate>("SELECT * FROM certificates WHERE id = ?")
        .bind(id)
        .fetch_optional(conn)
        .await
}

/// Return the row for this DER certificate, inserting it if no row with the
/// same fingerprint exists yet.
pub async fn get_or_insert(
    conn: &mut AnyConnection,
    der: &[u8],
) -> Result<Certificate, sqlx::Error> {
    let fingerprint = certificate::fingerprint(der);
    if let Some(existing) = find_by_fingerprint(&mut *conn, &fingerprint).await? {
        return Ok(existing);
    }
    sqlx::query_as::<_, Certificate>(
        r#"
        INSERT INTO certificates (fingerprint, der)
        VALUES (?, ?)
        RETURNING *
        "#,
    )
    .bind(&fingerprint)
    .bind(Certificate::encode_der(der))
    .fetch_one(conn)
    .await
}
