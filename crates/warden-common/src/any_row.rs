//! Manual `sqlx::FromRow<'_, sqlx::any::AnyRow>` implementations for the
//! warden-common model types.
//!
//! `sqlx::AnyPool` only decodes primitive types natively (i64, f64, bool,
//! String, bytes). Timestamps are decoded from text in both the SQLite
//! (`YYYY-MM-DD HH:MM:SS[.f]`) and Postgres (RFC 3339) spellings; JSON list
//! columns are stored as JSON text; booleans are stored as 0/1 integers so
//! both backends agree.

use chrono::{DateTime, Utc};
use sqlx::{any::AnyRow, Row};

use crate::models::{
    certificate::Certificate, client::Client, device::Device, transaction::Transaction,
    user::User,
};

// ── Internal helpers ──────────────────────────────────────────────────────────

fn dt(row: &AnyRow, col: &str) -> Result<DateTime<Utc>, sqlx::Error> {
    let s: String = row.try_get(col)?;
    parse_dt(&s).map_err(sqlx::Error::Decode)
}

fn opt_dt(row: &AnyRow, col: &str) -> Result<Option<DateTime<Utc>>, sqlx::Error> {
    let s: Option<String> = row.try_get(col)?;
    s.map(|v| parse_dt(&v).map_err(sqlx::Error::Decode)).transpose()
}

fn parse_dt(
    s: &str,
) -> Result<DateTime<Utc>, Box<dyn std::error::Error + Send + Sync + 'static>> {
    if let Ok(d) = DateTime::parse_from_rfc3339(s) {
        return Ok(d.with_timezone(&Utc));
    }
    if let Ok(d) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Ok(d.and_utc());
    }
    if let Ok(d) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(d.and_utc());
    }
    Err(format!("cannot parse timestamp '{s}'").into())
}

fn str_vec(row: &AnyRow, col: &str) -> Result<Vec<String>, sqlx::Error> {
    let s: String = row.try_get(col)?;
    if s.trim() == "[]" || s.is_empty() {
        return Ok(vec![]);
    }
    serde_json::from_str(&s).map_err(|e| sqlx::Error::Decode(Box::new(e) as _))
}

fn flag(row: &AnyRow, col: &str) -> Result<bool, sqlx::Error> {
    let v: i64 = row.try_get(col)?;
    Ok(v != 0)
}

// ── Client ────────────────────────────────────────────────────────────────────

impl<'r> sqlx::FromRow<'r, AnyRow> for Client {
    fn from_row(row: &'r AnyRow) -> Result<Self, sqlx::Error> {
        Ok(Client {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            app_id: row.try_get("app_id")?,
            valid_facets: str_vec(row, "valid_facets")?,
        })
    }
}

// ── User ──────────────────────────────────────────────────────────────────────

impl<'r> sqlx::FromRow<'r, AnyRow> for User {
    fn from_row(row: &'r AnyRow) -> Result<Self, sqlx::Error> {
        Ok(User {
            id: row.try_get("id")?,
            client_id: row.try_get("client_id")?,
            name: row.try_get("name")?,
        })
    }
}

// ── Certificate ───────────────────────────────────────────────────────────────

impl<'r> sqlx::FromRow<'r, AnyRow> for Certificate {
    fn from_row(row: &'r AnyRow) -> Result<Self, sqlx::Error> {
        Ok(Certificate {
            id: row.try_get("id")?,
            fingerprint: row.try_get("fingerprint")?,
            der: row.try_get("der")?,
        })
    }
}

// ── Device ────────────────────────────────────────────────────────────────────

impl<'r> sqlx::FromRow<'r, AnyRow> for Device {
    fn from_row(row: &'r AnyRow) -> Result<Self, sqlx::Error> {
        Ok(Device {
            id: row.try_get("id")?,
            handle: row.try_get("handle")?,
            user_id: row.try_get("user_id")?,
            bind_data: row.try_get("bind_data")?,
            certificate_id: row.try_get("certificate_id")?,
            compromised: flag(row, "compromised")?,
            counter: row.try_get("counter")?,
            transports: row.try_get("transports")?,
            created_at: dt(row, "created_at")?,
            authenticated_at: opt_dt(row, "authenticated_at")?,
        })
    }
}

// ── Transaction ───────────────────────────────────────────────────────────────

impl<'r> sqlx::FromRow<'r, AnyRow> for Transaction {
    fn from_row(row: &'r AnyRow) -> Result<Self, sqlx::Error> {
        Ok(Transaction {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            transaction_id: row.try_get("transaction_id")?,
            data: row.try_get("data")?,
            created_at: dt(row, "created_at")?,
        })
    }
}
