//! Transaction repository — rows backing the relational transaction store.

use chrono::{Duration, Utc};
use sqlx::AnyConnection;
use warden_common::models::transaction::Transaction;

/// Insert a pending ceremony.
pub async fn insert(
    conn: &mut AnyConnection,
    user_id: i64,
    transaction_id: &str,
    data: &str,
) -> Result<Transaction, sqlx::Error> {
    sqlx::query_as::<_, Transaction>(
        r#"
        INSERT INTO transactions (user_id, transaction_id, data, created_at)
        VALUES (?, ?, ?, CURRENT_TIMESTAMP)
        RETURNING *
        "#,
    )
    .bind(user_id)
    .bind(transaction_id)
    .bind(data)
    .fetch_one(conn)
    .await
}

/// Look up a pending ceremony by its unique id.
pub async fn find_by_transaction_id(
    conn: &mut AnyConnection,
    transaction_id: &str,
) -> Result<Option<Transaction>, sqlx::Error> {
    sqlx::query_as::<_, Transaction>("SELECT * FROM transactions WHERE transaction_id = ?")
        .bind(transaction_id)
        .fetch_optional(conn)
        .await
}

/// Delete one pending ceremony.
pub async fn delete(conn: &mut AnyConnection, id: i64) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM transactions WHERE id = ?")
        .bind(id)
        .execute(conn)
        .await?;
    Ok(())
}

/// Drop every transaction older than `ttl_secs`, across all users.
///
/// The cutoff is rendered in `CURRENT_TIMESTAMP`'s own spelling so the text
/// comparison is valid on SQLite as well as Postgres.
pub async fn purge_expired(
    conn: &mut AnyConnection,
    ttl_secs: u64,
) -> Result<u64, sqlx::Error> {
    let cutoff = Utc::now() - Duration::seconds(ttl_secs as i64);
    let result = sqlx::query("DELETE FROM transactions WHERE created_at < ?")
        .bind(cutoff.format("%Y-%m-%d %H:%M:%S").to_string())
        .execute(conn)
        .await?;
    Ok(result.rows_affected())
}

/// Evict a user's oldest transactions until at most `keep` remain.
pub async fn evict_overflow(
    conn: &mut AnyConnection,
    user_id: i64,
    keep: i64,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        DELETE FROM transactions
        WHERE user_id = ? AND id NOT IN (
            SELECT id FROM transactions
            WHERE user_id = ?
            ORDER BY created_at DESC, id DESC
            LIMIT ?
        )
        "#,
    )
    .bind(user_id)
    .bind(user_id)
    .bind(keep)
    .execute(conn)
    .await?;
    Ok(result.rows_affected())
}

/// Count a user's live transactions.
pub async fn count_for_user(
    conn: &mut AnyConnection,
    user_id: i64,
) -> Result<i64, sqlx::Error> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM transactions WHERE user_id = ?")
        .bind(user_id)
        .fetch_one(conn)
        .await?;
    Ok(row.0)
}
