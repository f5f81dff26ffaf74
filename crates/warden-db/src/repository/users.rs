//! User repository.
//!
//! Users are opaque identifiers scoped to one client; rows appear lazily
//! when the first ceremony for the name is stored and disappear (with all
//! their devices and transactions) on DELETE.

use sqlx::AnyConnection;
use warden_common::models::user::User;

/// Find a user by `(client_id, name)`.
pub async fn find(
    conn: &mut AnyConnection,
    client_id: i64,
    name: &str,
) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>("SELECT * FROM users WHERE client_id = ? AND name = ?")
        .bind(client_id)
        .bind(name)
        .fetch_optional(conn)
        .await
}

/// Create a user row.
pub async fn create(
    conn: &mut AnyConnection,
    client_id: i64,
    name: &str,
) -> Result<User, sqlx::Error> {
    sqlx::query_as::<_, User>(
        r#"
        INSERT INTO users (client_id, name)
        VALUES (?, ?)
        RETURNING *
        "#,
    )
    .bind(client_id)
    .bind(name)
    .fetch_one(conn)
    .await
}

/// Find a user, creating the row if it does not exist yet.
pub async fn get_or_create(
    conn: &mut AnyConnection,
    client_id: i64,
    name: &str,
) -> Result<User, sqlx::Error> {
    if let Some(user) = find(&mut *conn, client_id, name).await? {
        return Ok(user);
    }
    let user = create(conn, client_id, name).await?;
    tracing::info!("User created: {}/{}", client_id, name);
    Ok(user)
}

/// Delete a user, cascading devices, their properties, and transactions.
pub async fn delete(conn: &mut AnyConnection, user_id: i64) -> Result<(), sqlx::Error> {
    sqlx::query(
        "DELETE FROM properties WHERE device_id IN (SELECT id FROM devices WHERE user_id = ?)",
    )
    .bind(user_id)
    .execute(&mut *conn)
    .await?;
    sqlx::query("DELETE FROM devices WHERE user_id = ?")
        .bind(user_id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM transactions WHERE user_id = ?")
        .bind(user_id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM users WHERE id = ?")
        .bind(user_id)
        .execute(conn)
        .await?;
    Ok(())
}
