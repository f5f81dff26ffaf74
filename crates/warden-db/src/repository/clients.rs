//! Client repository — CRUD for relying-party clients (CLI/admin surface).

use sqlx::AnyConnection;
use warden_common::models::client::Client;

/// Register a new relying-party client.
pub async fn create(
    conn: &mut AnyConnection,
    name: &str,
    app_id: &str,
    facets: &[String],
) -> Result<Client, sqlx::Error> {
    let facets_json = serde_json::to_string(facets)
        .map_err(|e| sqlx::Error::Encode(Box::new(e) as _))?;
    sqlx::query_as::<_, Client>(
        r#"
        INSERT INTO clients (name, app_id, valid_facets)
        VALUES (?, ?, ?)
        RETURNING *
        "#,
    )
    .bind(name)
    .bind(app_id)
    .bind(facets_json)
    .fetch_one(conn)
    .await
}

/// Find a client by its unique name.
pub async fn find_by_name(
    conn: &mut AnyConnection,
    name: &str,
) -> Result<Option<Client>, sqlx::Error> {
    sqlx::query_as::<_, Client>("SELECT * FROM clients WHERE name = ?")
        .bind(name)
        .fetch_optional(conn)
        .await
}

/// List all clients, ordered by name.
pub async fn list(conn: &mut AnyConnection) -> Result<Vec<Client>, sqlx::Error> {
    sqlx::query_as::<_, Client>("SELECT * FROM clients ORDER BY name ASC")
        .fetch_all(conn)
        .await
}

/// Update a client's AppID and facets.
pub async fn update(
    conn: &mut AnyConnection,
    id: i64,
    app_id: &str,
    facets: &[String],
) -> Result<Client, sqlx::Error> {
    let facets_json = serde_json::to_string(facets)
        .map_err(|e| sqlx::Error::Encode(Box::new(e) as _))?;
    sqlx::query_as::<_, Client>(
        r#"
        UPDATE clients SET app_id = ?, valid_facets = ?
        WHERE id = ?
        RETURNING *
        "#,
    )
    .bind(app_id)
    .bind(facets_json)
    .bind(id)
    .fetch_one(conn)
    .await
}

/// Delete a client and everything hanging off it.
///
/// The cascade is performed explicitly so both backends behave identically
/// regardless of foreign-key enforcement.
pub async fn delete(conn: &mut AnyConnection, id: i64) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        DELETE FROM properties WHERE device_id IN (
            SELECT d.id FROM devices d
            JOIN users u ON d.user_id = u.id
            WHERE u.client_id = ?
        )
        "#,
    )
    .bind(id)
    .execute(&mut *conn)
    .await?;
    sqlx::query("DELETE FROM devices WHERE user_id IN (SELECT id FROM users WHERE client_id = ?)")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    sqlx::query(
        "DELETE FROM transactions WHERE user_id IN (SELECT id FROM users WHERE client_id = ?)",
    )
    .bind(id)
    .execute(&mut *conn)
    .await?;
    sqlx::query("DELETE FROM users WHERE client_id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM clients WHERE id = ?")
        .bind(id)
        .execute(conn)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_pool() -> sqlx::AnyPool {
        sqlx::any::install_default_drivers();
        let pool = sqlx::any::AnyPoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite");
        sqlx::migrate!("./migrations-lite")
            .run(&pool)
            .await
            .expect("migrations");
        pool
    }

    #[tokio::test]
    async fn create_update_and_delete_round_trip() {
        let pool = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();

        let client = create(
            &mut conn,
            "fooclient",
            "https://example.com",
            &["https://example.com".to_owned()],
        )
        .await
        .unwrap();
        assert_eq!(client.name, "fooclient");
        assert_eq!(client.valid_facets, vec!["https://example.com"]);

        let found = find_by_name(&mut conn, "fooclient").await.unwrap().unwrap();
        assert_eq!(found.id, client.id);
        assert!(find_by_name(&mut conn, "missing").await.unwrap().is_none());

        let updated = update(
            &mut conn,
            client.id,
            "https://example.org",
            &[
                "https://example.org".to_owned(),
                "https://www.example.org".to_owned(),
            ],
        )
        .await
        .unwrap();
        assert_eq!(updated.app_id, "https://example.org");
        assert_eq!(updated.valid_facets.len(), 2);
        // The name is the stable identifier and never changes.
        assert_eq!(updated.name, "fooclient");

        delete(&mut conn, client.id).await.unwrap();
        assert!(find_by_name(&mut conn, "fooclient").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_orders_by_name() {
        let pool = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();

        for name in ["zed", "abc", "mid"] {
            create(&mut conn, name, "https://example.com", &["https://example.com".to_owned()])
                .await
                .unwrap();
        }
        let names: Vec<String> = list(&mut conn).await.unwrap().into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["abc", "mid", "zed"]);
    }
}
