//! # warden-db
//!
//! Database layer for warden.
//!
//! Supports two modes, selected automatically from the database URL:
//!
//! * **Full mode** (`postgres://…`) — PostgreSQL + optional Redis for the
//!   in-flight ceremony cache.
//! * **Lite mode** (`sqlite://…`) — embedded SQLite, no external services
//!   required.
//!
//! Repositories take a `&mut AnyConnection` so that every public engine
//! operation can run inside a single database transaction (commit on
//! success, roll back on any error).

pub mod repository;
pub mod transaction_store;

use anyhow::Result;

/// Which backing store is in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbBackend {
    Postgres,
    Sqlite,
}

impl DbBackend {
    pub fn from_url(url: &str) -> Self {
        if url.starts_with("sqlite://") || url.starts_with("sqlite:") {
            DbBackend::Sqlite
        } else {
            DbBackend::Postgres
        }
    }
}

/// Shared database state passed through Axum extractors.
#[derive(Clone)]
pub struct Database {
    /// SQL pool — works with both Postgres and SQLite.
    pub pool: sqlx::AnyPool,
    /// Redis connection (`None` unless the cache transaction store is enabled).
    pub redis: Option<redis::aio::ConnectionManager>,
    /// Which backend is active.
    pub backend: DbBackend,
}

impl Database {
    /// Connect using the URL in `config.database.url`.
    pub async fn connect(config: &warden_common::config::AppConfig) -> Result<Self> {
        // Register all built-in drivers (Postgres + SQLite).
        sqlx::any::install_default_drivers();

        let backend = DbBackend::from_url(&config.database.url);

        let pool = match backend {
            DbBackend::Postgres => {
                tracing::info!("Connecting to PostgreSQL…");
                sqlx::any::AnyPoolOptions::new()
                    .max_connections(config.database.max_connections)
                    .min_connections(config.database.min_connections)
                    .connect(&config.database.url)
                    .await?
            }
            DbBackend::Sqlite => {
                tracing::info!("Connecting to SQLite: {}", &config.database.url);
                sqlx::any::AnyPoolOptions::new()
                    .max_connections(1)
                    .min_connections(1)
                    .connect(&config.database.url)
                    .await?
            }
        };

        let redis = if config.cache.enabled {
            let url = config
                .cache
                .url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("cache.enabled is set but cache.url is not"))?;
            tracing::info!("Connecting to Redis…");
            let client = redis::Client::open(url)?;
            let mgr = redis::aio::ConnectionManager::new(client).await?;
            tracing::info!("Connected to Redis");
            Some(mgr)
        } else {
            None
        };

        Ok(Self { pool, redis, backend })
    }

    /// Run migrations appropriate for the active backend.
    pub async fn migrate(&self) -> Result<()> {
        tracing::info!("Running database migrations…");
        match self.backend {
            DbBackend::Postgres => {
                sqlx::migrate!("./migrations").run(&self.pool).await?;
            }
            DbBackend::Sqlite => {
                sqlx::migrate!("./migrations-lite").run(&self.pool).await?;
            }
        }
        tracing::info!("Migrations complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_detection() {
        assert_eq!(DbBackend::from_url("sqlite::memory:"), DbBackend::Sqlite);
        assert_eq!(DbBackend::from_url("sqlite://warden.db"), DbBackend::Sqlite);
        assert_eq!(
            DbBackend::from_url("postgres://localhost/warden"),
            DbBackend::Postgres
        );
    }
}
