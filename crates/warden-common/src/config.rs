//! Application configuration loaded from environment variables and config files.
//!
//! Supports `.env` files for development and environment variables for
//! production. Config precedence: env vars > .env file > config.toml >
//! defaults.
//!
//! There is deliberately no process-global config singleton: the loaded
//! [`AppConfig`] is threaded explicitly into the server, engine, and stores.

use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    pub u2f: U2fConfig,
    pub transactions: TransactionConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// Connection URL — `postgres://…` for production, `sqlite://…` for
    /// development and tests.
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// Keep in-flight ceremonies in Redis instead of the relational store.
    pub enabled: bool,
    /// Redis connection URL, required when `enabled` is set.
    pub url: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct U2fConfig {
    /// File or directory of trusted attestation metadata JSON.
    pub metadata: Option<String>,
    /// Accept registrations from devices whose attestation cannot be matched
    /// against the trusted metadata.
    pub allow_untrusted: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TransactionConfig {
    /// Live in-flight ceremonies allowed per user; the oldest is evicted on
    /// overflow.
    pub max_per_user: u32,
    /// Seconds an in-flight ceremony stays retrievable.
    pub ttl_secs: u64,
}

impl AppConfig {
    /// Load configuration from the environment.
    ///
    /// Reads an optional `config.toml`, then environment variables with the
    /// `WARDEN` prefix (`WARDEN_DATABASE__URL`, `WARDEN_CACHE__ENABLED`, …).
    pub fn load() -> Result<AppConfig, config::ConfigError> {
        // Load .env file if present (development)
        let _ = dotenvy::dotenv();

        let cfg = config::Config::builder()
            // Defaults
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            .set_default("database.url", "sqlite://warden.db")?
            .set_default("database.max_connections", 20)?
            .set_default("database.min_connections", 5)?
            .set_default("cache.enabled", false)?
            .set_default("u2f.allow_untrusted", false)?
            .set_default("transactions.max_per_user", 5)?
            .set_default("transactions.ttl_secs", 300)?
            // Optional config file
            .add_source(config::File::with_name("config").required(false))
            // Environment variables (WARDEN_DATABASE__URL, WARDEN_U2F__METADATA, etc.)
            .add_source(
                config::Environment::with_prefix("WARDEN")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        cfg.try_deserialize()
    }
}
