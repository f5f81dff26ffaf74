//! # Warden Server
//!
//! Main binary: runs the U2F validation REST service and provides the
//! operator CLI for database setup and relying-party client management.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use validator::Validate;
use warden_api::attestation::AttestationService;
use warden_api::engine::Engine;
use warden_api::{build_router, AppState};
use warden_common::config::AppConfig;
use warden_common::models::client::NewClient;
use warden_common::WardenError;
use warden_db::repository::clients;
use warden_db::transaction_store::{CacheStore, DbStore, TransactionStore};
use warden_db::Database;

#[derive(Parser)]
#[command(name = "warden", version, about = "U2F validation server")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP service.
    Run,
    /// Database administration.
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    /// Relying-party client administration.
    Client {
        #[command(subcommand)]
        command: ClientCommand,
    },
}

#[derive(Subcommand)]
enum DbCommand {
    /// Initialize the database by creating the tables.
    Init,
}

#[derive(Subcommand)]
enum ClientCommand {
    /// List the existing clients.
    List,
    /// Register a new client.
    Create {
        name: String,
        /// The U2F AppID (an absolute URL).
        app_id: String,
        /// Valid facets; defaults to the AppID when it is an origin.
        facets: Vec<String>,
    },
    /// Change the AppID and valid facets of an existing client.
    Update {
        name: String,
        app_id: String,
        facets: Vec<String>,
    },
    /// Print one client as JSON.
    Show { name: String },
    /// Delete a client and all of its users.
    Delete { name: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = AppConfig::load()?;

    // Initialize tracing (structured logging)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warden=info,tower_http=info".into()),
        )
        .with_target(true)
        .init();

    match cli.command {
        Command::Run => run(config).await,
        Command::Db {
            command: DbCommand::Init,
        } => {
            let db = Database::connect(&config).await?;
            db.migrate().await?;
            println!("Database initialized!");
            Ok(())
        }
        Command::Client { command } => client_command(config, command).await,
    }
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
    tracing::info!("🔐 Starting warden v{}", env!("CARGO_PKG_VERSION"));

    let db = Database::connect(&config).await?;
    db.migrate().await?;

    let store = if config.cache.enabled {
        let redis = db
            .redis
            .clone()
            .ok_or_else(|| anyhow::anyhow!("cache.enabled is set but Redis is not connected"))?;
        TransactionStore::Cache(CacheStore::new(
            redis,
            config.transactions.max_per_user,
            config.transactions.ttl_secs,
        ))
    } else {
        TransactionStore::Db(DbStore::new(
            config.transactions.max_per_user,
            config.transactions.ttl_secs,
        ))
    };

    let attestation = AttestationService::load(config.u2f.metadata.as_deref())?;
    if config.u2f.allow_untrusted {
        tracing::warn!("allow_untrusted is set: unattested devices will be accepted");
    }

    let engine = Engine::new(db, store, attestation, config.u2f.allow_untrusted);
    let router = build_router(Arc::new(AppState { engine }));

    let addr = SocketAddr::new(config.server.host.parse()?, config.server.port);
    tracing::info!("📡 REST API listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

async fn client_command(config: AppConfig, command: ClientCommand) -> anyhow::Result<()> {
    let db = Database::connect(&config).await?;
    let mut conn = db.pool.acquire().await?;

    match command {
        ClientCommand::List => {
            for client in clients::list(&mut conn).await? {
                println!("{}", client.name);
            }
        }
        ClientCommand::Create {
            name,
            app_id,
            facets,
        } => {
            let facets = default_facets(&app_id, facets)?;
            let new_client = NewClient {
                name,
                app_id,
                facets,
            };
            new_client.validate().map_err(WardenError::from)?;
            let client = clients::create(
                &mut conn,
                &new_client.name,
                &new_client.app_id,
                &new_client.facets,
            )
            .await?;
            println!("Created client: {}", client.name);
        }
        ClientCommand::Update {
            name,
            app_id,
            facets,
        } => {
            let existing = clients::find_by_name(&mut conn, &name)
                .await?
                .ok_or_else(|| anyhow::anyhow!("no such client: {name}"))?;
            let facets = default_facets(&app_id, facets)?;
            let new_client = NewClient {
                name,
                app_id,
                facets,
            };
            new_client.validate().map_err(WardenError::from)?;
            let client = clients::update(
                &mut conn,
                existing.id,
                &new_client.app_id,
                &new_client.facets,
            )
            .await?;
            println!("Updated client: {}", client.name);
        }
        ClientCommand::Show { name } => {
            let client = clients::find_by_name(&mut conn, &name)
                .await?
                .ok_or_else(|| anyhow::anyhow!("no such client: {name}"))?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "name": client.name,
                    "appId": client.app_id,
                    "facets": client.valid_facets,
                }))?
            );
        }
        ClientCommand::Delete { name } => {
            let client = clients::find_by_name(&mut conn, &name)
                .await?
                .ok_or_else(|| anyhow::anyhow!("no such client: {name}"))?;
            clients::delete(&mut conn, client.id).await?;
            println!("Deleted client: {name}");
        }
    }
    Ok(())
}

/// Facets default to the AppID itself, but only when the AppID is a plain
/// origin.
fn default_facets(app_id: &str, facets: Vec<String>) -> anyhow::Result<Vec<String>> {
    if !facets.is_empty() {
        return Ok(facets);
    }
    let parsed = url::Url::parse(app_id)?;
    if parsed.origin().ascii_serialization() == app_id.trim_end_matches('/') {
        Ok(vec![app_id.to_owned()])
    } else {
        Err(anyhow::anyhow!(
            "at least one facet is required unless the AppID is an origin"
        ))
    }
}
