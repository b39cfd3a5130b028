//! EnvClone API - Production-safe environment cloning
//!
//! Clones one database-backed environment into another: schema migration,
//! batched data copy, anonymization and specialized systems, with a backup
//! taken first and restored automatically when a phase fails.
//!
//! SAFETY: production is never a clone target, a production source must
//! explicitly disallow writes, and every write to an environment passes the
//! production safety guard first.

mod auth;
mod backup;
mod clone;
mod config;
mod driver;
mod environment;
mod error;
mod locks;
mod migration;
mod models;
mod routes;
mod safety;
mod schema;
mod state;
mod store;
#[cfg(test)]
mod testing;

use crate::config::{DatabaseConfig, Settings};
use crate::driver::{build_pool, EnvironmentConnector, PostgresProvider};
use crate::environment::ConnectionParams;
use crate::routes::create_router;
use crate::safety::ProductionSafetyGuard;
use crate::schema::PostgresCollector;
use crate::state::AppState;
use crate::store::{FileStateStore, PostgresStateStore, StateStore};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Pool size for each environment's connection pool
const ENVIRONMENT_POOL_SIZE: usize = 8;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber for structured logging
    init_tracing();

    info!("🚀 Starting EnvClone - production-safe environment cloning...");

    // Load configuration
    let settings = Settings::load()?;
    info!("📋 Configuration loaded successfully");

    let store = init_state_store(&settings).await?;

    let guard = Arc::new(ProductionSafetyGuard::new(&settings.clone)?);
    let provider = Arc::new(PostgresProvider::new(ENVIRONMENT_POOL_SIZE));
    let collector = Arc::new(PostgresCollector::new(provider.clone()));
    let connector = EnvironmentConnector::new(provider, guard);

    let state = Arc::new(AppState::new(
        &settings.clone,
        connector,
        collector,
        store,
        settings.auth.jwt_secret.clone(),
    ));

    let recovered = state.orchestrator.recover_interrupted().await?;
    if recovered > 0 {
        warn!("⚠️  {} clone operations were interrupted by the last shutdown", recovered);
    }

    // Build the router
    let app = create_router(state, &settings);

    // Create socket address
    let addr = SocketAddr::from((settings.server.host, settings.server.port));

    info!("🌐 Server listening on http://{}", addr);
    info!("");
    info!("📚 API Endpoints:");
    info!("   ─── Environments ───");
    info!("   POST /api/environments                    - Register an environment");
    info!("   GET  /api/environments/:id/classification - Production classification");
    info!("   GET  /api/environments/:id/schema         - Schema snapshot");
    info!("");
    info!("   ─── Cloning ───");
    info!("   POST /api/schema/compare                  - Compare two environments");
    info!("   POST /api/schema/migration                - Preview the migration script");
    info!("   POST /api/clones                          - Start a clone");
    info!("   POST /api/clones/:id/cancel|pause|resume  - Control a running clone");
    info!("");
    info!("   ─── Backups ───");
    info!("   POST /api/environments/:id/backups        - Back up an environment");
    info!("   POST /api/backups/:id/restore             - Full restore (admin)");
    info!("   POST /api/backups/:id/rollback            - Granular rollback (admin)");
    info!("   POST /api/backups/:id/verify              - Restore-test into a scratch environment");
    info!("");

    // Create TCP listener and serve
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("👋 Server shutdown complete");
    Ok(())
}

/// Initialize tracing with structured logging; `LOG_FORMAT=json` for log shipping
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,envclone_api=debug,tower_http=debug"));

    let registry = tracing_subscriber::registry().with(env_filter);
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    if json {
        registry
            .with(fmt::layer().json().with_current_span(true).with_target(true))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true)
                    .compact(),
            )
            .init();
    }
}

/// PostgreSQL when DATABASE_URL is set, JSON files under `state_dir` otherwise
async fn init_state_store(settings: &Settings) -> anyhow::Result<Arc<dyn StateStore>> {
    match &settings.database {
        Some(database) => {
            let pool = build_pool(&connection_params(database), database.max_pool_size)?;

            // Test the connection
            let client = pool.get().await?;
            client.query_one("SELECT 1 as ok", &[]).await?;
            drop(client);

            let store = PostgresStateStore::new(pool);
            store.init().await?;
            info!(
                "✅ State store: PostgreSQL at {}:{}/{} (TLS: {})",
                database.host, database.port, database.database, database.require_tls
            );
            Ok(Arc::new(store))
        }
        None => {
            warn!("⚠️  DATABASE_URL not set, keeping state in {}", settings.clone.state_dir.display());
            Ok(Arc::new(FileStateStore::open(settings.clone.state_dir.clone()).await?))
        }
    }
}

fn connection_params(database: &DatabaseConfig) -> ConnectionParams {
    ConnectionParams {
        host: database.host.clone(),
        port: database.port,
        user: database.user.clone(),
        password: database.password.clone(),
        database: database.database.clone(),
        require_tls: database.require_tls,
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("📴 Received Ctrl+C signal, initiating graceful shutdown...");
        },
        _ = terminate => {
            info!("📴 Received terminate signal, initiating graceful shutdown...");
        },
    }
}
