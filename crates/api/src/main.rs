//! LessonLoop API Server
//!
//! Receives payment-provider webhooks and reconciles them into the billing
//! ledger.

use std::net::SocketAddr;
use std::sync::Arc;

use lessonloop_api::{create_router, AppState, Config};
use lessonloop_billing::{PgLedgerStore, PlanCatalog, SideEffects, SignatureVerifier, WebhookHandler};
use lessonloop_shared::{create_migration_pool, create_pool, run_migrations};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,lessonloop_api=debug,lessonloop_billing=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting LessonLoop API Server v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    tracing::info!("Configuration loaded");

    tracing::info!("Connecting to database...");
    let pool = create_pool(&config.database_url).await?;
    tracing::info!("Database connection established");

    if config.run_migrations {
        // Direct URL when set: poolers don't support the prepared statements migrations use
        let migration_pool = create_migration_pool(config.migration_url()).await?;
        run_migrations(&migration_pool).await?;
        migration_pool.close().await;
    } else {
        tracing::info!("Database migrations skipped (RUN_MIGRATIONS=false)");
    }

    let webhooks = WebhookHandler::new(
        SignatureVerifier::new(config.webhook_secret.clone(), config.webhook_tolerance_secs),
        Arc::new(PgLedgerStore::new(pool.clone())),
        Arc::new(PlanCatalog::from_env()),
        SideEffects::from_env(pool.clone()),
    );
    let state = AppState::new(webhooks);

    let app = create_router(state).layer(TraceLayer::new_for_http());

    let addr: SocketAddr = config.bind_address.parse()?;
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
