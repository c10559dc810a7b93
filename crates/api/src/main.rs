// API server clippy configuration
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! ThinkInk API Server
//!
//! Accounts, authentication and Stripe billing endpoints.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::{header, HeaderName, HeaderValue, Method};
use sqlx::postgres::PgPoolOptions;
use tokio::time::Duration;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use thinkink_api::{
    auth::{spawn_purge_task, PURGE_INTERVAL},
    create_router, AppState, Config, LogFormat, MIGRATOR,
};
use thinkink_billing::{spawn_invariant_checks, INVARIANT_CHECK_INTERVAL};

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,thinkink_api=debug,thinkink_billing=debug".into());

    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }
}

fn cors_layer(config: &Config) -> CorsLayer {
    let allowed_origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect();

    tracing::info!(
        allowed_origins = ?allowed_origins,
        "CORS configured with {} allowed origins",
        allowed_origins.len()
    );

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed_origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::ACCEPT,
            header::ORIGIN,
            HeaderName::from_static("stripe-signature"),
        ])
        .expose_headers([header::CONTENT_TYPE])
        .allow_credentials(true)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let config = Config::from_env()?;
    init_tracing(config.log_format);

    tracing::info!("Starting ThinkInk API Server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(config = ?config, "Configuration loaded");

    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&config.database_url)
        .await?;
    tracing::info!("Database connection established");

    if config.skip_migrations {
        tracing::info!("Database migrations skipped (SKIP_MIGRATIONS=true)");
    } else {
        tracing::info!("Running database migrations...");
        MIGRATOR.run(&pool).await?;
        tracing::info!("Database migrations applied");
    }

    let state = AppState::new(pool, config.clone());

    // Hourly purge of expired revoked tokens
    spawn_purge_task(Arc::clone(&state.revocations), PURGE_INTERVAL);
    tracing::info!("Revoked token purge task started");

    // First sweep runs at startup
    if let Some(billing) = &state.billing {
        spawn_invariant_checks(Arc::clone(billing), INVARIANT_CHECK_INTERVAL);
        tracing::info!("Billing invariant sweep started");
    }

    let app = create_router(state)
        .layer(cors_layer(&config))
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = config.bind_address.parse()?;
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
