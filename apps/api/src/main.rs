mod auth;
mod billing;
mod config;
mod db;
mod errors;
mod models;
mod notify;
mod referrals;
mod routes;
mod state;
mod store;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::billing::stripe::StripeClient;
use crate::config::Config;
use crate::db::create_pool;
use crate::notify::email::EmailClient;
use crate::notify::outbox::{run_dispatcher, RedisOutbox};
use crate::routes::build_router;
use crate::state::AppState;
use crate::store::postgres::PgStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails on missing required env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{}={}", env!("CARGO_CRATE_NAME"), &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Ledger API v{}", env!("CARGO_PKG_VERSION"));

    // PostgreSQL: users, referrals, fulfillment markers, payment logs
    let store = Arc::new(PgStore::new(create_pool(&config.database_url).await?));

    // Redis outbox and the dispatcher that drains it into the email service
    let redis = redis::Client::open(config.redis_url.clone())?;
    let email = EmailClient::new(&config.email_service_url)?;
    tokio::spawn(run_dispatcher(
        redis.clone(),
        config.notification_queue.clone(),
        email,
    ));
    let notifier = Arc::new(RedisOutbox::new(redis, &config.notification_queue));
    info!("Notification outbox on '{}'", config.notification_queue);

    let checkout = Arc::new(StripeClient::new(config.stripe_secret_key.clone())?);

    let state = AppState {
        referrals: store.clone(),
        billing: store,
        notifier,
        checkout,
        config: config.clone(),
    };

    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
