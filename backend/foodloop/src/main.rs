//! FoodLoop coordinator entry point.
//!
//! Starts the background matcher that pairs pending listings with nearby
//! NGOs and volunteers, and serves the Axum REST API used by the donor,
//! NGO and volunteer apps.

use std::sync::Arc;

use reqwest::Client;
use tracing::info;
use tracing_subscriber::EnvFilter;

use foodloop::config::Config;
use foodloop::state::AppState;
use foodloop::{db, matcher};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env first, so RUST_LOG can come from it.
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{e}"))?;

    let pool = db::init_pool(&config.database_url).await?;

    // Shared by the ML, SMS, mail and chain clients.
    let client = Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()?;

    let addr = format!("0.0.0.0:{}", config.api_port);
    let state = Arc::new(AppState::from_config(pool, config, client));

    // ─── Background matcher ───────────────────────────────
    tokio::spawn(matcher::run(Arc::clone(&state)));

    // ─── REST API ─────────────────────────────────────────
    let app = foodloop::router(state);

    info!("API listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
