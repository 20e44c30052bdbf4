//! FoodLoop coordinator.
//!
//! Matches surplus-food listings to nearby NGOs and volunteers, tracks each
//! delivery through a status timeline, and mints a proof-of-delivery
//! certificate on an Ethereum-compatible chain.

pub mod api;
pub mod auth;
pub mod cache;
pub mod classifier;
pub mod config;
pub mod db;
pub mod errors;
pub mod extract;
pub mod geo;
pub mod lifecycle;
pub mod matcher;
pub mod models;
pub mod notarizer;
pub mod notify;
pub mod state;

use std::sync::Arc;

use axum::{
    routing::{delete, get, patch, post, put},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use state::AppState;

/// Build the REST router over shared state.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(api::health))
        .route("/api/auth/register", post(api::register))
        .route("/api/auth/login", post(api::login))
        .route("/api/user/me", get(api::me))
        .route("/api/user/availability", put(api::set_availability))
        .route("/api/donations", post(api::create_listing))
        .route("/api/donations/list", get(api::list_available))
        .route("/api/donations/my", get(api::my_donations))
        .route("/api/donations/cancel/:id", delete(api::cancel_listing))
        .route("/api/ngo/claim/:id", post(api::claim_listing))
        .route("/api/ngo/preferences", patch(api::update_preferences))
        .route("/api/transaction/match", post(api::run_match))
        .route("/api/transaction/user", get(api::my_transactions))
        .route("/api/transaction/orders/:id/timeline", get(api::get_timeline))
        .route("/api/transaction/orders/:id/status", patch(api::update_status))
        .route(
            "/api/transaction/confirm-delivery/:id",
            post(api::confirm_delivery),
        )
        .route(
            "/api/transaction/confirm/:id/:user_id",
            get(api::confirm_participation).post(api::confirm_participation),
        )
        .route(
            "/api/transaction/reject/:id/:user_id",
            get(api::reject_participation).post(api::reject_participation),
        )
        .route("/api/impact/stats", get(api::impact_stats))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
