//! Axum REST API handlers.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::auth::{self, AuthUser};
use crate::classifier;
use crate::db::{self, AvailableListing, ImpactStats, NewListing, NewUser};
use crate::errors::{FoodLoopError, Result};
use crate::extract::{JsonBody, PathParam};
use crate::geo::GeoPoint;
use crate::lifecycle;
use crate::matcher;
use crate::models::{
    Actor, AvailabilitySlot, DonationTransaction, FoodListing, ListingStatus, Role, Storage,
    TimelineEvent, TransactionStatus, User,
};
use crate::state::AppState;

type ApiState = State<Arc<AppState>>;

const MIN_PASSWORD_LEN: usize = 8;

// ─────────────────────────────────────────────────────────
// Request / response shapes
// ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub email: String,
    pub password: String,
    pub role: Role,
    pub contact_number: Option<String>,
    pub address: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub wallet_address: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Serialize)]
pub struct AuthResponse {
    pub token: String,
    pub user: User,
}

#[derive(Serialize)]
pub struct ProfileResponse {
    #[serde(flatten)]
    pub user: User,
    pub availability: Vec<AvailabilitySlot>,
}

#[derive(Debug, Deserialize)]
pub struct AvailabilityRequest {
    pub slots: Vec<AvailabilitySlot>,
}

#[derive(Debug, Deserialize)]
pub struct CreateListingRequest {
    pub food_description: String,
    pub food_type: String,
    pub hours_old: f64,
    pub storage: Storage,
    pub weight_kg: f64,
    #[serde(default)]
    pub requires_volunteer: bool,
    /// Unix seconds
    pub expiration_date: i64,
    pub scheduled_for: Option<i64>,
    pub latitude: f64,
    pub longitude: f64,
    pub full_address: String,
}

#[derive(Serialize)]
pub struct ListingsResponse {
    pub count: usize,
    pub listings: Vec<AvailableListing>,
}

#[derive(Serialize)]
pub struct TransactionsResponse {
    pub count: usize,
    pub transactions: Vec<DonationTransaction>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ClaimRequest {
    #[serde(default)]
    pub request_volunteer: bool,
}

#[derive(Debug, Deserialize)]
pub struct PreferencesRequest {
    pub food_preferences: Option<Vec<String>>,
    pub needs_volunteer: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    /// Parsed separately so an unknown value gets a specific error.
    pub status: String,
    pub by: Option<Actor>,
    pub note: Option<String>,
}

#[derive(Serialize)]
pub struct TimelineResponse {
    pub transaction_id: i64,
    pub status: TransactionStatus,
    pub confirmed_by: Vec<i64>,
    /// Newest first.
    pub timeline: Vec<TimelineEvent>,
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `POST /api/auth/register`
///
/// Admin accounts cannot be self-registered.
pub async fn register(
    State(state): ApiState,
    JsonBody(req): JsonBody<RegisterRequest>,
) -> Result<impl IntoResponse> {
    let name = req.name.trim();
    let email = req.email.trim().to_ascii_lowercase();
    if name.is_empty() {
        return Err(FoodLoopError::BadRequest("Name is required".to_string()));
    }
    if !email.contains('@') {
        return Err(FoodLoopError::BadRequest("Invalid email address".to_string()));
    }
    if req.password.chars().count() < MIN_PASSWORD_LEN {
        return Err(FoodLoopError::BadRequest(format!(
            "Password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    if req.role == Role::Admin {
        return Err(FoodLoopError::Forbidden(
            "Admin accounts cannot be registered".to_string(),
        ));
    }

    let point = GeoPoint::new(req.latitude.unwrap_or(0.0), req.longitude.unwrap_or(0.0));
    if !point.is_valid() {
        return Err(FoodLoopError::BadRequest("Invalid coordinates".to_string()));
    }

    let new = NewUser {
        name: name.to_string(),
        email,
        password_hash: auth::hash_password(&req.password)?,
        role: req.role,
        contact_number: req.contact_number,
        address: req.address,
        latitude: point.latitude,
        longitude: point.longitude,
        wallet_address: req.wallet_address.filter(|w| !w.trim().is_empty()),
    };
    let user = db::insert_user(&state.pool, &new, Utc::now().timestamp()).await?;
    let token = state.tokens.issue(&user)?;

    Ok((StatusCode::CREATED, Json(AuthResponse { token, user })))
}

/// `POST /api/auth/login`
pub async fn login(
    State(state): ApiState,
    JsonBody(req): JsonBody<LoginRequest>,
) -> Result<Json<AuthResponse>> {
    let email = req.email.trim().to_ascii_lowercase();
    let invalid = || FoodLoopError::Unauthorized("Invalid email or password".to_string());

    let user = db::get_user_by_email(&state.pool, &email)
        .await?
        .ok_or_else(invalid)?;
    if !auth::verify_password(&req.password, &user.password_hash) {
        tracing::warn!("Failed login for {email}");
        return Err(invalid());
    }

    let token = state.tokens.issue(&user)?;
    Ok(Json(AuthResponse { token, user }))
}

/// `GET /api/user/me`
pub async fn me(State(state): ApiState, caller: AuthUser) -> Result<Json<ProfileResponse>> {
    let user = db::get_user(&state.pool, caller.id)
        .await?
        .ok_or(FoodLoopError::NotFound("User"))?;
    let availability = if user.role == Role::Volunteer {
        db::get_availability(&state.pool, user.id).await?
    } else {
        Vec::new()
    };
    Ok(Json(ProfileResponse { user, availability }))
}

/// `PUT /api/user/availability`
pub async fn set_availability(
    State(state): ApiState,
    caller: AuthUser,
    JsonBody(req): JsonBody<AvailabilityRequest>,
) -> Result<Json<Vec<AvailabilitySlot>>> {
    caller.require_role(Role::Volunteer)?;
    if let Some(bad) = req
        .slots
        .iter()
        .find(|s| !(0..=23).contains(&s.start_hour) || !(s.start_hour..=23).contains(&s.end_hour))
    {
        return Err(FoodLoopError::BadRequest(format!(
            "Invalid availability slot {:?} {}-{}",
            bad.day, bad.start_hour, bad.end_hour
        )));
    }

    db::replace_availability(&state.pool, caller.id, &req.slots).await?;
    Ok(Json(db::get_availability(&state.pool, caller.id).await?))
}

/// `POST /api/donations`
///
/// The meal category comes from the ML service, or `other` if it fails.
pub async fn create_listing(
    State(state): ApiState,
    caller: AuthUser,
    JsonBody(req): JsonBody<CreateListingRequest>,
) -> Result<impl IntoResponse> {
    caller.require_role(Role::Donor)?;

    if req.food_description.trim().is_empty() || req.food_type.trim().is_empty() {
        return Err(FoodLoopError::BadRequest(
            "Food description and type are required".to_string(),
        ));
    }
    if !(req.weight_kg > 0.0) || !(req.hours_old >= 0.0) {
        return Err(FoodLoopError::BadRequest(
            "Weight must be positive and age non-negative".to_string(),
        ));
    }
    let point = GeoPoint::new(req.latitude, req.longitude);
    if !point.is_valid() {
        return Err(FoodLoopError::BadRequest("Invalid coordinates".to_string()));
    }

    let predicted_category = classifier::categorize(
        state.classifier.as_ref(),
        &req.food_description,
        req.hours_old,
        req.storage,
    )
    .await;

    let new = NewListing {
        donor_id: caller.id,
        food_description: req.food_description.trim().to_string(),
        food_type: req.food_type.trim().to_string(),
        predicted_category,
        hours_old: req.hours_old,
        storage: req.storage,
        weight_kg: req.weight_kg,
        requires_volunteer: req.requires_volunteer,
        expiration_date: req.expiration_date,
        scheduled_for: req.scheduled_for,
        latitude: point.latitude,
        longitude: point.longitude,
        full_address: req.full_address,
    };
    let listing = db::insert_listing(&state.pool, &new, Utc::now().timestamp()).await?;
    tracing::info!("Donor {} created listing {}", caller.id, listing.id);

    Ok((StatusCode::CREATED, Json(listing)))
}

/// `GET /api/donations/list`
pub async fn list_available(State(state): ApiState) -> Result<Json<ListingsResponse>> {
    let listings = db::available_listings(&state.pool).await?;
    Ok(Json(ListingsResponse {
        count: listings.len(),
        listings,
    }))
}

/// `GET /api/donations/my`
pub async fn my_donations(
    State(state): ApiState,
    caller: AuthUser,
) -> Result<Json<TransactionsResponse>> {
    caller.require_role(Role::Donor)?;
    let transactions = db::transactions_for(&state.pool, Role::Donor, caller.id).await?;
    Ok(Json(TransactionsResponse {
        count: transactions.len(),
        transactions,
    }))
}

/// `DELETE /api/donations/cancel/:id`
pub async fn cancel_listing(
    State(state): ApiState,
    caller: AuthUser,
    PathParam(listing_id): PathParam<i64>,
) -> Result<Json<serde_json::Value>> {
    caller.require_role(Role::Donor)?;

    let listing: FoodListing = db::get_listing(&state.pool, listing_id)
        .await?
        .ok_or(FoodLoopError::NotFound("Listing"))?;
    if listing.donor_id != caller.id {
        return Err(FoodLoopError::Forbidden(
            "You can only cancel your own listings".to_string(),
        ));
    }
    if listing.status != ListingStatus::Pending
        || !db::delete_pending_listing(&state.pool, listing_id, caller.id).await?
    {
        return Err(FoodLoopError::BadRequest(
            "Only pending listings can be cancelled".to_string(),
        ));
    }

    state.ngo_cache.invalidate(listing_id);
    Ok(Json(json!({ "message": "Listing cancelled", "id": listing_id })))
}

/// `POST /api/ngo/claim/:id`
pub async fn claim_listing(
    State(state): ApiState,
    caller: AuthUser,
    PathParam(listing_id): PathParam<i64>,
    body: Option<JsonBody<ClaimRequest>>,
) -> Result<impl IntoResponse> {
    let request_volunteer = body.map(|JsonBody(b)| b).unwrap_or_default().request_volunteer;
    let outcome =
        lifecycle::claim_listing(&state, &caller, listing_id, request_volunteer, Utc::now()).await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

/// `PATCH /api/ngo/preferences`
pub async fn update_preferences(
    State(state): ApiState,
    caller: AuthUser,
    JsonBody(req): JsonBody<PreferencesRequest>,
) -> Result<Json<User>> {
    caller.require_role(Role::Ngo)?;
    db::update_ngo_preferences(
        &state.pool,
        caller.id,
        req.food_preferences.as_deref(),
        req.needs_volunteer,
        Utc::now().timestamp(),
    )
    .await?;
    let user = db::get_user(&state.pool, caller.id)
        .await?
        .ok_or(FoodLoopError::NotFound("User"))?;
    Ok(Json(user))
}

/// `POST /api/transaction/match`
///
/// Runs one matcher pass immediately.
pub async fn run_match(
    State(state): ApiState,
    caller: AuthUser,
) -> Result<Json<TransactionsResponse>> {
    caller.require_role(Role::Admin)?;
    let transactions = matcher::run_pass(&state, Utc::now()).await?;
    Ok(Json(TransactionsResponse {
        count: transactions.len(),
        transactions,
    }))
}

/// `GET /api/transaction/user`
pub async fn my_transactions(
    State(state): ApiState,
    caller: AuthUser,
) -> Result<Json<TransactionsResponse>> {
    let transactions = db::transactions_for(&state.pool, caller.role, caller.id).await?;
    Ok(Json(TransactionsResponse {
        count: transactions.len(),
        transactions,
    }))
}

/// `GET /api/transaction/orders/:id/timeline`
pub async fn get_timeline(
    State(state): ApiState,
    caller: AuthUser,
    PathParam(transaction_id): PathParam<i64>,
) -> Result<Json<TimelineResponse>> {
    let detail = db::transaction_detail(&state.pool, transaction_id)
        .await?
        .ok_or(FoodLoopError::NotFound("Transaction"))?;
    lifecycle::authorize_party(&detail.transaction, &caller)?;

    let mut timeline = detail.timeline;
    timeline.reverse();
    Ok(Json(TimelineResponse {
        transaction_id,
        status: detail.transaction.status,
        confirmed_by: detail.confirmed_by,
        timeline,
    }))
}

/// `PATCH /api/transaction/orders/:id/status`
pub async fn update_status(
    State(state): ApiState,
    caller: AuthUser,
    PathParam(transaction_id): PathParam<i64>,
    JsonBody(req): JsonBody<StatusRequest>,
) -> Result<Json<lifecycle::StatusUpdate>> {
    let status: TransactionStatus = req.status.parse()?;
    let update = lifecycle::set_status(
        &state,
        &caller,
        transaction_id,
        status,
        req.by,
        req.note,
        Utc::now(),
    )
    .await?;
    Ok(Json(update))
}

/// `POST /api/transaction/confirm-delivery/:id`
///
/// Answers 200 even when minting fails; the body then carries the error.
pub async fn confirm_delivery(
    State(state): ApiState,
    caller: AuthUser,
    PathParam(transaction_id): PathParam<i64>,
) -> Result<Json<serde_json::Value>> {
    let outcome = lifecycle::confirm_delivery(&state, &caller, transaction_id, Utc::now()).await?;
    let body = match (&outcome.certificate, &outcome.mint_error) {
        (Some(certificate), _) => json!({
            "message": "Delivery confirmed and NFT minted",
            "transaction_hash": certificate.transaction_hash,
            "certificate": certificate,
            "transaction": outcome.transaction,
        }),
        (None, error) => json!({
            "message": "Delivery confirmed but NFT minting failed",
            "error": error,
            "transaction": outcome.transaction,
        }),
    };
    Ok(Json(body))
}

/// `GET|POST /api/transaction/confirm/:id/:user_id`
///
/// Target of the accept link in participation emails.
pub async fn confirm_participation(
    State(state): ApiState,
    PathParam((transaction_id, user_id)): PathParam<(i64, i64)>,
) -> Result<Json<serde_json::Value>> {
    let outcome =
        lifecycle::confirm_participation(&state, transaction_id, user_id, Utc::now()).await?;
    let message = if outcome.transaction.status == TransactionStatus::Confirmed {
        "Transaction confirmed by all parties"
    } else {
        "Participation confirmed"
    };
    Ok(Json(json!({
        "message": message,
        "status": outcome.transaction.status,
        "confirmed_by": outcome.confirmed_by,
    })))
}

/// `GET|POST /api/transaction/reject/:id/:user_id`
pub async fn reject_participation(
    State(state): ApiState,
    PathParam((transaction_id, user_id)): PathParam<(i64, i64)>,
) -> Result<Json<serde_json::Value>> {
    lifecycle::reject_participation(&state, transaction_id, user_id, Utc::now()).await?;
    Ok(Json(json!({
        "message": "Transaction rejected; the listing is available again",
    })))
}

/// `GET /api/impact/stats`
pub async fn impact_stats(State(state): ApiState) -> Result<Json<ImpactStats>> {
    Ok(Json(db::impact_stats(&state.pool).await?))
}
