//! Transaction lifecycle: claims, status updates, participation
//! confirmation or rejection, and delivery notarization.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::auth::AuthUser;
use crate::config::ZERO_ADDRESS;
use crate::db::{self, NewTransaction};
use crate::errors::{FoodLoopError, Result};
use crate::matcher;
use crate::models::{
    Actor, CertificateData, DonationTransaction, FoodListing, ListingStatus, Role, TimelineEvent,
    TransactionStatus, User,
};
use crate::notarizer::MintRequest;
use crate::notify;
use crate::state::AppState;

const PENDING: &str = "pending";

/// Users whose confirmation is needed before a transaction is confirmed.
pub fn required_confirmers(tx: &DonationTransaction) -> Vec<i64> {
    let mut required = vec![tx.ngo_id];
    required.extend(tx.volunteer_id);
    required
}

pub fn all_confirmed(tx: &DonationTransaction, confirmed_by: &[i64]) -> bool {
    required_confirmers(tx)
        .iter()
        .all(|id| confirmed_by.contains(id))
}

pub fn authorize_party(tx: &DonationTransaction, caller: &AuthUser) -> Result<()> {
    if caller.role == Role::Admin || tx.involves(caller.id) {
        Ok(())
    } else {
        Err(FoodLoopError::Forbidden(
            "Not a party to this transaction".to_string(),
        ))
    }
}

fn is_participant(tx: &DonationTransaction, user_id: i64) -> bool {
    tx.ngo_id == user_id || tx.volunteer_id == Some(user_id)
}

async fn load_transaction(state: &AppState, id: i64) -> Result<DonationTransaction> {
    db::get_transaction(&state.pool, id)
        .await?
        .ok_or(FoodLoopError::NotFound("Transaction"))
}

async fn load_user(state: &AppState, id: Option<i64>) -> Option<User> {
    let id = id?;
    match db::get_user(&state.pool, id).await {
        Ok(user) => user,
        Err(e) => {
            warn!("Could not load user {id}: {e}");
            None
        }
    }
}

/// Certificate contents for a delivery. Hash and token id start as
/// `"pending"` and are filled in after minting.
pub fn build_certificate(
    listing: Option<&FoodListing>,
    donor: Option<&User>,
    weight_kg: f64,
    now: DateTime<Utc>,
) -> CertificateData {
    CertificateData {
        transaction_hash: PENDING.to_string(),
        nft_token_id: Some(PENDING.to_string()),
        donor_name: donor.map(|d| d.name.clone()),
        donor_email: donor.map(|d| d.email.clone()),
        food_type: listing
            .map(|l| l.food_type.clone())
            .unwrap_or_else(|| "Unknown".to_string()),
        weight: format!("{weight_kg} kg"),
        location: listing
            .map(FoodListing::location_label)
            .unwrap_or_else(|| "Location not available".to_string()),
        timestamp: now.to_rfc3339(),
        date: now.format("%Y-%m-%d").to_string(),
    }
}

// ─────────────────────────────────────────────────────────
// Claim
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ClaimOutcome {
    pub listing: Option<FoodListing>,
    pub transaction: DonationTransaction,
}

/// An NGO claims a pending listing directly.
pub async fn claim_listing(
    state: &AppState,
    caller: &AuthUser,
    listing_id: i64,
    request_volunteer: bool,
    now: DateTime<Utc>,
) -> Result<ClaimOutcome> {
    caller.require_role(Role::Ngo)?;

    let listing = db::get_listing(&state.pool, listing_id)
        .await?
        .ok_or(FoodLoopError::NotFound("Listing"))?;
    if listing.status != ListingStatus::Pending {
        return Err(FoodLoopError::BadRequest(
            "Listing is not available for claiming".to_string(),
        ));
    }

    let ngo = db::get_user(&state.pool, caller.id)
        .await?
        .ok_or(FoodLoopError::NotFound("NGO"))?;
    let donor = db::get_user(&state.pool, listing.donor_id).await?;
    let volunteer = if request_volunteer {
        matcher::nearest_volunteer(state, listing.point()).await?
    } else {
        None
    };

    let new = NewTransaction {
        listing_id: listing.id,
        donor_id: listing.donor_id,
        ngo_id: ngo.id,
        volunteer_id: volunteer.as_ref().map(|v| v.id),
        weight_kg: listing.weight_kg,
        status: TransactionStatus::Requested,
        opened_by: Actor::Ngo,
        certificate: Some(build_certificate(
            Some(&listing),
            donor.as_ref(),
            listing.weight_kg,
            now,
        )),
    };
    let transaction = db::open_transaction(&state.pool, &new, now.timestamp())
        .await?
        .ok_or_else(|| FoodLoopError::Conflict("Listing was already claimed".to_string()))?;
    state.ngo_cache.invalidate(listing.id);

    info!(
        "NGO {} claimed listing {} (transaction {})",
        ngo.id, listing.id, transaction.id
    );

    let notifier = state.notifier.as_ref();
    if let Some(donor) = &donor {
        notify::sms_user(notifier, donor, &notify::donor_claimed_sms(donor, transaction.id)).await;
    }
    notify::sms_user(notifier, &ngo, &notify::ngo_claimed_sms(&ngo, transaction.id)).await;
    if let Some(volunteer) = &volunteer {
        let body = notify::volunteer_assigned_sms(volunteer, transaction.id);
        notify::sms_user(notifier, volunteer, &body).await;
    }

    Ok(ClaimOutcome {
        listing: db::get_listing(&state.pool, listing.id).await?,
        transaction,
    })
}

// ─────────────────────────────────────────────────────────
// Status updates
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct StatusUpdate {
    pub status: TransactionStatus,
    /// `None` when an identical `(status, actor)` event already existed.
    pub event: Option<TimelineEvent>,
    pub timeline: Vec<TimelineEvent>,
}

/// Overwrite a transaction's status and append a deduplicated timeline
/// event. Reachability from the current status is not checked.
pub async fn set_status(
    state: &AppState,
    caller: &AuthUser,
    transaction_id: i64,
    status: TransactionStatus,
    by: Option<Actor>,
    note: Option<String>,
    now: DateTime<Utc>,
) -> Result<StatusUpdate> {
    if !status.is_settable() {
        return Err(FoodLoopError::BadRequest(
            "Use the reject endpoint to reject a transaction".to_string(),
        ));
    }

    let tx = load_transaction(state, transaction_id).await?;
    authorize_party(&tx, caller)?;

    let actor = by.unwrap_or_else(|| Actor::from(caller.role));
    let note = note.unwrap_or_else(|| format!("Status updated to {}", status.as_str()));
    let ts = now.timestamp();

    let appended = db::set_status(&state.pool, tx.id, status, actor, &note, ts).await?;
    info!(
        "Transaction {} → {} by {actor:?}{}",
        tx.id,
        status.as_str(),
        if appended { "" } else { " (event already recorded)" }
    );

    Ok(StatusUpdate {
        status,
        event: appended.then(|| TimelineEvent {
            status,
            actor,
            note: Some(note),
            timestamp: ts,
        }),
        timeline: db::timeline(&state.pool, tx.id).await?,
    })
}

// ─────────────────────────────────────────────────────────
// Participation
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ConfirmOutcome {
    pub transaction: DonationTransaction,
    pub confirmed_by: Vec<i64>,
    /// Whether this call moved the transaction to `confirmed`.
    pub finalized: bool,
}

/// Record `user_id`'s acceptance. The last required confirmation moves the
/// transaction to `confirmed` and notifies every party once.
pub async fn confirm_participation(
    state: &AppState,
    transaction_id: i64,
    user_id: i64,
    now: DateTime<Utc>,
) -> Result<ConfirmOutcome> {
    let tx = load_transaction(state, transaction_id).await?;
    if !is_participant(&tx, user_id) {
        return Err(FoodLoopError::Forbidden(
            "Not authorized to confirm this transaction".to_string(),
        ));
    }

    let ts = now.timestamp();
    db::add_confirmation(&state.pool, tx.id, user_id, ts).await?;
    let confirmed_by = db::confirmed_by(&state.pool, tx.id).await?;

    let finalized =
        all_confirmed(&tx, &confirmed_by) && db::finalize_confirmation(&state.pool, &tx, ts).await?;

    if finalized {
        info!("Transaction {} confirmed by all parties", tx.id);
        notify_confirmed(state, &tx).await;
    }

    Ok(ConfirmOutcome {
        transaction: load_transaction(state, tx.id).await?,
        confirmed_by,
        finalized,
    })
}

async fn notify_confirmed(state: &AppState, tx: &DonationTransaction) {
    let notifier = state.notifier.as_ref();
    if let Some(donor) = load_user(state, Some(tx.donor_id)).await {
        notify::sms_user(notifier, &donor, &notify::donor_confirmed_sms(&donor, tx.id)).await;
    }
    if let Some(ngo) = load_user(state, Some(tx.ngo_id)).await {
        notify::sms_user(notifier, &ngo, &notify::ngo_claimed_sms(&ngo, tx.id)).await;
    }
    if let Some(volunteer) = load_user(state, tx.volunteer_id).await {
        let body = notify::volunteer_assigned_sms(&volunteer, tx.id);
        notify::sms_user(notifier, &volunteer, &body).await;
    }
}

/// Drop the transaction, return the listing to the pool and kick off a
/// fresh matching pass that skips the rejecting user. Only transactions
/// still `pending` or `requested` can be rejected.
pub async fn reject_participation(
    state: &Arc<AppState>,
    transaction_id: i64,
    user_id: i64,
    now: DateTime<Utc>,
) -> Result<()> {
    let tx = load_transaction(state, transaction_id).await?;
    if !is_participant(&tx, user_id) {
        return Err(FoodLoopError::Forbidden(
            "Not authorized to reject this transaction".to_string(),
        ));
    }

    if !db::reject_transaction(&state.pool, &tx, user_id, now.timestamp()).await? {
        return Err(FoodLoopError::Conflict(
            "Transaction is already under way and can no longer be rejected".to_string(),
        ));
    }
    if let Some(listing_id) = tx.listing_id {
        state.ngo_cache.invalidate(listing_id);
    }
    info!("Transaction {} rejected by user {user_id}", tx.id);

    let state = Arc::clone(state);
    tokio::spawn(async move {
        if let Err(e) = matcher::run_pass(&state, Utc::now()).await {
            error!("Re-match after rejection failed: {e}");
        }
    });
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Delivery confirmation
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct DeliveryOutcome {
    pub transaction: DonationTransaction,
    /// Present when the certificate was minted.
    pub certificate: Option<CertificateData>,
    /// The minting error when the delivery was confirmed off-chain only.
    pub mint_error: Option<String>,
}

/// Confirm delivery and mint the certificate. A failed mint still confirms
/// the delivery, without a chain record. Concurrent calls for the same
/// transaction mint at most once.
pub async fn confirm_delivery(
    state: &AppState,
    caller: &AuthUser,
    transaction_id: i64,
    now: DateTime<Utc>,
) -> Result<DeliveryOutcome> {
    let tx = load_transaction(state, transaction_id).await?;
    authorize_party(&tx, caller)?;

    if tx.status == TransactionStatus::OnChain {
        if let Some(hash) = &tx.transaction_hash {
            return Err(FoodLoopError::BadRequest(format!(
                "Transaction already confirmed on blockchain: {hash}"
            )));
        }
    }

    if !db::begin_mint(&state.pool, tx.id, now.timestamp()).await? {
        return Err(FoodLoopError::Conflict(
            "Delivery confirmation is already in progress".to_string(),
        ));
    }

    let outcome = mint_and_record(state, caller, &tx, now).await;
    if outcome.is_err() {
        if let Err(e) = db::abandon_mint(&state.pool, tx.id).await {
            error!("Could not clear mint mark on transaction {}: {e}", tx.id);
        }
    }
    outcome
}

async fn mint_and_record(
    state: &AppState,
    caller: &AuthUser,
    tx: &DonationTransaction,
    now: DateTime<Utc>,
) -> Result<DeliveryOutcome> {
    let listing = match tx.listing_id {
        Some(id) => db::get_listing(&state.pool, id).await?,
        None => None,
    };
    let donor = db::get_user(&state.pool, tx.donor_id).await?;
    let mut certificate = build_certificate(listing.as_ref(), donor.as_ref(), tx.weight_kg, now);

    let default_wallet = state
        .config
        .chain
        .as_ref()
        .map_or(ZERO_ADDRESS, |c| c.default_wallet.as_str());
    let donor_address = donor
        .as_ref()
        .and_then(|d| d.wallet_address.as_deref())
        .filter(|w| !w.trim().is_empty())
        .unwrap_or(default_wallet)
        .to_string();

    let request = MintRequest {
        delivery_id: tx.id.unsigned_abs(),
        donor_address,
        food_type: certificate.food_type.clone(),
        weight: tx.weight_kg.to_string(),
        location: certificate.location.clone(),
        timestamp: certificate.timestamp.clone(),
    };

    let actor = Actor::from(caller.role);
    let ts = now.timestamp();
    match state.notarizer.mint(&request).await {
        Ok(receipt) => {
            certificate.transaction_hash = receipt.transaction_hash;
            certificate.nft_token_id = receipt.token_id;
            db::record_mint(&state.pool, tx, &certificate, actor, ts).await?;
            info!(
                "Transaction {} minted on chain: {}",
                tx.id, certificate.transaction_hash
            );
            Ok(DeliveryOutcome {
                transaction: load_transaction(state, tx.id).await?,
                certificate: Some(certificate),
                mint_error: None,
            })
        }
        Err(e) => {
            warn!("Minting certificate for transaction {} failed: {e}", tx.id);
            db::record_mint_failure(&state.pool, tx.id, actor, ts).await?;
            Ok(DeliveryOutcome {
                transaction: load_transaction(state, tx.id).await?,
                certificate: None,
                mint_error: Some(e.to_string()),
            })
        }
    }
}
