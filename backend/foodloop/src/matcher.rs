//! Long-running background task that matches pending listings to nearby
//! NGOs and volunteers, and sweeps out expired confirmed listings.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Local, Timelike, Utc};
use tracing::{debug, error, info, warn};

use crate::cache::CachedNgo;
use crate::db::{self, NewTransaction};
use crate::errors::Result;
use crate::geo::{nearest_first, GeoPoint};
use crate::models::{Actor, DonationTransaction, FoodListing, Role, TransactionStatus, User, Weekday};
use crate::notify;
use crate::state::AppState;

/// Run the matcher loop until the process exits.
pub async fn run(state: Arc<AppState>) {
    info!(
        "Matcher starting: interval {}s, NGO radius {}m",
        state.config.match_interval_secs, state.config.ngo_max_distance_m
    );

    loop {
        let now = Utc::now();
        match run_pass(&state, now).await {
            Ok(created) if !created.is_empty() => {
                info!("Matcher pass opened {} transactions", created.len())
            }
            Ok(_) => {}
            Err(e) => error!("Matcher pass error: {e}"),
        }

        if let Err(e) = sweep_expired(&state, now).await {
            error!("Listing sweep error: {e}");
        }

        tokio::time::sleep(Duration::from_secs(state.config.match_interval_secs)).await;
    }
}

/// Perform a single matching pass over eligible listings.
///
/// A listing that cannot be matched stays `pending` for the next pass.
/// Returns the transactions opened.
pub async fn run_pass(state: &AppState, now: DateTime<Utc>) -> Result<Vec<DonationTransaction>> {
    let listings = db::eligible_listings(&state.pool, now.timestamp()).await?;
    debug!("Matcher found {} eligible listings", listings.len());

    let mut created = Vec::new();
    for listing in &listings {
        match match_listing(state, listing, now).await {
            Ok(Some(tx)) => created.push(tx),
            Ok(None) => {}
            Err(e) => warn!("Failed to match listing {}: {e}", listing.id),
        }
    }
    Ok(created)
}

async fn match_listing(
    state: &AppState,
    listing: &FoodListing,
    now: DateTime<Utc>,
) -> Result<Option<DonationTransaction>> {
    if db::listing_has_transaction(&state.pool, listing.id).await? {
        debug!("Listing {} already has a transaction, skipping", listing.id);
        return Ok(None);
    }

    let excluded = db::rejected_user_ids(&state.pool, listing.id).await?;
    let Some(ngo) = resolve_ngo(state, listing, &excluded).await? else {
        debug!("No NGO available for listing {}", listing.id);
        return Ok(None);
    };

    let volunteer = if listing.requires_volunteer || ngo.needs_volunteer {
        let found = available_volunteer(state, listing.point(), &excluded, now).await?;
        if found.is_none() {
            warn!("No volunteer available for listing {}", listing.id);
        }
        found
    } else {
        None
    };

    let new = NewTransaction {
        listing_id: listing.id,
        donor_id: listing.donor_id,
        ngo_id: ngo.id,
        volunteer_id: volunteer.as_ref().map(|v| v.id),
        weight_kg: listing.weight_kg,
        status: TransactionStatus::Pending,
        opened_by: Actor::System,
        certificate: None,
    };
    let Some(tx) = db::open_transaction(&state.pool, &new, now.timestamp()).await? else {
        debug!("Listing {} was claimed concurrently", listing.id);
        return Ok(None);
    };

    info!(
        "Matched listing {} → transaction {} (NGO {}, volunteer {:?})",
        listing.id, tx.id, ngo.id, tx.volunteer_id
    );
    notify_match(state, &tx, &ngo, volunteer.as_ref()).await;
    Ok(Some(tx))
}

/// Reuse the cached NGO for a listing when it is still valid, otherwise pick
/// the nearest NGO in range that accepts the food type.
async fn resolve_ngo(
    state: &AppState,
    listing: &FoodListing,
    excluded: &[i64],
) -> Result<Option<User>> {
    if let Some(cached) = state.ngo_cache.get(listing.id) {
        if cached.accepts_food_type(&listing.food_type) && !excluded.contains(&cached.ngo_id) {
            let user = db::get_user(&state.pool, cached.ngo_id).await?;
            if let Some(ngo) = user.filter(|u| u.role == Role::Ngo) {
                debug!("NGO cache hit for listing {}", listing.id);
                return Ok(Some(ngo));
            }
        }
        state.ngo_cache.invalidate(listing.id);
    }

    let candidates: Vec<User> = db::users_by_role(&state.pool, Role::Ngo)
        .await?
        .into_iter()
        .filter(|n| !excluded.contains(&n.id))
        .collect();

    let ngo = nearest_first(
        listing.point(),
        candidates,
        Some(state.config.ngo_max_distance_m),
        User::point,
    )
    .into_iter()
    .map(|(ngo, _)| ngo)
    .find(|ngo| ngo.accepts_food_type(&listing.food_type));

    if let Some(ngo) = &ngo {
        state.ngo_cache.insert(
            listing.id,
            CachedNgo {
                ngo_id: ngo.id,
                food_preferences: ngo.food_preferences.0.clone(),
            },
        );
    }
    Ok(ngo)
}

/// Nearest volunteer in range with an availability slot covering the
/// current local weekday and hour.
async fn available_volunteer(
    state: &AppState,
    origin: GeoPoint,
    excluded: &[i64],
    now: DateTime<Utc>,
) -> Result<Option<User>> {
    let local = now.with_timezone(&Local);
    let day = Weekday::from(local.weekday());
    let hour = i64::from(local.hour());

    let candidates: Vec<User> = db::available_volunteers(&state.pool, day, hour)
        .await?
        .into_iter()
        .filter(|v| !excluded.contains(&v.id))
        .collect();

    Ok(nearest_first(
        origin,
        candidates,
        Some(state.config.volunteer_max_distance_m),
        User::point,
    )
    .into_iter()
    .next()
    .map(|(volunteer, _)| volunteer))
}

/// Nearest volunteer at any distance, ignoring availability.
pub async fn nearest_volunteer(state: &AppState, origin: GeoPoint) -> Result<Option<User>> {
    let volunteers = db::users_by_role(&state.pool, Role::Volunteer).await?;
    Ok(nearest_first(origin, volunteers, None, User::point)
        .into_iter()
        .next()
        .map(|(volunteer, _)| volunteer))
}

async fn notify_match(
    state: &AppState,
    tx: &DonationTransaction,
    ngo: &User,
    volunteer: Option<&User>,
) {
    let notifier = state.notifier.as_ref();
    let base = &state.config.public_base_url;

    let ngo_email = notify::participation_request(
        base,
        tx.id,
        ngo,
        &format!("A new donation (ID: {}) near you is ready for pickup.", tx.id),
    );
    notify::email_user(notifier, &ngo_email).await;

    if let Some(volunteer) = volunteer {
        let email = notify::participation_request(
            base,
            tx.id,
            volunteer,
            &format!("You have been matched to deliver donation (ID: {}).", tx.id),
        );
        notify::email_user(notifier, &email).await;
    }

    match db::get_user(&state.pool, tx.donor_id).await {
        Ok(Some(donor)) => {
            notify::email_user(notifier, &notify::match_notice(&donor, tx.id)).await;
        }
        Ok(None) => warn!("Donor {} of transaction {} not found", tx.donor_id, tx.id),
        Err(e) => warn!("Could not load donor {}: {e}", tx.donor_id),
    }
}

/// Delete confirmed listings older than the configured TTL.
pub async fn sweep_expired(state: &AppState, now: DateTime<Utc>) -> Result<u64> {
    let cutoff = now.timestamp() - state.config.confirmed_listing_ttl_secs;
    let removed = db::expire_confirmed_listings(&state.pool, cutoff).await?;
    if removed > 0 {
        info!("Removed {removed} expired confirmed listings");
    }
    Ok(removed)
}
