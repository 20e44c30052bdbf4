//! Database layer: migrations, queries and the conditional writes that
//! keep listings and transactions consistent.

use std::str::FromStr;

use serde::Serialize;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    types::Json,
    SqliteConnection, SqlitePool,
};
use tracing::info;

use crate::errors::{FoodLoopError, Result};
use crate::models::{
    Actor, AvailabilitySlot, CertificateData, DonationTransaction, FoodCategory, FoodListing,
    ListingStatus, Role, Storage, TimelineEvent, TransactionDetail, TransactionStatus, User,
    Weekday,
};

const USER_COLUMNS: &str = "id, name, email, password_hash, role, contact_number, address, \
     latitude, longitude, food_preferences, needs_volunteer, wallet_address, is_verified, \
     created_at, updated_at";

const LISTING_COLUMNS: &str = "id, donor_id, food_description, food_type, predicted_category, \
     hours_old, storage, weight_kg, is_perishable, requires_volunteer, expiration_date, \
     scheduled_for, latitude, longitude, full_address, status, ngo_id, volunteer_id, \
     created_at, updated_at";

const TRANSACTION_COLUMNS: &str = "id, listing_id, donor_id, ngo_id, volunteer_id, weight_kg, \
     status, transaction_hash, blockchain_confirmed, certificate, delivered_at, confirmed_at, \
     created_at, updated_at";

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };

    let options = SqliteConnectOptions::from_str(&url)?
        .create_if_missing(true)
        .foreign_keys(true);

    // Every connection to `:memory:` opens its own database.
    let pool = if url.contains(":memory:") {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?
    } else {
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?
    };

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

// ─────────────────────────────────────────────────────────
// Users
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct NewUser {
    pub name: String,
    pub email: String,
    pub password_hash: String,
    pub role: Role,
    pub contact_number: Option<String>,
    pub address: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub wallet_address: Option<String>,
}

pub async fn insert_user(pool: &SqlitePool, user: &NewUser, now: i64) -> Result<User> {
    let result = sqlx::query(
        r#"
        INSERT INTO users
            (name, email, password_hash, role, contact_number, address,
             latitude, longitude, wallet_address, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
        "#,
    )
    .bind(&user.name)
    .bind(&user.email)
    .bind(&user.password_hash)
    .bind(user.role)
    .bind(&user.contact_number)
    .bind(&user.address)
    .bind(user.latitude)
    .bind(user.longitude)
    .bind(&user.wallet_address)
    .bind(now)
    .execute(pool)
    .await;

    let id = match result {
        Ok(done) => done.last_insert_rowid(),
        Err(e) if is_unique_violation(&e) => {
            return Err(FoodLoopError::Conflict(
                "An account with this email already exists".to_string(),
            ))
        }
        Err(e) => return Err(e.into()),
    };

    get_user(pool, id).await?.ok_or(FoodLoopError::NotFound("User"))
}

pub async fn get_user(pool: &SqlitePool, id: i64) -> Result<Option<User>> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1");
    Ok(sqlx::query_as::<_, User>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?)
}

pub async fn get_user_by_email(pool: &SqlitePool, email: &str) -> Result<Option<User>> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE email = ?1");
    Ok(sqlx::query_as::<_, User>(&sql)
        .bind(email)
        .fetch_optional(pool)
        .await?)
}

pub async fn users_by_role(pool: &SqlitePool, role: Role) -> Result<Vec<User>> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE role = ?1 ORDER BY id ASC");
    Ok(sqlx::query_as::<_, User>(&sql)
        .bind(role)
        .fetch_all(pool)
        .await?)
}

pub async fn update_ngo_preferences(
    pool: &SqlitePool,
    user_id: i64,
    food_preferences: Option<&[String]>,
    needs_volunteer: Option<bool>,
    now: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE users
        SET    food_preferences = COALESCE(?1, food_preferences),
               needs_volunteer  = COALESCE(?2, needs_volunteer),
               updated_at       = ?3
        WHERE  id = ?4
        "#,
    )
    .bind(food_preferences.map(|p| Json(p.to_vec())))
    .bind(needs_volunteer)
    .bind(now)
    .bind(user_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Replace a volunteer's weekly availability.
pub async fn replace_availability(
    pool: &SqlitePool,
    user_id: i64,
    slots: &[AvailabilitySlot],
) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM volunteer_availability WHERE user_id = ?1")
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
    for slot in slots {
        sqlx::query(
            "INSERT INTO volunteer_availability (user_id, day, start_hour, end_hour) \
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(user_id)
        .bind(slot.day)
        .bind(slot.start_hour)
        .bind(slot.end_hour)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

pub async fn get_availability(pool: &SqlitePool, user_id: i64) -> Result<Vec<AvailabilitySlot>> {
    Ok(sqlx::query_as::<_, AvailabilitySlot>(
        "SELECT day, start_hour, end_hour FROM volunteer_availability \
         WHERE user_id = ?1 ORDER BY rowid ASC",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?)
}

/// Volunteers with an availability slot covering `day` at `hour`.
pub async fn available_volunteers(pool: &SqlitePool, day: Weekday, hour: i64) -> Result<Vec<User>> {
    let sql = format!(
        r#"
        SELECT {USER_COLUMNS}
        FROM   users u
        WHERE  u.role = 'volunteer'
          AND  EXISTS (
                 SELECT 1 FROM volunteer_availability a
                 WHERE  a.user_id = u.id
                   AND  a.day = ?1
                   AND  a.start_hour <= ?2
                   AND  a.end_hour >= ?2
               )
        ORDER  BY u.id ASC
        "#
    );
    Ok(sqlx::query_as::<_, User>(&sql)
        .bind(day)
        .bind(hour)
        .fetch_all(pool)
        .await?)
}

// ─────────────────────────────────────────────────────────
// Listings
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct NewListing {
    pub donor_id: i64,
    pub food_description: String,
    pub food_type: String,
    pub predicted_category: FoodCategory,
    pub hours_old: f64,
    pub storage: Storage,
    pub weight_kg: f64,
    pub requires_volunteer: bool,
    pub expiration_date: i64,
    pub scheduled_for: Option<i64>,
    pub latitude: f64,
    pub longitude: f64,
    pub full_address: String,
}

pub async fn insert_listing(pool: &SqlitePool, listing: &NewListing, now: i64) -> Result<FoodListing> {
    let id = sqlx::query(
        r#"
        INSERT INTO food_listings
            (donor_id, food_description, food_type, predicted_category, hours_old, storage,
             weight_kg, is_perishable, requires_volunteer, expiration_date, scheduled_for,
             latitude, longitude, full_address, status, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, 'pending', ?15, ?15)
        "#,
    )
    .bind(listing.donor_id)
    .bind(&listing.food_description)
    .bind(&listing.food_type)
    .bind(listing.predicted_category)
    .bind(listing.hours_old)
    .bind(listing.storage)
    .bind(listing.weight_kg)
    .bind(listing.storage.is_perishable())
    .bind(listing.requires_volunteer)
    .bind(listing.expiration_date)
    .bind(listing.scheduled_for)
    .bind(listing.latitude)
    .bind(listing.longitude)
    .bind(&listing.full_address)
    .bind(now)
    .execute(pool)
    .await?
    .last_insert_rowid();

    get_listing(pool, id).await?.ok_or(FoodLoopError::NotFound("Listing"))
}

pub async fn get_listing(pool: &SqlitePool, id: i64) -> Result<Option<FoodListing>> {
    let sql = format!("SELECT {LISTING_COLUMNS} FROM food_listings WHERE id = ?1");
    Ok(sqlx::query_as::<_, FoodListing>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?)
}

/// Pending listings whose schedule time has passed, perishable first and
/// then by schedule time. Unscheduled listings use their creation time.
pub async fn eligible_listings(pool: &SqlitePool, now: i64) -> Result<Vec<FoodListing>> {
    let sql = format!(
        r#"
        SELECT {LISTING_COLUMNS}
        FROM   food_listings
        WHERE  status = 'pending'
          AND  COALESCE(scheduled_for, created_at) <= ?1
        ORDER  BY is_perishable DESC, COALESCE(scheduled_for, created_at) ASC, id ASC
        "#
    );
    Ok(sqlx::query_as::<_, FoodListing>(&sql)
        .bind(now)
        .fetch_all(pool)
        .await?)
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AvailableListing {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub listing: FoodListing,
    pub donor_name: String,
}

/// Pending listings not referenced by any transaction, newest first.
pub async fn available_listings(pool: &SqlitePool) -> Result<Vec<AvailableListing>> {
    let columns = LISTING_COLUMNS
        .split(", ")
        .map(|c| format!("l.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        r#"
        SELECT {columns}, u.name AS donor_name
        FROM   food_listings l
        JOIN   users u ON u.id = l.donor_id
        WHERE  l.status = 'pending'
          AND  NOT EXISTS (SELECT 1 FROM transactions t WHERE t.listing_id = l.id)
        ORDER  BY l.created_at DESC, l.id DESC
        "#
    );
    Ok(sqlx::query_as::<_, AvailableListing>(&sql)
        .fetch_all(pool)
        .await?)
}

/// Delete a listing if it belongs to `donor_id` and is still pending.
/// Returns `false` when nothing matched.
pub async fn delete_pending_listing(pool: &SqlitePool, id: i64, donor_id: i64) -> Result<bool> {
    let affected = sqlx::query(
        "DELETE FROM food_listings WHERE id = ?1 AND donor_id = ?2 AND status = 'pending'",
    )
    .bind(id)
    .bind(donor_id)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(affected == 1)
}

pub async fn listing_has_transaction(pool: &SqlitePool, listing_id: i64) -> Result<bool> {
    let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM transactions WHERE listing_id = ?1 LIMIT 1")
        .bind(listing_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.is_some())
}

/// Users who rejected a transaction for this listing.
pub async fn rejected_user_ids(pool: &SqlitePool, listing_id: i64) -> Result<Vec<i64>> {
    let rows: Vec<(i64,)> =
        sqlx::query_as("SELECT user_id FROM listing_rejections WHERE listing_id = ?1")
            .bind(listing_id)
            .fetch_all(pool)
            .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Delete confirmed listings last updated before `cutoff`.
pub async fn expire_confirmed_listings(pool: &SqlitePool, cutoff: i64) -> Result<u64> {
    Ok(
        sqlx::query("DELETE FROM food_listings WHERE status = 'confirmed' AND updated_at < ?1")
            .bind(cutoff)
            .execute(pool)
            .await?
            .rows_affected(),
    )
}

// ─────────────────────────────────────────────────────────
// Transactions
// ─────────────────────────────────────────────────────────

/// Everything needed to open a transaction for a pending listing.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub listing_id: i64,
    pub donor_id: i64,
    pub ngo_id: i64,
    pub volunteer_id: Option<i64>,
    pub weight_kg: f64,
    pub status: TransactionStatus,
    pub opened_by: Actor,
    pub certificate: Option<CertificateData>,
}

/// Flip a pending listing to `requested` and open its transaction, in one
/// store transaction. Returns `None` when the listing is no longer pending.
pub async fn open_transaction(
    pool: &SqlitePool,
    new: &NewTransaction,
    now: i64,
) -> Result<Option<DonationTransaction>> {
    let mut tx = pool.begin().await?;

    let claimed = sqlx::query(
        r#"
        UPDATE food_listings
        SET    status = 'requested', ngo_id = ?1, volunteer_id = ?2, updated_at = ?3
        WHERE  id = ?4 AND status = 'pending'
        "#,
    )
    .bind(new.ngo_id)
    .bind(new.volunteer_id)
    .bind(now)
    .bind(new.listing_id)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if claimed == 0 {
        tx.rollback().await?;
        return Ok(None);
    }

    let id = sqlx::query(
        r#"
        INSERT INTO transactions
            (listing_id, donor_id, ngo_id, volunteer_id, weight_kg, status, certificate,
             created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
        "#,
    )
    .bind(new.listing_id)
    .bind(new.donor_id)
    .bind(new.ngo_id)
    .bind(new.volunteer_id)
    .bind(new.weight_kg)
    .bind(new.status)
    .bind(new.certificate.clone().map(Json))
    .bind(now)
    .execute(&mut *tx)
    .await?
    .last_insert_rowid();

    append_event(&mut tx, id, new.status, new.opened_by, None, now).await?;
    tx.commit().await?;

    get_transaction(pool, id).await
}

pub async fn get_transaction(pool: &SqlitePool, id: i64) -> Result<Option<DonationTransaction>> {
    let sql = format!("SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE id = ?1");
    Ok(sqlx::query_as::<_, DonationTransaction>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?)
}

pub async fn timeline(pool: &SqlitePool, transaction_id: i64) -> Result<Vec<TimelineEvent>> {
    Ok(sqlx::query_as::<_, TimelineEvent>(
        "SELECT status, actor, note, timestamp FROM timeline_events \
         WHERE transaction_id = ?1 ORDER BY timestamp ASC, id ASC",
    )
    .bind(transaction_id)
    .fetch_all(pool)
    .await?)
}

pub async fn confirmed_by(pool: &SqlitePool, transaction_id: i64) -> Result<Vec<i64>> {
    let rows: Vec<(i64,)> = sqlx::query_as(
        "SELECT user_id FROM transaction_confirmations \
         WHERE transaction_id = ?1 ORDER BY created_at ASC, rowid ASC",
    )
    .bind(transaction_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

pub async fn transaction_detail(pool: &SqlitePool, id: i64) -> Result<Option<TransactionDetail>> {
    let Some(transaction) = get_transaction(pool, id).await? else {
        return Ok(None);
    };
    Ok(Some(TransactionDetail {
        timeline: timeline(pool, id).await?,
        confirmed_by: confirmed_by(pool, id).await?,
        transaction,
    }))
}

/// Transactions visible to a user, newest first. Admins see all of them.
pub async fn transactions_for(
    pool: &SqlitePool,
    role: Role,
    user_id: i64,
) -> Result<Vec<DonationTransaction>> {
    let filter = match role {
        Role::Donor => "WHERE donor_id = ?1",
        Role::Ngo => "WHERE ngo_id = ?1",
        Role::Volunteer => "WHERE volunteer_id = ?1",
        Role::Admin => "",
    };
    let sql = format!(
        "SELECT {TRANSACTION_COLUMNS} FROM transactions {filter} ORDER BY created_at DESC, id DESC"
    );
    let query = sqlx::query_as::<_, DonationTransaction>(&sql);
    let query = if role == Role::Admin { query } else { query.bind(user_id) };
    Ok(query.fetch_all(pool).await?)
}

/// Append a timeline event unless the `(status, actor)` pair already exists.
/// Returns whether a row was written.
async fn append_event(
    conn: &mut SqliteConnection,
    transaction_id: i64,
    status: TransactionStatus,
    actor: Actor,
    note: Option<&str>,
    now: i64,
) -> Result<bool> {
    let affected = sqlx::query(
        r#"
        INSERT OR IGNORE INTO timeline_events (transaction_id, status, actor, note, timestamp)
        VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
    )
    .bind(transaction_id)
    .bind(status)
    .bind(actor)
    .bind(note)
    .bind(now)
    .execute(conn)
    .await?
    .rows_affected();
    Ok(affected == 1)
}

/// Record a status change: append the event (deduplicated) and overwrite
/// the top-level status. Returns whether the event was appended.
pub async fn set_status(
    pool: &SqlitePool,
    transaction_id: i64,
    status: TransactionStatus,
    actor: Actor,
    note: &str,
    now: i64,
) -> Result<bool> {
    let mut tx = pool.begin().await?;
    let appended = append_event(&mut tx, transaction_id, status, actor, Some(note), now).await?;

    sqlx::query(
        r#"
        UPDATE transactions
        SET    status       = ?1,
               updated_at   = ?2,
               delivered_at = CASE WHEN ?1 = 'delivered' THEN ?2 ELSE delivered_at END,
               confirmed_at = CASE WHEN ?1 = 'confirmed' THEN ?2 ELSE confirmed_at END
        WHERE  id = ?3
        "#,
    )
    .bind(status)
    .bind(now)
    .bind(transaction_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(appended)
}

/// Add `user_id` to the transaction's confirmations. Idempotent.
pub async fn add_confirmation(
    pool: &SqlitePool,
    transaction_id: i64,
    user_id: i64,
    now: i64,
) -> Result<bool> {
    let affected = sqlx::query(
        "INSERT OR IGNORE INTO transaction_confirmations (transaction_id, user_id, created_at) \
         VALUES (?1, ?2, ?3)",
    )
    .bind(transaction_id)
    .bind(user_id)
    .bind(now)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(affected == 1)
}

/// Move a fully confirmed transaction to `confirmed` and confirm its
/// listing. Only one caller wins: returns `false` if the transaction had
/// already left `pending`/`requested`.
pub async fn finalize_confirmation(
    pool: &SqlitePool,
    transaction: &DonationTransaction,
    now: i64,
) -> Result<bool> {
    let mut tx = pool.begin().await?;

    let affected = sqlx::query(
        r#"
        UPDATE transactions
        SET    status = 'confirmed', confirmed_at = ?1, updated_at = ?1
        WHERE  id = ?2 AND status IN ('pending', 'requested')
        "#,
    )
    .bind(now)
    .bind(transaction.id)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if affected == 0 {
        tx.rollback().await?;
        return Ok(false);
    }

    if let Some(listing_id) = transaction.listing_id {
        set_listing_status(&mut tx, listing_id, ListingStatus::Confirmed, now).await?;
    }

    tx.commit().await?;
    Ok(true)
}

async fn set_listing_status(
    conn: &mut SqliteConnection,
    listing_id: i64,
    status: ListingStatus,
    now: i64,
) -> Result<()> {
    sqlx::query("UPDATE food_listings SET status = ?1, updated_at = ?2 WHERE id = ?3")
        .bind(status)
        .bind(now)
        .bind(listing_id)
        .execute(conn)
        .await?;
    Ok(())
}

/// Delete a transaction that has not progressed past `requested`, return
/// its listing to `pending` and remember who rejected it. Returns `false`
/// when no such transaction exists.
pub async fn reject_transaction(
    pool: &SqlitePool,
    transaction: &DonationTransaction,
    rejected_by: i64,
    now: i64,
) -> Result<bool> {
    let mut tx = pool.begin().await?;

    let deleted = sqlx::query(
        "DELETE FROM transactions WHERE id = ?1 AND status IN ('pending', 'requested') \
         AND minting = 0",
    )
    .bind(transaction.id)
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if deleted == 0 {
        tx.rollback().await?;
        return Ok(false);
    }

    if let Some(listing_id) = transaction.listing_id {
        sqlx::query(
            r#"
            UPDATE food_listings
            SET    status = 'pending', ngo_id = NULL, volunteer_id = NULL, updated_at = ?1
            WHERE  id = ?2
            "#,
        )
        .bind(now)
        .bind(listing_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT OR IGNORE INTO listing_rejections (listing_id, user_id, created_at) \
             VALUES (?1, ?2, ?3)",
        )
        .bind(listing_id)
        .bind(rejected_by)
        .bind(now)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(true)
}

/// Mark a transaction as being minted. Returns `false` when another mint is
/// in flight or the transaction is already on chain.
pub async fn begin_mint(pool: &SqlitePool, transaction_id: i64, now: i64) -> Result<bool> {
    let affected = sqlx::query(
        r#"
        UPDATE transactions
        SET    minting = 1, updated_at = ?1
        WHERE  id = ?2 AND minting = 0
          AND  NOT (status = 'on_chain' AND transaction_hash IS NOT NULL)
        "#,
    )
    .bind(now)
    .bind(transaction_id)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(affected == 1)
}

/// Clear the minting mark without recording an outcome.
pub async fn abandon_mint(pool: &SqlitePool, transaction_id: i64) -> Result<()> {
    sqlx::query("UPDATE transactions SET minting = 0 WHERE id = ?1")
        .bind(transaction_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Store a successful mint: the transaction goes `on_chain` and its listing
/// is confirmed.
pub async fn record_mint(
    pool: &SqlitePool,
    transaction: &DonationTransaction,
    certificate: &CertificateData,
    actor: Actor,
    now: i64,
) -> Result<bool> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        UPDATE transactions
        SET    status = 'on_chain', transaction_hash = ?1, blockchain_confirmed = 1,
               certificate = ?2, confirmed_at = ?3, updated_at = ?3, minting = 0
        WHERE  id = ?4
        "#,
    )
    .bind(&certificate.transaction_hash)
    .bind(Json(certificate))
    .bind(now)
    .bind(transaction.id)
    .execute(&mut *tx)
    .await?;

    let appended = append_event(
        &mut tx,
        transaction.id,
        TransactionStatus::Confirmed,
        actor,
        Some("Delivery confirmed and NFT minted"),
        now,
    )
    .await?;

    if let Some(listing_id) = transaction.listing_id {
        set_listing_status(&mut tx, listing_id, ListingStatus::Confirmed, now).await?;
    }

    tx.commit().await?;
    Ok(appended)
}

/// Store a delivery confirmation whose mint failed.
pub async fn record_mint_failure(
    pool: &SqlitePool,
    transaction_id: i64,
    actor: Actor,
    now: i64,
) -> Result<bool> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        "UPDATE transactions SET status = 'confirmed', confirmed_at = ?1, updated_at = ?1, \
         minting = 0 WHERE id = ?2",
    )
    .bind(now)
    .bind(transaction_id)
    .execute(&mut *tx)
    .await?;

    let appended = append_event(
        &mut tx,
        transaction_id,
        TransactionStatus::Confirmed,
        actor,
        Some("Delivery confirmed but NFT minting failed"),
        now,
    )
    .await?;

    tx.commit().await?;
    Ok(appended)
}

// ─────────────────────────────────────────────────────────
// Impact
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ImpactStats {
    pub total_donations: i64,
    pub total_weight_kg: f64,
    pub estimated_co2_saved_kg: i64,
    pub blockchain_transactions: i64,
    pub connected_ngos: i64,
}

pub async fn impact_stats(pool: &SqlitePool) -> Result<ImpactStats> {
    let (total_donations, total_weight_kg): (i64, f64) = sqlx::query_as(
        r#"
        SELECT COUNT(*),
               TOTAL(CASE WHEN status IN ('delivered', 'confirmed', 'on_chain')
                          THEN weight_kg ELSE 0.0 END)
        FROM   transactions
        "#,
    )
    .fetch_one(pool)
    .await?;

    let (blockchain_transactions,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM transactions WHERE transaction_hash IS NOT NULL")
            .fetch_one(pool)
            .await?;

    let (connected_ngos,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users WHERE role = 'ngo'")
        .fetch_one(pool)
        .await?;

    Ok(ImpactStats {
        total_donations,
        total_weight_kg,
        estimated_co2_saved_kg: (total_weight_kg * 0.35).round() as i64,
        blockchain_transactions,
        connected_ngos,
    })
}
