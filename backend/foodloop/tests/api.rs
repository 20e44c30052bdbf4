use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use tower::ServiceExt;

use foodloop::cache::CachedNgo;
use foodloop::classifier::Classifier;
use foodloop::config::Config;
use foodloop::db::{self, NewTransaction, NewUser};
use foodloop::errors::{FoodLoopError, Result};
use foodloop::matcher;
use foodloop::models::{Actor, ListingStatus, Role, Storage, TransactionStatus};
use foodloop::notarizer::{MintReceipt, MintRequest, Notarizer};
use foodloop::notify::{EmailMessage, Notifier};
use foodloop::state::AppState;

// ─────────────────────────────────────────────────────────
// Fakes
// ─────────────────────────────────────────────────────────

#[derive(Default)]
struct RecordingNotifier {
    sms: Mutex<Vec<(String, String)>>,
    emails: Mutex<Vec<EmailMessage>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_sms(&self, to: &str, body: &str) -> Result<()> {
        self.sms
            .lock()
            .unwrap()
            .push((to.to_string(), body.to_string()));
        Ok(())
    }

    async fn send_email(&self, message: &EmailMessage) -> Result<()> {
        self.emails.lock().unwrap().push(message.clone());
        Ok(())
    }
}

#[derive(Default)]
struct FakeNotarizer {
    fail: bool,
    /// Time a mint takes, to hold concurrent callers in flight.
    latency: Duration,
    requests: Mutex<Vec<MintRequest>>,
}

#[async_trait]
impl Notarizer for FakeNotarizer {
    async fn mint(&self, request: &MintRequest) -> Result<MintReceipt> {
        self.requests.lock().unwrap().push(request.clone());
        tokio::time::sleep(self.latency).await;
        if self.fail {
            return Err(FoodLoopError::Chain("execution reverted".to_string()));
        }
        Ok(MintReceipt {
            transaction_hash: "0xfeed".to_string(),
            token_id: Some("7".to_string()),
        })
    }
}

struct LunchClassifier;

#[async_trait]
impl Classifier for LunchClassifier {
    async fn predict(&self, _: &str, _: f64, _: Storage) -> Result<String> {
        Ok("lunch".to_string())
    }
}

// ─────────────────────────────────────────────────────────
// Harness
// ─────────────────────────────────────────────────────────

struct TestApp {
    state: Arc<AppState>,
    router: Router,
    notifier: Arc<RecordingNotifier>,
    notarizer: Arc<FakeNotarizer>,
}

struct Account {
    id: i64,
    token: String,
}

const DONOR_AT: (f64, f64) = (19.0760, 72.8777);
const NGO_AT: (f64, f64) = (19.0770, 72.8777);
const VOLUNTEER_AT: (f64, f64) = (19.0780, 72.8777);

async fn spawn_app(mint_fails: bool) -> TestApp {
    spawn_app_with(FakeNotarizer {
        fail: mint_fails,
        ..FakeNotarizer::default()
    })
    .await
}

async fn spawn_app_with(notarizer: FakeNotarizer) -> TestApp {
    let config = Config::from_lookup(|key| match key {
        "JWT_SECRET" => Some("integration-secret".to_string()),
        "DATABASE_URL" => Some("sqlite::memory:".to_string()),
        "PUBLIC_BASE_URL" => Some("https://foodloop.test/".to_string()),
        _ => None,
    })
    .unwrap();
    let pool = db::init_pool(&config.database_url).await.unwrap();

    let notifier = Arc::new(RecordingNotifier::default());
    let notarizer = Arc::new(notarizer);
    let state = Arc::new(AppState::new(
        pool,
        config,
        notifier.clone(),
        notarizer.clone(),
        Arc::new(LunchClassifier),
    ));

    TestApp {
        router: foodloop::router(state.clone()),
        state,
        notifier,
        notarizer,
    }
}

impl TestApp {
    async fn call(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::to_vec(&body).unwrap()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn register(&self, name: &str, role: &str, at: (f64, f64)) -> Account {
        let (status, body) = self
            .call(
                Method::POST,
                "/api/auth/register",
                None,
                Some(json!({
                    "name": name,
                    "email": format!("{}@example.org", name.to_lowercase()),
                    "password": "correct-horse",
                    "role": role,
                    "contact_number": "9000000000",
                    "latitude": at.0,
                    "longitude": at.1,
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        Account {
            id: body["user"]["id"].as_i64().unwrap(),
            token: body["token"].as_str().unwrap().to_string(),
        }
    }

    async fn admin(&self) -> Account {
        let user = db::insert_user(
            &self.state.pool,
            &NewUser {
                name: "Root".to_string(),
                email: "root@example.org".to_string(),
                password_hash: String::new(),
                role: Role::Admin,
                contact_number: None,
                address: None,
                latitude: 0.0,
                longitude: 0.0,
                wallet_address: None,
            },
            Utc::now().timestamp(),
        )
        .await
        .unwrap();
        Account {
            id: user.id,
            token: self.state.tokens.issue(&user).unwrap(),
        }
    }

    async fn create_listing(&self, donor: &Account, requires_volunteer: bool) -> i64 {
        self.create_listing_with(donor, json!({ "requires_volunteer": requires_volunteer }))
            .await
    }

    /// Create a listing, overriding fields of a default room-temperature one.
    async fn create_listing_with(&self, donor: &Account, overrides: Value) -> i64 {
        let mut listing = json!({
            "food_description": "Vegetable biryani",
            "food_type": "cooked",
            "hours_old": 1.5,
            "storage": "room temp",
            "weight_kg": 5.0,
            "requires_volunteer": false,
            "expiration_date": Utc::now().timestamp() + 86_400,
            "latitude": DONOR_AT.0,
            "longitude": DONOR_AT.1,
            "full_address": "Dadar, Mumbai",
        });
        if let (Some(fields), Some(extra)) = (listing.as_object_mut(), overrides.as_object()) {
            fields.extend(extra.clone());
        }
        let (status, body) = self
            .call(Method::POST, "/api/donations", Some(&donor.token), Some(listing))
            .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        assert_eq!(body["predicted_category"], "lunch");
        body["id"].as_i64().unwrap()
    }

    async fn make_available_all_week(&self, volunteer: &Account) {
        let days = [
            "Monday",
            "Tuesday",
            "Wednesday",
            "Thursday",
            "Friday",
            "Saturday",
            "Sunday",
        ];
        let slots: Vec<Value> = days
            .iter()
            .map(|d| json!({ "day": d, "start_hour": 0, "end_hour": 23 }))
            .collect();
        let (status, _) = self
            .call(
                Method::PUT,
                "/api/user/availability",
                Some(&volunteer.token),
                Some(json!({ "slots": slots })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
    }

    async fn match_once(&self) -> Vec<i64> {
        matcher::run_pass(&self.state, Utc::now())
            .await
            .unwrap()
            .into_iter()
            .map(|tx| tx.id)
            .collect()
    }
}

// ─────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn health_reports_ok() {
    let app = spawn_app(false).await;
    let (status, body) = app.call(Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn protected_routes_require_a_token() {
    let app = spawn_app(false).await;
    let (status, body) = app.call(Method::GET, "/api/user/me", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"].is_string());

    let (status, _) = app
        .call(Method::GET, "/api/user/me", Some("not-a-token"), None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn login_checks_the_password() {
    let app = spawn_app(false).await;
    app.register("Asha", "donor", DONOR_AT).await;

    let (status, _) = app
        .call(
            Method::POST,
            "/api/auth/login",
            None,
            Some(json!({ "email": "asha@example.org", "password": "wrong-password" })),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = app
        .call(
            Method::POST,
            "/api/auth/login",
            None,
            Some(json!({ "email": "Asha@example.org", "password": "correct-horse" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["user"]["role"], "donor");
    assert!(body["user"].get("password_hash").is_none());
}

#[tokio::test]
async fn duplicate_email_is_a_conflict() {
    let app = spawn_app(false).await;
    app.register("Asha", "donor", DONOR_AT).await;
    let (status, _) = app
        .call(
            Method::POST,
            "/api/auth/register",
            None,
            Some(json!({
                "name": "Asha",
                "email": "asha@example.org",
                "password": "another-pass",
                "role": "ngo",
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn matcher_opens_transaction_and_emails_links() {
    let app = spawn_app(false).await;
    let donor = app.register("Asha", "donor", DONOR_AT).await;
    let ngo = app.register("Annapurna", "ngo", NGO_AT).await;
    let admin = app.admin().await;
    let listing_id = app.create_listing(&donor, false).await;

    let (status, body) = app
        .call(Method::POST, "/api/transaction/match", Some(&admin.token), None)
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["count"], 1);
    let tx = &body["transactions"][0];
    assert_eq!(tx["status"], "pending");
    assert_eq!(tx["ngo_id"], ngo.id);
    assert_eq!(tx["listing_id"], listing_id);
    let tx_id = tx["id"].as_i64().unwrap();

    let emails = app.notifier.emails.lock().unwrap().clone();
    let ngo_email = emails
        .iter()
        .find(|e| e.to == "annapurna@example.org")
        .expect("NGO was emailed");
    assert!(ngo_email.html.contains(&format!(
        "https://foodloop.test/api/transaction/confirm/{tx_id}/{}",
        ngo.id
    )));
    assert!(emails.iter().any(|e| e.to == "asha@example.org"));

    // The listing is no longer offered, and a second pass opens nothing new.
    let (_, listings) = app
        .call(Method::GET, "/api/donations/list", None, None)
        .await;
    assert_eq!(listings["count"], 0);
    assert!(app.match_once().await.is_empty());

    // Only admins may trigger a pass.
    let (status, _) = app
        .call(Method::POST, "/api/transaction/match", Some(&donor.token), None)
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn distant_ngo_and_refused_food_are_not_matched() {
    let app = spawn_app(false).await;
    let donor = app.register("Asha", "donor", DONOR_AT).await;
    let near = app.register("Near", "ngo", NGO_AT).await;
    app.register("Far", "ngo", (19.2, 72.9)).await;

    let (status, _) = app
        .call(
            Method::PATCH,
            "/api/ngo/preferences",
            Some(&near.token),
            Some(json!({ "food_preferences": ["cooked"] })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let listing_id = app.create_listing(&donor, false).await;
    assert!(app.match_once().await.is_empty());

    let listing = db::get_listing(&app.state.pool, listing_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(listing.ngo_id, None);
}

#[tokio::test]
async fn timeline_never_repeats_a_status_actor_pair() {
    let app = spawn_app(false).await;
    let donor = app.register("Asha", "donor", DONOR_AT).await;
    let ngo = app.register("Annapurna", "ngo", NGO_AT).await;
    app.create_listing(&donor, false).await;
    let tx_id = app.match_once().await[0];
    let uri = format!("/api/transaction/orders/{tx_id}/status");

    let (status, first) = app
        .call(
            Method::PATCH,
            &uri,
            Some(&ngo.token),
            Some(json!({ "status": "picked_up" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{first}");
    assert_eq!(first["event"]["actor"], "ngo");
    assert_eq!(first["event"]["note"], "Status updated to picked_up");

    let (status, second) = app
        .call(
            Method::PATCH,
            &uri,
            Some(&ngo.token),
            Some(json!({ "status": "picked_up" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(second["event"].is_null());
    assert_eq!(second["timeline"].as_array().unwrap().len(), 2);

    // Same status from another actor is a distinct event.
    let (_, third) = app
        .call(
            Method::PATCH,
            &uri,
            Some(&ngo.token),
            Some(json!({ "status": "picked_up", "by": "volunteer", "note": "Collected" })),
        )
        .await;
    assert_eq!(third["timeline"].as_array().unwrap().len(), 3);

    let (status, timeline) = app
        .call(
            Method::GET,
            &format!("/api/transaction/orders/{tx_id}/timeline"),
            Some(&donor.token),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(timeline["status"], "picked_up");
    let events = timeline["timeline"].as_array().unwrap();
    assert_eq!(events.last().unwrap()["status"], "pending");
    assert_eq!(events.last().unwrap()["actor"], "system");

    let (status, _) = app
        .call(
            Method::PATCH,
            &uri,
            Some(&ngo.token),
            Some(json!({ "status": "rejected" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn outsiders_cannot_touch_a_transaction() {
    let app = spawn_app(false).await;
    let donor = app.register("Asha", "donor", DONOR_AT).await;
    app.register("Annapurna", "ngo", NGO_AT).await;
    let stranger = app.register("Stranger", "volunteer", VOLUNTEER_AT).await;
    app.create_listing(&donor, false).await;
    let tx_id = app.match_once().await[0];

    let (status, _) = app
        .call(
            Method::GET,
            &format!("/api/transaction/orders/{tx_id}/timeline"),
            Some(&stranger.token),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = app
        .call(
            Method::GET,
            &format!("/api/transaction/confirm/{tx_id}/{}", stranger.id),
            None,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn rejection_returns_listing_to_pending() {
    let app = spawn_app(false).await;
    let donor = app.register("Asha", "donor", DONOR_AT).await;
    let ngo = app.register("Annapurna", "ngo", NGO_AT).await;
    let listing_id = app.create_listing(&donor, false).await;
    let tx_id = app.match_once().await[0];

    let (status, body) = app
        .call(
            Method::GET,
            &format!("/api/transaction/reject/{tx_id}/{}", ngo.id),
            None,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");

    let listing = db::get_listing(&app.state.pool, listing_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(listing.status, ListingStatus::Pending);
    assert_eq!(listing.ngo_id, None);
    assert_eq!(listing.volunteer_id, None);
    assert!(db::get_transaction(&app.state.pool, tx_id)
        .await
        .unwrap()
        .is_none());

    // The rejecting NGO is not offered the same listing again.
    assert!(app.match_once().await.is_empty());
    let (_, listings) = app
        .call(Method::GET, "/api/donations/list", None, None)
        .await;
    assert_eq!(listings["listings"][0]["id"], listing_id);
}

#[tokio::test]
async fn confirmation_waits_for_every_participant() {
    let app = spawn_app(false).await;
    let donor = app.register("Asha", "donor", DONOR_AT).await;
    let ngo = app.register("Annapurna", "ngo", NGO_AT).await;
    let volunteer = app.register("Ravi", "volunteer", VOLUNTEER_AT).await;
    app.make_available_all_week(&volunteer).await;
    let listing_id = app.create_listing(&donor, true).await;

    let tx_id = app.match_once().await[0];
    let tx = db::get_transaction(&app.state.pool, tx_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tx.volunteer_id, Some(volunteer.id));

    let confirm = |user_id: i64| format!("/api/transaction/confirm/{tx_id}/{user_id}");

    let (status, body) = app.call(Method::POST, &confirm(ngo.id), None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "pending");

    // Repeating a confirmation changes nothing.
    let (_, body) = app.call(Method::GET, &confirm(ngo.id), None, None).await;
    assert_eq!(body["status"], "pending");
    assert_eq!(body["confirmed_by"], json!([ngo.id]));

    let (status, _) = app.call(Method::GET, &confirm(donor.id), None, None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(app.notifier.sms.lock().unwrap().is_empty());

    let (status, body) = app
        .call(Method::GET, &confirm(volunteer.id), None, None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "confirmed");

    let listing = db::get_listing(&app.state.pool, listing_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(listing.status, ListingStatus::Confirmed);
    assert_eq!(app.notifier.sms.lock().unwrap().len(), 3);
    assert_eq!(
        app.notifier.sms.lock().unwrap()[0].0,
        "+919000000000",
        "local numbers get the default country code"
    );

    // A late duplicate does not notify again.
    app.call(Method::GET, &confirm(volunteer.id), None, None)
        .await;
    assert_eq!(app.notifier.sms.lock().unwrap().len(), 3);
}

#[tokio::test]
async fn delivery_is_minted_once() {
    let app = spawn_app(false).await;
    let donor = app.register("Asha", "donor", DONOR_AT).await;
    let ngo = app.register("Annapurna", "ngo", NGO_AT).await;
    app.create_listing(&donor, false).await;
    let tx_id = app.match_once().await[0];
    let uri = format!("/api/transaction/confirm-delivery/{tx_id}");

    let (status, body) = app.call(Method::POST, &uri, Some(&ngo.token), None).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["transaction_hash"], "0xfeed");
    assert_eq!(body["certificate"]["nft_token_id"], "7");
    assert_eq!(body["certificate"]["donor_name"], "Asha");
    assert_eq!(body["transaction"]["status"], "on_chain");
    assert_eq!(body["transaction"]["blockchain_confirmed"], true);

    let request = app.notarizer.requests.lock().unwrap()[0].clone();
    assert_eq!(request.delivery_id, tx_id as u64);
    assert_eq!(request.donor_address, foodloop::config::ZERO_ADDRESS);
    assert_eq!(request.weight, "5");

    let (status, body) = app.call(Method::POST, &uri, Some(&ngo.token), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("0xfeed"));
    assert_eq!(app.notarizer.requests.lock().unwrap().len(), 1);
    let stored = db::get_transaction(&app.state.pool, tx_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        stored.certificate.unwrap().0.weight,
        "5 kg",
        "the unit stays on the certificate"
    );

    let (_, stats) = app.call(Method::GET, "/api/impact/stats", None, None).await;
    assert_eq!(stats["total_donations"], 1);
    assert_eq!(stats["total_weight_kg"], 5.0);
    assert_eq!(stats["estimated_co2_saved_kg"], 2);
    assert_eq!(stats["blockchain_transactions"], 1);
    assert_eq!(stats["connected_ngos"], 1);
}

#[tokio::test]
async fn failed_mint_still_confirms_delivery() {
    let app = spawn_app(true).await;
    let donor = app.register("Asha", "donor", DONOR_AT).await;
    let ngo = app.register("Annapurna", "ngo", NGO_AT).await;
    app.create_listing(&donor, false).await;
    let tx_id = app.match_once().await[0];

    let (status, body) = app
        .call(
            Method::POST,
            &format!("/api/transaction/confirm-delivery/{tx_id}"),
            Some(&ngo.token),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Delivery confirmed but NFT minting failed");
    assert!(body["error"].as_str().unwrap().contains("execution reverted"));
    assert_eq!(body["transaction"]["status"], "confirmed");
    assert!(body["transaction"]["transaction_hash"].is_null());

    let timeline = db::timeline(&app.state.pool, tx_id).await.unwrap();
    let last = timeline.last().unwrap();
    assert_eq!(last.status, TransactionStatus::Confirmed);
    assert_eq!(last.actor, Actor::Ngo);
    assert_eq!(
        last.note.as_deref(),
        Some("Delivery confirmed but NFT minting failed")
    );

    // A failed mint can be retried.
    let (status, _) = app
        .call(
            Method::POST,
            &format!("/api/transaction/confirm-delivery/{tx_id}"),
            Some(&ngo.token),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(app.notarizer.requests.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn only_one_claim_wins() {
    let app = spawn_app(false).await;
    let donor = app.register("Asha", "donor", DONOR_AT).await;
    let first = app.register("Annapurna", "ngo", NGO_AT).await;
    let second = app.register("Rotibank", "ngo", NGO_AT).await;
    let listing_id = app.create_listing(&donor, false).await;
    let uri = format!("/api/ngo/claim/{listing_id}");

    let (a, b) = tokio::join!(
        app.call(Method::POST, &uri, Some(&first.token), None),
        app.call(Method::POST, &uri, Some(&second.token), None),
    );
    let mut statuses = [a.0, b.0];
    statuses.sort();
    assert_eq!(statuses[0], StatusCode::CREATED);
    assert!(matches!(
        statuses[1],
        StatusCode::BAD_REQUEST | StatusCode::CONFLICT
    ));

    let winner = if a.0 == StatusCode::CREATED { &a.1 } else { &b.1 };
    assert_eq!(winner["transaction"]["status"], "requested");
    assert_eq!(winner["transaction"]["certificate"]["transaction_hash"], "pending");
    assert_eq!(winner["listing"]["status"], "requested");

    // The store-level guard itself: a second open on the same listing loses.
    let retry = NewTransaction {
        listing_id,
        donor_id: donor.id,
        ngo_id: second.id,
        volunteer_id: None,
        weight_kg: 5.0,
        status: TransactionStatus::Requested,
        opened_by: Actor::Ngo,
        certificate: None,
    };
    assert!(db::open_transaction(&app.state.pool, &retry, Utc::now().timestamp())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn donors_cancel_only_pending_listings() {
    let app = spawn_app(false).await;
    let donor = app.register("Asha", "donor", DONOR_AT).await;
    let other = app.register("Bela", "donor", DONOR_AT).await;
    let ngo = app.register("Annapurna", "ngo", NGO_AT).await;
    let listing_id = app.create_listing(&donor, false).await;
    let uri = format!("/api/donations/cancel/{listing_id}");

    let (status, _) = app.call(Method::DELETE, &uri, Some(&other.token), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    app.call(
        Method::POST,
        &format!("/api/ngo/claim/{listing_id}"),
        Some(&ngo.token),
        None,
    )
    .await;
    let (status, _) = app.call(Method::DELETE, &uri, Some(&donor.token), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let second = app.create_listing(&donor, false).await;
    let (status, _) = app
        .call(
            Method::DELETE,
            &format!("/api/donations/cancel/{second}"),
            Some(&donor.token),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(db::get_listing(&app.state.pool, second)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn delivered_transactions_cannot_be_rejected() {
    let app = spawn_app(false).await;
    let donor = app.register("Asha", "donor", DONOR_AT).await;
    let ngo = app.register("Annapurna", "ngo", NGO_AT).await;
    let listing_id = app.create_listing(&donor, false).await;
    let tx_id = app.match_once().await[0];

    let (status, _) = app
        .call(
            Method::POST,
            &format!("/api/transaction/confirm-delivery/{tx_id}"),
            Some(&ngo.token),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = app
        .call(
            Method::GET,
            &format!("/api/transaction/reject/{tx_id}/{}", ngo.id),
            None,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].is_string());

    let tx = db::get_transaction(&app.state.pool, tx_id)
        .await
        .unwrap()
        .expect("transaction survives");
    assert_eq!(tx.status, TransactionStatus::OnChain);
    assert_eq!(tx.transaction_hash.as_deref(), Some("0xfeed"));
    let listing = db::get_listing(&app.state.pool, listing_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(listing.status, ListingStatus::Confirmed);
    assert!(db::rejected_user_ids(&app.state.pool, listing_id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn picked_up_transactions_cannot_be_rejected() {
    let app = spawn_app(false).await;
    let donor = app.register("Asha", "donor", DONOR_AT).await;
    let ngo = app.register("Annapurna", "ngo", NGO_AT).await;
    app.create_listing(&donor, false).await;
    let tx_id = app.match_once().await[0];

    app.call(
        Method::PATCH,
        &format!("/api/transaction/orders/{tx_id}/status"),
        Some(&ngo.token),
        Some(json!({ "status": "picked_up" })),
    )
    .await;

    let (status, _) = app
        .call(
            Method::POST,
            &format!("/api/transaction/reject/{tx_id}/{}", ngo.id),
            None,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn malformed_requests_get_json_errors() {
    let app = spawn_app(false).await;
    let donor = app.register("Asha", "donor", DONOR_AT).await;
    let ngo = app.register("Annapurna", "ngo", NGO_AT).await;
    app.create_listing(&donor, false).await;
    let tx_id = app.match_once().await[0];

    let (status, body) = app
        .call(
            Method::PATCH,
            &format!("/api/transaction/orders/{tx_id}/status"),
            Some(&ngo.token),
            Some(json!({ "status": "bogus" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Invalid status value");

    let (status, body) = app
        .call(
            Method::GET,
            "/api/transaction/orders/abc/timeline",
            Some(&ngo.token),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());

    let (status, body) = app
        .call(
            Method::POST,
            "/api/auth/login",
            None,
            Some(json!({ "email": "asha@example.org" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("password"));

    let (status, body) = app
        .call(
            Method::GET,
            &format!("/api/transaction/confirm/{tx_id}/someone"),
            None,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn concurrent_delivery_confirmations_mint_once() {
    let app = spawn_app_with(FakeNotarizer {
        latency: Duration::from_millis(100),
        ..FakeNotarizer::default()
    })
    .await;
    let donor = app.register("Asha", "donor", DONOR_AT).await;
    let ngo = app.register("Annapurna", "ngo", NGO_AT).await;
    app.create_listing(&donor, false).await;
    let tx_id = app.match_once().await[0];
    let uri = format!("/api/transaction/confirm-delivery/{tx_id}");

    let (a, b) = tokio::join!(
        app.call(Method::POST, &uri, Some(&ngo.token), None),
        app.call(Method::POST, &uri, Some(&donor.token), None),
    );
    let mut statuses = [a.0, b.0];
    statuses.sort();
    assert_eq!(statuses, [StatusCode::OK, StatusCode::CONFLICT]);
    assert_eq!(app.notarizer.requests.lock().unwrap().len(), 1);

    let tx = db::get_transaction(&app.state.pool, tx_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(tx.status, TransactionStatus::OnChain);
}

#[tokio::test]
async fn expired_listings_are_swept_but_transactions_remain() {
    let app = spawn_app(false).await;
    let donor = app.register("Asha", "donor", DONOR_AT).await;
    let ngo = app.register("Annapurna", "ngo", NGO_AT).await;
    let listing_id = app.create_listing(&donor, false).await;
    let tx_id = app.match_once().await[0];

    let (_, body) = app
        .call(
            Method::GET,
            &format!("/api/transaction/confirm/{tx_id}/{}", ngo.id),
            None,
            None,
        )
        .await;
    assert_eq!(body["status"], "confirmed");

    // Still inside the TTL.
    assert_eq!(
        matcher::sweep_expired(&app.state, Utc::now()).await.unwrap(),
        0
    );

    let later = Utc::now()
        + ChronoDuration::seconds(app.state.config.confirmed_listing_ttl_secs + 60);
    assert_eq!(matcher::sweep_expired(&app.state, later).await.unwrap(), 1);
    assert!(db::get_listing(&app.state.pool, listing_id)
        .await
        .unwrap()
        .is_none());

    let tx = db::get_transaction(&app.state.pool, tx_id)
        .await
        .unwrap()
        .expect("transaction outlives its listing");
    assert_eq!(tx.listing_id, None);
    assert_eq!(tx.status, TransactionStatus::Confirmed);

    let (status, body) = app
        .call(
            Method::POST,
            &format!("/api/transaction/confirm-delivery/{tx_id}"),
            Some(&ngo.token),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["certificate"]["location"], "Location not available");
    assert_eq!(body["certificate"]["food_type"], "Unknown");

    let (_, stats) = app.call(Method::GET, "/api/impact/stats", None, None).await;
    assert_eq!(stats["total_weight_kg"], 5.0);
}

#[tokio::test]
async fn matcher_takes_perishable_then_earliest_scheduled() {
    let app = spawn_app(false).await;
    let donor = app.register("Asha", "donor", DONOR_AT).await;
    app.register("Annapurna", "ngo", NGO_AT).await;
    let now = Utc::now().timestamp();

    let late = app
        .create_listing_with(&donor, json!({ "scheduled_for": now - 60 }))
        .await;
    let early = app
        .create_listing_with(&donor, json!({ "scheduled_for": now - 600 }))
        .await;
    let frozen = app
        .create_listing_with(&donor, json!({ "storage": "frozen" }))
        .await;

    let opened: Vec<i64> = matcher::run_pass(&app.state, Utc::now())
        .await
        .unwrap()
        .into_iter()
        .filter_map(|tx| tx.listing_id)
        .collect();
    assert_eq!(opened, vec![frozen, early, late]);
}

#[tokio::test]
async fn future_listings_wait_for_their_schedule() {
    let app = spawn_app(false).await;
    let donor = app.register("Asha", "donor", DONOR_AT).await;
    app.register("Annapurna", "ngo", NGO_AT).await;
    let listing_id = app
        .create_listing_with(
            &donor,
            json!({ "scheduled_for": Utc::now().timestamp() + 3600 }),
        )
        .await;

    assert!(app.match_once().await.is_empty());
    let listing = db::get_listing(&app.state.pool, listing_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(listing.status, ListingStatus::Pending);

    let opened = matcher::run_pass(&app.state, Utc::now() + ChronoDuration::hours(2))
        .await
        .unwrap();
    assert_eq!(opened.len(), 1);
    assert_eq!(opened[0].listing_id, Some(listing_id));
}

#[tokio::test]
async fn cached_ngo_is_reused_while_it_still_fits() {
    let app = spawn_app(false).await;
    let donor = app.register("Asha", "donor", DONOR_AT).await;
    let nearest = app.register("Annapurna", "ngo", NGO_AT).await;
    let farther = app.register("Rotibank", "ngo", (19.0790, 72.8777)).await;

    let listing_id = app.create_listing(&donor, false).await;
    app.state.ngo_cache.insert(
        listing_id,
        CachedNgo {
            ngo_id: farther.id,
            food_preferences: Vec::new(),
        },
    );

    let opened = matcher::run_pass(&app.state, Utc::now()).await.unwrap();
    assert_eq!(opened[0].ngo_id, farther.id);
    assert_ne!(farther.id, nearest.id);
}

#[tokio::test]
async fn stale_cached_ngo_is_replaced_by_nearest() {
    let app = spawn_app(false).await;
    let donor = app.register("Asha", "donor", DONOR_AT).await;
    let nearest = app.register("Annapurna", "ngo", NGO_AT).await;
    let farther = app.register("Rotibank", "ngo", (19.0790, 72.8777)).await;

    let listing_id = app.create_listing(&donor, false).await;
    app.state.ngo_cache.insert(
        listing_id,
        CachedNgo {
            ngo_id: farther.id,
            food_preferences: vec!["cooked".to_string()],
        },
    );

    let opened = matcher::run_pass(&app.state, Utc::now()).await.unwrap();
    assert_eq!(opened[0].ngo_id, nearest.id);
    assert_eq!(
        app.state.ngo_cache.get(listing_id).map(|c| c.ngo_id),
        Some(nearest.id)
    );
}
