//! Domain records stored in the database and returned by the API.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::types::Json;

use crate::errors::FoodLoopError;
use crate::geo::GeoPoint;

/// Account role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Role {
    Donor,
    #[serde(alias = "NGO")]
    Ngo,
    Volunteer,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Donor => "donor",
            Self::Ngo => "ngo",
            Self::Volunteer => "volunteer",
            Self::Admin => "admin",
        }
    }
}

/// Who appended a timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Actor {
    System,
    Donor,
    Ngo,
    Volunteer,
    Admin,
}

impl From<Role> for Actor {
    fn from(role: Role) -> Self {
        match role {
            Role::Donor => Self::Donor,
            Role::Ngo => Self::Ngo,
            Role::Volunteer => Self::Volunteer,
            Role::Admin => Self::Admin,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ListingStatus {
    Pending,
    Requested,
    Confirmed,
}

/// High-level status of a delivery transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum TransactionStatus {
    /// Just created by the matcher.
    Pending,
    /// An NGO requested pickup.
    Requested,
    PickedUp,
    InTransit,
    Delivered,
    /// Every party confirmed, or minting failed after delivery.
    Confirmed,
    Rejected,
    /// Certificate minted.
    OnChain,
}

impl TransactionStatus {
    pub const ALL: [TransactionStatus; 8] = [
        Self::Pending,
        Self::Requested,
        Self::PickedUp,
        Self::InTransit,
        Self::Delivered,
        Self::Confirmed,
        Self::Rejected,
        Self::OnChain,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Requested => "requested",
            Self::PickedUp => "picked_up",
            Self::InTransit => "in_transit",
            Self::Delivered => "delivered",
            Self::Confirmed => "confirmed",
            Self::Rejected => "rejected",
            Self::OnChain => "on_chain",
        }
    }

    /// Whether the status may be set through the status-update operation.
    /// Rejection has its own operation, which deletes the transaction.
    pub fn is_settable(&self) -> bool {
        !matches!(self, Self::Rejected)
    }
}

impl FromStr for TransactionStatus {
    type Err = FoodLoopError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == value)
            .ok_or_else(|| FoodLoopError::BadRequest("Invalid status value".to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
pub enum Storage {
    #[serde(rename = "room temp")]
    #[sqlx(rename = "room temp")]
    RoomTemp,
    #[serde(rename = "refrigerated")]
    #[sqlx(rename = "refrigerated")]
    Refrigerated,
    #[serde(rename = "frozen")]
    #[sqlx(rename = "frozen")]
    Frozen,
}

impl Storage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoomTemp => "room temp",
            Self::Refrigerated => "refrigerated",
            Self::Frozen => "frozen",
        }
    }

    pub fn is_perishable(&self) -> bool {
        !matches!(self, Self::RoomTemp)
    }
}

/// Meal category predicted by the ML service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum FoodCategory {
    Breakfast,
    Lunch,
    Dinner,
    Snack,
    Dessert,
    Other,
}

impl FoodCategory {
    /// Parse a label returned by the classifier. Unknown labels map to `Other`.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "breakfast" | "bfast" => Self::Breakfast,
            "lunch" => Self::Lunch,
            "dinner" => Self::Dinner,
            "snack" => Self::Snack,
            "dessert" => Self::Dessert,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
pub enum Weekday {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
}

impl From<chrono::Weekday> for Weekday {
    fn from(day: chrono::Weekday) -> Self {
        match day {
            chrono::Weekday::Mon => Self::Monday,
            chrono::Weekday::Tue => Self::Tuesday,
            chrono::Weekday::Wed => Self::Wednesday,
            chrono::Weekday::Thu => Self::Thursday,
            chrono::Weekday::Fri => Self::Friday,
            chrono::Weekday::Sat => Self::Saturday,
            chrono::Weekday::Sun => Self::Sunday,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub role: Role,
    pub contact_number: Option<String>,
    pub address: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    /// Food types this NGO does not accept.
    pub food_preferences: Json<Vec<String>>,
    pub needs_volunteer: bool,
    pub wallet_address: Option<String>,
    pub is_verified: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl User {
    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.latitude, self.longitude)
    }

    /// NGO preferences list the food types that are refused.
    pub fn accepts_food_type(&self, food_type: &str) -> bool {
        !self.food_preferences.iter().any(|t| t == food_type)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct AvailabilitySlot {
    pub day: Weekday,
    pub start_hour: i64,
    pub end_hour: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FoodListing {
    pub id: i64,
    pub donor_id: i64,
    pub food_description: String,
    pub food_type: String,
    pub predicted_category: FoodCategory,
    pub hours_old: f64,
    pub storage: Storage,
    pub weight_kg: f64,
    pub is_perishable: bool,
    pub requires_volunteer: bool,
    pub expiration_date: i64,
    pub scheduled_for: Option<i64>,
    pub latitude: f64,
    pub longitude: f64,
    pub full_address: String,
    pub status: ListingStatus,
    pub ngo_id: Option<i64>,
    pub volunteer_id: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl FoodListing {
    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.latitude, self.longitude)
    }

    pub fn location_label(&self) -> String {
        format!("Lat: {}, Lng: {}", self.latitude, self.longitude)
    }
}

/// Payload embedded in the delivery certificate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertificateData {
    pub transaction_hash: String,
    pub nft_token_id: Option<String>,
    pub donor_name: Option<String>,
    pub donor_email: Option<String>,
    pub food_type: String,
    pub weight: String,
    pub location: String,
    pub timestamp: String,
    pub date: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DonationTransaction {
    pub id: i64,
    pub listing_id: Option<i64>,
    pub donor_id: i64,
    pub ngo_id: i64,
    pub volunteer_id: Option<i64>,
    /// Copied from the listing so impact totals survive listing expiry.
    pub weight_kg: f64,
    pub status: TransactionStatus,
    pub transaction_hash: Option<String>,
    pub blockchain_confirmed: bool,
    pub certificate: Option<Json<CertificateData>>,
    pub delivered_at: Option<i64>,
    pub confirmed_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl DonationTransaction {
    /// Whether `user_id` is the donor, NGO or volunteer of this transaction.
    pub fn involves(&self, user_id: i64) -> bool {
        self.donor_id == user_id || self.ngo_id == user_id || self.volunteer_id == Some(user_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct TimelineEvent {
    pub status: TransactionStatus,
    pub actor: Actor,
    pub note: Option<String>,
    pub timestamp: i64,
}

/// A transaction together with its timeline and confirmations.
#[derive(Debug, Clone, Serialize)]
pub struct TransactionDetail {
    #[serde(flatten)]
    pub transaction: DonationTransaction,
    pub timeline: Vec<TimelineEvent>,
    pub confirmed_by: Vec<i64>,
}
