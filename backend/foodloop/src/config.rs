//! Application configuration loaded from environment variables.

use std::str::FromStr;

use k256::ecdsa::SigningKey;

use crate::errors::{FoodLoopError, Result};

/// Address used as the certificate recipient when a donor has no wallet.
pub const ZERO_ADDRESS: &str = "0x0000000000000000000000000000000000000000";

#[derive(Debug, Clone)]
pub struct Config {
    /// Path or URL of the SQLite database
    pub database_url: String,
    /// Port for the REST API server
    pub api_port: u16,
    /// HS256 secret used to sign and verify bearer tokens
    pub jwt_secret: String,
    pub token_ttl_hours: i64,
    /// How often (in seconds) the matcher scans pending listings
    pub match_interval_secs: u64,
    /// Search radius for NGOs around a listing, in metres
    pub ngo_max_distance_m: f64,
    /// Search radius for volunteers around a listing, in metres
    pub volunteer_max_distance_m: f64,
    pub ngo_cache_ttl_secs: u64,
    /// Confirmed listings are deleted this long after their last update
    pub confirmed_listing_ttl_secs: i64,
    /// Base URL used in accept/reject links sent by email
    pub public_base_url: String,
    pub ml_api_url: String,
    pub ml_timeout_secs: u64,
    pub twilio: Option<TwilioConfig>,
    pub sms_country_code: String,
    pub mail_relay_url: Option<String>,
    pub mail_from: String,
    pub chain: Option<ChainConfig>,
}

#[derive(Debug, Clone)]
pub struct TwilioConfig {
    pub account_sid: String,
    pub auth_token: String,
    pub from_number: String,
}

#[derive(Debug, Clone)]
pub struct ChainConfig {
    /// Ethereum JSON-RPC endpoint
    pub rpc_url: String,
    /// Address of the certificate contract
    pub contract_address: String,
    /// secp256k1 key that signs the mint transactions
    pub signing_key: SigningKey,
    /// Queried with `eth_chainId` when unset
    pub chain_id: Option<u64>,
    pub default_wallet: String,
    pub gas_limit: u64,
    pub max_fee_gwei: u64,
    pub priority_fee_gwei: u64,
    pub receipt_poll_attempts: u32,
    pub receipt_poll_interval_ms: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let twilio = match (
            var("TWILIO_ACCOUNT_SID"),
            var("TWILIO_AUTH_TOKEN"),
            var("TWILIO_NUMBER"),
        ) {
            (Some(account_sid), Some(auth_token), Some(from_number)) => Some(TwilioConfig {
                account_sid,
                auth_token,
                from_number,
            }),
            (None, None, None) => None,
            _ => {
                return Err(FoodLoopError::Config(
                    "TWILIO_ACCOUNT_SID, TWILIO_AUTH_TOKEN and TWILIO_NUMBER must be set together"
                        .to_string(),
                ))
            }
        };

        let chain = match (
            var("CHAIN_RPC_URL"),
            var("CERTIFICATE_CONTRACT"),
            var("CHAIN_PRIVATE_KEY"),
        ) {
            (Some(rpc_url), Some(contract_address), Some(key)) => Some(ChainConfig {
                rpc_url,
                contract_address,
                signing_key: parse_signing_key(&key)?,
                chain_id: var("CHAIN_ID").map(|raw| parse_chain_id(&raw)).transpose()?,
                default_wallet: var("DEFAULT_WALLET").unwrap_or_else(|| ZERO_ADDRESS.to_string()),
                gas_limit: parse_or(&var, "CHAIN_GAS_LIMIT", 500_000)?,
                max_fee_gwei: parse_or(&var, "CHAIN_MAX_FEE_GWEI", 50)?,
                priority_fee_gwei: parse_or(&var, "CHAIN_PRIORITY_FEE_GWEI", 2)?,
                receipt_poll_attempts: parse_or(&var, "RECEIPT_POLL_ATTEMPTS", 30)?,
                receipt_poll_interval_ms: parse_or(&var, "RECEIPT_POLL_INTERVAL_MS", 2_000)?,
            }),
            (None, None, None) => None,
            _ => {
                return Err(FoodLoopError::Config(
                    "CHAIN_RPC_URL, CERTIFICATE_CONTRACT and CHAIN_PRIVATE_KEY must be set together"
                        .to_string(),
                ))
            }
        };

        Ok(Config {
            database_url: var("DATABASE_URL")
                .unwrap_or_else(|| "sqlite:./foodloop.db".to_string()),
            api_port: parse_or(&var, "API_PORT", 5000)?,
            jwt_secret: var("JWT_SECRET").ok_or_else(|| {
                FoodLoopError::Config("JWT_SECRET environment variable is required".to_string())
            })?,
            token_ttl_hours: parse_or(&var, "TOKEN_TTL_HOURS", 24)?,
            match_interval_secs: parse_or(&var, "MATCH_INTERVAL_SECS", 300)?,
            ngo_max_distance_m: parse_or(&var, "NGO_MAX_DISTANCE_M", 500.0)?,
            volunteer_max_distance_m: parse_or(&var, "VOLUNTEER_MAX_DISTANCE_M", 10_000.0)?,
            ngo_cache_ttl_secs: parse_or(&var, "NGO_CACHE_TTL_SECS", 300)?,
            confirmed_listing_ttl_secs: parse_or(&var, "CONFIRMED_LISTING_TTL_SECS", 3600)?,
            public_base_url: var("PUBLIC_BASE_URL")
                .unwrap_or_else(|| "http://localhost:5000".to_string())
                .trim_end_matches('/')
                .to_string(),
            ml_api_url: var("ML_API_URL")
                .unwrap_or_else(|| "http://127.0.0.1:8000".to_string())
                .trim_end_matches('/')
                .to_string(),
            ml_timeout_secs: parse_or(&var, "ML_TIMEOUT_SECS", 5)?,
            twilio,
            sms_country_code: var("SMS_COUNTRY_CODE").unwrap_or_else(|| "+91".to_string()),
            mail_relay_url: var("MAIL_RELAY_URL"),
            mail_from: var("MAIL_FROM")
                .unwrap_or_else(|| "FoodLoop Team <noreply@foodloop.local>".to_string()),
            chain,
        })
    }
}

fn parse_signing_key(raw: &str) -> Result<SigningKey> {
    let invalid = || FoodLoopError::Config("Invalid CHAIN_PRIVATE_KEY".to_string());
    let raw = raw.trim();
    let bytes = hex::decode(raw.strip_prefix("0x").unwrap_or(raw)).map_err(|_| invalid())?;
    if bytes.len() != 32 {
        return Err(invalid());
    }
    SigningKey::from_slice(&bytes).map_err(|_| invalid())
}

fn parse_chain_id(raw: &str) -> Result<u64> {
    raw.trim()
        .parse()
        .map_err(|_| FoodLoopError::Config("Invalid CHAIN_ID".to_string()))
}

fn parse_or<T, F>(var: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| FoodLoopError::Config(format!("Invalid {key}"))),
        None => Ok(default),
    }
}
