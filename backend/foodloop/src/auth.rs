//! Password hashing and bearer tokens.

use std::sync::Arc;

use argon2::password_hash::{rand_core::OsRng, SaltString};
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use jwt_compact::alg::{Hs256, Hs256Key};
use jwt_compact::prelude::*;
use serde::{Deserialize, Serialize};

use crate::errors::{FoodLoopError, Result};
use crate::models::{Role, User};
use crate::state::AppState;

pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| FoodLoopError::Auth(format!("Failed to hash password: {e}")))
}

pub fn verify_password(password: &str, password_hash: &str) -> bool {
    let Ok(hash) = PasswordHash::new(password_hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &hash)
        .is_ok()
}

/// Claims carried by an access token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub sub: i64,
    pub role: Role,
    pub name: String,
}

/// Issues and verifies HS256 access tokens.
pub struct TokenAuthority {
    key: Hs256Key,
    ttl: chrono::Duration,
}

impl TokenAuthority {
    pub fn new(secret: &str, ttl_hours: i64) -> Self {
        Self {
            key: Hs256Key::new(secret.as_bytes()),
            ttl: chrono::Duration::hours(ttl_hours),
        }
    }

    pub fn issue(&self, user: &User) -> Result<String> {
        let claims = Claims::new(TokenClaims {
            sub: user.id,
            role: user.role,
            name: user.name.clone(),
        })
        .set_duration_and_issuance(&TimeOptions::default(), self.ttl);

        let header = Header::empty().with_token_type("JWT");
        Hs256
            .token(&header, &claims, &self.key)
            .map_err(|e| FoodLoopError::Auth(format!("Failed to sign token: {e}")))
    }

    pub fn verify(&self, token: &str) -> Result<TokenClaims> {
        let untrusted =
            UntrustedToken::new(token).map_err(|e| FoodLoopError::Auth(e.to_string()))?;
        let token: Token<TokenClaims> = Hs256
            .validator(&self.key)
            .validate(&untrusted)
            .map_err(|e| FoodLoopError::Auth(e.to_string()))?;
        token
            .claims()
            .validate_expiration(&TimeOptions::default())
            .map_err(|e| FoodLoopError::Auth(e.to_string()))?;
        Ok(token.claims().custom.clone())
    }
}

/// The caller identified by the `Authorization: Bearer` header.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthUser {
    pub id: i64,
    pub role: Role,
    pub name: String,
}

impl AuthUser {
    pub fn require_role(&self, role: Role) -> Result<()> {
        if self.role == role {
            Ok(())
        } else {
            Err(FoodLoopError::Forbidden(format!(
                "Only {} accounts can do this",
                role.as_str()
            )))
        }
    }
}

#[axum::async_trait]
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = FoodLoopError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> std::result::Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| FoodLoopError::Unauthorized("Access denied".to_string()))?;
        let token = header.strip_prefix("Bearer ").unwrap_or(header).trim();

        let claims = state.tokens.verify(token)?;
        Ok(AuthUser {
            id: claims.sub,
            role: claims.role,
            name: claims.name,
        })
    }
}
