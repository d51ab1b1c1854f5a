//! User registration, password hashing and bearer tokens
//!
//! Passwords are hashed with Argon2. Access and refresh tokens are opaque
//! random strings stored with an expiry; refreshing rotates the refresh token.

use argon2::Argon2;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use axum::extract::FromRequestParts;
use axum::http::{header, request::Parts};
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::api::AppState;
use crate::config::CrmConfig;
use crate::error::ApiError;
use crate::storage::{CrmStore, StorageError, TokenKind, User};

const MIN_PASSWORD_LEN: usize = 8;
const TOKEN_BYTES: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("{0}")]
    Validation(String),

    #[error("No active account found with the given credentials")]
    InvalidCredentials,

    #[error("Token is invalid or expired")]
    InvalidToken,

    #[error("Password hashing failed: {0}")]
    Hash(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::Validation(message) => ApiError::BadRequest(message),
            AuthError::InvalidCredentials | AuthError::InvalidToken => ApiError::Unauthorized,
            AuthError::Hash(detail) => ApiError::Internal(detail),
            AuthError::Storage(e) => e.into(),
        }
    }
}

// =============================================================================
// Passwords
// =============================================================================

pub fn hash_password(password: &str) -> Result<String, AuthError> {
    let mut salt = [0u8; 16];
    rand::rng().fill_bytes(&mut salt);
    let salt = SaltString::encode_b64(&salt).map_err(|e| AuthError::Hash(e.to_string()))?;

    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AuthError::Hash(e.to_string()))
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    PasswordHash::new(hash)
        .map(|parsed| {
            Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false)
}

/// At least 8 characters and not entirely numeric
pub fn validate_password(password: &str) -> Result<(), AuthError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AuthError::Validation(format!(
            "This password is too short. It must contain at least {} characters.",
            MIN_PASSWORD_LEN
        )));
    }
    if password.chars().all(|c| c.is_ascii_digit()) {
        return Err(AuthError::Validation(
            "This password is entirely numeric.".to_string(),
        ));
    }
    Ok(())
}

fn new_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

// =============================================================================
// Service
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
    pub password_confirm: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub access: String,
    pub refresh: String,
    #[serde(skip)]
    pub access_expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct AuthService {
    store: Arc<CrmStore>,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl AuthService {
    pub fn new(store: Arc<CrmStore>, config: &CrmConfig) -> Self {
        Self {
            store,
            access_ttl: Duration::seconds(config.access_token_ttl_secs),
            refresh_ttl: Duration::seconds(config.refresh_token_ttl_secs),
        }
    }

    pub fn register(&self, request: RegisterRequest) -> Result<User, AuthError> {
        let username = request.username.trim();
        let email = request.email.trim();

        if username.is_empty() {
            return Err(AuthError::Validation("username is required".to_string()));
        }
        if !email.contains('@') {
            return Err(AuthError::Validation("Enter a valid email address.".to_string()));
        }
        if request.password != request.password_confirm {
            return Err(AuthError::Validation("Passwords do not match.".to_string()));
        }
        validate_password(&request.password)?;

        if self.store.find_user_by_username(username)?.is_some() {
            return Err(AuthError::Validation(
                "A user with that username already exists.".to_string(),
            ));
        }
        if self.store.email_exists(email)? {
            return Err(AuthError::Validation(
                "A user with this email already exists.".to_string(),
            ));
        }

        let hash = hash_password(&request.password)?;
        let user = self.store.create_user(
            username,
            email,
            &hash,
            request.first_name.trim(),
            request.last_name.trim(),
        )?;
        info!("Registered user {}", user.username);
        Ok(user)
    }

    pub fn login(&self, username: &str, password: &str) -> Result<TokenPair, AuthError> {
        let Some(user) = self.store.find_user_by_username(username)? else {
            warn!("Login attempt for unknown user {}", username);
            return Err(AuthError::InvalidCredentials);
        };
        if !verify_password(password, &user.password_hash) {
            warn!("Invalid password for user {}", username);
            return Err(AuthError::InvalidCredentials);
        }
        self.issue(&user)
    }

    /// Exchange a refresh token for a new pair, revoking the old one
    pub fn refresh(&self, refresh_token: &str) -> Result<TokenPair, AuthError> {
        let user = self
            .store
            .user_for_token(refresh_token, TokenKind::Refresh)?
            .ok_or(AuthError::InvalidToken)?;
        self.store.revoke_token(refresh_token)?;
        self.issue(&user)
    }

    /// User behind an access token
    pub fn authenticate(&self, access_token: &str) -> Result<User, AuthError> {
        self.store
            .user_for_token(access_token, TokenKind::Access)?
            .ok_or(AuthError::InvalidToken)
    }

    fn issue(&self, user: &User) -> Result<TokenPair, AuthError> {
        self.store.purge_expired_tokens()?;

        let access = new_token();
        let refresh = new_token();
        let access_expires_at =
            self.store
                .insert_token(&access, user.id, TokenKind::Access, self.access_ttl)?;
        self.store
            .insert_token(&refresh, user.id, TokenKind::Refresh, self.refresh_ttl)?;

        debug!("Issued tokens for user {}", user.username);
        Ok(TokenPair {
            access,
            refresh,
            access_expires_at,
        })
    }
}

// =============================================================================
// Extractor
// =============================================================================

/// Authenticated caller, from `Authorization: Bearer <access>`
#[derive(Debug, Clone)]
pub struct AuthUser(pub User);

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .and_then(|h| h.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(ApiError::Unauthorized)?;

        let user = state.auth.authenticate(token)?;
        Ok(AuthUser(user))
    }
}
