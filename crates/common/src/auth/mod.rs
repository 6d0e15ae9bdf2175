//! Authentication utilities
//!
//! Provides:
//! - Admin key hashing and validation
//! - The [`AdminGuard`] extractor protecting operator endpoints
//! - Optional shared-token verification for provider webhooks

use crate::config::AuthConfig;
use crate::errors::{AppError, Result};
use axum::{
    extract::{FromRef, FromRequestParts},
    http::request::Parts,
};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use uuid::Uuid;

/// Header carrying the webhook shared token
pub const WEBHOOK_TOKEN_HEADER: &str = "x-webhook-token";

/// Hash an API key for storage
pub fn hash_api_key(api_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(api_key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Validate an API key against a stored hash
pub fn validate_api_key(api_key: &str, stored_hash: &str) -> bool {
    constant_time_eq(
        hash_api_key(api_key).as_bytes(),
        stored_hash.trim().to_ascii_lowercase().as_bytes(),
    )
}

/// Compare without short-circuiting on the first differing byte
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Check a presented admin key against configuration
pub fn verify_admin_key(config: &AuthConfig, presented: Option<&str>) -> Result<()> {
    let Some(ref stored_hash) = config.admin_key_hash else {
        return Err(AppError::Forbidden {
            message: "Admin endpoints are disabled".to_string(),
        });
    };

    let key = presented.ok_or_else(|| AppError::Unauthorized {
        message: format!("Missing {} header", config.admin_header),
    })?;

    if validate_api_key(key, stored_hash) {
        Ok(())
    } else {
        Err(AppError::InvalidApiKey)
    }
}

/// Check a webhook's shared token. With no token configured every request
/// is accepted.
pub fn verify_webhook_token(expected: Option<&str>, presented: Option<&str>) -> Result<()> {
    match expected {
        None => Ok(()),
        Some(expected) => match presented {
            Some(token) if constant_time_eq(token.as_bytes(), expected.as_bytes()) => Ok(()),
            _ => Err(AppError::InvalidWebhookToken),
        },
    }
}

/// Proof that the request carried a valid admin key
#[derive(Debug, Clone)]
pub struct AdminGuard {
    /// Request ID for tracing
    pub request_id: String,
}

impl<S> FromRequestParts<S> for AdminGuard
where
    S: Send + Sync,
    Arc<AuthConfig>: FromRef<S>,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self> {
        let config = Arc::<AuthConfig>::from_ref(state);

        let presented = parts
            .headers
            .get(config.admin_header.as_str())
            .and_then(|v| v.to_str().ok());

        verify_admin_key(&config, presented)?;

        let request_id = parts
            .headers
            .get(config.request_id_header.as_str())
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Ok(AdminGuard { request_id })
    }
}
