// src/services/hub/auth.rs

use jsonwebtoken::{encode, EncodingKey, Header};
use serde::{Deserialize, Serialize};

use crate::utils::errors::ApiError;

/// Tokens are good for one hour.
pub const TOKEN_TTL_SECS: i64 = 3_600;

#[derive(Debug, Serialize, Deserialize)]
pub struct HubClaims {
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
}

fn mint(audience: String, access_key: &str, now_unix: i64) -> Result<String, ApiError> {
    let claims = HubClaims { aud: audience, iat: now_unix, exp: now_unix + TOKEN_TTL_SECS };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(access_key.as_bytes()))
        .map_err(|e| ApiError::Other(format!("token minting failed: {e}")))
}

/// Service-side token for REST broadcasts to a hub.
pub fn service_token(
    endpoint: &str,
    access_key: &str,
    hub: &str,
    now_unix: i64,
) -> Result<String, ApiError> {
    mint(format!("{endpoint}/api/v1/hubs/{hub}"), access_key, now_unix)
}

/// Browser-client URL for a hub.
pub fn client_url(endpoint: &str, hub: &str) -> String {
    format!("{endpoint}/client/?hub={hub}")
}

/// Token handed out by /negotiate for the client URL.
pub fn client_token(
    endpoint: &str,
    access_key: &str,
    hub: &str,
    now_unix: i64,
) -> Result<String, ApiError> {
    mint(client_url(endpoint, hub), access_key, now_unix)
}

// ======================================================================
// UNIT TESTS
// ======================================================================
