//! Token handling for host registration and heartbeats. Tokens are stored
//! only as SHA-256 hex digests and compared constant-time so equality never
//! short-circuits on the first differing byte.

use axum::http::HeaderMap;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

pub fn hash_token(token: &str) -> String {
    format!("{:x}", Sha256::digest(token.as_bytes()))
}

pub fn secure_compare_token(token: &str, stored_hash: Option<&str>) -> bool {
    let Some(stored_hash) = stored_hash else {
        return false;
    };
    hash_token(token).as_bytes().ct_eq(stored_hash.as_bytes()).into()
}

/// Fresh random session token plus its expiry.
pub fn new_session_token(hours: i64) -> (String, DateTime<Utc>) {
    let mut bytes = [0u8; 48];
    rand::thread_rng().fill_bytes(&mut bytes);
    (URL_SAFE_NO_PAD.encode(bytes), Utc::now() + Duration::hours(hours))
}

/// The token of an `Authorization: Bearer <token>` header, if present.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
}
