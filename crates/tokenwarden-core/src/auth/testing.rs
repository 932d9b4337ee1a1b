//! Helpers for building unsigned tokens in tests.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use serde_json::{json, Value};

pub fn now_secs() -> i64 {
    Utc::now().timestamp()
}

pub fn make_token(claims: Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{}.{}.signature", header, payload)
}

/// Access token for `user_id`/`username` expiring `ttl_secs` from now (negative for stale).
pub fn access_token(user_id: i64, username: &str, ttl_secs: i64) -> String {
    make_token(json!({
        "token_type": "access",
        "user_id": user_id,
        "username": username,
        "email": format!("{}@example.com", username),
        "exp": now_secs() + ttl_secs,
    }))
}

pub fn refresh_token(tag: &str) -> String {
    make_token(json!({
        "token_type": "refresh",
        "jti": tag,
        "exp": now_secs() + 86_400,
    }))
}
