//! Access token inspection.
//!
//! Tokens are JWTs issued by a trusted provider. Only the payload segment is
//! decoded; signatures are the server's concern.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum TokenError {
    #[error("Malformed token: expected 3 segments, found {0}")]
    Malformed(usize),

    #[error("Invalid payload encoding: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("Invalid claims: {0}")]
    Claims(#[from] serde_json::Error),
}

/// Claims carried by an access token.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DecodedClaims {
    #[serde(default, deserialize_with = "string_or_number")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    /// Expiry in epoch seconds, possibly fractional
    #[serde(default, deserialize_with = "numeric_date")]
    pub exp: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DecodedClaims {
    /// Decode the payload segment of a compact JWT.
    pub fn decode(token: &str) -> Result<Self, TokenError> {
        let segments: Vec<&str> = token.split('.').collect();
        if segments.len() != 3 {
            return Err(TokenError::Malformed(segments.len()));
        }

        let payload = URL_SAFE_NO_PAD.decode(segments[1].trim_end_matches('='))?;
        Ok(serde_json::from_slice(&payload)?)
    }
}

/// Django-style issuers emit `user_id` as an integer, others as a string.
fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// NumericDate may be an integer or a float. Anything else counts as absent.
fn numeric_date<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Number(n)) => n.as_f64().filter(|exp| exp.is_finite()),
        _ => None,
    })
}

/// Decides whether an access token is stale.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenInspector {
    leeway_secs: i64,
}

impl TokenInspector {
    /// Inspector that compares `exp` against the clock with no tolerance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Treat tokens as stale `leeway_secs` before their `exp`.
    pub fn with_leeway(leeway_secs: u64) -> Self {
        Self {
            leeway_secs: leeway_secs.min(i64::MAX as u64) as i64,
        }
    }

    pub fn decode_claims(&self, token: &str) -> Result<DecodedClaims, TokenError> {
        DecodedClaims::decode(token)
    }

    /// True when the token is past its expiry, has no expiry, or can't be decoded.
    pub fn is_expired(&self, token: &str) -> bool {
        self.is_expired_at(token, Utc::now().timestamp_millis())
    }

    pub fn is_expired_at(&self, token: &str, now_millis: i64) -> bool {
        match DecodedClaims::decode(token) {
            Ok(claims) => match claims.exp {
                Some(exp) => (exp - self.leeway_secs as f64) * 1000.0 < now_millis as f64,
                None => true,
            },
            Err(e) => {
                debug!(error = %e, "Treating undecodable token as expired");
                true
            }
        }
    }
}
