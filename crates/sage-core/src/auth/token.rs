//! Token claim inspection.
//!
//! Access tokens issued by the SAGE backend are JWTs. The client only reads
//! the payload to learn when a token expires; signatures are never checked,
//! the issuer is the trust boundary.

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, NO_PAD};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// base64url that accepts the payload with or without `=` padding
const PAYLOAD_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    NO_PAD.with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Decoded token payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// User id. The backend sends it as a string, other issuers as a number.
    #[serde(default, deserialize_with = "string_or_number")]
    pub sub: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Expiry, seconds since epoch
    #[serde(default)]
    pub exp: Option<f64>,
    /// Issued at, seconds since epoch
    #[serde(default)]
    pub iat: Option<f64>,
    #[serde(default)]
    pub jti: Option<String>,
    #[serde(default, rename = "type")]
    pub token_type: Option<String>,
}

impl Claims {
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.exp
            .and_then(|exp| DateTime::from_timestamp_millis((exp * 1000.0) as i64))
    }

    pub fn issued_at(&self) -> Option<DateTime<Utc>> {
        self.iat
            .and_then(|iat| DateTime::from_timestamp_millis((iat * 1000.0) as i64))
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Current time as fractional seconds since epoch
pub fn now_seconds() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Decode the payload of a `header.payload.signature` token.
///
/// Returns `None` for anything malformed: wrong segment count, bad base64,
/// or a payload that is not a JSON object.
pub fn decode(token: &str) -> Option<Claims> {
    let mut segments = token.split('.');
    let (Some(_header), Some(payload), Some(_signature), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return None;
    };

    let bytes = PAYLOAD_ENGINE.decode(payload).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// True when the token cannot be decoded, has no `exp`, or `exp` has passed.
pub fn is_expired(token: &str) -> bool {
    is_expired_at(token, now_seconds())
}

pub fn is_expired_at(token: &str, now: f64) -> bool {
    match decode(token).and_then(|claims| claims.exp) {
        Some(exp) => now >= exp,
        None => true,
    }
}

/// Seconds until expiry. Negative once expired, 0 when undecodable.
pub fn expires_in_seconds(token: &str) -> f64 {
    expires_in_seconds_at(token, now_seconds())
}

pub fn expires_in_seconds_at(token: &str, now: f64) -> f64 {
    decode(token)
        .and_then(|claims| claims.exp)
        .map(|exp| exp - now)
        .unwrap_or(0.0)
}

/// Build an unsigned token around `claims`. Test helper for modules that need
/// tokens with a chosen expiry.
#[cfg(test)]
pub(crate) fn encode_unsigned(claims: &serde_json::Value) -> String {
    let header = PAYLOAD_ENGINE.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = PAYLOAD_ENGINE.encode(claims.to_string());
    format!("{}.{}.signature", header, payload)
}

#[cfg(test)]
pub(crate) fn token_expiring_in(seconds: i64) -> String {
    let now = Utc::now().timestamp();
    encode_unsigned(&serde_json::json!({
        "sub": "1",
        "username": "admin",
        "exp": now + seconds,
        "iat": now,
        "type": "access",
    }))
}
