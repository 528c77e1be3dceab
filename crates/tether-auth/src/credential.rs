//! JWT-shaped credential decoding.
//!
//! Only the claims the refresh policy needs are read (`sub`, `iat`, `exp`).
//! Signatures are not verified; the backend is authoritative.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::Value;

use crate::errors::AuthError;

/// Decoded access token claims.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credential {
    /// `sub` claim.
    pub subject: Option<String>,
    /// `iat` claim, seconds since the Unix epoch.
    pub issued_at: Option<i64>,
    /// `exp` claim, seconds since the Unix epoch.
    pub expires_at: Option<i64>,
    /// The token as received.
    pub raw_token: String,
}

impl Credential {
    /// Decode a `header.payload.signature` token.
    ///
    /// Fails when the token is not three segments, the payload is not
    /// base64url JSON, or `exp` is not after `iat`.
    pub fn decode(raw: &str) -> Result<Self, AuthError> {
        let mut segments = raw.split('.');
        let (Some(_header), Some(payload), Some(_signature), None) = (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) else {
            return Err(AuthError::Decode(
                "expected three dot-separated segments".into(),
            ));
        };

        let bytes = URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .map_err(|e| AuthError::Decode(format!("payload is not base64url: {e}")))?;
        let claims: Value = serde_json::from_slice(&bytes)
            .map_err(|e| AuthError::Decode(format!("payload is not JSON: {e}")))?;
        let Value::Object(claims) = claims else {
            return Err(AuthError::Decode("payload is not a claims object".into()));
        };

        let issued_at = numeric_date(&claims, "iat")?;
        let expires_at = numeric_date(&claims, "exp")?;
        if let (Some(iat), Some(exp)) = (issued_at, expires_at) {
            if exp <= iat {
                return Err(AuthError::Decode(format!(
                    "exp ({exp}) is not after iat ({iat})"
                )));
            }
        }

        Ok(Self {
            subject: claims.get("sub").and_then(Value::as_str).map(str::to_string),
            issued_at,
            expires_at,
            raw_token: raw.to_string(),
        })
    }

    /// `exp - iat`, when both claims are present.
    pub fn lifetime_seconds(&self) -> Option<i64> {
        Some(self.expires_at? - self.issued_at?)
    }

    /// `exp - now`, when the token expires at all.
    pub fn time_remaining(&self, now: i64) -> Option<i64> {
        self.expires_at.map(|exp| exp - now)
    }
}

#[allow(clippy::cast_possible_truncation)]
fn numeric_date(
    claims: &serde_json::Map<String, Value>,
    name: &str,
) -> Result<Option<i64>, AuthError> {
    match claims.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.floor() as i64))
            .map(Some)
            .ok_or_else(|| AuthError::Decode(format!("{name} is out of range"))),
        Some(_) => Err(AuthError::Decode(format!("{name} is not a number"))),
    }
}

/// Current wall-clock time in seconds since the Unix epoch.
pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Build an unsigned token around `claims`.
///
/// Useful for local tooling and tests; a real backend signs its tokens.
pub fn encode_unsigned_token(claims: &Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{header}.{payload}.")
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
