//! Bearer-token generation and validation for the HTTP front door.
//!
//! Tokens are HMAC-SHA256 based, scoped to a (user_id, expiry) pair.
//! Format: `tally_st_<user_id>_<expires_unix>_<hmac_hex>`

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Token prefix used to identify tally session tokens.
const TOKEN_PREFIX: &str = "tally_st_";

/// Errors that can occur during token operations.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("invalid token format: {0}")]
    InvalidFormat(String),

    #[error("invalid user id in token: {0}")]
    InvalidUserId(String),

    #[error("invalid expiry in token: {0}")]
    InvalidExpiry(String),

    #[error("token HMAC verification failed")]
    HmacMismatch,

    #[error("token has expired")]
    Expired,

    #[error("missing token secret")]
    MissingSecret,
}

/// Configuration for token generation and validation.
#[derive(Debug, Clone)]
pub struct TokenConfig {
    /// The HMAC secret key bytes.
    pub secret: Vec<u8>,
}

impl TokenConfig {
    /// Create a new TokenConfig with the given secret.
    pub fn new(secret: Vec<u8>) -> Self {
        Self { secret }
    }

    /// Create a TokenConfig from the `TALLY_TOKEN_SECRET` environment
    /// variable. The value must be a hex-encoded string (as written by
    /// `tally init`).
    pub fn from_env() -> Result<Self, TokenError> {
        let secret_hex =
            std::env::var("TALLY_TOKEN_SECRET").map_err(|_| TokenError::MissingSecret)?;
        let secret = hex::decode(&secret_hex).map_err(|e| {
            TokenError::InvalidFormat(format!("TALLY_TOKEN_SECRET is not valid hex: {e}"))
        })?;
        Ok(Self::new(secret))
    }
}

/// Claims extracted from a validated token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenClaims {
    /// The user this token authenticates.
    pub user_id: i64,
    /// Expiry instant, seconds precision.
    pub expires_at: DateTime<Utc>,
}

/// Generate a session token for a user, valid until `expires_at`.
///
/// The HMAC-SHA256 is computed over `<user_id>:<expires_unix>`.
pub fn issue_token(config: &TokenConfig, user_id: i64, expires_at: DateTime<Utc>) -> String {
    let expires_unix = expires_at.timestamp();
    let message = format!("{user_id}:{expires_unix}");
    let mac = compute_hmac(&config.secret, message.as_bytes());
    let hmac_hex = hex::encode(mac);
    format!("{TOKEN_PREFIX}{user_id}_{expires_unix}_{hmac_hex}")
}

/// Validate a session token against `now` and extract its claims.
///
/// Parses the format, recomputes the HMAC (verified in constant time), and
/// only then checks expiry, so a forged token never learns which check
/// failed first.
pub fn validate_token(
    config: &TokenConfig,
    token: &str,
    now: DateTime<Utc>,
) -> Result<TokenClaims, TokenError> {
    let rest = token.strip_prefix(TOKEN_PREFIX).ok_or_else(|| {
        TokenError::InvalidFormat(format!("token must start with {TOKEN_PREFIX:?}"))
    })?;

    let mut parts = rest.splitn(3, '_');
    let (Some(user_id_str), Some(expires_str), Some(hmac_hex)) =
        (parts.next(), parts.next(), parts.next())
    else {
        return Err(TokenError::InvalidFormat(
            "expected <user_id>_<expires>_<hmac>".to_owned(),
        ));
    };

    let user_id: i64 = user_id_str
        .parse()
        .map_err(|e: std::num::ParseIntError| TokenError::InvalidUserId(e.to_string()))?;
    let expires_unix: i64 = expires_str
        .parse()
        .map_err(|e: std::num::ParseIntError| TokenError::InvalidExpiry(e.to_string()))?;

    let provided_mac = hex::decode(hmac_hex)
        .map_err(|e| TokenError::InvalidFormat(format!("invalid hex in hmac: {e}")))?;

    let message = format!("{user_id}:{expires_unix}");
    verify_hmac_constant_time(&config.secret, message.as_bytes(), &provided_mac)?;

    let expires_at = DateTime::from_timestamp(expires_unix, 0)
        .ok_or_else(|| TokenError::InvalidExpiry(format!("{expires_unix} out of range")))?;
    if now > expires_at {
        return Err(TokenError::Expired);
    }

    Ok(TokenClaims {
        user_id,
        expires_at,
    })
}

/// Compute HMAC-SHA256 over the given message with the given key.
fn compute_hmac(key: &[u8], message: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(message);
    mac.finalize().into_bytes().to_vec()
}

/// Verify HMAC using the Mac verifier's constant-time comparison.
fn verify_hmac_constant_time(
    key: &[u8],
    message: &[u8],
    provided: &[u8],
) -> Result<(), TokenError> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(message);
    mac.verify_slice(provided)
        .map_err(|_| TokenError::HmacMismatch)
}
