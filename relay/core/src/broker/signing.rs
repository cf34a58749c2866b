//! Token Signing
//!
//! Subscription tokens minted by the in-process broker are HMAC-SHA256 signed
//! claims:
//!
//! ```text
//! base64url(claims JSON) "." base64url(HMAC-SHA256(key, first part))
//! ```
//!
//! The signing key is 32 random bytes generated per broker instance, so tokens
//! do not survive a broker restart.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::channel::{ChannelAddress, TopicSet};

use super::traits::TransportError;

type HmacSha256 = Hmac<Sha256>;

/// Size of the signing key in bytes
pub const KEY_SIZE: usize = 32;

/// Claims carried inside a token
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Channel the token grants access to
    pub channel: ChannelAddress,
    /// Topics the token grants access to
    pub topics: TopicSet,
    /// Issued-at, Unix milliseconds
    pub iat: i64,
    /// Expiry, Unix milliseconds
    pub exp: i64,
    /// Random nonce so re-issued tokens differ
    pub nonce: String,
}

impl TokenClaims {
    /// Expiry as a timestamp
    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.exp).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Issued-at as a timestamp
    #[must_use]
    pub fn issued_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.iat).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

/// Signs and verifies token claims
#[derive(Clone)]
pub struct TokenSigner {
    key: [u8; KEY_SIZE],
}

impl TokenSigner {
    /// Create a signer with a fresh random key
    #[must_use]
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut key);
        Self { key }
    }

    /// Create a signer from a fixed key
    #[must_use]
    pub fn from_key(key: [u8; KEY_SIZE]) -> Self {
        Self { key }
    }

    fn mac(&self) -> Result<HmacSha256, TransportError> {
        HmacSha256::new_from_slice(&self.key)
            .map_err(|e| TransportError::Serialization(format!("invalid signing key: {e}")))
    }

    /// Produce the opaque token string for `claims`
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Serialization`] if the claims cannot be encoded.
    pub fn sign(&self, claims: &TokenClaims) -> Result<String, TransportError> {
        let json = serde_json::to_vec(claims)
            .map_err(|e| TransportError::Serialization(e.to_string()))?;
        let body = URL_SAFE_NO_PAD.encode(json);

        let mut mac = self.mac()?;
        mac.update(body.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

        Ok(format!("{body}.{signature}"))
    }

    /// Check a token's signature and expiry and return its claims
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Unauthorized`] for malformed or forged
    /// tokens and [`TransportError::TokenExpired`] once `now` is past expiry.
    pub fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<TokenClaims, TransportError> {
        let (body, signature) = token
            .split_once('.')
            .ok_or_else(|| TransportError::Unauthorized("malformed token".to_string()))?;

        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| TransportError::Unauthorized("malformed signature".to_string()))?;

        let mut mac = self.mac()?;
        mac.update(body.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| TransportError::Unauthorized("bad signature".to_string()))?;

        let json = URL_SAFE_NO_PAD
            .decode(body)
            .map_err(|_| TransportError::Unauthorized("malformed claims".to_string()))?;
        let claims: TokenClaims = serde_json::from_slice(&json)
            .map_err(|_| TransportError::Unauthorized("malformed claims".to_string()))?;

        if now.timestamp_millis() >= claims.exp {
            return Err(TransportError::TokenExpired);
        }

        Ok(claims)
    }
}

impl std::fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TokenSigner(<redacted>)")
    }
}
