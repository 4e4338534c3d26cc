//! Signed, time-limited tokens proving control of an inbox.
//!
//! A token is three URL-safe base64 segments joined by `.`: the email, the
//! issue time (big-endian unix seconds) and an HMAC-SHA256 over the first two
//! segments. Tokens are stateless: verification only needs the secret and the
//! clock.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Confirmation links stop working after five minutes.
pub const CONFIRMATION_MAX_AGE_SECS: i64 = 300;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("Token expired")]
    Expired,
    #[error("The token is invalid!")]
    Invalid,
}

#[derive(Clone)]
pub struct TokenSigner {
    mac: HmacSha256,
}

impl TokenSigner {
    pub fn new(secret: &[u8]) -> anyhow::Result<Self> {
        let mac = HmacSha256::new_from_slice(secret)
            .map_err(|e| anyhow::anyhow!("invalid signing key: {}", e))?;
        Ok(Self { mac })
    }

    /// Signer with a random key; tokens do not survive a restart.
    pub fn with_random_key() -> anyhow::Result<Self> {
        use rand::RngCore;
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        Self::new(&key)
    }

    pub fn sign(&self, email: &str) -> String {
        self.sign_at(email, Utc::now())
    }

    pub fn sign_at(&self, email: &str, issued_at: DateTime<Utc>) -> String {
        let payload = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(email.as_bytes()),
            URL_SAFE_NO_PAD.encode(issued_at.timestamp().to_be_bytes())
        );
        let mut mac = self.mac.clone();
        mac.update(payload.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        format!("{}.{}", payload, signature)
    }

    /// Returns the embedded email if the token is authentic and no older than
    /// `max_age_secs`.
    pub fn verify(&self, token: &str, max_age_secs: i64) -> Result<String, TokenError> {
        self.verify_at(token, max_age_secs, Utc::now())
    }

    pub fn verify_at(
        &self,
        token: &str,
        max_age_secs: i64,
        now: DateTime<Utc>,
    ) -> Result<String, TokenError> {
        let (payload, signature) = token.rsplit_once('.').ok_or(TokenError::Invalid)?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| TokenError::Invalid)?;

        let mut mac = self.mac.clone();
        mac.update(payload.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| TokenError::Invalid)?;

        let (email, issued_at) = payload.split_once('.').ok_or(TokenError::Invalid)?;
        let email = URL_SAFE_NO_PAD
            .decode(email)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .ok_or(TokenError::Invalid)?;
        let issued_at: [u8; 8] = URL_SAFE_NO_PAD
            .decode(issued_at)
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or(TokenError::Invalid)?;
        let issued_at = i64::from_be_bytes(issued_at);

        let age = now.timestamp() - issued_at;
        if age < 0 {
            return Err(TokenError::Invalid);
        }
        if age > max_age_secs {
            return Err(TokenError::Expired);
        }

        Ok(email)
    }
}

impl std::fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSigner").finish_non_exhaustive()
    }
}
