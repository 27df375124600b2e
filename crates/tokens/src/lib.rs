//! Capability tokens for single-use downloads.
//!
//! A token is an HS256 JWT (`header.payload.sig`) whose claims bind one file
//! to one tunnel for a bounded time. The signature proves the control plane
//! minted it; single-use is enforced by a compare-and-swap on the token
//! record in the state store, so replays lose even when two requests race.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use statestore::{StateStore, StoreError};

/// Shortest TTL a caller can request, in seconds.
pub const MIN_TTL_SECONDS: u64 = 60;

const TOKEN_KEY_PREFIX: &str = "token:";
const TUNNEL_KEY_PREFIX: &str = "tunnel:";

/// Signed claims carried inside the token string.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    /// Token ID, also the store record key suffix
    pub jti: String,
    /// Library-relative path the token authorizes
    pub file_path: String,
    /// Tunnel the token is bound to
    pub tunnel_id: String,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Expiration (Unix timestamp)
    pub exp: i64,
}

/// Store-side record backing a token; the `consumed` flag is what makes the
/// token single-use.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenRecord {
    token_id: String,
    file_path: String,
    tunnel_id: String,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    consumed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    consumed_at: Option<DateTime<Utc>>,
}

/// Result of minting a token
#[derive(Debug, Clone)]
pub struct MintedToken {
    pub token: String,
    pub token_id: String,
    /// Effective TTL after clamping
    pub ttl: Duration,
    pub expires_at: DateTime<Utc>,
}

/// Result of a successful consumption
#[derive(Debug, Clone)]
pub struct ConsumedToken {
    pub token_id: String,
    pub file_path: String,
    pub tunnel_id: String,
}

/// Why a token was rejected.
///
/// Everything except `Store` collapses into one opaque invalid-token outcome
/// at the public boundary; the distinction exists for logging and tests.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token signature rejected")]
    Signature,

    #[error("token expired")]
    Expired,

    #[error("token already consumed")]
    AlreadyConsumed,

    #[error("token malformed")]
    Malformed,

    #[error("no record for token")]
    Unknown,

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, TokenError>;

pub struct TokenService {
    store: Arc<dyn StateStore>,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    max_ttl: Duration,
}

impl TokenService {
    pub fn new(store: Arc<dyn StateStore>, secret: &str, max_ttl: Duration) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        Self {
            store,
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            max_ttl,
        }
    }

    /// Mint a token for `file_path`, bound to `tunnel_id`.
    ///
    /// The requested TTL is clamped to `[MIN_TTL_SECONDS, max_ttl]`; the
    /// store record carries the same TTL so expired tokens disappear on
    /// their own.
    pub async fn mint(
        &self,
        file_path: &str,
        ttl: Duration,
        tunnel_id: &str,
    ) -> Result<MintedToken> {
        let ttl = clamp_ttl(ttl, self.max_ttl);
        let token_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let expires_at = now + chrono::Duration::seconds(ttl.as_secs() as i64);

        let claims = Claims {
            jti: token_id.clone(),
            file_path: file_path.to_string(),
            tunnel_id: tunnel_id.to_string(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|_| TokenError::Malformed)?;

        let record = TokenRecord {
            token_id: token_id.clone(),
            file_path: file_path.to_string(),
            tunnel_id: tunnel_id.to_string(),
            issued_at: now,
            expires_at,
            consumed: false,
            consumed_at: None,
        };
        let json = serde_json::to_string(&record).map_err(|_| TokenError::Malformed)?;
        self.store
            .set(&token_key(&token_id), &json, Some(ttl))
            .await?;

        tracing::info!(token_id = %token_id, tunnel_id = %tunnel_id, file = %file_path,
            ttl_seconds = ttl.as_secs(), "minted download token");
        Ok(MintedToken {
            token,
            token_id,
            ttl,
            expires_at,
        })
    }

    /// Signature and expiry check only; the token stays consumable.
    pub fn peek(&self, token: &str) -> Result<Claims> {
        self.decode(token)
    }

    /// Verify the token and atomically flip its record to consumed.
    ///
    /// A second call for the same token fails, no matter how the calls
    /// interleave: losing the compare-and-swap is reported as already
    /// consumed.
    pub async fn validate_and_consume(&self, token: &str) -> Result<ConsumedToken> {
        let claims = self.decode(token)?;
        let key = token_key(&claims.jti);

        let raw = self.store.get(&key).await?.ok_or(TokenError::Unknown)?;
        let record: TokenRecord =
            serde_json::from_str(&raw).map_err(|_| TokenError::Malformed)?;
        if record.consumed {
            return Err(TokenError::AlreadyConsumed);
        }

        let consumed = TokenRecord {
            consumed: true,
            consumed_at: Some(Utc::now()),
            ..record.clone()
        };
        let updated = serde_json::to_string(&consumed).map_err(|_| TokenError::Malformed)?;
        if !self.store.compare_and_swap(&key, &raw, &updated).await? {
            return Err(TokenError::AlreadyConsumed);
        }

        tracing::info!(token_id = %record.token_id, tunnel_id = %record.tunnel_id,
            "consumed download token");
        Ok(ConsumedToken {
            token_id: record.token_id,
            file_path: record.file_path,
            tunnel_id: record.tunnel_id,
        })
    }

    /// Drop consumed token records whose tunnel no longer exists.
    ///
    /// Expiry is the store TTL's job; this pass only reclaims records that
    /// were consumed and whose tunnel has since been destroyed, and reports
    /// how many it removed.
    pub async fn sweep(&self) -> Result<u64> {
        let mut swept = 0u64;
        for key in self.store.keys_with_prefix(TOKEN_KEY_PREFIX).await? {
            let Some(raw) = self.store.get(&key).await? else {
                continue;
            };
            let Ok(record) = serde_json::from_str::<TokenRecord>(&raw) else {
                tracing::warn!(key = %key, "dropping unreadable token record");
                self.store.delete(&key).await?;
                swept += 1;
                continue;
            };
            if !record.consumed {
                continue;
            }
            let tunnel_key = format!("{TUNNEL_KEY_PREFIX}{}", record.tunnel_id);
            if self.store.get(&tunnel_key).await?.is_none() && self.store.delete(&key).await? {
                swept += 1;
            }
        }
        if swept > 0 {
            tracing::info!(swept, "token sweep removed stale records");
        }
        Ok(swept)
    }

    fn decode(&self, token: &str) -> Result<Claims> {
        decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|err| match err.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => TokenError::Signature,
                _ => TokenError::Malformed,
            })
    }
}

fn token_key(token_id: &str) -> String {
    format!("{TOKEN_KEY_PREFIX}{token_id}")
}

fn clamp_ttl(requested: Duration, max_ttl: Duration) -> Duration {
    requested
        .max(Duration::from_secs(MIN_TTL_SECONDS))
        .min(max_ttl)
}
