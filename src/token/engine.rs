//! Issue, verify, refresh, and revoke access/refresh token pairs.

use super::{
    claims::{AccessClaims, RefreshTokenRecord, Subject, TokenPair},
    jws,
    store::{RefreshStore, TokenBlacklist, new_refresh_value, refresh_key},
};
use crate::{
    Error, Result,
    clock::Clock,
    identity::{BearerIdentity, BearerTokenVerifier},
    jwks::KeyManager,
    types::UserId,
};
use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::{fmt, sync::Arc};
use tracing::{debug, info, instrument, warn};
use ulid::Ulid;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenConfig {
    issuer: String,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            issuer: "authn".to_string(),
            access_ttl: Duration::minutes(15),
            refresh_ttl: Duration::days(7),
        }
    }
}

impl TokenConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = issuer.into();
        self
    }

    #[must_use]
    pub const fn with_access_ttl(mut self, ttl: Duration) -> Self {
        self.access_ttl = ttl;
        self
    }

    #[must_use]
    pub const fn with_refresh_ttl(mut self, ttl: Duration) -> Self {
        self.refresh_ttl = ttl;
        self
    }

    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    #[must_use]
    pub const fn access_ttl(&self) -> Duration {
        self.access_ttl
    }

    #[must_use]
    pub const fn refresh_ttl(&self) -> Duration {
        self.refresh_ttl
    }

    /// # Errors
    /// `invalid-argument` for an empty issuer or non-positive TTLs.
    pub fn validate(&self) -> Result<()> {
        if self.issuer.trim().is_empty() {
            return Err(Error::invalid_argument("issuer cannot be empty"));
        }
        if self.access_ttl <= Duration::zero() || self.refresh_ttl <= Duration::zero() {
            return Err(Error::invalid_argument("token TTLs must be positive"));
        }
        Ok(())
    }
}

/// Tokens minted but not yet persisted.
struct Minted {
    pair: TokenPair,
    refresh_key: String,
    record: RefreshTokenRecord,
}

pub struct TokenEngine {
    keys: Arc<KeyManager>,
    refresh_store: Arc<dyn RefreshStore>,
    blacklist: Arc<dyn TokenBlacklist>,
    clock: Arc<dyn Clock>,
    config: TokenConfig,
}

impl fmt::Debug for TokenEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TokenEngine {
    #[must_use]
    pub fn new(
        keys: Arc<KeyManager>,
        refresh_store: Arc<dyn RefreshStore>,
        blacklist: Arc<dyn TokenBlacklist>,
        clock: Arc<dyn Clock>,
        config: TokenConfig,
    ) -> Self {
        Self {
            keys,
            refresh_store,
            blacklist,
            clock,
            config,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &TokenConfig {
        &self.config
    }

    /// # Errors
    /// `no-active-key` when nothing can sign, `internal` on store failures.
    #[instrument(skip(self, subject), fields(user_id = %subject.user_id, account_id = %subject.account_id))]
    pub async fn issue(&self, subject: &Subject) -> Result<TokenPair> {
        let minted = self.mint(subject.clone()).await?;
        self.refresh_store
            .save(&minted.refresh_key, &minted.record, self.config.refresh_ttl)
            .await?;
        info!(token_id = %minted.pair.token_id, "token pair issued");
        Ok(minted.pair)
    }

    /// Verify signature, then expiry, then revocation.
    ///
    /// # Errors
    /// `token-invalid` for a bad signature, unknown kid, or revoked token;
    /// `expired` once `exp` has passed.
    pub async fn verify(&self, token: &str) -> Result<AccessClaims> {
        let claims = self.verify_signed(token).await?;
        if claims.exp <= self.clock.now().timestamp() {
            return Err(Error::expired("access token expired"));
        }
        if self.blacklist.is_blacklisted(&claims.jti).await? {
            debug!(token_id = %claims.jti, "revoked token presented");
            return Err(Error::token_invalid("token revoked"));
        }
        Ok(claims)
    }

    /// Exchange a refresh value for a new pair; the old value stops working.
    ///
    /// # Errors
    /// `token-invalid` for unknown or already-used values, `expired` for stale ones.
    #[instrument(skip_all)]
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair> {
        let old_key = refresh_key(refresh_token);
        let Some(record) = self.refresh_store.load(&old_key).await? else {
            return Err(Error::token_invalid("refresh token not found"));
        };
        if record.is_expired(self.clock.now()) {
            if let Err(err) = self.refresh_store.delete(&old_key).await {
                warn!(error = %err, "failed to delete expired refresh token");
            }
            return Err(Error::expired("refresh token expired"));
        }

        let minted = self.mint(record.subject).await?;
        let rotated = self
            .refresh_store
            .rotate(
                &old_key,
                &minted.refresh_key,
                &minted.record,
                self.config.refresh_ttl,
            )
            .await?;
        if !rotated {
            warn!(token_id = %record.token_id, "refresh token reused");
            return Err(Error::token_invalid("refresh token already used"));
        }
        info!(
            previous_token_id = %record.token_id,
            token_id = %minted.pair.token_id,
            "token pair refreshed"
        );
        Ok(minted.pair)
    }

    /// Blacklist an access token for the rest of its lifetime; expired tokens are a no-op.
    ///
    /// # Errors
    /// `token-invalid` when the signature does not verify.
    #[instrument(skip_all)]
    pub async fn revoke(&self, access_token: &str) -> Result<()> {
        let claims = self.verify_signed(access_token).await?;
        let remaining = claims.exp - self.clock.now().timestamp();
        if remaining <= 0 {
            debug!(token_id = %claims.jti, "token already expired, nothing to revoke");
            return Ok(());
        }
        self.blacklist
            .add(&claims.jti, Duration::seconds(remaining))
            .await?;
        info!(token_id = %claims.jti, "access token revoked");
        Ok(())
    }

    /// Delete a refresh value; unknown values succeed.
    ///
    /// # Errors
    /// `internal` on store failures.
    #[instrument(skip_all)]
    pub async fn revoke_refresh(&self, refresh_token: &str) -> Result<()> {
        self.refresh_store.delete(&refresh_key(refresh_token)).await?;
        Ok(())
    }

    /// Drop every refresh token of `user_id`.
    ///
    /// # Errors
    /// `internal` on store failures.
    #[instrument(skip(self))]
    pub async fn revoke_all_refresh(&self, user_id: UserId) -> Result<u64> {
        let deleted = self.refresh_store.delete_all_by_user(user_id).await?;
        info!(deleted, "refresh tokens revoked for user");
        Ok(deleted)
    }

    /// # Errors
    /// The refresh store's reachability error.
    pub async fn ping(&self) -> anyhow::Result<()> {
        self.refresh_store.ping().await
    }

    /// Signature, kid, and issuer checks without expiry or revocation.
    async fn verify_signed(&self, token: &str) -> Result<AccessClaims> {
        let unverified = jws::decode(token).map_err(|err| {
            debug!(error = %err, "malformed access token");
            Error::token_invalid("malformed token")
        })?;
        let kid = unverified.header.kid.clone();
        let Some(key) = self.keys.published_key(&kid).await? else {
            debug!(kid = %kid, "access token signed by unknown key");
            return Err(Error::token_invalid("unknown signing key"));
        };
        let claims = unverified.verify(&key.public_jwk).map_err(|err| {
            debug!(kid = %kid, error = %err, "access token rejected");
            Error::token_invalid("signature verification failed")
        })?;
        if claims.kid != kid {
            return Err(Error::token_invalid("kid mismatch"));
        }
        if claims.iss != self.config.issuer {
            return Err(Error::token_invalid("unexpected issuer"));
        }
        Ok(claims)
    }

    async fn mint(&self, subject: Subject) -> Result<Minted> {
        let signer = self.keys.active_signer().await?;
        let now = self.clock.now();
        let access_expires_at = now + self.config.access_ttl;
        let claims = AccessClaims {
            iss: self.config.issuer.clone(),
            sub: subject.user_id.to_string(),
            aid: subject.account_id.to_string(),
            aud: subject.audience.clone(),
            iat: now.timestamp(),
            exp: access_expires_at.timestamp(),
            jti: Ulid::new().to_string(),
            kid: signer.kid().as_str().to_string(),
            sid: subject.session_id.clone(),
            tid: subject.tenant_id.map(|tid| tid.to_string()),
            amr: subject.amr,
        };
        let access_token = jws::sign(&signer, &claims)
            .map_err(|err| anyhow!(err).context("Failed to sign access token"))?;

        let refresh_token = new_refresh_value();
        let refresh_expires_at: DateTime<Utc> = now + self.config.refresh_ttl;
        Ok(Minted {
            refresh_key: refresh_key(&refresh_token),
            record: RefreshTokenRecord {
                token_id: Ulid::new().to_string(),
                expires_at: refresh_expires_at,
                subject,
            },
            pair: TokenPair {
                access_token,
                refresh_token,
                token_id: claims.jti,
                expires_in: self.config.access_ttl.num_seconds(),
                access_expires_at,
                refresh_expires_at,
            },
        })
    }
}

#[async_trait]
impl BearerTokenVerifier for TokenEngine {
    async fn verify(&self, token: &str) -> Result<BearerIdentity> {
        let claims = TokenEngine::verify(self, token).await?;
        let Value::Object(map) = serde_json::to_value(&claims)
            .map_err(|err| anyhow!(err).context("Failed to encode claims"))?
        else {
            return Err(Error::internal("claims did not encode as an object"));
        };
        Ok(BearerIdentity {
            user_id: claims.user_id()?,
            account_id: claims.account_id()?,
            tenant_id: claims.tenant_id()?,
            claims: map,
        })
    }
}
