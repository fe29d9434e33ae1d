//! Access-token claims, token pairs, and refresh records.

use crate::{
    Error, Result,
    types::{AccountId, Amr, TenantId, UserId},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use utoipa::ToSchema;

/// Payload of a signed access token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct AccessClaims {
    pub iss: String,
    /// User id, decimal.
    pub sub: String,
    /// Account id, decimal.
    pub aid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
    pub kid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    /// Tenant id, decimal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<String>)]
    pub amr: Option<Amr>,
}

impl AccessClaims {
    /// # Errors
    /// `token-invalid` when `sub` is not a user id.
    pub fn user_id(&self) -> Result<UserId> {
        self.sub
            .parse()
            .map_err(|_| Error::token_invalid("sub is not a user id"))
    }

    /// # Errors
    /// `token-invalid` when `aid` is not an account id.
    pub fn account_id(&self) -> Result<AccountId> {
        self.aid
            .parse()
            .map_err(|_| Error::token_invalid("aid is not an account id"))
    }

    /// # Errors
    /// `token-invalid` when `tid` is present but not a tenant id.
    pub fn tenant_id(&self) -> Result<Option<TenantId>> {
        self.tid
            .as_deref()
            .map(str::parse)
            .transpose()
            .map_err(|_| Error::token_invalid("tid is not a tenant id"))
    }

    #[must_use]
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.exp, 0)
    }
}

/// Who a token pair is issued to; refresh records carry the same fields so a
/// rotated pair is equivalent to the original.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
    pub user_id: UserId,
    pub account_id: AccountId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<TenantId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amr: Option<Amr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl Subject {
    #[must_use]
    pub const fn new(user_id: UserId, account_id: AccountId) -> Self {
        Self {
            user_id,
            account_id,
            tenant_id: None,
            amr: None,
            audience: None,
            session_id: None,
        }
    }

    #[must_use]
    pub const fn with_tenant_id(mut self, tenant_id: Option<TenantId>) -> Self {
        self.tenant_id = tenant_id;
        self
    }

    #[must_use]
    pub const fn with_amr(mut self, amr: Amr) -> Self {
        self.amr = Some(amr);
        self
    }

    #[must_use]
    pub fn with_audience(mut self, audience: Option<String>) -> Self {
        self.audience = audience;
        self
    }

    #[must_use]
    pub fn with_session_id(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    /// `jti` of the access token.
    pub token_id: String,
    pub expires_in: i64,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
}

impl TokenPair {
    pub const TOKEN_TYPE: &'static str = "Bearer";
}

impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token", &"***")
            .field("refresh_token", &"***")
            .field("token_id", &self.token_id)
            .field("expires_in", &self.expires_in)
            .field("access_expires_at", &self.access_expires_at)
            .field("refresh_expires_at", &self.refresh_expires_at)
            .finish()
    }
}

/// Refresh-store payload, keyed by the digest of the refresh value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshTokenRecord {
    pub token_id: String,
    pub expires_at: DateTime<Utc>,
    #[serde(flatten)]
    pub subject: Subject,
}

impl RefreshTokenRecord {
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
