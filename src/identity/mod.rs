//! Ports to collaborators outside the authentication core.

pub mod audit;
pub mod hasher;
pub mod idp;
pub mod otp;
pub mod user;
pub mod wechat;

use crate::{
    Result,
    types::{AccountId, TenantId, UserId},
};
use async_trait::async_trait;
use serde_json::{Map, Value};

pub use audit::{AuditLogger, AuthAuditEvent, TracingAuditLogger};
pub use hasher::{Argon2Hasher, Argon2Params, HashedPassword, PasswordHasher};
pub use idp::{IdentityProvider, StaticIdentityProvider, WecomIdentity, WxMinipIdentity};
pub use otp::{LOGIN_SCENE, MemoryOtpVerifier, OtpVerifier};
pub use user::{AllowAllUsers, MemoryUserDirectory, PgUserStatusLookup, UserStatusLookup};
pub use wechat::WechatIdentityProvider;

/// Subject carried by an already-issued bearer token.
#[derive(Clone, Debug, PartialEq)]
pub struct BearerIdentity {
    pub user_id: UserId,
    pub account_id: AccountId,
    pub tenant_id: Option<TenantId>,
    pub claims: Map<String, Value>,
}

/// Verifies bearer tokens for the "already authenticated upstream" login.
///
/// Failures use `token-invalid` or `expired`; anything else is a system failure.
#[async_trait]
pub trait BearerTokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<BearerIdentity>;
}
