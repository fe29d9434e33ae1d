//! Persistence ports for accounts and credentials.
//!
//! Every call happens inside a [`UnitOfWork`]; dropping the unit without
//! calling [`UnitOfWork::commit`] discards its writes where the backend
//! supports it.

use super::{
    credential::{Credential, CredentialKind, CredentialUsage},
    model::{Account, NewAccount},
};
use crate::types::{AccountId, AccountStatus, AccountType, CredentialId, Idp, UserId};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

/// Result of an optimistic update guarded by `rev`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied,
    Conflict,
}

/// Anchor resolved from a phone or OAuth identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CredentialMatch {
    pub account_id: AccountId,
    pub user_id: UserId,
    pub credential_id: CredentialId,
}

#[async_trait]
pub trait AccountRepo: Send + Sync {
    /// Fails with `invalid-argument` when `(type, appId, externalId)` or `unionId` is taken.
    async fn create(&self, account: NewAccount) -> Result<Account>;
    async fn find_by_id(&self, id: AccountId) -> Result<Option<Account>>;
    async fn find_by_ref(
        &self,
        account_type: AccountType,
        external_id: &str,
        app_id: Option<&str>,
    ) -> Result<Option<Account>>;
    async fn update_status(&self, id: AccountId, status: AccountStatus) -> Result<()>;
    async fn update_user_id(&self, id: AccountId, user_id: UserId) -> Result<()>;
    async fn update_external_ref(
        &self,
        id: AccountId,
        external_id: &str,
        union_id: Option<&str>,
    ) -> Result<()>;
    async fn list_by_user_id(&self, user_id: UserId) -> Result<Vec<Account>>;
}

#[async_trait]
pub trait CredentialRepo: Send + Sync {
    /// Fails with `invalid-argument` when the identity is already bound.
    async fn create(&self, account_id: AccountId, kind: CredentialKind) -> Result<Credential>;
    async fn find_by_id(&self, id: CredentialId) -> Result<Option<Credential>>;
    async fn list_by_account(&self, account_id: AccountId) -> Result<Vec<Credential>>;
    async fn find_password_credential(
        &self,
        account_id: AccountId,
    ) -> Result<Option<(CredentialId, Vec<u8>)>>;
    async fn find_phone_otp_credential(&self, phone_e164: &str)
    -> Result<Option<CredentialMatch>>;
    async fn find_oauth_credential(
        &self,
        idp: Idp,
        app_id: &str,
        idp_identifier: &str,
    ) -> Result<Option<CredentialMatch>>;
    /// Write usage fields only when the stored revision still equals `expected_rev`;
    /// the stored revision becomes `expected_rev + 1`.
    async fn update_usage(
        &self,
        id: CredentialId,
        expected_rev: i64,
        usage: &CredentialUsage,
    ) -> Result<UpdateOutcome>;
    async fn rotate_hash(
        &self,
        id: CredentialId,
        material: &[u8],
        algo: &str,
        params: Option<&Value>,
    ) -> Result<()>;
}

/// Request-scoped transaction bundling the repositories.
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    fn accounts(&self) -> &dyn AccountRepo;
    fn credentials(&self) -> &dyn CredentialRepo;
    async fn commit(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait UnitOfWorkFactory: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>>;

    /// Cheap reachability probe for `/health`.
    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
