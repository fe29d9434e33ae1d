//! In-memory account and credential store.
//!
//! Writes are applied as they happen, so a unit of work dropped without
//! `commit` keeps them. Used for local runs without a database and in tests.

use super::{
    credential::{Credential, CredentialKind, CredentialUsage},
    model::{Account, NewAccount},
    repo::{
        AccountRepo, CredentialMatch, CredentialRepo, UnitOfWork, UnitOfWorkFactory,
        UpdateOutcome,
    },
};
use crate::{
    Error,
    clock::Clock,
    types::{AccountId, AccountStatus, AccountType, CredentialId, Idp, UserId},
};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::Value;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;

#[derive(Debug, Default)]
struct MemoryState {
    accounts: HashMap<AccountId, Account>,
    credentials: HashMap<CredentialId, Credential>,
    next_account_id: i64,
    next_credential_id: i64,
}

#[derive(Clone, Debug)]
pub struct MemoryAccountStore {
    state: Arc<Mutex<MemoryState>>,
    clock: Arc<dyn Clock>,
}

impl MemoryAccountStore {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                next_account_id: 1,
                next_credential_id: 1,
                ..MemoryState::default()
            })),
            clock,
        }
    }

    /// Seed an account with a fixed id; used to mirror fixtures from other systems.
    ///
    /// # Errors
    /// Returns an error when the id is taken or the account is invalid.
    pub async fn insert_account_with_id(&self, id: AccountId, account: NewAccount) -> Result<Account> {
        account.validate()?;
        let mut state = self.state.lock().await;
        if state.accounts.contains_key(&id) {
            return Err(Error::invalid_argument(format!("account {id} already exists")).into());
        }
        ensure_account_unique(&state, &account)?;
        let now = self.clock.now();
        let created = Account {
            id,
            user_id: account.user_id,
            account_type: account.account_type,
            app_id: account.app_id,
            external_id: account.external_id,
            union_id: account.union_id,
            status: account.status,
            profile: account.profile,
            meta: account.meta,
            created_at: now,
            updated_at: now,
        };
        state.accounts.insert(id, created.clone());
        state.next_account_id = state.next_account_id.max(id.get() + 1);
        Ok(created)
    }
}

#[async_trait]
impl UnitOfWorkFactory for MemoryAccountStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>> {
        Ok(Box::new(self.clone()))
    }
}

#[async_trait]
impl UnitOfWork for MemoryAccountStore {
    fn accounts(&self) -> &dyn AccountRepo {
        self
    }

    fn credentials(&self) -> &dyn CredentialRepo {
        self
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

fn ensure_account_unique(state: &MemoryState, account: &NewAccount) -> Result<()> {
    let clash = state.accounts.values().any(|existing| {
        existing.account_type == account.account_type
            && existing.app_id == account.app_id
            && existing.external_id == account.external_id
    });
    if clash {
        return Err(Error::invalid_argument(format!(
            "account {}:{} already exists",
            account.account_type, account.external_id
        ))
        .into());
    }
    if let Some(union_id) = &account.union_id
        && state
            .accounts
            .values()
            .any(|existing| existing.union_id.as_ref() == Some(union_id))
    {
        return Err(Error::invalid_argument("unionId is already bound").into());
    }
    Ok(())
}

fn ensure_credential_unique(
    state: &MemoryState,
    account_id: AccountId,
    kind: &CredentialKind,
) -> Result<()> {
    let clash = state.credentials.values().any(|existing| match (&existing.kind, kind) {
        (CredentialKind::Password { .. }, CredentialKind::Password { .. }) => {
            existing.account_id == account_id
        }
        (
            CredentialKind::PhoneOtp { phone_e164: a },
            CredentialKind::PhoneOtp { phone_e164: b },
        ) => a == b,
        (
            CredentialKind::OAuth {
                idp: idp_a,
                app_id: app_a,
                idp_identifier: id_a,
            },
            CredentialKind::OAuth {
                idp: idp_b,
                app_id: app_b,
                idp_identifier: id_b,
            },
        ) => idp_a == idp_b && app_a == app_b && id_a == id_b,
        _ => false,
    });
    if clash {
        return Err(Error::invalid_argument(format!(
            "{} credential is already bound",
            kind.credential_type()
        ))
        .into());
    }
    Ok(())
}

fn credential_match(state: &MemoryState, cred: &Credential) -> Option<CredentialMatch> {
    state.accounts.get(&cred.account_id).map(|account| CredentialMatch {
        account_id: account.id,
        user_id: account.user_id,
        credential_id: cred.id,
    })
}

#[async_trait]
impl AccountRepo for MemoryAccountStore {
    async fn create(&self, account: NewAccount) -> Result<Account> {
        account.validate()?;
        let mut state = self.state.lock().await;
        ensure_account_unique(&state, &account)?;
        let id = AccountId::new(state.next_account_id);
        state.next_account_id += 1;
        let now = self.clock.now();
        let created = Account {
            id,
            user_id: account.user_id,
            account_type: account.account_type,
            app_id: account.app_id,
            external_id: account.external_id,
            union_id: account.union_id,
            status: account.status,
            profile: account.profile,
            meta: account.meta,
            created_at: now,
            updated_at: now,
        };
        state.accounts.insert(id, created.clone());
        Ok(created)
    }

    async fn find_by_id(&self, id: AccountId) -> Result<Option<Account>> {
        Ok(self.state.lock().await.accounts.get(&id).cloned())
    }

    async fn find_by_ref(
        &self,
        account_type: AccountType,
        external_id: &str,
        app_id: Option<&str>,
    ) -> Result<Option<Account>> {
        let state = self.state.lock().await;
        Ok(state
            .accounts
            .values()
            .find(|account| {
                account.account_type == account_type
                    && account.external_id == external_id
                    && account.app_id.as_deref() == app_id
            })
            .cloned())
    }

    async fn update_status(&self, id: AccountId, status: AccountStatus) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let account = state
            .accounts
            .get_mut(&id)
            .ok_or_else(|| anyhow!(Error::not_found(format!("account {id} not found"))))?;
        account.status = status;
        account.updated_at = now;
        Ok(())
    }

    async fn update_user_id(&self, id: AccountId, user_id: UserId) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let account = state
            .accounts
            .get_mut(&id)
            .ok_or_else(|| anyhow!(Error::not_found(format!("account {id} not found"))))?;
        account.user_id = user_id;
        account.updated_at = now;
        Ok(())
    }

    async fn update_external_ref(
        &self,
        id: AccountId,
        external_id: &str,
        union_id: Option<&str>,
    ) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        if let Some(union_id) = union_id
            && state
                .accounts
                .values()
                .any(|other| other.id != id && other.union_id.as_deref() == Some(union_id))
        {
            return Err(Error::invalid_argument("unionId is already bound").into());
        }
        let account = state
            .accounts
            .get_mut(&id)
            .ok_or_else(|| anyhow!(Error::not_found(format!("account {id} not found"))))?;
        account.external_id = external_id.to_string();
        account.union_id = union_id.map(str::to_string);
        account.updated_at = now;
        Ok(())
    }

    async fn list_by_user_id(&self, user_id: UserId) -> Result<Vec<Account>> {
        let state = self.state.lock().await;
        let mut accounts: Vec<Account> = state
            .accounts
            .values()
            .filter(|account| account.user_id == user_id)
            .cloned()
            .collect();
        accounts.sort_by_key(|account| account.id);
        Ok(accounts)
    }
}

#[async_trait]
impl CredentialRepo for MemoryAccountStore {
    async fn create(&self, account_id: AccountId, kind: CredentialKind) -> Result<Credential> {
        kind.validate()?;
        let mut state = self.state.lock().await;
        if !state.accounts.contains_key(&account_id) {
            return Err(Error::not_found(format!("account {account_id} not found")).into());
        }
        ensure_credential_unique(&state, account_id, &kind)?;
        let id = CredentialId::new(state.next_credential_id);
        state.next_credential_id += 1;
        let now = self.clock.now();
        let credential = Credential {
            id,
            account_id,
            kind,
            usage: CredentialUsage::default(),
            rev: 0,
            created_at: now,
            updated_at: now,
        };
        state.credentials.insert(id, credential.clone());
        Ok(credential)
    }

    async fn find_by_id(&self, id: CredentialId) -> Result<Option<Credential>> {
        Ok(self.state.lock().await.credentials.get(&id).cloned())
    }

    async fn list_by_account(&self, account_id: AccountId) -> Result<Vec<Credential>> {
        let state = self.state.lock().await;
        let mut credentials: Vec<Credential> = state
            .credentials
            .values()
            .filter(|cred| cred.account_id == account_id)
            .cloned()
            .collect();
        credentials.sort_by_key(|cred| cred.id);
        Ok(credentials)
    }

    async fn find_password_credential(
        &self,
        account_id: AccountId,
    ) -> Result<Option<(CredentialId, Vec<u8>)>> {
        let state = self.state.lock().await;
        Ok(state.credentials.values().find_map(|cred| match &cred.kind {
            CredentialKind::Password { material, .. } if cred.account_id == account_id => {
                Some((cred.id, material.clone()))
            }
            _ => None,
        }))
    }

    async fn find_phone_otp_credential(
        &self,
        phone_e164: &str,
    ) -> Result<Option<CredentialMatch>> {
        let state = self.state.lock().await;
        Ok(state
            .credentials
            .values()
            .find(|cred| {
                matches!(&cred.kind, CredentialKind::PhoneOtp { phone_e164: phone } if phone == phone_e164)
            })
            .and_then(|cred| credential_match(&state, cred)))
    }

    async fn find_oauth_credential(
        &self,
        idp: Idp,
        app_id: &str,
        idp_identifier: &str,
    ) -> Result<Option<CredentialMatch>> {
        let state = self.state.lock().await;
        Ok(state
            .credentials
            .values()
            .find(|cred| match &cred.kind {
                CredentialKind::OAuth {
                    idp: stored_idp,
                    app_id: stored_app,
                    idp_identifier: stored_identifier,
                } => *stored_idp == idp && stored_app == app_id && stored_identifier == idp_identifier,
                _ => false,
            })
            .and_then(|cred| credential_match(&state, cred)))
    }

    async fn update_usage(
        &self,
        id: CredentialId,
        expected_rev: i64,
        usage: &CredentialUsage,
    ) -> Result<UpdateOutcome> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let Some(cred) = state.credentials.get_mut(&id) else {
            return Err(Error::not_found(format!("credential {id} not found")).into());
        };
        if cred.rev != expected_rev {
            return Ok(UpdateOutcome::Conflict);
        }
        cred.usage = usage.clone();
        cred.rev = expected_rev + 1;
        cred.updated_at = now;
        Ok(UpdateOutcome::Applied)
    }

    async fn rotate_hash(
        &self,
        id: CredentialId,
        material: &[u8],
        algo: &str,
        params: Option<&Value>,
    ) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let Some(cred) = state.credentials.get_mut(&id) else {
            return Err(Error::not_found(format!("credential {id} not found")).into());
        };
        let CredentialKind::Password {
            material: stored,
            algo: stored_algo,
            params: stored_params,
        } = &mut cred.kind
        else {
            return Err(Error::invalid_credential("credential has no hash material").into());
        };
        *stored = material.to_vec();
        *stored_algo = algo.to_string();
        *stored_params = params.cloned();
        cred.rev += 1;
        cred.updated_at = now;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    fn store() -> MemoryAccountStore {
        MemoryAccountStore::new(Arc::new(SystemClock))
    }

    #[tokio::test]
    async fn account_uniqueness() {
        let store = store();
        let uow = store.begin().await.unwrap();
        let first = NewAccount::new(UserId::new(1), AccountType::Operation, "alice");
        uow.accounts().create(first.clone()).await.unwrap();
        let dup = uow.accounts().create(first).await.unwrap_err();
        assert_eq!(
            crate::Error::from(dup).kind(),
            crate::ErrorKind::InvalidArgument
        );

        let wx = NewAccount::new(UserId::new(2), AccountType::WcMinip, "openid-1")
            .with_app_id("wx-app")
            .with_union_id("union-1");
        uow.accounts().create(wx).await.unwrap();
        let other_app = NewAccount::new(UserId::new(3), AccountType::WcMinip, "openid-2")
            .with_app_id("wx-app-2")
            .with_union_id("union-1");
        assert!(uow.accounts().create(other_app).await.is_err());
    }

    #[tokio::test]
    async fn find_by_ref_respects_app_id() {
        let store = store();
        let uow = store.begin().await.unwrap();
        let created = uow
            .accounts()
            .create(
                NewAccount::new(UserId::new(7), AccountType::WcMinip, "openid-1")
                    .with_app_id("wx-app"),
            )
            .await
            .unwrap();
        let found = uow
            .accounts()
            .find_by_ref(AccountType::WcMinip, "openid-1", Some("wx-app"))
            .await
            .unwrap();
        assert_eq!(found.map(|a| a.id), Some(created.id));
        let missing = uow
            .accounts()
            .find_by_ref(AccountType::WcMinip, "openid-1", None)
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn update_usage_is_guarded_by_rev() {
        let store = store();
        let uow = store.begin().await.unwrap();
        let account = uow
            .accounts()
            .create(NewAccount::new(UserId::new(1), AccountType::Operation, "alice"))
            .await
            .unwrap();
        let cred = uow
            .credentials()
            .create(
                account.id,
                CredentialKind::PhoneOtp {
                    phone_e164: "+8613800138000".to_string(),
                },
            )
            .await
            .unwrap();

        let mut usage = cred.usage.clone();
        usage.failed_attempts = 1;
        let applied = uow.credentials().update_usage(cred.id, 0, &usage).await.unwrap();
        assert_eq!(applied, UpdateOutcome::Applied);
        let stale = uow.credentials().update_usage(cred.id, 0, &usage).await.unwrap();
        assert_eq!(stale, UpdateOutcome::Conflict);

        let reloaded = uow.credentials().find_by_id(cred.id).await.unwrap().unwrap();
        assert_eq!(reloaded.rev, 1);
        assert_eq!(reloaded.usage.failed_attempts, 1);
    }

    #[tokio::test]
    async fn phone_lookup_returns_anchor() {
        let store = store();
        let uow = store.begin().await.unwrap();
        let account = uow
            .accounts()
            .create(NewAccount::new(UserId::new(42), AccountType::Operation, "bob"))
            .await
            .unwrap();
        let cred = uow
            .credentials()
            .create(
                account.id,
                CredentialKind::PhoneOtp {
                    phone_e164: "+8613800138000".to_string(),
                },
            )
            .await
            .unwrap();
        let found = uow
            .credentials()
            .find_phone_otp_credential("+8613800138000")
            .await
            .unwrap();
        assert_eq!(
            found,
            Some(CredentialMatch {
                account_id: account.id,
                user_id: UserId::new(42),
                credential_id: cred.id,
            })
        );
        let again = uow
            .credentials()
            .create(
                account.id,
                CredentialKind::PhoneOtp {
                    phone_e164: "+8613800138000".to_string(),
                },
            )
            .await;
        assert!(again.is_err());
    }
}
