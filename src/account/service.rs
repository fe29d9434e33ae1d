//! Administrative account and credential operations.

use super::{
    credential::{Credential, CredentialKind, is_e164},
    model::{Account, NewAccount},
    repo::{UnitOfWork, UnitOfWorkFactory, UpdateOutcome},
};
use crate::{
    Error, ErrorKind, Result,
    clock::Clock,
    identity::hasher::{PasswordHasher, hash_blocking},
    types::{AccountId, AccountStatus, AccountType, CredentialId, Idp, UserId},
};
use std::sync::Arc;
use tracing::{info, instrument, warn};

const MAX_USAGE_RETRIES: usize = 3;

pub struct AccountService {
    uow: Arc<dyn UnitOfWorkFactory>,
    hasher: Arc<dyn PasswordHasher>,
    clock: Arc<dyn Clock>,
}

impl AccountService {
    #[must_use]
    pub fn new(
        uow: Arc<dyn UnitOfWorkFactory>,
        hasher: Arc<dyn PasswordHasher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { uow, hasher, clock }
    }

    /// Create an `operation` account with a password credential.
    ///
    /// # Errors
    /// `invalid-argument` for blank input or a taken username, `internal` on storage failure.
    #[instrument(skip(self, password))]
    pub async fn register_operation_account(
        &self,
        user_id: UserId,
        username: &str,
        password: &str,
    ) -> Result<(Account, Credential)> {
        if username.trim().is_empty() {
            return Err(Error::invalid_argument("username is required"));
        }
        if password.is_empty() {
            return Err(Error::invalid_argument("password is required"));
        }
        let hashed = hash_blocking(self.hasher.clone(), self.hasher.peppered(password)).await?;

        let uow = self.uow.begin().await?;
        let account = uow
            .accounts()
            .create(NewAccount::new(user_id, AccountType::Operation, username))
            .await?;
        let credential = uow
            .credentials()
            .create(
                account.id,
                CredentialKind::Password {
                    material: hashed.material,
                    algo: hashed.algo,
                    params: hashed.params,
                },
            )
            .await?;
        uow.commit().await?;
        info!(account_id = %account.id, credential_id = %credential.id, "operation account registered");
        Ok((account, credential))
    }

    /// # Errors
    /// `invalid-argument` when the phone is not E.164 or already bound.
    #[instrument(skip(self))]
    pub async fn bind_phone(&self, account_id: AccountId, phone_e164: &str) -> Result<Credential> {
        if !is_e164(phone_e164) {
            return Err(Error::invalid_argument(format!(
                "phone must be in E.164 form: {phone_e164}"
            )));
        }
        self.bind(
            account_id,
            CredentialKind::PhoneOtp {
                phone_e164: phone_e164.to_string(),
            },
        )
        .await
    }

    /// # Errors
    /// `invalid-argument` when the identity is already bound or malformed.
    #[instrument(skip(self))]
    pub async fn bind_oauth(
        &self,
        account_id: AccountId,
        idp: Idp,
        app_id: &str,
        idp_identifier: &str,
    ) -> Result<Credential> {
        self.bind(
            account_id,
            CredentialKind::OAuth {
                idp,
                app_id: app_id.to_string(),
                idp_identifier: idp_identifier.to_string(),
            },
        )
        .await
    }

    async fn bind(&self, account_id: AccountId, kind: CredentialKind) -> Result<Credential> {
        kind.validate()
            .map_err(|err| Error::invalid_argument(err.message()))?;
        let uow = self.uow.begin().await?;
        if uow.accounts().find_by_id(account_id).await?.is_none() {
            return Err(Error::not_found(format!("account {account_id} not found")));
        }
        let credential = uow.credentials().create(account_id, kind).await?;
        uow.commit().await?;
        info!(
            account_id = %account_id,
            credential_id = %credential.id,
            credential_type = %credential.credential_type(),
            "credential bound"
        );
        Ok(credential)
    }

    /// # Errors
    /// `not-found` for an unknown account, `invalid-state-transition` when the move is illegal.
    #[instrument(skip(self))]
    pub async fn change_account_status(
        &self,
        account_id: AccountId,
        status: AccountStatus,
    ) -> Result<Account> {
        let uow = self.uow.begin().await?;
        let mut account = uow
            .accounts()
            .find_by_id(account_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("account {account_id} not found")))?;
        if account.transition_to(status, self.clock.now())? {
            uow.accounts().update_status(account_id, status).await?;
        }
        uow.commit().await?;
        Ok(account)
    }

    /// Clear a lock and the failure counter.
    ///
    /// # Errors
    /// `not-found` for an unknown credential.
    #[instrument(skip(self))]
    pub async fn unlock_credential(&self, credential_id: CredentialId) -> Result<Credential> {
        let now = self.clock.now();
        self.mutate_usage(credential_id, |cred| cred.unlock(now))
            .await
    }

    /// Enable or disable a credential; enabling also clears any lock.
    ///
    /// # Errors
    /// `not-found` for an unknown credential.
    #[instrument(skip(self))]
    pub async fn set_credential_enabled(
        &self,
        credential_id: CredentialId,
        enabled: bool,
    ) -> Result<Credential> {
        let now = self.clock.now();
        self.mutate_usage(credential_id, |cred| {
            if enabled {
                cred.enable(now);
            } else {
                cred.disable(now);
            }
        })
        .await
    }

    /// Replace the password of a usable password credential.
    ///
    /// # Errors
    /// `invalid-credential` for non-password credentials, `credential-locked` or
    /// `credential-disabled` when the credential is not usable.
    #[instrument(skip(self, new_password))]
    pub async fn change_password(
        &self,
        credential_id: CredentialId,
        new_password: &str,
    ) -> Result<()> {
        if new_password.is_empty() {
            return Err(Error::invalid_argument("password is required"));
        }
        let hashed =
            hash_blocking(self.hasher.clone(), self.hasher.peppered(new_password)).await?;
        let uow = self.uow.begin().await?;
        let mut credential = find_credential(uow.as_ref(), credential_id).await?;
        credential.rotate_material(
            self.clock.now(),
            hashed.material.clone(),
            Some(hashed.algo.clone()),
            hashed.params.clone(),
        )?;
        uow.credentials()
            .rotate_hash(
                credential_id,
                &hashed.material,
                &hashed.algo,
                hashed.params.as_ref(),
            )
            .await?;
        uow.commit().await?;
        info!(credential_id = %credential_id, "password changed");
        Ok(())
    }

    async fn mutate_usage<F>(&self, credential_id: CredentialId, mutate: F) -> Result<Credential>
    where
        F: Fn(&mut Credential) + Send + Sync,
    {
        let uow = self.uow.begin().await?;
        for _ in 0..MAX_USAGE_RETRIES {
            let mut credential = find_credential(uow.as_ref(), credential_id).await?;
            let expected_rev = credential.rev;
            mutate(&mut credential);
            match uow
                .credentials()
                .update_usage(credential_id, expected_rev, &credential.usage)
                .await?
            {
                UpdateOutcome::Applied => {
                    uow.commit().await?;
                    return Ok(credential);
                }
                UpdateOutcome::Conflict => {
                    warn!(credential_id = %credential_id, "credential changed concurrently, retrying");
                }
            }
        }
        Err(Error::new(
            ErrorKind::Internal,
            "credential kept changing concurrently",
        ))
    }
}

async fn find_credential(uow: &dyn UnitOfWork, credential_id: CredentialId) -> Result<Credential> {
    uow.credentials()
        .find_by_id(credential_id)
        .await?
        .ok_or_else(|| Error::not_found(format!("credential {credential_id} not found")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{
        account::memory::MemoryAccountStore,
        clock::ManualClock,
        identity::hasher::{Argon2Hasher, Argon2Params},
        types::CredentialStatus,
    };
    use chrono::{Duration, Utc};
    use secrecy::SecretString;

    fn service() -> (AccountService, Arc<MemoryAccountStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(MemoryAccountStore::new(clock.clone()));
        let hasher = Arc::new(
            Argon2Hasher::new(
                Argon2Params::new().with_m_cost(64).with_t_cost(1).with_p_cost(1),
                SecretString::from("pepper"),
            )
            .unwrap(),
        );
        (
            AccountService::new(store.clone(), hasher, clock.clone()),
            store,
            clock,
        )
    }

    #[tokio::test]
    async fn register_then_duplicate() {
        let (service, _, _) = service();
        let (account, credential) = service
            .register_operation_account(UserId::new(100), "alice", "P@ssw0rd")
            .await
            .unwrap();
        assert_eq!(account.account_type, AccountType::Operation);
        assert_eq!(credential.account_id, account.id);
        let dup = service
            .register_operation_account(UserId::new(101), "alice", "other")
            .await
            .unwrap_err();
        assert_eq!(dup.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn bind_phone_validates_format() {
        let (service, _, _) = service();
        let (account, _) = service
            .register_operation_account(UserId::new(1), "bob", "pw")
            .await
            .unwrap();
        let err = service.bind_phone(account.id, "13800138000").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let cred = service.bind_phone(account.id, "+8613800138000").await.unwrap();
        assert_eq!(
            cred.kind,
            CredentialKind::PhoneOtp {
                phone_e164: "+8613800138000".to_string()
            }
        );
        let err = service
            .bind_phone(AccountId::new(999), "+8613800138001")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn status_changes_follow_the_machine() {
        let (service, _, _) = service();
        let (account, _) = service
            .register_operation_account(UserId::new(1), "carol", "pw")
            .await
            .unwrap();
        let deleted = service
            .change_account_status(account.id, AccountStatus::Deleted)
            .await
            .unwrap();
        assert_eq!(deleted.status, AccountStatus::Deleted);
        let err = service
            .change_account_status(account.id, AccountStatus::Active)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidStateTransition);
    }

    #[tokio::test]
    async fn unlock_and_disable() {
        let (service, store, clock) = service();
        let (_, credential) = service
            .register_operation_account(UserId::new(1), "dave", "pw")
            .await
            .unwrap();

        let uow = store.begin().await.unwrap();
        let mut locked = uow.credentials().find_by_id(credential.id).await.unwrap().unwrap();
        let rev = locked.rev;
        locked.usage.failed_attempts = 5;
        locked.usage.locked_until = Some(clock.now() + Duration::minutes(30));
        uow.credentials()
            .update_usage(credential.id, rev, &locked.usage)
            .await
            .unwrap();

        let unlocked = service.unlock_credential(credential.id).await.unwrap();
        assert!(unlocked.usage.locked_until.is_none());
        assert_eq!(unlocked.usage.failed_attempts, 0);

        let disabled = service
            .set_credential_enabled(credential.id, false)
            .await
            .unwrap();
        assert_eq!(disabled.usage.status, CredentialStatus::Disabled);

        let err = service.change_password(credential.id, "new").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CredentialDisabled);
    }
}
