use super::{AuthStrategy, usability, wrong_input};
use crate::{
    account::UnitOfWork,
    authentication::{
        decision::{AuthDecision, AuthErrCode, Principal},
        input::{AuthCredentials, AuthInput},
    },
    clock::Clock,
    identity::hasher::{PasswordHasher, hash_blocking, verify_blocking},
    types::{AccountType, Amr, Scenario},
};
use anyhow::Result;
use async_trait::async_trait;
use std::{fmt, sync::Arc};
use tracing::{debug, warn};

/// Username and password against `operation` accounts.
pub struct PasswordStrategy {
    hasher: Arc<dyn PasswordHasher>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for PasswordStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PasswordStrategy").finish_non_exhaustive()
    }
}

impl PasswordStrategy {
    #[must_use]
    pub fn new(hasher: Arc<dyn PasswordHasher>, clock: Arc<dyn Clock>) -> Self {
        Self { hasher, clock }
    }

    /// Burn one verification so unknown usernames cost the same as wrong passwords.
    async fn reject_unknown(&self, password: &str) -> Result<AuthDecision> {
        let _ = verify_blocking(
            self.hasher.clone(),
            self.hasher.dummy_hash().to_vec(),
            self.hasher.peppered(password),
        )
        .await;
        Ok(AuthDecision::failure(AuthErrCode::InvalidCredential))
    }
}

#[async_trait]
impl AuthStrategy for PasswordStrategy {
    fn kind(&self) -> Scenario {
        Scenario::Password
    }

    async fn authenticate(&self, uow: &dyn UnitOfWork, input: &AuthInput) -> Result<AuthDecision> {
        let AuthCredentials::Password { username, password } = &input.credentials else {
            return Err(wrong_input(self.kind()));
        };
        let now = self.clock.now();

        let Some(account) = uow
            .accounts()
            .find_by_ref(AccountType::Operation, username, None)
            .await?
        else {
            debug!("unknown username");
            return self.reject_unknown(password).await;
        };
        if !account.is_active() {
            debug!(account_id = %account.id, status = %account.status, "account is not active");
            return Ok(AuthDecision::Failure {
                code: AuthErrCode::Disabled,
                account_id: Some(account.id),
                credential_id: None,
            });
        }

        let Some((credential_id, material)) = uow
            .credentials()
            .find_password_credential(account.id)
            .await?
        else {
            debug!(account_id = %account.id, "account has no password credential");
            return self.reject_unknown(password).await;
        };
        let Some(credential) = uow.credentials().find_by_id(credential_id).await? else {
            return self.reject_unknown(password).await;
        };
        if let Some(code) = usability(&credential, now) {
            return Ok(AuthDecision::Failure {
                code,
                account_id: Some(account.id),
                credential_id: None,
            });
        }

        let matched = verify_blocking(
            self.hasher.clone(),
            material.clone(),
            self.hasher.peppered(password),
        )
        .await?;
        if !matched {
            return Ok(AuthDecision::Failure {
                code: AuthErrCode::InvalidCredential,
                account_id: Some(account.id),
                credential_id: Some(credential_id),
            });
        }

        let rehash = if self.hasher.need_rehash(&material) {
            match hash_blocking(self.hasher.clone(), self.hasher.peppered(password)).await {
                Ok(hashed) => Some(hashed),
                Err(err) => {
                    warn!(credential_id = %credential_id, error = %err, "Failed to rehash password");
                    None
                }
            }
        } else {
            None
        };

        let principal = Principal::new(account.user_id, account.id, Amr::Pwd)
            .with_tenant_id(input.tenant_id)
            .with_claim("username", Some(username))
            .with_claim("remote_ip", input.remote_ip.as_deref());
        Ok(AuthDecision::Success {
            principal,
            credential_id: Some(credential_id),
            rehash,
        })
    }
}
