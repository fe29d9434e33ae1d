//! Orchestrates one attempt: strategy lookup, usage accounting, rehash, audit.

use super::{
    decision::AuthDecision,
    input::AuthInput,
    strategy::StrategyFactory,
};
use crate::{
    Error, Result,
    account::{LockoutPolicy, UnitOfWork, UnitOfWorkFactory, UpdateOutcome},
    clock::Clock,
    identity::{AuditLogger, AuthAuditEvent, HashedPassword},
    types::CredentialId,
};
use std::{fmt, sync::Arc};
use tracing::{debug, info, instrument, warn};

/// Attempts at an optimistic usage write before giving up.
pub const MAX_FAIL_RETRIES: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Attempt {
    Succeeded,
    Failed,
}

pub struct Authenticator {
    uow: Arc<dyn UnitOfWorkFactory>,
    strategies: StrategyFactory,
    lockout: LockoutPolicy,
    audit: Arc<dyn AuditLogger>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authenticator")
            .field("strategies", &self.strategies)
            .field("lockout", &self.lockout)
            .finish_non_exhaustive()
    }
}

impl Authenticator {
    #[must_use]
    pub fn new(
        uow: Arc<dyn UnitOfWorkFactory>,
        strategies: StrategyFactory,
        lockout: LockoutPolicy,
        audit: Arc<dyn AuditLogger>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            uow,
            strategies,
            lockout,
            audit,
            clock,
        }
    }

    #[must_use]
    pub const fn lockout(&self) -> &LockoutPolicy {
        &self.lockout
    }

    /// Run the strategy selected by the input's scenario.
    ///
    /// Business failures come back as [`AuthDecision::Failure`] so callers can
    /// translate them; usage state is written whether or not the attempt succeeded.
    ///
    /// # Errors
    /// `invalid-argument` for malformed input or an unconfigured scenario, `internal`
    /// when a port fails.
    #[instrument(skip(self, input), fields(scenario = %input.scenario()))]
    pub async fn authenticate(&self, input: &AuthInput) -> Result<AuthDecision> {
        input.credentials.validate()?;
        let scenario = input.scenario();
        let Some(strategy) = self.strategies.create_strategy(scenario) else {
            return Err(Error::invalid_argument(format!(
                "unsupported auth type: {scenario}"
            )));
        };

        let uow = self.uow.begin().await?;
        let decision = match strategy.authenticate(uow.as_ref(), input).await {
            Ok(decision) => decision,
            Err(err) => {
                let err = Error::from(err);
                self.record_audit(input, None, Some(err.kind().as_str().to_string()))
                    .await;
                return Err(err);
            }
        };

        let rehash = match &decision {
            AuthDecision::Success {
                principal,
                credential_id,
                rehash,
            } => {
                if let Some(id) = credential_id {
                    self.record_usage(uow.as_ref(), *id, Attempt::Succeeded)
                        .await;
                }
                info!(
                    account_id = %principal.account_id,
                    user_id = %principal.user_id,
                    "authentication succeeded"
                );
                (*credential_id).zip(rehash.clone())
            }
            AuthDecision::Failure {
                code,
                account_id,
                credential_id,
            } => {
                if let Some(id) = credential_id {
                    self.record_usage(uow.as_ref(), *id, Attempt::Failed).await;
                }
                info!(
                    err_code = %code,
                    account_id = account_id.map(|id| id.get()),
                    "authentication failed"
                );
                None
            }
        };

        if let Err(err) = uow.commit().await {
            warn!(error = %err, "Failed to commit authentication attempt");
        }
        if let Some((credential_id, hashed)) = rehash {
            self.persist_rehash(credential_id, hashed).await;
        }

        self.record_audit(input, Some(&decision), decision.err_code().map(|c| c.to_string()))
            .await;
        Ok(decision)
    }

    /// Write the attempt's outcome to the credential's usage state.
    ///
    /// Storage trouble is logged and swallowed; the attempt's outcome stands.
    async fn record_usage(&self, uow: &dyn UnitOfWork, id: CredentialId, attempt: Attempt) {
        let now = self.clock.now();
        for retry in 0..MAX_FAIL_RETRIES {
            let mut credential = match uow.credentials().find_by_id(id).await {
                Ok(Some(credential)) => credential,
                Ok(None) => return,
                Err(err) => {
                    warn!(credential_id = %id, error = %err, "Failed to load credential usage");
                    return;
                }
            };
            let expected_rev = credential.rev;
            match attempt {
                Attempt::Succeeded => credential.record_success(now),
                Attempt::Failed => {
                    credential.record_failure(now, &self.lockout);
                }
            }
            match uow
                .credentials()
                .update_usage(id, expected_rev, &credential.usage)
                .await
            {
                Ok(UpdateOutcome::Applied) => return,
                Ok(UpdateOutcome::Conflict) => {
                    debug!(credential_id = %id, retry, "credential usage changed concurrently");
                }
                Err(err) => {
                    warn!(credential_id = %id, error = %err, "Failed to write credential usage");
                    return;
                }
            }
        }
        warn!(credential_id = %id, attempt = ?attempt, "Gave up recording credential usage");
    }

    /// Store a stronger hash in its own unit of work; failures are only logged.
    async fn persist_rehash(&self, id: CredentialId, hashed: HashedPassword) {
        let outcome: anyhow::Result<()> = async {
            let uow = self.uow.begin().await?;
            uow.credentials()
                .rotate_hash(id, &hashed.material, &hashed.algo, hashed.params.as_ref())
                .await?;
            uow.commit().await
        }
        .await;
        match outcome {
            Ok(()) => info!(credential_id = %id, algo = %hashed.algo, "password rehashed"),
            Err(err) => warn!(credential_id = %id, error = %err, "Failed to persist rehashed password"),
        }
    }

    async fn record_audit(
        &self,
        input: &AuthInput,
        decision: Option<&AuthDecision>,
        err_code: Option<String>,
    ) {
        let (account_id, user_id, credential_id) = match decision {
            Some(AuthDecision::Success {
                principal,
                credential_id,
                ..
            }) => (
                Some(principal.account_id),
                Some(principal.user_id),
                *credential_id,
            ),
            Some(AuthDecision::Failure {
                account_id,
                credential_id,
                ..
            }) => (*account_id, None, *credential_id),
            None => (None, None, None),
        };
        self.audit
            .record(AuthAuditEvent {
                scenario: input.scenario(),
                account_id,
                user_id,
                credential_id,
                success: decision.is_some_and(AuthDecision::is_success),
                err_code,
                remote_ip: input.remote_ip.clone(),
                user_agent: input.user_agent.clone(),
                at: self.clock.now(),
            })
            .await;
    }
}
