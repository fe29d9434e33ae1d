//! Authentication strategies and the scenario-keyed factory.

mod jwt;
mod oauth;
mod password;
mod phone;

pub use jwt::JwtTokenStrategy;
pub use oauth::{WecomStrategy, WxMinipStrategy};
pub use password::PasswordStrategy;
pub use phone::PhoneOtpStrategy;

use super::{
    decision::{AuthDecision, AuthErrCode},
    input::AuthInput,
};
use crate::{
    Error,
    account::{Credential, CredentialMatch, UnitOfWork},
    types::Scenario,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{collections::HashMap, fmt, sync::Arc};
use tracing::debug;

/// Business failures come back as [`AuthDecision::Failure`]; `Err` means a system failure.
#[async_trait]
pub trait AuthStrategy: Send + Sync {
    fn kind(&self) -> Scenario;

    async fn authenticate(&self, uow: &dyn UnitOfWork, input: &AuthInput) -> Result<AuthDecision>;
}

/// Strategies configured for this deployment.
#[derive(Clone, Default)]
pub struct StrategyFactory {
    strategies: HashMap<Scenario, Arc<dyn AuthStrategy>>,
}

impl fmt::Debug for StrategyFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut scenarios: Vec<_> = self.strategies.keys().collect();
        scenarios.sort();
        f.debug_struct("StrategyFactory")
            .field("scenarios", &scenarios)
            .finish()
    }
}

impl StrategyFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `strategy` under its own scenario, replacing any previous one.
    #[must_use]
    pub fn with(mut self, strategy: Arc<dyn AuthStrategy>) -> Self {
        self.strategies.insert(strategy.kind(), strategy);
        self
    }

    /// `None` when the scenario is not configured.
    #[must_use]
    pub fn create_strategy(&self, scenario: Scenario) -> Option<Arc<dyn AuthStrategy>> {
        self.strategies.get(&scenario).cloned()
    }
}

pub(crate) fn wrong_input(scenario: Scenario) -> anyhow::Error {
    Error::invalid_argument(format!("credentials do not match scenario {scenario}")).into()
}

/// Check the account and credential behind a phone or OAuth match.
///
/// Returns the failure code when either is unusable.
pub(crate) async fn check_match(
    uow: &dyn UnitOfWork,
    matched: &CredentialMatch,
    now: DateTime<Utc>,
) -> Result<Option<AuthErrCode>> {
    let account = uow.accounts().find_by_id(matched.account_id).await?;
    if !account.is_some_and(|account| account.is_active()) {
        debug!(account_id = %matched.account_id, "account is not active");
        return Ok(Some(AuthErrCode::Disabled));
    }
    let Some(credential) = uow.credentials().find_by_id(matched.credential_id).await? else {
        return Ok(Some(AuthErrCode::NoBinding));
    };
    Ok(usability(&credential, now))
}

/// Failure code for a disabled or locked credential.
pub(crate) fn usability(credential: &Credential, now: DateTime<Utc>) -> Option<AuthErrCode> {
    credential
        .ensure_usable(now)
        .err()
        .and_then(|err| AuthErrCode::from_kind(err.kind()))
}
