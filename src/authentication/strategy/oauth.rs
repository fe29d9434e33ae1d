use super::{AuthStrategy, check_match, wrong_input};
use crate::{
    account::{CredentialMatch, UnitOfWork},
    authentication::{
        decision::{AuthDecision, AuthErrCode, Principal},
        input::{AuthCredentials, AuthInput},
    },
    clock::Clock,
    identity::idp::IdentityProvider,
    types::{Amr, Idp, Scenario},
};
use anyhow::Result;
use async_trait::async_trait;
use std::{fmt, future::Future, sync::Arc, time::Duration};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

pub const DEFAULT_IDP_TIMEOUT: Duration = Duration::from_secs(5);

fn state_mismatch(state: Option<&str>, expected: Option<&str>) -> bool {
    match (state, expected) {
        (Some(state), Some(expected)) => !bool::from(state.as_bytes().ct_eq(expected.as_bytes())),
        _ => false,
    }
}

/// Bound an IdP call by the soft deadline; failures and timeouts come back as `None`.
async fn exchange<T>(
    scenario: Scenario,
    deadline: Duration,
    call: impl Future<Output = Result<T>>,
) -> Option<T> {
    match tokio::time::timeout(deadline, call).await {
        Ok(Ok(identity)) => Some(identity),
        Ok(Err(err)) => {
            warn!(scenario = %scenario, error = %err, "identity provider exchange failed");
            None
        }
        Err(_) => {
            warn!(scenario = %scenario, timeout_ms = deadline.as_millis(), "identity provider exchange timed out");
            None
        }
    }
}

/// Try each identifier in order and return the first bound credential.
async fn find_binding(
    uow: &dyn UnitOfWork,
    idp: Idp,
    app_id: &str,
    identifiers: [Option<&str>; 2],
) -> Result<Option<CredentialMatch>> {
    for identifier in identifiers.into_iter().flatten() {
        if let Some(matched) = uow
            .credentials()
            .find_oauth_credential(idp, app_id, identifier)
            .await?
        {
            return Ok(Some(matched));
        }
    }
    Ok(None)
}

async fn conclude(
    uow: &dyn UnitOfWork,
    clock: &dyn Clock,
    matched: Option<CredentialMatch>,
    principal: impl FnOnce(CredentialMatch) -> Principal,
) -> Result<AuthDecision> {
    let Some(matched) = matched else {
        debug!("identity is not bound to any account");
        return Ok(AuthDecision::failure(AuthErrCode::NoBinding));
    };
    if let Some(code) = check_match(uow, &matched, clock.now()).await? {
        return Ok(AuthDecision::Failure {
            code,
            account_id: Some(matched.account_id),
            credential_id: None,
        });
    }
    Ok(AuthDecision::Success {
        principal: principal(matched),
        credential_id: Some(matched.credential_id),
        rehash: None,
    })
}

/// WeChat mini-program `code2Session` login.
pub struct WxMinipStrategy {
    idp: Arc<dyn IdentityProvider>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl fmt::Debug for WxMinipStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WxMinipStrategy")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl WxMinipStrategy {
    #[must_use]
    pub fn new(idp: Arc<dyn IdentityProvider>, clock: Arc<dyn Clock>) -> Self {
        Self {
            idp,
            clock,
            timeout: DEFAULT_IDP_TIMEOUT,
        }
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl AuthStrategy for WxMinipStrategy {
    fn kind(&self) -> Scenario {
        Scenario::WxMinip
    }

    async fn authenticate(&self, uow: &dyn UnitOfWork, input: &AuthInput) -> Result<AuthDecision> {
        let AuthCredentials::WxMinip {
            app_id,
            js_code,
            state,
            expected_state,
        } = &input.credentials
        else {
            return Err(wrong_input(self.kind()));
        };
        if state_mismatch(state.as_deref(), expected_state.as_deref()) {
            return Ok(AuthDecision::failure(AuthErrCode::StateMismatch));
        }

        let Some(identity) = exchange(
            self.kind(),
            self.timeout,
            self.idp.exchange_wx_minip_code(app_id, js_code),
        )
        .await
        else {
            return Ok(AuthDecision::failure(AuthErrCode::IdpExchangeFailed));
        };

        // unionId is stable across the provider's apps, so it wins over openId.
        let matched = find_binding(
            uow,
            Idp::WxMinip,
            app_id,
            [identity.union_id.as_deref(), Some(identity.open_id.as_str())],
        )
        .await?;
        conclude(uow, self.clock.as_ref(), matched, |matched| {
            Principal::new(matched.user_id, matched.account_id, Amr::Wechat)
                .with_tenant_id(input.tenant_id)
                .with_claim("openid", Some(&identity.open_id))
                .with_claim("unionid", identity.union_id.as_deref())
                .with_claim("app_id", Some(app_id))
        })
        .await
    }
}

/// WeCom OAuth login.
pub struct WecomStrategy {
    idp: Arc<dyn IdentityProvider>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl fmt::Debug for WecomStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WecomStrategy")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl WecomStrategy {
    #[must_use]
    pub fn new(idp: Arc<dyn IdentityProvider>, clock: Arc<dyn Clock>) -> Self {
        Self {
            idp,
            clock,
            timeout: DEFAULT_IDP_TIMEOUT,
        }
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl AuthStrategy for WecomStrategy {
    fn kind(&self) -> Scenario {
        Scenario::Wecom
    }

    async fn authenticate(&self, uow: &dyn UnitOfWork, input: &AuthInput) -> Result<AuthDecision> {
        let AuthCredentials::Wecom {
            corp_id,
            code,
            state,
            expected_state,
        } = &input.credentials
        else {
            return Err(wrong_input(self.kind()));
        };
        if state_mismatch(state.as_deref(), expected_state.as_deref()) {
            return Ok(AuthDecision::failure(AuthErrCode::StateMismatch));
        }

        let Some(identity) = exchange(
            self.kind(),
            self.timeout,
            self.idp.exchange_wecom_code(corp_id, code),
        )
        .await
        else {
            return Ok(AuthDecision::failure(AuthErrCode::IdpExchangeFailed));
        };
        if identity.user_id.is_none() && identity.open_user_id.is_none() {
            warn!(corp_id = %corp_id, "identity provider returned no user identifier");
            return Ok(AuthDecision::failure(AuthErrCode::IdpExchangeFailed));
        }

        // Corp members resolve by userId; outside users only have openUserId.
        let matched = find_binding(
            uow,
            Idp::Wecom,
            corp_id,
            [identity.user_id.as_deref(), identity.open_user_id.as_deref()],
        )
        .await?;
        conclude(uow, self.clock.as_ref(), matched, |matched| {
            Principal::new(matched.user_id, matched.account_id, Amr::Wecom)
                .with_tenant_id(input.tenant_id)
                .with_claim("wecom_userid", identity.user_id.as_deref())
                .with_claim("open_userid", identity.open_user_id.as_deref())
                .with_claim("corp_id", Some(corp_id))
        })
        .await
    }
}
