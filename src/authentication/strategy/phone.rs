use super::{AuthStrategy, check_match, wrong_input};
use crate::{
    account::UnitOfWork,
    authentication::{
        decision::{AuthDecision, AuthErrCode, Principal},
        input::{AuthCredentials, AuthInput},
    },
    clock::Clock,
    identity::otp::{LOGIN_SCENE, OtpVerifier},
    types::{Amr, Scenario},
};
use anyhow::Result;
use async_trait::async_trait;
use std::{fmt, sync::Arc};
use tracing::debug;

/// One-time code delivered to a bound phone number.
pub struct PhoneOtpStrategy {
    otp: Arc<dyn OtpVerifier>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for PhoneOtpStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhoneOtpStrategy").finish_non_exhaustive()
    }
}

impl PhoneOtpStrategy {
    #[must_use]
    pub fn new(otp: Arc<dyn OtpVerifier>, clock: Arc<dyn Clock>) -> Self {
        Self { otp, clock }
    }
}

#[async_trait]
impl AuthStrategy for PhoneOtpStrategy {
    fn kind(&self) -> Scenario {
        Scenario::PhoneOtp
    }

    async fn authenticate(&self, uow: &dyn UnitOfWork, input: &AuthInput) -> Result<AuthDecision> {
        let AuthCredentials::PhoneOtp {
            phone_e164,
            otp_code,
        } = &input.credentials
        else {
            return Err(wrong_input(self.kind()));
        };

        // The code is consumed before the binding is looked up.
        if !self
            .otp
            .verify_and_consume(phone_e164, LOGIN_SCENE, otp_code)
            .await?
        {
            return Ok(AuthDecision::failure(AuthErrCode::OtpInvalidOrExpired));
        }

        let Some(matched) = uow.credentials().find_phone_otp_credential(phone_e164).await? else {
            debug!("phone is not bound to any account");
            return Ok(AuthDecision::failure(AuthErrCode::NoBinding));
        };
        if let Some(code) = check_match(uow, &matched, self.clock.now()).await? {
            return Ok(AuthDecision::Failure {
                code,
                account_id: Some(matched.account_id),
                credential_id: None,
            });
        }

        let principal = Principal::new(matched.user_id, matched.account_id, Amr::Otp)
            .with_tenant_id(input.tenant_id)
            .with_claim("phone", Some(phone_e164))
            .with_claim("remote_ip", input.remote_ip.as_deref());
        Ok(AuthDecision::Success {
            principal,
            credential_id: Some(matched.credential_id),
            rehash: None,
        })
    }
}
