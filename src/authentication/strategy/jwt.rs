use super::{AuthStrategy, wrong_input};
use crate::{
    account::UnitOfWork,
    authentication::{
        decision::{AuthDecision, AuthErrCode, Principal},
        input::{AuthCredentials, AuthInput},
    },
    identity::BearerTokenVerifier,
    types::{Amr, Scenario},
};
use anyhow::Result;
use async_trait::async_trait;
use std::{fmt, sync::Arc};
use tracing::debug;

/// Accepts a bearer token minted earlier by a trusted issuer.
pub struct JwtTokenStrategy {
    verifier: Arc<dyn BearerTokenVerifier>,
}

impl fmt::Debug for JwtTokenStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtTokenStrategy").finish_non_exhaustive()
    }
}

impl JwtTokenStrategy {
    #[must_use]
    pub fn new(verifier: Arc<dyn BearerTokenVerifier>) -> Self {
        Self { verifier }
    }
}

#[async_trait]
impl AuthStrategy for JwtTokenStrategy {
    fn kind(&self) -> Scenario {
        Scenario::JwtToken
    }

    async fn authenticate(&self, _uow: &dyn UnitOfWork, input: &AuthInput) -> Result<AuthDecision> {
        let AuthCredentials::JwtToken { access_token } = &input.credentials else {
            return Err(wrong_input(self.kind()));
        };
        match self.verifier.verify(access_token).await {
            Ok(identity) => {
                let mut principal =
                    Principal::new(identity.user_id, identity.account_id, Amr::Jwt)
                        .with_tenant_id(identity.tenant_id.or(input.tenant_id));
                for (name, value) in identity.claims {
                    principal.claims.entry(name).or_insert(value);
                }
                Ok(AuthDecision::Success {
                    principal,
                    credential_id: None,
                    rehash: None,
                })
            }
            Err(err) => match AuthErrCode::from_kind(err.kind()) {
                Some(code @ (AuthErrCode::TokenInvalid | AuthErrCode::Expired)) => {
                    debug!(error = %err, "bearer token rejected");
                    Ok(AuthDecision::failure(code))
                }
                _ => Err(err.into()),
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{
        Error, ErrorKind,
        account::{MemoryAccountStore, UnitOfWorkFactory},
        clock::SystemClock,
        identity::BearerIdentity,
        types::{AccountId, TenantId, UserId},
    };
    use serde_json::{Map, Value};

    struct Fixed(crate::Result<BearerIdentity>);

    #[async_trait]
    impl BearerTokenVerifier for Fixed {
        async fn verify(&self, _token: &str) -> crate::Result<BearerIdentity> {
            self.0.clone()
        }
    }

    fn input() -> AuthInput {
        AuthInput::new(AuthCredentials::JwtToken {
            access_token: "token".to_string(),
        })
        .with_tenant_id(Some(TenantId::new(9)))
    }

    async fn run(verdict: crate::Result<BearerIdentity>) -> Result<AuthDecision> {
        let store = MemoryAccountStore::new(Arc::new(SystemClock));
        let uow = store.begin().await.unwrap();
        JwtTokenStrategy::new(Arc::new(Fixed(verdict)))
            .authenticate(uow.as_ref(), &input())
            .await
    }

    #[tokio::test]
    async fn verified_identity_becomes_principal() {
        let mut claims = Map::new();
        claims.insert("auth_method".to_string(), Value::from("pwd"));
        claims.insert("sid".to_string(), Value::from("device-1"));
        let decision = run(Ok(BearerIdentity {
            user_id: UserId::new(1),
            account_id: AccountId::new(2),
            tenant_id: None,
            claims,
        }))
        .await
        .unwrap();

        let AuthDecision::Success { principal, .. } = decision else {
            panic!("expected success");
        };
        assert_eq!(principal.amr, Amr::Jwt);
        assert_eq!(principal.claims["auth_method"], "jwt");
        assert_eq!(principal.claims["sid"], "device-1");
        assert_eq!(principal.tenant_id, Some(TenantId::new(9)));
    }

    #[tokio::test]
    async fn token_failures_are_business_failures() {
        let decision = run(Err(Error::expired("token expired"))).await.unwrap();
        assert_eq!(decision.err_code(), Some(AuthErrCode::Expired));

        let err = run(Err(Error::internal("boom"))).await.unwrap_err();
        assert_eq!(Error::from(err).kind(), ErrorKind::Internal);
    }
}
