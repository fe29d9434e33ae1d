//! Strategy outcomes: the authenticated principal or a business failure code.

use crate::{
    Error, ErrorKind,
    identity::HashedPassword,
    token::Subject,
    types::{AccountId, Amr, CredentialId, TenantId, UserId, str_enum},
};
use serde_json::{Map, Value};

str_enum! {
    /// Business failure reported by a strategy; system failures travel as errors instead.
    pub enum AuthErrCode {
        InvalidCredential => "invalid-credential",
        OtpInvalidOrExpired => "otp-invalid-or-expired",
        NoBinding => "no-binding",
        Locked => "locked",
        Disabled => "disabled",
        IdpExchangeFailed => "idp-exchange-failed",
        StateMismatch => "state-mismatch",
        TokenInvalid => "token-invalid",
        Expired => "expired",
    }
}

impl AuthErrCode {
    /// Public error kind for this failure.
    #[must_use]
    pub const fn error_kind(self) -> ErrorKind {
        match self {
            Self::InvalidCredential => ErrorKind::PasswordIncorrect,
            Self::OtpInvalidOrExpired => ErrorKind::OtpInvalid,
            Self::NoBinding => ErrorKind::NoBinding,
            Self::Locked => ErrorKind::CredentialLocked,
            Self::Disabled => ErrorKind::CredentialDisabled,
            Self::IdpExchangeFailed => ErrorKind::IdpExchangeFailed,
            Self::StateMismatch => ErrorKind::StateMismatch,
            Self::TokenInvalid | Self::Expired => ErrorKind::AuthenticationFailed,
        }
    }

    /// Business code for an error raised by a credential check or a bearer
    /// verification; `None` means the error is a system failure.
    #[must_use]
    pub const fn from_kind(kind: ErrorKind) -> Option<Self> {
        match kind {
            ErrorKind::CredentialLocked => Some(Self::Locked),
            ErrorKind::CredentialDisabled => Some(Self::Disabled),
            ErrorKind::TokenInvalid => Some(Self::TokenInvalid),
            ErrorKind::Expired => Some(Self::Expired),
            _ => None,
        }
    }

    #[must_use]
    pub fn into_error(self) -> Error {
        let message = match self {
            Self::InvalidCredential => "invalid username or password",
            Self::OtpInvalidOrExpired => "otp is invalid or expired",
            Self::NoBinding => "no account is bound to this identity",
            Self::Locked => "credential is locked",
            Self::Disabled => "credential is disabled",
            Self::IdpExchangeFailed => "identity provider rejected the code",
            Self::StateMismatch => "state does not match",
            Self::TokenInvalid | Self::Expired => "authentication failed",
        };
        Error::new(self.error_kind(), message)
    }
}

/// The authenticated subject handed to token issuance.
#[derive(Clone, Debug, PartialEq)]
pub struct Principal {
    pub user_id: UserId,
    pub account_id: AccountId,
    pub tenant_id: Option<TenantId>,
    pub amr: Amr,
    /// Auxiliary facts such as `auth_method`, `remote_ip`, or `openid`.
    pub claims: Map<String, Value>,
}

impl Principal {
    #[must_use]
    pub fn new(user_id: UserId, account_id: AccountId, amr: Amr) -> Self {
        let mut claims = Map::new();
        claims.insert("auth_method".to_string(), Value::from(amr.as_str()));
        Self {
            user_id,
            account_id,
            tenant_id: None,
            amr,
            claims,
        }
    }

    #[must_use]
    pub const fn with_tenant_id(mut self, tenant_id: Option<TenantId>) -> Self {
        self.tenant_id = tenant_id;
        self
    }

    /// Attach an auxiliary claim; `None` values are skipped.
    #[must_use]
    pub fn with_claim(mut self, name: &str, value: Option<&str>) -> Self {
        if let Some(value) = value {
            self.claims.insert(name.to_string(), Value::from(value));
        }
        self
    }

    #[must_use]
    pub fn subject(&self, audience: Option<String>, session_id: Option<String>) -> Subject {
        Subject::new(self.user_id, self.account_id)
            .with_tenant_id(self.tenant_id)
            .with_amr(self.amr)
            .with_audience(audience)
            .with_session_id(session_id)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum AuthDecision {
    Success {
        principal: Principal,
        /// Credential whose usage state records the success.
        credential_id: Option<CredentialId>,
        /// Fresh hash to persist once the attempt has been committed.
        rehash: Option<HashedPassword>,
    },
    Failure {
        code: AuthErrCode,
        account_id: Option<AccountId>,
        /// Set when the failure counts against this credential's lockout counter.
        credential_id: Option<CredentialId>,
    },
}

impl AuthDecision {
    #[must_use]
    pub const fn failure(code: AuthErrCode) -> Self {
        Self::Failure {
            code,
            account_id: None,
            credential_id: None,
        }
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    #[must_use]
    pub const fn err_code(&self) -> Option<AuthErrCode> {
        match self {
            Self::Success { .. } => None,
            Self::Failure { code, .. } => Some(*code),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_translate_to_public_kinds() {
        assert_eq!(
            AuthErrCode::InvalidCredential.error_kind(),
            ErrorKind::PasswordIncorrect
        );
        assert_eq!(AuthErrCode::OtpInvalidOrExpired.error_kind(), ErrorKind::OtpInvalid);
        assert_eq!(AuthErrCode::Locked.error_kind(), ErrorKind::CredentialLocked);
        assert_eq!(
            AuthErrCode::TokenInvalid.error_kind(),
            ErrorKind::AuthenticationFailed
        );
        assert_eq!(
            AuthErrCode::StateMismatch.into_error().kind(),
            ErrorKind::StateMismatch
        );
    }

    #[test]
    fn usability_errors_become_codes() {
        assert_eq!(
            AuthErrCode::from_kind(ErrorKind::CredentialLocked),
            Some(AuthErrCode::Locked)
        );
        assert_eq!(AuthErrCode::from_kind(ErrorKind::Internal), None);
    }

    #[test]
    fn principal_carries_auth_method() {
        let principal = Principal::new(UserId::new(1), AccountId::new(2), Amr::Otp)
            .with_claim("remote_ip", Some("10.0.0.1"))
            .with_claim("openid", None);
        assert_eq!(principal.claims["auth_method"], "otp");
        assert_eq!(principal.claims["remote_ip"], "10.0.0.1");
        assert!(!principal.claims.contains_key("openid"));
        let subject = principal.subject(Some("web".to_string()), None);
        assert_eq!(subject.amr, Some(Amr::Otp));
        assert_eq!(subject.audience.as_deref(), Some("web"));
    }
}
