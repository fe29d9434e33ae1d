//! Error kinds shared by every layer.
//!
//! Ports and adapters report failures as `anyhow::Error`. Anything that must
//! reach a caller with a specific meaning is an [`Error`] carrying an
//! [`ErrorKind`]; when one travels through `anyhow` it is recovered with a
//! downcast at the use-case boundary, everything else becomes `internal`.

use axum::http::StatusCode;
use std::fmt;
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    InvalidCredential,
    PasswordIncorrect,
    OtpInvalid,
    NoBinding,
    CredentialLocked,
    CredentialDisabled,
    IdpExchangeFailed,
    StateMismatch,
    AuthenticationFailed,
    TokenInvalid,
    Expired,
    InvalidStateTransition,
    NotFound,
    NoActiveKey,
    Unauthenticated,
    DeadlineExceeded,
    Internal,
}

impl ErrorKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidArgument => "invalid-argument",
            Self::InvalidCredential => "invalid-credential",
            Self::PasswordIncorrect => "password-incorrect",
            Self::OtpInvalid => "otp-invalid",
            Self::NoBinding => "no-binding",
            Self::CredentialLocked => "credential-locked",
            Self::CredentialDisabled => "credential-disabled",
            Self::IdpExchangeFailed => "idp-exchange-failed",
            Self::StateMismatch => "state-mismatch",
            Self::AuthenticationFailed => "authentication-failed",
            Self::TokenInvalid => "token-invalid",
            Self::Expired => "expired",
            Self::InvalidStateTransition => "invalid-state-transition",
            Self::NotFound => "not-found",
            Self::NoActiveKey => "no-active-key",
            Self::Unauthenticated => "unauthenticated",
            Self::DeadlineExceeded => "deadline-exceeded",
            Self::Internal => "internal",
        }
    }

    #[must_use]
    pub const fn http_status(self) -> StatusCode {
        match self {
            Self::InvalidArgument | Self::InvalidCredential | Self::InvalidStateTransition => {
                StatusCode::BAD_REQUEST
            }
            Self::PasswordIncorrect
            | Self::OtpInvalid
            | Self::NoBinding
            | Self::StateMismatch
            | Self::AuthenticationFailed
            | Self::TokenInvalid
            | Self::Expired
            | Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::CredentialLocked => StatusCode::LOCKED,
            Self::CredentialDisabled => StatusCode::FORBIDDEN,
            Self::IdpExchangeFailed => StatusCode::BAD_GATEWAY,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::NoActiveKey => StatusCode::SERVICE_UNAVAILABLE,
            Self::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable numeric code for the `{code, message}` envelope.
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::NotFound => 100_006,
            Self::InvalidArgument => 100_007,
            Self::Internal => 100_209,
            Self::DeadlineExceeded => 100_210,
            Self::InvalidStateTransition => 100_310,
            Self::NoActiveKey => 100_316,
            Self::Unauthenticated => 100_501,
            Self::PasswordIncorrect => 102_001,
            Self::OtpInvalid => 102_002,
            Self::NoBinding => 102_003,
            Self::CredentialLocked => 102_004,
            Self::CredentialDisabled => 102_005,
            Self::IdpExchangeFailed => 102_006,
            Self::StateMismatch => 102_007,
            Self::AuthenticationFailed => 102_008,
            Self::InvalidCredential => 102_009,
            Self::TokenInvalid => 102_101,
            Self::Expired => 102_102,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    pub fn invalid_credential(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidCredential, message)
    }

    pub fn invalid_transition(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidStateTransition, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn token_invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TokenInvalid, message)
    }

    pub fn expired(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Expired, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast_ref::<Self>() {
            Some(known) => known.clone(),
            None => {
                error!(error = ?err, "unexpected failure");
                Self::internal("internal error")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn kind_maps_to_status() {
        assert_eq!(
            ErrorKind::CredentialLocked.http_status(),
            StatusCode::LOCKED
        );
        assert_eq!(
            ErrorKind::IdpExchangeFailed.http_status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ErrorKind::CredentialDisabled.http_status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(ErrorKind::Expired.http_status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn known_error_survives_anyhow() {
        let wrapped: anyhow::Error = Error::token_invalid("unknown kid").into();
        let wrapped = Err::<(), _>(wrapped).context("verifying").unwrap_err();
        let err = Error::from(wrapped);
        assert_eq!(err.kind(), ErrorKind::TokenInvalid);
    }

    #[test]
    fn unknown_error_becomes_internal() {
        let err = Error::from(anyhow::anyhow!("connection reset"));
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert_eq!(err.message(), "internal error");
    }

    #[test]
    fn display_includes_kind() {
        let err = Error::invalid_argument("username is required");
        assert_eq!(err.to_string(), "invalid-argument: username is required");
    }
}
