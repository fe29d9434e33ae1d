//! Typed credential submissions handed to the strategy engine.

use crate::{
    Error, Result,
    account::is_e164,
    types::{Scenario, TenantId},
};
use std::fmt;

/// Exactly one credential shape per scenario.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthCredentials {
    Password {
        username: String,
        password: String,
    },
    PhoneOtp {
        phone_e164: String,
        otp_code: String,
    },
    WxMinip {
        app_id: String,
        js_code: String,
        state: Option<String>,
        expected_state: Option<String>,
    },
    Wecom {
        corp_id: String,
        code: String,
        state: Option<String>,
        expected_state: Option<String>,
    },
    JwtToken {
        access_token: String,
    },
}

impl fmt::Debug for AuthCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password { username, .. } => f
                .debug_struct("Password")
                .field("username", username)
                .finish_non_exhaustive(),
            Self::PhoneOtp { phone_e164, .. } => f
                .debug_struct("PhoneOtp")
                .field("phone_e164", phone_e164)
                .finish_non_exhaustive(),
            Self::WxMinip { app_id, .. } => f
                .debug_struct("WxMinip")
                .field("app_id", app_id)
                .finish_non_exhaustive(),
            Self::Wecom { corp_id, .. } => f
                .debug_struct("Wecom")
                .field("corp_id", corp_id)
                .finish_non_exhaustive(),
            Self::JwtToken { .. } => f.debug_struct("JwtToken").finish_non_exhaustive(),
        }
    }
}

fn required(value: &str, name: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::invalid_argument(format!("{name} is required")));
    }
    Ok(())
}

impl AuthCredentials {
    #[must_use]
    pub const fn scenario(&self) -> Scenario {
        match self {
            Self::Password { .. } => Scenario::Password,
            Self::PhoneOtp { .. } => Scenario::PhoneOtp,
            Self::WxMinip { .. } => Scenario::WxMinip,
            Self::Wecom { .. } => Scenario::Wecom,
            Self::JwtToken { .. } => Scenario::JwtToken,
        }
    }

    /// # Errors
    /// `invalid-argument` naming the first missing or malformed field.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Password { username, password } => {
                required(username, "username")?;
                if password.is_empty() {
                    return Err(Error::invalid_argument("password is required"));
                }
            }
            Self::PhoneOtp {
                phone_e164,
                otp_code,
            } => {
                required(phone_e164, "phone")?;
                if !is_e164(phone_e164) {
                    return Err(Error::invalid_argument("phone must be in E.164 form"));
                }
                required(otp_code, "otpCode")?;
            }
            Self::WxMinip {
                app_id, js_code, ..
            } => {
                required(app_id, "appId")?;
                required(js_code, "jsCode")?;
            }
            Self::Wecom { corp_id, code, .. } => {
                required(corp_id, "corpId")?;
                required(code, "authCode")?;
            }
            Self::JwtToken { access_token } => required(access_token, "accessToken")?,
        }
        Ok(())
    }
}

/// One authentication attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthInput {
    pub credentials: AuthCredentials,
    pub tenant_id: Option<TenantId>,
    pub remote_ip: Option<String>,
    pub user_agent: Option<String>,
}

impl AuthInput {
    #[must_use]
    pub const fn new(credentials: AuthCredentials) -> Self {
        Self {
            credentials,
            tenant_id: None,
            remote_ip: None,
            user_agent: None,
        }
    }

    #[must_use]
    pub const fn with_tenant_id(mut self, tenant_id: Option<TenantId>) -> Self {
        self.tenant_id = tenant_id;
        self
    }

    #[must_use]
    pub fn with_remote_ip(mut self, remote_ip: Option<String>) -> Self {
        self.remote_ip = remote_ip;
        self
    }

    #[must_use]
    pub fn with_user_agent(mut self, user_agent: Option<String>) -> Self {
        self.user_agent = user_agent;
        self
    }

    #[must_use]
    pub const fn scenario(&self) -> Scenario {
        self.credentials.scenario()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn validation_names_the_field() {
        let err = AuthCredentials::Password {
            username: " ".to_string(),
            password: "x".to_string(),
        }
        .validate()
        .err();
        assert_eq!(err.map(|e| e.message().to_string()).as_deref(), Some("username is required"));

        let err = AuthCredentials::PhoneOtp {
            phone_e164: "13800138000".to_string(),
            otp_code: "123456".to_string(),
        }
        .validate()
        .err();
        assert_eq!(err.map(|e| e.kind()), Some(ErrorKind::InvalidArgument));

        assert!(
            AuthCredentials::Wecom {
                corp_id: "corp".to_string(),
                code: "c".to_string(),
                state: None,
                expected_state: None,
            }
            .validate()
            .is_ok()
        );
    }

    #[test]
    fn debug_hides_secrets() {
        let creds = AuthCredentials::Password {
            username: "alice".to_string(),
            password: "P@ssw0rd".to_string(),
        };
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("alice"));
        assert!(!rendered.contains("P@ssw0rd"));
        assert_eq!(creds.scenario(), Scenario::Password);
    }
}
