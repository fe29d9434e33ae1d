//! Credentials bound to an account and the usage state shared by every kind.

use crate::{
    Error, ErrorKind, Result,
    types::{AccountId, CredentialId, CredentialStatus, CredentialType, Idp},
};
use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde_json::Value;
use std::{fmt, sync::LazyLock};
use tracing::{debug, info};

static E164: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"^\+[1-9][0-9]{6,14}$").ok());

/// Strict E.164 check: leading `+`, no leading zero, 7 to 15 digits.
#[must_use]
pub fn is_e164(phone: &str) -> bool {
    E164.as_ref().is_some_and(|re| re.is_match(phone))
}

/// Authentication fact carried by a credential.
#[derive(Clone, PartialEq)]
pub enum CredentialKind {
    Password {
        /// PHC string bytes.
        material: Vec<u8>,
        algo: String,
        params: Option<Value>,
    },
    PhoneOtp {
        phone_e164: String,
    },
    OAuth {
        idp: Idp,
        app_id: String,
        idp_identifier: String,
    },
}

impl fmt::Debug for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password { algo, params, .. } => f
                .debug_struct("Password")
                .field("material", &"***")
                .field("algo", algo)
                .field("params", params)
                .finish(),
            Self::PhoneOtp { phone_e164 } => f
                .debug_struct("PhoneOtp")
                .field("phone_e164", phone_e164)
                .finish(),
            Self::OAuth {
                idp,
                app_id,
                idp_identifier,
            } => f
                .debug_struct("OAuth")
                .field("idp", idp)
                .field("app_id", app_id)
                .field("idp_identifier", idp_identifier)
                .finish(),
        }
    }
}

impl CredentialKind {
    /// # Errors
    /// Returns `invalid-credential` when the per-kind invariants do not hold.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Password { material, algo, .. } => {
                if material.is_empty() {
                    return Err(Error::invalid_credential("password material cannot be empty"));
                }
                if algo.trim().is_empty() {
                    return Err(Error::invalid_credential("password algo cannot be empty"));
                }
            }
            Self::PhoneOtp { phone_e164 } => {
                if !is_e164(phone_e164) {
                    return Err(Error::invalid_credential(format!(
                        "phone must be in E.164 form: {phone_e164}"
                    )));
                }
            }
            Self::OAuth {
                idp,
                app_id,
                idp_identifier,
            } => {
                if *idp == Idp::Phone {
                    return Err(Error::invalid_credential(
                        "phone identities are stored as phone_otp credentials",
                    ));
                }
                if app_id.trim().is_empty() {
                    return Err(Error::invalid_credential("oauth appId cannot be empty"));
                }
                if idp_identifier.trim().is_empty() {
                    return Err(Error::invalid_credential(
                        "oauth idpIdentifier cannot be empty",
                    ));
                }
            }
        }
        Ok(())
    }

    #[must_use]
    pub const fn credential_type(&self) -> CredentialType {
        match self {
            Self::Password { .. } => CredentialType::Password,
            Self::PhoneOtp { .. } => CredentialType::PhoneOtp,
            Self::OAuth {
                idp: Idp::Wecom, ..
            } => CredentialType::OauthWecom,
            Self::OAuth { .. } => CredentialType::OauthWxMinip,
        }
    }
}

/// Mutable usage tail shared by every credential kind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CredentialUsage {
    pub status: CredentialStatus,
    pub failed_attempts: u32,
    pub locked_until: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
}

impl Default for CredentialUsage {
    fn default() -> Self {
        Self {
            status: CredentialStatus::Enabled,
            failed_attempts: 0,
            locked_until: None,
            last_success_at: None,
            last_failure_at: None,
        }
    }
}

/// Failed-attempt lockout, applied to password credentials only.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockoutPolicy {
    enabled: bool,
    threshold: u32,
    lock_duration: Duration,
}

impl Default for LockoutPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 5,
            lock_duration: Duration::minutes(30),
        }
    }
}

impl LockoutPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            enabled: false,
            threshold: 0,
            lock_duration: Duration::zero(),
        }
    }

    #[must_use]
    pub const fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    #[must_use]
    pub const fn with_threshold(mut self, threshold: u32) -> Self {
        self.threshold = threshold;
        self
    }

    #[must_use]
    pub const fn with_lock_duration(mut self, lock_duration: Duration) -> Self {
        self.lock_duration = lock_duration;
        self
    }

    #[must_use]
    pub const fn enabled(&self) -> bool {
        self.enabled
    }

    #[must_use]
    pub const fn threshold(&self) -> u32 {
        self.threshold
    }

    #[must_use]
    pub const fn lock_duration(&self) -> Duration {
        self.lock_duration
    }

    /// # Errors
    /// Returns `invalid-argument` for an enabled policy with a zero threshold or a non-positive duration.
    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.threshold == 0 {
            return Err(Error::invalid_argument("lockout threshold must be at least 1"));
        }
        if self.lock_duration <= Duration::zero() {
            return Err(Error::invalid_argument("lockout duration must be positive"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Credential {
    pub id: CredentialId,
    pub account_id: AccountId,
    pub kind: CredentialKind,
    pub usage: CredentialUsage,
    /// Optimistic-concurrency revision, bumped by every mutation.
    pub rev: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Credential {
    #[must_use]
    pub const fn credential_type(&self) -> CredentialType {
        self.kind.credential_type()
    }

    #[must_use]
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.usage.locked_until.is_some_and(|until| until > now)
    }

    #[must_use]
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.usage.status == CredentialStatus::Enabled && !self.is_locked(now)
    }

    /// # Errors
    /// Returns `credential-disabled` or `credential-locked` when the credential cannot be used.
    pub fn ensure_usable(&self, now: DateTime<Utc>) -> Result<()> {
        if self.usage.status != CredentialStatus::Enabled {
            debug!(credential_id = %self.id, "credential is disabled");
            return Err(Error::new(
                ErrorKind::CredentialDisabled,
                "credential is disabled",
            ));
        }
        if let Some(until) = self.usage.locked_until
            && until > now
        {
            debug!(credential_id = %self.id, locked_until = %until, "credential is locked");
            return Err(Error::new(
                ErrorKind::CredentialLocked,
                format!("credential is locked until {}", until.to_rfc3339()),
            ));
        }
        Ok(())
    }

    pub fn record_success(&mut self, now: DateTime<Utc>) {
        self.usage.last_success_at = Some(now);
        self.usage.failed_attempts = 0;
        self.touch(now);
    }

    /// Count a failed attempt and lock the credential once the policy threshold is reached.
    ///
    /// Returns `true` when this failure locked the credential.
    pub fn record_failure(&mut self, now: DateTime<Utc>, policy: &LockoutPolicy) -> bool {
        self.usage.last_failure_at = Some(now);
        self.usage.failed_attempts = self.usage.failed_attempts.saturating_add(1);
        self.touch(now);

        let applies = matches!(self.kind, CredentialKind::Password { .. });
        if applies && policy.enabled() && self.usage.failed_attempts >= policy.threshold() {
            let until = now + policy.lock_duration();
            self.usage.locked_until = Some(until);
            info!(
                credential_id = %self.id,
                account_id = %self.account_id,
                failed_attempts = self.usage.failed_attempts,
                locked_until = %until,
                "credential locked by policy"
            );
            return true;
        }
        false
    }

    /// Replace the password hash.
    ///
    /// # Errors
    /// Returns `invalid-credential` for non-password credentials or empty material,
    /// and the `ensure_usable` error when the credential is disabled or locked.
    pub fn rotate_material(
        &mut self,
        now: DateTime<Utc>,
        new_material: Vec<u8>,
        new_algo: Option<String>,
        new_params: Option<Value>,
    ) -> Result<()> {
        if new_material.is_empty() {
            return Err(Error::invalid_credential("new material cannot be empty"));
        }
        self.ensure_usable(now)?;
        let CredentialKind::Password {
            material,
            algo,
            params,
        } = &mut self.kind
        else {
            return Err(Error::invalid_credential(
                "only password credentials carry hash material",
            ));
        };
        *material = new_material;
        if let Some(new_algo) = new_algo {
            *algo = new_algo;
        }
        if new_params.is_some() {
            *params = new_params;
        }
        self.touch(now);
        Ok(())
    }

    /// Administrative enable; clears any lock.
    pub fn enable(&mut self, now: DateTime<Utc>) {
        self.usage.status = CredentialStatus::Enabled;
        self.usage.locked_until = None;
        self.usage.failed_attempts = 0;
        self.touch(now);
    }

    pub fn disable(&mut self, now: DateTime<Utc>) {
        self.usage.status = CredentialStatus::Disabled;
        self.touch(now);
    }

    pub fn unlock(&mut self, now: DateTime<Utc>) {
        self.usage.locked_until = None;
        self.usage.failed_attempts = 0;
        self.touch(now);
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.rev += 1;
        self.updated_at = now;
    }
}

/// Wide storage row; the mapper picks the variant from `credential_type`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CredentialRecord {
    pub id: i64,
    pub account_id: i64,
    pub credential_type: String,
    pub idp: Option<String>,
    pub idp_identifier: Option<String>,
    pub app_id: Option<String>,
    pub material: Option<Vec<u8>>,
    pub algo: Option<String>,
    pub params_json: Option<Value>,
    pub status: String,
    pub failed_attempts: i32,
    pub locked_until: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub rev: i64,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl TryFrom<CredentialRecord> for Credential {
    type Error = Error;

    fn try_from(row: CredentialRecord) -> Result<Self> {
        let credential_type: CredentialType = row.credential_type.parse()?;
        let kind = match credential_type {
            CredentialType::Password => CredentialKind::Password {
                material: row.material.unwrap_or_default(),
                algo: row.algo.unwrap_or_default(),
                params: row.params_json,
            },
            CredentialType::PhoneOtp => CredentialKind::PhoneOtp {
                phone_e164: row.idp_identifier.unwrap_or_default(),
            },
            CredentialType::OauthWxMinip | CredentialType::OauthWecom => CredentialKind::OAuth {
                idp: if credential_type == CredentialType::OauthWecom {
                    Idp::Wecom
                } else {
                    Idp::WxMinip
                },
                app_id: row.app_id.unwrap_or_default(),
                idp_identifier: row.idp_identifier.unwrap_or_default(),
            },
        };
        kind.validate()?;

        let created_at = row.created_at.unwrap_or_else(Utc::now);
        Ok(Self {
            id: CredentialId::new(row.id),
            account_id: AccountId::new(row.account_id),
            kind,
            usage: CredentialUsage {
                status: row.status.parse()?,
                failed_attempts: u32::try_from(row.failed_attempts).unwrap_or(0),
                locked_until: row.locked_until,
                last_success_at: row.last_success_at,
                last_failure_at: row.last_failure_at,
            },
            rev: row.rev,
            created_at,
            updated_at: row.updated_at.unwrap_or(created_at),
        })
    }
}

impl From<&Credential> for CredentialRecord {
    fn from(cred: &Credential) -> Self {
        let mut row = Self {
            id: cred.id.get(),
            account_id: cred.account_id.get(),
            credential_type: cred.credential_type().as_str().to_string(),
            status: cred.usage.status.as_str().to_string(),
            failed_attempts: i32::try_from(cred.usage.failed_attempts).unwrap_or(i32::MAX),
            locked_until: cred.usage.locked_until,
            last_success_at: cred.usage.last_success_at,
            last_failure_at: cred.usage.last_failure_at,
            rev: cred.rev,
            created_at: Some(cred.created_at),
            updated_at: Some(cred.updated_at),
            ..Self::default()
        };
        match &cred.kind {
            CredentialKind::Password {
                material,
                algo,
                params,
            } => {
                row.material = Some(material.clone());
                row.algo = Some(algo.clone());
                row.params_json.clone_from(params);
            }
            CredentialKind::PhoneOtp { phone_e164 } => {
                row.idp = Some(Idp::Phone.as_str().to_string());
                row.idp_identifier = Some(phone_e164.clone());
            }
            CredentialKind::OAuth {
                idp,
                app_id,
                idp_identifier,
            } => {
                row.idp = Some(idp.as_str().to_string());
                row.app_id = Some(app_id.clone());
                row.idp_identifier = Some(idp_identifier.clone());
            }
        }
        row
    }
}
