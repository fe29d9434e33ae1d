//! Signing keys, their lifecycle, and the public JWK view.

use crate::{
    Error, Result,
    types::{Kid, str_enum},
};
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretSlice};
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};
use tracing::info;
use utoipa::ToSchema;

str_enum! {
    /// `active` signs and verifies, `grace` only verifies, `retired` is unpublished.
    pub enum KeyStatus {
        Active => "active",
        Grace => "grace",
        Retired => "retired",
    }
}

str_enum! {
    /// JWS algorithms a key can be generated for.
    pub enum Algorithm {
        Rs256 => "RS256",
        Rs384 => "RS384",
        Rs512 => "RS512",
        Es256 => "ES256",
        Es384 => "ES384",
    }
}

impl Algorithm {
    #[must_use]
    pub const fn key_type(self) -> &'static str {
        match self {
            Self::Rs256 | Self::Rs384 | Self::Rs512 => "RSA",
            Self::Es256 | Self::Es384 => "EC",
        }
    }

    #[must_use]
    pub const fn curve(self) -> Option<&'static str> {
        match self {
            Self::Es256 => Some("P-256"),
            Self::Es384 => Some("P-384"),
            Self::Rs256 | Self::Rs384 | Self::Rs512 => None,
        }
    }
}

impl Default for Algorithm {
    fn default() -> Self {
        Self::Rs256
    }
}

/// Public half of a signing key in JWK form.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PublicJwk {
    pub kty: String,
    pub kid: String,
    #[serde(rename = "use", default, skip_serializing_if = "Option::is_none")]
    pub key_use: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
}

fn present(value: Option<&String>) -> bool {
    value.is_some_and(|v| !v.is_empty())
}

impl PublicJwk {
    /// # Errors
    /// Returns `invalid-argument` when required members are missing for the key
    /// type or `alg` does not belong to it.
    pub fn validate(&self) -> Result<()> {
        if self.kid.trim().is_empty() {
            return Err(Error::invalid_argument("jwk kid cannot be empty"));
        }
        match self.kty.as_str() {
            "RSA" => {
                if !present(self.n.as_ref()) || !present(self.e.as_ref()) {
                    return Err(Error::invalid_argument("n and e are required for RSA"));
                }
            }
            "EC" => {
                if !present(self.crv.as_ref())
                    || !present(self.x.as_ref())
                    || !present(self.y.as_ref())
                {
                    return Err(Error::invalid_argument("crv, x and y are required for EC"));
                }
            }
            "OKP" => {
                if !present(self.crv.as_ref()) || !present(self.x.as_ref()) {
                    return Err(Error::invalid_argument("crv and x are required for OKP"));
                }
            }
            other => {
                return Err(Error::invalid_argument(format!(
                    "unsupported key type '{other}'"
                )));
            }
        }
        if let Some(alg) = &self.alg {
            let expected = match alg.get(..2) {
                Some("RS" | "PS") => "RSA",
                Some("ES") => "EC",
                Some("Ed") => "OKP",
                _ => "",
            };
            if expected != self.kty {
                return Err(Error::invalid_argument(format!(
                    "alg {alg} does not match key type {}",
                    self.kty
                )));
            }
        }
        Ok(())
    }

    /// Algorithm this key verifies, when it is one we can check.
    #[must_use]
    pub fn algorithm(&self) -> Option<Algorithm> {
        self.alg.as_deref().and_then(|alg| alg.parse().ok())
    }
}

/// Key record as exposed to administrators; never carries private material.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct KeyInfo {
    #[schema(value_type = String)]
    pub kid: Kid,
    #[schema(value_type = String, example = "RS256")]
    pub algorithm: Algorithm,
    #[schema(value_type = String, example = "active")]
    pub status: KeyStatus,
    pub not_before: DateTime<Utc>,
    pub not_after: Option<DateTime<Utc>>,
    pub public_jwk: PublicJwk,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl KeyInfo {
    /// Listed in the JWKS at `now`: active or grace, inside its validity window.
    #[must_use]
    pub fn is_published(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status, KeyStatus::Active | KeyStatus::Grace)
            && self.not_before <= now
            && self.not_after.is_none_or(|not_after| now < not_after)
    }
}

/// Persistent signing key; the private half is PKCS#8 DER.
#[derive(Clone)]
pub struct SigningKey {
    info: KeyInfo,
    private_der: Arc<SecretSlice<u8>>,
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("info", &self.info)
            .field("private_der", &"***")
            .finish()
    }
}

impl SigningKey {
    /// # Errors
    /// Returns `invalid-argument` when the JWK is malformed, its `kid` differs
    /// from the key's, or the validity window is empty.
    pub fn new(info: KeyInfo, private_der: Vec<u8>) -> Result<Self> {
        info.public_jwk.validate()?;
        if info.public_jwk.kid != info.kid.as_str() {
            return Err(Error::invalid_argument("jwk kid must equal key kid"));
        }
        if info.public_jwk.kty != info.algorithm.key_type() {
            return Err(Error::invalid_argument(format!(
                "{} keys need kty {}",
                info.algorithm,
                info.algorithm.key_type()
            )));
        }
        if let Some(not_after) = info.not_after
            && not_after <= info.not_before
        {
            return Err(Error::invalid_argument("notAfter must be after notBefore"));
        }
        if private_der.is_empty() {
            return Err(Error::invalid_argument("private key material is required"));
        }
        Ok(Self {
            info,
            private_der: Arc::new(SecretSlice::from(private_der)),
        })
    }

    #[must_use]
    pub const fn info(&self) -> &KeyInfo {
        &self.info
    }

    #[must_use]
    pub fn into_info(self) -> KeyInfo {
        self.info
    }

    #[must_use]
    pub const fn kid(&self) -> &Kid {
        &self.info.kid
    }

    #[must_use]
    pub const fn status(&self) -> KeyStatus {
        self.info.status
    }

    #[must_use]
    pub const fn algorithm(&self) -> Algorithm {
        self.info.algorithm
    }

    pub(crate) fn private_der(&self) -> &[u8] {
        self.private_der.expose_secret()
    }

    pub(crate) fn private_handle(&self) -> Arc<SecretSlice<u8>> {
        self.private_der.clone()
    }

    /// `active → grace`.
    ///
    /// # Errors
    /// Returns `invalid-state-transition` from any other state.
    pub fn enter_grace(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.info.status != KeyStatus::Active {
            return Err(Error::invalid_transition(format!(
                "key {} is {}; only active keys enter grace",
                self.info.kid, self.info.status
            )));
        }
        self.set_status(KeyStatus::Grace, now);
        Ok(())
    }

    /// `grace → retired`; returns `false` when the key was already retired.
    ///
    /// # Errors
    /// Returns `invalid-state-transition` for an active key.
    pub fn retire(&mut self, now: DateTime<Utc>) -> Result<bool> {
        match self.info.status {
            KeyStatus::Retired => Ok(false),
            KeyStatus::Grace => {
                self.set_status(KeyStatus::Retired, now);
                Ok(true)
            }
            KeyStatus::Active => Err(Error::invalid_transition(format!(
                "key {} is active; move it to grace first or force-retire it",
                self.info.kid
            ))),
        }
    }

    /// Retire from any state; returns `false` when already retired.
    pub fn force_retire(&mut self, now: DateTime<Utc>) -> bool {
        if self.info.status == KeyStatus::Retired {
            return false;
        }
        info!(kid = %self.info.kid, from = %self.info.status, "force-retiring key");
        self.set_status(KeyStatus::Retired, now);
        true
    }

    fn set_status(&mut self, status: KeyStatus, now: DateTime<Utc>) {
        self.info.status = status;
        self.info.updated_at = now;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn jwk(kid: &str) -> PublicJwk {
        PublicJwk {
            kty: "EC".to_string(),
            kid: kid.to_string(),
            key_use: Some("sig".to_string()),
            alg: Some("ES256".to_string()),
            n: None,
            e: None,
            crv: Some("P-256".to_string()),
            x: Some("eA".to_string()),
            y: Some("eQ".to_string()),
        }
    }

    fn info(status: KeyStatus, now: DateTime<Utc>, not_after: Option<DateTime<Utc>>) -> KeyInfo {
        KeyInfo {
            kid: Kid::new("k1").unwrap(),
            algorithm: Algorithm::Es256,
            status,
            not_before: now,
            not_after,
            public_jwk: jwk("k1"),
            created_at: now,
            updated_at: now,
        }
    }

    fn key(status: KeyStatus, now: DateTime<Utc>) -> SigningKey {
        SigningKey::new(info(status, now, None), vec![1, 2, 3]).unwrap()
    }

    #[test]
    fn jwk_members_per_key_type() {
        assert!(jwk("k").validate().is_ok());

        let mut rsa = jwk("k");
        rsa.kty = "RSA".to_string();
        rsa.alg = Some("RS256".to_string());
        assert!(rsa.validate().is_err());
        rsa.n = Some("AQAB".to_string());
        rsa.e = Some("AQAB".to_string());
        assert!(rsa.validate().is_ok());

        let mut okp = jwk("k");
        okp.kty = "OKP".to_string();
        okp.alg = Some("EdDSA".to_string());
        okp.y = None;
        assert!(okp.validate().is_ok());

        let mut odd = jwk("k");
        odd.kty = "oct".to_string();
        assert!(odd.validate().is_err());

        let mut mismatched = jwk("k");
        mismatched.alg = Some("RS256".to_string());
        assert!(mismatched.validate().is_err());
    }

    #[test]
    fn lifecycle_transitions() {
        let now = Utc::now();
        let mut k = key(KeyStatus::Active, now);
        assert!(k.retire(now).is_err());
        k.enter_grace(now).unwrap();
        assert!(k.enter_grace(now).is_err());
        assert!(k.retire(now).unwrap());
        assert!(!k.retire(now).unwrap());
        assert!(!k.force_retire(now));
        assert_eq!(k.status(), KeyStatus::Retired);
    }

    #[test]
    fn force_retire_from_active() {
        let now = Utc::now();
        let mut k = key(KeyStatus::Active, now);
        assert!(k.force_retire(now));
        assert_eq!(k.status(), KeyStatus::Retired);
    }

    #[test]
    fn publication_window() {
        let now = Utc::now();
        let mut info = key(KeyStatus::Grace, now).into_info();
        assert!(info.is_published(now));
        info.not_before = now + Duration::seconds(10);
        assert!(!info.is_published(now));
        info.not_before = now - Duration::hours(1);
        info.not_after = Some(now);
        assert!(!info.is_published(now));
        info.not_after = None;
        info.status = KeyStatus::Retired;
        assert!(!info.is_published(now));
    }

    #[test]
    fn empty_window_is_rejected() {
        let now = Utc::now();
        let info = info(KeyStatus::Active, now, Some(now - Duration::hours(1)));
        let err = SigningKey::new(info, vec![1]).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidArgument);
    }

    #[test]
    fn debug_hides_private_material() {
        let rendered = format!("{:?}", key(KeyStatus::Active, Utc::now()));
        assert!(rendered.contains("***"));
        assert!(!rendered.contains("[1, 2, 3]"));
    }
}
