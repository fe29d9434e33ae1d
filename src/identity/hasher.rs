//! Password hashing port and its argon2id implementation.

use anyhow::{Context, Result, anyhow};
use argon2::{
    Algorithm, Argon2, Params, PasswordHash, PasswordHasher as _, PasswordVerifier, Version,
    password_hash::SaltString,
};
use rand::rngs::OsRng;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use std::{fmt, sync::Arc};

/// Freshly computed hash ready to be stored on a password credential.
#[derive(Clone, PartialEq, Eq)]
pub struct HashedPassword {
    pub material: Vec<u8>,
    pub algo: String,
    pub params: Option<Value>,
}

impl fmt::Debug for HashedPassword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashedPassword")
            .field("material", &"***")
            .field("algo", &self.algo)
            .field("params", &self.params)
            .finish()
    }
}

/// Callers pass `plaintext + pepper`; the algorithm and its cost live in the PHC string.
pub trait PasswordHasher: Send + Sync {
    /// # Errors
    /// Returns an error when the stored hash cannot be parsed; a mismatch is `Ok(false)`.
    fn verify(&self, phc: &[u8], secret: &str) -> Result<bool>;

    /// # Errors
    /// Returns an error when hashing fails.
    fn hash(&self, secret: &str) -> Result<HashedPassword>;

    fn need_rehash(&self, phc: &[u8]) -> bool;

    fn pepper(&self) -> &str;

    /// A valid hash of an unguessable value, verified against when a username is
    /// unknown so both paths cost one hash computation.
    fn dummy_hash(&self) -> &[u8];

    /// Concatenate the configured pepper onto a plaintext password.
    fn peppered(&self, plaintext: &str) -> String {
        let mut secret = String::with_capacity(plaintext.len() + self.pepper().len());
        secret.push_str(plaintext);
        secret.push_str(self.pepper());
        secret
    }
}

/// Run [`PasswordHasher::verify`] on the blocking pool.
///
/// # Errors
/// Returns the verifier's error, or an error if the blocking task panicked.
pub async fn verify_blocking(
    hasher: Arc<dyn PasswordHasher>,
    phc: Vec<u8>,
    secret: String,
) -> Result<bool> {
    tokio::task::spawn_blocking(move || hasher.verify(&phc, &secret))
        .await
        .context("Password verification task failed")?
}

/// Run [`PasswordHasher::hash`] on the blocking pool.
///
/// # Errors
/// Returns the hasher's error, or an error if the blocking task panicked.
pub async fn hash_blocking(hasher: Arc<dyn PasswordHasher>, secret: String) -> Result<HashedPassword> {
    tokio::task::spawn_blocking(move || hasher.hash(&secret))
        .await
        .context("Password hashing task failed")?
}

/// Argon2id cost parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Argon2Params {
    m_cost: u32,
    t_cost: u32,
    p_cost: u32,
}

impl Default for Argon2Params {
    fn default() -> Self {
        Self {
            m_cost: Params::DEFAULT_M_COST,
            t_cost: Params::DEFAULT_T_COST,
            p_cost: Params::DEFAULT_P_COST,
        }
    }
}

impl Argon2Params {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn with_m_cost(mut self, m_cost: u32) -> Self {
        self.m_cost = m_cost;
        self
    }

    #[must_use]
    pub const fn with_t_cost(mut self, t_cost: u32) -> Self {
        self.t_cost = t_cost;
        self
    }

    #[must_use]
    pub const fn with_p_cost(mut self, p_cost: u32) -> Self {
        self.p_cost = p_cost;
        self
    }

    #[must_use]
    pub const fn m_cost(&self) -> u32 {
        self.m_cost
    }

    #[must_use]
    pub const fn t_cost(&self) -> u32 {
        self.t_cost
    }

    #[must_use]
    pub const fn p_cost(&self) -> u32 {
        self.p_cost
    }
}

pub struct Argon2Hasher {
    argon2: Argon2<'static>,
    params: Argon2Params,
    pepper: SecretString,
    dummy: Vec<u8>,
}

impl fmt::Debug for Argon2Hasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Argon2Hasher")
            .field("params", &self.params)
            .field("pepper", &"***")
            .finish_non_exhaustive()
    }
}

impl Argon2Hasher {
    /// # Errors
    /// Returns an error when the cost parameters are rejected by argon2.
    pub fn new(params: Argon2Params, pepper: SecretString) -> Result<Self> {
        let argon2_params = Params::new(params.m_cost, params.t_cost, params.p_cost, None)
            .map_err(|e| anyhow!("invalid argon2 parameters: {e}"))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);
        let mut hasher = Self {
            argon2,
            params,
            pepper,
            dummy: Vec::new(),
        };
        let mut seed = [0u8; 32];
        rand::RngCore::fill_bytes(&mut OsRng, &mut seed);
        let dummy_secret = <base64ct::Base64UrlUnpadded as base64ct::Encoding>::encode_string(&seed);
        hasher.dummy = hasher
            .hash(&dummy_secret)
            .context("Failed to compute dummy hash")?
            .material;
        Ok(hasher)
    }

    fn params_json(&self) -> Value {
        json!({
            "m": self.params.m_cost,
            "t": self.params.t_cost,
            "p": self.params.p_cost,
        })
    }
}

impl PasswordHasher for Argon2Hasher {
    fn verify(&self, phc: &[u8], secret: &str) -> Result<bool> {
        let phc = std::str::from_utf8(phc).context("Stored password hash is not UTF-8")?;
        let parsed = PasswordHash::new(phc).map_err(|e| anyhow!("invalid PHC string: {e}"))?;
        match self.argon2.verify_password(secret.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(e) => Err(anyhow!("password verification failed: {e}")),
        }
    }

    fn hash(&self, secret: &str) -> Result<HashedPassword> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .argon2
            .hash_password(secret.as_bytes(), &salt)
            .map_err(|e| anyhow!("password hashing failed: {e}"))?;
        Ok(HashedPassword {
            material: hash.to_string().into_bytes(),
            algo: Algorithm::Argon2id.as_str().to_string(),
            params: Some(self.params_json()),
        })
    }

    fn need_rehash(&self, phc: &[u8]) -> bool {
        let Ok(phc) = std::str::from_utf8(phc) else {
            return false;
        };
        let Ok(parsed) = PasswordHash::new(phc) else {
            return false;
        };
        if parsed.algorithm != Algorithm::Argon2id.ident() {
            return true;
        }
        if parsed.version != Some(Version::V0x13.into()) {
            return true;
        }
        match Params::try_from(&parsed) {
            Ok(stored) => {
                stored.m_cost() != self.params.m_cost
                    || stored.t_cost() != self.params.t_cost
                    || stored.p_cost() != self.params.p_cost
            }
            Err(_) => true,
        }
    }

    fn pepper(&self) -> &str {
        self.pepper.expose_secret()
    }

    fn dummy_hash(&self) -> &[u8] {
        &self.dummy
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // Minimal costs keep the tests fast.
    fn hasher(m_cost: u32) -> Argon2Hasher {
        Argon2Hasher::new(
            Argon2Params::new()
                .with_m_cost(m_cost)
                .with_t_cost(1)
                .with_p_cost(1),
            SecretString::from("pepper-1"),
        )
        .unwrap()
    }

    #[test]
    fn hash_then_verify() {
        let hasher = hasher(64);
        let secret = hasher.peppered("P@ssw0rd");
        assert_eq!(secret, "P@ssw0rdpepper-1");
        let hashed = hasher.hash(&secret).unwrap();
        assert_eq!(hashed.algo, "argon2id");
        assert!(hashed.material.starts_with(b"$argon2id$"));
        assert!(hasher.verify(&hashed.material, &secret).unwrap());
        assert!(!hasher.verify(&hashed.material, "P@ssw0rd").unwrap());
    }

    #[test]
    fn verify_rejects_garbage() {
        let hasher = hasher(64);
        assert!(hasher.verify(b"not-a-phc", "x").is_err());
    }

    #[test]
    fn rehash_when_cost_changes() {
        let weak = hasher(64);
        let strong = hasher(128);
        let hashed = weak.hash("secret").unwrap();
        assert!(!weak.need_rehash(&hashed.material));
        assert!(strong.need_rehash(&hashed.material));
        // Hashes produced under the old cost still verify.
        assert!(strong.verify(&hashed.material, "secret").unwrap());
    }

    #[test]
    fn rehash_when_algorithm_differs() {
        let hasher = hasher(64);
        let argon2i = Argon2::new(
            Algorithm::Argon2i,
            Version::V0x13,
            Params::new(64, 1, 1, None).unwrap(),
        );
        let salt = SaltString::generate(&mut OsRng);
        let legacy = argon2i.hash_password(b"secret", &salt).unwrap().to_string();
        assert!(hasher.need_rehash(legacy.as_bytes()));
    }

    #[test]
    fn dummy_hash_is_a_valid_phc() {
        let hasher = hasher(64);
        assert!(!hasher.dummy_hash().is_empty());
        assert!(!hasher.verify(hasher.dummy_hash(), "anything").unwrap());
    }

    #[test]
    fn debug_redacts_pepper() {
        let hasher = hasher(64);
        let rendered = format!("{hasher:?}");
        assert!(!rendered.contains("pepper-1"));
    }
}
