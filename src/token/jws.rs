//! JWS compact serialization for access tokens.

use super::claims::AccessClaims;
use crate::jwks::{ActiveSigner, Algorithm, PublicJwk, crypto};
use base64ct::{Base64UrlUnpadded, Encoding};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JwsHeader {
    pub alg: String,
    pub typ: String,
    pub kid: String,
}

#[derive(Debug, Error)]
pub enum JwsError {
    #[error("invalid token format")]
    TokenFormat,
    #[error("invalid base64url encoding")]
    Base64,
    #[error("invalid json")]
    Json(#[from] serde_json::Error),
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlg(String),
    #[error("algorithm {0} does not match the signing key")]
    AlgMismatch(String),
    #[error("invalid signature")]
    InvalidSignature,
    #[error("signing failed: {0}")]
    Sign(String),
}

fn b64e_json<T: Serialize>(value: &T) -> Result<String, JwsError> {
    let json = serde_json::to_vec(value)?;
    Ok(Base64UrlUnpadded::encode_string(&json))
}

fn b64d_json<T: for<'de> Deserialize<'de>>(s: &str) -> Result<T, JwsError> {
    let bytes = Base64UrlUnpadded::decode_vec(s).map_err(|_| JwsError::Base64)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Sign `claims` with the active signer.
///
/// # Errors
/// Returns an error if the claims cannot be encoded or the private key is unusable.
pub fn sign(signer: &ActiveSigner, claims: &AccessClaims) -> Result<String, JwsError> {
    let header = JwsHeader {
        alg: signer.algorithm().as_str().to_string(),
        typ: "JWT".to_string(),
        kid: signer.kid().as_str().to_string(),
    };
    let signing_input = format!("{}.{}", b64e_json(&header)?, b64e_json(claims)?);
    let signature = signer
        .sign(signing_input.as_bytes())
        .map_err(|err| JwsError::Sign(err.to_string()))?;
    let signature_b64 = Base64UrlUnpadded::encode_string(&signature);
    Ok(format!("{signing_input}.{signature_b64}"))
}

/// A compact JWS split into its parts; the signature is not checked yet.
#[derive(Debug)]
pub struct Unverified<'a> {
    pub header: JwsHeader,
    signing_input: &'a str,
    claims_b64: &'a str,
    signature: Vec<u8>,
}

/// Split and decode the header of a compact JWS.
///
/// # Errors
/// Returns an error for anything that is not three base64url segments with a JSON header.
pub fn decode(token: &str) -> Result<Unverified<'_>, JwsError> {
    let mut parts = token.split('.');
    let header_b64 = parts.next().ok_or(JwsError::TokenFormat)?;
    let claims_b64 = parts.next().ok_or(JwsError::TokenFormat)?;
    let sig_b64 = parts.next().ok_or(JwsError::TokenFormat)?;
    if parts.next().is_some() || header_b64.is_empty() || claims_b64.is_empty() {
        return Err(JwsError::TokenFormat);
    }
    let header: JwsHeader = b64d_json(header_b64)?;
    let signature = Base64UrlUnpadded::decode_vec(sig_b64).map_err(|_| JwsError::Base64)?;
    let signing_input = &token[..header_b64.len() + 1 + claims_b64.len()];
    Ok(Unverified {
        header,
        signing_input,
        claims_b64,
        signature,
    })
}

impl Unverified<'_> {
    /// Check the signature against `jwk` and decode the claims.
    ///
    /// # Errors
    /// Returns an error when the header algorithm is unknown or differs from the
    /// key's, or when the signature does not verify.
    pub fn verify(self, jwk: &PublicJwk) -> Result<AccessClaims, JwsError> {
        let alg: Algorithm = self
            .header
            .alg
            .parse()
            .map_err(|_| JwsError::UnsupportedAlg(self.header.alg.clone()))?;
        if jwk.algorithm().is_some_and(|key_alg| key_alg != alg) || jwk.kty != alg.key_type() {
            return Err(JwsError::AlgMismatch(self.header.alg));
        }
        let valid = crypto::verify(alg, jwk, self.signing_input.as_bytes(), &self.signature)
            .map_err(|_| JwsError::InvalidSignature)?;
        if !valid {
            return Err(JwsError::InvalidSignature);
        }
        b64d_json(self.claims_b64)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{
        clock::ManualClock,
        jwks::{KeyManager, KeyManagerConfig, MemoryKeyStore, SoftwareKeyGenerator},
    };
    use chrono::Utc;
    use std::sync::Arc;

    async fn signer() -> (ActiveSigner, PublicJwk) {
        let manager = KeyManager::new(
            Arc::new(MemoryKeyStore::new()),
            Arc::new(SoftwareKeyGenerator::new()),
            Arc::new(ManualClock::new(Utc::now())),
            KeyManagerConfig::new().with_algorithm(Algorithm::Es256),
        );
        let info = manager.create_key(None, None, None).await.unwrap();
        (manager.active_signer().await.unwrap(), info.public_jwk)
    }

    fn claims() -> AccessClaims {
        AccessClaims {
            iss: "authn".to_string(),
            sub: "100".to_string(),
            aid: "200".to_string(),
            aud: None,
            iat: 1,
            exp: 2,
            jti: "01J".to_string(),
            kid: "k".to_string(),
            sid: None,
            tid: None,
            amr: None,
        }
    }

    #[tokio::test]
    async fn sign_then_verify() {
        let (signer, jwk) = signer().await;
        let token = sign(&signer, &claims()).unwrap();
        let unverified = decode(&token).unwrap();
        assert_eq!(unverified.header.typ, "JWT");
        assert_eq!(unverified.header.alg, "ES256");
        assert_eq!(unverified.header.kid, signer.kid().as_str());
        assert_eq!(unverified.verify(&jwk).unwrap(), claims());
    }

    #[tokio::test]
    async fn tampered_payload_fails() {
        let (signer, jwk) = signer().await;
        let token = sign(&signer, &claims()).unwrap();
        let mut forged = claims();
        forged.sub = "101".to_string();
        let forged_b64 = b64e_json(&forged).unwrap();
        let parts: Vec<&str> = token.split('.').collect();
        let tampered = format!("{}.{forged_b64}.{}", parts[0], parts[2]);
        assert!(matches!(
            decode(&tampered).unwrap().verify(&jwk),
            Err(JwsError::InvalidSignature)
        ));
    }

    #[tokio::test]
    async fn header_alg_must_match_key() {
        let (signer, jwk) = signer().await;
        let token = sign(&signer, &claims()).unwrap();
        let parts: Vec<&str> = token.split('.').collect();
        let header = b64e_json(&JwsHeader {
            alg: "RS256".to_string(),
            typ: "JWT".to_string(),
            kid: signer.kid().as_str().to_string(),
        })
        .unwrap();
        let swapped = format!("{header}.{}.{}", parts[1], parts[2]);
        assert!(matches!(
            decode(&swapped).unwrap().verify(&jwk),
            Err(JwsError::AlgMismatch(_))
        ));
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        assert!(matches!(decode("a.b"), Err(JwsError::TokenFormat)));
        assert!(matches!(decode("a.b.c.d"), Err(JwsError::TokenFormat)));
        assert!(decode("!!.e30.AA").is_err());
    }
}
