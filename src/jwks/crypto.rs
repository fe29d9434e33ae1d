//! Key generation, JWS signing and verification, and RFC 7638 thumbprints.

use super::key::{Algorithm, PublicJwk};
use anyhow::{Context, Result, anyhow, bail};
use base64ct::{Base64UrlUnpadded, Encoding};
use rand::rngs::OsRng;
use rsa::{
    BigUint, RsaPrivateKey, RsaPublicKey, pkcs1v15,
    pkcs8::{DecodePrivateKey, EncodePrivateKey},
    signature::{SignatureEncoding, Signer, Verifier},
    traits::PublicKeyParts,
};
use sha2::{Digest, Sha256, Sha384, Sha512};

/// Fresh key pair: the public JWK (with its thumbprint as `kid`) and the
/// private key as PKCS#8 DER.
pub struct GeneratedKey {
    pub public_jwk: PublicJwk,
    pub private_der: Vec<u8>,
}

/// Produces key pairs; an HSM or KMS backed implementation slots in here.
pub trait KeyGenerator: Send + Sync {
    /// # Errors
    /// Returns an error when key generation or encoding fails.
    fn generate(&self, algorithm: Algorithm) -> Result<GeneratedKey>;
}

/// Generates keys in process with the RustCrypto implementations.
#[derive(Clone, Copy, Debug)]
pub struct SoftwareKeyGenerator {
    rsa_bits: usize,
}

impl Default for SoftwareKeyGenerator {
    fn default() -> Self {
        Self { rsa_bits: 2048 }
    }
}

impl SoftwareKeyGenerator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn with_rsa_bits(mut self, rsa_bits: usize) -> Self {
        self.rsa_bits = rsa_bits;
        self
    }

    #[must_use]
    pub const fn rsa_bits(&self) -> usize {
        self.rsa_bits
    }
}

impl KeyGenerator for SoftwareKeyGenerator {
    fn generate(&self, algorithm: Algorithm) -> Result<GeneratedKey> {
        let (mut public_jwk, private_der) = match algorithm {
            Algorithm::Rs256 | Algorithm::Rs384 | Algorithm::Rs512 => {
                let private_key = RsaPrivateKey::new(&mut OsRng, self.rsa_bits)
                    .context("Failed to generate RSA key")?;
                let public_key = RsaPublicKey::from(&private_key);
                let der = private_key
                    .to_pkcs8_der()
                    .map_err(|e| anyhow!("failed to encode RSA key: {e}"))?;
                (rsa_jwk(&public_key), der.as_bytes().to_vec())
            }
            Algorithm::Es256 => {
                let signing_key = p256::ecdsa::SigningKey::random(&mut OsRng);
                let point = signing_key.verifying_key().to_encoded_point(false);
                let der = signing_key
                    .to_pkcs8_der()
                    .map_err(|e| anyhow!("failed to encode P-256 key: {e}"))?;
                let jwk = ec_jwk(
                    algorithm,
                    point.x().map(|x| x.as_slice()),
                    point.y().map(|y| y.as_slice()),
                )?;
                (jwk, der.as_bytes().to_vec())
            }
            Algorithm::Es384 => {
                let signing_key = p384::ecdsa::SigningKey::random(&mut OsRng);
                let point = signing_key.verifying_key().to_encoded_point(false);
                let der = signing_key
                    .to_pkcs8_der()
                    .map_err(|e| anyhow!("failed to encode P-384 key: {e}"))?;
                let jwk = ec_jwk(
                    algorithm,
                    point.x().map(|x| x.as_slice()),
                    point.y().map(|y| y.as_slice()),
                )?;
                (jwk, der.as_bytes().to_vec())
            }
        };
        public_jwk.alg = Some(algorithm.as_str().to_string());
        public_jwk.kid = thumbprint(&public_jwk)?;
        Ok(GeneratedKey {
            public_jwk,
            private_der,
        })
    }
}

fn rsa_jwk(public_key: &RsaPublicKey) -> PublicJwk {
    PublicJwk {
        kty: "RSA".to_string(),
        kid: String::new(),
        key_use: Some("sig".to_string()),
        alg: None,
        n: Some(Base64UrlUnpadded::encode_string(&public_key.n().to_bytes_be())),
        e: Some(Base64UrlUnpadded::encode_string(&public_key.e().to_bytes_be())),
        crv: None,
        x: None,
        y: None,
    }
}

fn ec_jwk(algorithm: Algorithm, x: Option<&[u8]>, y: Option<&[u8]>) -> Result<PublicJwk> {
    let (Some(x), Some(y)) = (x, y) else {
        bail!("EC public key is missing coordinates");
    };
    Ok(PublicJwk {
        kty: "EC".to_string(),
        kid: String::new(),
        key_use: Some("sig".to_string()),
        alg: None,
        n: None,
        e: None,
        crv: algorithm.curve().map(str::to_string),
        x: Some(Base64UrlUnpadded::encode_string(x)),
        y: Some(Base64UrlUnpadded::encode_string(y)),
    })
}

fn member<'a>(value: Option<&'a String>, name: &str) -> Result<&'a str> {
    value
        .map(String::as_str)
        .filter(|v| !v.is_empty())
        .with_context(|| format!("jwk member '{name}' is missing"))
}

/// RFC 7638 thumbprint: SHA-256 over the required members in lexicographic order.
///
/// # Errors
/// Returns an error when a required member is missing or the key type is unknown.
pub fn thumbprint(jwk: &PublicJwk) -> Result<String> {
    let canonical = match jwk.kty.as_str() {
        "RSA" => format!(
            r#"{{"e":"{}","kty":"RSA","n":"{}"}}"#,
            member(jwk.e.as_ref(), "e")?,
            member(jwk.n.as_ref(), "n")?
        ),
        "EC" => format!(
            r#"{{"crv":"{}","kty":"EC","x":"{}","y":"{}"}}"#,
            member(jwk.crv.as_ref(), "crv")?,
            member(jwk.x.as_ref(), "x")?,
            member(jwk.y.as_ref(), "y")?
        ),
        "OKP" => format!(
            r#"{{"crv":"{}","kty":"OKP","x":"{}"}}"#,
            member(jwk.crv.as_ref(), "crv")?,
            member(jwk.x.as_ref(), "x")?
        ),
        other => bail!("unsupported key type '{other}'"),
    };
    Ok(Base64UrlUnpadded::encode_string(&Sha256::digest(
        canonical.as_bytes(),
    )))
}

/// Sign `input` with a PKCS#8 DER private key.
///
/// ECDSA signatures are the fixed-size `r || s` form JWS expects.
///
/// # Errors
/// Returns an error when the private key does not decode for `algorithm`.
pub fn sign(algorithm: Algorithm, private_der: &[u8], input: &[u8]) -> Result<Vec<u8>> {
    match algorithm {
        Algorithm::Rs256 | Algorithm::Rs384 | Algorithm::Rs512 => {
            let private_key = RsaPrivateKey::from_pkcs8_der(private_der)
                .map_err(|e| anyhow!("failed to decode RSA private key: {e}"))?;
            let signature = match algorithm {
                Algorithm::Rs384 => pkcs1v15::SigningKey::<Sha384>::new(private_key)
                    .sign(input)
                    .to_vec(),
                Algorithm::Rs512 => pkcs1v15::SigningKey::<Sha512>::new(private_key)
                    .sign(input)
                    .to_vec(),
                _ => pkcs1v15::SigningKey::<Sha256>::new(private_key)
                    .sign(input)
                    .to_vec(),
            };
            Ok(signature)
        }
        Algorithm::Es256 => {
            let key = p256::ecdsa::SigningKey::from_pkcs8_der(private_der)
                .map_err(|e| anyhow!("failed to decode P-256 private key: {e}"))?;
            let signature: p256::ecdsa::Signature = key.sign(input);
            Ok(signature.to_bytes().to_vec())
        }
        Algorithm::Es384 => {
            let key = p384::ecdsa::SigningKey::from_pkcs8_der(private_der)
                .map_err(|e| anyhow!("failed to decode P-384 private key: {e}"))?;
            let signature: p384::ecdsa::Signature = key.sign(input);
            Ok(signature.to_bytes().to_vec())
        }
    }
}

fn decode_member(value: Option<&String>, name: &str) -> Result<Vec<u8>> {
    Base64UrlUnpadded::decode_vec(member(value, name)?)
        .map_err(|_| anyhow!("jwk member '{name}' is not base64url"))
}

fn sec1_point(jwk: &PublicJwk) -> Result<Vec<u8>> {
    let mut point = vec![0x04];
    point.extend(decode_member(jwk.x.as_ref(), "x")?);
    point.extend(decode_member(jwk.y.as_ref(), "y")?);
    Ok(point)
}

/// Check a JWS signature against a public JWK.
///
/// A signature that does not verify is `Ok(false)`; an unusable key is an error.
///
/// # Errors
/// Returns an error when the JWK cannot be turned into a key for `algorithm`.
pub fn verify(
    algorithm: Algorithm,
    jwk: &PublicJwk,
    input: &[u8],
    signature: &[u8],
) -> Result<bool> {
    if jwk.kty != algorithm.key_type() {
        bail!("{algorithm} cannot be verified with a {} key", jwk.kty);
    }
    match algorithm {
        Algorithm::Rs256 | Algorithm::Rs384 | Algorithm::Rs512 => {
            let n = BigUint::from_bytes_be(&decode_member(jwk.n.as_ref(), "n")?);
            let e = BigUint::from_bytes_be(&decode_member(jwk.e.as_ref(), "e")?);
            let public_key = RsaPublicKey::new(n, e).context("invalid RSA public key")?;
            let Ok(signature) = pkcs1v15::Signature::try_from(signature) else {
                return Ok(false);
            };
            let verified = match algorithm {
                Algorithm::Rs384 => pkcs1v15::VerifyingKey::<Sha384>::new(public_key)
                    .verify(input, &signature)
                    .is_ok(),
                Algorithm::Rs512 => pkcs1v15::VerifyingKey::<Sha512>::new(public_key)
                    .verify(input, &signature)
                    .is_ok(),
                _ => pkcs1v15::VerifyingKey::<Sha256>::new(public_key)
                    .verify(input, &signature)
                    .is_ok(),
            };
            Ok(verified)
        }
        Algorithm::Es256 => {
            let key = p256::ecdsa::VerifyingKey::from_sec1_bytes(&sec1_point(jwk)?)
                .map_err(|e| anyhow!("invalid P-256 public key: {e}"))?;
            let Ok(signature) = p256::ecdsa::Signature::from_slice(signature) else {
                return Ok(false);
            };
            Ok(key.verify(input, &signature).is_ok())
        }
        Algorithm::Es384 => {
            let key = p384::ecdsa::VerifyingKey::from_sec1_bytes(&sec1_point(jwk)?)
                .map_err(|e| anyhow!("invalid P-384 public key: {e}"))?;
            let Ok(signature) = p384::ecdsa::Signature::from_slice(signature) else {
                return Ok(false);
            };
            Ok(key.verify(input, &signature).is_ok())
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn rfc7638_example_thumbprint() {
        let jwk = PublicJwk {
            kty: "RSA".to_string(),
            kid: String::new(),
            key_use: None,
            alg: Some("RS256".to_string()),
            n: Some(
                "0vx7agoebGcQSuuPiLJXZptN9nndrQmbXEps2aiAFbWhM78LhWx4cbbfAAtVT86zwu1RK7aPFFxuhDR1L6tSoc_BJECPebWKRXjBZCiFV4n3oknjhMstn64tZ_2W-5JsGY4Hc5n9yBXArwl93lqt7_RN5w6Cf0h4QyQ5v-65YGjQR0_FDW2QvzqY368QQMicAtaSqzs8KJZgnYb9c7d0zgdAZHzu6qMQvRL5hajrn1n91CbOpbISD08qNLyrdkt-bFTWhAI4vMQFh6WeZu0fM4lFd2NcRwr3XPksINHaQ-G_xBniIqbw0Ls1jF44-csFCur-kEgU8awapJzKnqDKgw"
                    .to_string(),
            ),
            e: Some("AQAB".to_string()),
            crv: None,
            x: None,
            y: None,
        };
        assert_eq!(
            thumbprint(&jwk).unwrap(),
            "NzbLsXh8uDCcd-6MNwXF4W_7noWXFZAfHkxZsRGC9Xs"
        );
    }

    #[test]
    fn es256_sign_and_verify() {
        let key = SoftwareKeyGenerator::new()
            .generate(Algorithm::Es256)
            .unwrap();
        assert!(key.public_jwk.validate().is_ok());
        assert_eq!(key.public_jwk.kid, thumbprint(&key.public_jwk).unwrap());
        assert_eq!(key.public_jwk.crv.as_deref(), Some("P-256"));

        let signature = sign(Algorithm::Es256, &key.private_der, b"header.payload").unwrap();
        assert_eq!(signature.len(), 64);
        assert!(verify(Algorithm::Es256, &key.public_jwk, b"header.payload", &signature).unwrap());
        assert!(!verify(Algorithm::Es256, &key.public_jwk, b"header.other", &signature).unwrap());
    }

    #[test]
    fn es384_sign_and_verify() {
        let key = SoftwareKeyGenerator::new()
            .generate(Algorithm::Es384)
            .unwrap();
        let signature = sign(Algorithm::Es384, &key.private_der, b"input").unwrap();
        assert_eq!(signature.len(), 96);
        assert!(verify(Algorithm::Es384, &key.public_jwk, b"input", &signature).unwrap());
    }

    #[test]
    fn rsa_sign_and_verify() {
        let key = SoftwareKeyGenerator::new()
            .with_rsa_bits(1024)
            .generate(Algorithm::Rs512)
            .unwrap();
        assert_eq!(key.public_jwk.alg.as_deref(), Some("RS512"));
        assert_eq!(key.public_jwk.e.as_deref(), Some("AQAB"));

        let signature = sign(Algorithm::Rs512, &key.private_der, b"input").unwrap();
        assert!(verify(Algorithm::Rs512, &key.public_jwk, b"input", &signature).unwrap());
        // Same key, different digest.
        assert!(!verify(Algorithm::Rs256, &key.public_jwk, b"input", &signature).unwrap());
    }

    #[test]
    fn key_type_must_match_algorithm() {
        let key = SoftwareKeyGenerator::new()
            .generate(Algorithm::Es256)
            .unwrap();
        assert!(verify(Algorithm::Rs256, &key.public_jwk, b"x", &[0; 64]).is_err());
    }

    #[test]
    fn truncated_signature_does_not_verify() {
        let key = SoftwareKeyGenerator::new()
            .generate(Algorithm::Es256)
            .unwrap();
        assert!(!verify(Algorithm::Es256, &key.public_jwk, b"x", &[0; 10]).unwrap());
    }
}
