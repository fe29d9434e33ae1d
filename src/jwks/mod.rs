//! Signing keys: generation, lifecycle, storage, and the published JWKS.

pub mod crypto;
pub mod key;
pub mod manager;
pub mod postgres;
pub mod rotation;
pub mod store;

pub use crypto::{GeneratedKey, KeyGenerator, SoftwareKeyGenerator, thumbprint};
pub use key::{Algorithm, KeyInfo, KeyStatus, PublicJwk, SigningKey};
pub use manager::{ActiveSigner, CacheTag, Jwks, KeyList, KeyManager, KeyManagerConfig};
pub use postgres::PgKeyStore;
pub use rotation::{RotationPolicy, RotationStatus};
pub use store::{KeyPage, KeyStore, MemoryKeyStore};
