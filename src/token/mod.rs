//! Access and refresh token lifecycle.

pub mod claims;
pub mod engine;
pub mod jws;
#[cfg(feature = "redis")]
pub mod redis_store;
pub mod store;

pub use claims::{AccessClaims, RefreshTokenRecord, Subject, TokenPair};
pub use engine::{TokenConfig, TokenEngine};
#[cfg(feature = "redis")]
pub use redis_store::RedisTokenStore;
pub use store::{MemoryTokenStore, RefreshStore, TokenBlacklist};
