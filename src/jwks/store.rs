//! Signing-key persistence port and its in-memory implementation.

use super::key::{KeyStatus, SigningKey};
use crate::{Error, types::Kid};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// One page of keys plus the number of keys matching the filter.
#[derive(Clone, Debug)]
pub struct KeyPage {
    pub keys: Vec<SigningKey>,
    pub total: u64,
}

/// Listings are ordered oldest first (`created_at`, then `kid`).
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Fails with `invalid-argument` when the kid is taken.
    async fn save(&self, key: &SigningKey) -> Result<()>;

    /// Persist status and `updated_at`; fails with `not-found` for an unknown kid.
    async fn update(&self, key: &SigningKey) -> Result<()>;

    /// Returns `false` when nothing was deleted.
    async fn delete(&self, kid: &Kid) -> Result<bool>;

    async fn find_by_kid(&self, kid: &Kid) -> Result<Option<SigningKey>>;

    async fn find_by_status(&self, status: KeyStatus) -> Result<Vec<SigningKey>>;

    async fn find_page(&self, status: Option<KeyStatus>, limit: u32, offset: u32) -> Result<KeyPage>;

    /// Delete retired keys whose `not_after` is before `now`.
    async fn delete_expired_retired(&self, now: DateTime<Utc>) -> Result<u64>;

    /// Cheap reachability probe for `/health`.
    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    keys: RwLock<HashMap<Kid, SigningKey>>,
}

impl MemoryKeyStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn sorted(mut keys: Vec<SigningKey>) -> Vec<SigningKey> {
    keys.sort_by(|a, b| {
        a.info()
            .created_at
            .cmp(&b.info().created_at)
            .then_with(|| a.kid().cmp(b.kid()))
    });
    keys
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn save(&self, key: &SigningKey) -> Result<()> {
        let mut keys = self.keys.write().await;
        if keys.contains_key(key.kid()) {
            return Err(Error::invalid_argument(format!("key {} already exists", key.kid())).into());
        }
        keys.insert(key.kid().clone(), key.clone());
        Ok(())
    }

    async fn update(&self, key: &SigningKey) -> Result<()> {
        let mut keys = self.keys.write().await;
        let Some(stored) = keys.get_mut(key.kid()) else {
            return Err(Error::not_found(format!("key {} not found", key.kid())).into());
        };
        *stored = key.clone();
        Ok(())
    }

    async fn delete(&self, kid: &Kid) -> Result<bool> {
        Ok(self.keys.write().await.remove(kid).is_some())
    }

    async fn find_by_kid(&self, kid: &Kid) -> Result<Option<SigningKey>> {
        Ok(self.keys.read().await.get(kid).cloned())
    }

    async fn find_by_status(&self, status: KeyStatus) -> Result<Vec<SigningKey>> {
        let keys = self.keys.read().await;
        Ok(sorted(
            keys.values()
                .filter(|key| key.status() == status)
                .cloned()
                .collect(),
        ))
    }

    async fn find_page(&self, status: Option<KeyStatus>, limit: u32, offset: u32) -> Result<KeyPage> {
        let keys = self.keys.read().await;
        let matching = sorted(
            keys.values()
                .filter(|key| status.is_none_or(|s| key.status() == s))
                .cloned()
                .collect(),
        );
        let total = matching.len() as u64;
        let keys = matching
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect();
        Ok(KeyPage { keys, total })
    }

    async fn delete_expired_retired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut keys = self.keys.write().await;
        let before = keys.len();
        keys.retain(|_, key| {
            !(key.status() == KeyStatus::Retired
                && key.info().not_after.is_some_and(|not_after| not_after < now))
        });
        Ok((before - keys.len()) as u64)
    }
}
