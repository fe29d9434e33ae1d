//! Refresh-token store and access-token blacklist ports, with in-memory adapters.

use super::claims::RefreshTokenRecord;
use crate::{clock::Clock, types::UserId};
use anyhow::Result;
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Duration, Utc};
use rand::{RngCore, rngs::OsRng};
use sha2::{Digest, Sha256};
use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
};
use tokio::sync::Mutex;

/// Storage key of a refresh value: lowercase hex SHA-256.
#[must_use]
pub fn refresh_key(value: &str) -> String {
    format!("{:x}", Sha256::digest(value.as_bytes()))
}

/// 128 random bits, URL-safe base64 without padding.
#[must_use]
pub fn new_refresh_value() -> String {
    let mut bytes = [0_u8; 16];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[async_trait]
pub trait RefreshStore: Send + Sync {
    /// Overwrites any existing record under `key`.
    async fn save(&self, key: &str, record: &RefreshTokenRecord, ttl: Duration) -> Result<()>;

    async fn load(&self, key: &str) -> Result<Option<RefreshTokenRecord>>;

    /// Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Atomically delete `old_key` and store `record` under `new_key`.
    ///
    /// Returns `false`, writing nothing, when `old_key` was already gone.
    async fn rotate(
        &self,
        old_key: &str,
        new_key: &str,
        record: &RefreshTokenRecord,
        ttl: Duration,
    ) -> Result<bool>;

    /// Returns how many records were removed.
    async fn delete_all_by_user(&self, user_id: UserId) -> Result<u64>;

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
pub trait TokenBlacklist: Send + Sync {
    async fn add(&self, token_id: &str, ttl: Duration) -> Result<()>;
    async fn is_blacklisted(&self, token_id: &str) -> Result<bool>;
}

#[derive(Default)]
struct Tables {
    refresh: HashMap<String, (RefreshTokenRecord, DateTime<Utc>)>,
    by_user: HashMap<UserId, HashSet<String>>,
    blacklist: HashMap<String, DateTime<Utc>>,
}

impl Tables {
    fn insert(&mut self, key: &str, record: &RefreshTokenRecord, expires_at: DateTime<Utc>) {
        self.by_user
            .entry(record.subject.user_id)
            .or_default()
            .insert(key.to_string());
        self.refresh
            .insert(key.to_string(), (record.clone(), expires_at));
    }

    fn remove(&mut self, key: &str) -> bool {
        let Some((record, _)) = self.refresh.remove(key) else {
            return false;
        };
        if let Some(keys) = self.by_user.get_mut(&record.subject.user_id) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_user.remove(&record.subject.user_id);
            }
        }
        true
    }

    /// Entries past their TTL behave as absent.
    fn expire(&mut self, key: &str, now: DateTime<Utc>) {
        if self
            .refresh
            .get(key)
            .is_some_and(|(_, expires_at)| *expires_at <= now)
        {
            self.remove(key);
        }
    }

    /// Drop every refresh record past its TTL, along with its user index entry.
    fn sweep(&mut self, now: DateTime<Utc>) {
        let expired: Vec<String> = self
            .refresh
            .iter()
            .filter(|(_, (_, expires_at))| *expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            self.remove(&key);
        }
    }
}

/// Single-process refresh store and blacklist; one mutex makes `rotate` atomic.
pub struct MemoryTokenStore {
    tables: Mutex<Tables>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for MemoryTokenStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryTokenStore").finish_non_exhaustive()
    }
}

impl MemoryTokenStore {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            clock,
        }
    }
}

#[async_trait]
impl RefreshStore for MemoryTokenStore {
    async fn save(&self, key: &str, record: &RefreshTokenRecord, ttl: Duration) -> Result<()> {
        let now = self.clock.now();
        let mut tables = self.tables.lock().await;
        tables.sweep(now);
        tables.remove(key);
        tables.insert(key, record, now + ttl);
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<RefreshTokenRecord>> {
        let now = self.clock.now();
        let mut tables = self.tables.lock().await;
        tables.expire(key, now);
        Ok(tables.refresh.get(key).map(|(record, _)| record.clone()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.tables.lock().await.remove(key);
        Ok(())
    }

    async fn rotate(
        &self,
        old_key: &str,
        new_key: &str,
        record: &RefreshTokenRecord,
        ttl: Duration,
    ) -> Result<bool> {
        let now = self.clock.now();
        let mut tables = self.tables.lock().await;
        tables.sweep(now);
        if !tables.remove(old_key) {
            return Ok(false);
        }
        tables.remove(new_key);
        tables.insert(new_key, record, now + ttl);
        Ok(true)
    }

    async fn delete_all_by_user(&self, user_id: UserId) -> Result<u64> {
        let now = self.clock.now();
        let mut tables = self.tables.lock().await;
        tables.sweep(now);
        let keys = tables.by_user.remove(&user_id).unwrap_or_default();
        let mut deleted = 0;
        for key in keys {
            if tables.refresh.remove(&key).is_some() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

#[async_trait]
impl TokenBlacklist for MemoryTokenStore {
    async fn add(&self, token_id: &str, ttl: Duration) -> Result<()> {
        let now = self.clock.now();
        let mut tables = self.tables.lock().await;
        tables.blacklist.retain(|_, until| *until > now);
        tables.blacklist.insert(token_id.to_string(), now + ttl);
        Ok(())
    }

    async fn is_blacklisted(&self, token_id: &str) -> Result<bool> {
        let now = self.clock.now();
        Ok(self
            .tables
            .lock()
            .await
            .blacklist
            .get(token_id)
            .is_some_and(|until| *until > now))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{clock::ManualClock, token::claims::Subject, types::AccountId};

    fn record(user: i64, token_id: &str, now: DateTime<Utc>) -> RefreshTokenRecord {
        RefreshTokenRecord {
            token_id: token_id.to_string(),
            expires_at: now + Duration::days(7),
            subject: Subject::new(UserId::new(user), AccountId::new(200)),
        }
    }

    #[test]
    fn refresh_values_are_128_bit() {
        let value = new_refresh_value();
        assert_eq!(value.len(), 22);
        assert_ne!(value, new_refresh_value());
        assert_eq!(refresh_key("abc").len(), 64);
        assert_eq!(
            refresh_key("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn rotate_is_single_use() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = MemoryTokenStore::new(clock.clone());
        let now = clock.now();
        store.save("old", &record(1, "t1", now), Duration::days(7)).await.unwrap();

        assert!(store.rotate("old", "new", &record(1, "t2", now), Duration::days(7)).await.unwrap());
        assert!(!store.rotate("old", "newer", &record(1, "t3", now), Duration::days(7)).await.unwrap());
        assert!(store.load("old").await.unwrap().is_none());
        assert_eq!(store.load("new").await.unwrap().unwrap().token_id, "t2");
        assert!(store.load("newer").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn records_expire_with_their_ttl() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = MemoryTokenStore::new(clock.clone());
        store
            .save("k", &record(1, "t1", clock.now()), Duration::minutes(1))
            .await
            .unwrap();
        clock.advance(Duration::minutes(2));
        assert!(store.load("k").await.unwrap().is_none());
        assert!(!store.rotate("k", "k2", &record(1, "t2", clock.now()), Duration::minutes(1)).await.unwrap());
    }

    #[tokio::test]
    async fn expired_records_are_evicted_on_write() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = MemoryTokenStore::new(clock.clone());
        for i in 0..100 {
            store
                .save(&format!("k{i}"), &record(i, "t", clock.now()), Duration::minutes(1))
                .await
                .unwrap();
        }
        clock.advance(Duration::days(30));
        store
            .save("fresh", &record(500, "t", clock.now()), Duration::minutes(1))
            .await
            .unwrap();

        let tables = store.tables.lock().await;
        assert_eq!(tables.refresh.len(), 1);
        assert!(tables.refresh.contains_key("fresh"));
        assert_eq!(tables.by_user.len(), 1);
        assert!(tables.by_user.contains_key(&UserId::new(500)));
    }

    #[tokio::test]
    async fn delete_all_by_user_only_touches_that_user() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = MemoryTokenStore::new(clock.clone());
        let now = clock.now();
        store.save("a1", &record(1, "t1", now), Duration::days(1)).await.unwrap();
        store.save("a2", &record(1, "t2", now), Duration::days(1)).await.unwrap();
        store.save("b1", &record(2, "t3", now), Duration::days(1)).await.unwrap();
        store.delete("missing").await.unwrap();

        assert_eq!(store.delete_all_by_user(UserId::new(1)).await.unwrap(), 2);
        assert!(store.load("a1").await.unwrap().is_none());
        assert!(store.load("b1").await.unwrap().is_some());
        assert_eq!(store.delete_all_by_user(UserId::new(1)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn blacklist_entries_lapse() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = MemoryTokenStore::new(clock.clone());
        store.add("jti", Duration::minutes(5)).await.unwrap();
        assert!(store.is_blacklisted("jti").await.unwrap());
        assert!(!store.is_blacklisted("other").await.unwrap());
        clock.advance(Duration::minutes(5));
        assert!(!store.is_blacklisted("jti").await.unwrap());
    }
}
