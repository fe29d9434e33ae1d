//! Redis refresh store and blacklist (`redis` feature).
//!
//! Keys: `refresh_token:{sha256}` holds the JSON record, `token_blacklist:{jti}`
//! a sentinel, and `refresh_tokens_by_user:{user_id}` the set of a user's
//! refresh keys for logout-everywhere. All carry TTLs.

use super::{
    claims::RefreshTokenRecord,
    store::{RefreshStore, TokenBlacklist},
};
use crate::types::UserId;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Duration;
use redis::{AsyncCommands, Script, aio::ConnectionManager};
use std::{fmt, sync::LazyLock};
use tracing::{debug, warn};

const REFRESH_PREFIX: &str = "refresh_token:";
const BLACKLIST_PREFIX: &str = "token_blacklist:";
const USER_INDEX_PREFIX: &str = "refresh_tokens_by_user:";

/// KEYS: old record, new record, user index. ARGV: payload, ttl, new key, old key.
static ROTATE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
if redis.call('DEL', KEYS[1]) == 0 then
  return 0
end
redis.call('SET', KEYS[2], ARGV[1], 'EX', ARGV[2])
redis.call('SREM', KEYS[3], ARGV[4])
redis.call('SADD', KEYS[3], ARGV[3])
redis.call('EXPIRE', KEYS[3], ARGV[2])
return 1
",
    )
});

/// KEYS: user index. ARGV: record key prefix.
static DELETE_ALL: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
local deleted = 0
for _, key in ipairs(redis.call('SMEMBERS', KEYS[1])) do
  deleted = deleted + redis.call('DEL', ARGV[1] .. key)
end
redis.call('DEL', KEYS[1])
return deleted
",
    )
});

#[derive(Clone)]
pub struct RedisTokenStore {
    conn: ConnectionManager,
}

impl fmt::Debug for RedisTokenStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisTokenStore").finish_non_exhaustive()
    }
}

fn ttl_seconds(ttl: Duration) -> u64 {
    u64::try_from(ttl.num_seconds()).unwrap_or(0).max(1)
}

fn user_index(user_id: UserId) -> String {
    format!("{USER_INDEX_PREFIX}{user_id}")
}

impl RedisTokenStore {
    /// # Errors
    /// Returns an error if the URL is invalid or the server is unreachable.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("Failed to create Redis client")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("Failed to connect to Redis")?;
        debug!("redis token store connected");
        Ok(Self { conn })
    }
}

#[async_trait]
impl RefreshStore for RedisTokenStore {
    async fn save(&self, key: &str, record: &RefreshTokenRecord, ttl: Duration) -> Result<()> {
        let payload = serde_json::to_string(record).context("Failed to encode refresh record")?;
        let ttl = ttl_seconds(ttl);
        let index = user_index(record.subject.user_id);
        let mut conn = self.conn.clone();
        let (): () = redis::pipe()
            .atomic()
            .set_ex(format!("{REFRESH_PREFIX}{key}"), payload, ttl)
            .ignore()
            .sadd(&index, key)
            .ignore()
            .expire(&index, i64::try_from(ttl).unwrap_or(i64::MAX))
            .ignore()
            .query_async(&mut conn)
            .await
            .context("Failed to save refresh token")?;
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<RefreshTokenRecord>> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = conn
            .get(format!("{REFRESH_PREFIX}{key}"))
            .await
            .context("Failed to load refresh token")?;
        payload
            .map(|payload| serde_json::from_str(&payload))
            .transpose()
            .context("Failed to decode refresh record")
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .del(format!("{REFRESH_PREFIX}{key}"))
            .await
            .context("Failed to delete refresh token")?;
        Ok(())
    }

    async fn rotate(
        &self,
        old_key: &str,
        new_key: &str,
        record: &RefreshTokenRecord,
        ttl: Duration,
    ) -> Result<bool> {
        let payload = serde_json::to_string(record).context("Failed to encode refresh record")?;
        let mut conn = self.conn.clone();
        let rotated: i64 = ROTATE
            .key(format!("{REFRESH_PREFIX}{old_key}"))
            .key(format!("{REFRESH_PREFIX}{new_key}"))
            .key(user_index(record.subject.user_id))
            .arg(payload)
            .arg(ttl_seconds(ttl))
            .arg(new_key)
            .arg(old_key)
            .invoke_async(&mut conn)
            .await
            .context("Failed to rotate refresh token")?;
        if rotated == 0 {
            warn!(user_id = %record.subject.user_id, "refresh token already rotated");
        }
        Ok(rotated == 1)
    }

    async fn delete_all_by_user(&self, user_id: UserId) -> Result<u64> {
        let mut conn = self.conn.clone();
        let deleted: u64 = DELETE_ALL
            .key(user_index(user_id))
            .arg(REFRESH_PREFIX)
            .invoke_async(&mut conn)
            .await
            .context("Failed to delete refresh tokens for user")?;
        Ok(deleted)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .context("Redis ping failed")?;
        Ok(())
    }
}

#[async_trait]
impl TokenBlacklist for RedisTokenStore {
    async fn add(&self, token_id: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let (): () = conn
            .set_ex(format!("{BLACKLIST_PREFIX}{token_id}"), "1", ttl_seconds(ttl))
            .await
            .context("Failed to blacklist token")?;
        Ok(())
    }

    async fn is_blacklisted(&self, token_id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        conn.exists(format!("{BLACKLIST_PREFIX}{token_id}"))
            .await
            .context("Failed to check token blacklist")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{
        token::{
            claims::Subject,
            store::{new_refresh_value, refresh_key},
        },
        types::AccountId,
    };
    use chrono::Utc;

    async fn store() -> Option<RedisTokenStore> {
        let url = std::env::var("REDIS_URL").ok()?;
        RedisTokenStore::connect(&url).await.ok()
    }

    #[tokio::test]
    async fn rotate_is_single_use() {
        let Some(store) = store().await else {
            eprintln!("REDIS_URL not set, skipping");
            return;
        };
        let user = UserId::new(Utc::now().timestamp_micros());
        let record = RefreshTokenRecord {
            token_id: ulid::Ulid::new().to_string(),
            expires_at: Utc::now() + Duration::minutes(5),
            subject: Subject::new(user, AccountId::new(1)),
        };
        let old = refresh_key(&new_refresh_value());
        let new = refresh_key(&new_refresh_value());
        store.save(&old, &record, Duration::minutes(5)).await.unwrap();
        assert_eq!(store.load(&old).await.unwrap(), Some(record.clone()));

        assert!(store.rotate(&old, &new, &record, Duration::minutes(5)).await.unwrap());
        assert!(!store.rotate(&old, &new, &record, Duration::minutes(5)).await.unwrap());
        assert_eq!(store.delete_all_by_user(user).await.unwrap(), 1);
        assert!(store.load(&new).await.unwrap().is_none());

        store.add(&record.token_id, Duration::minutes(1)).await.unwrap();
        assert!(store.is_blacklisted(&record.token_id).await.unwrap());
    }
}
