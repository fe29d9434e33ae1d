//! Existence and status lookups against the user aggregate.

use crate::types::UserId;
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{Instrument, info_span};

#[async_trait]
pub trait UserStatusLookup: Send + Sync {
    async fn exists(&self, user_id: UserId) -> Result<bool>;
    async fn is_active(&self, user_id: UserId) -> Result<bool>;
}

/// Treats every user as existing and active; for deployments without a user module.
#[derive(Clone, Debug)]
pub struct AllowAllUsers;

#[async_trait]
impl UserStatusLookup for AllowAllUsers {
    async fn exists(&self, _user_id: UserId) -> Result<bool> {
        Ok(true)
    }

    async fn is_active(&self, _user_id: UserId) -> Result<bool> {
        Ok(true)
    }
}

#[derive(Debug, Default)]
pub struct MemoryUserDirectory {
    users: RwLock<HashMap<UserId, bool>>,
}

impl MemoryUserDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_user(&self, user_id: UserId, active: bool) {
        self.users.write().await.insert(user_id, active);
    }
}

#[async_trait]
impl UserStatusLookup for MemoryUserDirectory {
    async fn exists(&self, user_id: UserId) -> Result<bool> {
        Ok(self.users.read().await.contains_key(&user_id))
    }

    async fn is_active(&self, user_id: UserId) -> Result<bool> {
        Ok(self.users.read().await.get(&user_id).copied().unwrap_or(false))
    }
}

/// Reads `users.status`; a user is active when the status is `active`.
#[derive(Clone, Debug)]
pub struct PgUserStatusLookup {
    pool: PgPool,
}

impl PgUserStatusLookup {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn status(&self, user_id: UserId) -> Result<Option<String>> {
        let query = "SELECT status FROM users WHERE id = $1";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(user_id.get())
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("Failed to fetch user status")?;
        row.map(|row| row.try_get::<String, _>("status"))
            .transpose()
            .context("Failed to decode user status")
    }
}

#[async_trait]
impl UserStatusLookup for PgUserStatusLookup {
    async fn exists(&self, user_id: UserId) -> Result<bool> {
        Ok(self.status(user_id).await?.is_some())
    }

    async fn is_active(&self, user_id: UserId) -> Result<bool> {
        Ok(self.status(user_id).await?.as_deref() == Some("active"))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_directory_reports_status() {
        let users = MemoryUserDirectory::new();
        users.set_user(UserId::new(1), true).await;
        users.set_user(UserId::new(2), false).await;
        assert!(users.exists(UserId::new(1)).await.unwrap());
        assert!(users.is_active(UserId::new(1)).await.unwrap());
        assert!(users.exists(UserId::new(2)).await.unwrap());
        assert!(!users.is_active(UserId::new(2)).await.unwrap());
        assert!(!users.exists(UserId::new(3)).await.unwrap());
    }

    #[tokio::test]
    async fn allow_all_users() {
        assert!(AllowAllUsers.is_active(UserId::new(99)).await.unwrap());
    }
}
