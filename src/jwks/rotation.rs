//! Scheduled rotation helpers. Nothing here runs on its own; an operator or
//! an external scheduler calls [`KeyManager::rotate_key`] when
//! [`KeyManager::should_rotate`] says so.

use super::{
    key::{KeyInfo, KeyStatus, SigningKey},
    manager::KeyManager,
};
use crate::{Error, Result, types::Kid};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, instrument, warn};
use utoipa::ToSchema;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RotationPolicy {
    rotation_interval: Duration,
    grace_period: Duration,
    max_keys_in_jwks: usize,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            rotation_interval: Duration::days(30),
            grace_period: Duration::days(7),
            max_keys_in_jwks: 3,
        }
    }
}

impl RotationPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn with_rotation_interval(mut self, interval: Duration) -> Self {
        self.rotation_interval = interval;
        self
    }

    #[must_use]
    pub const fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    /// Upper bound on active plus grace keys left published after a rotation.
    #[must_use]
    pub const fn with_max_keys_in_jwks(mut self, max: usize) -> Self {
        self.max_keys_in_jwks = max;
        self
    }

    #[must_use]
    pub const fn rotation_interval(&self) -> Duration {
        self.rotation_interval
    }

    #[must_use]
    pub const fn grace_period(&self) -> Duration {
        self.grace_period
    }

    #[must_use]
    pub const fn max_keys_in_jwks(&self) -> usize {
        self.max_keys_in_jwks
    }

    /// # Errors
    /// Returns `invalid-argument` for non-positive durations, a grace period
    /// not shorter than the interval, or fewer than two published keys.
    pub fn validate(&self) -> Result<()> {
        if self.rotation_interval <= Duration::zero() {
            return Err(Error::invalid_argument("rotation interval must be positive"));
        }
        if self.grace_period <= Duration::zero() {
            return Err(Error::invalid_argument("grace period must be positive"));
        }
        if self.grace_period >= self.rotation_interval {
            return Err(Error::invalid_argument(
                "grace period must be shorter than the rotation interval",
            ));
        }
        if self.max_keys_in_jwks < 2 {
            return Err(Error::invalid_argument("max keys in JWKS must be at least 2"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RotationStatus {
    #[schema(value_type = Option<String>)]
    pub active_kid: Option<Kid>,
    pub active_since: Option<DateTime<Utc>>,
    pub next_rotation_at: Option<DateTime<Utc>>,
    #[schema(value_type = Vec<String>)]
    pub grace_keys: Vec<Kid>,
    pub retired_keys: usize,
    pub rotation_interval_seconds: i64,
    pub grace_period_seconds: i64,
    pub max_keys_in_jwks: usize,
}

impl KeyManager {
    /// Demote every active key, create a fresh one valid for one interval plus
    /// the grace period, then trim grace keys and drop expired retired ones.
    ///
    /// Trimming and cleanup failures are logged; the new key is returned anyway.
    ///
    /// # Errors
    /// Storage or generation failures before the new key is saved.
    #[instrument(skip(self))]
    pub async fn rotate_key(&self) -> Result<KeyInfo> {
        let policy = *self.config.rotation();
        let now = self.clock.now();

        for mut active in self.store.find_by_status(KeyStatus::Active).await? {
            active.enter_grace(now)?;
            self.store.update(&active).await?;
        }

        let key = self
            .create_key(
                None,
                Some(now),
                Some(now + policy.rotation_interval() + policy.grace_period()),
            )
            .await?;

        if let Err(err) = self.retire_excess_grace(policy.max_keys_in_jwks()).await {
            warn!(error = %err, "failed to retire excess grace keys");
        }
        if let Err(err) = self.cleanup().await {
            warn!(error = %err, "failed to clean up expired keys");
        }
        self.invalidate().await;

        info!(kid = %key.kid, "signing keys rotated");
        Ok(key)
    }

    /// `true` when nothing is active or the active key is one interval old.
    ///
    /// # Errors
    /// Storage failures.
    pub async fn should_rotate(&self) -> Result<bool> {
        let now = self.clock.now();
        let interval = self.config.rotation().rotation_interval();
        let active = self.store.find_by_status(KeyStatus::Active).await?;
        Ok(active.is_empty()
            || active
                .iter()
                .any(|key| now - key.info().not_before >= interval))
    }

    /// # Errors
    /// Storage failures.
    pub async fn rotation_status(&self) -> Result<RotationStatus> {
        let policy = *self.config.rotation();
        let active = self.store.find_by_status(KeyStatus::Active).await?;
        let grace = self.store.find_by_status(KeyStatus::Grace).await?;
        let retired = self.store.find_by_status(KeyStatus::Retired).await?;

        let newest = active.last().map(SigningKey::info);
        Ok(RotationStatus {
            active_kid: newest.map(|info| info.kid.clone()),
            active_since: newest.map(|info| info.not_before),
            next_rotation_at: newest.map(|info| info.not_before + policy.rotation_interval()),
            grace_keys: grace.iter().map(|key| key.kid().clone()).collect(),
            retired_keys: retired.len(),
            rotation_interval_seconds: policy.rotation_interval().num_seconds(),
            grace_period_seconds: policy.grace_period().num_seconds(),
            max_keys_in_jwks: policy.max_keys_in_jwks(),
        })
    }

    async fn retire_excess_grace(&self, max_keys: usize) -> Result<()> {
        let now = self.clock.now();
        let active = self.store.find_by_status(KeyStatus::Active).await?.len();
        let grace = self.store.find_by_status(KeyStatus::Grace).await?;
        let allowed = max_keys.saturating_sub(active);
        let excess = grace.len().saturating_sub(allowed);

        // Oldest first.
        for mut key in grace.into_iter().take(excess) {
            key.retire(now)?;
            self.store.update(&key).await?;
            info!(kid = %key.kid(), "grace key retired by rotation");
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{
        clock::{Clock, ManualClock},
        jwks::{
            crypto::SoftwareKeyGenerator,
            key::Algorithm,
            manager::KeyManagerConfig,
            store::{KeyStore, MemoryKeyStore},
        },
    };
    use std::sync::Arc;

    fn manager(policy: RotationPolicy) -> (KeyManager, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let manager = KeyManager::new(
            Arc::new(MemoryKeyStore::new()),
            Arc::new(SoftwareKeyGenerator::new()),
            clock.clone(),
            KeyManagerConfig::new()
                .with_algorithm(Algorithm::Es256)
                .with_rotation(policy),
        );
        (manager, clock)
    }

    #[test]
    fn policy_validation() {
        assert!(RotationPolicy::default().validate().is_ok());
        assert!(
            RotationPolicy::new()
                .with_grace_period(Duration::days(30))
                .validate()
                .is_err()
        );
        assert!(
            RotationPolicy::new()
                .with_rotation_interval(Duration::zero())
                .validate()
                .is_err()
        );
        assert!(RotationPolicy::new().with_max_keys_in_jwks(1).validate().is_err());
    }

    #[tokio::test]
    async fn should_rotate_tracks_active_key_age() {
        let (manager, clock) = manager(RotationPolicy::default());
        assert!(manager.should_rotate().await.unwrap());

        manager.rotate_key().await.unwrap();
        assert!(!manager.should_rotate().await.unwrap());

        clock.advance(Duration::days(30));
        assert!(manager.should_rotate().await.unwrap());
    }

    #[tokio::test]
    async fn rotation_keeps_the_published_set_bounded() {
        let (manager, clock) = manager(RotationPolicy::default());
        let mut kids = Vec::new();
        for _ in 0..4 {
            kids.push(manager.rotate_key().await.unwrap().kid);
            clock.advance(Duration::seconds(1));
        }

        let status = manager.rotation_status().await.unwrap();
        assert_eq!(status.active_kid.as_ref(), kids.last());
        assert_eq!(status.grace_keys, vec![kids[1].clone(), kids[2].clone()]);
        assert_eq!(status.retired_keys, 1);
        assert_eq!(
            status.next_rotation_at,
            status.active_since.map(|at| at + Duration::days(30))
        );

        let (jwks, _) = manager.build_jwks().await.unwrap();
        assert_eq!(jwks.keys.len(), 3);
        assert!(jwks.find_by_kid(kids[0].as_str()).is_none());
    }

    #[tokio::test]
    async fn rotated_keys_expire_and_get_cleaned_up() {
        let (manager, clock) = manager(RotationPolicy::new().with_max_keys_in_jwks(2));
        let first = manager.rotate_key().await.unwrap();
        assert_eq!(
            first.not_after,
            Some(clock.now() + Duration::days(30) + Duration::days(7))
        );
        for _ in 0..2 {
            clock.advance(Duration::seconds(1));
            manager.rotate_key().await.unwrap();
        }
        assert_eq!(
            manager.get_key(&first.kid).await.unwrap().status,
            KeyStatus::Retired
        );

        clock.advance(Duration::days(38));
        manager.rotate_key().await.unwrap();
        assert_eq!(
            manager.get_key(&first.kid).await.unwrap_err().kind(),
            crate::ErrorKind::NotFound
        );
        assert!(manager.store.find_by_kid(&first.kid).await.unwrap().is_none());
    }
}
