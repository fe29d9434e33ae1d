//! Signing-key manager: lifecycle transitions, the active signer, and the
//! published JWKS with its cache tag.

use super::{
    crypto::{self, KeyGenerator},
    key::{Algorithm, KeyInfo, KeyStatus, PublicJwk, SigningKey},
    rotation::RotationPolicy,
    store::KeyStore,
};
use crate::{Error, ErrorKind, Result, clock::Clock, types::Kid};
use anyhow::Context;
use chrono::{DateTime, Duration, SubsecRound, Utc};
use secrecy::{ExposeSecret, SecretSlice};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{
    fmt,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};
use utoipa::ToSchema;

pub const DEFAULT_LIST_LIMIT: u32 = 20;
pub const MAX_LIST_LIMIT: u32 = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyManagerConfig {
    algorithm: Algorithm,
    key_refresh_interval: Duration,
    unknown_kid_cooldown: Duration,
    rotation: RotationPolicy,
}

impl Default for KeyManagerConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::Rs256,
            key_refresh_interval: Duration::minutes(5),
            unknown_kid_cooldown: Duration::seconds(10),
            rotation: RotationPolicy::default(),
        }
    }
}

impl KeyManagerConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Algorithm for new keys and the preferred signer.
    #[must_use]
    pub const fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    #[must_use]
    pub const fn with_key_refresh_interval(mut self, interval: Duration) -> Self {
        self.key_refresh_interval = interval;
        self
    }

    #[must_use]
    pub const fn with_unknown_kid_cooldown(mut self, cooldown: Duration) -> Self {
        self.unknown_kid_cooldown = cooldown;
        self
    }

    #[must_use]
    pub const fn with_rotation(mut self, rotation: RotationPolicy) -> Self {
        self.rotation = rotation;
        self
    }

    #[must_use]
    pub const fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    #[must_use]
    pub const fn key_refresh_interval(&self) -> Duration {
        self.key_refresh_interval
    }

    #[must_use]
    pub const fn unknown_kid_cooldown(&self) -> Duration {
        self.unknown_kid_cooldown
    }

    #[must_use]
    pub const fn rotation(&self) -> &RotationPolicy {
        &self.rotation
    }
}

/// `{keys: [...]}` as served at `/.well-known/jwks.json`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Jwks {
    pub keys: Vec<PublicJwk>,
}

impl Jwks {
    #[must_use]
    pub fn find_by_kid(&self, kid: &str) -> Option<&PublicJwk> {
        self.keys.iter().find(|k| k.kid == kid)
    }
}

/// HTTP validators for the published set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheTag {
    /// Quoted strong entity tag.
    pub etag: String,
    pub last_modified: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct KeyList {
    pub keys: Vec<KeyInfo>,
    pub total: u64,
    pub limit: u32,
    pub offset: u32,
}

/// The key new tokens are signed with.
#[derive(Clone)]
pub struct ActiveSigner {
    kid: Kid,
    algorithm: Algorithm,
    private_der: Arc<SecretSlice<u8>>,
}

impl fmt::Debug for ActiveSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveSigner")
            .field("kid", &self.kid)
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

impl ActiveSigner {
    #[must_use]
    pub const fn kid(&self) -> &Kid {
        &self.kid
    }

    #[must_use]
    pub const fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// # Errors
    /// Returns an error when the private key cannot be decoded.
    pub fn sign(&self, input: &[u8]) -> anyhow::Result<Vec<u8>> {
        crypto::sign(self.algorithm, self.private_der.expose_secret(), input)
    }
}

/// Active and grace keys as last read from the store, sorted by kid.
#[derive(Debug)]
struct Snapshot {
    keys: Vec<KeyInfo>,
    loaded_at: DateTime<Utc>,
}

pub struct KeyManager {
    pub(super) store: Arc<dyn KeyStore>,
    generator: Arc<dyn KeyGenerator>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) config: KeyManagerConfig,
    snapshot: RwLock<Option<Arc<Snapshot>>>,
    tag: Mutex<Option<CacheTag>>,
    last_unknown_kid_refresh: AtomicU64,
}

impl fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn signable(info: &KeyInfo, now: DateTime<Utc>) -> bool {
    info.status == KeyStatus::Active && info.is_published(now)
}

impl KeyManager {
    #[must_use]
    pub fn new(
        store: Arc<dyn KeyStore>,
        generator: Arc<dyn KeyGenerator>,
        clock: Arc<dyn Clock>,
        config: KeyManagerConfig,
    ) -> Self {
        Self {
            store,
            generator,
            clock,
            config,
            snapshot: RwLock::new(None),
            tag: Mutex::new(None),
            last_unknown_kid_refresh: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &KeyManagerConfig {
        &self.config
    }

    /// Generate and store a new active key. When the key can sign immediately,
    /// the current active key of the same algorithm moves to grace first; a
    /// future-dated key leaves it signing until the new window opens.
    ///
    /// # Errors
    /// `invalid-argument` when `not_after` is not after `not_before`.
    #[instrument(skip(self))]
    pub async fn create_key(
        &self,
        algorithm: Option<Algorithm>,
        not_before: Option<DateTime<Utc>>,
        not_after: Option<DateTime<Utc>>,
    ) -> Result<KeyInfo> {
        let algorithm = algorithm.unwrap_or(self.config.algorithm);
        let now = self.clock.now();
        let not_before = not_before.unwrap_or(now);
        if let Some(not_after) = not_after
            && not_after <= not_before
        {
            return Err(Error::invalid_argument("notAfter must be after notBefore"));
        }

        let generator = self.generator.clone();
        let generated = tokio::task::spawn_blocking(move || generator.generate(algorithm))
            .await
            .context("Key generation task failed")??;
        let key = SigningKey::new(
            KeyInfo {
                kid: Kid::new(generated.public_jwk.kid.clone())?,
                algorithm,
                status: KeyStatus::Active,
                not_before,
                not_after,
                public_jwk: generated.public_jwk,
                created_at: now,
                updated_at: now,
            },
            generated.private_der,
        )?;

        let demote = not_before <= now;
        for mut previous in self.store.find_by_status(KeyStatus::Active).await? {
            if !demote || previous.algorithm() != algorithm {
                continue;
            }
            previous.enter_grace(now)?;
            self.store.update(&previous).await?;
            info!(kid = %previous.kid(), "previous active key moved to grace");
        }
        self.store.save(&key).await?;
        self.invalidate().await;

        info!(
            kid = %key.kid(),
            algorithm = %algorithm,
            not_before = %not_before,
            not_after = ?not_after,
            "signing key created"
        );
        Ok(key.into_info())
    }

    /// `active → grace`: stops signing with the key, keeps it published.
    ///
    /// # Errors
    /// `not-found` or `invalid-state-transition`.
    #[instrument(skip(self))]
    pub async fn enter_grace(&self, kid: &Kid) -> Result<KeyInfo> {
        let mut key = self.load(kid).await?;
        key.enter_grace(self.clock.now())?;
        self.store.update(&key).await?;
        self.invalidate().await;
        info!(kid = %kid, "signing key entered grace");
        Ok(key.into_info())
    }

    /// `grace → retired`; retiring a retired key is a no-op.
    ///
    /// # Errors
    /// `not-found`, or `invalid-state-transition` for an active key.
    #[instrument(skip(self))]
    pub async fn retire(&self, kid: &Kid) -> Result<KeyInfo> {
        let mut key = self.load(kid).await?;
        if key.retire(self.clock.now())? {
            self.store.update(&key).await?;
            self.invalidate().await;
            info!(kid = %kid, "signing key retired");
        }
        Ok(key.into_info())
    }

    /// Retire from any state, for compromised keys.
    ///
    /// # Errors
    /// `not-found`.
    #[instrument(skip(self))]
    pub async fn force_retire(&self, kid: &Kid) -> Result<KeyInfo> {
        let mut key = self.load(kid).await?;
        if key.force_retire(self.clock.now()) {
            self.store.update(&key).await?;
            self.invalidate().await;
            warn!(kid = %kid, "signing key force-retired");
        }
        Ok(key.into_info())
    }

    /// Delete retired keys past `not_after`; returns how many were removed.
    ///
    /// # Errors
    /// Storage failures.
    #[instrument(skip(self))]
    pub async fn cleanup(&self) -> Result<u64> {
        let deleted = self
            .store
            .delete_expired_retired(self.clock.now())
            .await?;
        if deleted > 0 {
            info!(deleted, "expired signing keys deleted");
        }
        Ok(deleted)
    }

    /// The signer for new tokens: among signable active keys, the one whose
    /// window opened last (then the newest), preferring the configured algorithm.
    ///
    /// Reads the store directly so a key moved to grace elsewhere stops signing here too.
    ///
    /// # Errors
    /// `no-active-key` when nothing can sign.
    pub async fn active_signer(&self) -> Result<ActiveSigner> {
        let now = self.clock.now();
        let active: Vec<SigningKey> = self
            .store
            .find_by_status(KeyStatus::Active)
            .await?
            .into_iter()
            .filter(|key| signable(key.info(), now))
            .collect();
        let latest = |key: &&SigningKey| (key.info().not_before, key.info().created_at);
        let chosen = active
            .iter()
            .filter(|key| key.algorithm() == self.config.algorithm)
            .max_by_key(latest)
            .or_else(|| active.iter().max_by_key(latest))
            .ok_or_else(|| Error::new(ErrorKind::NoActiveKey, "no active signing key"))?;
        Ok(ActiveSigner {
            kid: chosen.kid().clone(),
            algorithm: chosen.algorithm(),
            private_der: chosen.private_handle(),
        })
    }

    /// Published key for `kid`, refreshing the snapshot once (rate limited)
    /// when the kid is unknown.
    ///
    /// # Errors
    /// Storage failures on the first load.
    pub async fn published_key(&self, kid: &str) -> Result<Option<KeyInfo>> {
        let now = self.clock.now();
        let snapshot = self.snapshot().await?;
        if let Some(found) = find_published(&snapshot, kid, now) {
            return Ok(Some(found));
        }
        if !self.refresh_on_unknown_kid(now) {
            return Ok(None);
        }
        debug!(kid, "unknown kid, refreshing published keys");
        let snapshot = self.reload().await?;
        Ok(find_published(&snapshot, kid, self.clock.now()))
    }

    /// The published JWKS and its cache validators.
    ///
    /// The entity tag is a digest over the published keys sorted by kid with
    /// their validity windows; `last_modified` moves only when the tag does.
    ///
    /// # Errors
    /// Storage failures on the first load.
    pub async fn build_jwks(&self) -> Result<(Jwks, CacheTag)> {
        let now = self.clock.now();
        let snapshot = self.snapshot().await?;
        let published: Vec<&KeyInfo> = snapshot
            .keys
            .iter()
            .filter(|info| info.is_published(now))
            .collect();

        let mut hasher = Sha256::new();
        for info in &published {
            hasher.update(info.kid.as_str().as_bytes());
            hasher.update(b"|");
            hasher.update(info.not_before.timestamp().to_be_bytes());
            hasher.update(b"|");
            hasher.update(
                info.not_after
                    .map_or(i64::MAX, |not_after| not_after.timestamp())
                    .to_be_bytes(),
            );
            hasher.update(b";");
        }
        let etag = format!("\"{:x}\"", hasher.finalize());

        let tag = {
            let mut current = self.tag.lock().unwrap_or_else(PoisonError::into_inner);
            match current.as_ref() {
                Some(tag) if tag.etag == etag => tag.clone(),
                _ => {
                    let tag = CacheTag {
                        etag,
                        last_modified: now.trunc_subsecs(0),
                    };
                    *current = Some(tag.clone());
                    tag
                }
            }
        };
        let jwks = Jwks {
            keys: published
                .into_iter()
                .map(|info| info.public_jwk.clone())
                .collect(),
        };
        Ok((jwks, tag))
    }

    /// # Errors
    /// Storage failures.
    pub async fn list_keys(
        &self,
        status: Option<KeyStatus>,
        limit: Option<u32>,
        offset: Option<u32>,
    ) -> Result<KeyList> {
        let limit = limit
            .filter(|limit| *limit > 0)
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .min(MAX_LIST_LIMIT);
        let offset = offset.unwrap_or(0);
        let page = self.store.find_page(status, limit, offset).await?;
        Ok(KeyList {
            keys: page.keys.into_iter().map(SigningKey::into_info).collect(),
            total: page.total,
            limit,
            offset,
        })
    }

    /// # Errors
    /// `not-found` for an unknown kid.
    pub async fn get_key(&self, kid: &Kid) -> Result<KeyInfo> {
        Ok(self.load(kid).await?.into_info())
    }

    /// Create a key when nothing can sign; returns the new key, if any.
    ///
    /// # Errors
    /// Storage or generation failures.
    pub async fn ensure_active_key(&self) -> Result<Option<KeyInfo>> {
        match self.active_signer().await {
            Ok(_) => Ok(None),
            Err(err) if err.kind() == ErrorKind::NoActiveKey => {
                info!("no active signing key, creating one");
                self.create_key(None, None, None).await.map(Some)
            }
            Err(err) => Err(err),
        }
    }

    /// Drop the published snapshot; the next read reloads it.
    pub async fn invalidate(&self) {
        *self.snapshot.write().await = None;
    }

    pub(super) async fn load(&self, kid: &Kid) -> Result<SigningKey> {
        self.store
            .find_by_kid(kid)
            .await?
            .ok_or_else(|| Error::not_found(format!("key {kid} not found")))
    }

    async fn snapshot(&self) -> Result<Arc<Snapshot>> {
        let cached = self.snapshot.read().await.clone();
        match cached {
            Some(snapshot)
                if self.clock.now() - snapshot.loaded_at < self.config.key_refresh_interval =>
            {
                Ok(snapshot)
            }
            Some(stale) => match self.reload().await {
                Ok(fresh) => Ok(fresh),
                Err(err) => {
                    // Keep serving the last good set while the store is unreachable.
                    warn!(error = %err, "failed to refresh published keys");
                    Ok(stale)
                }
            },
            None => self.reload().await,
        }
    }

    async fn reload(&self) -> Result<Arc<Snapshot>> {
        let mut keys: Vec<KeyInfo> = self
            .store
            .find_by_status(KeyStatus::Active)
            .await?
            .into_iter()
            .chain(self.store.find_by_status(KeyStatus::Grace).await?)
            .map(SigningKey::into_info)
            .collect();
        keys.sort_by(|a, b| a.kid.cmp(&b.kid));
        let snapshot = Arc::new(Snapshot {
            keys,
            loaded_at: self.clock.now(),
        });
        *self.snapshot.write().await = Some(snapshot.clone());
        debug!(keys = snapshot.keys.len(), "published keys reloaded");
        Ok(snapshot)
    }

    fn refresh_on_unknown_kid(&self, now: DateTime<Utc>) -> bool {
        let now = u64::try_from(now.timestamp()).unwrap_or(0);
        let cooldown = u64::try_from(self.config.unknown_kid_cooldown.num_seconds()).unwrap_or(0);
        let last = self.last_unknown_kid_refresh.load(Ordering::Relaxed);
        if last != 0 && now.saturating_sub(last) < cooldown {
            return false;
        }
        self.last_unknown_kid_refresh
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }
}

fn find_published(snapshot: &Snapshot, kid: &str, now: DateTime<Utc>) -> Option<KeyInfo> {
    snapshot
        .keys
        .iter()
        .find(|info| info.kid.as_str() == kid && info.is_published(now))
        .cloned()
}
