//! PostgreSQL-backed signing-key store (`signing_keys` table).

use super::{
    key::{KeyInfo, KeyStatus, PublicJwk, SigningKey},
    store::{KeyPage, KeyStore},
};
use crate::{Error, types::Kid};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Row, postgres::PgRow, types::Json};
use tracing::{Instrument, info_span};

const KEY_COLUMNS: &str =
    "kid, algorithm, status, not_before, not_after, public_jwk, private_der, created_at, updated_at";

fn decode_error(err: Error) -> sqlx::Error {
    sqlx::Error::Decode(Box::new(err))
}

impl<'r> FromRow<'r, PgRow> for SigningKey {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let kid: String = row.try_get("kid")?;
        let algorithm: String = row.try_get("algorithm")?;
        let status: String = row.try_get("status")?;
        let Json(public_jwk): Json<PublicJwk> = row.try_get("public_jwk")?;
        let info = KeyInfo {
            kid: Kid::new(kid).map_err(decode_error)?,
            algorithm: algorithm.parse().map_err(decode_error)?,
            status: status.parse().map_err(decode_error)?,
            not_before: row.try_get("not_before")?,
            not_after: row.try_get("not_after")?,
            public_jwk,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        };
        Self::new(info, row.try_get("private_der")?).map_err(decode_error)
    }
}

#[derive(Clone, Debug)]
pub struct PgKeyStore {
    pool: PgPool,
}

impl PgKeyStore {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl KeyStore for PgKeyStore {
    async fn save(&self, key: &SigningKey) -> Result<()> {
        let query = format!(
            "INSERT INTO signing_keys ({KEY_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"
        );
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query.as_str()
        );
        let info = key.info();
        sqlx::query(&query)
            .bind(info.kid.as_str())
            .bind(info.algorithm.as_str())
            .bind(info.status.as_str())
            .bind(info.not_before)
            .bind(info.not_after)
            .bind(Json(&info.public_jwk))
            .bind(key.private_der())
            .bind(info.created_at)
            .bind(info.updated_at)
            .execute(&self.pool)
            .instrument(span)
            .await
            .map_err(|err| {
                if let sqlx::Error::Database(db_err) = &err
                    && db_err.is_unique_violation()
                {
                    return Error::invalid_argument(format!("key {} already exists", info.kid))
                        .into();
                }
                anyhow::Error::new(err).context("Failed to insert signing key")
            })?;
        Ok(())
    }

    async fn update(&self, key: &SigningKey) -> Result<()> {
        let query = "UPDATE signing_keys SET status = $2, not_after = $3, updated_at = $4 WHERE kid = $1";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let info = key.info();
        let result = sqlx::query(query)
            .bind(info.kid.as_str())
            .bind(info.status.as_str())
            .bind(info.not_after)
            .bind(info.updated_at)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("Failed to update signing key")?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!("key {} not found", info.kid)).into());
        }
        Ok(())
    }

    async fn delete(&self, kid: &Kid) -> Result<bool> {
        let query = "DELETE FROM signing_keys WHERE kid = $1";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(kid.as_str())
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("Failed to delete signing key")?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_by_kid(&self, kid: &Kid) -> Result<Option<SigningKey>> {
        let query = format!("SELECT {KEY_COLUMNS} FROM signing_keys WHERE kid = $1");
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query.as_str()
        );
        sqlx::query_as::<_, SigningKey>(&query)
            .bind(kid.as_str())
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("Failed to fetch signing key")
    }

    async fn find_by_status(&self, status: KeyStatus) -> Result<Vec<SigningKey>> {
        let query = format!(
            "SELECT {KEY_COLUMNS} FROM signing_keys WHERE status = $1 ORDER BY created_at, kid"
        );
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query.as_str()
        );
        sqlx::query_as::<_, SigningKey>(&query)
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .instrument(span)
            .await
            .context("Failed to fetch signing keys by status")
    }

    async fn find_page(&self, status: Option<KeyStatus>, limit: u32, offset: u32) -> Result<KeyPage> {
        let query = format!(
            "SELECT {KEY_COLUMNS}, COUNT(*) OVER () AS total FROM signing_keys \
             WHERE ($1::TEXT IS NULL OR status = $1) ORDER BY created_at, kid LIMIT $2 OFFSET $3"
        );
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query.as_str()
        );
        let rows = sqlx::query(&query)
            .bind(status.map(KeyStatus::as_str))
            .bind(i64::from(limit))
            .bind(i64::from(offset))
            .fetch_all(&self.pool)
            .instrument(span)
            .await
            .context("Failed to list signing keys")?;

        let mut total = 0_i64;
        let mut keys = Vec::with_capacity(rows.len());
        for row in &rows {
            total = row.try_get("total").context("Failed to read key count")?;
            keys.push(SigningKey::from_row(row).context("Failed to decode signing key")?);
        }
        if rows.is_empty() {
            total = self.count(status).await?;
        }
        Ok(KeyPage {
            keys,
            total: u64::try_from(total).unwrap_or_default(),
        })
    }

    async fn delete_expired_retired(&self, now: DateTime<Utc>) -> Result<u64> {
        let query = "DELETE FROM signing_keys WHERE status = 'retired' AND not_after IS NOT NULL AND not_after < $1";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(now)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("Failed to delete expired signing keys")?;
        Ok(result.rows_affected())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("Database ping failed")?;
        Ok(())
    }
}

impl PgKeyStore {
    async fn count(&self, status: Option<KeyStatus>) -> Result<i64> {
        let query = "SELECT COUNT(*) FROM signing_keys WHERE ($1::TEXT IS NULL OR status = $1)";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        sqlx::query_scalar::<_, i64>(query)
            .bind(status.map(KeyStatus::as_str))
            .fetch_one(&self.pool)
            .instrument(span)
            .await
            .context("Failed to count signing keys")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::jwks::{
        crypto::{KeyGenerator, SoftwareKeyGenerator},
        key::Algorithm,
    };
    use sqlx::postgres::PgPoolOptions;

    /// Runs only when `AUTHN_TEST_DSN` points at a database loaded with `sql/schema.sql`.
    async fn pool() -> Option<PgPool> {
        let dsn = std::env::var("AUTHN_TEST_DSN").ok()?;
        PgPoolOptions::new()
            .max_connections(2)
            .connect(&dsn)
            .await
            .ok()
    }

    #[tokio::test]
    async fn key_round_trip() {
        let Some(pool) = pool().await else {
            eprintln!("AUTHN_TEST_DSN not set, skipping");
            return;
        };
        let store = PgKeyStore::new(pool);
        let generated = SoftwareKeyGenerator::new()
            .generate(Algorithm::Es256)
            .unwrap();
        let now = Utc::now();
        let mut key = SigningKey::new(
            KeyInfo {
                kid: Kid::new(generated.public_jwk.kid.clone()).unwrap(),
                algorithm: Algorithm::Es256,
                status: KeyStatus::Active,
                not_before: now,
                not_after: None,
                public_jwk: generated.public_jwk,
                created_at: now,
                updated_at: now,
            },
            generated.private_der,
        )
        .unwrap();
        store.save(&key).await.unwrap();

        key.enter_grace(now).unwrap();
        store.update(&key).await.unwrap();
        let loaded = store.find_by_kid(key.kid()).await.unwrap().unwrap();
        assert_eq!(loaded.status(), KeyStatus::Grace);
        assert_eq!(loaded.private_der(), key.private_der());

        assert!(store.delete(key.kid()).await.unwrap());
        assert!(!store.delete(key.kid()).await.unwrap());
    }
}
