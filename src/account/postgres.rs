//! PostgreSQL-backed account and credential repositories.

use super::{
    credential::{Credential, CredentialKind, CredentialRecord, CredentialUsage},
    model::{Account, NewAccount},
    repo::{
        AccountRepo, CredentialMatch, CredentialRepo, UnitOfWork, UnitOfWorkFactory,
        UpdateOutcome,
    },
};
use crate::{
    Error,
    types::{AccountId, AccountStatus, AccountType, CredentialId, CredentialType, Idp, UserId},
};
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction, postgres::PgRow, types::Json};
use tokio::sync::Mutex;
use tracing::{Instrument, info_span};

/// Sentinel stored in `accounts.app_id` for accounts without an application.
const NO_APP_ID: &str = "";

const ACCOUNT_COLUMNS: &str = "id, user_id, account_type, app_id, external_id, union_id, status, profile, meta, created_at, updated_at";

const CREDENTIAL_COLUMNS: &str = "id, account_id, credential_type, idp, idp_identifier, app_id, material, algo, params_json, status, failed_attempts, locked_until, last_success_at, last_failure_at, rev, created_at, updated_at";

fn decode_error(err: Error) -> sqlx::Error {
    sqlx::Error::Decode(Box::new(err))
}

impl<'r> FromRow<'r, PgRow> for Account {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let account_type: String = row.try_get("account_type")?;
        let status: String = row.try_get("status")?;
        let app_id: String = row.try_get("app_id")?;
        let profile: Option<Json<Map<String, Value>>> = row.try_get("profile")?;
        let meta: Option<Json<Map<String, Value>>> = row.try_get("meta")?;
        Ok(Self {
            id: AccountId::new(row.try_get("id")?),
            user_id: UserId::new(row.try_get("user_id")?),
            account_type: account_type.parse().map_err(decode_error)?,
            app_id: (app_id != NO_APP_ID).then_some(app_id),
            external_id: row.try_get("external_id")?,
            union_id: row.try_get("union_id")?,
            status: status.parse().map_err(decode_error)?,
            profile: profile.map(|Json(map)| map).unwrap_or_default(),
            meta: meta.map(|Json(map)| map).unwrap_or_default(),
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl<'r> FromRow<'r, PgRow> for CredentialRecord {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let params: Option<Json<Value>> = row.try_get("params_json")?;
        Ok(Self {
            id: row.try_get("id")?,
            account_id: row.try_get("account_id")?,
            credential_type: row.try_get("credential_type")?,
            idp: row.try_get("idp")?,
            idp_identifier: row.try_get("idp_identifier")?,
            app_id: row.try_get("app_id")?,
            material: row.try_get("material")?,
            algo: row.try_get("algo")?,
            params_json: params.map(|Json(value)| value),
            status: row.try_get("status")?,
            failed_attempts: row.try_get("failed_attempts")?,
            locked_until: row.try_get("locked_until")?,
            last_success_at: row.try_get("last_success_at")?,
            last_failure_at: row.try_get("last_failure_at")?,
            rev: row.try_get("rev")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Map a unique-constraint violation to `invalid-argument`, everything else to context.
fn map_insert_error(err: sqlx::Error, what: &str) -> anyhow::Error {
    if let sqlx::Error::Database(db_err) = &err
        && db_err.is_unique_violation()
    {
        return Error::invalid_argument(format!("{what} already exists")).into();
    }
    anyhow::Error::new(err).context(format!("Failed to insert {what}"))
}

#[derive(Clone, Debug)]
pub struct PgAccountStore {
    pool: PgPool,
}

impl PgAccountStore {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UnitOfWorkFactory for PgAccountStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>> {
        let tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction")?;
        Ok(Box::new(PgUnitOfWork {
            tx: Mutex::new(Some(tx)),
        }))
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("Database ping failed")?;
        Ok(())
    }
}

/// One transaction shared by the account and credential repositories.
pub struct PgUnitOfWork {
    tx: Mutex<Option<Transaction<'static, Postgres>>>,
}

fn active<'a>(
    guard: &'a mut Option<Transaction<'static, Postgres>>,
) -> Result<&'a mut Transaction<'static, Postgres>> {
    guard
        .as_mut()
        .ok_or_else(|| anyhow!("unit of work is already committed"))
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    fn accounts(&self) -> &dyn AccountRepo {
        self
    }

    fn credentials(&self) -> &dyn CredentialRepo {
        self
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let tx = self.tx.into_inner();
        if let Some(tx) = tx {
            tx.commit().await.context("Failed to commit transaction")?;
        }
        Ok(())
    }
}

#[async_trait]
impl AccountRepo for PgUnitOfWork {
    async fn create(&self, account: NewAccount) -> Result<Account> {
        account.validate()?;
        let query = format!(
            "INSERT INTO accounts (user_id, account_type, app_id, external_id, union_id, status, profile, meta) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING {ACCOUNT_COLUMNS}"
        );
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query.as_str()
        );
        let mut guard = self.tx.lock().await;
        let tx = active(&mut guard)?;
        sqlx::query_as::<_, Account>(&query)
            .bind(account.user_id.get())
            .bind(account.account_type.as_str())
            .bind(account.app_id.as_deref().unwrap_or(NO_APP_ID))
            .bind(&account.external_id)
            .bind(account.union_id.as_deref())
            .bind(account.status.as_str())
            .bind(Json(&account.profile))
            .bind(Json(&account.meta))
            .fetch_one(&mut **tx)
            .instrument(span)
            .await
            .map_err(|err| map_insert_error(err, "account"))
    }

    async fn find_by_id(&self, id: AccountId) -> Result<Option<Account>> {
        let query = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1");
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query.as_str()
        );
        let mut guard = self.tx.lock().await;
        let tx = active(&mut guard)?;
        sqlx::query_as::<_, Account>(&query)
            .bind(id.get())
            .fetch_optional(&mut **tx)
            .instrument(span)
            .await
            .context("Failed to fetch account")
    }

    async fn find_by_ref(
        &self,
        account_type: AccountType,
        external_id: &str,
        app_id: Option<&str>,
    ) -> Result<Option<Account>> {
        let query = format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE account_type = $1 AND app_id = $2 AND external_id = $3"
        );
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query.as_str()
        );
        let mut guard = self.tx.lock().await;
        let tx = active(&mut guard)?;
        sqlx::query_as::<_, Account>(&query)
            .bind(account_type.as_str())
            .bind(app_id.unwrap_or(NO_APP_ID))
            .bind(external_id)
            .fetch_optional(&mut **tx)
            .instrument(span)
            .await
            .context("Failed to fetch account by reference")
    }

    async fn update_status(&self, id: AccountId, status: AccountStatus) -> Result<()> {
        let query = "UPDATE accounts SET status = $2, updated_at = NOW() WHERE id = $1";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let mut guard = self.tx.lock().await;
        let tx = active(&mut guard)?;
        let result = sqlx::query(query)
            .bind(id.get())
            .bind(status.as_str())
            .execute(&mut **tx)
            .instrument(span)
            .await
            .context("Failed to update account status")?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!("account {id} not found")).into());
        }
        Ok(())
    }

    async fn update_user_id(&self, id: AccountId, user_id: UserId) -> Result<()> {
        let query = "UPDATE accounts SET user_id = $2, updated_at = NOW() WHERE id = $1";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let mut guard = self.tx.lock().await;
        let tx = active(&mut guard)?;
        let result = sqlx::query(query)
            .bind(id.get())
            .bind(user_id.get())
            .execute(&mut **tx)
            .instrument(span)
            .await
            .context("Failed to update account user")?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!("account {id} not found")).into());
        }
        Ok(())
    }

    async fn update_external_ref(
        &self,
        id: AccountId,
        external_id: &str,
        union_id: Option<&str>,
    ) -> Result<()> {
        let query = "UPDATE accounts SET external_id = $2, union_id = $3, updated_at = NOW() WHERE id = $1";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let mut guard = self.tx.lock().await;
        let tx = active(&mut guard)?;
        let result = sqlx::query(query)
            .bind(id.get())
            .bind(external_id)
            .bind(union_id)
            .execute(&mut **tx)
            .instrument(span)
            .await
            .map_err(|err| map_insert_error(err, "account reference"))?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!("account {id} not found")).into());
        }
        Ok(())
    }

    async fn list_by_user_id(&self, user_id: UserId) -> Result<Vec<Account>> {
        let query = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE user_id = $1 ORDER BY id");
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query.as_str()
        );
        let mut guard = self.tx.lock().await;
        let tx = active(&mut guard)?;
        sqlx::query_as::<_, Account>(&query)
            .bind(user_id.get())
            .fetch_all(&mut **tx)
            .instrument(span)
            .await
            .context("Failed to list accounts")
    }
}

fn match_from_row(row: &PgRow) -> Result<CredentialMatch, sqlx::Error> {
    Ok(CredentialMatch {
        account_id: AccountId::new(row.try_get("account_id")?),
        user_id: UserId::new(row.try_get("user_id")?),
        credential_id: CredentialId::new(row.try_get("id")?),
    })
}

#[async_trait]
impl CredentialRepo for PgUnitOfWork {
    async fn create(&self, account_id: AccountId, kind: CredentialKind) -> Result<Credential> {
        kind.validate()?;
        let now = chrono::Utc::now();
        let draft = Credential {
            id: CredentialId::new(0),
            account_id,
            kind,
            usage: CredentialUsage::default(),
            rev: 0,
            created_at: now,
            updated_at: now,
        };
        let row = CredentialRecord::from(&draft);
        let query = format!(
            "INSERT INTO credentials (account_id, credential_type, idp, idp_identifier, app_id, material, algo, params_json, status) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) RETURNING {CREDENTIAL_COLUMNS}"
        );
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query.as_str()
        );
        let mut guard = self.tx.lock().await;
        let tx = active(&mut guard)?;
        let stored = sqlx::query_as::<_, CredentialRecord>(&query)
            .bind(row.account_id)
            .bind(&row.credential_type)
            .bind(row.idp.as_deref())
            .bind(row.idp_identifier.as_deref())
            .bind(row.app_id.as_deref())
            .bind(row.material.as_deref())
            .bind(row.algo.as_deref())
            .bind(row.params_json.as_ref().map(Json))
            .bind(&row.status)
            .fetch_one(&mut **tx)
            .instrument(span)
            .await
            .map_err(|err| map_insert_error(err, "credential"))?;
        Ok(Credential::try_from(stored)?)
    }

    async fn find_by_id(&self, id: CredentialId) -> Result<Option<Credential>> {
        let query = format!("SELECT {CREDENTIAL_COLUMNS} FROM credentials WHERE id = $1");
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query.as_str()
        );
        let mut guard = self.tx.lock().await;
        let tx = active(&mut guard)?;
        let row = sqlx::query_as::<_, CredentialRecord>(&query)
            .bind(id.get())
            .fetch_optional(&mut **tx)
            .instrument(span)
            .await
            .context("Failed to fetch credential")?;
        row.map(Credential::try_from)
            .transpose()
            .map_err(anyhow::Error::from)
    }

    async fn list_by_account(&self, account_id: AccountId) -> Result<Vec<Credential>> {
        let query =
            format!("SELECT {CREDENTIAL_COLUMNS} FROM credentials WHERE account_id = $1 ORDER BY id");
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query.as_str()
        );
        let mut guard = self.tx.lock().await;
        let tx = active(&mut guard)?;
        let rows = sqlx::query_as::<_, CredentialRecord>(&query)
            .bind(account_id.get())
            .fetch_all(&mut **tx)
            .instrument(span)
            .await
            .context("Failed to list credentials")?;
        rows.into_iter()
            .map(|row| Credential::try_from(row).map_err(anyhow::Error::from))
            .collect()
    }

    async fn find_password_credential(
        &self,
        account_id: AccountId,
    ) -> Result<Option<(CredentialId, Vec<u8>)>> {
        let query = "SELECT id, material FROM credentials WHERE account_id = $1 AND credential_type = $2";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let mut guard = self.tx.lock().await;
        let tx = active(&mut guard)?;
        let row = sqlx::query(query)
            .bind(account_id.get())
            .bind(CredentialType::Password.as_str())
            .fetch_optional(&mut **tx)
            .instrument(span)
            .await
            .context("Failed to fetch password credential")?;
        let Some(row) = row else {
            return Ok(None);
        };
        let id: i64 = row.try_get("id")?;
        let material: Option<Vec<u8>> = row.try_get("material")?;
        Ok(Some((CredentialId::new(id), material.unwrap_or_default())))
    }

    async fn find_phone_otp_credential(
        &self,
        phone_e164: &str,
    ) -> Result<Option<CredentialMatch>> {
        let query = "SELECT c.id, c.account_id, a.user_id FROM credentials c \
                     JOIN accounts a ON a.id = c.account_id \
                     WHERE c.credential_type = $1 AND c.idp_identifier = $2";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let mut guard = self.tx.lock().await;
        let tx = active(&mut guard)?;
        let row = sqlx::query(query)
            .bind(CredentialType::PhoneOtp.as_str())
            .bind(phone_e164)
            .fetch_optional(&mut **tx)
            .instrument(span)
            .await
            .context("Failed to fetch phone credential")?;
        Ok(row.as_ref().map(match_from_row).transpose()?)
    }

    async fn find_oauth_credential(
        &self,
        idp: Idp,
        app_id: &str,
        idp_identifier: &str,
    ) -> Result<Option<CredentialMatch>> {
        let query = "SELECT c.id, c.account_id, a.user_id FROM credentials c \
                     JOIN accounts a ON a.id = c.account_id \
                     WHERE c.idp = $1 AND c.app_id = $2 AND c.idp_identifier = $3";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let mut guard = self.tx.lock().await;
        let tx = active(&mut guard)?;
        let row = sqlx::query(query)
            .bind(idp.as_str())
            .bind(app_id)
            .bind(idp_identifier)
            .fetch_optional(&mut **tx)
            .instrument(span)
            .await
            .context("Failed to fetch oauth credential")?;
        Ok(row.as_ref().map(match_from_row).transpose()?)
    }

    async fn update_usage(
        &self,
        id: CredentialId,
        expected_rev: i64,
        usage: &CredentialUsage,
    ) -> Result<UpdateOutcome> {
        let query = "UPDATE credentials SET status = $3, failed_attempts = $4, locked_until = $5, \
                     last_success_at = $6, last_failure_at = $7, rev = rev + 1, updated_at = NOW() \
                     WHERE id = $1 AND rev = $2";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let mut guard = self.tx.lock().await;
        let tx = active(&mut guard)?;
        let result = sqlx::query(query)
            .bind(id.get())
            .bind(expected_rev)
            .bind(usage.status.as_str())
            .bind(i32::try_from(usage.failed_attempts).unwrap_or(i32::MAX))
            .bind(usage.locked_until)
            .bind(usage.last_success_at)
            .bind(usage.last_failure_at)
            .execute(&mut **tx)
            .instrument(span)
            .await
            .context("Failed to update credential usage")?;
        Ok(if result.rows_affected() == 1 {
            UpdateOutcome::Applied
        } else {
            UpdateOutcome::Conflict
        })
    }

    async fn rotate_hash(
        &self,
        id: CredentialId,
        material: &[u8],
        algo: &str,
        params: Option<&Value>,
    ) -> Result<()> {
        let query = "UPDATE credentials SET material = $2, algo = $3, params_json = $4, rev = rev + 1, updated_at = NOW() \
                     WHERE id = $1 AND credential_type = $5";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let mut guard = self.tx.lock().await;
        let tx = active(&mut guard)?;
        let result = sqlx::query(query)
            .bind(id.get())
            .bind(material)
            .bind(algo)
            .bind(params.map(Json))
            .bind(CredentialType::Password.as_str())
            .execute(&mut **tx)
            .instrument(span)
            .await
            .context("Failed to rotate credential hash")?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!("password credential {id} not found")).into());
        }
        Ok(())
    }
}
