use crate::{
    account::{LockoutPolicy, MemoryAccountStore, PgAccountStore, UnitOfWorkFactory},
    api::{self, AdminToken, AppState, HealthProbes},
    authentication::{
        Authenticator, JwtTokenStrategy, PasswordStrategy, PhoneOtpStrategy, StrategyFactory,
        WecomStrategy, WxMinipStrategy,
    },
    cli::telemetry,
    clock::{Clock, SystemClock},
    identity::{
        AllowAllUsers, Argon2Hasher, Argon2Params, IdentityProvider, MemoryOtpVerifier,
        PasswordHasher, PgUserStatusLookup, StaticIdentityProvider, TracingAuditLogger,
        UserStatusLookup, WechatIdentityProvider,
    },
    jwks::{
        Algorithm, KeyManager, KeyManagerConfig, KeyStore, MemoryKeyStore, PgKeyStore,
        RotationPolicy, SoftwareKeyGenerator,
    },
    service::AuthService,
    token::{MemoryTokenStore, RefreshStore, TokenBlacklist, TokenConfig, TokenEngine},
};
use anyhow::{Context, Result};
use secrecy::SecretString;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tracing::{debug, info, warn};

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: Option<String>,
    pub redis_url: Option<String>,
    pub admin_token: Option<SecretString>,
    pub request_timeout: Duration,
    pub token: TokenConfig,
    pub signing_algorithm: Algorithm,
    pub rotation: RotationPolicy,
    pub key_refresh_interval: chrono::Duration,
    pub bootstrap_key: bool,
    pub lockout: LockoutPolicy,
    pub password_pepper: SecretString,
    pub argon2: Argon2Params,
    pub wx_minip_apps: HashMap<String, SecretString>,
    pub wecom_corps: HashMap<String, SecretString>,
    pub idp_timeout: Duration,
}

struct Stores {
    accounts: Arc<dyn UnitOfWorkFactory>,
    keys: Arc<dyn KeyStore>,
    users: Arc<dyn UserStatusLookup>,
}

async fn connect(dsn: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .min_connections(1)
        .max_connections(10)
        .max_lifetime(Duration::from_secs(60 * 30))
        .test_before_acquire(true)
        .connect(dsn)
        .await
        .context("Failed to connect to database")
}

async fn stores(dsn: Option<&str>, clock: &Arc<dyn Clock>) -> Result<Stores> {
    match dsn {
        Some(dsn) => {
            let pool = connect(dsn).await?;
            Ok(Stores {
                accounts: Arc::new(PgAccountStore::new(pool.clone())),
                keys: Arc::new(PgKeyStore::new(pool.clone())),
                users: Arc::new(PgUserStatusLookup::new(pool)),
            })
        }
        None => {
            warn!("No DSN configured, accounts and signing keys are kept in memory");
            Ok(Stores {
                accounts: Arc::new(MemoryAccountStore::new(clock.clone())),
                keys: Arc::new(MemoryKeyStore::new()),
                users: Arc::new(AllowAllUsers),
            })
        }
    }
}

fn split<S>(store: Arc<S>) -> (Arc<dyn RefreshStore>, Arc<dyn TokenBlacklist>)
where
    S: RefreshStore + TokenBlacklist + 'static,
{
    let refresh: Arc<dyn RefreshStore> = store.clone();
    let blacklist: Arc<dyn TokenBlacklist> = store;
    (refresh, blacklist)
}

#[cfg(feature = "redis")]
async fn token_stores(
    redis_url: Option<&str>,
    clock: &Arc<dyn Clock>,
) -> Result<(Arc<dyn RefreshStore>, Arc<dyn TokenBlacklist>)> {
    if let Some(url) = redis_url {
        let store = Arc::new(crate::token::RedisTokenStore::connect(url).await?);
        return Ok(split(store));
    }
    Ok(split(Arc::new(MemoryTokenStore::new(clock.clone()))))
}

#[cfg(not(feature = "redis"))]
async fn token_stores(
    redis_url: Option<&str>,
    clock: &Arc<dyn Clock>,
) -> Result<(Arc<dyn RefreshStore>, Arc<dyn TokenBlacklist>)> {
    if redis_url.is_some() {
        anyhow::bail!("--redis-url requires a build with the `redis` feature");
    }
    Ok(split(Arc::new(MemoryTokenStore::new(clock.clone()))))
}

fn identity_provider(args: &Args) -> Result<Arc<dyn IdentityProvider>> {
    if args.wx_minip_apps.is_empty() && args.wecom_corps.is_empty() {
        debug!("No identity provider credentials, WeChat and WeCom logins will fail");
        return Ok(Arc::new(StaticIdentityProvider::new()));
    }
    Ok(Arc::new(WechatIdentityProvider::new(
        args.wx_minip_apps.clone(),
        args.wecom_corps.clone(),
        args.idp_timeout,
    )?))
}

/// Execute the server action.
/// # Errors
/// Returns an error if a store cannot be reached, the configuration is rejected, or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    debug!("Server args: {:?}", args);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let stores = stores(args.dsn.as_deref(), &clock).await?;
    let (refresh_store, blacklist) = token_stores(args.redis_url.as_deref(), &clock).await?;

    let keys = Arc::new(KeyManager::new(
        stores.keys,
        Arc::new(SoftwareKeyGenerator::new()),
        clock.clone(),
        KeyManagerConfig::new()
            .with_algorithm(args.signing_algorithm)
            .with_key_refresh_interval(args.key_refresh_interval)
            .with_rotation(args.rotation),
    ));
    if args.bootstrap_key
        && let Some(created) = keys
            .ensure_active_key()
            .await
            .context("Failed to bootstrap a signing key")?
    {
        info!(kid = %created.kid, algorithm = %created.algorithm, "bootstrapped signing key");
    }

    let tokens = Arc::new(TokenEngine::new(
        keys.clone(),
        refresh_store,
        blacklist,
        clock.clone(),
        args.token.clone(),
    ));

    let hasher: Arc<dyn PasswordHasher> = Arc::new(
        Argon2Hasher::new(args.argon2, args.password_pepper.clone())
            .context("Failed to configure password hasher")?,
    );
    let idp = identity_provider(&args)?;
    let strategies = StrategyFactory::new()
        .with(Arc::new(PasswordStrategy::new(hasher, clock.clone())))
        .with(Arc::new(PhoneOtpStrategy::new(
            Arc::new(MemoryOtpVerifier::new(clock.clone())),
            clock.clone(),
        )))
        .with(Arc::new(
            WxMinipStrategy::new(idp.clone(), clock.clone()).with_timeout(args.idp_timeout),
        ))
        .with(Arc::new(
            WecomStrategy::new(idp, clock.clone()).with_timeout(args.idp_timeout),
        ))
        .with(Arc::new(JwtTokenStrategy::new(tokens.clone())));

    let authenticator = Arc::new(Authenticator::new(
        stores.accounts.clone(),
        strategies,
        args.lockout,
        Arc::new(TracingAuditLogger),
        clock,
    ));
    let service = Arc::new(
        AuthService::new(authenticator, tokens.clone(), stores.users)
            .with_request_timeout(args.request_timeout),
    );

    if args.admin_token.is_none() {
        info!("No admin token configured, key administration API is disabled");
    }
    let state = AppState {
        service,
        keys: keys.clone(),
        health: Arc::new(HealthProbes::new(stores.accounts, tokens, keys)),
        admin: args.admin_token.map(|token| Arc::new(AdminToken::new(token))),
    };

    let result = api::serve(args.port, state).await;
    telemetry::shutdown_tracer();
    result
}
