#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use authn::{
    account::{AccountService, LockoutPolicy, MemoryAccountStore},
    api::{AdminToken, AppState, HealthProbes},
    authentication::{Authenticator, JwtTokenStrategy, PasswordStrategy, PhoneOtpStrategy, StrategyFactory},
    clock::ManualClock,
    identity::{
        Argon2Hasher, Argon2Params, MemoryOtpVerifier, MemoryUserDirectory, PasswordHasher,
        TracingAuditLogger,
    },
    jwks::{Algorithm, KeyManager, KeyManagerConfig, MemoryKeyStore, SoftwareKeyGenerator},
    service::{AuthService, LoginRequest},
    token::{MemoryTokenStore, TokenConfig, TokenEngine},
    types::UserId,
};
use chrono::{Duration, TimeZone, Utc};
use secrecy::SecretString;
use serde_json::json;
use std::sync::Arc;

pub const USERNAME: &str = "alice";
pub const PASSWORD: &str = "P@ssw0rd";
pub const USER_ID: i64 = 100;

pub struct Stack {
    pub service: Arc<AuthService>,
    pub accounts: AccountService,
    pub keys: Arc<KeyManager>,
    pub tokens: Arc<TokenEngine>,
    pub store: Arc<MemoryAccountStore>,
    pub users: Arc<MemoryUserDirectory>,
    pub otp: Arc<MemoryOtpVerifier>,
    pub clock: Arc<ManualClock>,
}

impl Stack {
    pub fn state(&self, admin_token: Option<&str>) -> AppState {
        AppState {
            service: self.service.clone(),
            keys: self.keys.clone(),
            health: Arc::new(HealthProbes::new(
                self.store.clone(),
                self.tokens.clone(),
                self.keys.clone(),
            )),
            admin: admin_token.map(|token| Arc::new(AdminToken::new(SecretString::from(token)))),
        }
    }

    /// Operation account for [`USERNAME`] owned by user [`USER_ID`].
    pub async fn register(&self) -> authn::account::Account {
        let (account, _) = self
            .accounts
            .register_operation_account(UserId::new(USER_ID), USERNAME, PASSWORD)
            .await
            .expect("register operation account");
        self.users.set_user(UserId::new(USER_ID), true).await;
        account
    }
}

fn hasher() -> Arc<dyn PasswordHasher> {
    Arc::new(
        Argon2Hasher::new(
            Argon2Params::new()
                .with_m_cost(64)
                .with_t_cost(1)
                .with_p_cost(1),
            SecretString::from("integration-pepper"),
        )
        .expect("argon2 parameters"),
    )
}

/// In-memory stack: ES256 keys, 15 minute access tokens, lockout after three failures.
pub async fn stack() -> Stack {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap(),
    ));
    let store = Arc::new(MemoryAccountStore::new(clock.clone()));
    let token_store = Arc::new(MemoryTokenStore::new(clock.clone()));
    let otp = Arc::new(MemoryOtpVerifier::new(clock.clone()));
    let users = Arc::new(MemoryUserDirectory::new());

    let keys = Arc::new(KeyManager::new(
        Arc::new(MemoryKeyStore::new()),
        Arc::new(SoftwareKeyGenerator::new()),
        clock.clone(),
        KeyManagerConfig::new().with_algorithm(Algorithm::Es256),
    ));
    keys.ensure_active_key().await.expect("bootstrap signing key");

    let tokens = Arc::new(TokenEngine::new(
        keys.clone(),
        token_store.clone(),
        token_store,
        clock.clone(),
        TokenConfig::new()
            .with_issuer("authn-test")
            .with_access_ttl(Duration::minutes(15))
            .with_refresh_ttl(Duration::days(7)),
    ));

    let hasher = hasher();
    let strategies = StrategyFactory::new()
        .with(Arc::new(PasswordStrategy::new(hasher.clone(), clock.clone())))
        .with(Arc::new(PhoneOtpStrategy::new(otp.clone(), clock.clone())))
        .with(Arc::new(JwtTokenStrategy::new(tokens.clone())));
    let authenticator = Arc::new(Authenticator::new(
        store.clone(),
        strategies,
        LockoutPolicy::new()
            .with_threshold(3)
            .with_lock_duration(Duration::minutes(15)),
        Arc::new(TracingAuditLogger),
        clock.clone(),
    ));

    Stack {
        service: Arc::new(AuthService::new(authenticator, tokens.clone(), users.clone())),
        accounts: AccountService::new(store.clone(), hasher, clock.clone()),
        keys,
        tokens,
        store,
        users,
        otp,
        clock,
    }
}

pub fn password_login(username: &str, password: &str) -> LoginRequest {
    serde_json::from_value(json!({
        "method": "password",
        "credentials": {"username": username, "password": password},
        "audience": "web",
        "deviceId": "device-1"
    }))
    .expect("password login request")
}

pub fn otp_login(phone: &str, code: &str) -> LoginRequest {
    serde_json::from_value(json!({
        "method": "phone_otp",
        "credentials": {"phone": phone, "otpCode": code}
    }))
    .expect("otp login request")
}
