use crate::{GIT_COMMIT_HASH, account::UnitOfWorkFactory, jwks::KeyManager, token::TokenEngine};
use axum::{
    body::Body,
    extract::Extension,
    http::{HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};
use tracing::{Instrument, debug, error, info_span};
use utoipa::ToSchema;

/// Dependencies `/health` reports on.
#[derive(Clone)]
pub struct HealthProbes {
    accounts: Arc<dyn UnitOfWorkFactory>,
    tokens: Arc<TokenEngine>,
    keys: Arc<KeyManager>,
}

impl fmt::Debug for HealthProbes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthProbes").finish_non_exhaustive()
    }
}

impl HealthProbes {
    #[must_use]
    pub fn new(
        accounts: Arc<dyn UnitOfWorkFactory>,
        tokens: Arc<TokenEngine>,
        keys: Arc<KeyManager>,
    ) -> Self {
        Self {
            accounts,
            tokens,
            keys,
        }
    }
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Health {
    commit: String,
    name: String,
    version: String,
    database: String,
    token_store: String,
    signing_key: String,
}

fn status(ok: bool) -> String {
    if ok { "ok" } else { "error" }.to_string()
}

#[utoipa::path(
    get,
    path= "/health",
    responses (
        (status = 200, description = "Stores are reachable and a key can sign", body = [Health]),
        (status = 503, description = "A store is unreachable or no key can sign", body = [Health])
    ),
    tag= "health"
)]
// axum handler for health
pub async fn health(method: Method, probes: Extension<Arc<HealthProbes>>) -> impl IntoResponse {
    let database = match probes
        .accounts
        .ping()
        .instrument(info_span!("db.ping", db.operation = "PING"))
        .await
    {
        Ok(()) => true,
        Err(err) => {
            error!("Failed to ping account store: {err:#}");
            false
        }
    };

    let token_store = match probes.tokens.ping().await {
        Ok(()) => true,
        Err(err) => {
            error!("Failed to ping token store: {err:#}");
            false
        }
    };

    let signing_key = match probes.keys.active_signer().await {
        Ok(_) => true,
        Err(err) => {
            error!("No usable signing key: {err}");
            false
        }
    };

    let is_healthy = database && token_store && signing_key;

    let health = Health {
        commit: GIT_COMMIT_HASH.to_string(),
        name: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        database: status(database),
        token_store: status(token_store),
        signing_key: status(signing_key),
    };

    let body = if method == Method::GET {
        Json(&health).into_response()
    } else {
        Body::empty().into_response()
    };

    let short_hash = if health.commit.len() > 7 {
        &health.commit[0..7]
    } else {
        ""
    };

    let headers = format!("{}:{}:{}", health.name, health.version, short_hash)
        .parse::<HeaderValue>()
        .map(|x_app_header_value| {
            debug!("X-App header: {:?}", x_app_header_value);

            let mut headers = HeaderMap::new();

            headers.insert("X-App", x_app_header_value);

            headers
        })
        .map_err(|err| {
            error!("Failed to parse X-App header: {}", err);
        });

    let headers = headers.unwrap_or_else(|()| HeaderMap::new());

    if is_healthy {
        (StatusCode::OK, headers, body)
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, headers, body)
    }
}
