//! Signing-key administration.
//!
//! Every handler checks `Authorization: Bearer <admin token>` first; the router
//! is only mounted when a token is configured.

use super::bearer_token;
use crate::{
    Error, ErrorKind, Result,
    api::error::{ErrorBody, json_body},
    jwks::{Algorithm, KeyInfo, KeyList, KeyManager, KeyStatus, RotationStatus},
    types::Kid,
};
use axum::{
    Json,
    extract::{Extension, Path, Query, rejection::JsonRejection, rejection::QueryRejection},
    http::{HeaderMap, StatusCode},
};
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};
use subtle::ConstantTimeEq;
use tracing::{info, instrument, warn};
use utoipa::{IntoParams, ToSchema};

/// Shared secret guarding the admin routes.
#[derive(Clone)]
pub struct AdminToken(SecretString);

impl fmt::Debug for AdminToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AdminToken(***)")
    }
}

impl AdminToken {
    #[must_use]
    pub const fn new(token: SecretString) -> Self {
        Self(token)
    }

    /// # Errors
    /// `unauthenticated` when the bearer token is missing or differs.
    pub fn authorize(&self, headers: &HeaderMap) -> Result<()> {
        let presented = bearer_token(headers).unwrap_or_default();
        let expected = self.0.expose_secret().as_bytes();
        if !expected.is_empty() && bool::from(presented.as_bytes().ct_eq(expected)) {
            return Ok(());
        }
        warn!("admin request rejected");
        Err(Error::new(
            ErrorKind::Unauthenticated,
            "admin token required",
        ))
    }
}

#[derive(Clone, Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CreateKeyRequest {
    #[schema(value_type = Option<String>, example = "RS256")]
    pub algorithm: Option<Algorithm>,
    pub not_before: Option<DateTime<Utc>>,
    pub not_after: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ListKeysQuery {
    /// `active`, `grace` or `retired`.
    pub status: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CleanupResponse {
    pub deleted_count: u64,
}

#[utoipa::path(
    post,
    path = "/v1/admin/keys",
    request_body = CreateKeyRequest,
    responses(
        (status = 201, description = "Key created and active", body = KeyInfo),
        (status = 400, description = "Invalid algorithm or validity window", body = ErrorBody),
        (status = 401, description = "Missing or wrong admin token", body = ErrorBody)
    ),
    tag = "admin"
)]
#[instrument(skip_all)]
pub async fn create_key(
    headers: HeaderMap,
    admin: Extension<Arc<AdminToken>>,
    keys: Extension<Arc<KeyManager>>,
    payload: std::result::Result<Json<CreateKeyRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<KeyInfo>)> {
    admin.authorize(&headers)?;
    let request = json_body(payload)?;
    let info = keys
        .create_key(request.algorithm, request.not_before, request.not_after)
        .await?;
    info!(kid = %info.kid, algorithm = %info.algorithm, "signing key created");
    Ok((StatusCode::CREATED, Json(info)))
}

#[utoipa::path(
    get,
    path = "/v1/admin/keys",
    params(ListKeysQuery),
    responses(
        (status = 200, description = "One page of keys, newest first", body = KeyList),
        (status = 400, description = "Unknown status filter", body = ErrorBody),
        (status = 401, description = "Missing or wrong admin token", body = ErrorBody)
    ),
    tag = "admin"
)]
#[instrument(skip_all)]
pub async fn list_keys(
    headers: HeaderMap,
    admin: Extension<Arc<AdminToken>>,
    keys: Extension<Arc<KeyManager>>,
    query: std::result::Result<Query<ListKeysQuery>, QueryRejection>,
) -> Result<Json<KeyList>> {
    admin.authorize(&headers)?;
    let Query(query) = query.map_err(|rejection| Error::invalid_argument(rejection.body_text()))?;
    let status = query
        .status
        .as_deref()
        .map(str::parse::<KeyStatus>)
        .transpose()?;
    Ok(Json(keys.list_keys(status, query.limit, query.offset).await?))
}

#[utoipa::path(
    get,
    path = "/v1/admin/keys/{kid}",
    params(("kid" = String, Path, description = "Key identifier")),
    responses(
        (status = 200, description = "Key record", body = KeyInfo),
        (status = 401, description = "Missing or wrong admin token", body = ErrorBody),
        (status = 404, description = "Unknown kid", body = ErrorBody)
    ),
    tag = "admin"
)]
#[instrument(skip(headers, admin, keys))]
pub async fn get_key(
    headers: HeaderMap,
    admin: Extension<Arc<AdminToken>>,
    keys: Extension<Arc<KeyManager>>,
    Path(kid_value): Path<String>,
) -> Result<Json<KeyInfo>> {
    admin.authorize(&headers)?;
    Ok(Json(keys.get_key(&Kid::new(kid_value)?).await?))
}

#[utoipa::path(
    post,
    path = "/v1/admin/keys/{kid}/grace",
    params(("kid" = String, Path, description = "Key identifier")),
    responses(
        (status = 200, description = "Key moved to grace", body = KeyInfo),
        (status = 400, description = "Key is not active", body = ErrorBody),
        (status = 401, description = "Missing or wrong admin token", body = ErrorBody),
        (status = 404, description = "Unknown kid", body = ErrorBody)
    ),
    tag = "admin"
)]
#[instrument(skip(headers, admin, keys))]
pub async fn enter_grace(
    headers: HeaderMap,
    admin: Extension<Arc<AdminToken>>,
    keys: Extension<Arc<KeyManager>>,
    Path(kid_value): Path<String>,
) -> Result<Json<KeyInfo>> {
    admin.authorize(&headers)?;
    Ok(Json(keys.enter_grace(&Kid::new(kid_value)?).await?))
}

#[utoipa::path(
    post,
    path = "/v1/admin/keys/{kid}/retire",
    params(("kid" = String, Path, description = "Key identifier")),
    responses(
        (status = 200, description = "Key retired", body = KeyInfo),
        (status = 400, description = "Key is not in grace", body = ErrorBody),
        (status = 401, description = "Missing or wrong admin token", body = ErrorBody),
        (status = 404, description = "Unknown kid", body = ErrorBody)
    ),
    tag = "admin"
)]
#[instrument(skip(headers, admin, keys))]
pub async fn retire(
    headers: HeaderMap,
    admin: Extension<Arc<AdminToken>>,
    keys: Extension<Arc<KeyManager>>,
    Path(kid_value): Path<String>,
) -> Result<Json<KeyInfo>> {
    admin.authorize(&headers)?;
    Ok(Json(keys.retire(&Kid::new(kid_value)?).await?))
}

#[utoipa::path(
    post,
    path = "/v1/admin/keys/{kid}/force-retire",
    params(("kid" = String, Path, description = "Key identifier")),
    responses(
        (status = 200, description = "Key retired regardless of status", body = KeyInfo),
        (status = 401, description = "Missing or wrong admin token", body = ErrorBody),
        (status = 404, description = "Unknown kid", body = ErrorBody)
    ),
    tag = "admin"
)]
#[instrument(skip(headers, admin, keys))]
pub async fn force_retire(
    headers: HeaderMap,
    admin: Extension<Arc<AdminToken>>,
    keys: Extension<Arc<KeyManager>>,
    Path(kid_value): Path<String>,
) -> Result<Json<KeyInfo>> {
    admin.authorize(&headers)?;
    Ok(Json(keys.force_retire(&Kid::new(kid_value)?).await?))
}

#[utoipa::path(
    post,
    path = "/v1/admin/keys/cleanup",
    responses(
        (status = 200, description = "Expired retired keys deleted", body = CleanupResponse),
        (status = 401, description = "Missing or wrong admin token", body = ErrorBody)
    ),
    tag = "admin"
)]
#[instrument(skip_all)]
pub async fn cleanup(
    headers: HeaderMap,
    admin: Extension<Arc<AdminToken>>,
    keys: Extension<Arc<KeyManager>>,
) -> Result<Json<CleanupResponse>> {
    admin.authorize(&headers)?;
    let deleted_count = keys.cleanup().await?;
    Ok(Json(CleanupResponse { deleted_count }))
}

#[utoipa::path(
    post,
    path = "/v1/admin/keys/rotate",
    responses(
        (status = 201, description = "New active key", body = KeyInfo),
        (status = 401, description = "Missing or wrong admin token", body = ErrorBody)
    ),
    tag = "admin"
)]
#[instrument(skip_all)]
pub async fn rotate(
    headers: HeaderMap,
    admin: Extension<Arc<AdminToken>>,
    keys: Extension<Arc<KeyManager>>,
) -> Result<(StatusCode, Json<KeyInfo>)> {
    admin.authorize(&headers)?;
    Ok((StatusCode::CREATED, Json(keys.rotate_key().await?)))
}

#[utoipa::path(
    get,
    path = "/v1/admin/keys/rotation",
    responses(
        (status = 200, description = "Rotation schedule and key counts", body = RotationStatus),
        (status = 401, description = "Missing or wrong admin token", body = ErrorBody)
    ),
    tag = "admin"
)]
#[instrument(skip_all)]
pub async fn rotation_status(
    headers: HeaderMap,
    admin: Extension<Arc<AdminToken>>,
    keys: Extension<Arc<KeyManager>>,
) -> Result<Json<RotationStatus>> {
    admin.authorize(&headers)?;
    Ok(Json(keys.rotation_status().await?))
}
