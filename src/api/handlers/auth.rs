//! Login and token lifecycle endpoints.

use super::request_meta;
use crate::{
    Result,
    api::error::{ErrorBody, json_body},
    service::{
        AuthService, LoginRequest, LoginResponse, LogoutRequest, LogoutResponse, VerifyResponse,
    },
};
use axum::{
    Json,
    extract::{Extension, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
};
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};
use tracing::instrument;
use utoipa::ToSchema;

#[derive(Clone, Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    pub refresh_token: String,
}

impl fmt::Debug for RefreshRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshRequest").finish_non_exhaustive()
    }
}

#[derive(Clone, Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AccessTokenRequest {
    pub access_token: String,
}

impl fmt::Debug for AccessTokenRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessTokenRequest").finish_non_exhaustive()
    }
}

#[utoipa::path(
    post,
    path = "/v1/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Authenticated; token pair issued", body = LoginResponse),
        (status = 400, description = "Malformed or unsupported credentials", body = ErrorBody),
        (status = 401, description = "Authentication failed", body = ErrorBody),
        (status = 403, description = "Credential or user disabled", body = ErrorBody),
        (status = 423, description = "Credential locked", body = ErrorBody),
        (status = 502, description = "Identity provider exchange failed", body = ErrorBody)
    ),
    tag = "auth"
)]
#[instrument(skip_all)]
pub async fn login(
    headers: HeaderMap,
    service: Extension<Arc<AuthService>>,
    payload: std::result::Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<LoginResponse>> {
    let request = json_body(payload)?;
    let response = service.login(request, request_meta(&headers)).await?;
    Ok(Json(response))
}

#[utoipa::path(
    post,
    path = "/v1/auth/refresh",
    request_body = RefreshRequest,
    responses(
        (status = 200, description = "Token pair rotated", body = LoginResponse),
        (status = 400, description = "Missing refresh token", body = ErrorBody),
        (status = 401, description = "Unknown, reused or expired refresh token", body = ErrorBody)
    ),
    tag = "auth"
)]
#[instrument(skip_all)]
pub async fn refresh(
    service: Extension<Arc<AuthService>>,
    payload: std::result::Result<Json<RefreshRequest>, JsonRejection>,
) -> Result<Json<LoginResponse>> {
    let request = json_body(payload)?;
    Ok(Json(service.refresh(&request.refresh_token).await?))
}

#[utoipa::path(
    post,
    path = "/v1/auth/verify",
    request_body = AccessTokenRequest,
    responses(
        (status = 200, description = "Verification verdict", body = VerifyResponse),
        (status = 400, description = "Missing access token", body = ErrorBody)
    ),
    tag = "auth"
)]
#[instrument(skip_all)]
pub async fn verify(
    service: Extension<Arc<AuthService>>,
    payload: std::result::Result<Json<AccessTokenRequest>, JsonRejection>,
) -> Result<Json<VerifyResponse>> {
    let request = json_body(payload)?;
    Ok(Json(service.verify(&request.access_token).await?))
}

#[utoipa::path(
    post,
    path = "/v1/auth/revoke",
    request_body = AccessTokenRequest,
    responses(
        (status = 204, description = "Access token blacklisted until it expires"),
        (status = 401, description = "Token signature does not verify", body = ErrorBody)
    ),
    tag = "auth"
)]
#[instrument(skip_all)]
pub async fn revoke(
    service: Extension<Arc<AuthService>>,
    payload: std::result::Result<Json<AccessTokenRequest>, JsonRejection>,
) -> Result<StatusCode> {
    let request = json_body(payload)?;
    service.revoke(&request.access_token).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/v1/auth/revoke-refresh",
    request_body = RefreshRequest,
    responses(
        (status = 204, description = "Refresh token deleted"),
        (status = 400, description = "Missing refresh token", body = ErrorBody)
    ),
    tag = "auth"
)]
#[instrument(skip_all)]
pub async fn revoke_refresh(
    service: Extension<Arc<AuthService>>,
    payload: std::result::Result<Json<RefreshRequest>, JsonRejection>,
) -> Result<StatusCode> {
    let request = json_body(payload)?;
    service.revoke_refresh(&request.refresh_token).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/v1/auth/logout",
    request_body = LogoutRequest,
    responses(
        (status = 200, description = "Supplied tokens revoked", body = LogoutResponse),
        (status = 400, description = "Nothing to revoke", body = ErrorBody),
        (status = 401, description = "Logout everywhere without a valid access token", body = ErrorBody)
    ),
    tag = "auth"
)]
#[instrument(skip_all)]
pub async fn logout(
    headers: HeaderMap,
    service: Extension<Arc<AuthService>>,
    payload: std::result::Result<Json<LogoutRequest>, JsonRejection>,
) -> Result<Json<LogoutResponse>> {
    let request = json_body(payload)?;
    Ok(Json(service.logout(request, request_meta(&headers)).await?))
}
