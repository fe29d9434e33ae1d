//! Use-case façade consumed by the transport: login, logout, verify, refresh, revoke.

use crate::{
    Error, ErrorKind, Result,
    authentication::{AuthCredentials, AuthDecision, AuthInput, Authenticator},
    identity::UserStatusLookup,
    token::{AccessClaims, TokenEngine, TokenPair},
    types::{AccountId, Amr, TenantId, UserId, str_enum},
};
use serde::{Deserialize, Serialize};
use std::{fmt, future::Future, sync::Arc, time::Duration};
use tracing::{Span, debug, info, instrument};
use utoipa::ToSchema;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

str_enum! {
    /// Client class the access token is minted for.
    pub enum Audience {
        Web => "web",
        Mobile => "mobile",
        Admin => "admin",
    }
}

#[derive(Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PasswordCredentials {
    pub username: String,
    #[schema(format = Password)]
    pub password: String,
    #[schema(value_type = Option<i64>)]
    pub tenant_id: Option<TenantId>,
}

impl fmt::Debug for PasswordCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PasswordCredentials")
            .field("username", &self.username)
            .field("tenant_id", &self.tenant_id)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PhoneOtpCredentials {
    /// E.164, for example `+8613800138000`.
    pub phone: String,
    pub otp_code: String,
}

impl fmt::Debug for PhoneOtpCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhoneOtpCredentials")
            .field("phone", &self.phone)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WechatCredentials {
    pub app_id: String,
    pub js_code: String,
    pub state: Option<String>,
    pub expected_state: Option<String>,
}

#[derive(Clone, Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WecomCredentials {
    pub corp_id: String,
    pub auth_code: String,
    pub state: Option<String>,
    pub expected_state: Option<String>,
}

#[derive(Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct JwtTokenCredentials {
    pub access_token: String,
}

impl fmt::Debug for JwtTokenCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtTokenCredentials").finish_non_exhaustive()
    }
}

/// `method` selects the shape of `credentials`.
#[derive(Clone, Debug, Deserialize, ToSchema)]
#[serde(tag = "method", content = "credentials", rename_all = "snake_case")]
pub enum LoginCredentials {
    Password(PasswordCredentials),
    PhoneOtp(PhoneOtpCredentials),
    Wechat(WechatCredentials),
    Wecom(WecomCredentials),
    JwtToken(JwtTokenCredentials),
}

impl LoginCredentials {
    fn into_parts(self) -> (AuthCredentials, Option<TenantId>) {
        match self {
            Self::Password(c) => (
                AuthCredentials::Password {
                    username: c.username,
                    password: c.password,
                },
                c.tenant_id,
            ),
            Self::PhoneOtp(c) => (
                AuthCredentials::PhoneOtp {
                    phone_e164: c.phone,
                    otp_code: c.otp_code,
                },
                None,
            ),
            Self::Wechat(c) => (
                AuthCredentials::WxMinip {
                    app_id: c.app_id,
                    js_code: c.js_code,
                    state: c.state,
                    expected_state: c.expected_state,
                },
                None,
            ),
            Self::Wecom(c) => (
                AuthCredentials::Wecom {
                    corp_id: c.corp_id,
                    code: c.auth_code,
                    state: c.state,
                    expected_state: c.expected_state,
                },
                None,
            ),
            Self::JwtToken(c) => (
                AuthCredentials::JwtToken {
                    access_token: c.access_token,
                },
                None,
            ),
        }
    }
}

#[derive(Clone, Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    #[serde(flatten)]
    pub credentials: LoginCredentials,
    #[schema(value_type = Option<String>, example = "web")]
    pub audience: Option<Audience>,
    /// Carried into the access token as `sid`.
    pub device_id: Option<String>,
}

#[derive(Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: i64,
}

impl fmt::Debug for LoginResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginResponse")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .finish_non_exhaustive()
    }
}

impl From<TokenPair> for LoginResponse {
    fn from(pair: TokenPair) -> Self {
        Self {
            access_token: pair.access_token,
            refresh_token: pair.refresh_token,
            token_type: TokenPair::TOKEN_TYPE.to_string(),
            expires_in: pair.expires_in,
        }
    }
}

/// Verified access-token claims as returned to callers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TokenClaims {
    pub token_id: String,
    #[schema(value_type = i64)]
    pub user_id: UserId,
    #[schema(value_type = i64)]
    pub account_id: AccountId,
    #[schema(value_type = Option<i64>)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<TenantId>,
    pub issuer: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[schema(value_type = Option<String>)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amr: Option<Amr>,
    pub kid: String,
    pub issued_at: i64,
    pub expires_at: i64,
}

impl TryFrom<AccessClaims> for TokenClaims {
    type Error = Error;

    fn try_from(claims: AccessClaims) -> Result<Self> {
        Ok(Self {
            user_id: claims.user_id()?,
            account_id: claims.account_id()?,
            tenant_id: claims.tenant_id()?,
            token_id: claims.jti,
            issuer: claims.iss,
            audience: claims.aud,
            session_id: claims.sid,
            amr: claims.amr,
            kid: claims.kid,
            issued_at: claims.iat,
            expires_at: claims.exp,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claims: Option<TokenClaims>,
}

#[derive(Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LogoutRequest {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    /// Drop every refresh token of the authenticated user.
    #[serde(default)]
    pub all: bool,
}

impl fmt::Debug for LogoutRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogoutRequest")
            .field("access_token", &self.access_token.is_some())
            .field("refresh_token", &self.refresh_token.is_some())
            .field("all", &self.all)
            .finish()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LogoutResponse {
    /// Refresh tokens deleted by a logout-everywhere request.
    pub revoked_refresh_tokens: u64,
}

/// Caller facts the transport hands through to auditing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestMeta {
    pub remote_ip: Option<String>,
    pub user_agent: Option<String>,
    /// Bearer token from the `Authorization` header, used to authenticate logout-everywhere.
    pub bearer: Option<String>,
}

fn required<'a>(value: &'a str, name: &str) -> Result<&'a str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(Error::invalid_argument(format!("{name} is required")));
    }
    Ok(trimmed)
}

pub struct AuthService {
    authenticator: Arc<Authenticator>,
    tokens: Arc<TokenEngine>,
    users: Arc<dyn UserStatusLookup>,
    request_timeout: Duration,
}

impl fmt::Debug for AuthService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthService")
            .field("authenticator", &self.authenticator)
            .field("tokens", &self.tokens)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl AuthService {
    #[must_use]
    pub fn new(
        authenticator: Arc<Authenticator>,
        tokens: Arc<TokenEngine>,
        users: Arc<dyn UserStatusLookup>,
    ) -> Self {
        Self {
            authenticator,
            tokens,
            users,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn tokens(&self) -> &Arc<TokenEngine> {
        &self.tokens
    }

    /// Dropping the inner future on timeout cancels whatever port call is in flight.
    async fn deadline<T>(&self, operation: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.request_timeout, fut)
            .await
            .unwrap_or_else(|_| {
                Err(Error::new(
                    ErrorKind::DeadlineExceeded,
                    format!("{operation} exceeded {}ms", self.request_timeout.as_millis()),
                ))
            })
    }

    /// # Errors
    /// The public kind of the strategy's failure code, `credential-disabled` for an
    /// inactive user, `invalid-argument` for malformed input.
    #[instrument(skip_all, fields(method))]
    pub async fn login(&self, request: LoginRequest, meta: RequestMeta) -> Result<LoginResponse> {
        self.deadline("login", async {
            let (credentials, tenant_id) = request.credentials.into_parts();
            Span::current().record("method", credentials.scenario().as_str());
            let input = AuthInput::new(credentials)
                .with_tenant_id(tenant_id)
                .with_remote_ip(meta.remote_ip)
                .with_user_agent(meta.user_agent);

            let principal = match self.authenticator.authenticate(&input).await? {
                AuthDecision::Success { principal, .. } => principal,
                AuthDecision::Failure { code, .. } => return Err(code.into_error()),
            };
            if !self.users.is_active(principal.user_id).await? {
                info!(user_id = %principal.user_id, "login refused for inactive user");
                return Err(Error::new(ErrorKind::CredentialDisabled, "user is disabled"));
            }

            let subject = principal.subject(
                request.audience.map(|aud| aud.as_str().to_string()),
                request.device_id.filter(|id| !id.trim().is_empty()),
            );
            let pair = self.tokens.issue(&subject).await?;
            Ok(pair.into())
        })
        .await
    }

    /// # Errors
    /// `token-invalid` for unknown or reused values, `expired` for stale ones.
    pub async fn refresh(&self, refresh_token: &str) -> Result<LoginResponse> {
        self.deadline("refresh", async {
            let refresh_token = required(refresh_token, "refreshToken")?;
            Ok(self.tokens.refresh(refresh_token).await?.into())
        })
        .await
    }

    /// Invalid and expired tokens report `valid: false` instead of an error.
    ///
    /// # Errors
    /// `invalid-argument` for an empty token, `internal` on store failures.
    pub async fn verify(&self, access_token: &str) -> Result<VerifyResponse> {
        self.deadline("verify", async {
            let access_token = required(access_token, "accessToken")?;
            match self.tokens.verify(access_token).await {
                Ok(claims) => Ok(VerifyResponse {
                    valid: true,
                    claims: Some(claims.try_into()?),
                }),
                Err(err) if matches!(err.kind(), ErrorKind::TokenInvalid | ErrorKind::Expired) => {
                    debug!(reason = err.message(), "token did not verify");
                    Ok(VerifyResponse {
                        valid: false,
                        claims: None,
                    })
                }
                Err(err) => Err(err),
            }
        })
        .await
    }

    /// # Errors
    /// `token-invalid` when the signature does not verify.
    pub async fn revoke(&self, access_token: &str) -> Result<()> {
        self.deadline("revoke", async {
            self.tokens
                .revoke(required(access_token, "accessToken")?)
                .await
        })
        .await
    }

    /// # Errors
    /// `invalid-argument` for an empty value.
    pub async fn revoke_refresh(&self, refresh_token: &str) -> Result<()> {
        self.deadline("revoke_refresh", async {
            self.tokens
                .revoke_refresh(required(refresh_token, "refreshToken")?)
                .await
        })
        .await
    }

    /// Revoke whichever tokens are supplied; `all` also drops every refresh token
    /// of the authenticated user.
    ///
    /// # Errors
    /// `invalid-argument` when nothing is supplied, `unauthenticated` when `all` is
    /// requested without a valid access token.
    #[instrument(skip_all, fields(all = request.all))]
    pub async fn logout(&self, request: LogoutRequest, meta: RequestMeta) -> Result<LogoutResponse> {
        self.deadline("logout", async {
            let access = request.access_token.as_deref().map(str::trim).filter(|t| !t.is_empty());
            let refresh = request.refresh_token.as_deref().map(str::trim).filter(|t| !t.is_empty());
            if access.is_none() && refresh.is_none() && !request.all {
                return Err(Error::invalid_argument(
                    "accessToken or refreshToken is required",
                ));
            }

            // Resolve the caller before revoking anything they presented.
            let owner = if request.all {
                let bearer = access.or(meta.bearer.as_deref().map(str::trim));
                let Some(bearer) = bearer.filter(|t| !t.is_empty()) else {
                    return Err(Error::new(
                        ErrorKind::Unauthenticated,
                        "logging out everywhere requires an access token",
                    ));
                };
                let claims = self.tokens.verify(bearer).await.map_err(|err| {
                    if matches!(err.kind(), ErrorKind::TokenInvalid | ErrorKind::Expired) {
                        Error::new(ErrorKind::Unauthenticated, "access token is not valid")
                    } else {
                        err
                    }
                })?;
                Some(claims.user_id()?)
            } else {
                None
            };

            if let Some(access) = access {
                self.tokens.revoke(access).await?;
            }
            if let Some(refresh) = refresh {
                self.tokens.revoke_refresh(refresh).await?;
            }
            let revoked_refresh_tokens = match owner {
                Some(user_id) => self.tokens.revoke_all_refresh(user_id).await?,
                None => 0,
            };
            Ok(LogoutResponse {
                revoked_refresh_tokens,
            })
        })
        .await
    }
}
