//! WeChat mini-program and WeCom exchanges over their HTTPS APIs.
//!
//! Mini programs use `sns/jscode2session`; WeCom needs a corp access token
//! (cached until shortly before expiry) and then `cgi-bin/auth/getuserinfo`.

use super::idp::{IdentityProvider, WecomIdentity, WxMinipIdentity};
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::{
    collections::HashMap,
    fmt,
    time::{Duration, Instant},
};
use tokio::sync::RwLock;
use tracing::{debug, instrument};

const WX_API_BASE: &str = "https://api.weixin.qq.com";
const WECOM_API_BASE: &str = "https://qyapi.weixin.qq.com";
/// Refresh the corp token this long before WeCom says it expires.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct Code2SessionResponse {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: Option<String>,
    #[serde(default)]
    openid: Option<String>,
    #[serde(default)]
    unionid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CorpTokenResponse {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct UserInfoResponse {
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: Option<String>,
    #[serde(default, alias = "UserId")]
    userid: Option<String>,
    #[serde(default, alias = "OpenId")]
    openid: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

fn parse_code2session(body: Code2SessionResponse) -> Result<WxMinipIdentity> {
    if body.errcode != 0 {
        return Err(anyhow!(
            "code2session failed: errcode={} errmsg={}",
            body.errcode,
            body.errmsg.unwrap_or_default()
        ));
    }
    let open_id = non_empty(body.openid).context("openid is empty in code2session result")?;
    Ok(WxMinipIdentity {
        open_id,
        union_id: non_empty(body.unionid),
    })
}

fn parse_user_info(body: UserInfoResponse) -> Result<WecomIdentity> {
    if body.errcode != 0 {
        return Err(anyhow!(
            "getuserinfo failed: errcode={} errmsg={}",
            body.errcode,
            body.errmsg.unwrap_or_default()
        ));
    }
    let identity = WecomIdentity {
        open_user_id: non_empty(body.openid),
        user_id: non_empty(body.userid),
    };
    if identity.open_user_id.is_none() && identity.user_id.is_none() {
        return Err(anyhow!("getuserinfo returned neither userid nor openid"));
    }
    Ok(identity)
}

struct CachedToken {
    token: SecretString,
    expires_at: Instant,
}

pub struct WechatIdentityProvider {
    client: Client,
    wx_base: String,
    wecom_base: String,
    /// appId -> appSecret
    minip_secrets: HashMap<String, SecretString>,
    /// corpId -> corpSecret
    wecom_secrets: HashMap<String, SecretString>,
    corp_tokens: RwLock<HashMap<String, CachedToken>>,
}

impl fmt::Debug for WechatIdentityProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WechatIdentityProvider")
            .field("wx_base", &self.wx_base)
            .field("wecom_base", &self.wecom_base)
            .field("minip_apps", &self.minip_secrets.keys().collect::<Vec<_>>())
            .field("wecom_corps", &self.wecom_secrets.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl WechatIdentityProvider {
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(
        minip_secrets: HashMap<String, SecretString>,
        wecom_secrets: HashMap<String, SecretString>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .user_agent(crate::APP_USER_AGENT)
            .timeout(timeout)
            .build()
            .context("Failed to build identity provider HTTP client")?;
        Ok(Self {
            client,
            wx_base: WX_API_BASE.to_string(),
            wecom_base: WECOM_API_BASE.to_string(),
            minip_secrets,
            wecom_secrets,
            corp_tokens: RwLock::new(HashMap::new()),
        })
    }

    /// Point both APIs at another host, e.g. a local stub.
    #[must_use]
    pub fn with_base_urls(mut self, wx_base: impl Into<String>, wecom_base: impl Into<String>) -> Self {
        self.wx_base = wx_base.into();
        self.wecom_base = wecom_base.into();
        self
    }

    async fn corp_token(&self, corp_id: &str) -> Result<String> {
        if let Some(cached) = self.corp_tokens.read().await.get(corp_id)
            && cached.expires_at > Instant::now()
        {
            return Ok(cached.token.expose_secret().to_string());
        }

        let secret = self
            .wecom_secrets
            .get(corp_id)
            .ok_or_else(|| anyhow!("wecom config not found for corpId: {corp_id}"))?;
        let url = format!("{}/cgi-bin/gettoken", self.wecom_base);
        let body: CorpTokenResponse = self
            .client
            .get(url)
            .query(&[("corpid", corp_id), ("corpsecret", secret.expose_secret())])
            .send()
            .await
            .context("Failed to call wecom gettoken")?
            .error_for_status()
            .context("wecom gettoken returned an error status")?
            .json()
            .await
            .context("Failed to decode wecom gettoken response")?;
        if body.errcode != 0 {
            return Err(anyhow!(
                "wecom gettoken failed: errcode={} errmsg={}",
                body.errcode,
                body.errmsg.unwrap_or_default()
            ));
        }
        let token = non_empty(body.access_token).context("wecom gettoken returned no token")?;
        let ttl = Duration::from_secs(body.expires_in.unwrap_or(7200))
            .saturating_sub(TOKEN_EXPIRY_MARGIN);
        self.corp_tokens.write().await.insert(
            corp_id.to_string(),
            CachedToken {
                token: SecretString::from(token.clone()),
                expires_at: Instant::now() + ttl,
            },
        );
        debug!(corp_id, "wecom corp token refreshed");
        Ok(token)
    }
}

#[async_trait]
impl IdentityProvider for WechatIdentityProvider {
    #[instrument(skip(self, js_code))]
    async fn exchange_wx_minip_code(&self, app_id: &str, js_code: &str) -> Result<WxMinipIdentity> {
        let secret = self
            .minip_secrets
            .get(app_id)
            .ok_or_else(|| anyhow!("wx minip app secret not found for appId: {app_id}"))?;
        let url = format!("{}/sns/jscode2session", self.wx_base);
        let body: Code2SessionResponse = self
            .client
            .get(url)
            .query(&[
                ("appid", app_id),
                ("secret", secret.expose_secret()),
                ("js_code", js_code),
                ("grant_type", "authorization_code"),
            ])
            .send()
            .await
            .context("Failed to call code2session")?
            .error_for_status()
            .context("code2session returned an error status")?
            .json()
            .await
            .context("Failed to decode code2session response")?;
        parse_code2session(body)
    }

    #[instrument(skip(self, code))]
    async fn exchange_wecom_code(&self, corp_id: &str, code: &str) -> Result<WecomIdentity> {
        let token = self.corp_token(corp_id).await?;
        let url = format!("{}/cgi-bin/auth/getuserinfo", self.wecom_base);
        let body: UserInfoResponse = self
            .client
            .get(url)
            .query(&[("access_token", token.as_str()), ("code", code)])
            .send()
            .await
            .context("Failed to call wecom getuserinfo")?
            .error_for_status()
            .context("wecom getuserinfo returned an error status")?
            .json()
            .await
            .context("Failed to decode wecom getuserinfo response")?;
        parse_user_info(body)
    }
}
