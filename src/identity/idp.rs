//! OAuth code exchange port for WeChat mini programs and WeCom.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Identity returned by the mini-program `code2Session` exchange.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WxMinipIdentity {
    pub open_id: String,
    pub union_id: Option<String>,
}

/// Identity returned by the WeCom OAuth exchange.
///
/// Corp members come back with `user_id`, outside users with `open_user_id`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WecomIdentity {
    pub open_user_id: Option<String>,
    pub user_id: Option<String>,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn exchange_wx_minip_code(&self, app_id: &str, js_code: &str) -> Result<WxMinipIdentity>;
    async fn exchange_wecom_code(&self, corp_id: &str, code: &str) -> Result<WecomIdentity>;
}

/// Provider answering from a fixed table of single-use codes; for local runs and tests.
#[derive(Debug, Default)]
pub struct StaticIdentityProvider {
    wx_minip: Mutex<HashMap<(String, String), WxMinipIdentity>>,
    wecom: Mutex<HashMap<(String, String), WecomIdentity>>,
}

impl StaticIdentityProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_wx_minip_code(&self, app_id: &str, js_code: &str, identity: WxMinipIdentity) {
        self.wx_minip
            .lock()
            .await
            .insert((app_id.to_string(), js_code.to_string()), identity);
    }

    pub async fn add_wecom_code(&self, corp_id: &str, code: &str, identity: WecomIdentity) {
        self.wecom
            .lock()
            .await
            .insert((corp_id.to_string(), code.to_string()), identity);
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentityProvider {
    async fn exchange_wx_minip_code(&self, app_id: &str, js_code: &str) -> Result<WxMinipIdentity> {
        self.wx_minip
            .lock()
            .await
            .remove(&(app_id.to_string(), js_code.to_string()))
            .ok_or_else(|| anyhow!("code2session rejected js_code for app {app_id}"))
    }

    async fn exchange_wecom_code(&self, corp_id: &str, code: &str) -> Result<WecomIdentity> {
        self.wecom
            .lock()
            .await
            .remove(&(corp_id.to_string(), code.to_string()))
            .ok_or_else(|| anyhow!("getuserinfo rejected code for corp {corp_id}"))
    }
}
