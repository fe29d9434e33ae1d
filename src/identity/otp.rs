//! One-time password verification port.

use crate::clock::Clock;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::{collections::HashMap, sync::Arc};
use subtle::ConstantTimeEq;
use tokio::sync::Mutex;
use tracing::debug;

/// Scene under which login codes are issued.
pub const LOGIN_SCENE: &str = "login";

#[async_trait]
pub trait OtpVerifier: Send + Sync {
    /// Check `code` and invalidate it in the same step; a code verifies at most once.
    async fn verify_and_consume(&self, phone_e164: &str, scene: &str, code: &str) -> Result<bool>;
}

#[derive(Debug)]
struct PendingCode {
    code: String,
    expires_at: DateTime<Utc>,
}

/// Process-local code store; issuing is left to whatever delivers the SMS.
#[derive(Debug)]
pub struct MemoryOtpVerifier {
    codes: Mutex<HashMap<(String, String), PendingCode>>,
    clock: Arc<dyn Clock>,
}

impl MemoryOtpVerifier {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            codes: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Register `code` for `(phone, scene)`, replacing any pending one.
    pub async fn issue(&self, phone_e164: &str, scene: &str, code: &str, ttl: Duration) {
        let expires_at = self.clock.now() + ttl;
        self.codes.lock().await.insert(
            (phone_e164.to_string(), scene.to_string()),
            PendingCode {
                code: code.to_string(),
                expires_at,
            },
        );
    }
}

#[async_trait]
impl OtpVerifier for MemoryOtpVerifier {
    async fn verify_and_consume(&self, phone_e164: &str, scene: &str, code: &str) -> Result<bool> {
        let now = self.clock.now();
        let key = (phone_e164.to_string(), scene.to_string());
        let mut codes = self.codes.lock().await;
        let Some(pending) = codes.get(&key) else {
            return Ok(false);
        };
        if pending.expires_at <= now {
            codes.remove(&key);
            debug!(scene, "otp expired");
            return Ok(false);
        }
        let matches: bool = pending.code.as_bytes().ct_eq(code.as_bytes()).into();
        if matches {
            codes.remove(&key);
        }
        Ok(matches)
    }
}
