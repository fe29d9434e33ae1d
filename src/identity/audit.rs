//! Audit trail of authentication attempts.

use crate::types::{AccountId, CredentialId, Scenario, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AuthAuditEvent {
    pub scenario: Scenario,
    pub account_id: Option<AccountId>,
    pub user_id: Option<UserId>,
    pub credential_id: Option<CredentialId>,
    pub success: bool,
    pub err_code: Option<String>,
    pub remote_ip: Option<String>,
    pub user_agent: Option<String>,
    pub at: DateTime<Utc>,
}

/// Sinks must not fail the attempt they record, so there is no error channel.
#[async_trait]
pub trait AuditLogger: Send + Sync {
    async fn record(&self, event: AuthAuditEvent);
}

/// Emits each event as a structured `tracing` record under the `audit` target.
#[derive(Clone, Debug)]
pub struct TracingAuditLogger;

#[async_trait]
impl AuditLogger for TracingAuditLogger {
    async fn record(&self, event: AuthAuditEvent) {
        info!(
            target: "audit",
            scenario = %event.scenario,
            account_id = event.account_id.map(|id| id.get()),
            user_id = event.user_id.map(|id| id.get()),
            credential_id = event.credential_id.map(|id| id.get()),
            success = event.success,
            err_code = event.err_code.as_deref(),
            remote_ip = event.remote_ip.as_deref(),
            user_agent = event.user_agent.as_deref(),
            at = %event.at.to_rfc3339(),
            "authentication attempt"
        );
    }
}
