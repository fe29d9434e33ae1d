use crate::{
    Error, Result,
    types::{AccountId, AccountStatus, AccountType, UserId},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The stable anchor a user has with one provider.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub user_id: UserId,
    pub account_type: AccountType,
    pub app_id: Option<String>,
    pub external_id: String,
    pub union_id: Option<String>,
    pub status: AccountStatus,
    pub profile: Map<String, Value>,
    pub meta: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields supplied when creating an account; the store assigns the id.
#[derive(Clone, Debug)]
pub struct NewAccount {
    pub user_id: UserId,
    pub account_type: AccountType,
    pub app_id: Option<String>,
    pub external_id: String,
    pub union_id: Option<String>,
    pub status: AccountStatus,
    pub profile: Map<String, Value>,
    pub meta: Map<String, Value>,
}

impl NewAccount {
    #[must_use]
    pub fn new(user_id: UserId, account_type: AccountType, external_id: impl Into<String>) -> Self {
        Self {
            user_id,
            account_type,
            app_id: None,
            external_id: external_id.into(),
            union_id: None,
            status: AccountStatus::Active,
            profile: Map::new(),
            meta: Map::new(),
        }
    }

    #[must_use]
    pub fn with_app_id(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = Some(app_id.into());
        self
    }

    #[must_use]
    pub fn with_union_id(mut self, union_id: impl Into<String>) -> Self {
        self.union_id = Some(union_id.into());
        self
    }

    #[must_use]
    pub const fn with_status(mut self, status: AccountStatus) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub fn with_profile(mut self, profile: Map<String, Value>) -> Self {
        self.profile = profile;
        self
    }

    /// Check the domain-level shape before the store enforces uniqueness.
    ///
    /// # Errors
    /// Returns `invalid-argument` when the external id is empty, a WeChat-family
    /// account lacks an `appId`, or an operation account carries one.
    pub fn validate(&self) -> Result<()> {
        if self.external_id.trim().is_empty() {
            return Err(Error::invalid_argument("externalId cannot be empty"));
        }
        let has_app_id = self.app_id.as_deref().is_some_and(|id| !id.trim().is_empty());
        if self.account_type.requires_app_id() && !has_app_id {
            return Err(Error::invalid_argument(format!(
                "appId is required for {} accounts",
                self.account_type
            )));
        }
        if !self.account_type.requires_app_id() && self.app_id.is_some() {
            return Err(Error::invalid_argument(
                "operation accounts cannot carry an appId",
            ));
        }
        if self.union_id.as_deref().is_some_and(|id| id.trim().is_empty()) {
            return Err(Error::invalid_argument("unionId cannot be blank"));
        }
        Ok(())
    }
}

impl AccountStatus {
    /// Allowed moves of the account status machine; self-moves are always allowed.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use AccountStatus::{Active, Archived, Deleted, Disabled};
        if self as u8 == next as u8 {
            return true;
        }
        matches!(
            (self, next),
            (Disabled, Active | Archived | Deleted)
                | (Active, Disabled | Archived | Deleted)
                | (Archived, Active | Deleted)
        )
    }
}

impl Account {
    /// Move the account to `next`.
    ///
    /// Returns `true` when the status changed, `false` for an idempotent self-transition.
    ///
    /// # Errors
    /// Returns `invalid-state-transition` when the status machine forbids the move.
    pub fn transition_to(&mut self, next: AccountStatus, now: DateTime<Utc>) -> Result<bool> {
        if self.status == next {
            return Ok(false);
        }
        if !self.status.can_transition_to(next) {
            return Err(Error::invalid_transition(format!(
                "account {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        self.updated_at = now;
        Ok(true)
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(status: AccountStatus) -> Account {
        let now = Utc::now();
        Account {
            id: AccountId::new(200),
            user_id: UserId::new(100),
            account_type: AccountType::Operation,
            app_id: None,
            external_id: "alice".to_string(),
            union_id: None,
            status,
            profile: Map::new(),
            meta: Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn status_machine_table() {
        use AccountStatus::{Active, Archived, Deleted, Disabled};
        let allowed = [
            (Disabled, Active),
            (Disabled, Archived),
            (Disabled, Deleted),
            (Active, Disabled),
            (Active, Archived),
            (Active, Deleted),
            (Archived, Active),
            (Archived, Deleted),
        ];
        for from in AccountStatus::ALL {
            for to in AccountStatus::ALL {
                let expected = from == to || allowed.contains(&(*from, *to));
                assert_eq!(
                    from.can_transition_to(*to),
                    expected,
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn deleted_is_terminal() {
        let mut acc = account(AccountStatus::Deleted);
        for next in [
            AccountStatus::Active,
            AccountStatus::Disabled,
            AccountStatus::Archived,
        ] {
            let err = acc.transition_to(next, Utc::now()).err();
            assert_eq!(
                err.map(|e| e.kind()),
                Some(crate::ErrorKind::InvalidStateTransition)
            );
        }
        assert_eq!(acc.status, AccountStatus::Deleted);
    }

    #[test]
    fn self_transition_is_idempotent() {
        let mut acc = account(AccountStatus::Active);
        assert_eq!(acc.transition_to(AccountStatus::Active, Utc::now()).ok(), Some(false));
        assert_eq!(acc.transition_to(AccountStatus::Archived, Utc::now()).ok(), Some(true));
        assert_eq!(acc.status, AccountStatus::Archived);
    }

    #[test]
    fn archived_cannot_be_disabled() {
        let mut acc = account(AccountStatus::Archived);
        assert!(acc.transition_to(AccountStatus::Disabled, Utc::now()).is_err());
    }

    #[test]
    fn new_account_validation() {
        let ok = NewAccount::new(UserId::new(1), AccountType::Operation, "alice");
        assert!(ok.validate().is_ok());

        let missing_app = NewAccount::new(UserId::new(1), AccountType::WcMinip, "openid-1");
        assert!(missing_app.validate().is_err());

        let with_app = missing_app.with_app_id("wx123");
        assert!(with_app.validate().is_ok());

        let op_with_app =
            NewAccount::new(UserId::new(1), AccountType::Operation, "bob").with_app_id("wx123");
        assert!(op_with_app.validate().is_err());

        let empty = NewAccount::new(UserId::new(1), AccountType::Operation, " ");
        assert!(empty.validate().is_err());
    }
}
