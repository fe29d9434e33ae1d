//! Accounts, their credentials, and the repositories that persist them.

pub mod credential;
pub mod memory;
pub mod model;
pub mod postgres;
pub mod repo;
pub mod service;

pub use credential::{Credential, CredentialKind, CredentialUsage, LockoutPolicy, is_e164};
pub use memory::MemoryAccountStore;
pub use model::{Account, NewAccount};
pub use postgres::PgAccountStore;
pub use repo::{
    AccountRepo, CredentialMatch, CredentialRepo, UnitOfWork, UnitOfWorkFactory, UpdateOutcome,
};
pub use service::AccountService;
