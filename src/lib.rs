//! Authentication pipeline and token lifecycle.
//!
//! The crate turns typed credential submissions into an authenticated
//! principal, issues short-lived access tokens with rotatable refresh tokens,
//! and manages the signing keys (and their public JWKS view) that every access
//! token is verified against.
//!
//! Layering, leaves first: [`types`] and [`account`] hold the data model,
//! [`identity`] the external ports, [`authentication`] the strategy engine,
//! [`jwks`] the signing-key manager, [`token`] the token engine, and
//! [`service`] the façade the HTTP layer in [`api`] talks to.

pub mod account;
pub mod api;
pub mod authentication;
pub mod cli;
pub mod clock;
pub mod error;
pub mod identity;
pub mod jwks;
pub mod service;
pub mod token;
pub mod types;

pub use error::{Error, ErrorKind, Result};

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub static APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);
