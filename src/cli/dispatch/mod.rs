//! Maps validated CLI matches to an [`Action`], building the domain
//! configuration objects and rejecting inconsistent combinations up front.

use crate::{
    account::LockoutPolicy,
    cli::{
        actions::{Action, server::Args},
        commands::{
            ARG_ADMIN_TOKEN, ARG_DSN, ARG_PORT, ARG_REDIS_URL, ARG_REQUEST_TIMEOUT, credentials,
            idp, tokens,
        },
    },
    identity::Argon2Params,
    jwks::{Algorithm, RotationPolicy},
    token::TokenConfig,
};
use anyhow::{Context, Result, anyhow};
use clap::ArgMatches;
use secrecy::SecretString;
use std::{collections::HashMap, time::Duration};

fn required<T: Clone + Send + Sync + 'static>(matches: &ArgMatches, name: &str) -> Result<T> {
    matches
        .get_one::<T>(name)
        .cloned()
        .with_context(|| format!("missing required argument: --{name}"))
}

fn seconds(matches: &ArgMatches, name: &str) -> Result<chrono::Duration> {
    required::<i64>(matches, name).map(chrono::Duration::seconds)
}

fn id_secrets(matches: &ArgMatches, name: &str) -> HashMap<String, SecretString> {
    matches
        .get_many::<String>(name)
        .into_iter()
        .flatten()
        .filter_map(|pair| pair.split_once('='))
        .map(|(id, secret)| (id.trim().to_string(), SecretString::from(secret.to_string())))
        .collect()
}

fn token_config(matches: &ArgMatches) -> Result<TokenConfig> {
    let config = TokenConfig::new()
        .with_issuer(required::<String>(matches, tokens::ARG_ISSUER)?)
        .with_access_ttl(seconds(matches, tokens::ARG_ACCESS_TOKEN_TTL)?)
        .with_refresh_ttl(seconds(matches, tokens::ARG_REFRESH_TOKEN_TTL)?);
    config.validate()?;
    Ok(config)
}

fn rotation_policy(matches: &ArgMatches) -> Result<RotationPolicy> {
    let policy = RotationPolicy::new()
        .with_rotation_interval(seconds(matches, tokens::ARG_ROTATION_INTERVAL)?)
        .with_grace_period(seconds(matches, tokens::ARG_GRACE_PERIOD)?)
        .with_max_keys_in_jwks(required(matches, tokens::ARG_MAX_KEYS_IN_JWKS)?);
    policy.validate()?;
    Ok(policy)
}

fn lockout_policy(matches: &ArgMatches) -> Result<LockoutPolicy> {
    let policy = LockoutPolicy::new()
        .with_enabled(required(matches, credentials::ARG_LOCKOUT_ENABLED)?)
        .with_threshold(required(matches, credentials::ARG_LOCKOUT_THRESHOLD)?)
        .with_lock_duration(seconds(matches, credentials::ARG_LOCKOUT_DURATION)?);
    policy.validate()?;
    Ok(policy)
}

/// Map validated CLI matches to a server action.
///
/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>(ARG_PORT).copied().unwrap_or(8080);

    let signing_algorithm: Algorithm = required::<String>(matches, tokens::ARG_SIGNING_ALGORITHM)?
        .parse()
        .map_err(|err| anyhow!("invalid --{}: {err}", tokens::ARG_SIGNING_ALGORITHM))?;

    let argon2 = Argon2Params::new()
        .with_m_cost(required(matches, credentials::ARG_ARGON2_M_COST)?)
        .with_t_cost(required(matches, credentials::ARG_ARGON2_T_COST)?)
        .with_p_cost(required(matches, credentials::ARG_ARGON2_P_COST)?);

    Ok(Action::Server(Args {
        port,
        dsn: matches.get_one::<String>(ARG_DSN).cloned(),
        redis_url: matches.get_one::<String>(ARG_REDIS_URL).cloned(),
        admin_token: matches
            .get_one::<String>(ARG_ADMIN_TOKEN)
            .filter(|token| !token.trim().is_empty())
            .map(|token| SecretString::from(token.clone())),
        request_timeout: Duration::from_secs(required(matches, ARG_REQUEST_TIMEOUT)?),
        token: token_config(matches)?,
        signing_algorithm,
        rotation: rotation_policy(matches)?,
        key_refresh_interval: seconds(matches, tokens::ARG_KEY_REFRESH_INTERVAL)?,
        bootstrap_key: required(matches, tokens::ARG_BOOTSTRAP_KEY)?,
        lockout: lockout_policy(matches)?,
        password_pepper: SecretString::from(required::<String>(
            matches,
            credentials::ARG_PASSWORD_PEPPER,
        )?),
        argon2,
        wx_minip_apps: id_secrets(matches, idp::ARG_WX_MINIP_APP),
        wecom_corps: id_secrets(matches, idp::ARG_WECOM_CORP),
        idp_timeout: Duration::from_secs(required(matches, idp::ARG_IDP_TIMEOUT)?),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    const CLEARED: [(&str, Option<&str>); 6] = [
        ("AUTHN_DSN", None),
        ("AUTHN_ADMIN_TOKEN", None),
        ("AUTHN_SIGNING_ALGORITHM", None),
        ("AUTHN_GRACE_PERIOD", None),
        ("AUTHN_WX_MINIP_APPS", None),
        ("AUTHN_LOCKOUT_THRESHOLD", None),
    ];

    fn server_args(argv: &[&str]) -> Result<Args> {
        let matches = crate::cli::commands::new().get_matches_from(argv);
        match handler(&matches)? {
            Action::Server(args) => Ok(args),
        }
    }

    #[test]
    fn defaults_run_in_memory() {
        temp_env::with_vars(CLEARED, || {
            let args = server_args(&["authn"]);
            assert!(args.is_ok());
            if let Ok(args) = args {
                assert_eq!(args.port, 8080);
                assert!(args.dsn.is_none());
                assert!(args.admin_token.is_none());
                assert_eq!(args.signing_algorithm, Algorithm::Rs256);
                assert_eq!(args.token.access_ttl(), chrono::Duration::minutes(15));
                assert_eq!(args.lockout.threshold(), 5);
                assert_eq!(args.request_timeout, Duration::from_secs(10));
                assert!(args.bootstrap_key);
            }
        });
    }

    #[test]
    fn environment_configures_server() {
        temp_env::with_vars(
            [
                ("AUTHN_DSN", Some("postgres://user@localhost:5432/authn")),
                ("AUTHN_ADMIN_TOKEN", Some("s3cret")),
                ("AUTHN_SIGNING_ALGORITHM", Some("ES256")),
                ("AUTHN_GRACE_PERIOD", None),
                ("AUTHN_WX_MINIP_APPS", Some("wx1=secret1,wx2=secret2")),
                ("AUTHN_LOCKOUT_THRESHOLD", Some("3")),
            ],
            || {
                let args = server_args(&["authn"]);
                assert!(args.is_ok());
                if let Ok(args) = args {
                    assert_eq!(
                        args.dsn.as_deref(),
                        Some("postgres://user@localhost:5432/authn")
                    );
                    assert_eq!(
                        args.admin_token.as_ref().map(ExposeSecret::expose_secret),
                        Some("s3cret")
                    );
                    assert_eq!(args.signing_algorithm, Algorithm::Es256);
                    assert_eq!(args.lockout.threshold(), 3);
                    assert_eq!(args.wx_minip_apps.len(), 2);
                    assert_eq!(
                        args.wx_minip_apps.get("wx2").map(ExposeSecret::expose_secret),
                        Some("secret2")
                    );
                }
            },
        );
    }

    #[test]
    fn grace_period_must_be_shorter_than_rotation() {
        temp_env::with_vars(CLEARED, || {
            let result = server_args(&[
                "authn",
                "--rotation-interval",
                "3600",
                "--grace-period",
                "7200",
            ]);
            assert!(result.is_err());
        });
    }

    #[test]
    fn unknown_algorithm_is_rejected() {
        temp_env::with_vars(CLEARED, || {
            let result = server_args(&["authn", "--signing-algorithm", "HS256"]);
            assert!(result.is_err());
            if let Err(err) = result {
                assert!(err.to_string().contains("signing-algorithm"));
            }
        });
    }
}
