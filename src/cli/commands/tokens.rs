use clap::{Arg, ArgAction, Command, builder::BoolishValueParser};

pub const ARG_ISSUER: &str = "issuer";
pub const ARG_ACCESS_TOKEN_TTL: &str = "access-token-ttl";
pub const ARG_REFRESH_TOKEN_TTL: &str = "refresh-token-ttl";
pub const ARG_SIGNING_ALGORITHM: &str = "signing-algorithm";
pub const ARG_ROTATION_INTERVAL: &str = "rotation-interval";
pub const ARG_GRACE_PERIOD: &str = "grace-period";
pub const ARG_MAX_KEYS_IN_JWKS: &str = "max-keys-in-jwks";
pub const ARG_KEY_REFRESH_INTERVAL: &str = "key-refresh-interval";
pub const ARG_BOOTSTRAP_KEY: &str = "bootstrap-key";

#[must_use]
pub fn with_args(command: Command) -> Command {
    let command = with_token_args(command);
    with_key_args(command)
}

fn with_token_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_ISSUER)
                .long("issuer")
                .help("Value of the `iss` claim")
                .env("AUTHN_ISSUER")
                .default_value("authn"),
        )
        .arg(
            Arg::new(ARG_ACCESS_TOKEN_TTL)
                .long("access-token-ttl")
                .help("Access token lifetime in seconds")
                .env("AUTHN_ACCESS_TOKEN_TTL")
                .default_value("900")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
        .arg(
            Arg::new(ARG_REFRESH_TOKEN_TTL)
                .long("refresh-token-ttl")
                .help("Refresh token lifetime in seconds")
                .env("AUTHN_REFRESH_TOKEN_TTL")
                .default_value("604800")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
        .arg(
            Arg::new(ARG_SIGNING_ALGORITHM)
                .long("signing-algorithm")
                .help("Algorithm for new signing keys: RS256, RS384, RS512, ES256, ES384")
                .env("AUTHN_SIGNING_ALGORITHM")
                .default_value("RS256"),
        )
}

fn with_key_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_ROTATION_INTERVAL)
                .long("rotation-interval")
                .help("Signing key rotation interval in seconds")
                .env("AUTHN_ROTATION_INTERVAL")
                .default_value("2592000")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
        .arg(
            Arg::new(ARG_GRACE_PERIOD)
                .long("grace-period")
                .help("How long a rotated key keeps verifying, in seconds")
                .env("AUTHN_GRACE_PERIOD")
                .default_value("604800")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
        .arg(
            Arg::new(ARG_MAX_KEYS_IN_JWKS)
                .long("max-keys-in-jwks")
                .help("Upper bound of keys published in the JWKS")
                .env("AUTHN_MAX_KEYS_IN_JWKS")
                .default_value("3")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new(ARG_KEY_REFRESH_INTERVAL)
                .long("key-refresh-interval")
                .help("Seconds between reloads of the published key set")
                .env("AUTHN_KEY_REFRESH_INTERVAL")
                .default_value("300")
                .value_parser(clap::value_parser!(i64).range(1..)),
        )
        .arg(
            Arg::new(ARG_BOOTSTRAP_KEY)
                .long("bootstrap-key")
                .help("Create an active signing key at startup when none exists")
                .env("AUTHN_BOOTSTRAP_KEY")
                .default_value("true")
                .action(ArgAction::Set)
                .value_parser(BoolishValueParser::new()),
        )
}
