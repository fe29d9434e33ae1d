use clap::{Arg, ArgAction, Command, builder::BoolishValueParser};

pub const ARG_LOCKOUT_ENABLED: &str = "lockout-enabled";
pub const ARG_LOCKOUT_THRESHOLD: &str = "lockout-threshold";
pub const ARG_LOCKOUT_DURATION: &str = "lockout-duration";
pub const ARG_PASSWORD_PEPPER: &str = "password-pepper";
pub const ARG_ARGON2_M_COST: &str = "argon2-m-cost";
pub const ARG_ARGON2_T_COST: &str = "argon2-t-cost";
pub const ARG_ARGON2_P_COST: &str = "argon2-p-cost";

#[must_use]
pub fn with_args(command: Command) -> Command {
    let command = with_lockout_args(command);
    with_password_args(command)
}

fn with_lockout_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_LOCKOUT_ENABLED)
                .long("lockout-enabled")
                .help("Lock password credentials after repeated failures")
                .env("AUTHN_LOCKOUT_ENABLED")
                .default_value("true")
                .action(ArgAction::Set)
                .value_parser(BoolishValueParser::new()),
        )
        .arg(
            Arg::new(ARG_LOCKOUT_THRESHOLD)
                .long("lockout-threshold")
                .help("Consecutive failures that lock a credential")
                .env("AUTHN_LOCKOUT_THRESHOLD")
                .default_value("5")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new(ARG_LOCKOUT_DURATION)
                .long("lockout-duration")
                .help("Lock duration in seconds")
                .env("AUTHN_LOCKOUT_DURATION")
                .default_value("1800")
                .value_parser(clap::value_parser!(i64)),
        )
}

fn with_password_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_PASSWORD_PEPPER)
                .long("password-pepper")
                .help("Secret appended to every password before hashing")
                .env("AUTHN_PASSWORD_PEPPER")
                .hide_env_values(true)
                .default_value(""),
        )
        .arg(
            Arg::new(ARG_ARGON2_M_COST)
                .long("argon2-m-cost")
                .help("Argon2id memory cost in KiB")
                .env("AUTHN_ARGON2_M_COST")
                .default_value("19456")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new(ARG_ARGON2_T_COST)
                .long("argon2-t-cost")
                .help("Argon2id iterations")
                .env("AUTHN_ARGON2_T_COST")
                .default_value("2")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new(ARG_ARGON2_P_COST)
                .long("argon2-p-cost")
                .help("Argon2id parallelism")
                .env("AUTHN_ARGON2_P_COST")
                .default_value("1")
                .value_parser(clap::value_parser!(u32)),
        )
}
