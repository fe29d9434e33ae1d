use clap::{Arg, ArgAction, Command, builder::ValueParser};

pub const ARG_WX_MINIP_APP: &str = "wx-minip-app";
pub const ARG_WECOM_CORP: &str = "wecom-corp";
pub const ARG_IDP_TIMEOUT: &str = "idp-timeout";

/// Accepts `ID=SECRET` with both halves non-empty.
#[must_use]
pub fn validator_id_secret() -> ValueParser {
    ValueParser::from(move |value: &str| -> std::result::Result<String, String> {
        match value.split_once('=') {
            Some((id, secret)) if !id.trim().is_empty() && !secret.is_empty() => {
                Ok(value.to_string())
            }
            _ => Err("expected ID=SECRET".to_string()),
        }
    })
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_WX_MINIP_APP)
                .long("wx-minip-app")
                .help("WeChat mini-program credentials as APPID=SECRET, repeatable")
                .env("AUTHN_WX_MINIP_APPS")
                .hide_env_values(true)
                .value_delimiter(',')
                .action(ArgAction::Append)
                .value_parser(validator_id_secret()),
        )
        .arg(
            Arg::new(ARG_WECOM_CORP)
                .long("wecom-corp")
                .help("WeCom corp credentials as CORPID=SECRET, repeatable")
                .env("AUTHN_WECOM_CORPS")
                .hide_env_values(true)
                .value_delimiter(',')
                .action(ArgAction::Append)
                .value_parser(validator_id_secret()),
        )
        .arg(
            Arg::new(ARG_IDP_TIMEOUT)
                .long("idp-timeout")
                .help("Deadline for identity provider exchanges in seconds")
                .env("AUTHN_IDP_TIMEOUT")
                .default_value("5")
                .value_parser(clap::value_parser!(u64).range(1..)),
        )
}
