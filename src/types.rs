//! Strongly-typed identifiers and the string-backed enums persisted alongside them.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            #[must_use]
            pub const fn new(value: i64) -> Self {
                Self(value)
            }

            #[must_use]
            pub const fn get(self) -> i64 {
                self.0
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                s.parse::<i64>().map(Self).map_err(|_| {
                    Error::invalid_argument(format!(
                        "{} must be a 64-bit integer: {s}",
                        stringify!($name)
                    ))
                })
            }
        }
    };
}

/// Defines an enum stored and exchanged as a fixed lowercase string.
macro_rules! str_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $($(#[$vmeta:meta])* $variant:ident => $text:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, ::serde::Serialize, ::serde::Deserialize)]
        $vis enum $name {
            $($(#[$vmeta])* #[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [Self] = &[$(Self::$variant),+];

            #[must_use]
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ::std::str::FromStr for $name {
            type Err = $crate::Error;

            fn from_str(s: &str) -> ::std::result::Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err($crate::Error::invalid_argument(format!(
                        "unknown {} '{other}'",
                        stringify!($name)
                    ))),
                }
            }
        }
    };
}

pub(crate) use str_enum;

id_type!(
    /// Reference into the user aggregate, which lives outside this crate.
    UserId
);
id_type!(AccountId);
id_type!(CredentialId);
id_type!(TenantId);

/// Key identifier carried in JWS headers and JWK documents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Kid(String);

impl Kid {
    /// # Errors
    /// Returns `invalid-argument` when the value is empty or only whitespace.
    pub fn new(value: impl Into<String>) -> Result<Self> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(Error::invalid_argument("kid cannot be empty"));
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Kid {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Kid> for String {
    fn from(kid: Kid) -> Self {
        kid.0
    }
}

impl fmt::Display for Kid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Kid {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

str_enum! {
    /// Which provider an account is anchored to.
    pub enum AccountType {
        WcMinip => "wc-minip",
        WcOffi => "wc-offi",
        WcCom => "wc-com",
        Operation => "operation",
    }
}

impl AccountType {
    /// WeChat-family accounts are scoped to an application and need an `appId`.
    #[must_use]
    pub const fn requires_app_id(self) -> bool {
        !matches!(self, Self::Operation)
    }
}

str_enum! {
    pub enum AccountStatus {
        Disabled => "disabled",
        Active => "active",
        Archived => "archived",
        Deleted => "deleted",
    }
}

str_enum! {
    pub enum CredentialType {
        Password => "password",
        PhoneOtp => "phone_otp",
        OauthWxMinip => "oauth_wx_minip",
        OauthWecom => "oauth_wecom",
    }
}

str_enum! {
    pub enum CredentialStatus {
        Enabled => "enabled",
        Disabled => "disabled",
    }
}

str_enum! {
    /// External identity provider a credential is matched against.
    pub enum Idp {
        Phone => "phone",
        WxMinip => "wx_minip",
        Wecom => "wecom",
    }
}

str_enum! {
    /// Selects the authentication strategy.
    pub enum Scenario {
        Password => "password",
        PhoneOtp => "phone_otp",
        WxMinip => "wx_minip",
        Wecom => "wecom",
        JwtToken => "jwt_token",
    }
}

str_enum! {
    /// Authentication method reference recorded on the principal.
    pub enum Amr {
        Pwd => "pwd",
        Otp => "otp",
        Wechat => "wechat",
        Wecom => "wecom",
        Jwt => "jwt",
    }
}

impl Scenario {
    #[must_use]
    pub const fn amr(self) -> Amr {
        match self {
            Self::Password => Amr::Pwd,
            Self::PhoneOtp => Amr::Otp,
            Self::WxMinip => Amr::Wechat,
            Self::Wecom => Amr::Wecom,
            Self::JwtToken => Amr::Jwt,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enums_round_trip_through_strings() {
        for ty in AccountType::ALL {
            assert_eq!(ty.as_str().parse::<AccountType>().ok(), Some(*ty));
        }
        for scenario in Scenario::ALL {
            assert_eq!(scenario.as_str().parse::<Scenario>().ok(), Some(*scenario));
        }
        assert!("oauth_github".parse::<CredentialType>().is_err());
    }

    #[test]
    fn enums_serialize_as_wire_names() {
        let json = serde_json::to_string(&CredentialType::OauthWxMinip).ok();
        assert_eq!(json.as_deref(), Some("\"oauth_wx_minip\""));
    }

    #[test]
    fn kid_rejects_empty() {
        assert!(Kid::new("  ").is_err());
        assert_eq!(Kid::new("k1").map(|k| k.to_string()).ok().as_deref(), Some("k1"));
        assert!(serde_json::from_str::<Kid>("\"\"").is_err());
    }

    #[test]
    fn ids_parse_from_decimal_strings() {
        assert_eq!("200".parse::<AccountId>().ok(), Some(AccountId::new(200)));
        assert!("abc".parse::<UserId>().is_err());
    }

    #[test]
    fn operation_accounts_have_no_app_id() {
        assert!(!AccountType::Operation.requires_app_id());
        assert!(AccountType::WcMinip.requires_app_id());
    }
}
