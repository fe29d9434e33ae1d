//! Strategy-based authentication of credential submissions.

pub mod decision;
pub mod engine;
pub mod input;
pub mod strategy;

pub use decision::{AuthDecision, AuthErrCode, Principal};
pub use engine::{Authenticator, MAX_FAIL_RETRIES};
pub use input::{AuthCredentials, AuthInput};
pub use strategy::{
    AuthStrategy, JwtTokenStrategy, PasswordStrategy, PhoneOtpStrategy, StrategyFactory,
    WecomStrategy, WxMinipStrategy,
};
