#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use anyhow::ensure;
use authn::{
    ErrorKind,
    identity::LOGIN_SCENE,
    service::{LogoutRequest, RequestMeta},
    types::{Amr, UserId},
};
use chrono::Duration;
use common::{PASSWORD, USER_ID, USERNAME, otp_login, password_login, stack};

const PHONE: &str = "+8613800138000";

#[tokio::test]
async fn password_login_issues_verifiable_tokens() -> anyhow::Result<()> {
    let stack = stack().await;
    let account = stack.register().await;

    let login = stack
        .service
        .login(password_login(USERNAME, PASSWORD), RequestMeta::default())
        .await?;
    ensure!(login.expires_in == 900, "expiresIn {}", login.expires_in);
    ensure!(login.token_type == "Bearer");

    let verified = stack.service.verify(&login.access_token).await?;
    ensure!(verified.valid);
    let claims = verified.claims.expect("claims of a valid token");
    assert_eq!(claims.user_id, UserId::new(USER_ID));
    assert_eq!(claims.account_id, account.id);
    assert_eq!(claims.issuer, "authn-test");
    assert_eq!(claims.audience.as_deref(), Some("web"));
    assert_eq!(claims.session_id.as_deref(), Some("device-1"));
    assert_eq!(claims.amr, Some(Amr::Pwd));
    assert_eq!(claims.expires_at - claims.issued_at, 900);
    Ok(())
}

#[tokio::test]
async fn access_token_expires_with_the_clock() -> anyhow::Result<()> {
    let stack = stack().await;
    stack.register().await;
    let login = stack
        .service
        .login(password_login(USERNAME, PASSWORD), RequestMeta::default())
        .await?;

    stack.clock.advance(Duration::minutes(15));
    let verified = stack.service.verify(&login.access_token).await?;
    ensure!(!verified.valid);
    ensure!(verified.claims.is_none());
    Ok(())
}

#[tokio::test]
async fn lockout_after_three_failures() -> anyhow::Result<()> {
    let stack = stack().await;
    stack.register().await;

    for _ in 0..3 {
        let err = stack
            .service
            .login(password_login(USERNAME, "wrong"), RequestMeta::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PasswordIncorrect);
    }

    let err = stack
        .service
        .login(password_login(USERNAME, PASSWORD), RequestMeta::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CredentialLocked);

    stack.clock.advance(Duration::minutes(16));
    stack
        .service
        .login(password_login(USERNAME, PASSWORD), RequestMeta::default())
        .await?;
    Ok(())
}

#[tokio::test]
async fn unknown_user_and_wrong_password_look_alike() -> anyhow::Result<()> {
    let stack = stack().await;
    stack.register().await;

    let unknown = stack
        .service
        .login(password_login("mallory", PASSWORD), RequestMeta::default())
        .await
        .unwrap_err();
    let wrong = stack
        .service
        .login(password_login(USERNAME, "wrong"), RequestMeta::default())
        .await
        .unwrap_err();
    assert_eq!(unknown.kind(), wrong.kind());
    assert_eq!(unknown.message(), wrong.message());
    Ok(())
}

#[tokio::test]
async fn inactive_user_cannot_log_in() -> anyhow::Result<()> {
    let stack = stack().await;
    stack.register().await;
    stack.users.set_user(UserId::new(USER_ID), false).await;

    let err = stack
        .service
        .login(password_login(USERNAME, PASSWORD), RequestMeta::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CredentialDisabled);
    Ok(())
}

#[tokio::test]
async fn refresh_rotates_and_rejects_replay() -> anyhow::Result<()> {
    let stack = stack().await;
    stack.register().await;
    let login = stack
        .service
        .login(password_login(USERNAME, PASSWORD), RequestMeta::default())
        .await?;

    let rotated = stack.service.refresh(&login.refresh_token).await?;
    ensure!(rotated.refresh_token != login.refresh_token);
    ensure!(stack.service.verify(&rotated.access_token).await?.valid);

    let replay = stack.service.refresh(&login.refresh_token).await.unwrap_err();
    assert_eq!(replay.kind(), ErrorKind::TokenInvalid);

    let again = stack.service.refresh(&rotated.refresh_token).await?;
    ensure!(!again.access_token.is_empty());
    Ok(())
}

#[tokio::test]
async fn refresh_token_expires() -> anyhow::Result<()> {
    let stack = stack().await;
    stack.register().await;
    let login = stack
        .service
        .login(password_login(USERNAME, PASSWORD), RequestMeta::default())
        .await?;

    // The store drops the record with its TTL, so it reads as unknown.
    stack.clock.advance(Duration::days(8));
    let err = stack.service.refresh(&login.refresh_token).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TokenInvalid);
    Ok(())
}

#[tokio::test]
async fn revoked_access_token_stops_verifying() -> anyhow::Result<()> {
    let stack = stack().await;
    stack.register().await;
    let login = stack
        .service
        .login(password_login(USERNAME, PASSWORD), RequestMeta::default())
        .await?;

    stack.service.revoke(&login.access_token).await?;
    let verified = stack.service.verify(&login.access_token).await?;
    ensure!(!verified.valid);

    // Revoking twice is harmless.
    stack.service.revoke(&login.access_token).await?;

    stack.service.revoke_refresh(&login.refresh_token).await?;
    let err = stack.service.refresh(&login.refresh_token).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TokenInvalid);
    Ok(())
}

#[tokio::test]
async fn logout_everywhere_drops_every_refresh_token() -> anyhow::Result<()> {
    let stack = stack().await;
    stack.register().await;
    let first = stack
        .service
        .login(password_login(USERNAME, PASSWORD), RequestMeta::default())
        .await?;
    let second = stack
        .service
        .login(password_login(USERNAME, PASSWORD), RequestMeta::default())
        .await?;

    let denied = stack
        .service
        .logout(
            LogoutRequest {
                all: true,
                ..LogoutRequest::default()
            },
            RequestMeta::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(denied.kind(), ErrorKind::Unauthenticated);

    let response = stack
        .service
        .logout(
            LogoutRequest {
                all: true,
                ..LogoutRequest::default()
            },
            RequestMeta {
                bearer: Some(first.access_token.clone()),
                ..RequestMeta::default()
            },
        )
        .await?;
    assert_eq!(response.revoked_refresh_tokens, 2);

    for refresh in [&first.refresh_token, &second.refresh_token] {
        let err = stack.service.refresh(refresh).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TokenInvalid);
    }
    Ok(())
}

#[tokio::test]
async fn logout_requires_a_token() {
    let stack = stack().await;
    let err = stack
        .service
        .logout(LogoutRequest::default(), RequestMeta::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[tokio::test]
async fn otp_login_needs_a_binding_and_consumes_the_code() -> anyhow::Result<()> {
    let stack = stack().await;
    let account = stack.register().await;

    stack
        .otp
        .issue(PHONE, LOGIN_SCENE, "123456", Duration::minutes(5))
        .await;
    let err = stack
        .service
        .login(otp_login(PHONE, "123456"), RequestMeta::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoBinding);

    stack.accounts.bind_phone(account.id, PHONE).await?;
    let reused = stack
        .service
        .login(otp_login(PHONE, "123456"), RequestMeta::default())
        .await
        .unwrap_err();
    assert_eq!(reused.kind(), ErrorKind::OtpInvalid);

    stack
        .otp
        .issue(PHONE, LOGIN_SCENE, "654321", Duration::minutes(5))
        .await;
    let login = stack
        .service
        .login(otp_login(PHONE, "654321"), RequestMeta::default())
        .await?;
    let claims = stack
        .service
        .verify(&login.access_token)
        .await?
        .claims
        .expect("claims of a valid token");
    assert_eq!(claims.account_id, account.id);
    assert_eq!(claims.amr, Some(Amr::Otp));
    Ok(())
}

#[tokio::test]
async fn jwt_login_exchanges_a_valid_access_token() -> anyhow::Result<()> {
    let stack = stack().await;
    let account = stack.register().await;
    let login = stack
        .service
        .login(password_login(USERNAME, PASSWORD), RequestMeta::default())
        .await?;

    let request = serde_json::from_value(serde_json::json!({
        "method": "jwt_token",
        "credentials": {"accessToken": login.access_token}
    }))?;
    let exchanged = stack.service.login(request, RequestMeta::default()).await?;
    let claims = stack
        .service
        .verify(&exchanged.access_token)
        .await?
        .claims
        .expect("claims of a valid token");
    assert_eq!(claims.account_id, account.id);
    assert_eq!(claims.amr, Some(Amr::Jwt));

    stack.service.revoke(&login.access_token).await?;
    let request = serde_json::from_value(serde_json::json!({
        "method": "jwt_token",
        "credentials": {"accessToken": login.access_token}
    }))?;
    let err = stack
        .service
        .login(request, RequestMeta::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AuthenticationFailed);
    Ok(())
}

#[tokio::test]
async fn rotation_keeps_grace_keys_until_retired() -> anyhow::Result<()> {
    let stack = stack().await;
    stack.register().await;

    let (jwks, first_tag) = stack.keys.build_jwks().await?;
    assert_eq!(jwks.keys.len(), 1);
    let old_kid = jwks.keys[0].kid.clone();

    let before = stack
        .service
        .login(password_login(USERNAME, PASSWORD), RequestMeta::default())
        .await?;

    stack.clock.advance(Duration::minutes(1));
    let rotated = stack.keys.rotate_key().await?;
    ensure!(rotated.kid.as_str() != old_kid);

    let (jwks, second_tag) = stack.keys.build_jwks().await?;
    assert_eq!(jwks.keys.len(), 2);
    ensure!(first_tag.etag != second_tag.etag);
    ensure!(stack.service.verify(&before.access_token).await?.valid);

    let after = stack
        .service
        .login(password_login(USERNAME, PASSWORD), RequestMeta::default())
        .await?;
    let claims = stack
        .service
        .verify(&after.access_token)
        .await?
        .claims
        .expect("claims of a valid token");
    assert_eq!(claims.kid, rotated.kid.as_str());

    let old = authn::types::Kid::new(old_kid.clone())?;
    stack.keys.retire(&old).await?;
    let (jwks, _) = stack.keys.build_jwks().await?;
    assert_eq!(jwks.keys.len(), 1);
    assert_eq!(jwks.keys[0].kid, rotated.kid.as_str());
    ensure!(!stack.service.verify(&before.access_token).await?.valid);
    ensure!(stack.service.verify(&after.access_token).await?.valid);
    Ok(())
}
