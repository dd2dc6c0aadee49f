//! Authenticator: lockout, counter resets, the second-factor gate.

use std::sync::Arc;

use warden::config::{AuthConfig, WardenConfig};
use warden::kernel::accounts::{
    AccountRepository, InMemoryAccountRepository, PlaintextVerifier,
};
use warden::kernel::audit::{actions, AuditLog};
use warden::kernel::auth::{AuthError, Authenticator, LoginOutcome, LoginRequest};
use warden::kernel::clock::{Clock, ManualClock};
use warden::kernel::permissions::AccessPolicy;
use warden::types::Role;

use crate::support::{account, kernel_with, manual_clock, token_of};

const EMAIL: &str = "a@x.com";
const PASSWORD: &str = "CorrectPass123!";

struct Fixture {
    auth: Authenticator,
    repo: Arc<InMemoryAccountRepository>,
    audit: Arc<AuditLog>,
    clock: Arc<ManualClock>,
}

fn fixture() -> Fixture {
    let clock = manual_clock();
    let repo = Arc::new(InMemoryAccountRepository::with_accounts([account(
        "u-a",
        EMAIL,
        PASSWORD,
        Role::Employee,
    )]));
    let audit = Arc::new(AuditLog::new(100, clock.clone()));
    let auth = Authenticator::new(
        AuthConfig::default(),
        repo.clone(),
        Arc::new(PlaintextVerifier),
        Arc::new(AccessPolicy::default()),
        audit.clone(),
        clock.clone(),
    );
    Fixture {
        auth,
        repo,
        audit,
        clock,
    }
}

async fn stored_failures(repo: &InMemoryAccountRepository) -> (u32, bool) {
    let account = match repo.find_by_id("u-a").await {
        Ok(Some(account)) => account,
        other => panic!("account should exist: {other:?}"),
    };
    (account.failed_attempts, account.locked_until.is_some())
}

#[tokio::test]
async fn three_failures_lock_for_fifteen_minutes() {
    let fx = fixture();

    for _ in 0..3 {
        let result = fx.auth.login(&LoginRequest::new(EMAIL, "WrongPass")).await;
        assert!(matches!(result, Err(AuthError::InvalidCredentials { .. })));
    }
    assert_eq!(stored_failures(&fx.repo).await, (3, true));

    // Correct password inside the window is still refused.
    let locked = fx.auth.login(&LoginRequest::new(EMAIL, PASSWORD)).await;
    assert!(matches!(
        locked,
        Err(AuthError::AccountLocked {
            retry_after_minutes: 15
        })
    ));

    fx.clock.advance(chrono::Duration::minutes(14) + chrono::Duration::seconds(59));
    let still_locked = fx.auth.login(&LoginRequest::new(EMAIL, PASSWORD)).await;
    assert!(matches!(
        still_locked,
        Err(AuthError::AccountLocked {
            retry_after_minutes: 1
        })
    ));

    fx.clock.advance(chrono::Duration::seconds(1));
    let unlocked = fx.auth.login(&LoginRequest::new(EMAIL, PASSWORD)).await;
    assert!(matches!(unlocked, Ok(LoginOutcome::Authenticated(_))));
    assert_eq!(stored_failures(&fx.repo).await, (0, false));
}

#[tokio::test]
async fn lockout_is_audited() {
    let fx = fixture();
    for _ in 0..3 {
        let _ = fx.auth.login(&LoginRequest::new(EMAIL, "WrongPass")).await;
    }
    let _ = fx.auth.login(&LoginRequest::new(EMAIL, PASSWORD)).await;

    let recorded: Vec<String> = fx.audit.snapshot().into_iter().map(|e| e.action).collect();
    assert_eq!(
        recorded,
        vec![
            actions::LOGIN_BLOCKED,
            actions::ACCOUNT_LOCKED,
            actions::LOGIN_FAILED,
            actions::LOGIN_FAILED,
        ]
    );
}

#[tokio::test]
async fn success_resets_failure_counter() {
    let fx = fixture();
    for _ in 0..2 {
        let _ = fx.auth.login(&LoginRequest::new(EMAIL, "WrongPass")).await;
    }
    assert_eq!(stored_failures(&fx.repo).await, (2, false));

    let result = fx
        .auth
        .login(&LoginRequest::new(EMAIL, PASSWORD).with_origin("10.0.0.7"))
        .await;
    let principal = match result {
        Ok(LoginOutcome::Authenticated(principal)) => principal,
        other => panic!("login should succeed: {other:?}"),
    };
    assert_eq!(principal.last_origin.as_deref(), Some("10.0.0.7"));
    assert_eq!(principal.last_login_at, Some(fx.clock.now()));
    assert_eq!(stored_failures(&fx.repo).await, (0, false));

    // A fresh run of failures starts from zero again.
    let result = fx.auth.login(&LoginRequest::new(EMAIL, "WrongPass")).await;
    assert!(matches!(
        result,
        Err(AuthError::InvalidCredentials {
            remaining_attempts: Some(2)
        })
    ));
}

#[tokio::test]
async fn warning_after_second_failure() {
    let fx = fixture();
    let first = fx.auth.login(&LoginRequest::new(EMAIL, "WrongPass")).await;
    let second = fx.auth.login(&LoginRequest::new(EMAIL, "WrongPass")).await;

    let first = match first {
        Err(err) => err,
        Ok(outcome) => panic!("wrong password accepted: {outcome:?}"),
    };
    let second = match second {
        Err(err) => err,
        Ok(outcome) => panic!("wrong password accepted: {outcome:?}"),
    };
    assert_eq!(first.warning(), None);
    assert_eq!(
        second.warning().as_deref(),
        Some("1 login attempt remaining before the account is locked")
    );
}

#[tokio::test]
async fn unknown_account_looks_like_wrong_password() {
    let fx = fixture();
    let result = fx
        .auth
        .login(&LoginRequest::new("nobody@x.com", PASSWORD))
        .await;
    match result {
        Err(err @ AuthError::InvalidCredentials { .. }) => {
            assert_eq!(err.to_string(), "Invalid credentials");
            assert_eq!(err.warning(), None);
        }
        other => panic!("unknown account should be invalid credentials: {other:?}"),
    }
    let entry = &fx.audit.snapshot()[0];
    assert_eq!(entry.action, actions::LOGIN_FAILED);
    assert_eq!(entry.actor_id, "unknown");
}

#[tokio::test]
async fn email_is_case_insensitive() {
    let fx = fixture();
    let result = fx.auth.login(&LoginRequest::new(" A@X.COM ", PASSWORD)).await;
    assert!(matches!(result, Ok(LoginOutcome::Authenticated(_))));
}

#[tokio::test]
async fn concurrent_failures_are_counted_once_each() {
    let fx = fixture();
    let auth = Arc::new(fx.auth);

    let mut handles = Vec::new();
    for _ in 0..3 {
        let auth = Arc::clone(&auth);
        handles.push(tokio::spawn(async move {
            auth.login(&LoginRequest::new(EMAIL, "WrongPass")).await
        }));
    }
    for handle in handles {
        let result = match handle.await {
            Ok(result) => result,
            Err(err) => panic!("login task panicked: {err}"),
        };
        assert!(matches!(result, Err(AuthError::InvalidCredentials { .. })));
    }

    assert_eq!(stored_failures(&fx.repo).await, (3, true));
    let locked = auth.login(&LoginRequest::new(EMAIL, PASSWORD)).await;
    assert!(matches!(locked, Err(AuthError::AccountLocked { .. })));
}

#[tokio::test]
async fn two_factor_enrollment_and_login_gate() {
    let fx = fixture();
    let principal = match fx.auth.login(&LoginRequest::new(EMAIL, PASSWORD)).await {
        Ok(LoginOutcome::Authenticated(principal)) => principal,
        other => panic!("login should succeed: {other:?}"),
    };

    let payload = match fx.auth.enable_two_factor(&principal).await {
        Ok(payload) => payload,
        Err(err) => panic!("enrollment should start: {err}"),
    };
    assert!(payload.otpauth_uri.contains("a%40x.com"));

    // Pending secret does not gate login yet.
    let result = fx.auth.login(&LoginRequest::new(EMAIL, PASSWORD)).await;
    assert!(matches!(result, Ok(LoginOutcome::Authenticated(_))));

    let code = match fx.auth.totp().code_at(&payload.secret, fx.clock.now()) {
        Some(code) => code,
        None => panic!("code should compute"),
    };
    let wrong = shifted(&code);
    assert!(!fx.auth.verify_two_factor(&principal, &wrong).await.unwrap_or(true));
    assert!(fx.auth.verify_two_factor(&principal, &code).await.unwrap_or(false));

    let gated = fx.auth.login(&LoginRequest::new(EMAIL, PASSWORD)).await;
    assert!(matches!(gated, Ok(LoginOutcome::TwoFactorRequired)));

    let rejected = fx
        .auth
        .login(&LoginRequest::new(EMAIL, PASSWORD).with_code(wrong.clone()))
        .await;
    assert!(matches!(rejected, Err(AuthError::InvalidTwoFactorCode)));

    let accepted = fx
        .auth
        .login(&LoginRequest::new(EMAIL, PASSWORD).with_code(code))
        .await;
    match accepted {
        Ok(LoginOutcome::Authenticated(principal)) => assert!(principal.two_factor_enabled),
        other => panic!("login with code should succeed: {other:?}"),
    }

    let again = fx.auth.enable_two_factor(&principal).await;
    assert!(matches!(again, Err(AuthError::TwoFactorAlreadyEnabled)));
}

#[tokio::test]
async fn every_successful_verification_is_audited() {
    let fx = fixture();
    let principal = match fx.auth.login(&LoginRequest::new(EMAIL, PASSWORD)).await {
        Ok(LoginOutcome::Authenticated(principal)) => principal,
        other => panic!("login should succeed: {other:?}"),
    };
    let payload = match fx.auth.enable_two_factor(&principal).await {
        Ok(payload) => payload,
        Err(err) => panic!("enrollment should start: {err}"),
    };
    let code = match fx.auth.totp().code_at(&payload.secret, fx.clock.now()) {
        Some(code) => code,
        None => panic!("code should compute"),
    };

    assert!(fx.auth.verify_two_factor(&principal, &code).await.unwrap_or(false));
    assert_eq!(fx.audit.snapshot()[0].action, actions::TWO_FACTOR_ENABLED);
    let before = fx.audit.len();

    assert!(fx.auth.verify_two_factor(&principal, &code).await.unwrap_or(false));
    assert_eq!(fx.audit.len(), before + 1);
    let entry = &fx.audit.snapshot()[0];
    assert_eq!(entry.action, actions::TWO_FACTOR_VERIFIED);
    assert_eq!(entry.actor_id, "u-a");
}

#[tokio::test]
async fn expired_lock_window_restarts_the_count() {
    let fx = fixture();
    for _ in 0..3 {
        let _ = fx.auth.login(&LoginRequest::new(EMAIL, "WrongPass")).await;
    }
    fx.clock.advance(chrono::Duration::minutes(16));

    let result = fx.auth.login(&LoginRequest::new(EMAIL, "WrongPass")).await;
    assert!(matches!(
        result,
        Err(AuthError::InvalidCredentials {
            remaining_attempts: Some(2)
        })
    ));
    assert_eq!(stored_failures(&fx.repo).await, (1, false));
}

#[tokio::test]
async fn wrong_codes_do_not_count_toward_lockout() {
    let fx = fixture();
    let principal = match fx.auth.login(&LoginRequest::new(EMAIL, PASSWORD)).await {
        Ok(LoginOutcome::Authenticated(principal)) => principal,
        other => panic!("login should succeed: {other:?}"),
    };
    let payload = match fx.auth.enable_two_factor(&principal).await {
        Ok(payload) => payload,
        Err(err) => panic!("enrollment should start: {err}"),
    };
    let code = match fx.auth.totp().code_at(&payload.secret, fx.clock.now()) {
        Some(code) => code,
        None => panic!("code should compute"),
    };
    assert!(fx.auth.verify_two_factor(&principal, &code).await.unwrap_or(false));

    for _ in 0..5 {
        let result = fx
            .auth
            .login(&LoginRequest::new(EMAIL, PASSWORD).with_code(shifted(&code)))
            .await;
        assert!(matches!(result, Err(AuthError::InvalidTwoFactorCode)));
    }
    assert_eq!(stored_failures(&fx.repo).await, (0, false));
    assert_eq!(fx.audit.snapshot()[0].action, actions::LOGIN_2FA_FAILED);
}

#[tokio::test]
async fn end_to_end_lockout_scenario() {
    let clock = manual_clock();
    let repo = Arc::new(InMemoryAccountRepository::with_accounts([account(
        "u-a",
        EMAIL,
        PASSWORD,
        Role::Employee,
    )]));
    let kernel = kernel_with(WardenConfig::default(), repo.clone(), clock.clone());

    for _ in 0..3 {
        let response = kernel.login(LoginRequest::new(EMAIL, "WrongPass")).await;
        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some("Invalid credentials"));
        assert!(response.token.is_none());
    }

    let response = kernel.login(LoginRequest::new(EMAIL, PASSWORD)).await;
    assert!(!response.success);
    let error = response.error.unwrap_or_default();
    assert!(
        error.starts_with("Account temporarily locked"),
        "unexpected error: {error}"
    );

    clock.advance(chrono::Duration::minutes(15));
    let response = kernel.login(LoginRequest::new(EMAIL, PASSWORD)).await;
    assert!(response.success);
    assert!(response.error.is_none());
    let token = token_of(&response);
    assert!(kernel.current_principal(&token).is_some());
    assert_eq!(stored_failures(&repo).await, (0, false));
}

/// Same length, every digit changed.
fn shifted(code: &str) -> String {
    code.chars()
        .map(|c| match c.to_digit(10) {
            Some(d) => char::from_digit((d + 1) % 10, 10).unwrap_or('0'),
            None => c,
        })
        .collect()
}
