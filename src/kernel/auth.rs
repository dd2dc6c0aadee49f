//! Authenticator: credential checks, lockout, and the second-factor gate.
//!
//! Every read-modify-write of an account's lockout counters runs under a
//! per-account async mutex, so two concurrent attempts against the same
//! account cannot both read the same `failed_attempts` value.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::AuthConfig;
use crate::kernel::accounts::{
    normalise_email, Account, AccountRepository, CredentialVerifier, RepositoryError,
};
use crate::kernel::audit::{actions, modules, AuditLog};
use crate::kernel::clock::Clock;
use crate::kernel::permissions::AccessPolicy;
use crate::kernel::two_factor::{ProvisioningPayload, Totp};
use crate::types::Principal;

/// A login attempt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoginRequest {
    /// Login email.
    pub email: String,
    /// Presented password.
    pub password: String,
    /// Second-factor code, when the account has one enrolled.
    #[serde(default)]
    pub two_factor_code: Option<String>,
    /// Client network origin, recorded on success.
    #[serde(default)]
    pub origin: Option<String>,
}

impl LoginRequest {
    /// Password-only attempt.
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
            ..Self::default()
        }
    }

    /// Attach a second-factor code.
    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.two_factor_code = Some(code.into());
        self
    }

    /// Attach the client origin.
    #[must_use]
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }
}

/// Successful outcomes of [`Authenticator::login`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    /// Credentials (and second factor, if enrolled) accepted.
    Authenticated(Principal),
    /// Password accepted; a second-factor code must be supplied.
    TwoFactorRequired,
}

/// Expected authentication failures.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// Unknown account or wrong password. Deliberately indistinguishable.
    #[error("Invalid credentials")]
    InvalidCredentials {
        /// Attempts left before lockout, when the account exists.
        remaining_attempts: Option<u32>,
    },

    /// A lockout window is still open.
    #[error("Account temporarily locked. Try again in {retry_after_minutes} minutes.")]
    AccountLocked {
        /// Whole minutes until the window closes, rounded up.
        retry_after_minutes: u64,
    },

    /// Second-factor code did not verify.
    #[error("Invalid two-factor code")]
    InvalidTwoFactorCode,

    /// Second factor is already active; it cannot be re-enrolled in place.
    #[error("Two-factor authentication is already enabled")]
    TwoFactorAlreadyEnabled,

    /// The caller has no valid session or account.
    #[error("Not authenticated")]
    NotAuthenticated,

    /// The account store failed.
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl AuthError {
    /// User-facing early warning, raised when one attempt remains.
    pub fn warning(&self) -> Option<String> {
        match self {
            Self::InvalidCredentials {
                remaining_attempts: Some(1),
            } => Some("1 login attempt remaining before the account is locked".to_owned()),
            _ => None,
        }
    }
}

/// Verifies credentials against an [`AccountRepository`].
pub struct Authenticator {
    config: AuthConfig,
    accounts: Arc<dyn AccountRepository>,
    verifier: Arc<dyn CredentialVerifier>,
    policy: Arc<AccessPolicy>,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
    totp: Totp,
    account_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Authenticator {
    /// Build an authenticator over the given collaborators.
    pub fn new(
        config: AuthConfig,
        accounts: Arc<dyn AccountRepository>,
        verifier: Arc<dyn CredentialVerifier>,
        policy: Arc<AccessPolicy>,
        audit: Arc<AuditLog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let totp = Totp::from_config(&config);
        Self {
            config,
            accounts,
            verifier,
            policy,
            audit,
            clock,
            totp,
            account_locks: Mutex::new(HashMap::new()),
        }
    }

    /// TOTP parameters in use.
    pub fn totp(&self) -> &Totp {
        &self.totp
    }

    /// Attempt a login.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidCredentials`] for an unknown account or
    /// wrong password, [`AuthError::AccountLocked`] while a lockout window is
    /// open (even with the right password), and
    /// [`AuthError::InvalidTwoFactorCode`] for a wrong second factor.
    pub async fn login(&self, request: &LoginRequest) -> Result<LoginOutcome, AuthError> {
        let key = normalise_email(&request.email);
        let lock = self.account_lock(&key);
        let _guard = lock.lock().await;
        let now = self.clock.now();

        let Some(mut account) = self.accounts.find_by_email(&key).await? else {
            warn!(email = %key, "login failed: unknown account");
            self.audit.record(
                None,
                actions::LOGIN_FAILED,
                modules::AUTH,
                Some(serde_json::json!({ "email": key, "origin": request.origin })),
            );
            return Err(AuthError::InvalidCredentials {
                remaining_attempts: None,
            });
        };

        if account.is_locked(now) {
            let retry_after_minutes = account
                .locked_until
                .map_or(1, |until| minutes_until(now, until));
            warn!(principal = %account.id, retry_after_minutes, "login blocked: account locked");
            self.audit.record(
                None,
                actions::LOGIN_BLOCKED,
                modules::AUTH,
                Some(serde_json::json!({ "email": key, "account_id": account.id })),
            );
            return Err(AuthError::AccountLocked {
                retry_after_minutes,
            });
        }
        if account.locked_until.is_some() {
            // Window elapsed: start counting afresh.
            account.locked_until = None;
            account.failed_attempts = 0;
        }

        if !self.verifier.verify(&request.password, &account.password_hash) {
            return Err(self.register_failure(account, now, request).await?);
        }

        if account.two_factor.enabled {
            let Some(code) = request.two_factor_code.as_deref() else {
                info!(principal = %account.id, "password accepted, second factor required");
                return Ok(LoginOutcome::TwoFactorRequired);
            };
            let secret = account.two_factor.secret.as_deref().unwrap_or_default();
            if !self.totp.verify(secret, code, now) {
                warn!(principal = %account.id, "login failed: invalid second factor");
                self.audit.record(
                    None,
                    actions::LOGIN_2FA_FAILED,
                    modules::AUTH,
                    Some(serde_json::json!({ "email": key, "account_id": account.id })),
                );
                return Err(AuthError::InvalidTwoFactorCode);
            }
        }

        account.failed_attempts = 0;
        account.locked_until = None;
        account.last_login_at = Some(now);
        if request.origin.is_some() {
            account.last_origin = request.origin.clone();
        }
        self.accounts.save(&account).await?;

        let principal = account.to_principal(&self.policy);
        info!(principal = %principal.id, role = %principal.role, "login succeeded");
        self.audit
            .record(Some(&principal), actions::LOGIN_SUCCESS, modules::AUTH, None);
        Ok(LoginOutcome::Authenticated(principal))
    }

    /// Count a wrong password, locking the account at the threshold.
    ///
    /// The attempt that reaches the threshold still reports invalid
    /// credentials; only later attempts see the lockout.
    async fn register_failure(
        &self,
        mut account: Account,
        now: DateTime<Utc>,
        request: &LoginRequest,
    ) -> Result<AuthError, AuthError> {
        account.failed_attempts = account.failed_attempts.saturating_add(1);
        let remaining = self
            .config
            .max_failed_attempts
            .saturating_sub(account.failed_attempts);

        if remaining == 0 {
            let window = chrono::Duration::minutes(i64::from(self.config.lockout_minutes));
            account.locked_until = now.checked_add_signed(window);
            self.accounts.save(&account).await?;
            warn!(
                principal = %account.id,
                lockout_minutes = self.config.lockout_minutes,
                "account locked after repeated failures"
            );
            self.audit.record(
                None,
                actions::ACCOUNT_LOCKED,
                modules::AUTH,
                Some(serde_json::json!({
                    "account_id": account.id,
                    "locked_until": account.locked_until,
                })),
            );
        } else {
            self.accounts.save(&account).await?;
            warn!(
                principal = %account.id,
                failed_attempts = account.failed_attempts,
                remaining,
                "login failed: wrong password"
            );
            self.audit.record(
                None,
                actions::LOGIN_FAILED,
                modules::AUTH,
                Some(serde_json::json!({
                    "email": normalise_email(&request.email),
                    "origin": request.origin,
                    "remaining_attempts": remaining,
                })),
            );
        }

        Ok(AuthError::InvalidCredentials {
            remaining_attempts: Some(remaining),
        })
    }

    /// Start second-factor enrollment for `principal`.
    ///
    /// The returned secret stays pending until [`verify_two_factor`](Self::verify_two_factor)
    /// confirms it.
    ///
    /// # Errors
    ///
    /// Fails if the account no longer exists, already has an active second
    /// factor, or the store fails.
    pub async fn enable_two_factor(
        &self,
        principal: &Principal,
    ) -> Result<ProvisioningPayload, AuthError> {
        let lock = self.account_lock(&normalise_email(&principal.email));
        let _guard = lock.lock().await;

        let mut account = self
            .accounts
            .find_by_id(&principal.id)
            .await?
            .ok_or(AuthError::NotAuthenticated)?;
        if account.two_factor.enabled {
            return Err(AuthError::TwoFactorAlreadyEnabled);
        }

        let payload = self.totp.provision(&account.email);
        account.two_factor.secret = Some(payload.secret.clone());
        self.accounts.save(&account).await?;

        info!(principal = %principal.id, "second-factor enrollment started");
        self.audit.record(
            Some(principal),
            actions::TWO_FACTOR_ENROLLMENT_STARTED,
            modules::AUTH,
            None,
        );
        Ok(payload)
    }

    /// Confirm `code` against `principal`'s pending or active secret.
    ///
    /// A match enables a pending second factor. Every outcome is audited.
    /// Returns whether the code verified.
    ///
    /// # Errors
    ///
    /// Fails only if the account is gone or the store fails.
    pub async fn verify_two_factor(
        &self,
        principal: &Principal,
        code: &str,
    ) -> Result<bool, AuthError> {
        let lock = self.account_lock(&normalise_email(&principal.email));
        let _guard = lock.lock().await;

        let mut account = self
            .accounts
            .find_by_id(&principal.id)
            .await?
            .ok_or(AuthError::NotAuthenticated)?;
        let now = self.clock.now();
        let verified = account
            .two_factor
            .secret
            .as_deref()
            .is_some_and(|secret| self.totp.verify(secret, code, now));

        if !verified {
            warn!(principal = %principal.id, "second-factor verification failed");
            self.audit.record(
                Some(principal),
                actions::TWO_FACTOR_VERIFY_FAILED,
                modules::AUTH,
                None,
            );
            return Ok(false);
        }

        if account.two_factor.enabled {
            info!(principal = %principal.id, "second-factor code confirmed");
            self.audit.record(
                Some(principal),
                actions::TWO_FACTOR_VERIFIED,
                modules::AUTH,
                None,
            );
        } else {
            account.two_factor.enabled = true;
            self.accounts.save(&account).await?;
            info!(principal = %principal.id, "second factor enabled");
            self.audit.record(
                Some(principal),
                actions::TWO_FACTOR_ENABLED,
                modules::AUTH,
                None,
            );
        }
        Ok(true)
    }

    /// Per-account mutex, keyed by normalised email.
    fn account_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.account_locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Forget locks nobody is holding or waiting on.
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        Arc::clone(locks.entry(key.to_owned()).or_default())
    }
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("max_failed_attempts", &self.config.max_failed_attempts)
            .field("lockout_minutes", &self.config.lockout_minutes)
            .finish_non_exhaustive()
    }
}

/// Whole minutes from `now` to `until`, rounded up, at least one.
fn minutes_until(now: DateTime<Utc>, until: DateTime<Utc>) -> u64 {
    let secs = u64::try_from(until.signed_duration_since(now).num_seconds()).unwrap_or(0);
    secs.div_ceil(60).max(1)
}
