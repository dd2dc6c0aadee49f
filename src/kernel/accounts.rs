//! Account store boundary.
//!
//! The authenticator reaches accounts only through [`AccountRepository`], so
//! it runs against the in-process directory in tests and demos and against a
//! real datastore in production. Credential checking is likewise abstract
//! ([`CredentialVerifier`]); the kernel does not pick a hashing algorithm.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::kernel::permissions::AccessPolicy;
use crate::types::{Principal, PrincipalId, Role, SecurityLevel};

/// Errors from the account store.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    /// The backing store could not be reached or returned garbage.
    #[error("account store unavailable: {0}")]
    Unavailable(String),

    /// An internal lock was poisoned by a panicking writer.
    #[error("account store lock poisoned")]
    Poisoned,
}

/// Directory data used to build a [`Principal`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountProfile {
    /// Human-readable name.
    pub display_name: String,
    /// Role designation.
    pub role: Role,
    /// Department label.
    pub department: String,
    /// Security classification.
    #[serde(default)]
    pub security_level: SecurityLevel,
    /// Grants on top of the role catalog.
    #[serde(default)]
    pub extra_capabilities: Vec<String>,
    /// Avatar URL.
    #[serde(default)]
    pub avatar_url: Option<String>,
}

/// Second-factor state of an account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TwoFactorState {
    /// Base32 TOTP secret, pending until confirmed.
    pub secret: Option<String>,
    /// Whether the secret has been confirmed with a valid code.
    pub enabled: bool,
}

/// A credential record with its lockout counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Stable account id.
    pub id: PrincipalId,
    /// Login email.
    pub email: String,
    /// Opaque credential hash, interpreted by a [`CredentialVerifier`].
    pub password_hash: String,
    /// Consecutive failed password attempts.
    #[serde(default)]
    pub failed_attempts: u32,
    /// End of the active lockout window, if any.
    #[serde(default)]
    pub locked_until: Option<DateTime<Utc>>,
    /// Directory profile.
    pub profile: AccountProfile,
    /// Second-factor enrollment.
    #[serde(default)]
    pub two_factor: TwoFactorState,
    /// Last successful login.
    #[serde(default)]
    pub last_login_at: Option<DateTime<Utc>>,
    /// Origin of the last successful login.
    #[serde(default)]
    pub last_origin: Option<String>,
}

impl Account {
    /// Create an account with clean counters and no second factor.
    pub fn new(
        id: impl Into<String>,
        email: impl Into<String>,
        password_hash: impl Into<String>,
        profile: AccountProfile,
    ) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
            password_hash: password_hash.into(),
            failed_attempts: 0,
            locked_until: None,
            profile,
            two_factor: TwoFactorState::default(),
            last_login_at: None,
            last_origin: None,
        }
    }

    /// Whether a lockout window is still open at `now`.
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.locked_until.is_some_and(|until| until > now)
    }

    /// Build the principal for this account, resolving capabilities through `policy`.
    pub fn to_principal(&self, policy: &AccessPolicy) -> Principal {
        Principal {
            id: self.id.clone(),
            display_name: self.profile.display_name.clone(),
            email: self.email.clone(),
            role: self.profile.role,
            department: self.profile.department.clone(),
            capabilities: policy
                .resolve_capabilities(self.profile.role, &self.profile.extra_capabilities),
            security_level: self.profile.security_level,
            two_factor_enabled: self.two_factor.enabled,
            last_login_at: self.last_login_at,
            last_origin: self.last_origin.clone(),
            avatar_url: self.profile.avatar_url.clone(),
        }
    }
}

/// Lower-cased, trimmed email used as the lookup key.
pub fn normalise_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Storage for accounts and their lockout counters.
#[async_trait]
pub trait AccountRepository: Send + Sync {
    /// Find an account by login email (case-insensitive).
    async fn find_by_email(&self, email: &str) -> Result<Option<Account>, RepositoryError>;

    /// Find an account by id.
    async fn find_by_id(&self, id: &str) -> Result<Option<Account>, RepositoryError>;

    /// Insert or replace an account.
    async fn save(&self, account: &Account) -> Result<(), RepositoryError>;
}

/// Checks a presented password against a stored credential hash.
pub trait CredentialVerifier: Send + Sync {
    /// Whether `password` matches `stored_hash`.
    fn verify(&self, password: &str, stored_hash: &str) -> bool;
}

/// Development verifier: the stored "hash" is the password itself.
///
/// Compares in constant time. Not for production credentials.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlaintextVerifier;

impl CredentialVerifier for PlaintextVerifier {
    fn verify(&self, password: &str, stored_hash: &str) -> bool {
        password.as_bytes().ct_eq(stored_hash.as_bytes()).into()
    }
}

/// In-process account directory.
#[derive(Debug, Default)]
pub struct InMemoryAccountRepository {
    accounts: RwLock<HashMap<PrincipalId, Account>>,
}

impl InMemoryAccountRepository {
    /// Empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory pre-populated with `accounts`.
    pub fn with_accounts(accounts: impl IntoIterator<Item = Account>) -> Self {
        let map = accounts
            .into_iter()
            .map(|account| (account.id.clone(), account))
            .collect();
        Self {
            accounts: RwLock::new(map),
        }
    }
}

#[async_trait]
impl AccountRepository for InMemoryAccountRepository {
    async fn find_by_email(&self, email: &str) -> Result<Option<Account>, RepositoryError> {
        let needle = normalise_email(email);
        let map = self.accounts.read().map_err(|_| RepositoryError::Poisoned)?;
        Ok(map
            .values()
            .find(|account| normalise_email(&account.email) == needle)
            .cloned())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Account>, RepositoryError> {
        let map = self.accounts.read().map_err(|_| RepositoryError::Poisoned)?;
        Ok(map.get(id).cloned())
    }

    async fn save(&self, account: &Account) -> Result<(), RepositoryError> {
        let mut map = self.accounts.write().map_err(|_| RepositoryError::Poisoned)?;
        map.insert(account.id.clone(), account.clone());
        Ok(())
    }
}

/// Demo directory covering every role, for the CLI and tests.
///
/// Passwords are stored for [`PlaintextVerifier`].
pub fn demo_accounts() -> Vec<Account> {
    let profile = |name: &str, role: Role, department: &str, level: SecurityLevel| AccountProfile {
        display_name: name.to_owned(),
        role,
        department: department.to_owned(),
        security_level: level,
        extra_capabilities: Vec::new(),
        avatar_url: None,
    };

    vec![
        Account::new(
            "u-admin",
            "admin@warden.local",
            "AdminPass123!",
            profile("Platform Admin", Role::SystemAdmin, "IT", SecurityLevel::Critical),
        ),
        Account::new(
            "u-director",
            "director@warden.local",
            "DirectorPass123!",
            profile("Dana Director", Role::HrDirector, "Human Resources", SecurityLevel::Restricted),
        ),
        Account::new(
            "u-hr",
            "hr@warden.local",
            "HrPass123!",
            profile("Harper Reyes", Role::HrManager, "Human Resources", SecurityLevel::Elevated),
        ),
        Account::new(
            "u-manager",
            "manager@warden.local",
            "ManagerPass123!",
            profile("Morgan Lee", Role::DepartmentManager, "Engineering", SecurityLevel::Elevated),
        ),
        Account::new(
            "u-recruiter",
            "recruiter@warden.local",
            "RecruiterPass123!",
            profile("Riley Park", Role::Recruiter, "Talent", SecurityLevel::Standard),
        ),
        Account::new(
            "u-payroll",
            "payroll@warden.local",
            "PayrollPass123!",
            profile("Pat Quinn", Role::PayrollOfficer, "Finance", SecurityLevel::Restricted),
        ),
        Account::new(
            "u-employee",
            "employee@warden.local",
            "EmployeePass123!",
            profile("Eli Moss", Role::Employee, "Engineering", SecurityLevel::Standard),
        ),
    ]
}
