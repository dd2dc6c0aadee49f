//! `AccessKernel`: the surface exposed to the application layer.
//!
//! Wires the authenticator, session manager, permission evaluator,
//! impersonation controller and audit log together. Every operation takes
//! the caller's session token; an unknown or expired token behaves as
//! unauthenticated. Expected failures come back as structured responses or
//! `false`, never as errors or panics.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::WardenConfig;
use crate::kernel::accounts::{AccountRepository, CredentialVerifier, PlaintextVerifier};
use crate::kernel::audit::{actions, modules, AuditEntry, AuditLog};
use crate::kernel::auth::{AuthError, Authenticator, LoginOutcome, LoginRequest};
use crate::kernel::clock::{Clock, SystemClock};
use crate::kernel::impersonation::{ImpersonationController, ImpersonationError};
use crate::kernel::permissions::{has_permission, AccessPolicy};
use crate::kernel::persistence::SessionSnapshotStore;
use crate::kernel::session::{ActivitySignal, SessionManager, SessionStatus, SessionToken};
use crate::kernel::two_factor::ProvisioningPayload;
use crate::types::Principal;

/// Collaborators needed to build an [`AccessKernel`].
pub struct KernelDeps {
    /// Runtime configuration.
    pub config: WardenConfig,
    /// Account store.
    pub accounts: Arc<dyn AccountRepository>,
    /// Password hash verifier.
    pub verifier: Arc<dyn CredentialVerifier>,
    /// Wall clock.
    pub clock: Arc<dyn Clock>,
    /// Route and role tables.
    pub policy: AccessPolicy,
    /// Session snapshot file; sessions are memory-only when unset.
    pub snapshots: Option<PathBuf>,
}

impl KernelDeps {
    /// In-memory deps: built-in policy, system clock, plaintext verifier, no snapshots.
    pub fn new(config: WardenConfig, accounts: Arc<dyn AccountRepository>) -> Self {
        Self {
            config,
            accounts,
            verifier: Arc::new(PlaintextVerifier),
            clock: Arc::new(SystemClock),
            policy: AccessPolicy::default(),
            snapshots: None,
        }
    }

    /// Deps driven by `config`: the configured access policy (or the
    /// built-in one) and a snapshot file in the state directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured access policy cannot be loaded.
    pub fn from_config(
        config: WardenConfig,
        accounts: Arc<dyn AccountRepository>,
    ) -> anyhow::Result<Self> {
        let policy = match &config.paths.access_policy {
            Some(path) => AccessPolicy::load(Path::new(path))
                .with_context(|| format!("failed to load access policy {path}"))?,
            None => AccessPolicy::default(),
        };
        let snapshots = Some(config.sessions_file());
        Ok(Self {
            policy,
            snapshots,
            ..Self::new(config, accounts)
        })
    }

    /// Use `clock` instead of the system clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Use `verifier` for password checks.
    #[must_use]
    pub fn with_verifier(mut self, verifier: Arc<dyn CredentialVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    /// Use `policy` for route and role tables.
    #[must_use]
    pub fn with_policy(mut self, policy: AccessPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Persist sessions to `path`.
    #[must_use]
    pub fn with_snapshots(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshots = Some(path.into());
        self
    }
}

/// Result of [`AccessKernel::login`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoginResponse {
    /// A session was issued.
    pub success: bool,
    /// Password accepted; resend with a second-factor code.
    pub requires_two_factor: bool,
    /// User-facing failure message.
    pub error: Option<String>,
    /// User-facing early warning (low remaining attempts).
    pub warning: Option<String>,
    /// Session token on success.
    pub token: Option<SessionToken>,
}

/// Observer view of a session's impersonation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImpersonationStatus {
    /// The session is acting as someone else.
    pub is_impersonating: bool,
    /// The real identity behind the session, while impersonating.
    pub original: Option<Principal>,
}

/// The access-control kernel.
pub struct AccessKernel {
    policy: Arc<AccessPolicy>,
    audit: Arc<AuditLog>,
    sessions: Arc<SessionManager>,
    auth: Authenticator,
    impersonation: ImpersonationController,
}

impl AccessKernel {
    /// Wire up a kernel from `deps`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured audit sink cannot be opened.
    pub fn new(deps: KernelDeps) -> anyhow::Result<Self> {
        let KernelDeps {
            config,
            accounts,
            verifier,
            clock,
            policy,
            snapshots,
        } = deps;

        let policy = Arc::new(policy);
        let mut audit = AuditLog::new(config.audit.capacity, Arc::clone(&clock));
        if let Some(path) = &config.audit.sink_path {
            audit = audit.with_sink_path(path)?;
        }
        let audit = Arc::new(audit);

        let mut sessions =
            SessionManager::new(config.session.clone(), Arc::clone(&audit), Arc::clone(&clock));
        if let Some(path) = snapshots {
            sessions = sessions.with_snapshots(SessionSnapshotStore::new(path));
        }
        let sessions = Arc::new(sessions);

        let auth = Authenticator::new(
            config.auth.clone(),
            Arc::clone(&accounts),
            verifier,
            Arc::clone(&policy),
            Arc::clone(&audit),
            Arc::clone(&clock),
        );
        let impersonation = ImpersonationController::new(
            config.impersonation.clone(),
            Arc::clone(&sessions),
            accounts,
            Arc::clone(&policy),
            Arc::clone(&audit),
            clock,
        );

        Ok(Self {
            policy,
            audit,
            sessions,
            auth,
            impersonation,
        })
    }

    /// Underlying session manager.
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Restore persisted sessions and restart their countdowns.
    ///
    /// Returns the number of sessions restored.
    pub fn rehydrate(&self) -> usize {
        let restored = self.sessions.rehydrate();
        for token in self.sessions.tokens() {
            self.sessions.spawn_countdown(&token);
        }
        restored
    }

    // -----------------------------------------------------------------------
    // Authentication
    // -----------------------------------------------------------------------

    /// Authenticate and, on success, issue a session with a running countdown.
    pub async fn login(&self, request: LoginRequest) -> LoginResponse {
        match self.auth.login(&request).await {
            Ok(LoginOutcome::Authenticated(principal)) => {
                let session = self.sessions.start(principal);
                self.sessions.spawn_countdown(&session.token);
                LoginResponse {
                    success: true,
                    token: Some(session.token),
                    ..LoginResponse::default()
                }
            }
            Ok(LoginOutcome::TwoFactorRequired) => LoginResponse {
                requires_two_factor: true,
                ..LoginResponse::default()
            },
            Err(AuthError::Repository(e)) => {
                error!(error = %e, "login aborted: account store failure");
                LoginResponse {
                    error: Some("Authentication is temporarily unavailable".to_owned()),
                    ..LoginResponse::default()
                }
            }
            Err(e) => LoginResponse {
                warning: e.warning(),
                error: Some(e.to_string()),
                ..LoginResponse::default()
            },
        }
    }

    /// End the session. Returns whether one was active.
    pub fn logout(&self, token: &SessionToken) -> bool {
        self.sessions.end(token).is_some()
    }

    /// Start second-factor enrollment for the session's principal.
    pub async fn enable_two_factor(&self, token: &SessionToken) -> Option<ProvisioningPayload> {
        let principal = self.sessions.principal(token)?;
        match self.auth.enable_two_factor(&principal).await {
            Ok(payload) => Some(payload),
            Err(e) => {
                warn!(principal = %principal.id, error = %e, "second-factor enrollment refused");
                None
            }
        }
    }

    /// Confirm a second-factor code for the session's principal.
    pub async fn verify_two_factor(&self, token: &SessionToken, code: &str) -> bool {
        let Some(principal) = self.sessions.principal(token) else {
            return false;
        };
        match self.auth.verify_two_factor(&principal, code).await {
            Ok(true) => {
                self.sessions
                    .update_principal(&principal.id, |p| p.two_factor_enabled = true);
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!(principal = %principal.id, error = %e, "second-factor verification aborted");
                false
            }
        }
    }

    // -----------------------------------------------------------------------
    // Authorization
    // -----------------------------------------------------------------------

    /// Whether the session's principal holds `capability`. No audit entry.
    pub fn has_permission(&self, token: &SessionToken, capability: &str) -> bool {
        self.sessions
            .principal(token)
            .is_some_and(|p| has_permission(&p, capability))
    }

    /// Gate a protected action on `capability`, auditing a refusal.
    pub fn authorize(&self, token: &SessionToken, capability: &str) -> bool {
        let principal = self.sessions.principal(token);
        let allowed = principal
            .as_ref()
            .is_some_and(|p| has_permission(p, capability));
        if !allowed {
            self.deny(principal.as_ref(), serde_json::json!({ "capability": capability }));
        }
        allowed
    }

    /// Whether the session's principal may open `route`, auditing a refusal.
    pub fn can_access(&self, token: &SessionToken, route: &str) -> bool {
        let principal = self.sessions.principal(token);
        let allowed = principal
            .as_ref()
            .is_some_and(|p| self.policy.can_access(p, route));
        if !allowed {
            self.deny(principal.as_ref(), serde_json::json!({ "route": route }));
        }
        allowed
    }

    fn deny(&self, principal: Option<&Principal>, details: serde_json::Value) {
        warn!(
            principal = principal.map_or("unknown", |p| p.id.as_str()),
            %details,
            "unauthorized action"
        );
        self.audit.record(
            principal,
            actions::UNAUTHORIZED_ACTION,
            modules::ACCESS,
            Some(details),
        );
    }

    // -----------------------------------------------------------------------
    // Impersonation
    // -----------------------------------------------------------------------

    /// Act as `target_id`. Returns false, leaving the session unchanged, on refusal.
    pub async fn impersonate_user(&self, token: &SessionToken, target_id: &str) -> bool {
        match self.impersonation.impersonate(token, target_id).await {
            Ok(_) => true,
            Err(ImpersonationError::Repository(e)) => {
                error!(error = %e, "impersonation aborted: account store failure");
                false
            }
            Err(e) => {
                info!(error = %e, "impersonation refused");
                false
            }
        }
    }

    /// Return to the real identity. Returns false when not impersonating.
    pub fn stop_impersonation(&self, token: &SessionToken) -> bool {
        self.impersonation.stop(token).is_ok()
    }

    // -----------------------------------------------------------------------
    // Audit and activity
    // -----------------------------------------------------------------------

    /// Record an application event attributed to the session's principal
    /// (or the unknown actor). Never fails.
    pub fn add_audit_log(
        &self,
        token: Option<&SessionToken>,
        action: &str,
        module: &str,
        details: Option<serde_json::Value>,
    ) -> AuditEntry {
        let actor = token.and_then(|t| self.sessions.principal(t));
        self.audit.record(actor.as_ref(), action, module, details)
    }

    /// Heartbeat: reset the session countdown. Returns false for an unknown token.
    pub fn record_activity(&self, token: &SessionToken, signal: ActivitySignal) -> bool {
        self.sessions.record_activity(token, signal).is_some()
    }

    // -----------------------------------------------------------------------
    // Observers
    // -----------------------------------------------------------------------

    /// Acting principal of the session.
    pub fn current_principal(&self, token: &SessionToken) -> Option<Principal> {
        self.sessions.principal(token)
    }

    /// Remaining time and warning flag of the session.
    pub fn session_status(&self, token: &SessionToken) -> Option<SessionStatus> {
        self.sessions.status(token)
    }

    /// Impersonation flag and original principal of the session.
    pub fn impersonation_status(&self, token: &SessionToken) -> ImpersonationStatus {
        match self.impersonation.context(token) {
            Some(ctx) => ImpersonationStatus {
                is_impersonating: true,
                original: Some(ctx.original),
            },
            None => ImpersonationStatus::default(),
        }
    }

    /// Audit entries, most recent first.
    pub fn audit_log(&self) -> Vec<AuditEntry> {
        self.audit.snapshot()
    }
}

impl std::fmt::Debug for AccessKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessKernel")
            .field("sessions", &self.sessions)
            .field("audit_entries", &self.audit.len())
            .finish_non_exhaustive()
    }
}
