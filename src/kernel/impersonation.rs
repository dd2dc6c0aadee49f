//! Impersonation controller.
//!
//! A superuser may act as another principal inside their own session. The
//! session keeps an [`ImpersonationContext`] holding the real identity so
//! that [`ImpersonationController::stop`] can swap it back. Nested
//! impersonation keeps the outermost original.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::ImpersonationConfig;
use crate::kernel::accounts::{AccountRepository, RepositoryError};
use crate::kernel::audit::{actions, modules, AuditLog};
use crate::kernel::clock::Clock;
use crate::kernel::permissions::AccessPolicy;
use crate::kernel::session::{SessionManager, SessionToken};
use crate::types::{Principal, PrincipalId};

/// Link from an impersonated session back to the real identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImpersonationContext {
    /// The superuser who started impersonating.
    pub original: Principal,
    /// Id of the identity currently being acted as.
    pub acting_id: PrincipalId,
    /// When the impersonation began.
    pub started_at: DateTime<Utc>,
}

/// Why an impersonation request was refused.
#[derive(Debug, thiserror::Error)]
pub enum ImpersonationError {
    /// The session token is unknown or expired.
    #[error("no active session")]
    NoSession,

    /// The acting principal lacks the wildcard capability.
    #[error("principal {0} may not impersonate")]
    NotSuperuser(PrincipalId),

    /// No account has the requested id.
    #[error("impersonation target {0} not found")]
    TargetNotFound(PrincipalId),

    /// Self-impersonation is disabled.
    #[error("self-impersonation is not allowed")]
    SelfImpersonation,

    /// Nested impersonation is disabled and one is already active.
    #[error("already impersonating {0}")]
    AlreadyImpersonating(PrincipalId),

    /// `stop` was called on a session that is not impersonating.
    #[error("session is not impersonating")]
    NotImpersonating,

    /// The account store failed.
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Starts and stops impersonation on live sessions.
pub struct ImpersonationController {
    config: ImpersonationConfig,
    sessions: Arc<SessionManager>,
    accounts: Arc<dyn AccountRepository>,
    policy: Arc<AccessPolicy>,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
}

impl ImpersonationController {
    /// Controller over `sessions`, resolving targets through `accounts`.
    pub fn new(
        config: ImpersonationConfig,
        sessions: Arc<SessionManager>,
        accounts: Arc<dyn AccountRepository>,
        policy: Arc<AccessPolicy>,
        audit: Arc<AuditLog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            sessions,
            accounts,
            policy,
            audit,
            clock,
        }
    }

    /// Make the session behind `token` act as `target_id`.
    ///
    /// Returns the new acting principal.
    ///
    /// # Errors
    ///
    /// Fails without changing the session when the caller is not a
    /// superuser, the target does not exist, or a configured restriction
    /// applies. Non-superuser attempts are audited as `IMPERSONATION_DENIED`.
    pub async fn impersonate(
        &self,
        token: &SessionToken,
        target_id: &str,
    ) -> Result<Principal, ImpersonationError> {
        let session = self.sessions.get(token).ok_or(ImpersonationError::NoSession)?;
        let acting = &session.principal;

        if !acting.is_superuser() {
            warn!(principal = %acting.id, target = target_id, "impersonation denied: not a superuser");
            self.audit.record(
                Some(acting),
                actions::IMPERSONATION_DENIED,
                modules::IMPERSONATION,
                Some(serde_json::json!({ "target_id": target_id })),
            );
            return Err(ImpersonationError::NotSuperuser(acting.id.clone()));
        }
        if let Some(ctx) = &session.impersonation {
            if !self.config.allow_nested {
                return Err(ImpersonationError::AlreadyImpersonating(ctx.acting_id.clone()));
            }
        }
        if target_id == acting.id && !self.config.allow_self {
            return Err(ImpersonationError::SelfImpersonation);
        }

        let target = match self.accounts.find_by_id(target_id).await? {
            Some(account) => account.to_principal(&self.policy),
            None => {
                warn!(principal = %acting.id, target = target_id, "impersonation target not found");
                return Err(ImpersonationError::TargetNotFound(target_id.to_owned()));
            }
        };

        let original = session
            .impersonation
            .as_ref()
            .map_or_else(|| acting.clone(), |ctx| ctx.original.clone());
        let context = ImpersonationContext {
            original: original.clone(),
            acting_id: target.id.clone(),
            started_at: self.clock.now(),
        };

        let updated = self.sessions.update(token, |s| {
            s.principal = target.clone();
            s.impersonation = Some(context);
        });
        if updated.is_none() {
            // Session ended while the target was being looked up.
            return Err(ImpersonationError::NoSession);
        }

        info!(original = %original.id, target = %target.id, "impersonation started");
        self.audit.record(
            Some(&original),
            actions::IMPERSONATION_START,
            modules::IMPERSONATION,
            Some(serde_json::json!({
                "original_id": original.id,
                "target_id": target.id,
            })),
        );
        Ok(target)
    }

    /// Restore the real identity of the session behind `token`.
    ///
    /// Returns the restored principal.
    ///
    /// # Errors
    ///
    /// Returns [`ImpersonationError::NotImpersonating`] when there is nothing
    /// to stop, or [`ImpersonationError::NoSession`] for an unknown token.
    pub fn stop(&self, token: &SessionToken) -> Result<Principal, ImpersonationError> {
        let mut ended: Option<(Principal, PrincipalId)> = None;
        self.sessions
            .update(token, |s| {
                if let Some(ctx) = s.impersonation.take() {
                    s.principal = ctx.original.clone();
                    ended = Some((ctx.original, ctx.acting_id));
                }
            })
            .ok_or(ImpersonationError::NoSession)?;

        let (original, acting_id) = ended.ok_or(ImpersonationError::NotImpersonating)?;
        info!(original = %original.id, target = %acting_id, "impersonation ended");
        self.audit.record(
            Some(&original),
            actions::IMPERSONATION_END,
            modules::IMPERSONATION,
            Some(serde_json::json!({
                "original_id": original.id,
                "target_id": acting_id,
            })),
        );
        Ok(original)
    }

    /// The impersonation context of `token`, if one is active.
    pub fn context(&self, token: &SessionToken) -> Option<ImpersonationContext> {
        self.sessions.get(token)?.impersonation
    }
}

impl std::fmt::Debug for ImpersonationController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImpersonationController")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
