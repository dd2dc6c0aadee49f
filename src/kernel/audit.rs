//! Bounded audit trail of security-relevant events.
//!
//! Entries are kept in memory, most recent first, capped at a fixed
//! capacity with oldest-first eviction. Each entry may also be mirrored as
//! one JSON line to an append-only sink. Recording never fails the caller:
//! sink errors are logged and dropped.

use std::collections::VecDeque;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::kernel::clock::Clock;
use crate::types::{Principal, PrincipalId};

/// Actor id recorded when nobody is authenticated.
pub const UNKNOWN_ACTOR: &str = "unknown";

/// Origin recorded when the actor's network origin is unknown.
pub const UNKNOWN_ORIGIN: &str = "0.0.0.0";

/// Default number of entries retained in memory.
pub const DEFAULT_CAPACITY: usize = 100;

/// Action tags emitted by the kernel.
pub mod actions {
    /// Password (and second factor, if enrolled) accepted.
    pub const LOGIN_SUCCESS: &str = "LOGIN_SUCCESS";
    /// Unknown account or wrong password.
    pub const LOGIN_FAILED: &str = "LOGIN_FAILED";
    /// Attempt rejected because the account is locked.
    pub const LOGIN_BLOCKED: &str = "LOGIN_BLOCKED";
    /// Failure threshold reached; lockout window started.
    pub const ACCOUNT_LOCKED: &str = "ACCOUNT_LOCKED";
    /// Wrong second-factor code at login.
    pub const LOGIN_2FA_FAILED: &str = "LOGIN_2FA_FAILED";
    /// Session ended by the user.
    pub const LOGOUT: &str = "LOGOUT";
    /// Session issued.
    pub const SESSION_STARTED: &str = "SESSION_STARTED";
    /// Session countdown reached zero; forced logout.
    pub const SESSION_EXPIRED: &str = "SESSION_EXPIRED";
    /// Second-factor secret issued.
    pub const TWO_FACTOR_ENROLLMENT_STARTED: &str = "TWO_FACTOR_ENROLLMENT_STARTED";
    /// Second factor confirmed and enabled.
    pub const TWO_FACTOR_ENABLED: &str = "TWO_FACTOR_ENABLED";
    /// Code confirmed against an already enabled second factor.
    pub const TWO_FACTOR_VERIFIED: &str = "TWO_FACTOR_VERIFIED";
    /// Wrong code during second-factor confirmation.
    pub const TWO_FACTOR_VERIFY_FAILED: &str = "TWO_FACTOR_VERIFY_FAILED";
    /// Superuser started acting as another identity.
    pub const IMPERSONATION_START: &str = "IMPERSONATION_START";
    /// Impersonation reverted to the original identity.
    pub const IMPERSONATION_END: &str = "IMPERSONATION_END";
    /// Impersonation attempt refused.
    pub const IMPERSONATION_DENIED: &str = "IMPERSONATION_DENIED";
    /// Capability or route check failed for a protected action.
    pub const UNAUTHORIZED_ACTION: &str = "UNAUTHORIZED_ACTION";
}

/// Module tags emitted by the kernel.
pub mod modules {
    /// Authenticator.
    pub const AUTH: &str = "auth";
    /// Session manager.
    pub const SESSION: &str = "session";
    /// Permission evaluator.
    pub const ACCESS: &str = "access";
    /// Impersonation controller.
    pub const IMPERSONATION: &str = "impersonation";
}

/// A single immutable audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Unique entry id.
    pub id: Uuid,
    /// Acting principal, or [`UNKNOWN_ACTOR`].
    pub actor_id: PrincipalId,
    /// Action tag (see [`actions`]).
    pub action: String,
    /// Module tag (see [`modules`]).
    pub module: String,
    /// When the entry was recorded.
    pub timestamp: DateTime<Utc>,
    /// Actor's last known origin, or [`UNKNOWN_ORIGIN`].
    pub origin: String,
    /// Free-form payload.
    pub details: serde_json::Value,
}

/// In-memory bounded audit log with an optional JSON-lines mirror.
pub struct AuditLog {
    entries: Mutex<VecDeque<AuditEntry>>,
    capacity: usize,
    sink: Option<Mutex<Box<dyn Write + Send>>>,
    clock: Arc<dyn Clock>,
}

impl AuditLog {
    /// Create an in-memory log holding at most `capacity` entries.
    pub fn new(capacity: usize, clock: Arc<dyn Clock>) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            sink: None,
            clock,
        }
    }

    /// Mirror entries to an append-only file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened for appending.
    pub fn with_sink_path(self, path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| anyhow::anyhow!("failed to open audit sink {}: {e}", path.display()))?;
        Ok(self.with_sink(Box::new(file)))
    }

    /// Mirror entries to an arbitrary writer (for testing).
    pub fn with_sink(mut self, writer: Box<dyn Write + Send>) -> Self {
        self.sink = Some(Mutex::new(writer));
        self
    }

    /// Record an event on behalf of `actor` (or nobody).
    ///
    /// Never fails. Returns the stored entry.
    pub fn record(
        &self,
        actor: Option<&Principal>,
        action: &str,
        module: &str,
        details: Option<serde_json::Value>,
    ) -> AuditEntry {
        let entry = AuditEntry {
            id: Uuid::new_v4(),
            actor_id: actor.map_or_else(|| UNKNOWN_ACTOR.to_owned(), |p| p.id.clone()),
            action: action.to_owned(),
            module: module.to_owned(),
            timestamp: self.clock.now(),
            origin: actor
                .and_then(|p| p.last_origin.clone())
                .unwrap_or_else(|| UNKNOWN_ORIGIN.to_owned()),
            details: details.unwrap_or(serde_json::Value::Null),
        };

        {
            let mut entries = self.lock_entries();
            entries.push_front(entry.clone());
            entries.truncate(self.capacity);
        }

        self.mirror(&entry);
        entry
    }

    /// All retained entries, most recent first.
    pub fn snapshot(&self) -> Vec<AuditEntry> {
        self.lock_entries().iter().cloned().collect()
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    /// Whether no entries are retained.
    pub fn is_empty(&self) -> bool {
        self.lock_entries().is_empty()
    }

    /// Maximum number of retained entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every retained entry. The sink is left untouched.
    pub fn clear(&self) {
        self.lock_entries().clear();
    }

    fn lock_entries(&self) -> MutexGuard<'_, VecDeque<AuditEntry>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Write a single JSON line to the sink, if any.
    fn mirror(&self, entry: &AuditEntry) {
        let Some(sink) = &self.sink else {
            return;
        };
        let line = match serde_json::to_string(entry) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, action = %entry.action, "failed to serialise audit entry");
                return;
            }
        };
        let mut writer = match sink.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = writeln!(writer, "{line}").and_then(|()| writer.flush()) {
            warn!(error = %e, action = %entry.action, "failed to write audit sink");
        }
    }
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("sink", &self.sink.is_some())
            .finish()
    }
}
