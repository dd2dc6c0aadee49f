//! Session manager: server-side session table keyed by opaque tokens.
//!
//! Each session runs a single shared countdown. A tick lowers the remaining
//! time; any recognised activity signal puts it back to the full timeout.
//! Reaching zero is a forced logout: the session is removed, its snapshot
//! cleared and a `SESSION_EXPIRED` audit entry written.
//!
//! Countdowns run as one tokio task per session, spawned at most once and
//! aborted when the session entry is dropped, so repeated login/logout
//! cycles never accumulate timers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use base64::Engine;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::kernel::audit::{actions, modules, AuditLog};
use crate::kernel::clock::Clock;
use crate::kernel::impersonation::ImpersonationContext;
use crate::kernel::persistence::{PersistedSession, SessionDescriptor, SessionSnapshotStore};
use crate::types::Principal;

/// Random bytes per session token.
const TOKEN_BYTES: usize = 32;

/// Characters of a token shown in logs.
const FINGERPRINT_LEN: usize = 8;

// ---------------------------------------------------------------------------
// Tokens and signals
// ---------------------------------------------------------------------------

/// Opaque bearer token identifying one session. The client keeps only this.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionToken(String);

impl SessionToken {
    /// Fresh random token (256 bits, base64url without padding).
    pub fn generate() -> Self {
        let mut buf = [0u8; TOKEN_BYTES];
        rand::thread_rng().fill_bytes(&mut buf);
        Self(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(buf))
    }

    /// Raw token string, for handing back to the client.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix safe to put in logs.
    pub fn fingerprint(&self) -> &str {
        self.0.get(..FINGERPRINT_LEN).unwrap_or(&self.0)
    }
}

impl From<String> for SessionToken {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl From<&str> for SessionToken {
    fn from(raw: &str) -> Self {
        Self(raw.to_owned())
    }
}

impl std::fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionToken({}…)", self.fingerprint())
    }
}

/// User activity reported by the client. Every signal resets the countdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivitySignal {
    /// Pointer button pressed.
    PointerDown,
    /// Pointer moved.
    PointerMove,
    /// Key pressed.
    KeyPress,
    /// Page scrolled.
    Scroll,
    /// Touch started.
    Touch,
    /// Element clicked.
    Click,
    /// Explicit keep-alive from a client without UI events.
    Heartbeat,
}

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

/// A live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Bearer token.
    pub token: SessionToken,
    /// Acting principal (the impersonated one while impersonating).
    pub principal: Principal,
    /// When the session was issued.
    pub created_at: DateTime<Utc>,
    /// Seconds left on the countdown.
    pub remaining_secs: u64,
    /// Present while a superuser acts as someone else.
    pub impersonation: Option<ImpersonationContext>,
}

/// Observer view of a session's countdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    /// Seconds left.
    pub remaining_secs: u64,
    /// Remaining time is under the warning threshold.
    pub warning: bool,
}

/// Result of one countdown tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Still running.
    Active {
        /// Seconds left after this tick.
        remaining_secs: u64,
    },
    /// Countdown hit zero; the session was logged out.
    Expired,
    /// No session with that token.
    Unknown,
}

struct SessionEntry {
    session: Session,
    countdown: Option<JoinHandle<()>>,
}

impl Drop for SessionEntry {
    fn drop(&mut self) {
        if let Some(handle) = self.countdown.take() {
            handle.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Owns every live session.
pub struct SessionManager {
    config: SessionConfig,
    sessions: Mutex<HashMap<SessionToken, SessionEntry>>,
    snapshots: Option<SessionSnapshotStore>,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
}

impl SessionManager {
    /// In-memory manager with no snapshot file.
    pub fn new(config: SessionConfig, audit: Arc<AuditLog>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
            snapshots: None,
            audit,
            clock,
        }
    }

    /// Persist sessions through `store` so they survive restarts.
    pub fn with_snapshots(mut self, store: SessionSnapshotStore) -> Self {
        self.snapshots = Some(store);
        self
    }

    /// Issue a session for `principal` with a full countdown.
    pub fn start(&self, principal: Principal) -> Session {
        if self.config.single_session_per_account {
            for token in self.tokens_for(&principal.id) {
                info!(
                    principal = %principal.id,
                    session = token.fingerprint(),
                    "ending previous session (single-session mode)"
                );
                self.end(&token);
            }
        }

        let session = Session {
            token: SessionToken::generate(),
            principal,
            created_at: self.clock.now(),
            remaining_secs: self.config.timeout_secs,
            impersonation: None,
        };

        {
            let mut sessions = self.lock_sessions();
            self.persist(&session);
            sessions.insert(
                session.token.clone(),
                SessionEntry {
                    session: session.clone(),
                    countdown: None,
                },
            );
        }

        info!(
            principal = %session.principal.id,
            session = session.token.fingerprint(),
            timeout_secs = self.config.timeout_secs,
            "session started"
        );
        self.audit.record(
            Some(&session.principal),
            actions::SESSION_STARTED,
            modules::SESSION,
            Some(serde_json::json!({ "timeout_secs": self.config.timeout_secs })),
        );
        session
    }

    /// Start the once-per-tick countdown task for `token`.
    ///
    /// Returns false if the session is unknown, already has a countdown, or
    /// no tokio runtime is available to drive it.
    pub fn spawn_countdown(self: &Arc<Self>, token: &SessionToken) -> bool {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(session = token.fingerprint(), "no tokio runtime, countdown not started");
            return false;
        };
        let mut sessions = self.lock_sessions();
        let Some(entry) = sessions.get_mut(token) else {
            return false;
        };
        if entry.countdown.is_some() {
            return false;
        }

        let manager: Weak<Self> = Arc::downgrade(self);
        let task_token = token.clone();
        let period = Duration::from_secs(self.config.tick_secs);
        entry.countdown = Some(runtime.spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                if !matches!(manager.tick(&task_token), TickOutcome::Active { .. }) {
                    break;
                }
            }
        }));
        debug!(session = token.fingerprint(), "countdown started");
        true
    }

    /// Advance the countdown of `token` by one tick.
    pub fn tick(&self, token: &SessionToken) -> TickOutcome {
        let step = self.config.tick_secs;
        let expired = {
            let mut sessions = self.lock_sessions();
            let Some(entry) = sessions.get_mut(token) else {
                return TickOutcome::Unknown;
            };
            entry.session.remaining_secs = entry.session.remaining_secs.saturating_sub(step);
            if entry.session.remaining_secs > 0 {
                return TickOutcome::Active {
                    remaining_secs: entry.session.remaining_secs,
                };
            }
            let removed = sessions.remove(token);
            self.unpersist(token);
            removed
        };

        // Dropping the entry aborts the countdown; done outside the lock.
        if let Some(entry) = expired {
            let session = entry.session.clone();
            drop(entry);
            warn!(
                principal = %session.principal.id,
                session = token.fingerprint(),
                "session expired, forcing logout"
            );
            self.audit.record(
                Some(&session.principal),
                actions::SESSION_EXPIRED,
                modules::SESSION,
                None,
            );
        }
        TickOutcome::Expired
    }

    /// Reset the countdown of `token` to the full timeout.
    ///
    /// Returns the new remaining time, or `None` for an unknown token.
    pub fn record_activity(&self, token: &SessionToken, signal: ActivitySignal) -> Option<u64> {
        let mut sessions = self.lock_sessions();
        let entry = sessions.get_mut(token)?;
        entry.session.remaining_secs = self.config.timeout_secs;
        self.persist(&entry.session);
        debug!(session = token.fingerprint(), ?signal, "session activity");
        Some(entry.session.remaining_secs)
    }

    /// End `token`'s session: stop its countdown, forget it and clear its snapshot.
    pub fn end(&self, token: &SessionToken) -> Option<Session> {
        let removed = {
            let mut sessions = self.lock_sessions();
            let removed = sessions.remove(token);
            if removed.is_some() {
                self.unpersist(token);
            }
            removed
        }?;

        let session = removed.session.clone();
        drop(removed);
        info!(
            principal = %session.principal.id,
            session = token.fingerprint(),
            "session ended"
        );
        self.audit
            .record(Some(&session.principal), actions::LOGOUT, modules::SESSION, None);
        Some(session)
    }

    /// Copy of the session for `token`.
    pub fn get(&self, token: &SessionToken) -> Option<Session> {
        self.lock_sessions()
            .get(token)
            .map(|entry| entry.session.clone())
    }

    /// Acting principal of `token`.
    pub fn principal(&self, token: &SessionToken) -> Option<Principal> {
        self.lock_sessions()
            .get(token)
            .map(|entry| entry.session.principal.clone())
    }

    /// Countdown view of `token`.
    pub fn status(&self, token: &SessionToken) -> Option<SessionStatus> {
        self.lock_sessions().get(token).map(|entry| SessionStatus {
            remaining_secs: entry.session.remaining_secs,
            warning: entry.session.remaining_secs < self.config.warning_secs,
        })
    }

    /// Mutate a live session and re-persist it. Returns the updated copy.
    pub fn update(&self, token: &SessionToken, f: impl FnOnce(&mut Session)) -> Option<Session> {
        let mut sessions = self.lock_sessions();
        let entry = sessions.get_mut(token)?;
        f(&mut entry.session);
        self.persist(&entry.session);
        Some(entry.session.clone())
    }

    /// Apply `f` to every session whose acting or original principal is `principal_id`.
    pub fn update_principal(&self, principal_id: &str, f: impl Fn(&mut Principal)) -> usize {
        let mut sessions = self.lock_sessions();
        let mut touched = 0usize;
        for entry in sessions.values_mut() {
            let mut changed = false;
            if entry.session.principal.id == principal_id {
                f(&mut entry.session.principal);
                changed = true;
            }
            if let Some(ctx) = entry.session.impersonation.as_mut() {
                if ctx.original.id == principal_id {
                    f(&mut ctx.original);
                    changed = true;
                }
            }
            if changed {
                self.persist(&entry.session);
                touched = touched.saturating_add(1);
            }
        }
        touched
    }

    /// Tokens of sessions opened by `principal_id` (directly or as impersonator).
    pub fn tokens_for(&self, principal_id: &str) -> Vec<SessionToken> {
        self.lock_sessions()
            .values()
            .filter(|entry| {
                let original = entry
                    .session
                    .impersonation
                    .as_ref()
                    .map(|ctx| ctx.original.id.as_str());
                original.unwrap_or(entry.session.principal.id.as_str()) == principal_id
            })
            .map(|entry| entry.session.token.clone())
            .collect()
    }

    /// Every live token.
    pub fn tokens(&self) -> Vec<SessionToken> {
        self.lock_sessions().keys().cloned().collect()
    }

    /// Number of live sessions.
    pub fn active_count(&self) -> usize {
        self.lock_sessions().len()
    }

    /// Restore unexpired sessions from the snapshot file.
    ///
    /// Expired records are removed from the file. Returns the number restored.
    /// Countdowns are not started; see [`spawn_countdown`](Self::spawn_countdown).
    pub fn rehydrate(&self) -> usize {
        let Some(store) = &self.snapshots else {
            return 0;
        };
        let records = match store.load_or_quarantine() {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, path = %store.path().display(), "failed to load session snapshots (non-fatal)");
                return 0;
            }
        };

        let now = self.clock.now();
        let mut restored = 0usize;
        {
            let mut sessions = self.lock_sessions();
            for (raw, record) in &records {
                if record.session.expires_at <= now {
                    continue;
                }
                let remaining = record
                    .session
                    .expires_at
                    .signed_duration_since(now)
                    .num_seconds()
                    .clamp(1, i64::try_from(self.config.timeout_secs).unwrap_or(i64::MAX));
                let token = SessionToken::from(raw.as_str());
                sessions.insert(
                    token.clone(),
                    SessionEntry {
                        session: Session {
                            token,
                            principal: record.principal.clone(),
                            created_at: now,
                            remaining_secs: u64::try_from(remaining).unwrap_or(1),
                            impersonation: record.impersonation.clone(),
                        },
                        countdown: None,
                    },
                );
                restored = restored.saturating_add(1);
            }
        }

        match store.retain(|_, record| record.session.expires_at > now) {
            Ok(0) => {}
            Ok(dropped) => info!(dropped, "discarded expired session snapshots"),
            Err(e) => warn!(error = %e, "failed to prune expired session snapshots"),
        }
        if restored > 0 {
            info!(restored, "rehydrated sessions");
        }
        restored
    }

    fn persist(&self, session: &Session) {
        let Some(store) = &self.snapshots else {
            return;
        };
        let remaining = i64::try_from(session.remaining_secs).unwrap_or(i64::MAX);
        let now = self.clock.now();
        let expires_at = now
            .checked_add_signed(chrono::Duration::seconds(remaining))
            .unwrap_or(now);
        let record = PersistedSession {
            principal: session.principal.clone(),
            session: SessionDescriptor { expires_at },
            impersonation: session.impersonation.clone(),
        };
        if let Err(e) = store.put(session.token.as_str(), record) {
            warn!(error = %e, session = session.token.fingerprint(), "failed to persist session");
        }
    }

    fn unpersist(&self, token: &SessionToken) {
        let Some(store) = &self.snapshots else {
            return;
        };
        if let Err(e) = store.remove(token.as_str()) {
            warn!(error = %e, session = token.fingerprint(), "failed to clear session snapshot");
        }
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<SessionToken, SessionEntry>> {
        match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("timeout_secs", &self.config.timeout_secs)
            .field("active", &self.active_count())
            .field("persistent", &self.snapshots.is_some())
            .finish()
    }
}
