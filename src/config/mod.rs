//! Configuration loading and validation.
//!
//! Loads Warden configuration from `./warden.toml` (or `$WARDEN_CONFIG_PATH`).
//! Environment variables override file values; file values override defaults.
//!
//! Precedence: env vars > config file > defaults.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

// ── Top-level config ────────────────────────────────────────────

/// Top-level Warden configuration loaded from TOML.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    /// Tracing log level filter used when `RUST_LOG` is unset.
    pub log_level: String,
    /// Authenticator settings (`[auth]`).
    pub auth: AuthConfig,
    /// Session manager settings (`[session]`).
    pub session: SessionConfig,
    /// Audit log settings (`[audit]`).
    pub audit: AuditConfig,
    /// Impersonation rules (`[impersonation]`).
    pub impersonation: ImpersonationConfig,
    /// Filesystem paths (`[paths]`).
    pub paths: PathsConfig,
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            auth: AuthConfig::default(),
            session: SessionConfig::default(),
            audit: AuditConfig::default(),
            impersonation: ImpersonationConfig::default(),
            paths: PathsConfig::default(),
        }
    }
}

impl WardenConfig {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// Config file path: `$WARDEN_CONFIG_PATH` or `./warden.toml`.
    /// If the file does not exist, returns defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed, or
    /// if the merged configuration fails validation.
    pub fn load() -> Result<Self> {
        let path = Self::config_path_with(|key| std::env::var(key).ok());
        let mut config = Self::load_from_file(&path)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load from an explicit file, applying env overrides and validation.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let mut config = Self::from_toml(&contents)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load from TOML file only, no env overrides.
    fn load_from_file(path: &std::path::Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                Self::from_toml(&contents)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no config file found, using defaults");
                Ok(WardenConfig::default())
            }
            Err(e) => Err(anyhow::anyhow!("failed to read config file: {e}")),
        }
    }

    /// Resolve config path using a custom env resolver (for testing).
    pub fn config_path_with(env: impl Fn(&str) -> Option<String>) -> PathBuf {
        match env("WARDEN_CONFIG_PATH") {
            Some(p) => PathBuf::from(p),
            None => PathBuf::from("warden.toml"),
        }
    }

    /// Apply environment variable overrides (env > config > defaults).
    ///
    /// Takes a resolver function for testability (avoids unsafe `set_var` in tests).
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("WARDEN_LOG_LEVEL") {
            self.log_level = v;
        }

        // Auth.
        if let Some(n) = parse_override(&env, "WARDEN_MAX_FAILED_ATTEMPTS") {
            self.auth.max_failed_attempts = n;
        }
        if let Some(n) = parse_override(&env, "WARDEN_LOCKOUT_MINUTES") {
            self.auth.lockout_minutes = n;
        }

        // Session.
        if let Some(n) = parse_override(&env, "WARDEN_SESSION_TIMEOUT_SECS") {
            self.session.timeout_secs = n;
        }

        // Paths.
        if let Some(v) = env("WARDEN_AUDIT_LOG") {
            self.audit.sink_path = Some(v);
        }
        if let Some(v) = env("WARDEN_STATE_DIR") {
            self.paths.state_dir = v;
        }
        if let Some(v) = env("WARDEN_ACCESS_POLICY") {
            self.paths.access_policy = Some(v);
        }
    }

    /// Parse a TOML string into config (for testing).
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: WardenConfig =
            toml::from_str(toml_str).context("failed to parse config TOML")?;
        Ok(config)
    }

    /// Reject configurations the kernel cannot run with.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        if self.auth.max_failed_attempts == 0 {
            bail!("auth.max_failed_attempts must be at least 1");
        }
        if self.auth.lockout_minutes == 0 {
            bail!("auth.lockout_minutes must be at least 1");
        }
        if !(6..=8).contains(&self.auth.totp_digits) {
            bail!(
                "auth.totp_digits must be between 6 and 8, got {}",
                self.auth.totp_digits
            );
        }
        if self.auth.totp_step_secs == 0 {
            bail!("auth.totp_step_secs must be at least 1");
        }
        if self.session.timeout_secs == 0 {
            bail!("session.timeout_secs must be at least 1");
        }
        if self.session.warning_secs >= self.session.timeout_secs {
            bail!(
                "session.warning_secs ({}) must be below session.timeout_secs ({})",
                self.session.warning_secs,
                self.session.timeout_secs
            );
        }
        if self.session.tick_secs == 0 {
            bail!("session.tick_secs must be at least 1");
        }
        if self.audit.capacity == 0 {
            bail!("audit.capacity must be at least 1");
        }
        Ok(())
    }

    /// Path of the session snapshot file inside the state directory.
    pub fn sessions_file(&self) -> PathBuf {
        PathBuf::from(&self.paths.state_dir).join("sessions.json")
    }
}

/// Parse a numeric env override, warning on garbage.
fn parse_override<T: std::str::FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let value = env(key)?;
    match value.parse() {
        Ok(n) => Some(n),
        Err(_) => {
            tracing::warn!(var = key, value = %value, "ignoring invalid env override");
            None
        }
    }
}

// ── Auth config ─────────────────────────────────────────────────

/// Authenticator settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Consecutive failures that trigger a lockout.
    pub max_failed_attempts: u32,
    /// Length of the lockout window in minutes.
    pub lockout_minutes: u32,
    /// Issuer shown in authenticator apps.
    pub totp_issuer: String,
    /// Digits per one-time code.
    pub totp_digits: u32,
    /// Seconds per TOTP step.
    pub totp_step_secs: u64,
    /// Steps of clock drift tolerated either side.
    pub totp_skew_steps: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            max_failed_attempts: 3,
            lockout_minutes: 15,
            totp_issuer: "Warden".to_string(),
            totp_digits: 6,
            totp_step_secs: 30,
            totp_skew_steps: 1,
        }
    }
}

// ── Session config ──────────────────────────────────────────────

/// Session manager settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Full countdown in seconds; activity resets to this value.
    pub timeout_secs: u64,
    /// Remaining time below which the expiry warning is raised.
    pub warning_secs: u64,
    /// Seconds between countdown ticks.
    pub tick_secs: u64,
    /// End an account's other sessions when it logs in again.
    pub single_session_per_account: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 600,
            warning_secs: 300,
            tick_secs: 1,
            single_session_per_account: false,
        }
    }
}

// ── Audit config ────────────────────────────────────────────────

/// Audit log settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Entries retained in memory.
    pub capacity: usize,
    /// Optional JSONL mirror of every entry.
    pub sink_path: Option<String>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            sink_path: None,
        }
    }
}

// ── Impersonation config ────────────────────────────────────────

/// Impersonation rules.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ImpersonationConfig {
    /// Allow a superuser to impersonate their own account.
    pub allow_self: bool,
    /// Allow starting a new impersonation while one is active.
    pub allow_nested: bool,
}

impl Default for ImpersonationConfig {
    fn default() -> Self {
        Self {
            allow_self: true,
            allow_nested: true,
        }
    }
}

// ── Paths config ────────────────────────────────────────────────

/// Filesystem paths for persistent state.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory holding the session snapshot file.
    pub state_dir: String,
    /// Access policy TOML. The built-in policy is used when unset.
    pub access_policy: Option<String>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_dir: ".warden".to_string(),
            access_policy: None,
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────
