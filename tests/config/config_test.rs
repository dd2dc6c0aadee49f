//! Coverage for config parsing, overrides and validation.

use std::path::PathBuf;

use warden::config::{AuthConfig, SessionConfig, WardenConfig};

#[test]
fn defaults_match_the_portal_policy() {
    let config = WardenConfig::default();
    assert_eq!(config.auth.max_failed_attempts, 3);
    assert_eq!(config.auth.lockout_minutes, 15);
    assert_eq!(config.session.timeout_secs, 600);
    assert_eq!(config.session.warning_secs, 300);
    assert_eq!(config.session.tick_secs, 1);
    assert!(!config.session.single_session_per_account);
    assert_eq!(config.audit.capacity, 100);
    assert!(config.audit.sink_path.is_none());
    assert!(config.impersonation.allow_self);
    assert!(config.impersonation.allow_nested);
    assert!(config.validate().is_ok());
}

#[test]
fn parse_full_config() {
    let toml_str = r#"
log_level = "debug"

[auth]
max_failed_attempts = 5
lockout_minutes = 30
totp_issuer = "Acme HR"
totp_digits = 8

[session]
timeout_secs = 900
warning_secs = 120
single_session_per_account = true

[audit]
capacity = 250
sink_path = "/var/log/warden/audit.jsonl"

[impersonation]
allow_self = false

[paths]
state_dir = "/var/lib/warden"
access_policy = "/etc/warden/access.toml"
"#;
    let config = match WardenConfig::from_toml(toml_str) {
        Ok(config) => config,
        Err(err) => panic!("full config should parse: {err}"),
    };
    assert_eq!(config.log_level, "debug");
    assert_eq!(config.auth.max_failed_attempts, 5);
    assert_eq!(config.auth.totp_issuer, "Acme HR");
    assert_eq!(config.auth.totp_digits, 8);
    assert_eq!(config.auth.totp_step_secs, 30);
    assert_eq!(config.session.timeout_secs, 900);
    assert!(config.session.single_session_per_account);
    assert_eq!(config.audit.capacity, 250);
    assert!(!config.impersonation.allow_self);
    assert!(config.impersonation.allow_nested);
    assert_eq!(
        config.sessions_file(),
        PathBuf::from("/var/lib/warden/sessions.json")
    );
    assert!(config.validate().is_ok());
}

#[test]
fn empty_document_is_all_defaults() {
    let config = match WardenConfig::from_toml("") {
        Ok(config) => config,
        Err(err) => panic!("empty config should parse: {err}"),
    };
    assert_eq!(config.session.timeout_secs, 600);
    assert_eq!(config.sessions_file(), PathBuf::from(".warden/sessions.json"));
}

#[test]
fn malformed_toml_is_rejected() {
    assert!(WardenConfig::from_toml("[session\ntimeout_secs = 1").is_err());
    assert!(WardenConfig::from_toml("[session]\ntimeout_secs = \"ten\"").is_err());
}

#[test]
fn validation_rejects_unusable_values() {
    let invalid = [
        WardenConfig {
            auth: AuthConfig {
                max_failed_attempts: 0,
                ..AuthConfig::default()
            },
            ..WardenConfig::default()
        },
        WardenConfig {
            auth: AuthConfig {
                lockout_minutes: 0,
                ..AuthConfig::default()
            },
            ..WardenConfig::default()
        },
        WardenConfig {
            auth: AuthConfig {
                totp_digits: 4,
                ..AuthConfig::default()
            },
            ..WardenConfig::default()
        },
        WardenConfig {
            session: SessionConfig {
                timeout_secs: 0,
                ..SessionConfig::default()
            },
            ..WardenConfig::default()
        },
        WardenConfig {
            session: SessionConfig {
                warning_secs: 600,
                ..SessionConfig::default()
            },
            ..WardenConfig::default()
        },
        WardenConfig {
            session: SessionConfig {
                tick_secs: 0,
                ..SessionConfig::default()
            },
            ..WardenConfig::default()
        },
    ];
    for config in invalid {
        assert!(config.validate().is_err(), "{config:?} should be invalid");
    }
}

#[test]
fn env_overrides_every_documented_key() {
    let mut config = WardenConfig::default();
    config.apply_overrides(|key| {
        let value = match key {
            "WARDEN_LOG_LEVEL" => "trace",
            "WARDEN_MAX_FAILED_ATTEMPTS" => "4",
            "WARDEN_LOCKOUT_MINUTES" => "20",
            "WARDEN_SESSION_TIMEOUT_SECS" => "1200",
            "WARDEN_AUDIT_LOG" => "/tmp/audit.jsonl",
            "WARDEN_STATE_DIR" => "/tmp/warden",
            "WARDEN_ACCESS_POLICY" => "/tmp/access.toml",
            _ => return None,
        };
        Some(value.to_owned())
    });
    assert_eq!(config.log_level, "trace");
    assert_eq!(config.auth.max_failed_attempts, 4);
    assert_eq!(config.auth.lockout_minutes, 20);
    assert_eq!(config.session.timeout_secs, 1200);
    assert_eq!(config.audit.sink_path.as_deref(), Some("/tmp/audit.jsonl"));
    assert_eq!(config.paths.state_dir, "/tmp/warden");
    assert_eq!(config.paths.access_policy.as_deref(), Some("/tmp/access.toml"));
}

#[test]
fn load_from_file() {
    let dir = match tempfile::tempdir() {
        Ok(dir) => dir,
        Err(err) => panic!("tempdir should be created: {err}"),
    };
    let path = dir.path().join("warden.toml");
    assert!(std::fs::write(&path, "[audit]\ncapacity = 42\n").is_ok());

    let config = match WardenConfig::load_from(&path) {
        Ok(config) => config,
        Err(err) => panic!("config should load: {err}"),
    };
    assert_eq!(config.audit.capacity, 42);

    assert!(WardenConfig::load_from(&dir.path().join("missing.toml")).is_err());

    let invalid = dir.path().join("invalid.toml");
    assert!(std::fs::write(&invalid, "[audit]\ncapacity = 0\n").is_ok());
    assert!(WardenConfig::load_from(&invalid).is_err());
}
