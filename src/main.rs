//! Warden CLI entry point.
//!
//! Inspects configuration and access policy, evaluates route checks, and
//! drives the kernel against the demo account directory.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{debug, info};

use warden::config::WardenConfig;
use warden::kernel::accounts::{demo_accounts, InMemoryAccountRepository};
use warden::kernel::auth::LoginRequest;
use warden::kernel::permissions::AccessPolicy;
use warden::kernel::{AccessKernel, KernelDeps};
use warden::types::Role;

/// Warden: access-control kernel for an HR portal.
#[derive(Parser)]
#[command(name = "warden", version, about)]
struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Load and validate configuration and access policy, then print a summary.
    Check {
        /// Config file (defaults to `$WARDEN_CONFIG_PATH` or `./warden.toml`).
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Evaluate whether a role may open a route.
    CanAccess {
        /// Role name, e.g. `hr_manager`.
        #[arg(long)]
        role: String,
        /// Route path, e.g. `/payroll`.
        #[arg(long)]
        route: String,
        /// Access policy file (built-in policy when omitted).
        #[arg(long)]
        policy: Option<PathBuf>,
    },
    /// Print the capabilities a role resolves to.
    Capabilities {
        /// Role name.
        #[arg(long)]
        role: String,
        /// Access policy file (built-in policy when omitted).
        #[arg(long)]
        policy: Option<PathBuf>,
    },
    /// Log in against the demo directory and persist the session.
    Login {
        /// Login email.
        #[arg(long)]
        email: String,
        /// Password.
        #[arg(long)]
        password: String,
        /// Second-factor code.
        #[arg(long)]
        code: Option<String>,
    },
    /// List persisted sessions that are still valid.
    Sessions,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    match cli.command {
        Command::Check { config } => handle_check(config.as_deref()),
        Command::CanAccess {
            role,
            route,
            policy,
        } => handle_can_access(&role, &route, policy.as_deref()),
        Command::Capabilities { role, policy } => handle_capabilities(&role, policy.as_deref()),
        Command::Login {
            email,
            password,
            code,
        } => handle_login(email, password, code).await,
        Command::Sessions => handle_sessions().await,
    }
}

/// Validate config and policy.
fn handle_check(config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = match config_path {
        Some(path) => WardenConfig::load_from(path)?,
        None => WardenConfig::load()?,
    };
    warden::logging::init_cli(&config.log_level);

    let policy = load_policy(config.paths.access_policy.as_deref().map(Path::new))?;
    debug!(routes = policy.routes.len(), "policy validated");

    println!("config ok");
    println!(
        "  lockout: {} attempts, {} minutes",
        config.auth.max_failed_attempts, config.auth.lockout_minutes
    );
    println!(
        "  session: {}s timeout, warning under {}s",
        config.session.timeout_secs, config.session.warning_secs
    );
    println!("  audit capacity: {}", config.audit.capacity);
    println!(
        "policy ok (version {}, {} routes, {} open)",
        policy.version,
        policy.routes.len(),
        policy.open_routes.len()
    );
    Ok(())
}

/// Print `allowed` or `denied` for a role and route.
fn handle_can_access(role: &str, route: &str, policy_path: Option<&Path>) -> anyhow::Result<()> {
    warden::logging::init_cli("warn");
    let policy = load_policy(policy_path)?;
    let role: Role = role.parse()?;
    let principal = role_principal(role, &policy);

    let verdict = if policy.can_access(&principal, route) {
        "allowed"
    } else {
        "denied"
    };
    println!("{verdict}");
    Ok(())
}

/// Print a role's resolved capability set.
fn handle_capabilities(role: &str, policy_path: Option<&Path>) -> anyhow::Result<()> {
    warden::logging::init_cli("warn");
    let policy = load_policy(policy_path)?;
    let role: Role = role.parse()?;
    let capabilities = policy.role_capabilities(role);

    if capabilities.is_superuser() {
        println!("*");
    }
    for grant in capabilities.grants() {
        println!("{grant}");
    }
    Ok(())
}

/// One-shot login that leaves a persisted session behind.
async fn handle_login(
    email: String,
    password: String,
    code: Option<String>,
) -> anyhow::Result<()> {
    let config = WardenConfig::load()?;
    let logs_dir = PathBuf::from(&config.paths.state_dir).join("logs");
    let _logging_guard = warden::logging::init_production(&logs_dir, &config.log_level)?;

    let kernel = demo_kernel(config)?;
    let mut request = LoginRequest::new(email, password).with_origin("cli");
    if let Some(code) = code {
        request = request.with_code(code);
    }
    let response = kernel.login(request).await;
    info!(success = response.success, "cli login finished");

    let json = serde_json::to_string_pretty(&response).context("failed to encode response")?;
    println!("{json}");
    Ok(())
}

/// Rehydrate and list sessions from the state directory.
async fn handle_sessions() -> anyhow::Result<()> {
    let config = WardenConfig::load()?;
    warden::logging::init_cli(&config.log_level);

    let kernel = demo_kernel(config)?;
    let restored = kernel.rehydrate();
    println!("{restored} active session(s)");
    for token in kernel.sessions().tokens() {
        let Some(session) = kernel.sessions().get(&token) else {
            continue;
        };
        println!(
            "  {}…  {} ({})  {}s left",
            token.fingerprint(),
            session.principal.email,
            session.principal.role,
            session.remaining_secs
        );
    }
    Ok(())
}

fn demo_kernel(config: WardenConfig) -> anyhow::Result<AccessKernel> {
    let accounts = Arc::new(InMemoryAccountRepository::with_accounts(demo_accounts()));
    let deps = KernelDeps::from_config(config, accounts)?;
    AccessKernel::new(deps)
}

fn load_policy(path: Option<&Path>) -> anyhow::Result<AccessPolicy> {
    match path {
        Some(path) => AccessPolicy::load(path)
            .with_context(|| format!("failed to load access policy {}", path.display())),
        None => Ok(AccessPolicy::default()),
    }
}

/// A principal carrying only what route checks look at.
fn role_principal(role: Role, policy: &AccessPolicy) -> warden::types::Principal {
    warden::types::Principal {
        id: format!("check-{role}"),
        display_name: role.to_string(),
        email: String::new(),
        role,
        department: String::new(),
        capabilities: policy.role_capabilities(role),
        security_level: Default::default(),
        two_factor_enabled: false,
        last_login_at: None,
        last_origin: None,
        avatar_url: None,
    }
}
