//! Shared fixtures for kernel tests.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use warden::config::WardenConfig;
use warden::kernel::accounts::{
    demo_accounts, Account, AccountProfile, InMemoryAccountRepository,
};
use warden::kernel::clock::ManualClock;
use warden::kernel::session::SessionToken;
use warden::kernel::{AccessKernel, KernelDeps, LoginResponse};
use warden::types::{Role, SecurityLevel};

pub const ADMIN_EMAIL: &str = "admin@warden.local";
pub const ADMIN_PASSWORD: &str = "AdminPass123!";
pub const HR_EMAIL: &str = "hr@warden.local";
pub const HR_PASSWORD: &str = "HrPass123!";
pub const EMPLOYEE_EMAIL: &str = "employee@warden.local";
pub const EMPLOYEE_PASSWORD: &str = "EmployeePass123!";

pub fn epoch() -> DateTime<Utc> {
    match Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).single() {
        Some(at) => at,
        None => panic!("fixed test instant should be valid"),
    }
}

pub fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(epoch()))
}

pub fn account(id: &str, email: &str, password: &str, role: Role) -> Account {
    Account::new(
        id,
        email,
        password,
        AccountProfile {
            display_name: format!("Test {id}"),
            role,
            department: "Testing".to_owned(),
            security_level: SecurityLevel::Standard,
            extra_capabilities: Vec::new(),
            avatar_url: None,
        },
    )
}

pub fn demo_repository() -> Arc<InMemoryAccountRepository> {
    Arc::new(InMemoryAccountRepository::with_accounts(demo_accounts()))
}

pub fn kernel_with(
    config: WardenConfig,
    repository: Arc<InMemoryAccountRepository>,
    clock: Arc<ManualClock>,
) -> AccessKernel {
    let deps = KernelDeps::new(config, repository).with_clock(clock);
    match AccessKernel::new(deps) {
        Ok(kernel) => kernel,
        Err(err) => panic!("kernel should build: {err}"),
    }
}

pub fn demo_kernel(clock: Arc<ManualClock>) -> AccessKernel {
    kernel_with(WardenConfig::default(), demo_repository(), clock)
}

pub fn token_of(response: &LoginResponse) -> SessionToken {
    match &response.token {
        Some(token) => token.clone(),
        None => panic!("login should have issued a token: {response:?}"),
    }
}

pub async fn login_as(kernel: &AccessKernel, email: &str, password: &str) -> SessionToken {
    let response = kernel
        .login(warden::kernel::auth::LoginRequest::new(email, password))
        .await;
    assert!(response.success, "login as {email} failed: {response:?}");
    token_of(&response)
}
