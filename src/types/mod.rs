//! Core identity types shared by every kernel component.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::kernel::permissions::CapabilitySet;

/// Stable identifier of a directory account and the principal built from it.
pub type PrincipalId = String;

/// Fixed role enumeration of the HR portal.
///
/// Roles carry no capabilities by themselves; the access policy's role
/// catalog maps each role to its capability set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Operates the platform itself. Holds the wildcard but has no employee profile.
    SystemAdmin,
    /// Head of HR.
    HrDirector,
    /// HR staff managing records, leave and documents.
    HrManager,
    /// Line manager of a department.
    DepartmentManager,
    /// Runs recruitment pipelines.
    Recruiter,
    /// Runs payroll.
    PayrollOfficer,
    /// Regular employee.
    Employee,
}

impl Role {
    /// Every role, in declaration order.
    pub const ALL: [Role; 7] = [
        Role::SystemAdmin,
        Role::HrDirector,
        Role::HrManager,
        Role::DepartmentManager,
        Role::Recruiter,
        Role::PayrollOfficer,
        Role::Employee,
    ];

    /// Canonical snake_case name, matching the serde representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SystemAdmin => "system_admin",
            Self::HrDirector => "hr_director",
            Self::HrManager => "hr_manager",
            Self::DepartmentManager => "department_manager",
            Self::Recruiter => "recruiter",
            Self::PayrollOfficer => "payroll_officer",
            Self::Employee => "employee",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a role name does not match any [`Role`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown role: {0}")]
pub struct UnknownRole(pub String);

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase().replace('-', "_");
        Role::ALL
            .into_iter()
            .find(|role| role.as_str() == needle)
            .ok_or_else(|| UnknownRole(s.to_owned()))
    }
}

/// Security classification of a principal, ordered lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityLevel {
    /// Ordinary staff access.
    Standard,
    /// Access to personal data of other employees.
    Elevated,
    /// Access to payroll or other regulated data.
    Restricted,
    /// Platform-wide administrative access.
    Critical,
}

impl Default for SecurityLevel {
    fn default() -> Self {
        Self::Standard
    }
}

/// An authenticated identity.
///
/// Built by the authenticator on successful login and read-only afterwards,
/// except for the two-factor flag and display hints such as the avatar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// Directory account identifier.
    pub id: PrincipalId,
    /// Human-readable name.
    pub display_name: String,
    /// Login email address.
    pub email: String,
    /// Role designation.
    pub role: Role,
    /// Department label (display only).
    pub department: String,
    /// Resolved capabilities: role catalog plus per-account grants.
    pub capabilities: CapabilitySet,
    /// Security classification.
    pub security_level: SecurityLevel,
    /// Whether a confirmed second factor is enrolled.
    pub two_factor_enabled: bool,
    /// When this principal last logged in.
    #[serde(default)]
    pub last_login_at: Option<DateTime<Utc>>,
    /// Network origin of the last login.
    #[serde(default)]
    pub last_origin: Option<String>,
    /// Avatar URL (display only).
    #[serde(default)]
    pub avatar_url: Option<String>,
}

impl Principal {
    /// Whether this principal holds the wildcard capability.
    pub fn is_superuser(&self) -> bool {
        self.capabilities.is_superuser()
    }
}
