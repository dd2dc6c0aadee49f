//! Permission evaluator: capability sets, the access policy, and route checks.
//!
//! The wildcard is modelled as a distinguished superuser flag on
//! [`CapabilitySet`]. The literal `"*"` is only understood at the
//! serialisation boundary (policy files, session snapshots), so a real
//! capability can never collide with it.
//!
//! The [`AccessPolicy`] is versioned configuration: the route table and the
//! role catalog are loaded once at start, validated, and never mutated.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::{Principal, Role, UnknownRole};

/// Serialised form of the superuser flag.
pub const WILDCARD: &str = "*";

/// Access policy format version understood by this build.
pub const SUPPORTED_POLICY_VERSION: u32 = 1;

/// Capability names: dot-separated lowercase segments (e.g. `team.manage`).
const CAPABILITY_PATTERN: &str = r"^[a-z][a-z0-9_]*(\.[a-z][a-z0-9_]*)*$";

static CAPABILITY_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(CAPABILITY_PATTERN).ok());

/// Whether `name` is a well-formed capability name.
pub fn is_valid_capability(name: &str) -> bool {
    CAPABILITY_RE
        .as_ref()
        .is_some_and(|re| re.is_match(name))
}

// ---------------------------------------------------------------------------
// Capability sets
// ---------------------------------------------------------------------------

/// Resolved capabilities of a principal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct CapabilitySet {
    superuser: bool,
    grants: BTreeSet<String>,
}

impl CapabilitySet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// The wildcard set: satisfies every capability and route check.
    pub fn superuser() -> Self {
        Self {
            superuser: true,
            grants: BTreeSet::new(),
        }
    }

    /// Build from capability names. `"*"` turns on the superuser flag.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = Self::new();
        for name in names {
            set.insert(name);
        }
        set
    }

    /// Add a single capability name.
    pub fn insert(&mut self, name: impl Into<String>) {
        let name = name.into();
        if name == WILDCARD {
            self.superuser = true;
        } else {
            self.grants.insert(name);
        }
    }

    /// Merge another set into this one.
    pub fn extend(&mut self, other: &CapabilitySet) {
        self.superuser |= other.superuser;
        self.grants.extend(other.grants.iter().cloned());
    }

    /// Whether this set carries the wildcard.
    pub fn is_superuser(&self) -> bool {
        self.superuser
    }

    /// Exact-match membership, ignoring the wildcard.
    pub fn contains(&self, capability: &str) -> bool {
        self.grants.contains(capability)
    }

    /// True iff the wildcard is held or `capability` is granted exactly.
    /// No prefix or hierarchy matching.
    pub fn satisfies(&self, capability: &str) -> bool {
        self.superuser || self.grants.contains(capability)
    }

    /// Explicit grants, sorted.
    pub fn grants(&self) -> impl Iterator<Item = &str> {
        self.grants.iter().map(String::as_str)
    }

    /// Whether neither the wildcard nor any grant is present.
    pub fn is_empty(&self) -> bool {
        !self.superuser && self.grants.is_empty()
    }
}

impl From<Vec<String>> for CapabilitySet {
    fn from(names: Vec<String>) -> Self {
        Self::from_names(names)
    }
}

impl From<CapabilitySet> for Vec<String> {
    fn from(set: CapabilitySet) -> Self {
        let mut out = Vec::with_capacity(set.grants.len().saturating_add(1));
        if set.superuser {
            out.push(WILDCARD.to_owned());
        }
        out.extend(set.grants);
        out
    }
}

/// Whether `principal` holds `capability` (or the wildcard).
pub fn has_permission(principal: &Principal, capability: &str) -> bool {
    principal.capabilities.satisfies(capability)
}

// ---------------------------------------------------------------------------
// Access policy
// ---------------------------------------------------------------------------

/// Errors raised while loading or validating an access policy.
#[derive(Debug, thiserror::Error)]
pub enum AccessPolicyError {
    /// The policy file could not be read.
    #[error("failed to read access policy {path}: {source}")]
    Read {
        /// Offending path.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The policy file is not valid TOML for this schema.
    #[error("failed to parse access policy: {0}")]
    Parse(#[from] toml::de::Error),

    /// The `version` field names a format this build does not understand.
    #[error("unsupported access policy version {found} (expected {expected})")]
    UnsupportedVersion {
        /// Version found in the file.
        found: u32,
        /// Version this build supports.
        expected: u32,
    },

    /// A route path does not start with `/`.
    #[error("route {0:?} must start with '/'")]
    InvalidRoute(String),

    /// A route maps to no capabilities and could never be reached.
    #[error("route {0} has an empty capability list")]
    EmptyRoute(String),

    /// A capability name is malformed (including a stray wildcard).
    #[error("invalid capability {capability:?} in {context}")]
    InvalidCapability {
        /// Where the capability appeared.
        context: String,
        /// The malformed name.
        capability: String,
    },

    /// A route is listed as open or as the profile route and also in the table.
    #[error("route {0} is both unconditional and capability-gated")]
    ConflictingRoute(String),

    /// Two table entries normalise to the same route.
    #[error("duplicate route {0}")]
    DuplicateRoute(String),

    /// The role catalog names a role that does not exist.
    #[error("role catalog: {0}")]
    UnknownRole(#[from] UnknownRole),
}

/// Route table plus role catalog, loaded once at process start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessPolicy {
    /// Format version; must equal [`SUPPORTED_POLICY_VERSION`].
    pub version: u32,
    /// Routes open to every authenticated principal.
    #[serde(default = "default_open_routes")]
    pub open_routes: Vec<String>,
    /// The personal profile route.
    #[serde(default = "default_profile_route")]
    pub profile_route: String,
    /// Roles refused the profile route regardless of capabilities.
    #[serde(default = "default_profile_denied_roles")]
    pub profile_denied_roles: Vec<Role>,
    /// Route -> capabilities, any one of which grants access.
    #[serde(default)]
    pub routes: BTreeMap<String, Vec<String>>,
    /// Role name -> capabilities granted to every account of that role.
    #[serde(default)]
    pub roles: BTreeMap<String, Vec<String>>,
}

fn default_open_routes() -> Vec<String> {
    vec!["/".to_owned(), "/communications".to_owned()]
}

fn default_profile_route() -> String {
    "/profile".to_owned()
}

fn default_profile_denied_roles() -> Vec<Role> {
    vec![Role::SystemAdmin]
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| (*s).to_owned()).collect()
}

impl Default for AccessPolicy {
    /// Built-in policy for the HR portal.
    fn default() -> Self {
        let routes = BTreeMap::from([
            ("/employees".to_owned(), names(&["employees.view", "employees.manage"])),
            ("/payroll".to_owned(), names(&["payroll.view", "payroll.manage"])),
            ("/recruitment".to_owned(), names(&["recruitment.view", "recruitment.manage"])),
            ("/leave".to_owned(), names(&["leave.view", "leave.approve"])),
            ("/documents".to_owned(), names(&["documents.view", "documents.manage"])),
            ("/engagement".to_owned(), names(&["engagement.view", "engagement.manage"])),
            ("/team".to_owned(), names(&["team.manage"])),
            ("/reports".to_owned(), names(&["reports.view"])),
            ("/settings".to_owned(), names(&["settings.manage"])),
            ("/audit".to_owned(), names(&["audit.view"])),
            ("/security".to_owned(), names(&["security.manage"])),
            ("/admin".to_owned(), names(&["users.manage"])),
        ]);

        let roles = BTreeMap::from([
            (Role::SystemAdmin.to_string(), names(&[WILDCARD])),
            (
                Role::HrDirector.to_string(),
                names(&[
                    "employees.view",
                    "employees.manage",
                    "payroll.view",
                    "recruitment.view",
                    "recruitment.manage",
                    "leave.view",
                    "leave.approve",
                    "documents.view",
                    "documents.manage",
                    "engagement.view",
                    "engagement.manage",
                    "team.manage",
                    "reports.view",
                    "audit.view",
                ]),
            ),
            (
                Role::HrManager.to_string(),
                names(&[
                    "employees.view",
                    "employees.manage",
                    "leave.view",
                    "leave.approve",
                    "documents.view",
                    "documents.manage",
                    "engagement.view",
                    "reports.view",
                ]),
            ),
            (
                Role::DepartmentManager.to_string(),
                names(&[
                    "employees.view",
                    "leave.view",
                    "leave.approve",
                    "documents.view",
                    "engagement.view",
                    "team.manage",
                ]),
            ),
            (
                Role::Recruiter.to_string(),
                names(&["recruitment.view", "recruitment.manage", "documents.view"]),
            ),
            (
                Role::PayrollOfficer.to_string(),
                names(&["payroll.view", "payroll.manage", "employees.view", "reports.view"]),
            ),
            (
                Role::Employee.to_string(),
                names(&["leave.view", "documents.view", "engagement.view"]),
            ),
        ]);

        Self {
            version: SUPPORTED_POLICY_VERSION,
            open_routes: default_open_routes(),
            profile_route: default_profile_route(),
            profile_denied_roles: default_profile_denied_roles(),
            routes,
            roles,
        }
    }
}

impl AccessPolicy {
    /// Read, parse and validate a policy file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or fails validation.
    pub fn load(path: &Path) -> Result<Self, AccessPolicyError> {
        let contents = std::fs::read_to_string(path).map_err(|source| AccessPolicyError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let policy = Self::from_toml(&contents)?;
        info!(
            path = %path.display(),
            version = policy.version,
            routes = policy.routes.len(),
            "access policy loaded"
        );
        Ok(policy)
    }

    /// Parse and validate a policy from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed or fails validation.
    pub fn from_toml(toml_str: &str) -> Result<Self, AccessPolicyError> {
        let mut policy: AccessPolicy = toml::from_str(toml_str)?;
        policy.validate()?;
        policy.normalise();
        Ok(policy)
    }

    /// Check structural invariants.
    ///
    /// # Errors
    ///
    /// Returns the first violation found.
    pub fn validate(&self) -> Result<(), AccessPolicyError> {
        if self.version != SUPPORTED_POLICY_VERSION {
            return Err(AccessPolicyError::UnsupportedVersion {
                found: self.version,
                expected: SUPPORTED_POLICY_VERSION,
            });
        }

        let mut unconditional = BTreeSet::new();
        for route in self.open_routes.iter().chain(std::iter::once(&self.profile_route)) {
            if !route.starts_with('/') {
                return Err(AccessPolicyError::InvalidRoute(route.clone()));
            }
            unconditional.insert(normalise_route(route).to_owned());
        }

        let mut seen = BTreeSet::new();
        for (route, capabilities) in &self.routes {
            if !route.starts_with('/') {
                return Err(AccessPolicyError::InvalidRoute(route.clone()));
            }
            let normalised = normalise_route(route).to_owned();
            if unconditional.contains(&normalised) {
                return Err(AccessPolicyError::ConflictingRoute(route.clone()));
            }
            if !seen.insert(normalised) {
                return Err(AccessPolicyError::DuplicateRoute(route.clone()));
            }
            if capabilities.is_empty() {
                return Err(AccessPolicyError::EmptyRoute(route.clone()));
            }
            for capability in capabilities {
                if !is_valid_capability(capability) {
                    return Err(AccessPolicyError::InvalidCapability {
                        context: format!("route {route}"),
                        capability: capability.clone(),
                    });
                }
            }
        }

        for (role, capabilities) in &self.roles {
            role.parse::<Role>()?;
            for capability in capabilities {
                if capability != WILDCARD && !is_valid_capability(capability) {
                    return Err(AccessPolicyError::InvalidCapability {
                        context: format!("role {role}"),
                        capability: capability.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Canonicalise route and role keys so lookups are exact.
    fn normalise(&mut self) {
        let routes = std::mem::take(&mut self.routes);
        self.routes = routes
            .into_iter()
            .map(|(route, caps)| (normalise_route(&route).to_owned(), caps))
            .collect();
        let roles = std::mem::take(&mut self.roles);
        self.roles = roles
            .into_iter()
            .map(|(name, caps)| match name.parse::<Role>() {
                Ok(role) => (role.to_string(), caps),
                Err(_) => (name, caps),
            })
            .collect();
        self.profile_route = normalise_route(&self.profile_route).to_owned();
        for route in &mut self.open_routes {
            *route = normalise_route(route).to_owned();
        }
    }

    /// Capabilities granted to `role` by the catalog. Unknown roles get none.
    pub fn role_capabilities(&self, role: Role) -> CapabilitySet {
        self.roles
            .get(role.as_str())
            .map(|names| CapabilitySet::from_names(names.iter().cloned()))
            .unwrap_or_default()
    }

    /// Role catalog merged with per-account grants.
    pub fn resolve_capabilities(&self, role: Role, extra: &[String]) -> CapabilitySet {
        let mut set = self.role_capabilities(role);
        set.extend(&CapabilitySet::from_names(extra.iter().cloned()));
        set
    }

    /// Capabilities required for `route`, if it is in the table.
    pub fn required_capabilities(&self, route: &str) -> Option<&[String]> {
        self.routes.get(normalise_route(route)).map(Vec::as_slice)
    }

    /// Whether `principal` may open `route`.
    ///
    /// 1. Open routes are always accessible.
    /// 2. The profile route is refused to `profile_denied_roles`, even superusers.
    /// 3. Table routes need any one of their capabilities.
    /// 4. Unlisted routes are refused unless the principal is a superuser.
    pub fn can_access(&self, principal: &Principal, route: &str) -> bool {
        let route = normalise_route(route);
        if self.open_routes.iter().any(|open| open == route) {
            return true;
        }
        if route == self.profile_route {
            return !self.profile_denied_roles.contains(&principal.role);
        }
        match self.required_capabilities(route) {
            Some(required) => required.iter().any(|cap| has_permission(principal, cap)),
            None => principal.is_superuser(),
        }
    }
}

/// Drop a trailing `/` except on the root route.
fn normalise_route(route: &str) -> &str {
    let trimmed = route.trim_end_matches('/');
    if trimmed.is_empty() {
        "/"
    } else {
        trimmed
    }
}
