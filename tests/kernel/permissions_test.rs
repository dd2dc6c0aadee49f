//! Permission evaluator and access policy validation.

use warden::kernel::permissions::{
    has_permission, AccessPolicy, AccessPolicyError, CapabilitySet,
};
use warden::types::{Principal, Role, SecurityLevel};

fn principal_with(role: Role, capabilities: CapabilitySet) -> Principal {
    Principal {
        id: format!("p-{role}"),
        display_name: role.to_string(),
        email: format!("{role}@x.com"),
        role,
        department: "Testing".to_owned(),
        capabilities,
        security_level: SecurityLevel::Standard,
        two_factor_enabled: false,
        last_login_at: None,
        last_origin: None,
        avatar_url: None,
    }
}

fn principal(role: Role, policy: &AccessPolicy) -> Principal {
    principal_with(role, policy.role_capabilities(role))
}

fn parse(toml_str: &str) -> Result<AccessPolicy, AccessPolicyError> {
    AccessPolicy::from_toml(toml_str)
}

#[test]
fn wildcard_satisfies_every_capability() {
    let admin = principal_with(Role::SystemAdmin, CapabilitySet::superuser());
    for capability in [
        "employees.view",
        "payroll.manage",
        "does.not.exist",
        "x",
        "*",
        "",
    ] {
        assert!(has_permission(&admin, capability), "{capability}");
    }
}

#[test]
fn grants_match_exactly() {
    let hr = principal_with(
        Role::HrManager,
        CapabilitySet::from_names(["employees.view", "leave.approve"]),
    );
    assert!(has_permission(&hr, "employees.view"));
    assert!(!has_permission(&hr, "employees"));
    assert!(!has_permission(&hr, "employees.view.all"));
    assert!(!has_permission(&hr, "*"));
}

#[test]
fn wildcard_is_a_flag_not_a_grant() {
    let set = CapabilitySet::from_names(["*", "team.manage"]);
    assert!(set.is_superuser());
    assert!(!set.contains("*"));
    assert_eq!(set.grants().collect::<Vec<_>>(), vec!["team.manage"]);

    let json = serde_json::to_value(&set).unwrap_or_default();
    assert_eq!(json, serde_json::json!(["*", "team.manage"]));
}

#[test]
fn profile_denied_only_to_system_admin() {
    let policy = AccessPolicy::default();
    for role in Role::ALL {
        let allowed = policy.can_access(&principal(role, &policy), "/profile");
        assert_eq!(allowed, role != Role::SystemAdmin, "{role}");
    }
    // Capabilities do not matter for the profile route.
    let bare_admin = principal_with(Role::SystemAdmin, CapabilitySet::new());
    assert!(!policy.can_access(&bare_admin, "/profile"));
    let bare_employee = principal_with(Role::Employee, CapabilitySet::superuser());
    assert!(policy.can_access(&bare_employee, "/profile"));
}

#[test]
fn open_routes_need_nothing() {
    let policy = AccessPolicy::default();
    let nobody = principal_with(Role::Employee, CapabilitySet::new());
    assert!(policy.can_access(&nobody, "/"));
    assert!(policy.can_access(&nobody, "/communications"));
    assert!(policy.can_access(&nobody, "/communications/"));
    assert!(!policy.can_access(&nobody, "/employees"));
}

#[test]
fn table_routes_use_any_of() {
    let policy = AccessPolicy::default();
    let viewer = principal_with(Role::Employee, CapabilitySet::from_names(["payroll.view"]));
    let manager = principal_with(Role::Employee, CapabilitySet::from_names(["payroll.manage"]));
    let neither = principal_with(Role::Employee, CapabilitySet::from_names(["leave.view"]));
    assert!(policy.can_access(&viewer, "/payroll"));
    assert!(policy.can_access(&manager, "/payroll"));
    assert!(!policy.can_access(&neither, "/payroll"));
}

#[test]
fn built_in_role_matrix() {
    let policy = AccessPolicy::default();
    let cases = [
        (Role::Recruiter, "/recruitment", true),
        (Role::Recruiter, "/payroll", false),
        (Role::PayrollOfficer, "/payroll", true),
        (Role::PayrollOfficer, "/team", false),
        (Role::DepartmentManager, "/team", true),
        (Role::Employee, "/leave", true),
        (Role::Employee, "/employees", false),
        (Role::HrDirector, "/audit", true),
        (Role::HrManager, "/settings", false),
        (Role::SystemAdmin, "/settings", true),
        (Role::SystemAdmin, "/security", true),
    ];
    for (role, route, expected) in cases {
        assert_eq!(
            policy.can_access(&principal(role, &policy), route),
            expected,
            "{role} -> {route}"
        );
    }
}

#[test]
fn unlisted_routes_only_for_superusers() {
    let policy = AccessPolicy::default();
    assert!(policy.can_access(&principal(Role::SystemAdmin, &policy), "/labs"));
    assert!(!policy.can_access(&principal(Role::HrDirector, &policy), "/labs"));
}

#[test]
fn resolve_merges_extra_grants() {
    let policy = AccessPolicy::default();
    let set = policy.resolve_capabilities(Role::Employee, &["reports.view".to_owned()]);
    assert!(set.satisfies("reports.view"));
    assert!(set.satisfies("leave.view"));
    assert!(!set.is_superuser());
}

#[test]
fn parses_a_policy_document() {
    let policy = match parse(
        r#"
version = 1
open_routes = ["/"]
profile_route = "/me"
profile_denied_roles = ["system_admin", "recruiter"]

[routes]
"/reports/" = ["reports.view"]

[roles]
system_admin = ["*"]
Recruiter = ["reports.view"]
"#,
    ) {
        Ok(policy) => policy,
        Err(err) => panic!("policy should parse: {err}"),
    };

    assert_eq!(
        policy.required_capabilities("/reports"),
        Some(&["reports.view".to_owned()][..])
    );
    let recruiter = principal(Role::Recruiter, &policy);
    assert!(policy.can_access(&recruiter, "/reports"));
    assert!(!policy.can_access(&recruiter, "/me"));
    assert!(!policy.can_access(&recruiter, "/communications"));
    assert!(principal(Role::SystemAdmin, &policy).is_superuser());
    // Roles absent from the catalog get nothing.
    assert!(policy.role_capabilities(Role::Employee).is_empty());
}

#[test]
fn rejects_invalid_documents() {
    let cases = [
        ("version = 2", "version"),
        ("version = 1\n[routes]\n\"payroll\" = [\"payroll.view\"]", "route"),
        ("version = 1\n[routes]\n\"/payroll\" = []", "empty"),
        ("version = 1\n[routes]\n\"/payroll\" = [\"*\"]", "wildcard route"),
        ("version = 1\n[routes]\n\"/payroll\" = [\"Payroll View\"]", "bad name"),
        ("version = 1\n[routes]\n\"/\" = [\"x.view\"]", "conflict"),
        (
            "version = 1\n[routes]\n\"/a\" = [\"x.view\"]\n\"/a/\" = [\"y.view\"]",
            "duplicate",
        ),
        ("version = 1\n[roles]\nwizard = [\"x.view\"]", "unknown role"),
        ("version = 1\n[roles]\nemployee = [\"Not Valid\"]", "bad role grant"),
        ("version = \"one\"", "parse"),
    ];
    for (doc, label) in cases {
        assert!(parse(doc).is_err(), "{label} should be rejected");
    }
}

#[test]
fn version_error_names_both_versions() {
    match parse("version = 7") {
        Err(AccessPolicyError::UnsupportedVersion { found, expected }) => {
            assert_eq!((found, expected), (7, 1));
        }
        other => panic!("expected version error, got {other:?}"),
    }
}

#[test]
fn built_in_policy_is_valid() {
    assert!(AccessPolicy::default().validate().is_ok());
}

#[test]
fn loads_from_file() {
    let dir = match tempfile::tempdir() {
        Ok(dir) => dir,
        Err(err) => panic!("tempdir should be created: {err}"),
    };
    let path = dir.path().join("access.toml");
    let written = std::fs::write(
        &path,
        "version = 1\n[routes]\n\"/labs\" = [\"labs.view\"]\n[roles]\nemployee = [\"labs.view\"]\n",
    );
    assert!(written.is_ok());

    let policy = match AccessPolicy::load(&path) {
        Ok(policy) => policy,
        Err(err) => panic!("policy should load: {err}"),
    };
    assert!(policy.can_access(&principal(Role::Employee, &policy), "/labs"));

    let missing = AccessPolicy::load(&dir.path().join("missing.toml"));
    assert!(matches!(missing, Err(AccessPolicyError::Read { .. })));
}
