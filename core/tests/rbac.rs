use chrono::{TimeZone, Utc};
use nexo_core::{
    clock::ManualClock,
    course_service::NewCourse,
    org_config::Feature,
    platform::{InstallRequest, Installed, Platform},
    rbac::{Action, Principal, Rights, ROLE_ADMIN, ROLE_MAINTAINER, ROLE_USER},
    store::UserRow,
    types::{OrgId, RoleType},
    user_service::NewUser,
    NexoError,
};
use std::sync::Arc;

// ── Test helpers ────────────────────────────────────────────────────────────

fn build() -> (Platform, Installed) {
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 1, 6, 12, 0, 0).unwrap()));
    let platform = Platform::in_memory(clock, 3).unwrap();
    let installed = platform
        .install(&InstallRequest::short(None, "install-pass-1".into()))
        .unwrap();
    (platform, installed)
}

fn admin(installed: &Installed) -> Principal {
    Principal::User(installed.admin.id)
}

fn member(platform: &Platform, org_id: OrgId, name: &str) -> UserRow {
    platform
        .users()
        .signup(
            org_id,
            &NewUser {
                username: name.into(),
                email: format!("{name}@school.dev"),
                password: "member-pass-1".into(),
                ..NewUser::default()
            },
            None,
        )
        .unwrap()
}

fn private_course_uuid(platform: &Platform, installed: &Installed) -> String {
    platform
        .courses()
        .create_course(
            admin(installed),
            installed.organization.id,
            &NewCourse { name: "Private".into(), ..NewCourse::default() },
        )
        .unwrap()
        .course_uuid
}

// ── Tests ────────────────────────────────────────────────────────────────────

/// The four global roles keep their fixed ids, and installing twice is fine.
#[test]
fn default_roles_are_idempotent() {
    let (platform, _) = build();
    platform.rbac().install_default_roles().unwrap();

    let roles = platform.store().global_roles().unwrap();
    let ids: Vec<_> = roles.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![1, 2, 3, 4]);
    assert!(roles.iter().all(|r| r.role_type == RoleType::Global));
    assert_eq!(roles[0].rights, Rights::admin());
}

/// The site admin passes every check, even on private elements.
#[test]
fn site_admin_bypasses_everything() {
    let (platform, installed) = build();
    let uuid = private_course_uuid(&platform, &installed);

    for action in [Action::Create, Action::Read, Action::Update, Action::Delete] {
        platform.rbac().authorize(Principal::SiteAdmin, action, &uuid).unwrap();
    }
}

/// Anonymous callers are told to authenticate; site members are refused.
#[test]
fn unauthenticated_principals_on_private_course() {
    let (platform, installed) = build();
    let uuid = private_course_uuid(&platform, &installed);
    let rbac = platform.rbac();

    let anon = rbac.authorize(Principal::Anonymous, Action::Read, &uuid).unwrap_err();
    assert!(matches!(anon, NexoError::Unauthorized), "got {anon:?}");

    let site = rbac.authorize(Principal::SiteMember, Action::Read, &uuid).unwrap_err();
    assert!(matches!(site, NexoError::Forbidden(_)), "got {site:?}");
}

/// Organizations are readable by anyone; only admins may update them.
#[test]
fn organization_read_is_public_update_needs_rights() {
    let (platform, installed) = build();
    let org = &installed.organization;
    let learner = member(&platform, org.id, "lea");
    let rbac = platform.rbac();

    rbac.authorize(Principal::Anonymous, Action::Read, &org.org_uuid).unwrap();
    rbac.authorize(admin(&installed), Action::Update, &org.org_uuid).unwrap();
    let err = rbac
        .authorize(Principal::User(learner.id), Action::Update, &org.org_uuid)
        .unwrap_err();
    assert!(matches!(err, NexoError::Forbidden(_)), "got {err:?}");
}

/// Users may read and update their own record but not delete it.
#[test]
fn users_manage_their_own_record() {
    let (platform, installed) = build();
    let lea = member(&platform, installed.organization.id, "lea");
    let max = member(&platform, installed.organization.id, "max");
    let rbac = platform.rbac();
    let me = Principal::User(lea.id);

    rbac.authorize(me, Action::Read, &lea.user_uuid).unwrap();
    rbac.authorize(me, Action::Update, &lea.user_uuid).unwrap();
    assert!(rbac.authorize(me, Action::Delete, &lea.user_uuid).is_err());
    assert!(rbac.authorize(me, Action::Update, &max.user_uuid).is_err());
    rbac.authorize(admin(&installed), Action::Delete, &max.user_uuid).unwrap();
}

#[test]
fn unknown_uuid_prefix_is_rejected() {
    let (platform, installed) = build();
    let err = platform
        .rbac()
        .authorize(admin(&installed), Action::Read, "widget_123")
        .unwrap_err();
    assert!(matches!(err, NexoError::Validation(_)), "got {err:?}");
}

#[test]
fn dashboard_access_follows_role() {
    let (platform, installed) = build();
    let org_id = installed.organization.id;
    let lea = member(&platform, org_id, "lea");
    let rbac = platform.rbac();

    assert!(rbac.can_access_dashboard(admin(&installed), org_id).unwrap());
    assert!(!rbac.can_access_dashboard(Principal::User(lea.id), org_id).unwrap());
    assert!(rbac.can_access_dashboard(Principal::SiteAdmin, org_id).unwrap());
    assert!(!rbac.can_access_dashboard(Principal::Anonymous, org_id).unwrap());
}

/// A custom role grants exactly what its rights document says.
#[test]
fn custom_org_role_grants_its_rights() {
    let (platform, installed) = build();
    let org_id = installed.organization.id;
    let lea = member(&platform, org_id, "lea");
    let rbac = platform.rbac();

    let mut rights = Rights::learner();
    rights.courses.action_create = true;
    let role = rbac
        .create_org_role(admin(&installed), org_id, "Course author", "Can create courses", rights)
        .unwrap();
    assert_eq!(role.role_type, RoleType::Organization);
    assert_eq!(role.org_id, Some(org_id));

    rbac.change_role(admin(&installed), org_id, lea.id, role.id).unwrap();
    platform
        .courses()
        .create_course(
            Principal::User(lea.id),
            org_id,
            &NewCourse { name: "Lea's".into(), ..NewCourse::default() },
        )
        .unwrap();

    // Still assigned: cannot be deleted.
    let err = rbac.delete_org_role(admin(&installed), role.id).unwrap_err();
    assert!(matches!(err, NexoError::Conflict(_)), "got {err:?}");

    rbac.change_role(admin(&installed), org_id, lea.id, ROLE_USER).unwrap();
    rbac.delete_org_role(admin(&installed), role.id).unwrap();
    assert!(platform.store().role(role.id).unwrap().is_none());
}

#[test]
fn global_roles_cannot_be_edited() {
    let (platform, installed) = build();
    let err = platform
        .rbac()
        .update_org_role(admin(&installed), ROLE_MAINTAINER, "Renamed", "", Rights::admin())
        .unwrap_err();
    assert!(matches!(err, NexoError::Forbidden(_)), "got {err:?}");
}

/// The last admin can be neither demoted nor removed.
#[test]
fn last_admin_is_protected() {
    let (platform, installed) = build();
    let org_id = installed.organization.id;
    let rbac = platform.rbac();
    let admin_id = installed.admin.id;

    let demote = rbac
        .change_role(admin(&installed), org_id, admin_id, ROLE_USER)
        .unwrap_err();
    assert!(matches!(demote, NexoError::Conflict(_)), "got {demote:?}");

    let remove = rbac.remove_member(admin(&installed), org_id, admin_id).unwrap_err();
    assert!(matches!(remove, NexoError::Conflict(_)), "got {remove:?}");

    // With a second admin the first may step down.
    let second = member(&platform, org_id, "sam");
    rbac.change_role(admin(&installed), org_id, second.id, ROLE_ADMIN).unwrap();
    rbac.change_role(admin(&installed), org_id, admin_id, ROLE_USER).unwrap();
    assert_eq!(
        platform.store().membership(admin_id, org_id).unwrap().unwrap().role_id,
        ROLE_USER
    );
}

/// Learners cannot manage memberships.
#[test]
fn learners_cannot_change_roles() {
    let (platform, installed) = build();
    let org_id = installed.organization.id;
    let lea = member(&platform, org_id, "lea");
    let max = member(&platform, org_id, "max");

    let err = platform
        .rbac()
        .change_role(Principal::User(lea.id), org_id, max.id, ROLE_ADMIN)
        .unwrap_err();
    assert!(matches!(err, NexoError::Forbidden(_)), "got {err:?}");
}

/// Members seats are taken by signups and admin adds, and freed on removal.
#[test]
fn membership_changes_track_member_seats() {
    let (platform, installed) = build();
    let org_id = installed.organization.id;
    let orgs = platform.orgs();
    let mut config = orgs.config(org_id).unwrap();
    config.features.members.limit = 2;
    orgs.update_config(admin(&installed), org_id, config).unwrap();
    let rbac = platform.rbac();
    let usage = platform.usage();

    member(&platform, org_id, "a1");
    let a2 = member(&platform, org_id, "a2");
    assert_eq!(usage.usage(Feature::Members, org_id).unwrap(), 2);

    rbac.remove_member(admin(&installed), org_id, a2.id).unwrap();
    assert_eq!(usage.usage(Feature::Members, org_id).unwrap(), 1);
    let a3 = member(&platform, org_id, "a3");
    assert_eq!(usage.usage(Feature::Members, org_id).unwrap(), 2);

    let full = rbac.add_member(admin(&installed), org_id, a2.id, ROLE_USER).unwrap_err();
    assert!(matches!(full, NexoError::LimitReached { .. }), "got {full:?}");
    assert!(platform.store().membership(a2.id, org_id).unwrap().is_none());

    rbac.remove_member(admin(&installed), org_id, a3.id).unwrap();
    rbac.add_member(admin(&installed), org_id, a2.id, ROLE_USER).unwrap();
    assert_eq!(usage.usage(Feature::Members, org_id).unwrap(), 2);
}
