use chrono::{Duration, TimeZone, Utc};
use nexo_core::{
    audit_service::MemoryAuditQueue,
    clock::ManualClock,
    config::PlatformConfig,
    course_service::NewCourse,
    org_config::{Feature, SignupMode},
    password_reset_service::{Mailer, RESET_CODE_LENGTH},
    platform::{InstallRequest, Installed, Platform},
    rbac::Principal,
    rng::CodeRng,
    store::Store,
    user_service::NewUser,
    NexoError, NexoResult,
};
use std::sync::{Arc, Mutex};

// ── Test helpers ────────────────────────────────────────────────────────────

#[derive(Default)]
struct RecordingMailer {
    sent: Mutex<Vec<(String, String, String)>>,
}

impl RecordingMailer {
    fn last_code(&self) -> String {
        let sent = self.sent.lock().unwrap();
        let (_, _, body) = sent.last().expect("no mail sent");
        let start = body.find("code is ").expect("no code in body") + "code is ".len();
        body[start..start + RESET_CODE_LENGTH].to_string()
    }

    fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

impl Mailer for RecordingMailer {
    fn send(&self, to: &str, subject: &str, body: &str) -> NexoResult<()> {
        self.sent
            .lock()
            .unwrap()
            .push((to.to_string(), subject.to_string(), body.to_string()));
        Ok(())
    }
}

fn build_with(config: PlatformConfig) -> (Platform, Arc<ManualClock>, Arc<RecordingMailer>, Installed) {
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 6, 3, 7, 45, 0).unwrap()));
    let mailer = Arc::new(RecordingMailer::default());
    let platform = Platform::with_parts(
        Store::in_memory().unwrap(),
        clock.clone(),
        CodeRng::seeded(13),
        config,
        Arc::new(MemoryAuditQueue::new()),
        mailer.clone(),
    )
    .unwrap();
    let installed = platform
        .install(&InstallRequest::short(None, "install-pass-1".into()))
        .unwrap();
    (platform, clock, mailer, installed)
}

fn build() -> (Platform, Arc<ManualClock>, Arc<RecordingMailer>, Installed) {
    build_with(PlatformConfig::default_test())
}

fn new_user(name: &str) -> NewUser {
    NewUser {
        username: name.into(),
        email: format!("{name}@school.dev"),
        password: "member-pass-1".into(),
        first_name: String::new(),
        last_name: String::new(),
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

/// The short install creates the default org and an admin who can log in.
#[test]
fn install_creates_admin_and_default_org() {
    let (platform, _, _, installed) = build();

    assert_eq!(installed.organization.slug, "defaultorg");
    assert_eq!(installed.organization.name, "Default Organization");
    assert_eq!(installed.admin.username, "admin");
    assert_eq!(installed.admin.email, "admin@school.dev");

    let logged_in = platform.users().authenticate("ADMIN@school.dev", "install-pass-1").unwrap();
    assert_eq!(logged_in.id, installed.admin.id);
    assert!(platform
        .rbac()
        .can_access_dashboard(Principal::User(logged_in.id), installed.organization.id)
        .unwrap());
}

/// A second install hits the slug.
#[test]
fn install_twice_conflicts() {
    let (platform, _, _, _) = build();
    let err = platform
        .install(&InstallRequest::short(Some("other@school.dev".into()), "install-pass-2".into()))
        .unwrap_err();
    assert!(matches!(err, NexoError::Conflict(_)), "got {err:?}");
}

#[test]
fn wrong_password_is_unauthorized() {
    let (platform, _, _, _) = build();
    let users = platform.users();
    assert!(matches!(users.authenticate("admin@school.dev", "nope-nope-nope"), Err(NexoError::Unauthorized)));
    assert!(matches!(users.authenticate("ghost@school.dev", "install-pass-1"), Err(NexoError::Unauthorized)));
}

/// Usernames and emails are unique; emails compare case-insensitively.
#[test]
fn signup_rejects_duplicates_and_bad_input() {
    let (platform, _, _, installed) = build();
    let org_id = installed.organization.id;
    let users = platform.users();
    users.signup(org_id, &new_user("lea"), None).unwrap();

    let same_name = NewUser { email: "other@school.dev".into(), ..new_user("lea") };
    assert!(matches!(users.signup(org_id, &same_name, None), Err(NexoError::Conflict(_))));

    let same_email = NewUser { email: "LEA@school.dev".into(), ..new_user("lea2") };
    assert!(matches!(users.signup(org_id, &same_email, None), Err(NexoError::Conflict(_))));

    let short_password = NewUser { password: "short".into(), ..new_user("max") };
    assert!(matches!(users.signup(org_id, &short_password, None), Err(NexoError::Validation(_))));

    let bad_email = NewUser { email: "max.school.dev".into(), ..new_user("max") };
    assert!(matches!(users.signup(org_id, &bad_email, None), Err(NexoError::Validation(_))));
}

/// Invite-only organizations refuse open signup.
#[test]
fn invite_only_blocks_signup() {
    let (platform, _, _, installed) = build();
    let org_id = installed.organization.id;
    let orgs = platform.orgs();
    let mut config = orgs.config(org_id).unwrap();
    config.features.members.signup_mode = SignupMode::InviteOnly;
    orgs.update_config(Principal::User(installed.admin.id), org_id, config).unwrap();

    let err = platform.users().signup(org_id, &new_user("lea"), None).unwrap_err();
    assert!(matches!(err, NexoError::Forbidden(_)), "got {err:?}");
}

/// Members count against the limit once one is set.
#[test]
fn members_limit_is_enforced() {
    let (platform, _, _, installed) = build();
    let org_id = installed.organization.id;
    let orgs = platform.orgs();
    let mut config = orgs.config(org_id).unwrap();
    config.features.members.limit = 2;
    orgs.update_config(Principal::User(installed.admin.id), org_id, config).unwrap();

    let users = platform.users();
    users.signup(org_id, &new_user("a1"), None).unwrap();
    users.signup(org_id, &new_user("a2"), None).unwrap();
    assert_eq!(platform.usage().usage(Feature::Members, org_id).unwrap(), 2);

    let err = users.signup(org_id, &new_user("a3"), None).unwrap_err();
    assert!(matches!(err, NexoError::LimitReached { .. }), "got {err:?}");
}

#[test]
fn signup_into_missing_org_is_not_found() {
    let (platform, _, _, _) = build();
    let err = platform.users().signup(999, &new_user("lea"), None).unwrap_err();
    assert!(matches!(err, NexoError::NotFound { .. }), "got {err:?}");
}

/// Invite-only organizations admit holders of a live invite code.
#[test]
fn invite_code_admits_signup_until_it_expires() {
    let (platform, clock, _, installed) = build();
    let org_id = installed.organization.id;
    let admin = Principal::User(installed.admin.id);
    let orgs = platform.orgs();
    let mut config = orgs.config(org_id).unwrap();
    config.features.members.signup_mode = SignupMode::InviteOnly;
    config.features.members.limit = 10;
    orgs.update_config(admin, org_id, config).unwrap();
    let invite = orgs.create_invite_code(admin, org_id).unwrap();

    let users = platform.users();
    let err = users.signup_with_invite(org_id, &new_user("lea"), "not-a-code", None).unwrap_err();
    assert!(matches!(err, NexoError::BadRequest(_)), "got {err:?}");

    let lea = users.signup_with_invite(org_id, &new_user("lea"), &invite.code, None).unwrap();
    assert!(platform.store().membership(lea.id, org_id).unwrap().is_some());
    assert_eq!(platform.usage().usage(Feature::Members, org_id).unwrap(), 1);

    clock.advance(Duration::days(31));
    let err = users.signup_with_invite(org_id, &new_user("max"), &invite.code, None).unwrap_err();
    assert!(matches!(err, NexoError::BadRequest(_)), "got {err:?}");
}

/// Open organizations do not take the invite path.
#[test]
fn invite_signup_into_open_org_is_forbidden() {
    let (platform, _, _, installed) = build();
    let org_id = installed.organization.id;
    let invite = platform.orgs().create_invite_code(Principal::User(installed.admin.id), org_id).unwrap();
    let err = platform
        .users()
        .signup_with_invite(org_id, &new_user("lea"), &invite.code, None)
        .unwrap_err();
    assert!(matches!(err, NexoError::Forbidden(_)), "got {err:?}");
}

/// Changing a password needs the current one.
#[test]
fn password_change_checks_old_password() {
    let (platform, _, _, installed) = build();
    let users = platform.users();
    let lea = users.signup(installed.organization.id, &new_user("lea"), None).unwrap();
    let me = Principal::User(lea.id);

    let err = users.update_password(me, lea.id, "not-my-pass", "fresh-pass-22").unwrap_err();
    assert!(matches!(err, NexoError::Unauthorized), "got {err:?}");
    let err = users.update_password(me, lea.id, "member-pass-1", "short").unwrap_err();
    assert!(matches!(err, NexoError::Validation(_)), "got {err:?}");

    users.update_password(me, lea.id, "member-pass-1", "fresh-pass-22").unwrap();
    assert!(users.authenticate("lea@school.dev", "member-pass-1").is_err());
    assert_eq!(users.authenticate("lea@school.dev", "fresh-pass-22").unwrap().id, lea.id);
    assert_eq!(platform.store().events_of_type("password_updated").unwrap().len(), 1);

    let max = users.signup(installed.organization.id, &new_user("max"), None).unwrap();
    let err = users
        .update_password(Principal::User(max.id), lea.id, "fresh-pass-22", "other-pass-33")
        .unwrap_err();
    assert!(matches!(err, NexoError::Forbidden(_)), "got {err:?}");
}

/// Deleting a user frees the seat; the last admin stays.
#[test]
fn delete_user_frees_member_seat() {
    let (platform, _, _, installed) = build();
    let org_id = installed.organization.id;
    let admin = Principal::User(installed.admin.id);
    let orgs = platform.orgs();
    let mut config = orgs.config(org_id).unwrap();
    config.features.members.limit = 10;
    orgs.update_config(admin, org_id, config).unwrap();
    let users = platform.users();
    let lea = users.signup(org_id, &new_user("lea"), None).unwrap();
    assert_eq!(platform.usage().usage(Feature::Members, org_id).unwrap(), 1);

    let err = users.delete_user(Principal::User(lea.id), lea.id).unwrap_err();
    assert!(matches!(err, NexoError::Forbidden(_)), "got {err:?}");

    users.delete_user(admin, lea.id).unwrap();
    assert!(matches!(users.get(lea.id), Err(NexoError::NotFound { .. })));
    assert!(platform.store().membership(lea.id, org_id).unwrap().is_none());
    assert_eq!(platform.usage().usage(Feature::Members, org_id).unwrap(), 0);
    assert_eq!(platform.store().events_of_type("user_deleted").unwrap().len(), 1);

    let err = users.delete_user(Principal::SiteAdmin, installed.admin.id).unwrap_err();
    assert!(matches!(err, NexoError::Conflict(_)), "got {err:?}");
}

/// A user's courses are filtered by what the caller may read, then paged.
#[test]
fn user_courses_respect_visibility_and_paging() {
    let (platform, _, _, installed) = build();
    let org_id = installed.organization.id;
    let admin = Principal::User(installed.admin.id);
    let courses = platform.courses();
    let open = courses
        .create_course(admin, org_id, &NewCourse { name: "Open".into(), public: true, published: true, ..Default::default() })
        .unwrap();
    let hidden = courses
        .create_course(admin, org_id, &NewCourse { name: "Hidden".into(), ..Default::default() })
        .unwrap();

    let users = platform.users();
    let own = users.user_courses(admin, installed.admin.id, 1, 10).unwrap();
    assert_eq!(own.iter().map(|c| c.id).collect::<Vec<_>>(), vec![hidden.id, open.id]);

    let public = users.user_courses(Principal::Anonymous, installed.admin.id, 1, 10).unwrap();
    assert_eq!(public.iter().map(|c| c.id).collect::<Vec<_>>(), vec![open.id]);

    let second_page = users.user_courses(admin, installed.admin.id, 2, 1).unwrap();
    assert_eq!(second_page.iter().map(|c| c.id).collect::<Vec<_>>(), vec![open.id]);

    assert!(matches!(users.user_courses(admin, installed.admin.id, 0, 10), Err(NexoError::Validation(_))));
    assert!(matches!(users.user_courses(admin, installed.admin.id, 1, 0), Err(NexoError::Validation(_))));
}

// ── Password reset ──────────────────────────────────────────────────────────

/// The emailed code changes the password once.
#[test]
fn reset_code_changes_password_once() {
    let (platform, _, mailer, installed) = build();
    let org_id = installed.organization.id;
    let reset = platform.password_reset();

    reset.send_reset_code(org_id, "admin@school.dev").unwrap();
    assert_eq!(mailer.count(), 1);
    let code = mailer.last_code();
    assert_eq!(code.len(), RESET_CODE_LENGTH);

    reset
        .change_password_with_reset_code(org_id, "admin@school.dev", &code, "brand-new-pass")
        .unwrap();
    platform.users().authenticate("admin@school.dev", "brand-new-pass").unwrap();
    assert!(platform.users().authenticate("admin@school.dev", "install-pass-1").is_err());

    let reused = reset
        .change_password_with_reset_code(org_id, "admin@school.dev", &code, "another-pass-1")
        .unwrap_err();
    assert!(matches!(reused, NexoError::BadRequest(_)), "got {reused:?}");
    assert_eq!(platform.store().events_of_type("password_changed").unwrap().len(), 1);
}

/// Codes stop working after an hour.
#[test]
fn expired_reset_code_is_rejected() {
    let (platform, clock, mailer, installed) = build();
    let org_id = installed.organization.id;
    let reset = platform.password_reset();
    reset.send_reset_code(org_id, "admin@school.dev").unwrap();
    let code = mailer.last_code();

    clock.advance(Duration::minutes(61));
    let err = reset
        .change_password_with_reset_code(org_id, "admin@school.dev", &code, "brand-new-pass")
        .unwrap_err();
    assert!(matches!(err, NexoError::BadRequest(_)), "got {err:?}");
    platform.users().authenticate("admin@school.dev", "install-pass-1").unwrap();
}

/// Only the latest code works; issuing it drops the earlier ones.
#[test]
fn newer_reset_code_supersedes_older() {
    let (platform, clock, mailer, installed) = build();
    let org_id = installed.organization.id;
    let reset = platform.password_reset();

    reset.send_reset_code(org_id, "admin@school.dev").unwrap();
    let first = mailer.last_code();
    clock.advance(Duration::minutes(5));
    reset.send_reset_code(org_id, "admin@school.dev").unwrap();
    let second = mailer.last_code();
    assert_ne!(first, second);
    assert_eq!(platform.store().reset_code_count().unwrap(), 1);

    let err = reset
        .change_password_with_reset_code(org_id, "admin@school.dev", &first, "brand-new-pass")
        .unwrap_err();
    assert!(matches!(err, NexoError::BadRequest(_)), "got {err:?}");
    reset
        .change_password_with_reset_code(org_id, "admin@school.dev", &second, "brand-new-pass")
        .unwrap();
    assert_eq!(platform.store().reset_code_count().unwrap(), 0);
}

/// Unknown addresses get the same answer as known ones, and no mail.
#[test]
fn reset_for_unknown_email_is_silent() {
    let (platform, _, mailer, installed) = build();
    platform
        .password_reset()
        .send_reset_code(installed.organization.id, "ghost@school.dev")
        .unwrap();
    assert_eq!(mailer.count(), 0);

    let err = platform.password_reset().send_reset_code(0, "admin@school.dev").unwrap_err();
    assert!(matches!(err, NexoError::BadRequest(_)), "got {err:?}");
}

/// A weak new password is refused and the code survives.
#[test]
fn reset_validates_new_password() {
    let (platform, _, mailer, installed) = build();
    let org_id = installed.organization.id;
    let reset = platform.password_reset();
    reset.send_reset_code(org_id, "admin@school.dev").unwrap();
    let code = mailer.last_code();

    let err = reset
        .change_password_with_reset_code(org_id, "admin@school.dev", &code, "short")
        .unwrap_err();
    assert!(matches!(err, NexoError::Validation(_)), "got {err:?}");
    reset
        .change_password_with_reset_code(org_id, "admin@school.dev", &code, "long-enough-1")
        .unwrap();
}

// ── Site access ─────────────────────────────────────────────────────────────

/// The access file is bootstrapped from config; the admin password maps to
/// SiteAdmin and the site password to SiteMember.
#[test]
fn site_login_resolves_principals() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = PlatformConfig::default_test();
    config.security.site_access_file = dir.path().join("access/site.json").to_string_lossy().into_owned();
    config.security.site_password = Some("open-sesame".into());
    config.security.admin_password = Some("root-sesame".into());
    let (platform, _, _, _) = build_with(config);

    assert_eq!(platform.site_login("root-sesame").unwrap(), Principal::SiteAdmin);
    assert_eq!(platform.site_login("open-sesame").unwrap(), Principal::SiteMember);
    assert!(matches!(platform.site_login("guess"), Err(NexoError::Unauthorized)));
    assert!(platform.site_access().path().exists());
}

/// Only the site admin may rotate the access passwords.
#[test]
fn site_passwords_rotate_for_admin_only() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = PlatformConfig::default_test();
    config.security.site_access_file = dir.path().join("site.json").to_string_lossy().into_owned();
    config.security.site_password = Some("open-sesame".into());
    config.security.admin_password = Some("root-sesame".into());
    let (platform, _, _, installed) = build_with(config);

    let err = platform
        .update_site_passwords(Principal::User(installed.admin.id), Some("x-new-site"), None)
        .unwrap_err();
    assert!(matches!(err, NexoError::Forbidden(_)), "got {err:?}");

    platform
        .update_site_passwords(Principal::SiteAdmin, Some("new-site-pass"), None)
        .unwrap();
    assert_eq!(platform.site_login("new-site-pass").unwrap(), Principal::SiteMember);
    assert!(platform.site_login("open-sesame").is_err());
    assert_eq!(platform.site_login("root-sesame").unwrap(), Principal::SiteAdmin);
}
