use chrono::{TimeZone, Utc};
use nexo_core::{
    clock::ManualClock,
    course_service::{CourseUpdate, NewCourse},
    org_config::Feature,
    platform::{InstallRequest, Installed, Platform},
    rbac::{Principal, ROLE_INSTRUCTOR},
    store::{CourseRow, UserRow},
    types::{Authorship, OrgId},
    user_service::NewUser,
    NexoError,
};
use serde_json::json;
use std::sync::Arc;

// ── Test helpers ────────────────────────────────────────────────────────────

fn build() -> (Platform, Installed) {
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 5, 12, 8, 30, 0).unwrap()));
    let platform = Platform::in_memory(clock, 11).unwrap();
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

fn instructor(platform: &Platform, installed: &Installed, name: &str) -> UserRow {
    let org_id = installed.organization.id;
    let user = member(platform, org_id, name);
    platform
        .rbac()
        .change_role(admin(installed), org_id, user.id, ROLE_INSTRUCTOR)
        .unwrap();
    user
}

fn course(platform: &Platform, principal: Principal, org_id: OrgId, name: &str, public: bool) -> CourseRow {
    platform
        .courses()
        .create_course(
            principal,
            org_id,
            &NewCourse {
                name: name.into(),
                description: format!("About {name}"),
                public,
                published: true,
            },
        )
        .unwrap()
}

// ── Tests ────────────────────────────────────────────────────────────────────

/// The creator is recorded as CREATOR and the course counts toward usage.
#[test]
fn create_course_records_creator() {
    let (platform, installed) = build();
    let org_id = installed.organization.id;
    let tina = instructor(&platform, &installed, "tina");

    let created = course(&platform, Principal::User(tina.id), org_id, "Rust 101", false);

    assert!(created.course_uuid.starts_with("course_"));
    assert_eq!(
        platform.rbac().authorship(&created.course_uuid, tina.id).unwrap(),
        Some(Authorship::Creator)
    );
    assert_eq!(platform.store().events_of_type("course_created").unwrap().len(), 1);
}

/// Learners have no create right on courses.
#[test]
fn learner_cannot_create_course() {
    let (platform, installed) = build();
    let org_id = installed.organization.id;
    let learner = member(&platform, org_id, "lea");

    let err = platform
        .courses()
        .create_course(
            Principal::User(learner.id),
            org_id,
            &NewCourse { name: "Mine".into(), ..NewCourse::default() },
        )
        .unwrap_err();
    assert!(matches!(err, NexoError::Forbidden(_)), "got {err:?}");
}

/// With a courses limit of one, the second create is refused.
#[test]
fn course_limit_is_enforced() {
    let (platform, installed) = build();
    let org_id = installed.organization.id;
    let orgs = platform.orgs();
    let mut config = orgs.config(org_id).unwrap();
    config.features.courses.limit = 1;
    orgs.update_config(admin(&installed), org_id, config).unwrap();

    course(&platform, admin(&installed), org_id, "One", true);
    assert_eq!(platform.usage().usage(Feature::Courses, org_id).unwrap(), 1);

    let err = platform
        .courses()
        .create_course(
            admin(&installed),
            org_id,
            &NewCourse { name: "Two".into(), ..NewCourse::default() },
        )
        .unwrap_err();
    assert!(matches!(err, NexoError::LimitReached { .. }), "got {err:?}");
}

/// Anonymous visitors only see public courses.
#[test]
fn anonymous_list_shows_public_courses_only() {
    let (platform, installed) = build();
    let org_id = installed.organization.id;
    course(&platform, admin(&installed), org_id, "Open", true);
    course(&platform, admin(&installed), org_id, "Closed", false);

    let visible = platform.courses().list_courses(Principal::Anonymous, org_id).unwrap();
    let names: Vec<_> = visible.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["Open"]);

    let all = platform.courses().list_courses(admin(&installed), org_id).unwrap();
    assert_eq!(all.len(), 2);
}

/// Instructors may edit their own courses but not someone else's.
#[test]
fn instructor_updates_only_own_course() {
    let (platform, installed) = build();
    let org_id = installed.organization.id;
    let tina = instructor(&platform, &installed, "tina");
    let theo = instructor(&platform, &installed, "theo");
    let own = course(&platform, Principal::User(tina.id), org_id, "Tina's", false);

    let updated = platform
        .courses()
        .update_course(
            Principal::User(tina.id),
            &own.course_uuid,
            &CourseUpdate { name: Some("Tina's course".into()), public: Some(true), ..CourseUpdate::default() },
        )
        .unwrap();
    assert_eq!(updated.name, "Tina's course");
    assert!(updated.public);
    assert_eq!(updated.description, own.description);

    let err = platform
        .courses()
        .update_course(
            Principal::User(theo.id),
            &own.course_uuid,
            &CourseUpdate { name: Some("Stolen".into()), ..CourseUpdate::default() },
        )
        .unwrap_err();
    assert!(matches!(err, NexoError::Forbidden(_)), "got {err:?}");
}

/// Contributors may edit a course; reporters may not.
#[test]
fn contributor_can_update_reporter_cannot() {
    let (platform, installed) = build();
    let org_id = installed.organization.id;
    let hana = member(&platform, org_id, "hana");
    let rolf = member(&platform, org_id, "rolf");
    let created = course(&platform, admin(&installed), org_id, "Shared", false);
    let courses = platform.courses();
    courses
        .set_author(admin(&installed), &created.course_uuid, hana.id, Authorship::Contributor)
        .unwrap();
    courses
        .set_author(admin(&installed), &created.course_uuid, rolf.id, Authorship::Reporter)
        .unwrap();

    let updated = courses
        .update_course(
            Principal::User(hana.id),
            &created.course_uuid,
            &CourseUpdate { description: Some("Better".into()), ..CourseUpdate::default() },
        )
        .unwrap();
    assert_eq!(updated.description, "Better");

    let err = courses
        .update_course(
            Principal::User(rolf.id),
            &created.course_uuid,
            &CourseUpdate { description: Some("Worse".into()), ..CourseUpdate::default() },
        )
        .unwrap_err();
    assert!(matches!(err, NexoError::Forbidden(_)), "got {err:?}");
    assert!(courses.get_course(Principal::User(rolf.id), &created.course_uuid).is_ok());
}

/// Chapters append in order and can be reordered; a partial order is refused.
#[test]
fn chapters_append_and_reorder() {
    let (platform, installed) = build();
    let org_id = installed.organization.id;
    let courses = platform.courses();
    let created = course(&platform, admin(&installed), org_id, "Ordered", true);

    let a = courses.add_chapter(admin(&installed), &created.course_uuid, "A", "").unwrap();
    let b = courses.add_chapter(admin(&installed), &created.course_uuid, "B", "").unwrap();
    let c = courses.add_chapter(admin(&installed), &created.course_uuid, "C", "").unwrap();
    assert_eq!((a.position, b.position, c.position), (1, 2, 3));

    let reordered = courses
        .reorder_chapters(
            admin(&installed),
            &created.course_uuid,
            &[c.chapter_uuid.clone(), a.chapter_uuid.clone(), b.chapter_uuid.clone()],
        )
        .unwrap();
    let names: Vec<_> = reordered.iter().map(|ch| ch.name.as_str()).collect();
    assert_eq!(names, vec!["C", "A", "B"]);

    let err = courses
        .reorder_chapters(admin(&installed), &created.course_uuid, &[a.chapter_uuid.clone()])
        .unwrap_err();
    assert!(matches!(err, NexoError::Validation(_)), "got {err:?}");
}

/// Activities live under chapters and follow the course's access rules.
#[test]
fn activities_crud() {
    let (platform, installed) = build();
    let org_id = installed.organization.id;
    let courses = platform.courses();
    let created = course(&platform, admin(&installed), org_id, "Hands-on", true);
    let chapter = courses
        .add_chapter(admin(&installed), &created.course_uuid, "Basics", "First steps")
        .unwrap();

    let activity = courses
        .add_activity(admin(&installed), &chapter.chapter_uuid, "Intro video", "video", &json!({ "url": "v.mp4" }))
        .unwrap();
    assert!(activity.activity_uuid.starts_with("activity_"));
    assert_eq!(activity.position, 1);

    let updated = courses
        .update_activity(admin(&installed), &activity.activity_uuid, "Intro", &json!({ "url": "v2.mp4" }))
        .unwrap();
    assert_eq!(updated.name, "Intro");
    assert_eq!(updated.content["url"], "v2.mp4");

    // Public course: anyone may read, nobody anonymous may write.
    let listed = courses.list_activities(Principal::Anonymous, &chapter.chapter_uuid).unwrap();
    assert_eq!(listed.len(), 1);
    let err = courses
        .delete_activity(Principal::Anonymous, &activity.activity_uuid)
        .unwrap_err();
    assert!(matches!(err, NexoError::Unauthorized), "got {err:?}");

    courses.delete_activity(admin(&installed), &activity.activity_uuid).unwrap();
    assert!(courses.list_activities(admin(&installed), &chapter.chapter_uuid).unwrap().is_empty());
}

/// Deleting a course takes its chapters and authorship with it and releases
/// the usage slot.
#[test]
fn delete_course_cascades() {
    let (platform, installed) = build();
    let org_id = installed.organization.id;
    let orgs = platform.orgs();
    let mut config = orgs.config(org_id).unwrap();
    config.features.courses.limit = 5;
    orgs.update_config(admin(&installed), org_id, config).unwrap();

    let courses = platform.courses();
    let created = course(&platform, admin(&installed), org_id, "Temporary", false);
    let chapter = courses.add_chapter(admin(&installed), &created.course_uuid, "Only", "").unwrap();
    assert_eq!(platform.usage().usage(Feature::Courses, org_id).unwrap(), 1);

    courses.delete_course(admin(&installed), &created.course_uuid).unwrap();

    assert!(platform.store().course_by_uuid(&created.course_uuid).unwrap().is_none());
    assert!(platform.store().chapter_by_uuid(&chapter.chapter_uuid).unwrap().is_none());
    assert!(platform.store().authors_of(&created.course_uuid).unwrap().is_empty());
    assert_eq!(platform.usage().usage(Feature::Courses, org_id).unwrap(), 0);

    let err = courses.get_course(admin(&installed), &created.course_uuid).unwrap_err();
    assert!(matches!(err, NexoError::NotFound { .. }), "got {err:?}");
}
