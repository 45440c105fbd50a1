//! Courses, their ordered chapters and activities.

use crate::{
    error::{NexoError, NexoResult},
    event::DomainEvent,
    org_config::Feature,
    rbac::{Action, ElementKind, Principal},
    rbac_service::RbacService,
    service::ServiceContext,
    store::{ActivityRow, ChapterRow, CourseRow},
    types::{AuthorStatus, Authorship, OrgId, UserId},
    usage_service::UsageService,
};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewCourse {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub published: bool,
}

/// Fields left as None keep their value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CourseUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub public: Option<bool>,
    pub published: Option<bool>,
}

pub struct CourseService<'a> {
    cx: ServiceContext<'a>,
}

impl<'a> CourseService<'a> {
    pub fn new(cx: ServiceContext<'a>) -> Self {
        Self { cx }
    }

    fn rbac(&self) -> RbacService<'a> {
        RbacService::new(self.cx)
    }

    fn load_course(&self, course_uuid: &str) -> NexoResult<CourseRow> {
        self.cx
            .store
            .course_by_uuid(course_uuid)?
            .ok_or_else(|| NexoError::not_found("course"))
    }

    fn load_chapter(&self, chapter_uuid: &str) -> NexoResult<(ChapterRow, CourseRow)> {
        let chapter = self
            .cx
            .store
            .chapter_by_uuid(chapter_uuid)?
            .ok_or_else(|| NexoError::not_found("chapter"))?;
        let course = self
            .cx
            .store
            .course(chapter.course_id)?
            .ok_or_else(|| NexoError::not_found("course"))?;
        Ok((chapter, course))
    }

    fn load_activity(&self, activity_uuid: &str) -> NexoResult<(ActivityRow, CourseRow)> {
        let activity = self
            .cx
            .store
            .activity_by_uuid(activity_uuid)?
            .ok_or_else(|| NexoError::not_found("activity"))?;
        let chapter = self
            .cx
            .store
            .chapter(activity.chapter_id)?
            .ok_or_else(|| NexoError::not_found("chapter"))?;
        let course = self
            .cx
            .store
            .course(chapter.course_id)?
            .ok_or_else(|| NexoError::not_found("course"))?;
        Ok((activity, course))
    }

    // ── Course ─────────────────────────────────────────────────

    pub fn create_course(&self, principal: Principal, org_id: OrgId, new: &NewCourse) -> NexoResult<CourseRow> {
        if !self.cx.store.organization_exists(org_id)? {
            return Err(NexoError::not_found("organization"));
        }
        let usage = UsageService::new(self.cx);
        usage.check_limits(Feature::Courses, org_id)?;
        self.rbac()
            .authorize_in_org(principal, org_id, ElementKind::Course, Action::Create)?;
        let name = new.name.trim();
        if name.is_empty() {
            return Err(NexoError::Validation("course name must not be empty".into()));
        }

        let now = self.cx.now();
        let course_uuid = self.cx.prefixed_uuid("course");
        let id = self.cx.store.insert_course(
            &course_uuid,
            org_id,
            name,
            new.description.trim(),
            new.public,
            new.published,
            now,
        )?;
        let creator_id = principal.user_id();
        if let Some(user_id) = creator_id {
            self.cx
                .store
                .upsert_author(&course_uuid, user_id, Authorship::Creator, AuthorStatus::Active, now)?;
        }
        usage.increase(Feature::Courses, org_id)?;
        self.cx.emit(DomainEvent::CourseCreated { org_id, course_uuid, creator_id })?;
        self.cx.store.course(id)?.ok_or_else(|| NexoError::not_found("course"))
    }

    pub fn get_course(&self, principal: Principal, course_uuid: &str) -> NexoResult<CourseRow> {
        let course = self.load_course(course_uuid)?;
        self.rbac().authorize_course(principal, Action::Read, &course)?;
        Ok(course)
    }

    /// Courses of the org the principal may read.
    pub fn list_courses(&self, principal: Principal, org_id: OrgId) -> NexoResult<Vec<CourseRow>> {
        let rbac = self.rbac();
        let mut visible = Vec::new();
        for course in self.cx.store.courses_for_org(org_id)? {
            match rbac.authorize_course(principal, Action::Read, &course) {
                Ok(()) => visible.push(course),
                Err(NexoError::Unauthorized | NexoError::Forbidden(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(visible)
    }

    pub fn update_course(&self, principal: Principal, course_uuid: &str, update: &CourseUpdate) -> NexoResult<CourseRow> {
        let course = self.load_course(course_uuid)?;
        self.rbac().authorize_course(principal, Action::Update, &course)?;
        let name = match &update.name {
            Some(name) if name.trim().is_empty() => {
                return Err(NexoError::Validation("course name must not be empty".into()))
            }
            Some(name) => name.trim().to_string(),
            None => course.name.clone(),
        };
        let updated = CourseRow {
            name,
            description: update
                .description
                .as_deref()
                .map(str::trim)
                .map(str::to_string)
                .unwrap_or_else(|| course.description.clone()),
            public: update.public.unwrap_or(course.public),
            published: update.published.unwrap_or(course.published),
            ..course
        };
        self.cx.store.update_course(&updated, self.cx.now())?;
        self.load_course(course_uuid)
    }

    pub fn delete_course(&self, principal: Principal, course_uuid: &str) -> NexoResult<()> {
        let course = self.load_course(course_uuid)?;
        self.rbac().authorize_course(principal, Action::Delete, &course)?;
        self.cx.store.delete_course(&course)?;
        UsageService::new(self.cx).decrease(Feature::Courses, course.org_id)?;
        self.cx.emit(DomainEvent::CourseDeleted {
            org_id: course.org_id,
            course_uuid: course.course_uuid,
        })?;
        Ok(())
    }

    /// Grant or change a user's authorship on a course.
    pub fn set_author(
        &self,
        principal: Principal,
        course_uuid: &str,
        user_id: UserId,
        authorship: Authorship,
    ) -> NexoResult<()> {
        let course = self.load_course(course_uuid)?;
        self.rbac().authorize_course(principal, Action::Update, &course)?;
        if self.cx.store.membership(user_id, course.org_id)?.is_none() {
            return Err(NexoError::Validation("author must be a member of the organization".into()));
        }
        self.cx.store.upsert_author(
            &course.course_uuid,
            user_id,
            authorship,
            AuthorStatus::Active,
            self.cx.now(),
        )
    }

    // ── Chapters ───────────────────────────────────────────────

    pub fn add_chapter(
        &self,
        principal: Principal,
        course_uuid: &str,
        name: &str,
        description: &str,
    ) -> NexoResult<ChapterRow> {
        let course = self.load_course(course_uuid)?;
        self.rbac()
            .authorize_within_course(principal, ElementKind::Chapter, Action::Create, &course)?;
        let chapter_uuid = self.cx.prefixed_uuid("chapter");
        let id = self.cx.store.insert_chapter(
            &chapter_uuid,
            course.id,
            name.trim(),
            description.trim(),
            self.cx.now(),
        )?;
        self.cx.store.chapter(id)?.ok_or_else(|| NexoError::not_found("chapter"))
    }

    pub fn list_chapters(&self, principal: Principal, course_uuid: &str) -> NexoResult<Vec<ChapterRow>> {
        let course = self.get_course(principal, course_uuid)?;
        self.cx.store.chapters_for_course(course.id)
    }

    pub fn update_chapter(
        &self,
        principal: Principal,
        chapter_uuid: &str,
        name: &str,
        description: &str,
    ) -> NexoResult<ChapterRow> {
        let (chapter, course) = self.load_chapter(chapter_uuid)?;
        self.rbac()
            .authorize_within_course(principal, ElementKind::Chapter, Action::Update, &course)?;
        self.cx
            .store
            .update_chapter(chapter.id, name.trim(), description.trim(), self.cx.now())?;
        self.cx.store.chapter(chapter.id)?.ok_or_else(|| NexoError::not_found("chapter"))
    }

    pub fn delete_chapter(&self, principal: Principal, chapter_uuid: &str) -> NexoResult<()> {
        let (chapter, course) = self.load_chapter(chapter_uuid)?;
        self.rbac()
            .authorize_within_course(principal, ElementKind::Chapter, Action::Delete, &course)?;
        self.cx.store.delete_chapter(chapter.id)
    }

    /// `ordered` must name every chapter of the course exactly once.
    pub fn reorder_chapters(
        &self,
        principal: Principal,
        course_uuid: &str,
        ordered: &[String],
    ) -> NexoResult<Vec<ChapterRow>> {
        let course = self.load_course(course_uuid)?;
        self.rbac().authorize_course(principal, Action::Update, &course)?;
        let chapters = self.cx.store.chapters_for_course(course.id)?;

        let known: HashSet<&str> = chapters.iter().map(|c| c.chapter_uuid.as_str()).collect();
        let requested: HashSet<&str> = ordered.iter().map(String::as_str).collect();
        if ordered.len() != chapters.len() || requested != known {
            return Err(NexoError::Validation(
                "chapter order must list every chapter of the course exactly once".into(),
            ));
        }

        let ordered_ids: Vec<_> = ordered
            .iter()
            .filter_map(|uuid| chapters.iter().find(|c| &c.chapter_uuid == uuid))
            .map(|c| c.id)
            .collect();
        self.cx.store.reorder_chapters(course.id, &ordered_ids)?;
        self.cx.store.chapters_for_course(course.id)
    }

    // ── Activities ─────────────────────────────────────────────

    pub fn add_activity(
        &self,
        principal: Principal,
        chapter_uuid: &str,
        name: &str,
        activity_type: &str,
        content: &Value,
    ) -> NexoResult<ActivityRow> {
        let (chapter, course) = self.load_chapter(chapter_uuid)?;
        self.rbac()
            .authorize_within_course(principal, ElementKind::Activity, Action::Create, &course)?;
        let activity_uuid = self.cx.prefixed_uuid("activity");
        let id = self.cx.store.insert_activity(
            &activity_uuid,
            chapter.id,
            name.trim(),
            activity_type,
            content,
            self.cx.now(),
        )?;
        self.cx
            .store
            .activity_by_uuid(&activity_uuid)?
            .filter(|a| a.id == id)
            .ok_or_else(|| NexoError::not_found("activity"))
    }

    pub fn list_activities(&self, principal: Principal, chapter_uuid: &str) -> NexoResult<Vec<ActivityRow>> {
        let (chapter, course) = self.load_chapter(chapter_uuid)?;
        self.rbac()
            .authorize_within_course(principal, ElementKind::Activity, Action::Read, &course)?;
        self.cx.store.activities_for_chapter(chapter.id)
    }

    pub fn update_activity(
        &self,
        principal: Principal,
        activity_uuid: &str,
        name: &str,
        content: &Value,
    ) -> NexoResult<ActivityRow> {
        let (activity, course) = self.load_activity(activity_uuid)?;
        self.rbac()
            .authorize_within_course(principal, ElementKind::Activity, Action::Update, &course)?;
        self.cx
            .store
            .update_activity(activity.id, name.trim(), content, self.cx.now())?;
        self.cx
            .store
            .activity_by_uuid(activity_uuid)?
            .ok_or_else(|| NexoError::not_found("activity"))
    }

    pub fn delete_activity(&self, principal: Principal, activity_uuid: &str) -> NexoResult<()> {
        let (activity, course) = self.load_activity(activity_uuid)?;
        self.rbac()
            .authorize_within_course(principal, ElementKind::Activity, Action::Delete, &course)?;
        self.cx.store.delete_activity(activity.id)
    }
}
