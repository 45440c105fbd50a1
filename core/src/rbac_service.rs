//! Authorization against stored elements, roles and memberships.
//!
//! Gathers the AccessFacts for one (principal, element) pair and hands them
//! to `rbac::decide`. Role and membership management live here as well since
//! both are guarded by the same checks.

use crate::{
    error::{NexoError, NexoResult},
    event::DomainEvent,
    org_config::Feature,
    rbac::{self, AccessFacts, Action, ElementKind, Principal, Rights, ROLE_ADMIN},
    service::ServiceContext,
    store::{CourseRow, MembershipRow, RoleRow},
    types::{AuthorStatus, Authorship, OrgId, RoleType, RowId, UserId},
    usage_service::UsageService,
};

pub struct RbacService<'a> {
    cx: ServiceContext<'a>,
}

impl<'a> RbacService<'a> {
    pub fn new(cx: ServiceContext<'a>) -> Self {
        Self { cx }
    }

    // ── Decisions ──────────────────────────────────────────────

    /// Authorize `action` on the element named by `element_uuid`.
    pub fn authorize(&self, principal: Principal, action: Action, element_uuid: &str) -> NexoResult<()> {
        let kind = ElementKind::from_uuid(element_uuid)?;
        let facts = self.facts_for_element(principal, kind, element_uuid)?;
        let outcome = rbac::decide(principal, kind, action, &facts);
        if let Err(e) = &outcome {
            log::debug!("denied {action} on {element_uuid} for {principal:?}: {e}");
        }
        outcome
    }

    /// Authorize an org-level action with no element yet (creating a course,
    /// updating org settings).
    pub fn authorize_in_org(
        &self,
        principal: Principal,
        org_id: OrgId,
        kind: ElementKind,
        action: Action,
    ) -> NexoResult<()> {
        let facts = AccessFacts {
            role_rights: self.role_rights(principal, org_id)?,
            ..AccessFacts::default()
        };
        rbac::decide(principal, kind, action, &facts)
    }

    /// Course check with the row already loaded.
    pub fn authorize_course(&self, principal: Principal, action: Action, course: &CourseRow) -> NexoResult<()> {
        self.authorize_within_course(principal, ElementKind::Course, action, course)
    }

    /// Check on a course's chapters or activities, including ones not created
    /// yet.
    pub fn authorize_within_course(
        &self,
        principal: Principal,
        kind: ElementKind,
        action: Action,
        course: &CourseRow,
    ) -> NexoResult<()> {
        let facts = self.course_facts(principal, course)?;
        rbac::decide(principal, kind, action, &facts)
    }

    pub fn can_access_dashboard(&self, principal: Principal, org_id: OrgId) -> NexoResult<bool> {
        Ok(match principal {
            Principal::SiteAdmin => true,
            Principal::User(_) => self
                .role_rights(principal, org_id)?
                .iter()
                .any(|rights| rights.dashboard.action_access),
            Principal::Anonymous | Principal::SiteMember => false,
        })
    }

    /// Active authorship of `user_id` on a course.
    pub fn authorship(&self, course_uuid: &str, user_id: UserId) -> NexoResult<Option<Authorship>> {
        Ok(self
            .cx
            .store
            .author(course_uuid, user_id)?
            .filter(|a| a.status == AuthorStatus::Active)
            .map(|a| a.authorship))
    }

    fn role_rights(&self, principal: Principal, org_id: OrgId) -> NexoResult<Vec<Rights>> {
        match principal.user_id() {
            Some(user_id) => self.cx.store.rights_in_org(user_id, org_id),
            None => Ok(Vec::new()),
        }
    }

    fn course_facts(&self, principal: Principal, course: &CourseRow) -> NexoResult<AccessFacts> {
        let authorship = match principal.user_id() {
            Some(user_id) => self.authorship(&course.course_uuid, user_id)?,
            None => None,
        };
        Ok(AccessFacts {
            is_public: course.public,
            is_self: false,
            authorship,
            role_rights: self.role_rights(principal, course.org_id)?,
        })
    }

    fn facts_for_element(
        &self,
        principal: Principal,
        kind: ElementKind,
        element_uuid: &str,
    ) -> NexoResult<AccessFacts> {
        let store = self.cx.store;
        match kind {
            ElementKind::Course => {
                let course = store
                    .course_by_uuid(element_uuid)?
                    .ok_or_else(|| NexoError::not_found("course"))?;
                self.course_facts(principal, &course)
            }
            ElementKind::Chapter => {
                let chapter = store
                    .chapter_by_uuid(element_uuid)?
                    .ok_or_else(|| NexoError::not_found("chapter"))?;
                let course = store
                    .course(chapter.course_id)?
                    .ok_or_else(|| NexoError::not_found("course"))?;
                self.course_facts(principal, &course)
            }
            ElementKind::Activity => {
                let activity = store
                    .activity_by_uuid(element_uuid)?
                    .ok_or_else(|| NexoError::not_found("activity"))?;
                let chapter = store
                    .chapter(activity.chapter_id)?
                    .ok_or_else(|| NexoError::not_found("chapter"))?;
                let course = store
                    .course(chapter.course_id)?
                    .ok_or_else(|| NexoError::not_found("course"))?;
                self.course_facts(principal, &course)
            }
            ElementKind::Organization => {
                let org = store
                    .organization_by_uuid(element_uuid)?
                    .ok_or_else(|| NexoError::not_found("organization"))?;
                Ok(AccessFacts {
                    is_public: true,
                    role_rights: self.role_rights(principal, org.id)?,
                    ..AccessFacts::default()
                })
            }
            ElementKind::User => {
                let target = store
                    .user_by_uuid(element_uuid)?
                    .ok_or_else(|| NexoError::not_found("user"))?;
                let mut role_rights = Vec::new();
                if let Some(caller) = principal.user_id() {
                    // Rights count in any organization both users belong to.
                    for membership in store.memberships_of_user(target.id)? {
                        role_rights.extend(store.rights_in_org(caller, membership.org_id)?);
                    }
                }
                Ok(AccessFacts {
                    is_self: principal.user_id() == Some(target.id),
                    role_rights,
                    ..AccessFacts::default()
                })
            }
            ElementKind::Role => {
                let role = store
                    .role_by_uuid(element_uuid)?
                    .ok_or_else(|| NexoError::not_found("role"))?;
                let role_rights = match role.org_id {
                    Some(org_id) => self.role_rights(principal, org_id)?,
                    None => Vec::new(),
                };
                Ok(AccessFacts {
                    is_public: role.role_type == RoleType::Global,
                    role_rights,
                    ..AccessFacts::default()
                })
            }
            ElementKind::Collection | ElementKind::UserGroup => {
                Err(NexoError::not_found("element"))
            }
        }
    }

    // ── Roles ──────────────────────────────────────────────────

    pub fn install_default_roles(&self) -> NexoResult<()> {
        let now = self.cx.now();
        for role in rbac::default_roles() {
            self.cx.store.upsert_global_role(&role, now)?;
        }
        Ok(())
    }

    pub fn create_org_role(
        &self,
        principal: Principal,
        org_id: OrgId,
        name: &str,
        description: &str,
        rights: Rights,
    ) -> NexoResult<RoleRow> {
        if !self.cx.store.organization_exists(org_id)? {
            return Err(NexoError::not_found("organization"));
        }
        self.authorize_in_org(principal, org_id, ElementKind::Role, Action::Create)?;
        let name = name.trim();
        if name.is_empty() {
            return Err(NexoError::Validation("role name must not be empty".into()));
        }
        let role_uuid = self.cx.prefixed_uuid("role");
        let id = self
            .cx
            .store
            .insert_org_role(org_id, &role_uuid, name, description.trim(), &rights, self.cx.now())?;
        self.cx.store.role(id)?.ok_or_else(|| NexoError::not_found("role"))
    }

    pub fn update_org_role(
        &self,
        principal: Principal,
        role_id: RowId,
        name: &str,
        description: &str,
        rights: Rights,
    ) -> NexoResult<RoleRow> {
        let role = self.editable_role(role_id)?;
        self.authorize(principal, Action::Update, &role.role_uuid)?;
        self.cx
            .store
            .update_role(role.id, name.trim(), description.trim(), &rights, self.cx.now())?;
        self.cx.store.role(role.id)?.ok_or_else(|| NexoError::not_found("role"))
    }

    pub fn delete_org_role(&self, principal: Principal, role_id: RowId) -> NexoResult<()> {
        let role = self.editable_role(role_id)?;
        self.authorize(principal, Action::Delete, &role.role_uuid)?;
        if self.cx.store.role_in_use(role.id)? {
            return Err(NexoError::Conflict(format!("role '{}' is still assigned", role.name)));
        }
        self.cx.store.delete_role(role.id)
    }

    pub fn roles_for_org(&self, org_id: OrgId) -> NexoResult<Vec<RoleRow>> {
        self.cx.store.roles_for_org(org_id)
    }

    fn editable_role(&self, role_id: RowId) -> NexoResult<RoleRow> {
        let role = self.cx.store.role(role_id)?.ok_or_else(|| NexoError::not_found("role"))?;
        if role.role_type == RoleType::Global {
            return Err(NexoError::Forbidden("global roles cannot be modified".into()));
        }
        Ok(role)
    }

    /// The role must be global or belong to the organization.
    fn assignable_role(&self, org_id: OrgId, role_id: RowId) -> NexoResult<RoleRow> {
        let role = self.cx.store.role(role_id)?.ok_or_else(|| NexoError::not_found("role"))?;
        match role.org_id {
            Some(owner) if owner != org_id => {
                Err(NexoError::Validation("role belongs to another organization".into()))
            }
            _ => Ok(role),
        }
    }

    // ── Membership ─────────────────────────────────────────────

    pub fn add_member(
        &self,
        principal: Principal,
        org_id: OrgId,
        user_id: UserId,
        role_id: RowId,
    ) -> NexoResult<MembershipRow> {
        if !self.cx.store.organization_exists(org_id)? {
            return Err(NexoError::not_found("organization"));
        }
        self.authorize_in_org(principal, org_id, ElementKind::User, Action::Create)?;
        self.cx.store.user(user_id)?.ok_or_else(|| NexoError::not_found("user"))?;
        self.assignable_role(org_id, role_id)?;
        if self.cx.store.membership(user_id, org_id)?.is_some() {
            return Err(NexoError::Conflict("user is already a member".into()));
        }
        let usage = UsageService::new(self.cx);
        usage.check_limits(Feature::Members, org_id)?;
        self.cx.store.insert_membership(user_id, org_id, role_id, self.cx.now())?;
        usage.increase(Feature::Members, org_id)?;
        self.cx.emit(DomainEvent::MemberRoleChanged { org_id, user_id, role_id })?;
        Ok(MembershipRow { user_id, org_id, role_id })
    }

    pub fn change_role(
        &self,
        principal: Principal,
        org_id: OrgId,
        user_id: UserId,
        role_id: RowId,
    ) -> NexoResult<MembershipRow> {
        self.authorize_in_org(principal, org_id, ElementKind::User, Action::Update)?;
        let current = self.member(org_id, user_id)?;
        self.assignable_role(org_id, role_id)?;
        if current.role_id == role_id {
            return Ok(current);
        }
        self.ensure_not_last_admin(&current)?;
        self.cx
            .store
            .update_membership_role(user_id, org_id, role_id, self.cx.now())?;
        self.cx.emit(DomainEvent::MemberRoleChanged { org_id, user_id, role_id })?;
        Ok(MembershipRow { role_id, ..current })
    }

    pub fn remove_member(&self, principal: Principal, org_id: OrgId, user_id: UserId) -> NexoResult<()> {
        self.authorize_in_org(principal, org_id, ElementKind::User, Action::Delete)?;
        let current = self.member(org_id, user_id)?;
        self.ensure_not_last_admin(&current)?;
        self.cx.store.delete_membership(user_id, org_id)?;
        UsageService::new(self.cx).decrease(Feature::Members, org_id)?;
        log::info!("user {user_id} removed from org {org_id}");
        Ok(())
    }

    fn member(&self, org_id: OrgId, user_id: UserId) -> NexoResult<MembershipRow> {
        self.cx
            .store
            .membership(user_id, org_id)?
            .ok_or_else(|| NexoError::not_found("membership"))
    }

    fn ensure_not_last_admin(&self, membership: &MembershipRow) -> NexoResult<()> {
        if membership.role_id == ROLE_ADMIN
            && self.cx.store.count_members_with_role(membership.org_id, ROLE_ADMIN)? <= 1
        {
            return Err(NexoError::Conflict(
                "an organization must keep at least one admin".into(),
            ));
        }
        Ok(())
    }
}
