//! User accounts: self-signup, installer-created users and login.

use crate::{
    affiliate_service::AffiliateService,
    error::{NexoError, NexoResult},
    event::DomainEvent,
    org_config::{Feature, SignupMode},
    rbac::{Action, Principal, ROLE_ADMIN, ROLE_USER},
    rbac_service::RbacService,
    security::{hash_password, verify_password},
    service::ServiceContext,
    store::{CourseRow, NewUserRow, UserRow},
    types::{OrgId, RowId, UserId},
    usage_service::UsageService,
};
use serde::Deserialize;

pub const MIN_PASSWORD_LEN: usize = 8;
pub const MAX_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
}

pub fn validate_password(password: &str) -> NexoResult<()> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(NexoError::Validation(format!(
            "password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    Ok(())
}

pub struct UserService<'a> {
    cx: ServiceContext<'a>,
}

impl<'a> UserService<'a> {
    pub fn new(cx: ServiceContext<'a>) -> Self {
        Self { cx }
    }

    /// Self-signup into an organization with the User role.
    ///
    /// A bad affiliate code never fails the signup; it is logged and ignored.
    pub fn signup(&self, org_id: OrgId, new: &NewUser, affiliate_code: Option<&str>) -> NexoResult<UserRow> {
        if self.signup_mode(org_id)? == SignupMode::InviteOnly {
            return Err(NexoError::Forbidden("this organization is invite only".into()));
        }
        self.join(org_id, new, affiliate_code)
    }

    /// Signup into an invite-only organization with one of its unexpired
    /// invite codes. Open organizations refuse this path.
    pub fn signup_with_invite(
        &self,
        org_id: OrgId,
        new: &NewUser,
        invite_code: &str,
        affiliate_code: Option<&str>,
    ) -> NexoResult<UserRow> {
        if self.signup_mode(org_id)? != SignupMode::InviteOnly {
            return Err(NexoError::Forbidden(
                "this organization does not require an invite code".into(),
            ));
        }
        self.cx
            .store
            .invite_code(org_id, invite_code.trim())?
            .filter(|invite| invite.is_valid(self.cx.now()))
            .ok_or_else(|| NexoError::BadRequest("invite code is invalid or expired".into()))?;
        self.join(org_id, new, affiliate_code)
    }

    fn signup_mode(&self, org_id: OrgId) -> NexoResult<SignupMode> {
        let config = self
            .cx
            .store
            .org_config(org_id, self.cx.now())?
            .ok_or_else(|| NexoError::not_found("organization"))?;
        Ok(config.features.members.signup_mode)
    }

    fn join(&self, org_id: OrgId, new: &NewUser, affiliate_code: Option<&str>) -> NexoResult<UserRow> {
        let usage = UsageService::new(self.cx);
        usage.check_limits(Feature::Members, org_id)?;
        let user = self.insert_member(org_id, new, ROLE_USER)?;
        usage.increase(Feature::Members, org_id)?;

        if let Some(code) = affiliate_code.filter(|c| !c.trim().is_empty()) {
            match AffiliateService::new(self.cx).apply_code_to_user(org_id, user.id, code, None) {
                Ok(Some(_)) => log::info!("user {} attributed via code {code}", user.id),
                Ok(None) => log::debug!("affiliate code {code} did not attribute user {}", user.id),
                Err(e) => log::warn!("affiliate code {code} failed for user {}: {e}", user.id),
            }
        }
        Ok(user)
    }

    /// Installer path: create a user as an admin of `org_id`.
    pub fn create_org_user(&self, org_id: OrgId, new: &NewUser) -> NexoResult<UserRow> {
        if !self.cx.store.organization_exists(org_id)? {
            return Err(NexoError::not_found("organization"));
        }
        self.insert_member(org_id, new, ROLE_ADMIN)
    }

    fn insert_member(&self, org_id: OrgId, new: &NewUser, role_id: RowId) -> NexoResult<UserRow> {
        let username = new.username.trim();
        let email = new.email.trim().to_lowercase();
        if username.is_empty() {
            return Err(NexoError::Validation("username must not be empty".into()));
        }
        if !email.contains('@') {
            return Err(NexoError::Validation(format!("invalid email '{email}'")));
        }
        validate_password(&new.password)?;
        if self.cx.store.user_by_username(username)?.is_some() {
            return Err(NexoError::Conflict("username already exists".into()));
        }
        if self.cx.store.user_by_email(&email)?.is_some() {
            return Err(NexoError::Conflict("email already exists".into()));
        }

        let password_hash = self.cx.with_rng(|rng| hash_password(rng, &new.password))?;
        let user_uuid = self.cx.prefixed_uuid("user");
        let now = self.cx.now();
        let user_id = self.cx.store.insert_user(
            &NewUserRow {
                user_uuid: &user_uuid,
                username,
                email: &email,
                first_name: new.first_name.trim(),
                last_name: new.last_name.trim(),
                password_hash: &password_hash,
            },
            now,
        )?;
        self.cx.store.insert_membership(user_id, org_id, role_id, now)?;
        self.cx.emit(DomainEvent::UserSignedUp { org_id, user_id, role_id })?;
        log::info!("user '{username}' joined org {org_id} with role {role_id}");
        self.get(user_id)
    }

    /// Email and password login.
    pub fn authenticate(&self, email: &str, password: &str) -> NexoResult<UserRow> {
        let user = self
            .cx
            .store
            .user_by_email(&email.trim().to_lowercase())?
            .ok_or(NexoError::Unauthorized)?;
        if verify_password(password, &user.password_hash) {
            Ok(user)
        } else {
            Err(NexoError::Unauthorized)
        }
    }

    /// Change a password knowing the current one.
    pub fn update_password(
        &self,
        principal: Principal,
        user_id: UserId,
        old_password: &str,
        new_password: &str,
    ) -> NexoResult<UserRow> {
        let user = self.get(user_id)?;
        RbacService::new(self.cx).authorize(principal, Action::Update, &user.user_uuid)?;
        if !verify_password(old_password, &user.password_hash) {
            return Err(NexoError::Unauthorized);
        }
        validate_password(new_password)?;
        let password_hash = self.cx.with_rng(|rng| hash_password(rng, new_password))?;
        self.cx.store.update_password_hash(user_id, &password_hash, self.cx.now())?;
        self.cx.emit(DomainEvent::PasswordUpdated { user_id })?;
        self.get(user_id)
    }

    /// Delete an account and give back its member seats. The last admin of
    /// an organization cannot be deleted.
    pub fn delete_user(&self, principal: Principal, user_id: UserId) -> NexoResult<()> {
        let user = self.get(user_id)?;
        RbacService::new(self.cx).authorize(principal, Action::Delete, &user.user_uuid)?;
        let memberships = self.cx.store.memberships_of_user(user_id)?;
        for membership in &memberships {
            if membership.role_id == ROLE_ADMIN
                && self.cx.store.count_members_with_role(membership.org_id, ROLE_ADMIN)? <= 1
            {
                return Err(NexoError::Conflict(format!(
                    "user is the last admin of organization {}",
                    membership.org_id
                )));
            }
        }

        self.cx.store.atomic(|store| {
            store.delete_user(user_id)?;
            let usage = UsageService::new(self.cx);
            for membership in &memberships {
                usage.decrease(Feature::Members, membership.org_id)?;
            }
            self.cx.emit(DomainEvent::UserDeleted { user_id, username: user.username.clone() })
        })?;
        log::info!("user '{}' deleted", user.username);
        Ok(())
    }

    /// Courses the user made or contributes to that `principal` may read,
    /// newest first. `page` starts at 1.
    pub fn user_courses(
        &self,
        principal: Principal,
        user_id: UserId,
        page: usize,
        limit: usize,
    ) -> NexoResult<Vec<CourseRow>> {
        if page == 0 {
            return Err(NexoError::Validation("page starts at 1".into()));
        }
        if !(1..=MAX_PAGE_SIZE).contains(&limit) {
            return Err(NexoError::Validation(format!("limit must be between 1 and {MAX_PAGE_SIZE}")));
        }
        self.get(user_id)?;
        let rbac = RbacService::new(self.cx);
        let mut visible = Vec::new();
        for course in self.cx.store.courses_authored_by(user_id)? {
            match rbac.authorize_course(principal, Action::Read, &course) {
                Ok(()) => visible.push(course),
                Err(NexoError::Unauthorized | NexoError::Forbidden(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(visible.into_iter().skip((page - 1) * limit).take(limit).collect())
    }

    pub fn get(&self, user_id: UserId) -> NexoResult<UserRow> {
        self.cx.store.user(user_id)?.ok_or_else(|| NexoError::not_found("user"))
    }

    pub fn get_by_email(&self, email: &str) -> NexoResult<UserRow> {
        self.cx
            .store
            .user_by_email(&email.trim().to_lowercase())?
            .ok_or_else(|| NexoError::not_found("user"))
    }
}
