//! Organizations and their configuration.

use crate::{
    error::{NexoError, NexoResult},
    event::DomainEvent,
    org_config::OrgConfig,
    rbac::{Action, ElementKind, Principal},
    rbac_service::RbacService,
    rng::AFFILIATE_ALPHABET,
    service::ServiceContext,
    store::{InviteCodeRow, OrganizationRow},
    types::OrgId,
};
use chrono::Duration;

pub const INVITE_CODE_LENGTH: usize = 8;
pub const INVITE_CODE_TTL_DAYS: i64 = 30;
const INVITE_CODE_ATTEMPTS: usize = 10;

#[derive(Debug, Clone, Default)]
pub struct NewOrganization {
    pub name: String,
    pub slug: String,
    pub email: String,
    pub description: String,
}

pub struct OrganizationService<'a> {
    cx: ServiceContext<'a>,
}

impl<'a> OrganizationService<'a> {
    pub fn new(cx: ServiceContext<'a>) -> Self {
        Self { cx }
    }

    /// Create the organization with the current default config.
    pub fn create_organization(&self, new: &NewOrganization) -> NexoResult<OrganizationRow> {
        let name = new.name.trim();
        let slug = new.slug.trim().to_lowercase();
        if name.is_empty() {
            return Err(NexoError::Validation("organization name must not be empty".into()));
        }
        if slug.is_empty() || !slug.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(NexoError::Validation(format!("invalid organization slug '{}'", new.slug)));
        }
        if self.cx.store.organization_by_slug(&slug)?.is_some() {
            return Err(NexoError::Conflict(format!("organization slug '{slug}' is already taken")));
        }

        let now = self.cx.now();
        let org_uuid = self.cx.prefixed_uuid("org");
        let org_id = self.cx.store.insert_organization(
            &org_uuid,
            name,
            &slug,
            new.email.trim(),
            new.description.trim(),
            now,
        )?;
        self.cx.store.insert_org_config(org_id, &OrgConfig::default(), now)?;
        self.cx.emit(DomainEvent::OrganizationCreated { org_id, slug: slug.clone() })?;
        log::info!("organization '{slug}' created (id {org_id})");
        self.get(org_id)
    }

    pub fn get(&self, org_id: OrgId) -> NexoResult<OrganizationRow> {
        self.cx
            .store
            .organization(org_id)?
            .ok_or_else(|| NexoError::not_found("organization"))
    }

    pub fn get_by_slug(&self, slug: &str) -> NexoResult<OrganizationRow> {
        self.cx
            .store
            .organization_by_slug(&slug.trim().to_lowercase())?
            .ok_or_else(|| NexoError::not_found("organization"))
    }

    pub fn list(&self) -> NexoResult<Vec<OrganizationRow>> {
        self.cx.store.all_organizations()
    }

    pub fn config(&self, org_id: OrgId) -> NexoResult<OrgConfig> {
        self.cx
            .store
            .org_config(org_id, self.cx.now())?
            .ok_or_else(|| NexoError::not_found("organization config"))
    }

    pub fn update_config(&self, principal: Principal, org_id: OrgId, config: OrgConfig) -> NexoResult<OrgConfig> {
        self.get(org_id)?;
        RbacService::new(self.cx).authorize_in_org(
            principal,
            org_id,
            ElementKind::Organization,
            Action::Update,
        )?;
        let config = OrgConfig {
            config_version: crate::org_config::CURRENT_VERSION.to_string(),
            ..config
        };
        self.cx.store.update_org_config(org_id, &config, self.cx.now())?;
        Ok(config)
    }

    // ── Invite codes ───────────────────────────────────────────

    fn authorize_manage(&self, principal: Principal, org_id: OrgId) -> NexoResult<()> {
        self.get(org_id)?;
        RbacService::new(self.cx).authorize_in_org(
            principal,
            org_id,
            ElementKind::Organization,
            Action::Update,
        )
    }

    /// New invite code for an invite-only organization, valid for
    /// `INVITE_CODE_TTL_DAYS`.
    pub fn create_invite_code(&self, principal: Principal, org_id: OrgId) -> NexoResult<InviteCodeRow> {
        self.authorize_manage(principal, org_id)?;
        let now = self.cx.now();
        for _ in 0..INVITE_CODE_ATTEMPTS {
            let code = self.cx.with_rng(|rng| rng.code(AFFILIATE_ALPHABET, INVITE_CODE_LENGTH));
            if self.cx.store.invite_code(org_id, &code)?.is_some() {
                continue;
            }
            let invite_code_uuid = self.cx.prefixed_uuid("invite");
            let id = self.cx.store.insert_invite_code(
                org_id,
                &invite_code_uuid,
                &code,
                principal.user_id(),
                now + Duration::days(INVITE_CODE_TTL_DAYS),
                now,
            )?;
            self.cx.emit(DomainEvent::InviteCodeCreated { org_id, invite_code_uuid })?;
            return self
                .cx
                .store
                .invite_code_by_id(id)?
                .ok_or_else(|| NexoError::not_found("invite code"));
        }
        Err(NexoError::Internal("failed to generate unique invite code".into()))
    }

    pub fn invite_codes(&self, principal: Principal, org_id: OrgId) -> NexoResult<Vec<InviteCodeRow>> {
        self.authorize_manage(principal, org_id)?;
        self.cx.store.invite_codes_for_org(org_id)
    }

    pub fn delete_invite_code(&self, principal: Principal, org_id: OrgId, invite_code_uuid: &str) -> NexoResult<()> {
        self.authorize_manage(principal, org_id)?;
        if !self.cx.store.delete_invite_code(org_id, invite_code_uuid)? {
            return Err(NexoError::not_found("invite code"));
        }
        Ok(())
    }
}
