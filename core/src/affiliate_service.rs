//! Affiliate program: referrers, codes, clicks, attribution and the
//! commission ledger.
//!
//! Flow: click -> attribution (first- or last-click, bounded by the window)
//! -> payment -> commission (rate by product type and subscription cycle)
//! -> ledger insert keyed by provider event id -> attribution lock.
//!
//! RULES:
//!   - One attribution row per (org, user). Once locked it never changes.
//!   - One commission per (payment user, provider event id); retries of the
//!     same provider event return the existing row.
//!   - Reversed commissions do not count as subscription cycles.

use crate::{
    error::{NexoError, NexoResult},
    event::DomainEvent,
    rbac::{Action, Principal},
    rbac_service::RbacService,
    rng::AFFILIATE_ALPHABET,
    security::hash_ip,
    service::ServiceContext,
    store::{
        AffiliateCodeRow, AffiliateProgramRow, AffiliateRow, AttributionRow, AttributionTarget,
        CommissionRow, NewCommission, OrganizationRow,
    },
    types::{AffiliateStatus, AttributionModel, CommissionStatus, OrgId, ProductType, RowId, UserId},
};
use chrono::Duration;
use serde::{Deserialize, Serialize};

pub const CODE_LENGTH: usize = 10;
const CODE_ATTEMPTS: usize = 25;
const MAX_TRACKED_FIELD_LEN: usize = 500;

/// Full replacement of the editable program settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramUpdate {
    pub enabled: bool,
    pub attribution_window_days: i64,
    pub attribution_model: AttributionModel,
    pub subscription_first_cycles: i64,
    pub subscription_first_rate: f64,
    pub subscription_recurring_rate: f64,
    pub one_time_rate: f64,
}

impl ProgramUpdate {
    fn validate(&self) -> NexoResult<()> {
        let rates = [
            ("subscription_first_rate", self.subscription_first_rate),
            ("subscription_recurring_rate", self.subscription_recurring_rate),
            ("one_time_rate", self.one_time_rate),
        ];
        for (name, rate) in rates {
            if !(0.0..=1.0).contains(&rate) {
                return Err(NexoError::Validation(format!("{name} must be between 0 and 1")));
            }
        }
        if self.attribution_window_days < 1 {
            return Err(NexoError::Validation("attribution window must be at least one day".into()));
        }
        if self.subscription_first_cycles < 0 {
            return Err(NexoError::Validation("subscription_first_cycles must not be negative".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    PaymentUserNotFound,
    NoActiveAttribution,
    ProgramDisabled,
    ProductNotFound,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommissionOutcome {
    Recorded(CommissionRow),
    /// Provider retried an event that already has a ledger row.
    AlreadyRecorded(CommissionRow),
    Skipped(SkipReason),
}

impl CommissionOutcome {
    pub fn commission(&self) -> Option<&CommissionRow> {
        match self {
            Self::Recorded(row) | Self::AlreadyRecorded(row) => Some(row),
            Self::Skipped(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffiliateStats {
    pub affiliate_id: RowId,
    pub clicks: i64,
    pub signups: i64,
    pub pending_amount_cents: i64,
    pub paid_amount_cents: i64,
    pub currency: String,
}

/// `round_half_even(amount * 100 * rate)`.
pub fn commission_cents(amount: f64, rate: f64) -> i64 {
    (amount * 100.0 * rate).round_ties_even() as i64
}

fn truncate(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}

pub struct AffiliateService<'a> {
    cx: ServiceContext<'a>,
}

impl<'a> AffiliateService<'a> {
    pub fn new(cx: ServiceContext<'a>) -> Self {
        Self { cx }
    }

    fn organization(&self, org_id: OrgId) -> NexoResult<OrganizationRow> {
        self.cx
            .store
            .organization(org_id)?
            .ok_or_else(|| NexoError::not_found("organization"))
    }

    fn authorize_org(&self, principal: Principal, action: Action, org: &OrganizationRow) -> NexoResult<()> {
        RbacService::new(self.cx).authorize(principal, action, &org.org_uuid)
    }

    fn affiliate_in_org(&self, org_id: OrgId, affiliate_id: RowId) -> NexoResult<AffiliateRow> {
        self.cx
            .store
            .affiliate(affiliate_id)?
            .filter(|a| a.org_id == org_id)
            .ok_or_else(|| NexoError::not_found("affiliate"))
    }

    // ── Program ────────────────────────────────────────────────

    pub fn get_or_create_program(&self, org_id: OrgId) -> NexoResult<AffiliateProgramRow> {
        if let Some(program) = self.cx.store.affiliate_program(org_id)? {
            return Ok(program);
        }
        self.organization(org_id)?;
        self.cx.store.ensure_affiliate_program(org_id, self.cx.now())?;
        log::info!("default affiliate program created for org {org_id}");
        self.cx
            .store
            .affiliate_program(org_id)?
            .ok_or_else(|| NexoError::not_found("affiliate program"))
    }

    pub fn update_program(
        &self,
        principal: Principal,
        org_id: OrgId,
        update: &ProgramUpdate,
    ) -> NexoResult<AffiliateProgramRow> {
        let org = self.organization(org_id)?;
        self.authorize_org(principal, Action::Update, &org)?;
        update.validate()?;

        let current = self.get_or_create_program(org_id)?;
        let program = AffiliateProgramRow {
            enabled: update.enabled,
            attribution_window_days: update.attribution_window_days,
            attribution_model: update.attribution_model,
            subscription_first_cycles: update.subscription_first_cycles,
            subscription_first_rate: update.subscription_first_rate,
            subscription_recurring_rate: update.subscription_recurring_rate,
            one_time_rate: update.one_time_rate,
            ..current
        };
        self.cx.store.update_affiliate_program(&program, self.cx.now())?;
        self.get_or_create_program(org_id)
    }

    // ── Affiliates & codes ─────────────────────────────────────

    pub fn create_affiliate(
        &self,
        principal: Principal,
        org_id: OrgId,
        name: &str,
        email: &str,
        user_id: Option<UserId>,
    ) -> NexoResult<AffiliateRow> {
        let org = self.organization(org_id)?;
        self.authorize_org(principal, Action::Create, &org)?;
        let id = self.cx.store.insert_affiliate(
            org_id,
            user_id,
            name.trim(),
            &email.trim().to_lowercase(),
            self.cx.now(),
        )?;
        self.affiliate_in_org(org_id, id)
    }

    pub fn set_affiliate_status(
        &self,
        principal: Principal,
        org_id: OrgId,
        affiliate_id: RowId,
        status: AffiliateStatus,
    ) -> NexoResult<AffiliateRow> {
        let org = self.organization(org_id)?;
        self.authorize_org(principal, Action::Update, &org)?;
        self.affiliate_in_org(org_id, affiliate_id)?;
        self.cx.store.set_affiliate_status(affiliate_id, status, self.cx.now())?;
        self.affiliate_in_org(org_id, affiliate_id)
    }

    pub fn list_affiliates(&self, org_id: OrgId) -> NexoResult<Vec<AffiliateRow>> {
        self.cx.store.affiliates_for_org(org_id)
    }

    pub fn generate_code(
        &self,
        principal: Principal,
        org_id: OrgId,
        affiliate_id: RowId,
    ) -> NexoResult<AffiliateCodeRow> {
        let org = self.organization(org_id)?;
        self.authorize_org(principal, Action::Create, &org)?;
        self.affiliate_in_org(org_id, affiliate_id)?;

        for _ in 0..CODE_ATTEMPTS {
            let code = self.cx.with_rng(|rng| rng.code(AFFILIATE_ALPHABET, CODE_LENGTH));
            if self.cx.store.affiliate_code_taken(&code)? {
                continue;
            }
            let id = self
                .cx
                .store
                .insert_affiliate_code(org_id, affiliate_id, &code, self.cx.now())?;
            return self
                .cx
                .store
                .affiliate_code(id)?
                .ok_or_else(|| NexoError::not_found("affiliate code"));
        }
        log::error!("no free affiliate code after {CODE_ATTEMPTS} attempts");
        Err(NexoError::Internal("failed to generate unique affiliate code".into()))
    }

    pub fn set_code_status(
        &self,
        principal: Principal,
        org_id: OrgId,
        code_id: RowId,
        status: AffiliateStatus,
    ) -> NexoResult<AffiliateCodeRow> {
        let org = self.organization(org_id)?;
        self.authorize_org(principal, Action::Update, &org)?;
        let code = self
            .cx
            .store
            .affiliate_code(code_id)?
            .filter(|c| c.org_id == org_id)
            .ok_or_else(|| NexoError::not_found("affiliate code"))?;
        self.cx.store.set_affiliate_code_status(code.id, status)?;
        Ok(AffiliateCodeRow { status, ..code })
    }

    pub fn codes_for_affiliate(&self, org_id: OrgId, affiliate_id: RowId) -> NexoResult<Vec<AffiliateCodeRow>> {
        self.affiliate_in_org(org_id, affiliate_id)?;
        self.cx.store.codes_for_affiliate(affiliate_id)
    }

    // ── Clicks & attribution ───────────────────────────────────

    /// Public: no principal required. Returns the click id.
    pub fn track_click(
        &self,
        org_id: OrgId,
        code: &str,
        landing_url: &str,
        user_agent: &str,
        ip: &str,
    ) -> NexoResult<RowId> {
        self.organization(org_id)?;
        let code_row = self
            .cx
            .store
            .affiliate_code_in_org(org_id, code)?
            .filter(|c| c.status == AffiliateStatus::Active)
            .ok_or_else(|| NexoError::not_found("affiliate code"))?;
        let ip_hash = hash_ip(&self.cx.config.security.affiliate_ip_salt, ip);
        self.cx.store.insert_affiliate_click(
            org_id,
            code_row.id,
            &truncate(landing_url, MAX_TRACKED_FIELD_LEN),
            &truncate(user_agent, MAX_TRACKED_FIELD_LEN),
            &ip_hash,
            self.cx.now(),
        )
    }

    /// Bind `user_id` to the affiliate behind `code`.
    ///
    /// Returns None when the code cannot attribute (empty, unknown, disabled,
    /// inactive affiliate, program off). An existing row is kept when it is
    /// locked, or whenever the program is first-click, expired or not.
    pub fn apply_code_to_user(
        &self,
        org_id: OrgId,
        user_id: UserId,
        code: &str,
        click_id: Option<RowId>,
    ) -> NexoResult<Option<AttributionRow>> {
        let code = code.trim();
        if code.is_empty() {
            return Ok(None);
        }
        let program = self.get_or_create_program(org_id)?;
        if !program.enabled {
            return Ok(None);
        }
        let Some(code_row) = self
            .cx
            .store
            .affiliate_code_in_org(org_id, code)?
            .filter(|c| c.status == AffiliateStatus::Active)
        else {
            return Ok(None);
        };
        let Some(affiliate) = self
            .cx
            .store
            .affiliate(code_row.affiliate_id)?
            .filter(|a| a.org_id == org_id && a.status == AffiliateStatus::Active)
        else {
            return Ok(None);
        };

        let now = self.cx.now();
        let target = AttributionTarget {
            affiliate_id: affiliate.id,
            affiliate_code_id: code_row.id,
            affiliate_click_id: click_id,
            attributed_at: now,
            expires_at: now + Duration::days(program.attribution_window_days.max(1)),
        };

        match self.cx.store.attribution(org_id, user_id)? {
            Some(existing) if existing.locked => return Ok(Some(existing)),
            Some(existing) if program.attribution_model == AttributionModel::FirstClick => {
                return Ok(Some(existing))
            }
            Some(existing) => self.cx.store.overwrite_attribution(existing.id, &target)?,
            None => {
                self.cx.store.insert_attribution(org_id, user_id, &target)?;
            }
        }

        self.cx.emit(DomainEvent::AffiliateAttributed {
            org_id,
            user_id,
            affiliate_id: affiliate.id,
        })?;
        self.cx.store.attribution(org_id, user_id)
    }

    /// Locked rows are always active; unlocked rows until they expire.
    pub fn active_attribution(&self, org_id: OrgId, user_id: UserId) -> NexoResult<Option<AttributionRow>> {
        let now = self.cx.now();
        Ok(self
            .cx
            .store
            .attribution(org_id, user_id)?
            .filter(|a| a.is_active(now)))
    }

    // ── Commissions ────────────────────────────────────────────

    pub fn record_commission_for_payment(
        &self,
        org_id: OrgId,
        payment_user_id: RowId,
        provider_event_id: &str,
        provider_subscription_id: Option<&str>,
    ) -> NexoResult<CommissionOutcome> {
        let Some(payment_user) = self
            .cx
            .store
            .payment_user(payment_user_id)?
            .filter(|pu| pu.org_id == org_id)
        else {
            return Ok(CommissionOutcome::Skipped(SkipReason::PaymentUserNotFound));
        };
        let Some(attribution) = self.active_attribution(org_id, payment_user.user_id)? else {
            return Ok(CommissionOutcome::Skipped(SkipReason::NoActiveAttribution));
        };
        let program = self.get_or_create_program(org_id)?;
        if !program.enabled {
            return Ok(CommissionOutcome::Skipped(SkipReason::ProgramDisabled));
        }
        let Some(product) = self
            .cx
            .store
            .product(payment_user.payment_product_id)?
            .filter(|p| p.org_id == org_id)
        else {
            return Ok(CommissionOutcome::Skipped(SkipReason::ProductNotFound));
        };

        if let Some(existing) =
            self.cx
                .store
                .commission_for_event(org_id, payment_user_id, provider_event_id)?
        {
            log::debug!("commission for event {provider_event_id} already recorded");
            return Ok(CommissionOutcome::AlreadyRecorded(existing));
        }

        let subscription_id = provider_subscription_id.filter(|s| !s.is_empty());
        let (rate, cycle_number) = match (product.product_type, subscription_id) {
            (ProductType::Subscription, Some(sub_id)) => {
                let cycle = self
                    .cx
                    .store
                    .commission_cycles(org_id, attribution.affiliate_id, sub_id)?
                    + 1;
                let rate = if cycle <= program.subscription_first_cycles {
                    program.subscription_first_rate
                } else {
                    program.subscription_recurring_rate
                };
                (rate, cycle)
            }
            _ => (program.one_time_rate, 1),
        };

        let commission = NewCommission {
            org_id,
            affiliate_id: attribution.affiliate_id,
            user_id: payment_user.user_id,
            payment_user_id,
            product_id: product.id,
            currency: product.currency.clone(),
            amount_cents: commission_cents(product.amount, rate),
            rate_applied: rate,
            cycle_number,
            provider_event_id: provider_event_id.to_string(),
            provider_subscription_id: subscription_id.map(str::to_string),
        };
        let (commission_id, newly_locked) =
            self.cx
                .store
                .record_commission_and_lock(&commission, attribution.id, self.cx.now())?;

        log::info!(
            "commission {commission_id}: affiliate {} cycle {cycle_number} {} {}",
            commission.affiliate_id,
            commission.amount_cents,
            commission.currency
        );
        self.cx.emit(DomainEvent::CommissionRecorded {
            org_id,
            commission_id,
            affiliate_id: commission.affiliate_id,
            amount_cents: commission.amount_cents,
            cycle_number,
        })?;
        if newly_locked {
            self.cx.emit(DomainEvent::AttributionLocked {
                org_id,
                user_id: payment_user.user_id,
                affiliate_id: attribution.affiliate_id,
            })?;
        }

        let row = self
            .cx
            .store
            .commission(commission_id)?
            .ok_or_else(|| NexoError::not_found("commission"))?;
        Ok(CommissionOutcome::Recorded(row))
    }

    fn commission_in_org(&self, org_id: OrgId, commission_id: RowId) -> NexoResult<CommissionRow> {
        self.cx
            .store
            .commission(commission_id)?
            .filter(|c| c.org_id == org_id)
            .ok_or_else(|| NexoError::not_found("commission"))
    }

    pub fn mark_commission_paid(
        &self,
        principal: Principal,
        org_id: OrgId,
        commission_id: RowId,
    ) -> NexoResult<CommissionRow> {
        let org = self.organization(org_id)?;
        self.authorize_org(principal, Action::Update, &org)?;
        let commission = self.commission_in_org(org_id, commission_id)?;
        if commission.status != CommissionStatus::Pending {
            return Err(NexoError::Conflict(format!(
                "commission {commission_id} is {}, only pending commissions can be paid",
                commission.status
            )));
        }
        self.cx.store.mark_commission_paid(commission_id, self.cx.now())?;
        self.cx.emit(DomainEvent::CommissionPaid { org_id, commission_id })?;
        self.commission_in_org(org_id, commission_id)
    }

    pub fn reverse_commission(&self, org_id: OrgId, commission_id: RowId) -> NexoResult<CommissionRow> {
        let commission = self.commission_in_org(org_id, commission_id)?;
        if commission.status == CommissionStatus::Reversed {
            return Err(NexoError::Conflict(format!("commission {commission_id} is already reversed")));
        }
        self.cx.store.mark_commission_reversed(commission_id, self.cx.now())?;
        self.cx.emit(DomainEvent::CommissionReversed { org_id, commission_id })?;
        self.commission_in_org(org_id, commission_id)
    }

    /// Reverse every live commission booked for `provider_event_id`.
    pub fn reverse_commissions_for_event(
        &self,
        org_id: OrgId,
        provider_event_id: &str,
    ) -> NexoResult<Vec<CommissionRow>> {
        let mut reversed = Vec::new();
        for commission in self
            .cx
            .store
            .commissions_for_provider_event(org_id, provider_event_id)?
        {
            if commission.status != CommissionStatus::Reversed {
                reversed.push(self.reverse_commission(org_id, commission.id)?);
            }
        }
        Ok(reversed)
    }

    pub fn list_commissions(&self, org_id: OrgId, affiliate_id: Option<RowId>) -> NexoResult<Vec<CommissionRow>> {
        self.cx.store.commissions_for_org(org_id, affiliate_id)
    }

    // ── Stats ──────────────────────────────────────────────────

    pub fn admin_stats(&self, org_id: OrgId) -> NexoResult<Vec<AffiliateStats>> {
        let mut out = Vec::new();
        for affiliate in self.cx.store.affiliates_for_org(org_id)? {
            let totals = self.cx.store.affiliate_totals(affiliate.id)?;
            let currency = totals
                .first_pending_currency
                .or(totals.first_paid_currency)
                .unwrap_or_else(|| "USD".to_string());
            out.push(AffiliateStats {
                affiliate_id: affiliate.id,
                clicks: totals.clicks,
                signups: totals.signups,
                pending_amount_cents: totals.pending_cents,
                paid_amount_cents: totals.paid_cents,
                currency,
            });
        }
        Ok(out)
    }
}
