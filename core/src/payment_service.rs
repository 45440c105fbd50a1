//! Products, paid-course access and payment provider events.
//!
//! Provider webhooks arrive already verified and decoded as a PaymentEvent.
//! Every event is keyed by the provider's event id so retries land on the
//! same PaymentsUser row and the same commission.

use crate::{
    affiliate_service::{AffiliateService, CommissionOutcome},
    error::{NexoError, NexoResult},
    event::DomainEvent,
    org_config::Feature,
    rbac::{Action, ElementKind, Principal},
    rbac_service::RbacService,
    service::ServiceContext,
    store::{CommissionRow, CourseRow, PaymentUserRow, ProductFields, ProductRow},
    types::{OrgId, PaymentStatus, ProductType, RowId, UserId},
    usage_service::UsageService,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
pub struct ProductInput {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub product_type: ProductType,
    pub amount: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub provider_product_id: String,
}

fn default_currency() -> String {
    "USD".to_string()
}

impl ProductInput {
    fn validate(&self) -> NexoResult<()> {
        if self.name.trim().is_empty() {
            return Err(NexoError::Validation("product name must not be empty".into()));
        }
        if !self.amount.is_finite() || self.amount < 0.0 {
            return Err(NexoError::Validation(format!("invalid product amount {}", self.amount)));
        }
        let currency = self.currency.trim();
        if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(NexoError::Validation(format!("invalid currency '{}'", self.currency)));
        }
        Ok(())
    }

    fn fields<'s>(&'s self, currency: &'s str) -> ProductFields<'s> {
        ProductFields {
            name: self.name.trim(),
            description: self.description.trim(),
            product_type: self.product_type,
            amount: self.amount,
            currency,
            provider_product_id: self.provider_product_id.trim(),
        }
    }
}

/// Fields every provider event carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentEventData {
    pub org_id: OrgId,
    pub user_id: UserId,
    pub product_id: RowId,
    pub provider_event_id: String,
    #[serde(default)]
    pub provider_subscription_id: Option<String>,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PaymentEvent {
    CheckoutCompleted(PaymentEventData),
    /// A renewal charge on a subscription.
    InvoicePaid(PaymentEventData),
    SubscriptionCancelled(PaymentEventData),
    PaymentFailed(PaymentEventData),
    Refunded {
        #[serde(flatten)]
        event: PaymentEventData,
        /// Event id of the charge being refunded.
        original_event_id: String,
    },
}

impl PaymentEvent {
    pub fn data(&self) -> &PaymentEventData {
        match self {
            Self::CheckoutCompleted(d)
            | Self::InvoicePaid(d)
            | Self::SubscriptionCancelled(d)
            | Self::PaymentFailed(d)
            | Self::Refunded { event: d, .. } => d,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PaymentEventOutcome {
    pub payment_user: PaymentUserRow,
    pub commission: Option<CommissionOutcome>,
    pub reversed: Vec<CommissionRow>,
}

/// A purchase with who bought it and what.
#[derive(Debug, Clone, Serialize)]
pub struct Customer {
    pub payment_user: PaymentUserRow,
    pub username: String,
    pub email: String,
    pub product_name: String,
}

pub struct PaymentService<'a> {
    cx: ServiceContext<'a>,
}

impl<'a> PaymentService<'a> {
    pub fn new(cx: ServiceContext<'a>) -> Self {
        Self { cx }
    }

    fn rbac(&self) -> RbacService<'a> {
        RbacService::new(self.cx)
    }

    fn product_in_org(&self, org_id: OrgId, product_id: RowId) -> NexoResult<ProductRow> {
        self.cx
            .store
            .product(product_id)?
            .filter(|p| p.org_id == org_id)
            .ok_or_else(|| NexoError::not_found("product"))
    }

    // ── Products ───────────────────────────────────────────────

    pub fn create_product(&self, principal: Principal, org_id: OrgId, input: &ProductInput) -> NexoResult<ProductRow> {
        UsageService::new(self.cx).check_limits(Feature::Payments, org_id)?;
        self.rbac()
            .authorize_in_org(principal, org_id, ElementKind::Organization, Action::Update)?;
        input.validate()?;
        let currency = input.currency.trim().to_ascii_uppercase();
        let id = self
            .cx
            .store
            .insert_product(org_id, &input.fields(&currency), self.cx.now())?;
        log::info!("org {org_id}: product {id} '{}' created", input.name.trim());
        self.product_in_org(org_id, id)
    }

    pub fn update_product(
        &self,
        principal: Principal,
        org_id: OrgId,
        product_id: RowId,
        input: &ProductInput,
    ) -> NexoResult<ProductRow> {
        self.rbac()
            .authorize_in_org(principal, org_id, ElementKind::Organization, Action::Update)?;
        self.product_in_org(org_id, product_id)?;
        input.validate()?;
        let currency = input.currency.trim().to_ascii_uppercase();
        self.cx
            .store
            .update_product(product_id, &input.fields(&currency), self.cx.now())?;
        self.product_in_org(org_id, product_id)
    }

    /// Archived products stay attached to existing purchases but are hidden
    /// from listings.
    pub fn archive_product(&self, principal: Principal, org_id: OrgId, product_id: RowId) -> NexoResult<ProductRow> {
        self.rbac()
            .authorize_in_org(principal, org_id, ElementKind::Organization, Action::Update)?;
        self.product_in_org(org_id, product_id)?;
        self.cx.store.set_product_archived(product_id, true, self.cx.now())?;
        self.product_in_org(org_id, product_id)
    }

    pub fn list_products(&self, org_id: OrgId, include_archived: bool) -> NexoResult<Vec<ProductRow>> {
        self.cx.store.products_for_org(org_id, include_archived)
    }

    // ── Course linkage ─────────────────────────────────────────

    pub fn link_course(&self, principal: Principal, org_id: OrgId, product_id: RowId, course_uuid: &str) -> NexoResult<()> {
        self.rbac()
            .authorize_in_org(principal, org_id, ElementKind::Organization, Action::Update)?;
        self.product_in_org(org_id, product_id)?;
        let course = self.course_in_org(org_id, course_uuid)?;
        self.cx.store.link_product_course(org_id, product_id, course.id)
    }

    pub fn unlink_course(
        &self,
        principal: Principal,
        org_id: OrgId,
        product_id: RowId,
        course_uuid: &str,
    ) -> NexoResult<()> {
        self.rbac()
            .authorize_in_org(principal, org_id, ElementKind::Organization, Action::Update)?;
        let course = self.course_in_org(org_id, course_uuid)?;
        if !self.cx.store.unlink_product_course(product_id, course.id)? {
            return Err(NexoError::not_found("product course link"));
        }
        Ok(())
    }

    /// Whether the principal may open a course's content.
    pub fn check_course_paid_access(&self, principal: Principal, course_uuid: &str) -> NexoResult<bool> {
        let course = self
            .cx
            .store
            .course_by_uuid(course_uuid)?
            .ok_or_else(|| NexoError::not_found("course"))?;
        let product_ids = self.cx.store.product_ids_for_course(course.id)?;
        if product_ids.is_empty() {
            return Ok(true);
        }
        let user_id = match principal {
            Principal::SiteAdmin => return Ok(true),
            Principal::Anonymous | Principal::SiteMember => return Ok(false),
            Principal::User(user_id) => user_id,
        };
        if self.rbac().authorship(&course.course_uuid, user_id)?.is_some() {
            return Ok(true);
        }
        for product_id in product_ids {
            let purchase = self.cx.store.payment_user_for(course.org_id, user_id, product_id)?;
            if purchase.is_some_and(|pu| pu.status.grants_access()) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn course_in_org(&self, org_id: OrgId, course_uuid: &str) -> NexoResult<CourseRow> {
        self.cx
            .store
            .course_by_uuid(course_uuid)?
            .filter(|c| c.org_id == org_id)
            .ok_or_else(|| NexoError::not_found("course"))
    }

    pub fn products_for_course(&self, principal: Principal, org_id: OrgId, course_uuid: &str) -> NexoResult<Vec<ProductRow>> {
        let course = self.course_in_org(org_id, course_uuid)?;
        self.rbac().authorize_course(principal, Action::Read, &course)?;
        let mut products = Vec::new();
        for product_id in self.cx.store.product_ids_for_course(course.id)? {
            products.extend(self.cx.store.product(product_id)?);
        }
        Ok(products)
    }

    pub fn courses_for_product(&self, principal: Principal, org_id: OrgId, product_id: RowId) -> NexoResult<Vec<CourseRow>> {
        self.rbac()
            .authorize_in_org(principal, org_id, ElementKind::Organization, Action::Update)?;
        self.product_in_org(org_id, product_id)?;
        let mut courses = Vec::new();
        for course_id in self.cx.store.course_ids_for_product(product_id)? {
            courses.extend(self.cx.store.course(course_id)?);
        }
        Ok(courses)
    }

    // ── Purchases ──────────────────────────────────────────────

    /// Every purchase in the organization, newest first.
    pub fn list_customers(&self, principal: Principal, org_id: OrgId) -> NexoResult<Vec<Customer>> {
        self.rbac()
            .authorize_in_org(principal, org_id, ElementKind::Organization, Action::Update)?;
        let mut customers = Vec::new();
        for payment_user in self.cx.store.payment_users_for_org(org_id)? {
            let Some(user) = self.cx.store.user(payment_user.user_id)? else {
                continue;
            };
            let product_name = self
                .cx
                .store
                .product(payment_user.payment_product_id)?
                .map(|p| p.name)
                .unwrap_or_default();
            customers.push(Customer {
                payment_user,
                username: user.username,
                email: user.email,
                product_name,
            });
        }
        Ok(customers)
    }

    /// Courses the calling user bought access to in the organization.
    pub fn owned_courses(&self, principal: Principal, org_id: OrgId) -> NexoResult<Vec<CourseRow>> {
        let Principal::User(user_id) = principal else {
            return Err(NexoError::Unauthorized);
        };
        let mut course_ids: Vec<RowId> = Vec::new();
        for purchase in self.cx.store.payment_users_for_user(org_id, user_id)? {
            if !purchase.status.grants_access() {
                continue;
            }
            for course_id in self.cx.store.course_ids_for_product(purchase.payment_product_id)? {
                if !course_ids.contains(&course_id) {
                    course_ids.push(course_id);
                }
            }
        }
        let mut courses = Vec::new();
        for course_id in course_ids {
            courses.extend(self.cx.store.course(course_id)?);
        }
        Ok(courses)
    }

    // ── Provider events ────────────────────────────────────────

    pub fn handle_payment_event(&self, event: &PaymentEvent) -> NexoResult<PaymentEventOutcome> {
        let data = event.data();
        if data.provider_event_id.trim().is_empty() {
            return Err(NexoError::BadRequest("payment event without provider event id".into()));
        }
        let product = self.product_in_org(data.org_id, data.product_id)?;
        if self.cx.store.user(data.user_id)?.is_none() {
            return Err(NexoError::not_found("user"));
        }

        let status = match event {
            PaymentEvent::CheckoutCompleted(_) => match product.product_type {
                ProductType::Subscription => PaymentStatus::Active,
                ProductType::OneTime => PaymentStatus::Completed,
            },
            PaymentEvent::InvoicePaid(_) => PaymentStatus::Active,
            PaymentEvent::SubscriptionCancelled(_) => PaymentStatus::Cancelled,
            PaymentEvent::PaymentFailed(_) => PaymentStatus::Failed,
            PaymentEvent::Refunded { .. } => PaymentStatus::Refunded,
        };
        // Status, ledger and journal move together; a failure leaves none
        // of them behind for the provider's retry.
        self.cx.store.atomic(|store| {
            let previous = store.payment_user_for(data.org_id, data.user_id, product.id)?;
            let seen = store.payment_event_recorded(data.org_id, &data.provider_event_id)?;
            let payment_user_id = store.upsert_payment_user(
                data.org_id,
                data.user_id,
                product.id,
                status,
                &data.data,
                self.cx.now(),
            )?;

            let affiliates = AffiliateService::new(self.cx);
            let mut commission = None;
            let mut reversed = Vec::new();
            match event {
                PaymentEvent::CheckoutCompleted(_) | PaymentEvent::InvoicePaid(_) => {
                    commission = Some(affiliates.record_commission_for_payment(
                        data.org_id,
                        payment_user_id,
                        &data.provider_event_id,
                        data.provider_subscription_id.as_deref(),
                    )?);
                }
                PaymentEvent::Refunded { original_event_id, .. } => {
                    reversed = affiliates.reverse_commissions_for_event(data.org_id, original_event_id)?;
                }
                PaymentEvent::SubscriptionCancelled(_) | PaymentEvent::PaymentFailed(_) => {}
            }

            let changed = !seen
                || previous.map(|pu| pu.status) != Some(status)
                || matches!(commission, Some(CommissionOutcome::Recorded(_)))
                || !reversed.is_empty();
            if changed {
                log::info!(
                    "org {}: payment event {} -> payments_user {payment_user_id} {status}",
                    data.org_id,
                    data.provider_event_id
                );
                self.cx.emit(DomainEvent::PaymentRecorded {
                    org_id: data.org_id,
                    payment_user_id,
                    provider_event_id: data.provider_event_id.clone(),
                    status: status.to_string(),
                })?;
            } else {
                log::debug!("payment event {} changed nothing", data.provider_event_id);
            }

            let payment_user = store
                .payment_user(payment_user_id)?
                .ok_or_else(|| NexoError::not_found("payments user"))?;
            Ok(PaymentEventOutcome { payment_user, commission, reversed })
        })
    }
}
