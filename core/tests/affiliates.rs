use chrono::{Duration, TimeZone, Utc};
use nexo_core::{
    affiliate_service::{CommissionOutcome, ProgramUpdate, SkipReason},
    clock::{Clock, ManualClock},
    payment_service::{PaymentEvent, PaymentEventData, ProductInput},
    platform::{InstallRequest, Installed, Platform},
    rbac::Principal,
    security::hash_ip,
    store::{AffiliateCodeRow, AffiliateRow, CommissionRow, ProductRow, UserRow},
    types::{
        AffiliateStatus, AttributionModel, CommissionStatus, OrgId, PaymentStatus, ProductType, RowId, UserId,
    },
    user_service::NewUser,
    NexoError,
};
use serde_json::json;
use std::sync::Arc;

// ── Test helpers ────────────────────────────────────────────────────────────

fn build() -> (Platform, Arc<ManualClock>, Installed) {
    let _ = env_logger::builder().is_test(true).try_init();
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap()));
    let platform = Platform::in_memory(clock.clone(), 7).unwrap();
    let installed = platform
        .install(&InstallRequest::short(None, "install-pass-1".into()))
        .unwrap();
    (platform, clock, installed)
}

fn admin(installed: &Installed) -> Principal {
    Principal::User(installed.admin.id)
}

fn learner(platform: &Platform, org_id: OrgId, name: &str, code: Option<&str>) -> UserRow {
    platform
        .users()
        .signup(
            org_id,
            &NewUser {
                username: name.into(),
                email: format!("{name}@school.dev"),
                password: "learner-pass-1".into(),
                ..NewUser::default()
            },
            code,
        )
        .unwrap()
}

fn affiliate_with_code(platform: &Platform, installed: &Installed, name: &str) -> (AffiliateRow, AffiliateCodeRow) {
    let org_id = installed.organization.id;
    let affiliates = platform.affiliates();
    let affiliate = affiliates
        .create_affiliate(admin(installed), org_id, name, &format!("{name}@partners.dev"), None)
        .unwrap();
    let code = affiliates.generate_code(admin(installed), org_id, affiliate.id).unwrap();
    (affiliate, code)
}

fn product(platform: &Platform, installed: &Installed, product_type: ProductType, amount: f64) -> ProductRow {
    platform
        .payments()
        .create_product(
            admin(installed),
            installed.organization.id,
            &ProductInput {
                name: format!("{product_type} plan"),
                description: String::new(),
                product_type,
                amount,
                currency: "usd".into(),
                provider_product_id: String::new(),
            },
        )
        .unwrap()
}

fn event_data(org_id: OrgId, user_id: UserId, product_id: RowId, event_id: &str, sub: Option<&str>) -> PaymentEventData {
    PaymentEventData {
        org_id,
        user_id,
        product_id,
        provider_event_id: event_id.into(),
        provider_subscription_id: sub.map(str::to_string),
        data: json!({ "source": "test" }),
    }
}

fn recorded(outcome: Option<CommissionOutcome>) -> CommissionRow {
    match outcome {
        Some(CommissionOutcome::Recorded(row)) => row,
        other => panic!("expected a recorded commission, got {other:?}"),
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

/// An org gets the default program the first time anyone asks for it.
#[test]
fn default_program_is_created_lazily() {
    let (platform, _, installed) = build();
    let program = platform
        .affiliates()
        .get_or_create_program(installed.organization.id)
        .unwrap();

    assert!(program.enabled);
    assert_eq!(program.attribution_window_days, 30);
    assert_eq!(program.attribution_model, AttributionModel::LastClick);
    assert_eq!(program.subscription_first_cycles, 6);
    assert_eq!(program.subscription_first_rate, 0.5);
    assert_eq!(program.subscription_recurring_rate, 0.2);
    assert_eq!(program.one_time_rate, 0.3);
}

/// Generated codes are ten characters from the uppercase alphanumeric set.
#[test]
fn generated_codes_use_the_affiliate_alphabet() {
    let (platform, _, installed) = build();
    let (_, code) = affiliate_with_code(&platform, &installed, "ada");

    assert_eq!(code.code.len(), 10);
    assert!(code
        .code
        .chars()
        .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
    assert_eq!(code.status, AffiliateStatus::Active);
}

/// Members without org rights cannot manage affiliates.
#[test]
fn learners_cannot_create_affiliates() {
    let (platform, _, installed) = build();
    let org_id = installed.organization.id;
    let user = learner(&platform, org_id, "lea", None);

    let err = platform
        .affiliates()
        .create_affiliate(Principal::User(user.id), org_id, "Lea", "lea@x.dev", None)
        .unwrap_err();
    assert!(matches!(err, NexoError::Forbidden(_)), "got {err:?}");
}

/// Clicks store a salted hash of the IP, never the IP itself.
#[test]
fn click_stores_hashed_ip() {
    let (platform, _, installed) = build();
    let org_id = installed.organization.id;
    let (_, code) = affiliate_with_code(&platform, &installed, "ada");

    let click_id = platform
        .affiliates()
        .track_click(org_id, &code.code, "https://school.dev/?ref=x", "Mozilla/5.0", "203.0.113.9")
        .unwrap();
    let click = platform.store().affiliate_click(click_id).unwrap().unwrap();

    let salt = &platform.config().security.affiliate_ip_salt;
    assert_eq!(click.ip_hash, hash_ip(salt, "203.0.113.9"));
    assert_eq!(click.ip_hash.len(), 64);
    assert_ne!(click.ip_hash, "203.0.113.9");

    let no_ip = platform
        .affiliates()
        .track_click(org_id, &code.code, "https://school.dev", "", "")
        .unwrap();
    assert_eq!(platform.store().affiliate_click(no_ip).unwrap().unwrap().ip_hash, "");
}

#[test]
fn click_on_unknown_code_is_not_found() {
    let (platform, _, installed) = build();
    let err = platform
        .affiliates()
        .track_click(installed.organization.id, "NOPE000000", "/", "", "")
        .unwrap_err();
    assert!(matches!(err, NexoError::NotFound { .. }), "got {err:?}");
}

/// Signing up with a code attributes the new user to the affiliate.
#[test]
fn signup_with_code_attributes_user() {
    let (platform, _, installed) = build();
    let org_id = installed.organization.id;
    let (affiliate, code) = affiliate_with_code(&platform, &installed, "ada");

    let user = learner(&platform, org_id, "lea", Some(&code.code));
    let attribution = platform
        .affiliates()
        .active_attribution(org_id, user.id)
        .unwrap()
        .expect("attribution");

    assert_eq!(attribution.affiliate_id, affiliate.id);
    assert_eq!(attribution.affiliate_code_id, Some(code.id));
    assert!(!attribution.locked);
    assert_eq!(
        attribution.expires_at,
        Some(attribution.attributed_at + Duration::days(30))
    );
}

/// A bad code never blocks signup.
#[test]
fn signup_with_unknown_code_still_succeeds() {
    let (platform, _, installed) = build();
    let org_id = installed.organization.id;
    let user = learner(&platform, org_id, "lea", Some("DOESNOTEXIST"));

    assert!(platform.affiliates().active_attribution(org_id, user.id).unwrap().is_none());
}

/// Last-click: a later code replaces an unlocked attribution.
#[test]
fn last_click_overwrites_unlocked_attribution() {
    let (platform, clock, installed) = build();
    let org_id = installed.organization.id;
    let (_, first_code) = affiliate_with_code(&platform, &installed, "ada");
    let (second, second_code) = affiliate_with_code(&platform, &installed, "bob");
    let user = learner(&platform, org_id, "lea", Some(&first_code.code));

    clock.advance_days(2);
    let attribution = platform
        .affiliates()
        .apply_code_to_user(org_id, user.id, &second_code.code, None)
        .unwrap()
        .unwrap();

    assert_eq!(attribution.affiliate_id, second.id);
    assert_eq!(attribution.attributed_at, clock.now());
}

/// First-click: the first affiliate keeps the user for good. Once the window
/// has passed the row stays, but no longer counts as active.
#[test]
fn first_click_keeps_existing_attribution() {
    let (platform, clock, installed) = build();
    let org_id = installed.organization.id;
    let affiliates = platform.affiliates();
    let current = affiliates.get_or_create_program(org_id).unwrap();
    affiliates
        .update_program(
            admin(&installed),
            org_id,
            &ProgramUpdate {
                enabled: true,
                attribution_window_days: 10,
                attribution_model: AttributionModel::FirstClick,
                subscription_first_cycles: current.subscription_first_cycles,
                subscription_first_rate: current.subscription_first_rate,
                subscription_recurring_rate: current.subscription_recurring_rate,
                one_time_rate: current.one_time_rate,
            },
        )
        .unwrap();

    let (first, first_code) = affiliate_with_code(&platform, &installed, "ada");
    let (second, second_code) = affiliate_with_code(&platform, &installed, "bob");
    let user = learner(&platform, org_id, "lea", Some(&first_code.code));

    clock.advance_days(3);
    let kept = affiliates
        .apply_code_to_user(org_id, user.id, &second_code.code, None)
        .unwrap()
        .unwrap();
    assert_eq!(kept.affiliate_id, first.id);

    clock.advance_days(10);
    let expired = affiliates
        .apply_code_to_user(org_id, user.id, &second_code.code, None)
        .unwrap()
        .unwrap();
    assert_eq!(expired.affiliate_id, first.id);
    assert_ne!(expired.affiliate_id, second.id);
    assert!(affiliates.active_attribution(org_id, user.id).unwrap().is_none());
}

/// Disabled codes do not attribute.
#[test]
fn disabled_code_does_not_attribute() {
    let (platform, _, installed) = build();
    let org_id = installed.organization.id;
    let (_, code) = affiliate_with_code(&platform, &installed, "ada");
    platform
        .affiliates()
        .set_code_status(admin(&installed), org_id, code.id, AffiliateStatus::Disabled)
        .unwrap();
    let user = learner(&platform, org_id, "lea", None);

    let applied = platform
        .affiliates()
        .apply_code_to_user(org_id, user.id, &code.code, None)
        .unwrap();
    assert!(applied.is_none());
}

/// One-time purchase: 30% of 49.99 is 1499.7 cents, rounded to 1500.
#[test]
fn one_time_purchase_records_commission_and_locks() {
    let (platform, _, installed) = build();
    let org_id = installed.organization.id;
    let (affiliate, code) = affiliate_with_code(&platform, &installed, "ada");
    let user = learner(&platform, org_id, "lea", Some(&code.code));
    let course = product(&platform, &installed, ProductType::OneTime, 49.99);

    let outcome = platform
        .payments()
        .handle_payment_event(&PaymentEvent::CheckoutCompleted(event_data(
            org_id, user.id, course.id, "evt_1", None,
        )))
        .unwrap();

    let commission = recorded(outcome.commission);
    assert_eq!(commission.affiliate_id, affiliate.id);
    assert_eq!(commission.amount_cents, 1500);
    assert_eq!(commission.rate_applied, 0.3);
    assert_eq!(commission.cycle_number, 1);
    assert_eq!(commission.currency, "USD");
    assert_eq!(commission.status, CommissionStatus::Pending);

    let attribution = platform.affiliates().active_attribution(org_id, user.id).unwrap().unwrap();
    assert!(attribution.locked);
    assert!(attribution.locked_at.is_some());
    assert_eq!(
        platform.store().events_of_type("attribution_locked").unwrap().len(),
        1
    );
}

/// Provider retries of the same event return the existing row.
#[test]
fn retried_event_is_idempotent() {
    let (platform, _, installed) = build();
    let org_id = installed.organization.id;
    let (_, code) = affiliate_with_code(&platform, &installed, "ada");
    let user = learner(&platform, org_id, "lea", Some(&code.code));
    let course = product(&platform, &installed, ProductType::OneTime, 20.0);
    let event = PaymentEvent::CheckoutCompleted(event_data(org_id, user.id, course.id, "evt_retry", None));

    let first = recorded(platform.payments().handle_payment_event(&event).unwrap().commission);
    let second = platform.payments().handle_payment_event(&event).unwrap();

    match second.commission {
        Some(CommissionOutcome::AlreadyRecorded(row)) => assert_eq!(row.id, first.id),
        other => panic!("expected AlreadyRecorded, got {other:?}"),
    }
    assert_eq!(platform.affiliates().list_commissions(org_id, None).unwrap().len(), 1);
}

/// Subscriptions pay the first rate for the first cycles, then the recurring
/// rate. Locked attributions survive the window and later codes.
#[test]
fn subscription_cycles_switch_to_recurring_rate() {
    let (platform, clock, installed) = build();
    let org_id = installed.organization.id;
    let (affiliate, code) = affiliate_with_code(&platform, &installed, "ada");
    let (_, other_code) = affiliate_with_code(&platform, &installed, "bob");
    let user = learner(&platform, org_id, "lea", Some(&code.code));
    let plan = product(&platform, &installed, ProductType::Subscription, 100.0);
    let payments = platform.payments();

    let first = recorded(
        payments
            .handle_payment_event(&PaymentEvent::CheckoutCompleted(event_data(
                org_id, user.id, plan.id, "evt_c1", Some("sub_1"),
            )))
            .unwrap()
            .commission,
    );
    assert_eq!(first.cycle_number, 1);
    assert_eq!(first.amount_cents, 5000);
    assert_eq!(first.provider_subscription_id.as_deref(), Some("sub_1"));

    let mut last = first;
    for cycle in 2..=7 {
        clock.advance_days(30);
        if cycle == 3 {
            // Locked: a new code must not steal the subscriber.
            let still = platform
                .affiliates()
                .apply_code_to_user(org_id, user.id, &other_code.code, None)
                .unwrap()
                .unwrap();
            assert_eq!(still.affiliate_id, affiliate.id);
        }
        last = recorded(
            payments
                .handle_payment_event(&PaymentEvent::InvoicePaid(event_data(
                    org_id,
                    user.id,
                    plan.id,
                    &format!("evt_c{cycle}"),
                    Some("sub_1"),
                )))
                .unwrap()
                .commission,
        );
        assert_eq!(last.cycle_number, cycle);
        assert_eq!(last.affiliate_id, affiliate.id);
    }

    assert_eq!(last.cycle_number, 7);
    assert_eq!(last.rate_applied, 0.2);
    assert_eq!(last.amount_cents, 2000);
}

/// An expired, never-locked attribution earns nothing.
#[test]
fn expired_attribution_is_skipped() {
    let (platform, clock, installed) = build();
    let org_id = installed.organization.id;
    let (_, code) = affiliate_with_code(&platform, &installed, "ada");
    let user = learner(&platform, org_id, "lea", Some(&code.code));
    let course = product(&platform, &installed, ProductType::OneTime, 10.0);

    clock.advance_days(31);
    let outcome = platform
        .payments()
        .handle_payment_event(&PaymentEvent::CheckoutCompleted(event_data(
            org_id, user.id, course.id, "evt_late", None,
        )))
        .unwrap();

    assert_eq!(
        outcome.commission,
        Some(CommissionOutcome::Skipped(SkipReason::NoActiveAttribution))
    );
}

/// A disabled program stops commissions.
#[test]
fn disabled_program_is_skipped() {
    let (platform, _, installed) = build();
    let org_id = installed.organization.id;
    let (_, code) = affiliate_with_code(&platform, &installed, "ada");
    let user = learner(&platform, org_id, "lea", Some(&code.code));
    let course = product(&platform, &installed, ProductType::OneTime, 10.0);

    let affiliates = platform.affiliates();
    let current = affiliates.get_or_create_program(org_id).unwrap();
    affiliates
        .update_program(
            admin(&installed),
            org_id,
            &ProgramUpdate {
                enabled: false,
                attribution_window_days: current.attribution_window_days,
                attribution_model: current.attribution_model,
                subscription_first_cycles: current.subscription_first_cycles,
                subscription_first_rate: current.subscription_first_rate,
                subscription_recurring_rate: current.subscription_recurring_rate,
                one_time_rate: current.one_time_rate,
            },
        )
        .unwrap();

    let outcome = affiliates
        .record_commission_for_payment(
            org_id,
            platform
                .store()
                .upsert_payment_user(
                    org_id,
                    user.id,
                    course.id,
                    PaymentStatus::Completed,
                    &json!({}),
                    platform.cx().now(),
                )
                .unwrap(),
            "evt_off",
            None,
        )
        .unwrap();
    assert_eq!(outcome, CommissionOutcome::Skipped(SkipReason::ProgramDisabled));
}

#[test]
fn program_rates_are_validated() {
    let (platform, _, installed) = build();
    let err = platform
        .affiliates()
        .update_program(
            admin(&installed),
            installed.organization.id,
            &ProgramUpdate {
                enabled: true,
                attribution_window_days: 30,
                attribution_model: AttributionModel::LastClick,
                subscription_first_cycles: 6,
                subscription_first_rate: 1.5,
                subscription_recurring_rate: 0.2,
                one_time_rate: 0.3,
            },
        )
        .unwrap_err();
    assert!(matches!(err, NexoError::Validation(_)), "got {err:?}");
}

/// Refunds reverse the commission of the refunded charge.
#[test]
fn refund_reverses_commission() {
    let (platform, _, installed) = build();
    let org_id = installed.organization.id;
    let (_, code) = affiliate_with_code(&platform, &installed, "ada");
    let user = learner(&platform, org_id, "lea", Some(&code.code));
    let course = product(&platform, &installed, ProductType::OneTime, 40.0);
    let payments = platform.payments();

    let commission = recorded(
        payments
            .handle_payment_event(&PaymentEvent::CheckoutCompleted(event_data(
                org_id, user.id, course.id, "evt_buy", None,
            )))
            .unwrap()
            .commission,
    );
    let refund = payments
        .handle_payment_event(&PaymentEvent::Refunded {
            event: event_data(org_id, user.id, course.id, "evt_refund", None),
            original_event_id: "evt_buy".into(),
        })
        .unwrap();

    assert_eq!(refund.reversed.len(), 1);
    assert_eq!(refund.reversed[0].id, commission.id);
    assert_eq!(refund.reversed[0].status, CommissionStatus::Reversed);
    assert!(refund.reversed[0].reversed_at.is_some());

    let err = platform.affiliates().reverse_commission(org_id, commission.id).unwrap_err();
    assert!(matches!(err, NexoError::Conflict(_)), "got {err:?}");
}

/// Paying out moves the amount from pending to paid in the stats.
#[test]
fn payout_and_admin_stats() {
    let (platform, _, installed) = build();
    let org_id = installed.organization.id;
    let (affiliate, code) = affiliate_with_code(&platform, &installed, "ada");
    let affiliates = platform.affiliates();
    affiliates.track_click(org_id, &code.code, "/", "", "198.51.100.1").unwrap();
    affiliates.track_click(org_id, &code.code, "/", "", "198.51.100.2").unwrap();
    let lea = learner(&platform, org_id, "lea", Some(&code.code));
    let max = learner(&platform, org_id, "max", Some(&code.code));
    let course = product(&platform, &installed, ProductType::OneTime, 10.0);

    let mut ids = Vec::new();
    for (user, event) in [(&lea, "evt_l"), (&max, "evt_m")] {
        let row = recorded(
            platform
                .payments()
                .handle_payment_event(&PaymentEvent::CheckoutCompleted(event_data(
                    org_id, user.id, course.id, event, None,
                )))
                .unwrap()
                .commission,
        );
        ids.push(row.id);
    }
    let paid = affiliates.mark_commission_paid(admin(&installed), org_id, ids[0]).unwrap();
    assert_eq!(paid.status, CommissionStatus::Paid);

    let err = affiliates
        .mark_commission_paid(admin(&installed), org_id, ids[0])
        .unwrap_err();
    assert!(matches!(err, NexoError::Conflict(_)), "got {err:?}");

    let stats = affiliates.admin_stats(org_id).unwrap();
    let row = stats.iter().find(|s| s.affiliate_id == affiliate.id).unwrap();
    assert_eq!(row.clicks, 2);
    assert_eq!(row.signups, 2);
    assert_eq!(row.pending_amount_cents, 300);
    assert_eq!(row.paid_amount_cents, 300);
    assert_eq!(row.currency, "USD");
}

/// A disabled affiliate's codes stop attributing.
#[test]
fn disabled_affiliate_does_not_attribute() {
    let (platform, _, installed) = build();
    let org_id = installed.organization.id;
    let (affiliate, code) = affiliate_with_code(&platform, &installed, "ada");
    platform
        .affiliates()
        .set_affiliate_status(admin(&installed), org_id, affiliate.id, AffiliateStatus::Disabled)
        .unwrap();
    let user = learner(&platform, org_id, "lea", Some(&code.code));

    assert!(platform.affiliates().active_attribution(org_id, user.id).unwrap().is_none());
}
