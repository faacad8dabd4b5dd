// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Billing Subsystem
//!
//! Boundary conditions across:
//! - Resolver cascade priority (admin > grant > mirror > default)
//! - Cancel-grace window on both sides of the period end
//! - Period boundary math
//! - Out-of-order webhook convergence (absolute-field patches)
//! - Payment-failure escalation
//! - Stripe configuration loading

#[cfg(test)]
mod cascade_tests {
    use crate::catalog::PlanCatalog;
    use crate::entitlement::{
        resolve_local, EntitlementSource, RawEntitlementData, SubscriptionRow,
    };
    use crate::grants::ManualGrant;
    use echodeck_shared::types::{SubscriptionTier, UNLIMITED_DAILY_LIMIT};
    use time::{Duration, OffsetDateTime};
    use uuid::Uuid;

    fn grant(tier: SubscriptionTier, custom_limit: Option<i64>, is_active: bool) -> ManualGrant {
        ManualGrant {
            user_id: Uuid::new_v4(),
            tier,
            custom_daily_limit: custom_limit,
            expires_at: None,
            is_active,
            granted_by: Uuid::new_v4(),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    fn subscription(
        tier: &str,
        status: &str,
        period_end: OffsetDateTime,
        cancel_at_period_end: bool,
    ) -> SubscriptionRow {
        SubscriptionRow {
            user_id: Uuid::new_v4(),
            tier: tier.to_string(),
            external_subscription_id: Some("sub_123".to_string()),
            external_customer_id: Some("cus_123".to_string()),
            external_price_id: None,
            status: status.to_string(),
            current_period_start: Some(period_end - Duration::days(30)),
            current_period_end: Some(period_end),
            cancel_at_period_end,
            failed_payment_count: 0,
            last_payment_failure_at: None,
        }
    }

    #[test]
    fn admin_outranks_conflicting_grant_and_mirror() {
        let now = OffsetDateTime::now_utc();
        let catalog = PlanCatalog::builtin();

        // Cancelled subscription AND a free-tier grant: the admin role must
        // still win with an unlimited entitlement.
        let raw = RawEntitlementData {
            user_id: Uuid::new_v4(),
            email: Some("ops@echodeck.app".to_string()),
            is_admin: true,
            grant: Some(grant(SubscriptionTier::Free, Some(1), true)),
            subscription: Some(subscription(
                "creator",
                "cancelled",
                now - Duration::days(1),
                false,
            )),
        };

        let resolution = resolve_local(&raw, &catalog, now).expect("admin resolves");
        assert!(resolution.is_admin);
        assert_eq!(resolution.daily_limit, UNLIMITED_DAILY_LIMIT);
        assert_eq!(resolution.source, EntitlementSource::AdminRole);
    }

    #[test]
    fn grant_outranks_cancelled_mirror() {
        let now = OffsetDateTime::now_utc();
        let catalog = PlanCatalog::builtin();

        let raw = RawEntitlementData {
            user_id: Uuid::new_v4(),
            email: None,
            is_admin: false,
            grant: Some(grant(SubscriptionTier::Agency, None, true)),
            subscription: Some(subscription(
                "starter",
                "cancelled",
                now - Duration::days(3),
                false,
            )),
        };

        let resolution = resolve_local(&raw, &catalog, now).expect("grant resolves");
        assert_eq!(resolution.plan.tier, SubscriptionTier::Agency);
        assert_eq!(resolution.source, EntitlementSource::ManualGrant);
    }

    #[test]
    fn grant_custom_limit_overrides_plan_limit() {
        let now = OffsetDateTime::now_utc();
        let catalog = PlanCatalog::builtin();

        let raw = RawEntitlementData {
            user_id: Uuid::new_v4(),
            email: None,
            is_admin: false,
            grant: Some(grant(SubscriptionTier::Starter, Some(500), true)),
            subscription: None,
        };

        let resolution = resolve_local(&raw, &catalog, now).expect("grant resolves");
        assert_eq!(resolution.plan.tier, SubscriptionTier::Starter);
        assert_eq!(resolution.daily_limit, 500);
    }

    #[test]
    fn expired_grant_falls_through_to_mirror() {
        let now = OffsetDateTime::now_utc();
        let catalog = PlanCatalog::builtin();

        let mut expired = grant(SubscriptionTier::Agency, None, true);
        expired.expires_at = Some(now - Duration::days(1));

        let raw = RawEntitlementData {
            user_id: Uuid::new_v4(),
            email: None,
            is_admin: false,
            grant: Some(expired),
            subscription: Some(subscription(
                "creator",
                "active",
                now + Duration::days(10),
                false,
            )),
        };

        let resolution = resolve_local(&raw, &catalog, now).expect("mirror resolves");
        assert_eq!(resolution.plan.tier, SubscriptionTier::Creator);
        assert_eq!(resolution.source, EntitlementSource::SubscriptionMirror);
    }

    #[test]
    fn revoked_grant_is_ignored() {
        let now = OffsetDateTime::now_utc();
        let catalog = PlanCatalog::builtin();

        let raw = RawEntitlementData {
            user_id: Uuid::new_v4(),
            email: None,
            is_admin: false,
            grant: Some(grant(SubscriptionTier::Agency, None, false)),
            subscription: None,
        };

        assert!(resolve_local(&raw, &catalog, now).is_none());
    }

    #[test]
    fn cancelled_but_unexpired_subscription_keeps_paid_plan() {
        let now = OffsetDateTime::now_utc();
        let catalog = PlanCatalog::builtin();

        let raw = RawEntitlementData {
            user_id: Uuid::new_v4(),
            email: None,
            is_admin: false,
            grant: None,
            subscription: Some(subscription(
                "creator",
                "active",
                now + Duration::days(3),
                true,
            )),
        };

        let resolution = resolve_local(&raw, &catalog, now).expect("grace window resolves");
        assert_eq!(resolution.plan.tier, SubscriptionTier::Creator);
        assert!(resolution.cancel_at_period_end);
    }

    #[test]
    fn cancelled_subscription_past_period_end_resolves_to_nothing() {
        let now = OffsetDateTime::now_utc();
        let catalog = PlanCatalog::builtin();

        let raw = RawEntitlementData {
            user_id: Uuid::new_v4(),
            email: None,
            is_admin: false,
            grant: None,
            subscription: Some(subscription(
                "creator",
                "active",
                now - Duration::days(1),
                true,
            )),
        };

        // Past the period end the mirror is unusable; the service then
        // falls through to the live query / free default.
        assert!(resolve_local(&raw, &catalog, now).is_none());
    }

    #[test]
    fn past_due_subscription_is_suspended() {
        let now = OffsetDateTime::now_utc();
        let catalog = PlanCatalog::builtin();

        let raw = RawEntitlementData {
            user_id: Uuid::new_v4(),
            email: None,
            is_admin: false,
            grant: None,
            subscription: Some(subscription(
                "creator",
                "past_due",
                now + Duration::days(10),
                false,
            )),
        };

        assert!(resolve_local(&raw, &catalog, now).is_none());
    }

    #[test]
    fn mirror_passes_failure_count_through_for_banners() {
        let now = OffsetDateTime::now_utc();
        let catalog = PlanCatalog::builtin();

        let mut sub = subscription("creator", "active", now + Duration::days(10), false);
        sub.failed_payment_count = 2;

        let raw = RawEntitlementData {
            user_id: Uuid::new_v4(),
            email: None,
            is_admin: false,
            grant: None,
            subscription: Some(sub),
        };

        let resolution = resolve_local(&raw, &catalog, now).expect("mirror resolves");
        assert_eq!(resolution.failed_payment_count, 2);
    }

    #[test]
    fn mirror_resolves_plan_by_price_id_before_tier() {
        let now = OffsetDateTime::now_utc();

        let mut agency = crate::catalog::PlanDefinition::agency();
        agency
            .external_price_ids
            .insert("usd".to_string(), "price_agency_usd".to_string());
        let catalog = PlanCatalog::new(vec![
            crate::catalog::PlanDefinition::free(),
            crate::catalog::PlanDefinition::starter(),
            crate::catalog::PlanDefinition::creator(),
            agency,
        ]);

        // The tier column lags behind what the provider actually charges.
        let mut sub = subscription("starter", "active", now + Duration::days(10), false);
        sub.external_price_id = Some("price_agency_usd".to_string());

        let raw = RawEntitlementData {
            user_id: Uuid::new_v4(),
            email: None,
            is_admin: false,
            grant: None,
            subscription: Some(sub),
        };

        let resolution = resolve_local(&raw, &catalog, now).expect("mirror resolves");
        assert_eq!(resolution.plan.tier, SubscriptionTier::Agency);
    }
}

#[cfg(test)]
mod period_boundary_tests {
    use crate::usage::period_start;
    use echodeck_shared::types::LimitPeriod;
    use time::macros::date;

    #[test]
    fn weekly_window_over_year_boundary() {
        // 2026-01-01 is a Thursday; the window starts Monday 2025-12-29.
        assert_eq!(
            period_start(LimitPeriod::Weekly, date!(2026 - 01 - 01)),
            date!(2025 - 12 - 29)
        );
    }

    #[test]
    fn monthly_window_on_the_last_day_of_february() {
        assert_eq!(
            period_start(LimitPeriod::Monthly, date!(2024 - 02 - 29)),
            date!(2024 - 02 - 01)
        );
    }

    #[test]
    fn saturday_belongs_to_the_current_week() {
        // 2025-06-21 is a Saturday; Monday 2025-06-16 starts its window.
        assert_eq!(
            period_start(LimitPeriod::Weekly, date!(2025 - 06 - 21)),
            date!(2025 - 06 - 16)
        );
    }
}

#[cfg(test)]
mod convergence_tests {
    use crate::webhooks::SubscriptionPatch;
    use echodeck_shared::types::SubscriptionTier;
    use time::{Duration, OffsetDateTime};

    fn patch(status: &'static str, cancel: bool, end: OffsetDateTime) -> SubscriptionPatch {
        SubscriptionPatch {
            tier: SubscriptionTier::Creator,
            external_subscription_id: "sub_123".to_string(),
            external_price_id: Some("price_creator".to_string()),
            status,
            current_period_start: Some(end - Duration::days(30)),
            current_period_end: Some(end),
            cancel_at_period_end: cancel,
        }
    }

    /// Every mirror field a patch carries is an absolute value, so applying
    /// two updates in either order leaves exactly the last-applied payload.
    #[test]
    fn last_applied_patch_wins_in_any_order() {
        let now = OffsetDateTime::now_utc();
        let first = patch("active", false, now + Duration::days(30));
        let second = patch("past_due", true, now + Duration::days(14));

        let apply = |_state: Option<SubscriptionPatch>, p: &SubscriptionPatch| Some(p.clone());

        let forward = apply(apply(None, &first), &second);
        let backward = apply(apply(None, &second), &first);

        assert_eq!(forward, Some(second));
        assert_eq!(backward, Some(first));
    }
}

#[cfg(test)]
mod escalation_tests {
    use crate::notify::PaymentFailureSeverity;

    #[test]
    fn three_consecutive_failures_escalate_once_per_event() {
        let sequence: Vec<PaymentFailureSeverity> = (1..=3)
            .map(PaymentFailureSeverity::for_count)
            .collect();

        assert_eq!(
            sequence,
            vec![
                PaymentFailureSeverity::Warning,
                PaymentFailureSeverity::Warning,
                PaymentFailureSeverity::FinalWarning,
            ]
        );
    }
}

#[cfg(test)]
mod config_tests {
    use crate::client::StripeConfig;
    use crate::error::BillingError;
    use serial_test::serial;

    #[test]
    #[serial]
    fn missing_secret_is_a_config_error() {
        std::env::remove_var("STRIPE_SECRET_KEY");
        std::env::remove_var("STRIPE_WEBHOOK_SECRET");

        let result = StripeConfig::from_env();
        assert!(matches!(result, Err(BillingError::Config(_))));
    }

    #[test]
    #[serial]
    fn complete_env_loads() {
        std::env::set_var("STRIPE_SECRET_KEY", "sk_test_123");
        std::env::set_var("STRIPE_WEBHOOK_SECRET", "whsec_test_123");

        let config = StripeConfig::from_env().expect("config loads");
        assert_eq!(config.webhook_secret, "whsec_test_123");

        std::env::remove_var("STRIPE_SECRET_KEY");
        std::env::remove_var("STRIPE_WEBHOOK_SECRET");
    }
}
